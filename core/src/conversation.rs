//! External collaborators: the remote LLM conversation service and the
//! cloud control channel are explicitly out of scope for this crate, so
//! the runtime only depends on these traits. Production wiring backs
//! `ControlChannel` with a `tokio-tungstenite` WebSocket; tests back both
//! with in-process fakes.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::PreStreamError;
use crate::error::Result;

/// One chunk of a streamed conversation turn.
#[derive(Debug, Clone)]
pub struct StreamChunk {
    pub run_id: Option<String>,
    pub payload: Value,
    pub is_error: bool,
    pub stop_reason: Option<StopReason>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    EndTurn,
    RequiresApproval,
    Error,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct PendingApproval {
    pub tool_call_id: String,
    pub tool_name: Option<String>,
    pub tool_args_json: Option<String>,
}

/// The remote LLM-backed conversation service. Everything about how it
/// produces turns, retries internally, or authenticates is a collaborator
/// concern; this runtime only needs to open a stream, drain it, and feed
/// tool results back in.
#[async_trait]
pub trait ConversationService: Send + Sync {
    async fn open_stream(
        &self,
        agent_id: &str,
        conversation_id: Option<&str>,
        messages: &[Value],
    ) -> std::result::Result<Box<dyn ConversationStream>, PreStreamError>;

    async fn submit_tool_results(
        &self,
        agent_id: &str,
        conversation_id: &str,
        results: &[crate::executor::ToolResult],
    ) -> std::result::Result<Box<dyn ConversationStream>, PreStreamError>;

    async fn pending_approvals(
        &self,
        agent_id: &str,
        conversation_id: Option<&str>,
    ) -> Result<Vec<PendingApproval>>;
}

#[async_trait]
pub trait ConversationStream: Send {
    /// `None` once the stream is exhausted.
    async fn next_chunk(&mut self) -> Option<StreamChunk>;
}

/// The cloud control channel: the WebSocket the listener speaks frames
/// over. Connection lifecycle (retry, backoff, reconnect) is the
/// Listener Runtime's job; this trait only models send/receive.
///
/// All methods take `&self` (not `&mut self`) so a single channel can be
/// shared via `Arc` across the frame-reading loop, the heartbeat task and
/// concurrently-running turn tasks; implementations that wrap a split
/// sink/stream (e.g. `tokio-tungstenite`) hold them behind internal
/// `tokio::sync::Mutex`es. In practice only the frame-reading loop calls
/// `recv`.
#[async_trait]
pub trait ControlChannel: Send + Sync {
    async fn send(&self, frame: Value) -> Result<()>;

    /// `None` on normal close.
    async fn recv(&self) -> Option<std::result::Result<Value, String>>;

    async fn close(&self);
}
