use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ListenerError>;

/// Errors surfaced by the conversation-service collaborator when a turn
/// tries to open or continue a stream, before any chunk has been read.
#[derive(Error, Debug)]
pub enum PreStreamError {
    #[error("stream disconnected before completion: {0}")]
    Transient(String),

    #[error("http status {0}: {1}")]
    HttpStatus(u16, String, Option<Duration>),

    #[error("conversation is already processing a turn")]
    ConversationBusy,

    #[error("conversation has approvals pending resolution")]
    ApprovalsPending,

    #[error("{0}")]
    Fatal(String),
}

impl PreStreamError {
    /// `Retry-After`-style override carried by some transient errors.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            PreStreamError::HttpStatus(_, _, retry_after) => *retry_after,
            _ => None,
        }
    }
}

#[derive(Error, Debug)]
pub enum ListenerError {
    #[error("control request transport error: {0}")]
    ControlTransport(String),

    #[error("websocket closed with code {0}")]
    SocketClosed(u16),

    #[error("websocket error: {0}")]
    Socket(String),

    #[error("pre-stream error exceeded retry budget")]
    RetryBudgetExceeded,

    #[error("listener runtime stopped")]
    RuntimeStopped,

    #[error("environment not found (close code 1008)")]
    EnvironmentNotFound,

    #[error(transparent)]
    PreStream(#[from] PreStreamError),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}
