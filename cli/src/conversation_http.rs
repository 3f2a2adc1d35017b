//! HTTP-backed `ConversationService`: the production adapter to the
//! remote LLM-backed conversation the listener drives turns against.
//! Everything about how the remote side produces turns is a collaborator
//! concern (see `listener_core::conversation`); this module only knows
//! how to open and read a newline-delimited-JSON stream of chunks and
//! surface HTTP failures in the shapes C12 (Recovery) classifies.

use std::time::Duration;

use async_trait::async_trait;
use listener_core::conversation::ConversationService;
use listener_core::conversation::ConversationStream;
use listener_core::conversation::PendingApproval;
use listener_core::conversation::StopReason;
use listener_core::conversation::StreamChunk;
use listener_core::error::ListenerError;
use listener_core::error::PreStreamError;
use listener_core::error::Result;
use listener_core::executor::ResultStatus;
use listener_core::executor::ToolResult;
use reqwest::Client;
use reqwest::Response;
use reqwest::StatusCode;
use serde_json::Value;
use serde_json::json;

pub struct HttpConversationService {
    client: Client,
    base_url: String,
    api_key: String,
}

impl HttpConversationService {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into(),
            api_key: api_key.into(),
        }
    }

    async fn into_stream_or_error(response: reqwest::Result<Response>) -> std::result::Result<Box<dyn ConversationStream>, PreStreamError> {
        let response = response.map_err(|e| PreStreamError::Transient(e.to_string()))?;
        let status = response.status();
        if status.is_success() {
            return Ok(Box::new(NdjsonStream { response, buffer: String::new() }));
        }

        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs);
        let body = response.text().await.unwrap_or_default();

        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            Err(PreStreamError::HttpStatus(status.as_u16(), body, retry_after))
        } else if status == StatusCode::CONFLICT {
            Err(PreStreamError::ConversationBusy)
        } else {
            Err(PreStreamError::HttpStatus(status.as_u16(), body, None))
        }
    }
}

#[async_trait]
impl ConversationService for HttpConversationService {
    async fn open_stream(
        &self,
        agent_id: &str,
        conversation_id: Option<&str>,
        messages: &[Value],
    ) -> std::result::Result<Box<dyn ConversationStream>, PreStreamError> {
        let url = format!("{}/v1/agents/{agent_id}/messages", self.base_url);
        let response = self
            .client
            .post(url)
            .bearer_auth(&self.api_key)
            .json(&json!({ "conversation_id": conversation_id, "messages": messages }))
            .send()
            .await;
        Self::into_stream_or_error(response).await
    }

    async fn submit_tool_results(
        &self,
        agent_id: &str,
        conversation_id: &str,
        results: &[ToolResult],
    ) -> std::result::Result<Box<dyn ConversationStream>, PreStreamError> {
        let url = format!("{}/v1/agents/{agent_id}/conversations/{conversation_id}/tool_results", self.base_url);
        let payload: Vec<Value> = results
            .iter()
            .map(|r| {
                json!({
                    "tool_call_id": r.tool_call_id,
                    "tool_return": r.tool_return,
                    "status": matches!(r.status, ResultStatus::Success),
                })
            })
            .collect();
        let response = self
            .client
            .post(url)
            .bearer_auth(&self.api_key)
            .json(&json!({ "results": payload }))
            .send()
            .await;
        Self::into_stream_or_error(response).await
    }

    async fn pending_approvals(&self, agent_id: &str, conversation_id: Option<&str>) -> Result<Vec<PendingApproval>> {
        let url = format!("{}/v1/agents/{agent_id}/pending_approvals", self.base_url);
        let response = self
            .client
            .get(url)
            .bearer_auth(&self.api_key)
            .query(&[("conversation_id", conversation_id.unwrap_or_default())])
            .send()
            .await
            .map_err(|e| ListenerError::ControlTransport(e.to_string()))?;

        let body: Vec<Value> = response.json().await.map_err(|e| ListenerError::ControlTransport(e.to_string()))?;
        Ok(body
            .into_iter()
            .map(|v| PendingApproval {
                tool_call_id: v.get("tool_call_id").and_then(Value::as_str).unwrap_or_default().to_string(),
                tool_name: v.get("tool_name").and_then(Value::as_str).map(str::to_string),
                tool_args_json: v.get("tool_args_json").and_then(Value::as_str).map(str::to_string),
            })
            .collect())
    }
}

struct NdjsonStream {
    response: Response,
    buffer: String,
}

#[async_trait]
impl ConversationStream for NdjsonStream {
    async fn next_chunk(&mut self) -> Option<StreamChunk> {
        loop {
            if let Some(newline) = self.buffer.find('\n') {
                let line = self.buffer[..newline].trim().to_string();
                self.buffer.drain(..=newline);
                if line.is_empty() {
                    continue;
                }
                return parse_chunk_line(&line);
            }

            match self.response.chunk().await {
                Ok(Some(bytes)) => self.buffer.push_str(&String::from_utf8_lossy(&bytes)),
                Ok(None) => {
                    let remainder = self.buffer.trim().to_string();
                    self.buffer.clear();
                    return if remainder.is_empty() { None } else { parse_chunk_line(&remainder) };
                }
                Err(_) => return None,
            }
        }
    }
}

fn parse_chunk_line(line: &str) -> Option<StreamChunk> {
    let value: Value = serde_json::from_str(line).ok()?;
    let stop_reason = value.get("stop_reason").and_then(Value::as_str).and_then(parse_stop_reason);
    Some(StreamChunk {
        run_id: value.get("run_id").and_then(Value::as_str).map(str::to_string),
        is_error: value.get("is_error").and_then(Value::as_bool).unwrap_or(false),
        stop_reason,
        payload: value,
    })
}

fn parse_stop_reason(raw: &str) -> Option<StopReason> {
    match raw {
        "end_turn" => Some(StopReason::EndTurn),
        "requires_approval" => Some(StopReason::RequiresApproval),
        "error" => Some(StopReason::Error),
        "cancelled" => Some(StopReason::Cancelled),
        _ => None,
    }
}
