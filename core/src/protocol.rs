//! Protocol Codec: typed inbound/outbound WebSocket frames. The encoder
//! is the single chokepoint that stamps `event_seq` and `session_id` onto
//! every outbound event except `ping`, preserving the strict-monotonic
//! invariant the rest of the runtime relies on.

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

/// Frames the controller sends us.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundFrame {
    Pong,
    Status {
        #[serde(rename = "currentMode")]
        current_mode: String,
        #[serde(rename = "lastStopReason")]
        last_stop_reason: Option<String>,
        #[serde(rename = "isProcessing")]
        is_processing: bool,
    },
    Message {
        #[serde(rename = "agentId")]
        agent_id: String,
        #[serde(rename = "conversationId")]
        conversation_id: Option<String>,
        messages: Vec<Value>,
        #[serde(rename = "supportsControlResponse")]
        supports_control_response: Option<bool>,
    },
    ModeChange {
        mode: String,
    },
    GetStatus {},
    GetState {},
    RecoverPendingApprovals {
        #[serde(rename = "agentId")]
        agent_id: String,
        #[serde(rename = "conversationId")]
        conversation_id: Option<String>,
    },
    ControlResponse {
        response: ControlResponsePayload,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "subtype", rename_all = "snake_case")]
pub enum ControlResponsePayload {
    Success {
        request_id: String,
        response: Option<Value>,
    },
    Error {
        request_id: String,
        error: Option<String>,
    },
}

impl ControlResponsePayload {
    pub fn request_id(&self) -> &str {
        match self {
            ControlResponsePayload::Success { request_id, .. } => request_id,
            ControlResponsePayload::Error { request_id, .. } => request_id,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ActiveRun {
    pub run_id: Option<String>,
    pub agent_id: Option<String>,
    pub conversation_id: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PendingControlRequest {
    pub request_id: String,
    pub request: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueSnapshotItem {
    pub id: u64,
    pub kind: String,
    pub source: String,
    pub content: String,
    pub enqueued_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueSnapshot {
    pub queue_len: usize,
    pub pending_turns: u32,
    pub items: Vec<QueueSnapshotItem>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ActiveRunSnapshot {
    pub run_id: Option<String>,
    pub agent_id: Option<String>,
    pub conversation_id: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
}

/// Frames we send to the controller. Every arm except `Ping` is stamped
/// with `session_id`/`event_seq` by `encode` before serialization.
#[derive(Debug, Clone)]
pub enum OutboundEvent {
    Ping,
    Result { success: bool, stop_reason: Option<String> },
    RunStarted { run_id: String },
    ModeChanged { mode: String, success: bool, error: Option<String> },
    StatusResponse { current_mode: String, last_stop_reason: Option<String>, is_processing: bool },
    StateResponse {
        snapshot_id: String,
        state_seq: u64,
        mode: String,
        is_processing: bool,
        last_stop_reason: Option<String>,
        control_response_capable: bool,
        active_run: ActiveRunSnapshot,
        pending_control_requests: Vec<PendingControlRequest>,
        queue: QueueSnapshot,
    },
    Message { payload: Value },
    AutoApproval { tool_name: String, tool_call_id: String, arguments: Value, reason: String, matched_rule: Option<String> },
    Error { message: String, stop_reason: Option<String>, run_id: Option<String> },
    Retry { reason: String, attempt: u32, max_attempts: u32, delay_ms: u64 },
    Recovery { recovery_type: String, message: String },
    TurnResult {
        subtype: String,
        agent_id: String,
        conversation_id: String,
        duration_ms: u64,
        duration_api_ms: u64,
        num_turns: u32,
        result: Option<Value>,
        run_ids: Vec<String>,
        usage: Option<Value>,
        stop_reason: Option<String>,
    },
    QueueEnqueued { item: Value },
    QueueBatchDequeued { batch: Value },
    QueueBlocked { reason: String },
    QueueCleared { reason: String },
    QueueDropped { item: Value, reason: String },
    ControlRequest { request_id: String, tool_name: String, input: Value, tool_call_id: String, permission_suggestions: Vec<String>, blocked_path: Option<String>, diffs: Option<Value> },
}

/// Stamps `session_id` and the next `event_seq` onto an outbound event
/// (except `Ping`) and serializes it to a JSON value ready to send.
pub fn encode(event: &OutboundEvent, session_id: &str, event_seq: u64) -> Value {
    let mut value = to_json_value(event);
    if !matches!(event, OutboundEvent::Ping) {
        if let Value::Object(map) = &mut value {
            map.insert("session_id".to_string(), Value::String(session_id.to_string()));
            map.insert("event_seq".to_string(), Value::Number(event_seq.into()));
        }
    }
    value
}

fn to_json_value(event: &OutboundEvent) -> Value {
    match event {
        OutboundEvent::Ping => serde_json::json!({ "type": "ping" }),
        OutboundEvent::Result { success, stop_reason } => {
            serde_json::json!({ "type": "result", "success": success, "stopReason": stop_reason })
        }
        OutboundEvent::RunStarted { run_id } => {
            serde_json::json!({ "type": "run_started", "runId": run_id })
        }
        OutboundEvent::ModeChanged { mode, success, error } => {
            serde_json::json!({ "type": "mode_changed", "mode": mode, "success": success, "error": error })
        }
        OutboundEvent::StatusResponse { current_mode, last_stop_reason, is_processing } => {
            serde_json::json!({
                "type": "status_response",
                "currentMode": current_mode,
                "lastStopReason": last_stop_reason,
                "isProcessing": is_processing,
            })
        }
        OutboundEvent::StateResponse {
            snapshot_id,
            state_seq,
            mode,
            is_processing,
            last_stop_reason,
            control_response_capable,
            active_run,
            pending_control_requests,
            queue,
        } => serde_json::json!({
            "type": "state_response",
            "schema_version": 1,
            "snapshot_id": snapshot_id,
            "state_seq": state_seq,
            "mode": mode,
            "is_processing": is_processing,
            "last_stop_reason": last_stop_reason,
            "control_response_capable": control_response_capable,
            "active_run": active_run,
            "pending_control_requests": pending_control_requests,
            "queue": queue,
        }),
        OutboundEvent::Message { payload } => {
            let mut value = payload.clone();
            if let Value::Object(map) = &mut value {
                map.insert("type".to_string(), Value::String("message".to_string()));
                map.insert("uuid".to_string(), Value::String(uuid::Uuid::new_v4().to_string()));
            }
            value
        }
        OutboundEvent::AutoApproval { tool_name, tool_call_id, arguments, reason, matched_rule } => {
            serde_json::json!({
                "type": "auto_approval",
                "tool_call": { "name": tool_name, "tool_call_id": tool_call_id, "arguments": arguments },
                "reason": reason,
                "matched_rule": matched_rule,
            })
        }
        OutboundEvent::Error { message, stop_reason, run_id } => {
            serde_json::json!({ "type": "error", "message": message, "stop_reason": stop_reason, "run_id": run_id })
        }
        OutboundEvent::Retry { reason, attempt, max_attempts, delay_ms } => {
            serde_json::json!({ "type": "retry", "reason": reason, "attempt": attempt, "max_attempts": max_attempts, "delay_ms": delay_ms })
        }
        OutboundEvent::Recovery { recovery_type, message } => {
            serde_json::json!({ "type": "recovery", "recovery_type": recovery_type, "message": message })
        }
        OutboundEvent::TurnResult {
            subtype,
            agent_id,
            conversation_id,
            duration_ms,
            duration_api_ms,
            num_turns,
            result,
            run_ids,
            usage,
            stop_reason,
        } => serde_json::json!({
            "type": "result",
            "subtype": subtype,
            "agent_id": agent_id,
            "conversation_id": conversation_id,
            "duration_ms": duration_ms,
            "duration_api_ms": duration_api_ms,
            "num_turns": num_turns,
            "result": result,
            "run_ids": run_ids,
            "usage": usage,
            "stop_reason": stop_reason,
        }),
        OutboundEvent::QueueEnqueued { item } => {
            serde_json::json!({ "type": "queue_item_enqueued", "item": item })
        }
        OutboundEvent::QueueBatchDequeued { batch } => {
            serde_json::json!({ "type": "queue_batch_dequeued", "batch": batch })
        }
        OutboundEvent::QueueBlocked { reason } => {
            serde_json::json!({ "type": "queue_blocked", "reason": reason })
        }
        OutboundEvent::QueueCleared { reason } => {
            serde_json::json!({ "type": "queue_cleared", "reason": reason })
        }
        OutboundEvent::QueueDropped { item, reason } => {
            serde_json::json!({ "type": "queue_dropped", "item": item, "reason": reason })
        }
        OutboundEvent::ControlRequest {
            request_id,
            tool_name,
            input,
            tool_call_id,
            permission_suggestions,
            blocked_path,
            diffs,
        } => serde_json::json!({
            "type": "control_request",
            "request_id": request_id,
            "request": {
                "subtype": "can_use_tool",
                "tool_name": tool_name,
                "input": input,
                "tool_call_id": tool_call_id,
                "permission_suggestions": permission_suggestions,
                "blocked_path": blocked_path,
                "diffs": diffs,
            },
        }),
    }
}

/// `request_id` convention for permission control requests.
pub fn permission_request_id(tool_call_id: &str) -> String {
    format!("perm-{tool_call_id}")
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn ping_is_not_stamped() {
        let value = encode(&OutboundEvent::Ping, "sess-1", 5);
        assert_eq!(value["type"], "ping");
        assert!(value.get("session_id").is_none());
        assert!(value.get("event_seq").is_none());
    }

    #[test]
    fn non_ping_events_carry_session_and_seq() {
        let event = OutboundEvent::RunStarted { run_id: "r1".to_string() };
        let value = encode(&event, "sess-1", 7);
        assert_eq!(value["session_id"], "sess-1");
        assert_eq!(value["event_seq"], 7);
        assert_eq!(value["runId"], "r1");
    }

    #[test]
    fn message_passthrough_gets_type_and_uuid() {
        let event = OutboundEvent::Message { payload: serde_json::json!({ "role": "assistant" }) };
        let value = encode(&event, "sess-1", 1);
        assert_eq!(value["type"], "message");
        assert_eq!(value["role"], "assistant");
        assert!(value["uuid"].as_str().is_some());
    }

    #[test]
    fn permission_request_id_uses_perm_prefix() {
        assert_eq!(permission_request_id("abc"), "perm-abc");
    }

    #[test]
    fn inbound_message_frame_parses() {
        let json = serde_json::json!({
            "type": "message",
            "agentId": "agent-1",
            "conversationId": null,
            "messages": [],
            "supportsControlResponse": true,
        });
        let frame: InboundFrame = serde_json::from_value(json).unwrap();
        match frame {
            InboundFrame::Message { agent_id, supports_control_response, .. } => {
                assert_eq!(agent_id, "agent-1");
                assert_eq!(supports_control_response, Some(true));
            }
            _ => panic!("expected Message"),
        }
    }

    #[test]
    fn inbound_control_response_parses_success_and_error() {
        let success = serde_json::json!({
            "subtype": "success",
            "request_id": "perm-1",
            "response": { "allow": true },
        });
        let parsed: ControlResponsePayload = serde_json::from_value(success).unwrap();
        assert_eq!(parsed.request_id(), "perm-1");

        let error = serde_json::json!({
            "subtype": "error",
            "request_id": "perm-2",
            "error": "denied",
        });
        let parsed_error: ControlResponsePayload = serde_json::from_value(error).unwrap();
        assert_eq!(parsed_error.request_id(), "perm-2");
    }
}
