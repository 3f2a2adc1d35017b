//! Approval Executor: carries out a batch of already-decided tool calls,
//! preserving input order, and shapes the results the turn loop streams
//! back to the conversation service.

use async_trait::async_trait;
use serde_json::Value;

#[derive(Debug, Clone)]
pub struct Approval {
    pub tool_call_id: String,
    pub tool_name: String,
    pub args: Value,
}

#[derive(Debug, Clone)]
pub enum ExecutorDecision {
    Approve(Approval),
    Deny { approval: Approval, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResultStatus {
    Success,
    Error,
}

#[derive(Debug, Clone)]
pub struct ToolResult {
    pub tool_call_id: String,
    pub tool_return: Value,
    pub status: ResultStatus,
}

/// The thing that actually runs an approved tool. Kept as a trait so the
/// executor stays testable without a real tool-execution backend.
#[async_trait]
pub trait ToolRunner: Send + Sync {
    async fn run(&self, tool_name: &str, args: &Value) -> Result<Value, String>;
}

pub async fn execute_approval_batch(
    decisions: Vec<ExecutorDecision>,
    runner: &dyn ToolRunner,
) -> Vec<ToolResult> {
    let mut results = Vec::with_capacity(decisions.len());

    for decision in decisions {
        let result = match decision {
            ExecutorDecision::Approve(approval) => {
                match runner.run(&approval.tool_name, &approval.args).await {
                    Ok(tool_return) => ToolResult {
                        tool_call_id: approval.tool_call_id,
                        tool_return,
                        status: ResultStatus::Success,
                    },
                    Err(message) => ToolResult {
                        tool_call_id: approval.tool_call_id,
                        tool_return: Value::String(message),
                        status: ResultStatus::Error,
                    },
                }
            }
            ExecutorDecision::Deny { approval, reason } => ToolResult {
                tool_call_id: approval.tool_call_id,
                tool_return: Value::String(reason),
                status: ResultStatus::Error,
            },
        };
        results.push(result);
    }

    results
}
