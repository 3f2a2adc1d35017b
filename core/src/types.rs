//! Shared data-model types referenced by multiple permission components.

use std::collections::HashMap;

use serde_json::Value;

/// `(canonical_tool_name, args_map)`.
#[derive(Debug, Clone)]
pub struct ToolQuery {
    pub tool: String,
    pub args: HashMap<String, Value>,
}

impl ToolQuery {
    pub fn new(tool: impl Into<String>, args: HashMap<String, Value>) -> Self {
        Self {
            tool: tool.into(),
            args,
        }
    }

    pub fn str_arg(&self, key: &str) -> Option<&str> {
        self.args.get(key).and_then(Value::as_str)
    }

    /// `command` may be a JSON string or an array of strings; both are
    /// joined into one string for bash pattern matching and shell analysis.
    pub fn command_string(&self) -> Option<String> {
        match self.args.get("command")? {
            Value::String(s) => Some(s.clone()),
            Value::Array(items) => Some(
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .collect::<Vec<_>>()
                    .join(" "),
            ),
            _ => None,
        }
    }

    pub fn command_argv(&self) -> Option<Vec<String>> {
        match self.args.get("command")? {
            Value::String(s) => shlex::split(s),
            Value::Array(items) => Some(items.iter().filter_map(Value::as_str).map(String::from).collect()),
            _ => None,
        }
    }
}

/// A fully resolved path-bearing query rendered as a `Tool(payload)` string,
/// as consumed by the Pattern Matcher.
pub fn tool_query_pattern(query: &ToolQuery, path_arg_keys: &[&str]) -> String {
    for key in path_arg_keys {
        if let Some(path) = query.str_arg(key) {
            return format!("{}({})", query.tool, path);
        }
    }
    query.tool.clone()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Ask,
    Deny,
}

/// Ordered stage events recorded while walking the Permission Engine's
/// decision pipeline, for `LETTA_PERMISSION_TRACE[_ALL]` debug logging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceEvent {
    DenyRule(String),
    CliDisallow(String),
    ModeOverride(String),
    CliAllow(String),
    SkillAutoAllow,
    ReadonlyShellAutoAllow,
    MemoryDirAutoAllow,
    WorkingDirectoryAutoAllow,
    SessionAllow(String),
    AllowRule(String),
    AskRule(String),
    DefaultDecision,
}

#[derive(Debug, Clone)]
pub struct PermissionResult {
    pub decision: Decision,
    pub matched_rule: Option<String>,
    pub reason: Option<String>,
    pub trace: Vec<TraceEvent>,
}

impl PermissionResult {
    pub fn allow(matched_rule: Option<String>, trace: Vec<TraceEvent>) -> Self {
        Self {
            decision: Decision::Allow,
            matched_rule,
            reason: None,
            trace,
        }
    }

    pub fn deny(reason: String, matched_rule: Option<String>, trace: Vec<TraceEvent>) -> Self {
        Self {
            decision: Decision::Deny,
            matched_rule,
            reason: Some(reason),
            trace,
        }
    }

    pub fn ask(matched_rule: Option<String>, trace: Vec<TraceEvent>) -> Self {
        Self {
            decision: Decision::Ask,
            matched_rule,
            reason: None,
            trace,
        }
    }
}
