//! `RuntimeConfig`: the ambient configuration layer around THE CORE.
//!
//! Reading persisted settings files is a collaborator concern (§1); this
//! module only assembles the pieces `core` itself is responsible for —
//! CLI-parsed rule overrides, the initial permission mode, and the
//! environment variables spec.md §6 enumerates.

use std::path::PathBuf;

use crate::mode::PermissionMode;
use crate::rules::CliRuleOverrides;

/// Parses a comma-separated, parenthesis-aware list of rule strings the way
/// `--allowedTools`/`--disallowedTools` arrive from the CLI: commas inside
/// a `Tool(payload)` parenthesized group do not split the list.
pub fn split_cli_rule_list(raw: &str) -> Vec<String> {
    let mut items = Vec::new();
    let mut current = String::new();
    let mut depth = 0i32;

    for c in raw.chars() {
        match c {
            '(' => {
                depth += 1;
                current.push(c);
            }
            ')' => {
                depth -= 1;
                current.push(c);
            }
            ',' if depth <= 0 => {
                let trimmed = current.trim();
                if !trimmed.is_empty() {
                    items.push(trimmed.to_string());
                }
                current.clear();
            }
            _ => current.push(c),
        }
    }
    let trimmed = current.trim();
    if !trimmed.is_empty() {
        items.push(trimmed.to_string());
    }
    items
}

/// Which permission-engine generation handles a query. v2 (canonicalized
/// matching) is the only engine that ever decides; `DualEval` additionally
/// runs a v1-shaped legacy matcher purely to `tracing::warn!` on mismatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EngineMode {
    #[default]
    V2Only,
    DualEval,
}

/// Environment variables read at process start, named exactly as spec.md
/// §6 enumerates them.
#[derive(Debug, Clone, Default)]
pub struct EnvConfig {
    pub api_key: Option<String>,
    pub engine_mode: EngineMode,
    pub permission_trace: bool,
    pub permission_trace_all: bool,
    pub debug_timings: bool,
    pub enable_lsp: bool,
    pub parent_agent_id: Option<String>,
    /// `LETTA_MEMORY_DIR_APPROVE_ALL`; defaults to `false` (see
    /// DESIGN.md's note on the Open Question spec.md §9 leaves live).
    pub memory_dir_approve_all: bool,
}

impl EnvConfig {
    pub fn from_env() -> Self {
        Self::from_getter(std::env::var)
    }

    /// Testable without mutating the process environment.
    pub fn from_getter(get: impl Fn(&str) -> Result<String, std::env::VarError>) -> Self {
        let flag = |name: &str| get(name).map(|v| v == "1" || v.eq_ignore_ascii_case("true")).unwrap_or(false);
        Self {
            api_key: get("LETTA_API_KEY").ok(),
            engine_mode: if flag("LETTA_PERMISSIONS_DUAL_EVAL") {
                EngineMode::DualEval
            } else {
                EngineMode::V2Only
            },
            permission_trace: flag("LETTA_PERMISSION_TRACE"),
            permission_trace_all: flag("LETTA_PERMISSION_TRACE_ALL"),
            debug_timings: flag("LETTA_DEBUG_TIMINGS"),
            enable_lsp: flag("LETTA_ENABLE_LSP"),
            parent_agent_id: get("LETTA_PARENT_AGENT_ID").ok(),
            memory_dir_approve_all: flag("LETTA_MEMORY_DIR_APPROVE_ALL"),
        }
    }
}

/// Assembled from CLI flags plus `EnvConfig`; the value `core` is
/// constructed with.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub working_dir: PathBuf,
    pub agent_id: Option<String>,
    pub cli_rules: CliRuleOverrides,
    pub initial_mode: PermissionMode,
    pub plan_file_path: Option<PathBuf>,
    pub env: EnvConfig,
}

impl RuntimeConfig {
    pub fn new(working_dir: PathBuf, initial_mode: PermissionMode, env: EnvConfig) -> Self {
        Self {
            working_dir,
            agent_id: None,
            cli_rules: CliRuleOverrides::default(),
            initial_mode,
            plan_file_path: None,
            env,
        }
    }

    pub fn with_cli_tools(mut self, allowed: &str, disallowed: &str) -> Self {
        self.cli_rules = CliRuleOverrides::from_raw(
            &split_cli_rule_list(allowed),
            &split_cli_rule_list(disallowed),
        );
        self
    }

    pub fn with_agent_id(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    pub fn with_plan_file_path(mut self, path: PathBuf) -> Self {
        self.plan_file_path = Some(path);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_cli_rule_list_respects_parens() {
        let items = split_cli_rule_list("Bash(git diff:*),Read(**),Write");
        assert_eq!(items, vec!["Bash(git diff:*)", "Read(**)", "Write"]);
    }

    #[test]
    fn split_cli_rule_list_ignores_blank_entries() {
        let items = split_cli_rule_list("Read(**), , Write");
        assert_eq!(items, vec!["Read(**)", "Write"]);
    }

    #[test]
    fn env_config_reads_boolean_flags() {
        let env = EnvConfig::from_getter(|name| match name {
            "LETTA_PERMISSION_TRACE" => Ok("1".to_string()),
            "LETTA_PERMISSIONS_DUAL_EVAL" => Ok("true".to_string()),
            _ => Err(std::env::VarError::NotPresent),
        });
        assert!(env.permission_trace);
        assert!(!env.permission_trace_all);
        assert_eq!(env.engine_mode, EngineMode::DualEval);
    }
}
