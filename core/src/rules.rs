//! Rule Store: three disjoint origins (persisted settings, session,
//! CLI overrides) combined by the Permission Engine's precedence order.

use std::path::PathBuf;

use crate::canonical::canonicalize_path_like;
use crate::canonical::canonicalize_tool;
use crate::canonical::is_file_tool;
use crate::canonical::is_shell_tool;
use crate::pattern::parse_pattern;

/// Rules loaded from the global/project settings files. File I/O that
/// produces these strings is a collaborator concern; this type only holds
/// the already-parsed rule-string lists.
#[derive(Debug, Clone, Default)]
pub struct PersistedRules {
    pub allow: Vec<String>,
    pub deny: Vec<String>,
    pub ask: Vec<String>,
    pub additional_directories: Vec<PathBuf>,
}

/// In-memory rules added during the runtime's lifetime; cleared on restart.
#[derive(Debug, Clone, Default)]
pub struct SessionRules {
    allow: Vec<String>,
}

impl SessionRules {
    pub fn add_allow(&mut self, rule: &str) {
        let normalized = normalize_rule(rule);
        if !self.allow.iter().any(|r| r == &normalized) {
            self.allow.push(normalized);
        }
    }

    pub fn allow(&self) -> &[String] {
        &self.allow
    }

    pub fn clear(&mut self) {
        self.allow.clear();
    }
}

/// `--allowedTools` / `--disallowedTools` CLI overrides. Bare tool names are
/// normalized at construction time: `Bash` -> `Bash(:*)`; file tools ->
/// `Tool(**)`.
#[derive(Debug, Clone, Default)]
pub struct CliRuleOverrides {
    pub allowed: Vec<String>,
    pub disallowed: Vec<String>,
}

impl CliRuleOverrides {
    pub fn from_raw(allowed: &[String], disallowed: &[String]) -> Self {
        Self {
            allowed: allowed.iter().map(|r| normalize_cli_rule(r)).collect(),
            disallowed: disallowed.iter().map(|r| normalize_cli_rule(r)).collect(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RuleStore {
    pub persisted: PersistedRules,
    pub session: SessionRules,
    pub cli: CliRuleOverrides,
}

impl RuleStore {
    pub fn with_persisted(persisted: PersistedRules) -> Self {
        Self {
            persisted,
            session: SessionRules::default(),
            cli: CliRuleOverrides::default(),
        }
    }
}

/// Normalize a bare CLI tool name (no payload) into its canonical-but-broad
/// pattern form; leave already-parenthesized rules alone (still run through
/// `normalize_rule` for tool canonicalization/path normalization).
fn normalize_cli_rule(raw: &str) -> String {
    let parsed = parse_pattern(raw);
    if parsed.payload.is_some() || parsed.tool == "*" {
        return normalize_rule(raw);
    }
    let canonical = canonicalize_tool(&parsed.tool);
    if is_shell_tool(&canonical) {
        normalize_rule(&format!("{canonical}(:*)"))
    } else if is_file_tool(&canonical) {
        normalize_rule(&format!("{canonical}(**)"))
    } else {
        normalize_rule(&canonical)
    }
}

/// Canonicalize the tool name and, for file-tool / bash rules, the payload.
/// A fixed point: `normalize_rule(normalize_rule(x)) == normalize_rule(x)`.
pub fn normalize_rule(raw: &str) -> String {
    let parsed = parse_pattern(raw);
    if parsed.tool == "*" {
        return "*".to_string();
    }
    let canonical = canonicalize_tool(&parsed.tool);

    match &parsed.payload {
        None => canonical,
        Some(payload) => {
            let normalized_payload = if is_file_tool(&canonical) {
                canonicalize_path_like(payload)
            } else {
                payload.clone()
            };
            format!("{canonical}({normalized_payload})")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_rule_is_a_fixed_point() {
        for rule in ["Read(src/**)", "Bash(git diff:*)", "*", "Task", "read_file(**)"] {
            let once = normalize_rule(rule);
            let twice = normalize_rule(&once);
            assert_eq!(once, twice, "not a fixed point for {rule}");
        }
    }

    #[test]
    fn cli_bare_tool_normalization() {
        let overrides = CliRuleOverrides::from_raw(&["Bash".to_string(), "Read".to_string()], &[]);
        assert_eq!(overrides.allowed[0], "Bash(:*)");
        assert_eq!(overrides.allowed[1], "Read(**)");
    }

    #[test]
    fn session_allow_dedupes_by_normalized_form() {
        let mut rules = SessionRules::default();
        rules.add_allow("Read(src/**)");
        rules.add_allow("read_file(src/**)");
        assert_eq!(rules.allow().len(), 1);
    }
}
