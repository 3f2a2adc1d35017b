//! Permission Engine: the layered decision pipeline that composes the
//! Canonicalizer, Pattern Matcher, Read-only Shell Analyzer, Mode
//! Controller and Rule Store into a single `{allow, ask, deny}` verdict.

use std::path::Path;

use crate::canonical::canonicalize_tool;
use crate::canonical::is_shell_tool;
use crate::mode::ModeController;
use crate::pattern::match_bash;
use crate::pattern::match_file;
use crate::pattern::match_tool;
use crate::rules::RuleStore;
use crate::shell_safety::MemoryDirOptions;
use crate::shell_safety::ShellAnalyzerOptions;
use crate::shell_safety::ShellInput;
use crate::shell_safety::is_memory_dir_command;
use crate::shell_safety::is_read_only_shell;
use crate::types::Decision;
use crate::types::PermissionResult;
use crate::types::ToolQuery;
use crate::types::TraceEvent;

const WORKING_DIRECTORY_TOOLS: &[&str] = &["Read", "Glob", "Grep", "ListDir"];
const DEFAULT_ALLOW_TOOLS: &[&str] = &["Read", "Glob", "Grep", "ListDir", "TodoWrite", "TaskOutput"];
const DEFAULT_ALLOW_TASK_SUBAGENTS: &[&str] =
    &["explore", "plan", "recall", "reflection", "history-analyzer"];

/// Everything the engine needs besides the query itself: the merged rule
/// sets, the active mode, the working directory and (optionally) the
/// agent whose memory directory writes are in scope.
pub struct EngineContext<'a> {
    pub rules: &'a RuleStore,
    pub mode: &'a ModeController,
    pub working_dir: &'a Path,
    pub agent_id: Option<&'a str>,
}

/// `check(tool, args, rules, working_dir) -> PermissionResult`. Stages run
/// in strict order; the first matching stage wins.
pub fn check(query: &ToolQuery, ctx: &EngineContext<'_>) -> PermissionResult {
    let canonical_tool = canonicalize_tool(&query.tool);
    let mut trace = Vec::new();

    let query_pattern = build_query_pattern(&canonical_tool, query, ctx.working_dir);

    // 1. Deny (settings).
    if let Some(rule) = first_match(&ctx.rules.persisted.deny, &canonical_tool, &query_pattern, query, ctx.working_dir) {
        trace.push(TraceEvent::DenyRule(rule.clone()));
        return PermissionResult::deny(
            format!("Denied by rule {rule}"),
            Some(rule),
            trace,
        );
    }

    // 2. CLI disallow.
    if let Some(rule) = first_match(&ctx.rules.cli.disallowed, &canonical_tool, &query_pattern, query, ctx.working_dir) {
        let label = format!("{rule} (CLI)");
        trace.push(TraceEvent::CliDisallow(label.clone()));
        return PermissionResult::deny(
            format!("Denied by CLI rule {rule}"),
            Some(label),
            trace,
        );
    }

    // 3. Mode override.
    if let Some(over) = ctx.mode.check_mode_override(query, ctx.working_dir) {
        trace.push(TraceEvent::ModeOverride(over.reason.clone()));
        return match over.decision {
            Decision::Allow => PermissionResult::allow(Some(over.reason), trace),
            Decision::Deny => PermissionResult::deny(over.reason.clone(), Some(over.reason), trace),
            Decision::Ask => PermissionResult::ask(Some(over.reason), trace),
        };
    }

    // 4. CLI allow.
    if let Some(rule) = first_match(&ctx.rules.cli.allowed, &canonical_tool, &query_pattern, query, ctx.working_dir) {
        let label = format!("{rule} (CLI)");
        trace.push(TraceEvent::CliAllow(label.clone()));
        return PermissionResult::allow(Some(label), trace);
    }

    // 5. Always-allow Skill tool.
    if canonical_tool == "Skill" {
        trace.push(TraceEvent::SkillAutoAllow);
        return PermissionResult::allow(None, trace);
    }

    // 6. Read-only shell.
    if is_shell_tool(&canonical_tool) {
        if let Some(argv) = query.command_argv() {
            if is_read_only_shell(
                ShellInput::Argv(&argv),
                ShellAnalyzerOptions {
                    allow_external_paths: false,
                },
            ) {
                trace.push(TraceEvent::ReadonlyShellAutoAllow);
                return PermissionResult::allow(None, trace);
            }
        }

        // 7. Memory-dir shell.
        if let Some(agent_id) = ctx.agent_id {
            if let Some(command) = query.command_string() {
                if is_memory_dir_command(&command, agent_id, MemoryDirOptions::default()) {
                    trace.push(TraceEvent::MemoryDirAutoAllow);
                    return PermissionResult::allow(None, trace);
                }
            }
        }
    }

    // 8. Working-directory tools.
    if WORKING_DIRECTORY_TOOLS.contains(&canonical_tool.as_str()) {
        if let Some(path) = extract_path_arg(query) {
            if path_within(&path, ctx.working_dir, &ctx.rules.persisted.additional_directories) {
                trace.push(TraceEvent::WorkingDirectoryAutoAllow);
                return PermissionResult::allow(
                    Some("Within working directory".to_string()),
                    trace,
                );
            }
        }
    }

    // 9. Session allow.
    if let Some(rule) = first_match(ctx.rules.session.allow(), &canonical_tool, &query_pattern, query, ctx.working_dir) {
        trace.push(TraceEvent::SessionAllow(rule.clone()));
        return PermissionResult::allow(Some(rule), trace);
    }

    // 10. Persisted allow.
    if let Some(rule) = first_match(&ctx.rules.persisted.allow, &canonical_tool, &query_pattern, query, ctx.working_dir) {
        trace.push(TraceEvent::AllowRule(rule.clone()));
        return PermissionResult::allow(Some(rule), trace);
    }

    // 11. Ask.
    if let Some(rule) = first_match(&ctx.rules.persisted.ask, &canonical_tool, &query_pattern, query, ctx.working_dir) {
        trace.push(TraceEvent::AskRule(rule.clone()));
        return PermissionResult::ask(Some(rule), trace);
    }

    // 12. Default.
    trace.push(TraceEvent::DefaultDecision);
    if DEFAULT_ALLOW_TOOLS.contains(&canonical_tool.as_str()) {
        return PermissionResult::allow(None, trace);
    }
    if canonical_tool == "Task" {
        if let Some(subagent) = query.str_arg("subagent_type") {
            if DEFAULT_ALLOW_TASK_SUBAGENTS.contains(&subagent) {
                return PermissionResult::allow(None, trace);
            }
        }
    }
    PermissionResult::ask(None, trace)
}

/// Build the `Tool` / `Tool(payload)` string form of this query used for
/// rule matching: `Bash(...)` for shell tools, `Tool(path)` for file
/// tools, bare `Tool` otherwise.
fn build_query_pattern(canonical_tool: &str, query: &ToolQuery, _working_dir: &Path) -> String {
    if is_shell_tool(canonical_tool) {
        let command = query.command_string().unwrap_or_default();
        format!("Bash({command})")
    } else if let Some(path) = extract_path_arg(query) {
        format!("{canonical_tool}({path})")
    } else {
        canonical_tool.to_string()
    }
}

fn extract_path_arg(query: &ToolQuery) -> Option<String> {
    for key in ["file_path", "path", "pattern", "directory"] {
        if let Some(value) = query.str_arg(key) {
            return Some(value.to_string());
        }
    }
    None
}

fn path_within(path: &str, working_dir: &Path, additional_directories: &[std::path::PathBuf]) -> bool {
    let resolved = crate::util::expand_home(path);
    let p = Path::new(&resolved);
    let abs = if p.is_absolute() {
        p.to_path_buf()
    } else {
        working_dir.join(p)
    };
    abs.starts_with(working_dir) || additional_directories.iter().any(|dir| abs.starts_with(dir))
}

fn first_match(
    rules: &[String],
    canonical_tool: &str,
    query_pattern: &str,
    query: &ToolQuery,
    working_dir: &Path,
) -> Option<String> {
    rules.iter().find(|rule| rule_matches(rule, canonical_tool, query_pattern, query, working_dir)).cloned()
}

fn rule_matches(
    rule: &str,
    canonical_tool: &str,
    query_pattern: &str,
    query: &ToolQuery,
    working_dir: &Path,
) -> bool {
    let parsed = crate::pattern::parse_pattern(rule);
    if parsed.tool == "*" {
        return true;
    }
    if is_shell_tool(canonical_tool) {
        return parsed.tool == "Bash" && match_bash(query_pattern, rule);
    }
    if extract_path_arg(query).is_some() && parsed.payload.is_some() {
        return parsed.tool == canonical_tool && match_file(query_pattern, rule, working_dir);
    }
    match_tool(canonical_tool, rule)
}

/// Outcome of running a permission decision through the external
/// permission-request hook layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookOutcome {
    Allow,
    Deny(String),
    /// The hook declined to override; surface the engine's own decision.
    Unchanged,
}

/// Hooks only run on an `ask` decision. Hook exit 0 means allow, exit 2
/// means deny with the hook's stderr as the reason, anything else leaves
/// the `ask` decision untouched.
pub fn apply_hook_outcome(result: PermissionResult, hook: Option<HookOutcome>) -> PermissionResult {
    if result.decision != Decision::Ask {
        return result;
    }
    match hook {
        Some(HookOutcome::Allow) => PermissionResult::allow(result.matched_rule, result.trace),
        Some(HookOutcome::Deny(reason)) => {
            PermissionResult::deny(reason, result.matched_rule, result.trace)
        }
        Some(HookOutcome::Unchanged) | None => result,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mode::PermissionMode;
    use crate::rules::PersistedRules;
    use std::collections::HashMap;
    use std::path::PathBuf;

    fn ctx<'a>(
        rules: &'a RuleStore,
        mode: &'a ModeController,
        working_dir: &'a Path,
    ) -> EngineContext<'a> {
        EngineContext {
            rules,
            mode,
            working_dir,
            agent_id: None,
        }
    }

    fn q(tool: &str, args: &[(&str, &str)]) -> ToolQuery {
        let mut map = HashMap::new();
        for (k, v) in args {
            map.insert(k.to_string(), serde_json::Value::String(v.to_string()));
        }
        ToolQuery::new(tool, map)
    }

    #[test]
    fn allows_read_within_working_directory() {
        let rules = RuleStore::default();
        let mode = ModeController::new(PermissionMode::Default);
        let wd = PathBuf::from("/u/p");
        let query = q("Read", &[("file_path", "src/a.ts")]);
        let result = check(&query, &ctx(&rules, &mode, &wd));
        assert_eq!(result.decision, Decision::Allow);
        assert_eq!(result.reason.as_deref(), Some("Within working directory"));
    }

    #[test]
    fn deny_rule_beats_everything() {
        let rules = RuleStore::with_persisted(PersistedRules {
            deny: vec!["Read(.env)".to_string()],
            ..Default::default()
        });
        let mode = ModeController::new(PermissionMode::BypassPermissions);
        let wd = PathBuf::from("/u/p");
        let query = q("Read", &[("file_path", ".env")]);
        let result = check(&query, &ctx(&rules, &mode, &wd));
        assert_eq!(result.decision, Decision::Deny);
        assert_eq!(result.matched_rule.as_deref(), Some("Read(.env)"));
    }

    #[test]
    fn cli_allow_rule_matches_bash_prefix() {
        let rules = RuleStore {
            cli: crate::rules::CliRuleOverrides::from_raw(&["Bash(git diff:*)".to_string()], &[]),
            ..Default::default()
        };
        let mode = ModeController::new(PermissionMode::Default);
        let wd = PathBuf::from("/u/p");
        let query = q("Bash", &[("command", "git diff HEAD")]);
        let result = check(&query, &ctx(&rules, &mode, &wd));
        assert_eq!(result.decision, Decision::Allow);
    }

    #[test]
    fn dangerous_bash_falls_through_to_ask_by_default() {
        let rules = RuleStore::default();
        let mode = ModeController::new(PermissionMode::Default);
        let wd = PathBuf::from("/u/p");
        let query = q("Bash", &[("command", "rm -rf node_modules")]);
        let result = check(&query, &ctx(&rules, &mode, &wd));
        assert_eq!(result.decision, Decision::Ask);
    }

    #[test]
    fn plan_mode_allows_compound_readonly_command() {
        let rules = RuleStore::default();
        let mut mode = ModeController::new(PermissionMode::Default);
        mode.enter_plan(PathBuf::from("/u/p/PLAN.md"));
        let wd = PathBuf::from("/u/p");
        let query = q("Bash", &[("command", "cd /u/p && git status")]);
        let result = check(&query, &ctx(&rules, &mode, &wd));
        assert_eq!(result.decision, Decision::Allow);
        assert_eq!(result.reason.as_deref(), Some("plan mode"));
    }

    #[test]
    fn task_default_allow_for_explore_subagent() {
        let rules = RuleStore::default();
        let mode = ModeController::new(PermissionMode::Default);
        let wd = PathBuf::from("/u/p");
        let query = q("Task", &[("subagent_type", "explore")]);
        let result = check(&query, &ctx(&rules, &mode, &wd));
        assert_eq!(result.decision, Decision::Allow);

        let other = q("Task", &[("subagent_type", "code-writer")]);
        let result2 = check(&other, &ctx(&rules, &mode, &wd));
        assert_eq!(result2.decision, Decision::Ask);
    }

    #[test]
    fn hook_layer_can_allow_or_deny_an_ask_decision() {
        let ask = PermissionResult::ask(None, vec![]);
        let allowed = apply_hook_outcome(ask.clone(), Some(HookOutcome::Allow));
        assert_eq!(allowed.decision, Decision::Allow);

        let denied = apply_hook_outcome(ask, Some(HookOutcome::Deny("no".to_string())));
        assert_eq!(denied.decision, Decision::Deny);
        assert_eq!(denied.reason.as_deref(), Some("no"));
    }
}
