//! Approval Analyzer: given a proposed tool call, recommend a persistable
//! rule, a human-readable description, a default persistence scope and a
//! safety tier, dispatched by canonical tool name.

use std::path::Path;
use std::path::PathBuf;

use crate::canonical::canonicalize_path_like;
use crate::canonical::canonicalize_tool;
use crate::types::ToolQuery;

const DANGEROUS_BASE_COMMANDS: &[&str] =
    &["rm", "mv", "chmod", "chown", "sudo", "dd", "mkfs", "fdisk", "kill", "killall"];
const DANGEROUS_FLAGS: &[&str] = &["--force", "-f", "--hard"];
const GIT_WRITE_SUBCOMMANDS: &[&str] = &["push", "reset", "rebase", "checkout", "clean", "branch"];
const PACKAGE_MANAGERS: &[&str] = &["npm", "bun", "yarn", "pnpm"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefaultScope {
    Project,
    Session,
    User,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SafetyLevel {
    Safe,
    Moderate,
    Dangerous,
}

#[derive(Debug, Clone)]
pub struct ApprovalContext {
    pub recommended_rule: String,
    pub rule_description: String,
    pub approve_always_text: String,
    pub default_scope: DefaultScope,
    pub allow_persistence: bool,
    pub safety_level: SafetyLevel,
}

impl ApprovalContext {
    fn dangerous(recommended_rule: impl Into<String>) -> Self {
        Self {
            recommended_rule: recommended_rule.into(),
            rule_description: String::new(),
            approve_always_text: String::new(),
            default_scope: DefaultScope::Session,
            allow_persistence: false,
            safety_level: SafetyLevel::Dangerous,
        }
    }
}

pub fn analyze(query: &ToolQuery, working_dir: &Path) -> ApprovalContext {
    let canonical = canonicalize_tool(&query.tool);
    match canonical.as_str() {
        "Read" => analyze_read_family("Read", query, working_dir, SafetyLevel::Safe),
        "Write" => ApprovalContext {
            recommended_rule: "Write(**)".to_string(),
            rule_description: "Allow writing any file".to_string(),
            approve_always_text: "Always allow Write".to_string(),
            default_scope: DefaultScope::Session,
            allow_persistence: true,
            safety_level: SafetyLevel::Moderate,
        },
        "Edit" => analyze_read_family("Edit", query, working_dir, SafetyLevel::Safe),
        "Bash" => analyze_bash(query, working_dir),
        "WebFetch" => analyze_web_fetch(query),
        "Glob" | "Grep" => analyze_read_family(&canonical, query, working_dir, SafetyLevel::Safe),
        "Task" => ApprovalContext {
            recommended_rule: "Task".to_string(),
            rule_description: "Allow dispatching subagent tasks".to_string(),
            approve_always_text: "Always allow Task".to_string(),
            default_scope: DefaultScope::Session,
            allow_persistence: true,
            safety_level: SafetyLevel::Moderate,
        },
        _ => analyze_read_family(&canonical, query, working_dir, SafetyLevel::Safe),
    }
}

fn extract_path(query: &ToolQuery) -> Option<&str> {
    for key in ["file_path", "path", "pattern", "directory"] {
        if let Some(value) = query.str_arg(key) {
            return Some(value);
        }
    }
    None
}

fn analyze_read_family(
    tool: &str,
    query: &ToolQuery,
    working_dir: &Path,
    safety: SafetyLevel,
) -> ApprovalContext {
    let Some(raw_path) = extract_path(query) else {
        return ApprovalContext {
            recommended_rule: format!("{tool}(**)"),
            rule_description: format!("Allow {tool} anywhere"),
            approve_always_text: format!("Always allow {tool}"),
            default_scope: DefaultScope::Session,
            allow_persistence: true,
            safety_level: safety,
        };
    };

    let normalized = canonicalize_windows_path(raw_path);
    let resolved = resolve(&normalized, working_dir);

    if resolved.starts_with(working_dir) {
        let rel = resolved
            .strip_prefix(working_dir)
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();
        let payload = if rel.is_empty() { "**".to_string() } else { format!("{rel}/**") };
        ApprovalContext {
            recommended_rule: format!("{tool}({payload})"),
            rule_description: format!("Allow {tool} within the working directory"),
            approve_always_text: format!("Always allow {tool} here"),
            default_scope: DefaultScope::Session,
            allow_persistence: true,
            safety_level: safety,
        }
    } else {
        let abs = canonicalize_path_like(&resolved.to_string_lossy());
        ApprovalContext {
            recommended_rule: format!("{tool}(//{}/**)", abs.trim_start_matches('/')),
            rule_description: format!("Allow {tool} under {}", resolved.display()),
            approve_always_text: format!("Always allow {tool} here"),
            default_scope: DefaultScope::Project,
            allow_persistence: true,
            safety_level: safety,
        }
    }
}

fn analyze_web_fetch(query: &ToolQuery) -> ApprovalContext {
    let Some(url) = query.str_arg("url") else {
        return ApprovalContext {
            recommended_rule: "WebFetch".to_string(),
            rule_description: "Allow fetching any URL".to_string(),
            approve_always_text: "Always allow WebFetch".to_string(),
            default_scope: DefaultScope::Session,
            allow_persistence: true,
            safety_level: SafetyLevel::Moderate,
        };
    };
    match parse_protocol_host(url) {
        Some((protocol, host)) => ApprovalContext {
            recommended_rule: format!("WebFetch({protocol}//{host}/*)"),
            rule_description: format!("Allow fetching from {host}"),
            approve_always_text: format!("Always allow fetches to {host}"),
            default_scope: DefaultScope::Project,
            allow_persistence: true,
            safety_level: SafetyLevel::Moderate,
        },
        None => ApprovalContext {
            recommended_rule: "WebFetch".to_string(),
            rule_description: "Allow fetching any URL".to_string(),
            approve_always_text: "Always allow WebFetch".to_string(),
            default_scope: DefaultScope::Session,
            allow_persistence: true,
            safety_level: SafetyLevel::Moderate,
        },
    }
}

fn parse_protocol_host(url: &str) -> Option<(String, String)> {
    let (protocol, rest) = url.split_once("//")?;
    let host = rest.split(['/', '?', '#']).next()?;
    if host.is_empty() {
        return None;
    }
    Some((protocol.to_string(), host.to_string()))
}

fn analyze_bash(query: &ToolQuery, working_dir: &Path) -> ApprovalContext {
    let Some(command) = query.command_string() else {
        return ApprovalContext::dangerous("");
    };

    let inner = crate::shell_safety::unwrap_shell_launcher(&command).unwrap_or(command);

    let segments: Vec<&str> = inner.split("&&").flat_map(|s| s.split(['|', ';'])).map(str::trim).collect();

    for segment in &segments {
        if segment_is_dangerous(segment) {
            return ApprovalContext::dangerous(String::new());
        }
    }

    if let Some(skill_root) = detect_skill_root(&inner, working_dir) {
        return ApprovalContext {
            recommended_rule: format!("Bash({skill_root}:*)"),
            rule_description: format!("Allow scripts under {skill_root}"),
            approve_always_text: "Always allow this skill's scripts".to_string(),
            default_scope: DefaultScope::Session,
            allow_persistence: true,
            safety_level: SafetyLevel::Moderate,
        };
    }

    let first_segment = segments.first().copied().unwrap_or(&inner);

    if let Some(ctx) = dispatch_segment_command(first_segment) {
        return ctx;
    }

    if let Some(rescanned) = rescan_compound(&segments) {
        return rescanned;
    }

    ApprovalContext {
        recommended_rule: format!("Bash({inner})"),
        rule_description: "Allow this exact command".to_string(),
        approve_always_text: "Always allow this exact command".to_string(),
        default_scope: DefaultScope::Session,
        allow_persistence: true,
        safety_level: SafetyLevel::Moderate,
    }
}

/// Canonical-command dispatch (git subcommand / package-manager script /
/// read-only) for a single already-isolated segment, shared between the
/// primary segment and the compound-command rescan past a leading `cd`.
fn dispatch_segment_command(segment: &str) -> Option<ApprovalContext> {
    let tokens: Vec<&str> = segment.split_whitespace().collect();
    let (cmd, rest) = tokens.split_first()?;

    if *cmd == "git" {
        if let Some(sub) = rest.first() {
            let safety = if GIT_WRITE_SUBCOMMANDS.contains(sub) {
                SafetyLevel::Moderate
            } else {
                SafetyLevel::Safe
            };
            return Some(ApprovalContext {
                recommended_rule: format!("Bash(git {sub}:*)"),
                rule_description: format!("Allow git {sub} commands"),
                approve_always_text: format!("Always allow git {sub}"),
                default_scope: DefaultScope::Session,
                allow_persistence: true,
                safety_level: safety,
            });
        }
    }

    if PACKAGE_MANAGERS.contains(cmd) {
        let sub = rest.first().copied();
        let script = rest.get(1).copied();
        let payload = match (sub, script) {
            (Some(sub), Some(script)) => format!("{cmd} {sub} {script}"),
            (Some(sub), None) => format!("{cmd} {sub}"),
            _ => cmd.to_string(),
        };
        return Some(ApprovalContext {
            recommended_rule: format!("Bash({payload}:*)"),
            rule_description: format!("Allow {cmd} commands"),
            approve_always_text: format!("Always allow {cmd}"),
            default_scope: DefaultScope::Session,
            allow_persistence: true,
            safety_level: SafetyLevel::Moderate,
        });
    }

    if crate::shell_safety::is_read_only_shell(
        crate::shell_safety::ShellInput::Raw(segment),
        crate::shell_safety::ShellAnalyzerOptions {
            allow_external_paths: false,
        },
    ) {
        return Some(ApprovalContext {
            recommended_rule: format!("Bash({cmd}:*)"),
            rule_description: format!("Allow {cmd} commands"),
            approve_always_text: format!("Always allow {cmd}"),
            default_scope: DefaultScope::Session,
            allow_persistence: true,
            safety_level: SafetyLevel::Safe,
        });
    }

    None
}

/// Re-scan a compound command's segments past any leading `cd`, running the
/// same canonical-command dispatch as the primary segment on the first
/// non-`cd` segment so e.g. `cd /u/p && git diff` still recommends
/// `Bash(git diff:*)` rather than collapsing to the bare command word.
fn rescan_compound(segments: &[&str]) -> Option<ApprovalContext> {
    for segment in segments {
        let tokens: Vec<&str> = segment.split_whitespace().collect();
        let (cmd, _) = tokens.split_first()?;
        if *cmd == "cd" {
            continue;
        }
        if let Some(ctx) = dispatch_segment_command(segment) {
            return Some(ctx);
        }
        return Some(ApprovalContext {
            recommended_rule: format!("Bash({cmd}:*)"),
            rule_description: format!("Allow {cmd} commands"),
            approve_always_text: format!("Always allow {cmd}"),
            default_scope: DefaultScope::Session,
            allow_persistence: true,
            safety_level: SafetyLevel::Moderate,
        });
    }
    None
}

fn segment_is_dangerous(segment: &str) -> bool {
    let tokens: Vec<&str> = segment.split_whitespace().collect();
    let Some((cmd, rest)) = tokens.split_first() else {
        return false;
    };
    if DANGEROUS_BASE_COMMANDS.contains(cmd) {
        return true;
    }
    rest.iter().any(|arg| DANGEROUS_FLAGS.contains(arg))
}

/// Skill-root scripts: project `.skills/<id>/scripts/`, agent-scoped
/// `~/.letta/agents/<id>/skills/<name>/scripts/`, global
/// `~/.letta/skills/<name>/scripts/`, or bundled
/// `.../skills/builtin/<name>/scripts/`.
fn detect_skill_root(command: &str, working_dir: &Path) -> Option<String> {
    let token = command.split_whitespace().find(|t| t.contains("/skills/") && t.contains("/scripts/"))?;
    let scripts_idx = token.find("/scripts/")?;
    let prefix = &token[..scripts_idx + "/scripts".len()];

    let expanded = crate::util::expand_home(prefix);
    let resolved = resolve(&expanded, working_dir);
    Some(canonicalize_path_like(&resolved.to_string_lossy()))
}

fn resolve(path: &str, working_dir: &Path) -> PathBuf {
    let expanded = crate::util::expand_home(path);
    let p = Path::new(&expanded);
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        working_dir.join(p)
    }
}

fn canonicalize_windows_path(path: &str) -> String {
    canonicalize_path_like(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn q(tool: &str, args: &[(&str, &str)]) -> ToolQuery {
        let mut map = HashMap::new();
        for (k, v) in args {
            map.insert(k.to_string(), serde_json::Value::String(v.to_string()));
        }
        ToolQuery::new(tool, map)
    }

    #[test]
    fn read_inside_working_dir_is_session_scoped_safe() {
        let query = q("Read", &[("file_path", "src/a.ts")]);
        let ctx = analyze(&query, Path::new("/u/p"));
        assert_eq!(ctx.recommended_rule, "Read(src/**)");
        assert_eq!(ctx.default_scope, DefaultScope::Session);
        assert_eq!(ctx.safety_level, SafetyLevel::Safe);
    }

    #[test]
    fn read_outside_working_dir_is_project_scoped() {
        let query = q("Read", &[("file_path", "/etc/hosts")]);
        let ctx = analyze(&query, Path::new("/u/p"));
        assert_eq!(ctx.default_scope, DefaultScope::Project);
        assert!(ctx.recommended_rule.starts_with("Read(//"));
    }

    #[test]
    fn write_is_always_broad_and_moderate() {
        let query = q("Write", &[("file_path", "src/a.ts")]);
        let ctx = analyze(&query, Path::new("/u/p"));
        assert_eq!(ctx.recommended_rule, "Write(**)");
        assert_eq!(ctx.safety_level, SafetyLevel::Moderate);
    }

    #[test]
    fn dangerous_bash_command_blocks_persistence() {
        let query = q("Bash", &[("command", "rm -rf node_modules")]);
        let ctx = analyze(&query, Path::new("/u/p"));
        assert_eq!(ctx.safety_level, SafetyLevel::Dangerous);
        assert!(!ctx.allow_persistence);
        assert_eq!(ctx.approve_always_text, "");
    }

    #[test]
    fn git_subcommand_maps_to_prefix_rule() {
        let query = q("Bash", &[("command", "git diff HEAD")]);
        let ctx = analyze(&query, Path::new("/u/p"));
        assert_eq!(ctx.recommended_rule, "Bash(git diff:*)");
        assert_eq!(ctx.safety_level, SafetyLevel::Safe);
    }

    #[test]
    fn package_manager_script_invocation() {
        let query = q("Bash", &[("command", "npm run build")]);
        let ctx = analyze(&query, Path::new("/u/p"));
        assert_eq!(ctx.recommended_rule, "Bash(npm run build:*)");
    }

    #[test]
    fn compound_command_rescans_past_leading_cd() {
        let query = q("Bash", &[("command", "cd /u/p && git diff")]);
        let ctx = analyze(&query, Path::new("/u/p"));
        assert_eq!(ctx.recommended_rule, "Bash(git diff:*)");
    }

    #[test]
    fn web_fetch_extracts_protocol_and_host() {
        let query = q("WebFetch", &[("url", "https://example.com/a/b")]);
        let ctx = analyze(&query, Path::new("/u/p"));
        assert_eq!(ctx.recommended_rule, "WebFetch(https://example.com/*)");
    }

    #[test]
    fn fallback_is_exact_command_match() {
        let query = q("Bash", &[("command", "some-unusual-tool --flag")]);
        let ctx = analyze(&query, Path::new("/u/p"));
        assert_eq!(ctx.recommended_rule, "Bash(some-unusual-tool --flag)");
    }
}
