//! Read-only shell analysis.
//!
//! Two judgments live here: `is_read_only_shell` (is this command provably
//! read-only, closed against redirection/substitution/`cd`-bypass tricks)
//! and `is_memory_dir_command` (is this write command confined to a single
//! agent's memory directory). Both operate on either a raw string or an
//! argv array; array inputs are unwrapped through shell launchers
//! (`bash -c`, `sh -lc`, ...) the same way before falling back to string
//! analysis.

use crate::util::expand_home;

const SHELL_LAUNCHERS: &[&str] = &["bash", "sh"];
const SHELL_C_FLAGS: &[&str] = &["-c", "-lc"];

const ALWAYS_SAFE: &[&str] = &[
    "cat", "head", "tail", "less", "more", "grep", "rg", "ag", "ack", "fgrep", "egrep", "ls",
    "tree", "file", "stat", "du", "df", "wc", "diff", "cmp", "comm", "cut", "tr", "nl", "column",
    "fold", "pwd", "whoami", "hostname", "date", "uname", "uptime", "id", "echo", "printf", "env",
    "printenv", "which", "whereis", "type", "basename", "dirname", "realpath", "readlink", "jq",
    "yq", "strings", "xxd", "hexdump", "cd",
];

const GIT_READONLY_SUBCOMMANDS: &[&str] =
    &["status", "diff", "log", "show", "branch", "tag", "remote"];

const FIND_UNSAFE_OPTIONS: &[&str] = &["-delete", "-exec", "-execdir", "-ok", "-okdir"];

/// Command line input, either already tokenized (as tool invocations usually
/// arrive) or a raw shell string.
#[derive(Debug, Clone)]
pub enum ShellInput<'a> {
    Raw(&'a str),
    Argv(&'a [String]),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ShellAnalyzerOptions {
    pub allow_external_paths: bool,
}

pub fn is_read_only_shell(input: ShellInput<'_>, opts: ShellAnalyzerOptions) -> bool {
    let command = match unwrap_launcher(input) {
        Some(inner) => return is_read_only_shell(ShellInput::Raw(&inner), opts),
        None => match input {
            ShellInput::Raw(s) => s.to_string(),
            ShellInput::Argv(args) => args.join(" "),
        },
    };

    let Ok(segments) = split_top_level(&command, &["&&", "||", "|", ";"], true) else {
        return false;
    };

    segments
        .iter()
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .all(|segment| is_safe_segment(segment, opts))
}

/// Public entry point for callers outside this module (the Approval
/// Analyzer's Bash normalization pipeline) that just need the
/// launcher-unwrap step without the rest of the read-only judgment.
pub fn unwrap_shell_launcher(command: &str) -> Option<String> {
    unwrap_launcher(ShellInput::Raw(command))
}

/// If `input` is an array whose first token is a shell launcher, or a raw
/// string that tokenizes the same way, return the inner `-c`/`-lc` script.
fn unwrap_launcher(input: ShellInput<'_>) -> Option<String> {
    let tokens: Vec<String> = match input {
        ShellInput::Argv(args) => args.to_vec(),
        ShellInput::Raw(s) => shlex::split(s)?,
    };

    if tokens.len() >= 3
        && SHELL_LAUNCHERS.contains(&tokens[0].as_str())
        && SHELL_C_FLAGS.contains(&tokens[1].as_str())
    {
        Some(tokens[2..].join(" "))
    } else {
        None
    }
}

fn is_safe_segment(segment: &str, opts: ShellAnalyzerOptions) -> bool {
    let Some(tokens) = shlex::split(segment) else {
        return false;
    };
    let Some(cmd) = tokens.first() else {
        return true;
    };

    if let Some(inner) = unwrap_launcher(ShellInput::Argv(&tokens)) {
        return is_read_only_shell(ShellInput::Raw(&inner), opts);
    }

    match cmd.as_str() {
        _ if ALWAYS_SAFE.contains(&cmd.as_str()) => {
            opts.allow_external_paths || args_confined_to_cwd(&tokens[1..])
        }
        "sed" => {
            let has_in_place = tokens[1..]
                .iter()
                .any(|t| t == "-i" || t.starts_with("-i") || t == "--in-place");
            if has_in_place {
                return false;
            }
            opts.allow_external_paths || args_confined_to_cwd(&tokens[1..])
        }
        "git" => tokens
            .get(1)
            .is_some_and(|sub| GIT_READONLY_SUBCOMMANDS.contains(&sub.as_str())),
        "gh" => is_safe_gh_invocation(&tokens),
        "letta" => is_safe_letta_invocation(&tokens),
        "find" => !tokens.iter().any(|t| FIND_UNSAFE_OPTIONS.contains(&t.as_str())),
        "sort" => !tokens[1..].iter().any(|t| t == "-o"),
        _ => false,
    }
}

/// `true` unless some non-flag argument is absolute, home-anchored, or
/// contains a `..` traversal component.
fn args_confined_to_cwd(args: &[String]) -> bool {
    args.iter()
        .filter(|a| !a.starts_with('-'))
        .all(|a| is_path_confined(a))
}

fn is_path_confined(arg: &str) -> bool {
    if arg.starts_with('/') || arg == "~" || arg.starts_with("~/") {
        return false;
    }
    arg.split('/').all(|seg| seg != "..")
}

const GH_FIXED_CATEGORIES: &[(&str, &[&str])] = &[
    ("pr", &["list", "view", "diff", "status", "checks"]),
    ("issue", &["list", "view", "status"]),
    ("repo", &["view", "list"]),
    ("run", &["list", "view", "watch"]),
    ("release", &["list", "view"]),
];
const GH_OPEN_CATEGORIES: &[&str] = &["search", "api", "status"];

fn is_safe_gh_invocation(tokens: &[String]) -> bool {
    let Some(category) = tokens.get(1) else {
        return false;
    };
    if GH_OPEN_CATEGORIES.contains(&category.as_str()) {
        return true;
    }
    let Some((_, actions)) = GH_FIXED_CATEGORIES
        .iter()
        .find(|(name, _)| name == category)
    else {
        return false;
    };
    match tokens.get(2) {
        Some(action) => actions.contains(&action.as_str()),
        None => false,
    }
}

const LETTA_GROUPS: &[(&str, &[&str])] = &[
    ("memfs", &["status", "help", "backups", "export"]),
    ("agent", &["status", "list", "help"]),
    ("skills", &["list", "help"]),
];

fn is_safe_letta_invocation(tokens: &[String]) -> bool {
    let Some(group) = tokens.get(1) else {
        return false;
    };
    let Some((_, actions)) = LETTA_GROUPS.iter().find(|(name, _)| name == group) else {
        return false;
    };
    match tokens.get(2) {
        Some(action) => actions.contains(&action.as_str()),
        None => false,
    }
}

/// Quote-aware split of `command` on any of `ops` (each tried at the current
/// position, longest-first within a position so `&&`/`||` win over a lone
/// `|` false-match). Single-quoted regions are copied verbatim; unquoted
/// `` ` `` / `$(` / (when `reject_redirects`) `>`/`>>` anywhere outside a
/// single-quoted region abort the split with `Err(())`.
fn split_top_level(command: &str, ops: &[&str], reject_redirects: bool) -> Result<Vec<String>, ()> {
    let chars: Vec<char> = command.chars().collect();
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut i = 0;
    let mut quote: Option<char> = None;

    while i < chars.len() {
        let c = chars[i];

        if let Some(q) = quote {
            current.push(c);
            if c == q {
                quote = None;
            } else if q == '"' && is_command_substitution_start(&chars, i) {
                return Err(());
            }
            i += 1;
            continue;
        }

        if c == '\'' || c == '"' {
            quote = Some(c);
            current.push(c);
            i += 1;
            continue;
        }

        if is_command_substitution_start(&chars, i) {
            return Err(());
        }

        if reject_redirects && c == '>' {
            return Err(());
        }

        if let Some(op) = ops.iter().find(|op| matches_at(&chars, i, op)) {
            segments.push(current.clone());
            current.clear();
            i += op.chars().count();
            continue;
        }

        current.push(c);
        i += 1;
    }

    if quote.is_some() {
        return Err(());
    }

    segments.push(current);
    Ok(segments)
}

fn is_command_substitution_start(chars: &[char], i: usize) -> bool {
    chars[i] == '`' || (chars[i] == '$' && chars.get(i + 1) == Some(&'('))
}

fn matches_at(chars: &[char], i: usize, op: &str) -> bool {
    let op_chars: Vec<char> = op.chars().collect();
    if i + op_chars.len() > chars.len() {
        return false;
    }
    chars[i..i + op_chars.len()] == op_chars[..]
}

// ---------------------------------------------------------------------
// Memory-directory variant
// ---------------------------------------------------------------------

const MEMORY_DIR_SAFE_COMMANDS: &[&str] = &[
    "git", "cat", "echo", "mkdir", "rm", "mv", "cp", "touch", "sed", "tee", "cd", "ls",
];

#[derive(Debug, Clone, Copy, Default)]
pub struct MemoryDirOptions {
    /// Mirrors `LETTA_MEMORY_DIR_APPROVE_ALL`: widen beyond the safe command
    /// set above, trusting path confinement alone. Defaults to `false`.
    pub approve_all: bool,
}

/// Is `command` a write (or any) command fully confined to
/// `~/.letta/agents/<agent_id>/memory[-worktrees]/`? Unlike
/// `is_read_only_shell`, command substitution and redirects are permitted
/// (memory commits need them); only path confinement is enforced.
pub fn is_memory_dir_command(command: &str, agent_id: &str, opts: MemoryDirOptions) -> bool {
    let allowed_prefixes = memory_prefixes(agent_id);

    let Ok(top_segments) = split_top_level(command, &["&&", "||", ";"], false) else {
        return false;
    };

    let mut cwd: Option<String> = None;

    for top in top_segments.iter().map(|s| s.trim()).filter(|s| !s.is_empty()) {
        let Ok(pipe_segments) = split_top_level(top, &["|"], false) else {
            return false;
        };

        for segment in pipe_segments.iter().map(|s| s.trim()).filter(|s| !s.is_empty()) {
            let Some(tokens) = shlex::split(segment) else {
                return false;
            };
            let Some(cmd) = tokens.first() else {
                continue;
            };

            if cmd == "cd" {
                let Some(target) = tokens.get(1) else {
                    return false;
                };
                let expanded = expand_home(target);
                if !is_inside_any_prefix(&expanded, &allowed_prefixes) {
                    return false;
                }
                cwd = Some(expanded);
                continue;
            }

            if !opts.approve_all && !MEMORY_DIR_SAFE_COMMANDS.contains(&cmd.as_str()) {
                return false;
            }

            // No non-flag argument may escape the allowed prefixes via an
            // absolute path, home-anchored path, or `..` traversal,
            // regardless of which disjunct below ends up satisfied — this
            // is what closes `cd <mem> && rm -rf /`: the cd leaves `cwd`
            // confined, but without this check the bare `/` argument would
            // slip through since it never mentions `.letta/agents/`.
            let args_confined = tokens[1..]
                .iter()
                .filter(|a| !a.starts_with('-'))
                .all(|a| !escapes_prefix(a, &allowed_prefixes));
            if !args_confined {
                return false;
            }

            let cwd_confined = cwd.as_deref().is_some_and(|c| is_inside_any_prefix(c, &allowed_prefixes));

            let all_letta_refs_confined = tokens.iter().all(|t| {
                !t.contains(".letta/agents/") || is_inside_any_prefix(&expand_home(t), &allowed_prefixes)
            });

            if !(cwd_confined || all_letta_refs_confined) {
                return false;
            }
        }
    }

    true
}

fn memory_prefixes(agent_id: &str) -> Vec<String> {
    vec![
        expand_home(&format!("~/.letta/agents/{agent_id}/memory")),
        expand_home(&format!("~/.letta/agents/{agent_id}/memory-worktrees")),
    ]
}

fn is_inside_any_prefix(path: &str, prefixes: &[String]) -> bool {
    prefixes.iter().any(|p| path == p || path.starts_with(&format!("{p}/")))
}

fn escapes_prefix(arg: &str, prefixes: &[String]) -> bool {
    let expanded = expand_home(arg);
    if expanded.starts_with('/') || arg.starts_with('~') {
        return !is_inside_any_prefix(&expanded, prefixes);
    }
    arg.split('/').any(|seg| seg == "..")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ro(cmd: &str, allow_external: bool) -> bool {
        is_read_only_shell(
            ShellInput::Raw(cmd),
            ShellAnalyzerOptions {
                allow_external_paths: allow_external,
            },
        )
    }

    #[test]
    fn always_safe_commands_within_cwd() {
        assert!(ro("cat relative/file.txt", false));
        assert!(ro("ls -la", false));
        assert!(ro("grep -R foo .", false));
    }

    #[test]
    fn external_paths_rejected_unless_allowed() {
        assert!(!ro("cat /etc/passwd", false));
        assert!(ro("cat /etc/passwd", true));
    }

    #[test]
    fn traversal_rejected() {
        assert!(!ro("cat ../../etc/passwd", false));
    }

    #[test]
    fn redirection_and_substitution_rejected() {
        assert!(!ro("cat foo > bar", false));
        assert!(!ro("echo $(whoami)", false));
        assert!(!ro("echo `whoami`", false));
        assert!(!ro("echo \"$(whoami)\"", false));
    }

    #[test]
    fn single_quoted_region_is_verbatim() {
        assert!(ro("echo 'a > b'", false));
        assert!(ro("grep -R 'a && b' .", false));
    }

    #[test]
    fn git_readonly_subcommands_only() {
        assert!(ro("git status", false));
        assert!(ro("git diff HEAD", false));
        assert!(!ro("git push", false));
        assert!(!ro("git commit -m x", false));
    }

    #[test]
    fn sed_in_place_rejected() {
        assert!(ro("sed -n '1,5p' file.txt", false));
        assert!(!ro("sed -i s/a/b/ file.txt", false));
        assert!(!ro("sed --in-place s/a/b/ file.txt", false));
    }

    #[test]
    fn find_rejects_delete_and_exec() {
        assert!(ro("find . -name file.txt", false));
        assert!(!ro("find . -name file.txt -delete", false));
        assert!(!ro("find . -exec rm {} \\;", false));
    }

    #[test]
    fn sort_rejects_output_flag() {
        assert!(ro("sort file.txt", false));
        assert!(!ro("sort -o out.txt file.txt", false));
    }

    #[test]
    fn gh_category_rules() {
        assert!(ro("gh pr list", false));
        assert!(ro("gh pr view 5", false));
        assert!(!ro("gh pr merge 5", false));
        assert!(ro("gh search repos foo", false));
        assert!(ro("gh api /user", false));
    }

    #[test]
    fn letta_group_rules() {
        assert!(ro("letta memfs status", false));
        assert!(!ro("letta memfs commit", false));
    }

    #[test]
    fn bash_lc_wrapper_recurses() {
        assert!(is_read_only_shell(
            ShellInput::Argv(&["bash".into(), "-lc".into(), "git status".into()]),
            ShellAnalyzerOptions::default()
        ));
        assert!(!is_read_only_shell(
            ShellInput::Argv(&["bash".into(), "-lc".into(), "git push".into()]),
            ShellAnalyzerOptions::default()
        ));
    }

    #[test]
    fn compound_command_requires_every_segment_safe() {
        assert!(ro("git status && ls", false));
        assert!(!ro("git status && rm -rf /", false));
    }

    #[test]
    fn cd_bypass_outside_memory_is_rejected_by_readonly_variant() {
        assert!(!ro("cd / && cat relative", false));
    }

    fn mem(cmd: &str, approve_all: bool) -> bool {
        is_memory_dir_command(cmd, "agent-1", MemoryDirOptions { approve_all })
    }

    #[test]
    fn memory_dir_allows_confined_writes() {
        let cmd = "cd ~/.letta/agents/agent-1/memory && git add . && git commit -m note";
        assert!(mem(cmd, false));
    }

    #[test]
    fn memory_dir_rejects_cd_then_escape() {
        let cmd = "cd ~/.letta/agents/agent-1/memory && rm -rf /";
        assert!(!mem(cmd, false));
    }

    #[test]
    fn memory_dir_rejects_unconfined_cd_target() {
        let cmd = "cd / && rm -rf /";
        assert!(!mem(cmd, false));
    }

    #[test]
    fn memory_dir_rejects_command_outside_safe_set_unless_approve_all() {
        let cmd = "cd ~/.letta/agents/agent-1/memory && curl https://evil";
        assert!(!mem(cmd, false));
        assert!(mem(cmd, true));
    }
}
