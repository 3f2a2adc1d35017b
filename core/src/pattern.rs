//! Pattern Matcher: match tool/file/bash queries against permission
//! patterns of the form `Tool`, `Tool(payload)`, or the bare wildcard `*`.

use std::path::Path;
use std::path::PathBuf;

use wildmatch::WildMatch;

use crate::canonical::canonicalize_path_like;
use crate::util::expand_home;

/// A parsed `Tool` | `Tool(payload)` | `*` pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedPattern {
    pub tool: String,
    pub payload: Option<String>,
}

/// Parse `Tool(payload)` (or bare `Tool`, or `*`) into its parts. The
/// payload is everything between the first `(` and the matching last `)`,
/// which is sufficient here because payloads never contain unbalanced
/// parens in practice (bash prefixes, globs, domains).
pub fn parse_pattern(pattern: &str) -> ParsedPattern {
    let pattern = pattern.trim();
    if pattern == "*" {
        return ParsedPattern {
            tool: "*".to_string(),
            payload: None,
        };
    }
    if let Some(open) = pattern.find('(') {
        if let Some(close) = pattern.rfind(')') {
            if close > open {
                let tool = pattern[..open].to_string();
                let payload = pattern[open + 1..close].to_string();
                return ParsedPattern {
                    tool,
                    payload: Some(payload),
                };
            }
        }
    }
    ParsedPattern {
        tool: pattern.to_string(),
        payload: None,
    }
}

/// `match_tool(name, pattern)`: `*` matches all; exact name; `name()`; or
/// `name(...)` (any payload) all match a bare-tool query.
pub fn match_tool(name: &str, pattern: &str) -> bool {
    let parsed = parse_pattern(pattern);
    parsed.tool == "*" || parsed.tool == name
}

/// Match a file-tool query path against a file glob pattern.
///
/// `query` and `pattern` are both `Tool(path)` strings; the tool names must
/// match first. The payload glob is matched against both the path relative
/// to `working_dir` and the absolute path — success if either matches.
pub fn match_file(query: &str, pattern: &str, working_dir: &Path) -> bool {
    let q = parse_pattern(query);
    let p = parse_pattern(pattern);

    if p.tool != "*" && p.tool != q.tool {
        return false;
    }

    let query_path = match &q.payload {
        Some(p) => p,
        None => return p.payload.is_none(),
    };

    let Some(raw_glob) = p.payload.as_deref() else {
        return false;
    };

    let glob = normalize_file_glob(raw_glob);
    let abs_query = resolve_absolute(query_path, working_dir);
    let rel_query = relative_to(&abs_query, working_dir);

    let matcher = WildMatch::new(&glob);
    matcher.matches(&rel_query) || matcher.matches(&abs_query.to_string_lossy())
}

/// Expand `~/`, strip a leading `./`, and turn a leading `//` into a single
/// leading `/` (absolute-path marker).
fn normalize_file_glob(raw: &str) -> String {
    let mut s = canonicalize_path_like(raw);
    if let Some(rest) = s.strip_prefix("//") {
        s = format!("/{rest}");
    }
    expand_home(&s)
}

fn resolve_absolute(path: &str, working_dir: &Path) -> PathBuf {
    let normalized = expand_home(&canonicalize_path_like(path));
    let p = Path::new(&normalized);
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        working_dir.join(p)
    }
}

fn relative_to(path: &Path, working_dir: &Path) -> String {
    path.strip_prefix(working_dir)
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_else(|_| path.to_string_lossy().into_owned())
}

/// Match a bash command query against a `Bash(cmd)` / `Bash(cmd:*)` pattern.
///
/// If the raw command contains `&&`, `|`, or `;`, a "stripped" form is also
/// derived: leading `cd ...` segments are dropped and the first non-`cd`
/// segment is kept. Both the raw and stripped forms are tried.
pub fn match_bash(query: &str, pattern: &str) -> bool {
    let q = parse_pattern(query);
    let p = parse_pattern(pattern);

    if p.tool != "*" && p.tool != "Bash" {
        return false;
    }

    let command = match &q.payload {
        Some(c) => c,
        None => return p.payload.is_none(),
    };

    let Some(raw_pattern) = p.payload.as_deref() else {
        return false;
    };

    let candidates = bash_match_candidates(command);

    if let Some(prefix) = raw_pattern.strip_suffix(":*") {
        candidates.iter().any(|c| c.starts_with(prefix))
    } else {
        candidates.iter().any(|c| c == raw_pattern)
    }
}

fn bash_match_candidates(command: &str) -> Vec<String> {
    let mut candidates = vec![command.to_string()];
    if command.contains("&&") || command.contains('|') || command.contains(';') {
        if let Some(stripped) = strip_leading_cd(command) {
            candidates.push(stripped);
        }
    }
    candidates
}

/// Drop leading `cd <dir> &&`/`;` segments and return the first
/// non-`cd` segment, for matching compound commands like
/// `cd /u/p && git status` against `Bash(git status:*)`.
fn strip_leading_cd(command: &str) -> Option<String> {
    let segments: Vec<&str> = command
        .split(|c| c == ';' || c == '|')
        .flat_map(|s| s.split("&&"))
        .map(str::trim)
        .collect();

    segments
        .into_iter()
        .find(|s| !s.starts_with("cd ") && *s != "cd")
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use std::path::PathBuf;

    fn wd() -> PathBuf {
        PathBuf::from("/u/p")
    }

    #[test]
    fn bare_tool_match_and_wildcard() {
        assert!(match_tool("Read", "*"));
        assert!(match_tool("Read", "Read"));
        assert!(match_tool("Read", "Read()"));
        assert!(match_tool("Read", "Read(anything)"));
        assert!(!match_tool("Write", "Read"));
    }

    #[test]
    fn file_glob_matches_relative_and_absolute() {
        assert!(match_file("Read(src/a.ts)", "Read(src/**)", &wd()));
        assert!(match_file("Read(/u/p/src/a.ts)", "Read(src/**)", &wd()));
        assert!(!match_file("Read(other/a.ts)", "Read(src/**)", &wd()));
    }

    #[test]
    fn absolute_double_slash_pattern() {
        assert!(match_file("Read(/etc/passwd)", "Read(//etc/**)", &wd()));
    }

    #[test]
    fn home_expansion_in_pattern() {
        let home = dirs::home_dir().unwrap();
        let query = format!("Read({}/f)", home.display());
        assert!(match_file(&query, "Read(~/f)", &wd()));
    }

    #[test]
    fn bash_prefix_and_exact_wildcard() {
        assert!(match_bash("Bash(git diff HEAD)", "Bash(git diff:*)"));
        assert!(match_bash("Bash(anything at all)", "Bash(:*)"));
        assert!(match_bash("Bash(ls)", "Bash(ls)"));
        assert!(!match_bash("Bash(ls -la)", "Bash(ls)"));
    }

    #[test]
    fn bash_empty_pattern_matches_empty_command() {
        assert!(match_bash("Bash()", "Bash()"));
        assert!(!match_bash("Bash(ls)", "Bash()"));
    }

    #[test]
    fn bash_compound_command_matches_stripped_form() {
        assert!(match_bash(
            "Bash(cd /u/p && git status)",
            "Bash(git status:*)"
        ));
    }
}
