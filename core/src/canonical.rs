//! Canonicalizer: collapse tool-name aliases to a fixed set of
//! canonical names, and normalize path-like strings so later glob matching
//! does not have to special-case platform separators or drive letters.

/// The fixed set of canonical tool identities the rest of THE CORE reasons
/// about. Any name outside this set canonicalizes to itself (identity), so
/// unknown/custom tools still flow through the pipeline unharmed.
pub const CANONICAL_TOOLS: &[&str] = &[
    "Bash", "Read", "Write", "Edit", "Glob", "Grep", "ListDir", "Task", "WebFetch",
];

/// Map an alias tool name to its canonical name. Unknown names pass through
/// unchanged — canonicalization never fails.
pub fn canonicalize_tool(name: &str) -> String {
    match name {
        "Bash" | "bash" | "shell" | "run_shell_command" | "execute_command" | "terminal" => {
            "Bash".to_string()
        }
        "Read" | "read_file" | "read" | "cat_file" | "view_file" => "Read".to_string(),
        "Write" | "write_file" | "create_file" => "Write".to_string(),
        "Edit" | "edit_file" | "str_replace" | "str_replace_editor" => "Edit".to_string(),
        "Glob" | "glob" | "find_files" => "Glob".to_string(),
        "Grep" | "grep" | "search_files" | "ripgrep" => "Grep".to_string(),
        "ListDir" | "list_dir" | "ls" | "list_directory" => "ListDir".to_string(),
        "Task" | "task" | "subagent" | "dispatch_agent" => "Task".to_string(),
        "WebFetch" | "web_fetch" | "fetch_url" | "http_get" => "WebFetch".to_string(),
        other => other.to_string(),
    }
}

pub fn is_shell_tool(canonical_name: &str) -> bool {
    canonical_name == "Bash"
}

pub fn is_file_tool(canonical_name: &str) -> bool {
    matches!(canonical_name, "Read" | "Write" | "Edit" | "Glob" | "Grep" | "ListDir")
}

/// Normalize a path-like string for matching: backslashes become forward
/// slashes, a leading `./` is stripped, and a Windows drive-letter prefix
/// that picked up a spurious leading slash (`/C:/foo`) is corrected to
/// `C:/foo` with the drive letter uppercased.
pub fn canonicalize_path_like(raw: &str) -> String {
    let mut s = raw.replace('\\', "/");

    if let Some(rest) = s.strip_prefix('/') {
        if is_drive_letter_prefix(rest) {
            s = rest.to_string();
        }
    }

    if let Some((drive, rest)) = s.split_once(':') {
        if drive.len() == 1 && drive.chars().all(|c| c.is_ascii_alphabetic()) {
            s = format!("{}:{}", drive.to_uppercase(), rest);
        }
    }

    if let Some(rest) = s.strip_prefix("./") {
        s = rest.to_string();
    }

    s
}

fn is_drive_letter_prefix(s: &str) -> bool {
    let bytes = s.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aliases_collapse_to_canonical_names() {
        assert_eq!(canonicalize_tool("read_file"), "Read");
        assert_eq!(canonicalize_tool("shell"), "Bash");
        assert_eq!(canonicalize_tool("run_shell_command"), "Bash");
        assert_eq!(canonicalize_tool("list_directory"), "ListDir");
    }

    #[test]
    fn canonicalization_is_idempotent() {
        for name in [
            "Bash",
            "read_file",
            "SomeCustomTool",
            "WebFetch",
            "fetch_url",
        ] {
            let once = canonicalize_tool(name);
            let twice = canonicalize_tool(&once);
            assert_eq!(once, twice, "not idempotent for {name}");
        }
    }

    #[test]
    fn unknown_tool_names_pass_through() {
        assert_eq!(canonicalize_tool("MyCustomTool"), "MyCustomTool");
    }

    #[test]
    fn path_normalization() {
        assert_eq!(canonicalize_path_like("a\\b\\c"), "a/b/c");
        assert_eq!(canonicalize_path_like("./src/main.rs"), "src/main.rs");
        assert_eq!(canonicalize_path_like("/c:/Users/x"), "C:/Users/x");
        assert_eq!(canonicalize_path_like("d:/Users/x"), "D:/Users/x");
    }

    #[test]
    fn shell_and_file_tool_classification() {
        assert!(is_shell_tool("Bash"));
        assert!(!is_shell_tool("Read"));
        assert!(is_file_tool("Read"));
        assert!(is_file_tool("Grep"));
        assert!(!is_file_tool("Bash"));
        assert!(!is_file_tool("Task"));
    }
}
