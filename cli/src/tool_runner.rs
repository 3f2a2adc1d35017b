//! The `ToolRunner` that actually executes an approved tool call: `Bash`
//! via a spawned shell, and `Read`/`Write`/`Edit` against the local
//! filesystem. Everything else is rejected — the binary only needs to run
//! what the Approval Executor hands it after a decision was already made.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use listener_core::canonical::canonicalize_tool;
use listener_core::executor::ToolRunner;
use serde_json::Value;
use serde_json::json;
use tokio::io::AsyncReadExt;
use tokio::process::Command;

const MAX_OUTPUT_BYTES: usize = 64 * 1024;

pub struct LocalToolRunner {
    working_dir: PathBuf,
}

impl LocalToolRunner {
    pub fn new(working_dir: PathBuf) -> Self {
        Self { working_dir }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        let p = PathBuf::from(path);
        if p.is_absolute() { p } else { self.working_dir.join(p) }
    }

    async fn run_bash(&self, args: &Value) -> Result<Value, String> {
        let command = args
            .get("command")
            .and_then(Value::as_str)
            .ok_or_else(|| "Bash call missing command".to_string())?;

        let mut child = Command::new("bash")
            .arg("-lc")
            .arg(command)
            .current_dir(&self.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| e.to_string())?;

        let mut stdout = String::new();
        let mut stderr = String::new();
        if let Some(mut out) = child.stdout.take() {
            let _ = out.read_to_string(&mut stdout).await;
        }
        if let Some(mut err) = child.stderr.take() {
            let _ = err.read_to_string(&mut stderr).await;
        }
        let status = child.wait().await.map_err(|e| e.to_string())?;

        stdout.truncate(MAX_OUTPUT_BYTES);
        stderr.truncate(MAX_OUTPUT_BYTES);

        Ok(json!({
            "stdout": stdout,
            "stderr": stderr,
            "exit_code": status.code(),
        }))
    }

    async fn run_read(&self, args: &Value) -> Result<Value, String> {
        let path = args
            .get("file_path")
            .and_then(Value::as_str)
            .ok_or_else(|| "Read call missing file_path".to_string())?;
        let content = tokio::fs::read_to_string(self.resolve(path)).await.map_err(|e| e.to_string())?;
        Ok(json!({ "content": content }))
    }

    async fn run_write(&self, args: &Value) -> Result<Value, String> {
        let path = args
            .get("file_path")
            .and_then(Value::as_str)
            .ok_or_else(|| "Write call missing file_path".to_string())?;
        let content = args.get("content").and_then(Value::as_str).unwrap_or_default();
        let target = self.resolve(path);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| e.to_string())?;
        }
        tokio::fs::write(&target, content).await.map_err(|e| e.to_string())?;
        Ok(json!({ "bytes_written": content.len() }))
    }

    async fn run_edit(&self, args: &Value) -> Result<Value, String> {
        let path = args
            .get("file_path")
            .and_then(Value::as_str)
            .ok_or_else(|| "Edit call missing file_path".to_string())?;
        let old_string = args.get("old_string").and_then(Value::as_str).unwrap_or_default();
        let new_string = args.get("new_string").and_then(Value::as_str).unwrap_or_default();
        let target = self.resolve(path);

        let original = tokio::fs::read_to_string(&target).await.map_err(|e| e.to_string())?;
        let occurrences = original.matches(old_string).count();
        if occurrences != 1 {
            return Err(format!("expected exactly one match for old_string, found {occurrences}"));
        }
        let updated = original.replacen(old_string, new_string, 1);
        tokio::fs::write(&target, updated).await.map_err(|e| e.to_string())?;
        Ok(json!({ "replaced": true }))
    }
}

#[async_trait]
impl ToolRunner for LocalToolRunner {
    async fn run(&self, tool_name: &str, args: &Value) -> Result<Value, String> {
        match canonicalize_tool(tool_name).as_str() {
            "Bash" => self.run_bash(args).await,
            "Read" => self.run_read(args).await,
            "Write" => self.run_write(args).await,
            "Edit" => self.run_edit(args).await,
            other => Err(format!("no local runner for tool {other}")),
        }
    }
}
