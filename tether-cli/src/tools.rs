//! Builtin read-only tools: `read_file` and `list_files`.
//!
//! Paths are resolved against the run's working directory.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde_json::{json, Map, Value};

use tether_core::tool::{Tool, ToolContext, ToolRegistry};

/// Larger files are truncated to this many bytes.
const MAX_READ_BYTES: usize = 64 * 1024;
const MAX_LIST_ENTRIES: usize = 500;

pub fn builtin_registry() -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(ReadFileTool));
    registry.register(Arc::new(ListFilesTool));
    registry
}

fn required_str<'a>(arguments: &'a Map<String, Value>, key: &str) -> Result<&'a str> {
    match arguments.get(key).and_then(Value::as_str) {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => bail!("'{key}' parameter is required"),
    }
}

fn resolve(ctx: &ToolContext, path: &str) -> PathBuf {
    let path = Path::new(path);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        ctx.working_dir.join(path)
    }
}

// ---------------------------------------------------------------------------
// ReadFileTool
// ---------------------------------------------------------------------------

pub struct ReadFileTool;

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read the contents of a text file."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "File path, relative to the working directory"
                }
            },
            "required": ["path"]
        })
    }

    async fn execute(&self, arguments: &Map<String, Value>, ctx: &ToolContext) -> Result<String> {
        let path = required_str(arguments, "path")?;
        let file_path = resolve(ctx, path);

        if !file_path.is_file() {
            bail!("not a file: {path}");
        }

        let bytes = tokio::fs::read(&file_path)
            .await
            .with_context(|| format!("failed to read {path}"))?;
        let mut content = String::from_utf8_lossy(&bytes[..bytes.len().min(MAX_READ_BYTES)]).into_owned();
        if bytes.len() > MAX_READ_BYTES {
            content.push_str(&format!("\n\n[truncated: {} of {} bytes shown]", MAX_READ_BYTES, bytes.len()));
        }
        Ok(content)
    }

    async fn preview(&self, arguments: &Map<String, Value>, ctx: &ToolContext) -> Result<String> {
        let path = required_str(arguments, "path")?;
        let meta = tokio::fs::metadata(resolve(ctx, path))
            .await
            .with_context(|| format!("cannot stat {path}"))?;
        Ok(format!("read {path} ({} bytes)", meta.len()))
    }
}

// ---------------------------------------------------------------------------
// ListFilesTool
// ---------------------------------------------------------------------------

pub struct ListFilesTool;

#[async_trait]
impl Tool for ListFilesTool {
    fn name(&self) -> &str {
        "list_files"
    }

    fn description(&self) -> &str {
        "List the entries of a directory. Directories end with '/'."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Directory path, relative to the working directory (default: '.')"
                }
            }
        })
    }

    async fn execute(&self, arguments: &Map<String, Value>, ctx: &ToolContext) -> Result<String> {
        let path = arguments.get("path").and_then(Value::as_str).unwrap_or(".");
        let dir = resolve(ctx, path);

        if !dir.is_dir() {
            bail!("not a directory: {path}");
        }

        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .with_context(|| format!("failed to list {path}"))?;
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let mut name = entry.file_name().to_string_lossy().into_owned();
            if entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                name.push('/');
            }
            names.push(name);
        }
        names.sort();

        if names.is_empty() {
            return Ok(format!("{path} is empty"));
        }
        let total = names.len();
        names.truncate(MAX_LIST_ENTRIES);
        let mut out = names.join("\n");
        if total > MAX_LIST_ENTRIES {
            out.push_str(&format!("\n[{} more entries]", total - MAX_LIST_ENTRIES));
        }
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
