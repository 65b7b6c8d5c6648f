//! Local tool handlers — capabilities the dispatcher runs without a
//! tool server.
//!
//! Handlers are deliberately thin: named string parameters in, result
//! text out, a descriptive error on failure. Embedders register their
//! own handlers (user prompts, completion presentation) next to the
//! built-in file and command helpers.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::fs;
use tokio::process::Command;

use tether_domain::block::ToolParams;

/// Hard timeout for `run_command`.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

/// Max chars of command output kept before truncation.
const MAX_OUTPUT_CHARS: usize = 30_000;

/// Max matches returned by `search_files`.
const MAX_SEARCH_RESULTS: usize = 100;

/// Errors a local tool handler can fail with. The dispatcher renders
/// these into the result string; they never abort the session.
#[derive(Debug, thiserror::Error)]
pub enum LocalToolError {
    #[error("missing required parameter: {0}")]
    MissingParam(&'static str),

    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Failed(String),
}

/// A locally handled capability.
#[async_trait]
pub trait LocalTool: Send + Sync {
    async fn call(&self, params: &ToolParams) -> Result<String, LocalToolError>;
}

/// Registry of local tools by invocation name.
#[derive(Default)]
pub struct LocalToolset {
    tools: HashMap<String, Arc<dyn LocalTool>>,
}

impl LocalToolset {
    pub fn new() -> Self {
        Self::default()
    }

    /// Toolset with the built-in file and command helpers, rooted at
    /// `workspace_root`.
    pub fn with_builtins(workspace_root: impl Into<PathBuf>) -> Self {
        let root: PathBuf = workspace_root.into();
        let mut set = Self::new();
        set.register("read_file", Arc::new(ReadFile { root: root.clone() }));
        set.register("write_file", Arc::new(WriteFile { root: root.clone() }));
        set.register("list_files", Arc::new(ListFiles { root: root.clone() }));
        set.register("search_files", Arc::new(SearchFiles { root: root.clone() }));
        set.register("run_command", Arc::new(RunCommand { root }));
        set
    }

    pub fn register(&mut self, name: impl Into<String>, tool: Arc<dyn LocalTool>) {
        self.tools.insert(name.into(), tool);
    }

    pub fn get(&self, name: &str) -> Option<&dyn LocalTool> {
        self.tools.get(name).map(|t| t.as_ref())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(|k| k.as_str()).collect();
        names.sort();
        names
    }
}

/// Resolve a requested path under the workspace root. Absolute paths
/// and `..` components are rejected before any filesystem access.
fn resolve(root: &Path, requested: &str) -> Result<PathBuf, LocalToolError> {
    let requested_path = Path::new(requested);
    if requested_path.is_absolute() {
        return Err(LocalToolError::Failed(format!(
            "absolute paths are not allowed (got '{requested}')"
        )));
    }
    if requested_path
        .components()
        .any(|c| matches!(c, Component::ParentDir))
    {
        return Err(LocalToolError::Failed(
            "path must not contain '..' components".into(),
        ));
    }
    Ok(root.join(requested_path))
}

// ─── read_file ───────────────────────────────────────────────────────

struct ReadFile {
    root: PathBuf,
}

#[async_trait]
impl LocalTool for ReadFile {
    async fn call(&self, params: &ToolParams) -> Result<String, LocalToolError> {
        let path = params.get("path").ok_or(LocalToolError::MissingParam("path"))?;
        let full = resolve(&self.root, path)?;
        Ok(fs::read_to_string(&full).await?)
    }
}

// ─── write_file ──────────────────────────────────────────────────────

struct WriteFile {
    root: PathBuf,
}

#[async_trait]
impl LocalTool for WriteFile {
    async fn call(&self, params: &ToolParams) -> Result<String, LocalToolError> {
        let path = params.get("path").ok_or(LocalToolError::MissingParam("path"))?;
        let content = params
            .get("content")
            .ok_or(LocalToolError::MissingParam("content"))?;
        let full = resolve(&self.root, path)?;
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&full, content).await?;
        Ok(format!("Saved {path} ({} bytes)", content.len()))
    }
}

// ─── list_files ──────────────────────────────────────────────────────

struct ListFiles {
    root: PathBuf,
}

#[async_trait]
impl LocalTool for ListFiles {
    async fn call(&self, params: &ToolParams) -> Result<String, LocalToolError> {
        let path = params.get("path").unwrap_or(".");
        let full = resolve(&self.root, path)?;

        let mut entries = Vec::new();
        let mut dir = fs::read_dir(&full).await?;
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if entry.file_type().await?.is_dir() {
                entries.push(format!("{name}/"));
            } else {
                entries.push(name);
            }
        }
        entries.sort();
        if entries.is_empty() {
            return Ok("(empty directory)".into());
        }
        Ok(entries.join("\n"))
    }
}

// ─── search_files ────────────────────────────────────────────────────

struct SearchFiles {
    root: PathBuf,
}

#[async_trait]
impl LocalTool for SearchFiles {
    async fn call(&self, params: &ToolParams) -> Result<String, LocalToolError> {
        let pattern = params
            .get("pattern")
            .ok_or(LocalToolError::MissingParam("pattern"))?;
        let path = params.get("path").unwrap_or(".");
        let base = resolve(&self.root, path)?;

        let mut matches = Vec::new();
        let mut pending = vec![base.clone()];
        'walk: while let Some(dir) = pending.pop() {
            let mut entries = fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name().to_string_lossy().into_owned();
                if name.starts_with('.') {
                    continue;
                }
                let entry_path = entry.path();
                if entry.file_type().await?.is_dir() {
                    pending.push(entry_path);
                    continue;
                }
                // Binary files fail the UTF-8 read and are skipped.
                let Ok(content) = fs::read_to_string(&entry_path).await else {
                    continue;
                };
                let display = entry_path
                    .strip_prefix(&base)
                    .unwrap_or(&entry_path)
                    .display()
                    .to_string();
                for (idx, line) in content.lines().enumerate() {
                    if line.contains(pattern) {
                        matches.push(format!("{display}:{}: {}", idx + 1, line.trim()));
                        if matches.len() >= MAX_SEARCH_RESULTS {
                            break 'walk;
                        }
                    }
                }
            }
        }

        if matches.is_empty() {
            return Ok("No matches found.".into());
        }
        matches.sort();
        Ok(matches.join("\n"))
    }
}

// ─── run_command ─────────────────────────────────────────────────────

struct RunCommand {
    root: PathBuf,
}

#[async_trait]
impl LocalTool for RunCommand {
    async fn call(&self, params: &ToolParams) -> Result<String, LocalToolError> {
        let command = params
            .get("command")
            .ok_or(LocalToolError::MissingParam("command"))?;
        tracing::debug!(%command, "running local command");

        let output = tokio::time::timeout(
            COMMAND_TIMEOUT,
            Command::new("sh")
                .arg("-c")
                .arg(command)
                .current_dir(&self.root)
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| {
            LocalToolError::Failed(format!(
                "command timed out after {}s",
                COMMAND_TIMEOUT.as_secs()
            ))
        })??;

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            if !text.is_empty() {
                text.push('\n');
            }
            text.push_str(stderr.trim_end());
        }
        if text.len() > MAX_OUTPUT_CHARS {
            let mut cut = MAX_OUTPUT_CHARS;
            while !text.is_char_boundary(cut) {
                cut -= 1;
            }
            text.truncate(cut);
            text.push_str("\n...(truncated)");
        }
        if !output.status.success() {
            if !text.is_empty() {
                text.push('\n');
            }
            text.push_str(&format!("(exit code {})", output.status.code().unwrap_or(-1)));
        }
        if text.trim().is_empty() {
            text = "(no output)".into();
        }
        Ok(text)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
