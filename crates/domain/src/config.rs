//! Tool-server configuration types.
//!
//! These are lightweight config structs deserialized from the JSON
//! settings file. A server's name is the key of the map it lives in,
//! not a field of the struct. Configs are immutable once loaded — the
//! store replaces the whole map on save.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Configuration for a single tool-server subprocess.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolServerConfig {
    /// The command to spawn (e.g. `"npx"`).
    pub command: String,

    /// Arguments to pass to the command.
    #[serde(default)]
    pub args: Vec<String>,

    /// Environment variables overlaid on the ambient environment of the
    /// spawned process.
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Disabled servers are skipped entirely when starting.
    #[serde(default = "d_true")]
    pub enabled: bool,

    /// Per-server override of the default request timeout (seconds).
    #[serde(default)]
    pub timeout_secs: Option<u64>,

    /// Tool names that may be invoked without asking for approval.
    #[serde(default)]
    pub auto_approve: Vec<String>,
}

impl ToolServerConfig {
    /// Minimal config for a command with arguments; everything else at
    /// defaults. Mostly useful in tests and examples.
    pub fn command(command: impl Into<String>, args: &[&str]) -> Self {
        Self {
            command: command.into(),
            args: args.iter().map(|s| s.to_string()).collect(),
            env: HashMap::new(),
            enabled: true,
            timeout_secs: None,
            auto_approve: Vec::new(),
        }
    }
}

fn d_true() -> bool {
    true
}
