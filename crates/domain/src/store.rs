//! JSON-file persistence for tool-server configs.
//!
//! A single document of the shape `{"toolServers": {"<name>": {...}}}`.
//! No migration, no merging: what was saved is what is loaded. A
//! missing file loads as an empty map.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::config::ToolServerConfig;
use crate::error::{Error, Result};

#[derive(Debug, Default, Serialize, Deserialize)]
struct ConfigFile {
    #[serde(default, rename = "toolServers")]
    tool_servers: HashMap<String, ToolServerConfig>,
}

/// Load/save of the tool-server config map, keyed by server name.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load all configured servers. A missing file is an empty map.
    pub fn load(&self) -> Result<HashMap<String, ToolServerConfig>> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %self.path.display(), "no tool-server config file");
                return Ok(HashMap::new());
            }
            Err(e) => return Err(Error::Io(e)),
        };

        let file: ConfigFile = serde_json::from_str(&raw).map_err(|e| {
            Error::Config(format!(
                "failed to parse {}: {e}",
                self.path.display()
            ))
        })?;
        Ok(file.tool_servers)
    }

    /// Replace the stored map wholesale.
    pub fn save(&self, servers: &HashMap<String, ToolServerConfig>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = ConfigFile {
            tool_servers: servers.clone(),
        };
        let json = serde_json::to_string_pretty(&file)?;
        std::fs::write(&self.path, json)?;
        tracing::debug!(
            path = %self.path.display(),
            count = servers.len(),
            "saved tool-server config"
        );
        Ok(())
    }
}
