//! Supervisor — owns every tool-server connection and drives its
//! lifecycle: spawn, capability discovery, queries, teardown.
//!
//! Connections fail independently: one server crashing, timing out, or
//! refusing discovery never touches the others. Observers learn about
//! status changes through a broadcast channel rather than callbacks.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, Mutex};

use tether_domain::config::ToolServerConfig;

use crate::protocol::{
    methods, ListResourceTemplatesResult, ListResourcesResult, ListToolsResult,
    ResourceDescriptor, ResourceTemplateDescriptor, ToolDescriptor,
};
use crate::transport::{StdioTransport, TransportError, TransportEvent};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Status & events
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Connection state machine. `Connecting → Connected | Disconnected`,
/// `Connected → Disconnected`; back to Connecting only via a fresh
/// stop + start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
}

/// Lifecycle notifications broadcast to observers. Fire-and-forget:
/// a lagging receiver misses events rather than blocking the
/// supervisor.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    Connected { server: String },
    Disconnected { server: String, error: Option<String> },
    StartFailed { server: String, error: String },
}

/// Per-server snapshot for status displays.
#[derive(Debug, Clone, Serialize)]
pub struct ServerStatus {
    pub name: String,
    pub status: ConnectionStatus,
    pub error: Option<String>,
    pub connected_at: Option<DateTime<Utc>>,
    pub tool_count: usize,
    pub resource_count: usize,
}

/// Union of discovered capabilities across connected servers, each
/// entry tagged with the owning server's name.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Capabilities {
    pub tools: Vec<(String, ToolDescriptor)>,
    pub resources: Vec<(String, ResourceDescriptor)>,
    pub resource_templates: Vec<(String, ResourceTemplateDescriptor)>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Errors
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("tool server not found: {0}")]
    ServerNotFound(String),

    #[error("tool server not connected: {0}")]
    NotConnected(String),

    #[error("tool not found: no tool named '{tool}' on server '{server}'")]
    ToolNotFound { server: String, tool: String },

    #[error("transport: {0}")]
    Transport(#[from] TransportError),

    #[error("discovery failed for {server}: {source}")]
    Discovery {
        server: String,
        #[source]
        source: TransportError,
    },
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Connection
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct Connection {
    config: ToolServerConfig,
    status: ConnectionStatus,
    last_error: Option<String>,
    connected_at: Option<DateTime<Utc>>,
    transport: Option<Arc<StdioTransport>>,
    tools: Vec<ToolDescriptor>,
    resources: Vec<ResourceDescriptor>,
    resource_templates: Vec<ResourceTemplateDescriptor>,
    /// Incarnation counter. A stale exit watcher (from before a stop or
    /// restart) compares against this and becomes a no-op.
    generation: u64,
}

impl Connection {
    fn connecting(config: ToolServerConfig, generation: u64) -> Self {
        Self {
            config,
            status: ConnectionStatus::Connecting,
            last_error: None,
            connected_at: None,
            transport: None,
            tools: Vec::new(),
            resources: Vec::new(),
            resource_templates: Vec::new(),
            generation,
        }
    }

    fn reset(&mut self) {
        self.status = ConnectionStatus::Disconnected;
        self.connected_at = None;
        self.transport = None;
        self.tools.clear();
        self.resources.clear();
        self.resource_templates.clear();
    }
}

type Discovered = (
    Vec<ToolDescriptor>,
    Vec<ResourceDescriptor>,
    Vec<ResourceTemplateDescriptor>,
);

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Supervisor
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Single owner of all tool-server connections.
///
/// Callers observe connection state only through these methods — never
/// by holding a connection reference across an await — so nobody acts
/// on a server that has since been stopped or has exited.
pub struct Supervisor {
    connections: Mutex<HashMap<String, Connection>>,
    events: broadcast::Sender<ServerEvent>,
    next_generation: AtomicU64,
    /// Handle to ourselves for the exit-watcher tasks. Weak, so a
    /// dropped supervisor is not kept alive by servers that have not
    /// exited yet.
    self_ref: Weak<Supervisor>,
}

impl Supervisor {
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new_cyclic(|self_ref| Self {
            connections: Mutex::new(HashMap::new()),
            events,
            next_generation: AtomicU64::new(1),
            self_ref: self_ref.clone(),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: ServerEvent) {
        let _ = self.events.send(event);
    }

    fn bump_generation(&self) -> u64 {
        self.next_generation.fetch_add(1, Ordering::Relaxed)
    }

    // ── Lifecycle ────────────────────────────────────────────────

    /// Stop everything currently tracked, then start one connection per
    /// enabled config. One server failing to start never prevents the
    /// others; failures are recorded and reported as `StartFailed`
    /// events inside [`start`](Self::start).
    pub async fn start_all(&self, configs: &HashMap<String, ToolServerConfig>) {
        self.stop_all().await;
        self.connections.lock().await.clear();

        for (name, config) in configs {
            if !config.enabled {
                tracing::debug!(server = %name, "tool server disabled, skipping");
                continue;
            }
            let _ = self.start(name, config).await;
        }
    }

    /// Stop every tracked connection.
    pub async fn stop_all(&self) {
        let tracked: Vec<String> = self.connections.lock().await.keys().cloned().collect();
        for name in tracked {
            self.stop(&name).await;
        }
    }

    /// Start one server: spawn the subprocess, run capability discovery,
    /// mark it Connected.
    ///
    /// On any failure the connection is left Disconnected with the error
    /// recorded, a `StartFailed` event is emitted, and the subprocess
    /// (if it got that far) is terminated.
    pub async fn start(&self, name: &str, config: &ToolServerConfig) -> Result<(), SupervisorError> {
        let generation = self.bump_generation();
        {
            let mut conns = self.connections.lock().await;
            conns.insert(
                name.to_string(),
                Connection::connecting(config.clone(), generation),
            );
        }
        tracing::info!(server = %name, command = %config.command, "starting tool server");

        match self.connect(name, config).await {
            Ok((transport, events, discovered)) => {
                let (tools, resources, resource_templates) = discovered;
                let counts = (tools.len(), resources.len(), resource_templates.len());
                let superseded = {
                    let mut conns = self.connections.lock().await;
                    match conns.get_mut(name) {
                        Some(conn) if conn.generation == generation => {
                            conn.status = ConnectionStatus::Connected;
                            conn.connected_at = Some(Utc::now());
                            conn.transport = Some(transport.clone());
                            conn.tools = tools;
                            conn.resources = resources;
                            conn.resource_templates = resource_templates;
                            conn.last_error = None;
                            false
                        }
                        // Stopped or replaced while we were connecting.
                        _ => true,
                    }
                };
                if superseded {
                    transport.shutdown().await;
                    return Ok(());
                }
                self.spawn_exit_watcher(name.to_string(), generation, events);
                tracing::info!(
                    server = %name,
                    tools = counts.0,
                    resources = counts.1,
                    templates = counts.2,
                    "tool server connected"
                );
                self.emit(ServerEvent::Connected {
                    server: name.to_string(),
                });
                Ok(())
            }
            Err(e) => {
                let msg = e.to_string();
                {
                    let mut conns = self.connections.lock().await;
                    if let Some(conn) = conns.get_mut(name) {
                        if conn.generation == generation {
                            conn.reset();
                            conn.last_error = Some(msg.clone());
                        }
                    }
                }
                tracing::warn!(server = %name, error = %msg, "failed to start tool server");
                self.emit(ServerEvent::StartFailed {
                    server: name.to_string(),
                    error: msg,
                });
                Err(e)
            }
        }
    }

    /// Stop a server and mark it Disconnected. Unknown names are a
    /// no-op.
    pub async fn stop(&self, name: &str) {
        let transport = {
            let mut conns = self.connections.lock().await;
            let Some(conn) = conns.get_mut(name) else {
                return;
            };
            // Invalidate the exit watcher of this incarnation.
            conn.generation = self.bump_generation();
            conn.transport.take()
        };
        if let Some(transport) = transport {
            transport.shutdown().await;
        }
        {
            let mut conns = self.connections.lock().await;
            if let Some(conn) = conns.get_mut(name) {
                conn.reset();
                conn.last_error = None;
            }
        }
        tracing::info!(server = %name, "stopped tool server");
        self.emit(ServerEvent::Disconnected {
            server: name.to_string(),
            error: None,
        });
    }

    /// Spawn + sequential discovery. The transport is torn down before
    /// an error is returned, so a failed start never leaks a process.
    async fn connect(
        &self,
        name: &str,
        config: &ToolServerConfig,
    ) -> Result<
        (
            Arc<StdioTransport>,
            mpsc::UnboundedReceiver<TransportEvent>,
            Discovered,
        ),
        SupervisorError,
    > {
        let (transport, events) = StdioTransport::spawn(name, config)?;
        match Self::discover(name, &transport).await {
            Ok(discovered) => Ok((transport, events, discovered)),
            Err(source) => {
                transport.shutdown().await;
                Err(SupervisorError::Discovery {
                    server: name.to_string(),
                    source,
                })
            }
        }
    }

    async fn discover(
        name: &str,
        transport: &StdioTransport,
    ) -> Result<Discovered, TransportError> {
        let tools: ListToolsResult =
            parse_result(transport.call(methods::LIST_TOOLS, None, None).await?)?;
        let resources: ListResourcesResult =
            parse_result(transport.call(methods::LIST_RESOURCES, None, None).await?)?;
        let templates: ListResourceTemplatesResult = parse_result(
            transport
                .call(methods::LIST_RESOURCE_TEMPLATES, None, None)
                .await?,
        )?;
        tracing::debug!(
            server = %name,
            tools = tools.tools.len(),
            resources = resources.resources.len(),
            templates = templates.resource_templates.len(),
            "capability discovery complete"
        );
        Ok((
            tools.tools,
            resources.resources,
            templates.resource_templates,
        ))
    }

    fn spawn_exit_watcher(
        &self,
        name: String,
        generation: u64,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
    ) {
        let supervisor = self.self_ref.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    TransportEvent::Exit { code } => {
                        if let Some(supervisor) = supervisor.upgrade() {
                            supervisor.handle_exit(&name, generation, code).await;
                        }
                        break;
                    }
                    TransportEvent::Notification(msg) => {
                        tracing::debug!(
                            server = %name,
                            method = ?msg.method,
                            "unsolicited notification from tool server"
                        );
                    }
                    // Already logged by the transport.
                    TransportEvent::Stderr(_) => {}
                }
            }
        });
    }

    /// The process died out from under us: mark the connection
    /// Disconnected regardless of its current state.
    async fn handle_exit(&self, name: &str, generation: u64, code: i32) {
        let error = {
            let mut conns = self.connections.lock().await;
            let Some(conn) = conns.get_mut(name) else {
                return;
            };
            if conn.generation != generation {
                return;
            }
            conn.reset();
            if conn.last_error.is_none() {
                conn.last_error = Some(format!("unexpectedly exited with code {code}"));
            }
            conn.last_error.clone()
        };
        tracing::warn!(server = %name, code, "tool server exited unexpectedly");
        self.emit(ServerEvent::Disconnected {
            server: name.to_string(),
            error,
        });
    }

    // ── Calls ────────────────────────────────────────────────────

    /// Call a tool on a connected server. The tool must be present in
    /// the server's discovered tool list.
    pub async fn call_tool(
        &self,
        server: &str,
        tool: &str,
        arguments: Value,
    ) -> Result<Value, SupervisorError> {
        let (transport, timeout) = self.connected_transport(server, Some(tool)).await?;
        let params = serde_json::json!({ "name": tool, "arguments": arguments });
        Ok(transport
            .call(methods::CALL_TOOL, Some(params), timeout)
            .await?)
    }

    /// Read a resource by URI. Unlike tools, membership in the
    /// discovered resource list is not checked — templates make it
    /// non-enumerable.
    pub async fn read_resource(&self, server: &str, uri: &str) -> Result<Value, SupervisorError> {
        let (transport, timeout) = self.connected_transport(server, None).await?;
        let params = serde_json::json!({ "uri": uri });
        Ok(transport
            .call(methods::READ_RESOURCE, Some(params), timeout)
            .await?)
    }

    async fn connected_transport(
        &self,
        server: &str,
        tool: Option<&str>,
    ) -> Result<(Arc<StdioTransport>, Option<Duration>), SupervisorError> {
        let conns = self.connections.lock().await;
        let conn = conns
            .get(server)
            .ok_or_else(|| SupervisorError::ServerNotFound(server.to_string()))?;
        if conn.status != ConnectionStatus::Connected {
            return Err(SupervisorError::NotConnected(server.to_string()));
        }
        let transport = conn
            .transport
            .clone()
            .ok_or_else(|| SupervisorError::NotConnected(server.to_string()))?;
        if let Some(tool) = tool {
            if !conn.tools.iter().any(|t| t.name == tool) {
                return Err(SupervisorError::ToolNotFound {
                    server: server.to_string(),
                    tool: tool.to_string(),
                });
            }
        }
        let timeout = conn.config.timeout_secs.map(Duration::from_secs);
        Ok((transport, timeout))
    }

    // ── Queries ──────────────────────────────────────────────────

    /// Aggregate capabilities across Connected servers only.
    pub async fn capabilities(&self) -> Capabilities {
        let conns = self.connections.lock().await;
        let mut caps = Capabilities::default();
        for (name, conn) in conns.iter() {
            if conn.status != ConnectionStatus::Connected {
                continue;
            }
            caps.tools
                .extend(conn.tools.iter().cloned().map(|t| (name.clone(), t)));
            caps.resources
                .extend(conn.resources.iter().cloned().map(|r| (name.clone(), r)));
            caps.resource_templates.extend(
                conn.resource_templates
                    .iter()
                    .cloned()
                    .map(|t| (name.clone(), t)),
            );
        }
        caps
    }

    /// Per-server status snapshot, sorted by name.
    pub async fn status(&self) -> Vec<ServerStatus> {
        let conns = self.connections.lock().await;
        let mut statuses: Vec<ServerStatus> = conns
            .iter()
            .map(|(name, conn)| ServerStatus {
                name: name.clone(),
                status: conn.status,
                error: conn.last_error.clone(),
                connected_at: conn.connected_at,
                tool_count: conn.tools.len(),
                resource_count: conn.resources.len(),
            })
            .collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }

    pub async fn connection_status(&self, name: &str) -> Option<ConnectionStatus> {
        self.connections.lock().await.get(name).map(|c| c.status)
    }

    pub async fn last_error(&self, name: &str) -> Option<String> {
        self.connections
            .lock()
            .await
            .get(name)
            .and_then(|c| c.last_error.clone())
    }

    /// Whether a tool is on the server's auto-approve list.
    pub async fn is_auto_approved(&self, server: &str, tool: &str) -> bool {
        self.connections
            .lock()
            .await
            .get(server)
            .map(|c| c.config.auto_approve.iter().any(|t| t == tool))
            .unwrap_or(false)
    }
}

fn parse_result<T: serde::de::DeserializeOwned>(value: Value) -> Result<T, TransportError> {
    serde_json::from_value(value).map_err(TransportError::Json)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn spawn_failure_leaves_disconnected_with_error() {
        let supervisor = Supervisor::new();
        let mut events = supervisor.subscribe();
        let config = ToolServerConfig::command("/nonexistent/tool-server-binary", &[]);

        let err = supervisor.start("broken", &config).await.unwrap_err();
        assert!(matches!(
            err,
            SupervisorError::Transport(TransportError::Io(_))
        ));
        assert_eq!(
            supervisor.connection_status("broken").await,
            Some(ConnectionStatus::Disconnected)
        );
        assert!(supervisor.last_error("broken").await.is_some());
        assert!(matches!(
            events.recv().await.unwrap(),
            ServerEvent::StartFailed { .. }
        ));
    }

    #[tokio::test]
    async fn discovery_failure_disconnects_and_records_error() {
        let supervisor = Supervisor::new();
        // Spawns fine, exits before answering discovery.
        let config = ToolServerConfig::command("sh", &["-c", "exit 0"]);

        let err = supervisor.start("mute", &config).await.unwrap_err();
        assert!(matches!(err, SupervisorError::Discovery { .. }));
        assert_eq!(
            supervisor.connection_status("mute").await,
            Some(ConnectionStatus::Disconnected)
        );
        let recorded = supervisor.last_error("mute").await.unwrap();
        assert!(recorded.contains("discovery failed"));
    }

    #[tokio::test]
    async fn call_tool_on_unknown_server() {
        let supervisor = Supervisor::new();
        let err = supervisor
            .call_tool("ghost", "anything", serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, SupervisorError::ServerNotFound(_)));
        assert!(err.to_string().contains("not found"));
    }

    #[tokio::test]
    async fn call_tool_on_disconnected_server() {
        let supervisor = Supervisor::new();
        let config = ToolServerConfig::command("/nonexistent/tool-server-binary", &[]);
        let _ = supervisor.start("down", &config).await;

        let err = supervisor
            .call_tool("down", "anything", serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, SupervisorError::NotConnected(_)));
        assert!(err.to_string().contains("not connected"));
        // The failed call leaves the connection state untouched.
        assert_eq!(
            supervisor.connection_status("down").await,
            Some(ConnectionStatus::Disconnected)
        );
    }

    #[tokio::test]
    async fn stop_unknown_server_is_a_noop() {
        let supervisor = Supervisor::new();
        let mut events = supervisor.subscribe();
        supervisor.stop("ghost").await;
        assert!(events.try_recv().is_err());
        assert!(supervisor.connection_status("ghost").await.is_none());
    }

    #[tokio::test]
    async fn start_all_skips_disabled_servers() {
        let supervisor = Supervisor::new();
        let mut disabled = ToolServerConfig::command("sh", &["-c", "exit 0"]);
        disabled.enabled = false;
        let mut configs = HashMap::new();
        configs.insert("off".to_string(), disabled);

        supervisor.start_all(&configs).await;
        assert!(supervisor.connection_status("off").await.is_none());
    }

    #[tokio::test]
    async fn auto_approve_consults_config() {
        let supervisor = Supervisor::new();
        let mut config = ToolServerConfig::command("/nonexistent/tool-server-binary", &[]);
        config.auto_approve.push("safe_tool".to_string());
        let _ = supervisor.start("srv", &config).await;

        assert!(supervisor.is_auto_approved("srv", "safe_tool").await);
        assert!(!supervisor.is_auto_approved("srv", "other_tool").await);
        assert!(!supervisor.is_auto_approved("ghost", "safe_tool").await);
    }
}
