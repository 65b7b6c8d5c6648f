//! Tool dispatch — resolves a finalized tool invocation to a local
//! handler or a tool-server call and renders the outcome as text.
//!
//! Dispatch never fails: unknown servers, disconnected servers,
//! missing tools, malformed arguments, and remote errors all come back
//! as descriptive result strings the model sees in-band, so the
//! conversation continues.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use tether_domain::block::ToolParams;
use tether_toolserver::Supervisor;

use crate::local::LocalToolset;

/// Invocation name for calling a tool on a configured tool server.
/// Parameters: `server_name`, `tool_name`, `arguments` (JSON object).
pub const USE_TOOL: &str = "use_tool";

/// Invocation name for reading a tool-server resource.
/// Parameters: `server_name`, `uri`.
pub const ACCESS_RESOURCE: &str = "access_resource";

/// Decides whether a remote tool call may proceed. Consulted only for
/// tools that are not on the server's auto-approve list.
#[async_trait]
pub trait ApprovalGate: Send + Sync {
    async fn approve(&self, server: &str, tool: &str, arguments: &Value) -> bool;
}

/// Default gate for headless embeddings: everything is approved.
pub struct AllowAll;

#[async_trait]
impl ApprovalGate for AllowAll {
    async fn approve(&self, _server: &str, _tool: &str, _arguments: &Value) -> bool {
        true
    }
}

/// Routes completed tool invocations.
pub struct Dispatcher {
    supervisor: Arc<Supervisor>,
    local: LocalToolset,
    approval: Arc<dyn ApprovalGate>,
}

impl Dispatcher {
    pub fn new(supervisor: Arc<Supervisor>, local: LocalToolset) -> Self {
        Self {
            supervisor,
            local,
            approval: Arc::new(AllowAll),
        }
    }

    pub fn with_approval_gate(mut self, gate: Arc<dyn ApprovalGate>) -> Self {
        self.approval = gate;
        self
    }

    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    /// Execute one completed tool invocation and return its result
    /// text.
    pub async fn dispatch(&self, name: &str, params: &ToolParams) -> String {
        match name {
            USE_TOOL => self.use_tool(params).await,
            ACCESS_RESOURCE => self.access_resource(params).await,
            _ => self.local_tool(name, params).await,
        }
    }

    async fn local_tool(&self, name: &str, params: &ToolParams) -> String {
        let Some(tool) = self.local.get(name) else {
            return format!("Unknown tool '{name}'.");
        };
        match tool.call(params).await {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!(tool = %name, error = %e, "local tool failed");
                format!("Error executing {name}: {e}")
            }
        }
    }

    async fn use_tool(&self, params: &ToolParams) -> String {
        let Some(server) = params.get("server_name") else {
            return missing_param(USE_TOOL, "server_name");
        };
        let Some(tool) = params.get("tool_name") else {
            return missing_param(USE_TOOL, "tool_name");
        };
        let arguments: Value = match params.get("arguments") {
            None | Some("") => Value::Object(Default::default()),
            Some(raw) => match serde_json::from_str(raw) {
                Ok(v) => v,
                Err(e) => return format!("Invalid JSON in arguments for {tool}: {e}"),
            },
        };

        if !self.supervisor.is_auto_approved(server, tool).await
            && !self.approval.approve(server, tool, &arguments).await
        {
            tracing::info!(server = %server, tool = %tool, "tool call denied by approval gate");
            return format!("The call to {tool} on server {server} was not approved.");
        }

        match self.supervisor.call_tool(server, tool, arguments).await {
            Ok(result) => render_result(result),
            Err(e) => {
                tracing::warn!(server = %server, tool = %tool, error = %e, "tool call failed");
                format!("Tool call failed: {e}")
            }
        }
    }

    async fn access_resource(&self, params: &ToolParams) -> String {
        let Some(server) = params.get("server_name") else {
            return missing_param(ACCESS_RESOURCE, "server_name");
        };
        let Some(uri) = params.get("uri") else {
            return missing_param(ACCESS_RESOURCE, "uri");
        };
        match self.supervisor.read_resource(server, uri).await {
            Ok(contents) => render_result(contents),
            Err(e) => {
                tracing::warn!(server = %server, uri = %uri, error = %e, "resource read failed");
                format!("Resource read failed: {e}")
            }
        }
    }
}

fn missing_param(tool: &str, param: &str) -> String {
    format!("Missing required parameter '{param}' for {tool}.")
}

/// Render a provider-defined result value as conversation text.
fn render_result(value: Value) -> String {
    match value {
        Value::String(s) => s,
        Value::Null => "(no result)".into(),
        other => serde_json::to_string_pretty(&other).unwrap_or_else(|_| other.to_string()),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
