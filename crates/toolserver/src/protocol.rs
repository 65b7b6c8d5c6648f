//! Wire types for the tool-server protocol.
//!
//! Each message is a single line of JSON (newline-delimited). Requests
//! carry a string correlation id; responses echo it back. Messages
//! without an id are unsolicited notifications.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Protocol version carried in every envelope.
pub const PROTOCOL_VERSION: &str = "2.0";

/// Methods a tool server is expected to understand.
pub mod methods {
    pub const LIST_TOOLS: &str = "listTools";
    pub const LIST_RESOURCES: &str = "listResources";
    pub const LIST_RESOURCE_TEMPLATES: &str = "listResourceTemplates";
    pub const CALL_TOOL: &str = "callTool";
    pub const READ_RESOURCE: &str = "readResource";
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Envelopes
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// An outbound request envelope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WireRequest {
    pub protocol_version: String,
    pub id: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl WireRequest {
    pub fn new(id: impl Into<String>, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION.into(),
            id: id.into(),
            method: method.into(),
            params,
        }
    }
}

/// An inbound message: a response when `id` is present, otherwise an
/// unsolicited notification.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WireMessage {
    #[serde(default = "d_version")]
    pub protocol_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
}

fn d_version() -> String {
    PROTOCOL_VERSION.into()
}

/// The error object of an error response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WireError {
    pub code: i64,
    #[serde(default = "d_error_message")]
    pub message: String,
}

fn d_error_message() -> String {
    "unknown server error".into()
}

impl std::fmt::Display for WireError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "server error {}: {}", self.code, self.message)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Capability descriptors
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A tool definition returned by `listTools`. The schema is opaque —
/// it is passed through to the system prompt and calling code as-is.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<Value>,
}

/// A concrete resource returned by `listResources`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceDescriptor {
    pub uri: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

/// A parameterized resource family returned by `listResourceTemplates`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceTemplateDescriptor {
    pub uri_template: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

/// Result payload of `listTools`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListToolsResult {
    #[serde(default)]
    pub tools: Vec<ToolDescriptor>,
}

/// Result payload of `listResources`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListResourcesResult {
    #[serde(default)]
    pub resources: Vec<ResourceDescriptor>,
}

/// Result payload of `listResourceTemplates`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListResourceTemplatesResult {
    #[serde(default)]
    pub resource_templates: Vec<ResourceTemplateDescriptor>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialize_request() {
        let req = WireRequest::new("abc-123", methods::LIST_TOOLS, None);
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains(r#""protocolVersion":"2.0""#));
        assert!(json.contains(r#""id":"abc-123""#));
        assert!(json.contains(r#""method":"listTools""#));
        assert!(!json.contains("params"));
    }

    #[test]
    fn serialize_request_with_params() {
        let req = WireRequest::new(
            "r1",
            methods::CALL_TOOL,
            Some(serde_json::json!({ "name": "search", "arguments": { "q": "rust" } })),
        );
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains(r#""params":{"name":"search""#));
    }

    #[test]
    fn deserialize_success_response() {
        let raw = r#"{"protocolVersion":"2.0","id":"r1","result":{"tools":[]}}"#;
        let msg: WireMessage = serde_json::from_str(raw).unwrap();
        assert_eq!(msg.id.as_deref(), Some("r1"));
        assert!(msg.error.is_none());
        assert!(msg.result.unwrap().get("tools").is_some());
    }

    #[test]
    fn deserialize_error_response() {
        let raw = r#"{"protocolVersion":"2.0","id":"r1","error":{"code":-32601,"message":"no such method"}}"#;
        let msg: WireMessage = serde_json::from_str(raw).unwrap();
        let err = msg.error.unwrap();
        assert_eq!(err.code, -32601);
        assert_eq!(format!("{err}"), "server error -32601: no such method");
    }

    #[test]
    fn error_without_message_gets_generic_one() {
        let raw = r#"{"protocolVersion":"2.0","id":"r1","error":{"code":-1}}"#;
        let msg: WireMessage = serde_json::from_str(raw).unwrap();
        assert_eq!(msg.error.unwrap().message, "unknown server error");
    }

    #[test]
    fn message_without_id_is_a_notification() {
        let raw = r#"{"protocolVersion":"2.0","method":"log","params":{"level":"info"}}"#;
        let msg: WireMessage = serde_json::from_str(raw).unwrap();
        assert!(msg.id.is_none());
        assert_eq!(msg.method.as_deref(), Some("log"));
        assert_eq!(msg.params.unwrap()["level"], "info");
    }

    #[test]
    fn deserialize_tool_list() {
        let raw = r#"{
            "tools": [
                { "name": "search", "description": "Full-text search", "inputSchema": { "type": "object" } },
                { "name": "ping" }
            ]
        }"#;
        let result: ListToolsResult = serde_json::from_str(raw).unwrap();
        assert_eq!(result.tools.len(), 2);
        assert_eq!(result.tools[0].name, "search");
        assert!(result.tools[1].description.is_none());
        assert!(result.tools[1].input_schema.is_none());
    }

    #[test]
    fn empty_object_is_an_empty_list() {
        let result: ListResourcesResult = serde_json::from_str("{}").unwrap();
        assert!(result.resources.is_empty());
        let result: ListResourceTemplatesResult = serde_json::from_str("{}").unwrap();
        assert!(result.resource_templates.is_empty());
    }

    #[test]
    fn deserialize_resource_template() {
        let raw = r#"{
            "resourceTemplates": [
                { "uriTemplate": "notes://{id}", "name": "note", "mimeType": "text/markdown" }
            ]
        }"#;
        let result: ListResourceTemplatesResult = serde_json::from_str(raw).unwrap();
        assert_eq!(result.resource_templates[0].uri_template, "notes://{id}");
        assert_eq!(
            result.resource_templates[0].mime_type.as_deref(),
            Some("text/markdown")
        );
    }

    #[test]
    fn roundtrip_request() {
        let req = WireRequest::new("42", methods::READ_RESOURCE, Some(serde_json::json!({"uri": "notes://1"})));
        let json = serde_json::to_string(&req).unwrap();
        let parsed: WireRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(req, parsed);
    }
}
