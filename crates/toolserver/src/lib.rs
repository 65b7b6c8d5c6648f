//! `tether-toolserver` — client side of the tool-server protocol.
//!
//! This crate provides:
//! - Wire types for the line-delimited JSON protocol spoken with tool
//!   servers ([`protocol`]).
//! - A stdio transport that spawns a child process and correlates
//!   overlapping requests to responses by id ([`transport`]).
//! - A [`Supervisor`] that owns many server connections, runs
//!   capability discovery after spawn, and contains each server's
//!   failures to that server ([`supervisor`]).
//!
//! # Usage
//!
//! ```rust,ignore
//! use tether_toolserver::Supervisor;
//!
//! let supervisor = Supervisor::new();
//! supervisor.start_all(&store.load()?).await;
//!
//! for (server, tool) in supervisor.capabilities().await.tools {
//!     println!("{server}: {}", tool.name);
//! }
//!
//! let result = supervisor
//!     .call_tool("search", "query", serde_json::json!({"q": "lifetimes"}))
//!     .await?;
//! ```

pub mod protocol;
pub mod supervisor;
pub mod transport;

// Re-exports for convenience.
pub use protocol::{ResourceDescriptor, ResourceTemplateDescriptor, ToolDescriptor};
pub use supervisor::{
    Capabilities, ConnectionStatus, ServerEvent, ServerStatus, Supervisor, SupervisorError,
};
pub use transport::{StdioTransport, TransportError, TransportEvent};
