//! `tether-runtime` — the orchestration side of Tether.
//!
//! This crate provides:
//! - A [`Dispatcher`] that routes completed tool invocations to local
//!   handlers or to tool servers via the supervisor, converting every
//!   failure into in-band result text.
//! - The [`LocalTool`] seam with thin built-in file and command
//!   handlers ([`local`]).
//! - [`run_turn`] — the loop that feeds a model token stream through
//!   the streaming parser and enforces one tool per turn.

pub mod dispatcher;
pub mod local;
pub mod turn;

// Re-exports for convenience.
pub use dispatcher::{AllowAll, ApprovalGate, Dispatcher, ACCESS_RESOURCE, USE_TOOL};
pub use local::{LocalTool, LocalToolError, LocalToolset};
pub use turn::{run_turn, ToolResult, TurnOutcome, ONE_TOOL_PER_TURN};
