//! MCP aggregation layer.
//!
//! Komorebi speaks Model-Context-Protocol to a set of declaratively
//! configured tool servers, each a child process driven over
//! newline-delimited JSON-RPC 2.0 on stdin/stdout:
//!
//! - [`config`] — servers file parsing and secret resolution
//! - [`client`] — one subprocess session: spawn, handshake, calls, close
//! - [`registry`] — parallel startup and the live session map
//! - [`service`] — tool flattening and tool-result → chunk capture

pub mod client;
pub mod config;
pub mod registry;
pub mod service;

pub use client::{McpClient, SessionState, ToolDescriptor};
pub use config::{load_servers, McpServerConfig};
pub use registry::McpRegistry;
pub use service::{McpService, ToolCallOutcome};
