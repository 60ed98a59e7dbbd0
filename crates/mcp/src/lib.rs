//! Remote tool servers for tern over the Model Context Protocol.
//!
//! - **types**: JSON-RPC 2.0 and MCP wire types
//! - **transport**: server-side line framing (stdio, in-memory)
//! - **channel**: client-side request/response correlation over byte
//!   streams and streamable HTTP
//! - **client**: handshake, paged discovery, and the `McpTool` adapter
//! - **source**: `McpToolSource`, one configured server as a tool source
//! - **server**: a `ToolRegistry` served over MCP
//! - **plugin**: plugin manifests that declare MCP servers

pub mod channel;
pub mod client;
pub mod error;
pub mod plugin;
pub mod server;
pub mod source;
pub mod transport;
pub mod types;

pub use channel::{HttpChannel, RpcChannel, StreamChannel};
pub use client::{McpClient, McpTool};
pub use error::McpError;
pub use plugin::{discover_plugins, PluginManifest};
pub use server::McpServer;
pub use source::{McpServerConfig, McpToolSource, McpTransportConfig};
pub use transport::{LineTransport, McpTransport, StdioTransport};
