//! MCP client host
//!
//! Maintains a registry of named MCP server connections, each a JSON-RPC
//! 2.0 channel to a child process over stdio or to a Unix socket.

pub mod connection;
pub mod jsonrpc;
pub mod pool;
pub mod transport;
mod types;

pub use connection::{McpConnection, PROTOCOL_VERSION};
pub use pool::McpPool;
pub use transport::Transport;
pub use types::{McpError, ToolDescriptor};
