//! MCP client host types

use serde_json::Value;

/// A tool harvested from a server at connection time. Identity is
/// `server x name`.
#[derive(Debug, Clone)]
pub struct ToolDescriptor {
    pub server: String,
    pub name: String,
    pub description: Option<String>,
    pub input_schema: Value,
}

#[derive(Debug, thiserror::Error)]
pub enum McpError {
    #[error("failed to spawn MCP server '{server}': {source}")]
    Spawn {
        server: String,
        #[source]
        source: std::io::Error,
    },

    #[error("socket for server '{server}' unavailable: {message}")]
    Socket { server: String, message: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("server error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("tool '{tool}' on '{server}' failed: {message}")]
    Tool {
        server: String,
        tool: String,
        message: String,
    },

    #[error("MCP server '{0}' is not declared")]
    UnknownServer(String),

    #[error("unknown tool '{tool}' on server '{server}'")]
    UnknownTool { server: String, tool: String },

    #[error("connection to '{0}' previously failed")]
    ConnectionFailed(String),

    #[error("tool call timed out")]
    Timeout,

    #[error("tool call cancelled")]
    Cancelled,
}
