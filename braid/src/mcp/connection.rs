//! One MCP server connection
//!
//! Transport selection: when `MCP_NESTED=1` and `MCP_<SERVER>_SOCKET`
//! points at an existing Unix socket the connection goes over the
//! socket; otherwise the configured command is spawned and the channel
//! runs over its stdin/stdout. The handshake is `initialize` ->
//! capabilities -> `tools/list`, with the tool descriptors cached for
//! the connection's lifetime.

use std::process::Stdio;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::McpServerConfig;

use super::transport::Transport;
use super::{McpError, ToolDescriptor};

pub const PROTOCOL_VERSION: &str = "2024-11-05";

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

pub struct McpConnection {
    pub name: String,
    transport: Transport,
    tools: Vec<ToolDescriptor>,
    /// Server advertised `tasks.requests["tools/call"]`
    pub supports_tasks: bool,
    pub system_prompt: Option<String>,
    pub max_tool_follow_up: Option<u32>,
    strict_mode: bool,
}

impl std::fmt::Debug for McpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpConnection")
            .field("name", &self.name)
            .field("tools", &self.tools)
            .field("supports_tasks", &self.supports_tasks)
            .field("system_prompt", &self.system_prompt)
            .field("max_tool_follow_up", &self.max_tool_follow_up)
            .field("strict_mode", &self.strict_mode)
            .finish()
    }
}

impl McpConnection {
    /// Spawn or attach to the server and complete the handshake.
    pub async fn connect(name: &str, config: &McpServerConfig) -> Result<Self, McpError> {
        let transport = open_transport(name, config).await?;

        let init = transport
            .request(
                "initialize",
                json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": {},
                    "clientInfo": {
                        "name": "braid",
                        "version": env!("CARGO_PKG_VERSION"),
                    },
                }),
                HANDSHAKE_TIMEOUT,
                &CancellationToken::new(),
            )
            .await?;

        let supports_tasks = init["capabilities"]["tasks"]["requests"]["tools/call"]
            .as_bool()
            .unwrap_or(false);
        transport.notify("notifications/initialized", None).await?;

        let listed = transport
            .request("tools/list", json!({}), HANDSHAKE_TIMEOUT, &CancellationToken::new())
            .await?;
        let tools = parse_tools(name, &listed)?;
        info!(server = name, tools = tools.len(), supports_tasks, "MCP server connected");

        Ok(Self {
            name: name.to_string(),
            transport,
            tools,
            supports_tasks,
            system_prompt: config.system_prompt.clone(),
            max_tool_follow_up: config.settings.max_tool_follow_up,
            strict_mode: config.settings.strict_mode,
        })
    }

    pub fn tools(&self) -> &[ToolDescriptor] {
        &self.tools
    }

    pub fn is_closed(&self) -> bool {
        self.transport.is_closed()
    }

    /// Invoke a tool and return its textual payload.
    pub async fn call_tool(
        &self,
        tool: &str,
        arguments: Value,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<String, McpError> {
        let descriptor = self
            .tools
            .iter()
            .find(|t| t.name == tool)
            .ok_or_else(|| McpError::UnknownTool {
                server: self.name.clone(),
                tool: tool.to_string(),
            })?;

        if self.strict_mode && !arguments.is_object() && !arguments.is_null() {
            return Err(McpError::Tool {
                server: self.name.clone(),
                tool: tool.to_string(),
                message: "arguments must be an object".to_string(),
            });
        }
        debug!(server = %self.name, tool, "calling tool");

        let result = self
            .transport
            .request(
                "tools/call",
                json!({"name": descriptor.name, "arguments": arguments}),
                timeout,
                cancel,
            )
            .await?;

        let text = collect_text(&result);
        if result["isError"].as_bool().unwrap_or(false) {
            return Err(McpError::Tool {
                server: self.name.clone(),
                tool: tool.to_string(),
                message: text,
            });
        }
        Ok(text)
    }

    pub async fn close(&self) {
        self.transport.close(SHUTDOWN_GRACE).await;
    }
}

async fn open_transport(name: &str, config: &McpServerConfig) -> Result<Transport, McpError> {
    let socket_var = format!(
        "MCP_{}_SOCKET",
        name.to_uppercase().replace(|c: char| !c.is_alphanumeric(), "_")
    );
    let nested = std::env::var("MCP_NESTED").map(|v| v == "1").unwrap_or(false);

    if nested {
        if let Ok(path) = std::env::var(&socket_var) {
            let path = std::path::PathBuf::from(path);
            if path.exists() {
                debug!(server = name, socket = %path.display(), "connecting over unix socket");
                let stream = tokio::net::UnixStream::connect(&path).await.map_err(|e| {
                    McpError::Socket {
                        server: name.to_string(),
                        message: e.to_string(),
                    }
                })?;
                return Ok(Transport::socket(stream));
            }
        }
    }

    debug!(server = name, command = %config.command, "spawning MCP server");
    let mut cmd = Command::new(&config.command);
    cmd.args(&config.args)
        .envs(&config.env)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true);

    let child = cmd.spawn().map_err(|source| McpError::Spawn {
        server: name.to_string(),
        source,
    })?;
    Transport::stdio(child, name)
}

fn parse_tools(server: &str, listed: &Value) -> Result<Vec<ToolDescriptor>, McpError> {
    let tools = listed["tools"]
        .as_array()
        .ok_or_else(|| McpError::Protocol("tools/list returned no tools array".to_string()))?;

    Ok(tools
        .iter()
        .map(|t| ToolDescriptor {
            server: server.to_string(),
            name: t["name"].as_str().unwrap_or_default().to_string(),
            description: t["description"].as_str().map(str::to_string),
            input_schema: t
                .get("inputSchema")
                .cloned()
                .unwrap_or_else(|| json!({"type": "object", "properties": {}})),
        })
        .collect())
}

fn collect_text(result: &Value) -> String {
    let mut out = String::new();
    if let Some(content) = result["content"].as_array() {
        for block in content {
            if block["type"].as_str() == Some("text") {
                if let Some(text) = block["text"].as_str() {
                    if !out.is_empty() {
                        out.push('\n');
                    }
                    out.push_str(text);
                }
            }
        }
    }
    out
}
