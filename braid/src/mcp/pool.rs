//! MCP connection pool
//!
//! Registry of named server connections. Servers are spawned lazily on
//! first reference and kept alive until the pool is torn down; a
//! connection that dies is marked failed and later references are
//! errors (no automatic respawn inside a run).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::McpServerConfig;
use crate::llm::ToolRouter;

use super::connection::McpConnection;
use super::{McpError, ToolDescriptor};

const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(60);

pub struct McpPool {
    configs: HashMap<String, McpServerConfig>,
    connections: Mutex<HashMap<String, Arc<McpConnection>>>,
    failed: Mutex<HashSet<String>>,
    call_timeout: Duration,
}

impl McpPool {
    pub fn new(configs: HashMap<String, McpServerConfig>) -> Self {
        Self {
            configs,
            connections: Mutex::new(HashMap::new()),
            failed: Mutex::new(HashSet::new()),
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    pub fn server_names(&self) -> Vec<String> {
        self.configs.keys().cloned().collect()
    }

    /// Get or lazily establish the named connection.
    pub async fn connection(&self, name: &str) -> Result<Arc<McpConnection>, McpError> {
        let config = self
            .configs
            .get(name)
            .ok_or_else(|| McpError::UnknownServer(name.to_string()))?;

        if self.failed.lock().await.contains(name) {
            return Err(McpError::ConnectionFailed(name.to_string()));
        }

        let mut connections = self.connections.lock().await;
        if let Some(connection) = connections.get(name) {
            if connection.is_closed() {
                warn!(server = name, "connection lost, marking failed");
                connections.remove(name);
                self.failed.lock().await.insert(name.to_string());
                return Err(McpError::ConnectionFailed(name.to_string()));
            }
            return Ok(connection.clone());
        }

        match McpConnection::connect(name, config).await {
            Ok(connection) => {
                let connection = Arc::new(connection);
                connections.insert(name.to_string(), connection.clone());
                Ok(connection)
            }
            Err(e) => {
                self.failed.lock().await.insert(name.to_string());
                Err(e)
            }
        }
    }

    /// Tool descriptors across the given servers, connecting as needed.
    pub async fn tools(&self, servers: &[String]) -> Result<Vec<ToolDescriptor>, McpError> {
        let mut all = Vec::new();
        for server in servers {
            let connection = self.connection(server).await?;
            all.extend(connection.tools().iter().cloned());
        }
        Ok(all)
    }

    /// System prompts contributed by the given servers.
    pub async fn system_prompts(&self, servers: &[String]) -> Vec<String> {
        let mut prompts = Vec::new();
        for server in servers {
            if let Ok(connection) = self.connection(server).await {
                if let Some(prompt) = &connection.system_prompt {
                    prompts.push(prompt.clone());
                }
            }
        }
        prompts
    }

    /// Server-level tool-follow-up cap: the tightest cap across the
    /// attached servers, if any sets one.
    pub async fn max_tool_follow_up(&self, servers: &[String]) -> Option<u32> {
        let mut cap: Option<u32> = None;
        for server in servers {
            if let Ok(connection) = self.connection(server).await {
                if let Some(limit) = connection.max_tool_follow_up {
                    cap = Some(cap.map_or(limit, |c| c.min(limit)));
                }
            }
        }
        cap
    }

    pub async fn call(
        &self,
        server: &str,
        tool: &str,
        arguments: Value,
        cancel: &CancellationToken,
    ) -> Result<String, McpError> {
        let connection = self.connection(server).await?;
        let result = connection
            .call_tool(tool, arguments, self.call_timeout, cancel)
            .await;

        if let Err(McpError::Transport(_)) = &result {
            warn!(server, "transport failure, marking connection failed");
            self.failed.lock().await.insert(server.to_string());
            self.connections.lock().await.remove(server);
        }
        result
    }

    /// Tear down every live connection.
    pub async fn shutdown(&self) {
        let connections: Vec<Arc<McpConnection>> =
            self.connections.lock().await.drain().map(|(_, c)| c).collect();
        for connection in connections {
            info!(server = %connection.name, "shutting down MCP server");
            connection.close().await;
        }
    }
}

#[async_trait]
impl ToolRouter for McpPool {
    async fn call(&self, server: &str, tool: &str, arguments: Value) -> anyhow::Result<String> {
        McpPool::call(self, server, tool, arguments, &CancellationToken::new())
            .await
            .map_err(Into::into)
    }
}
