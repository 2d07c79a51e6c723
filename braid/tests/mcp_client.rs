//! MCP client host against an in-process stub server
//!
//! The stub listens on a Unix socket; `MCP_NESTED=1` plus the per-server
//! socket variable steers the client host onto it, exercising the full
//! initialize / tools/list / tools/call path without a subprocess.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use braid::config::{
    AppConfig, InterfaceType, McpServerConfig, McpServerSettings, ProviderConfig,
    ProviderDescriptor, Settings,
};
use braid::llm::{
    CompletionRequest, CompletionResponse, EmbeddingRequest, EmbeddingResponse, LlmError,
    LlmProvider, ProviderSource, ToolCall, Usage,
};
use braid::mcp::McpPool;
use braid::workflow::{Engine, Workflow};

/// Serve a minimal MCP server with one `echo` tool on the socket.
fn spawn_stub_server(listener: UnixListener, tool_calls: Arc<AtomicU32>) {
    tokio::spawn(async move {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(_) => break,
            };
            let tool_calls = tool_calls.clone();
            tokio::spawn(async move {
                let (read, mut write) = stream.into_split();
                let mut reader = BufReader::new(read);
                let mut line = String::new();
                loop {
                    line.clear();
                    if reader.read_line(&mut line).await.unwrap_or(0) == 0 {
                        break;
                    }
                    let frame: Value = match serde_json::from_str(line.trim()) {
                        Ok(v) => v,
                        Err(_) => continue,
                    };
                    let id = frame.get("id").cloned();
                    let method = frame["method"].as_str().unwrap_or_default().to_string();
                    let id = match id {
                        Some(id) => id,
                        None => continue, // notification
                    };

                    let result = match method.as_str() {
                        "initialize" => json!({
                            "protocolVersion": "2024-11-05",
                            "capabilities": {"tools": {}},
                            "serverInfo": {"name": "stub", "version": "0.0.1"},
                        }),
                        "tools/list" => json!({
                            "tools": [{
                                "name": "echo",
                                "description": "echo text back",
                                "inputSchema": {
                                    "type": "object",
                                    "properties": {"text": {"type": "string"}},
                                },
                            }],
                        }),
                        "tools/call" => {
                            tool_calls.fetch_add(1, Ordering::SeqCst);
                            let text = frame["params"]["arguments"]["text"]
                                .as_str()
                                .unwrap_or("")
                                .to_string();
                            json!({
                                "content": [{"type": "text", "text": format!("echo: {}", text)}],
                                "isError": false,
                            })
                        }
                        _ => json!({}),
                    };

                    let response = json!({"jsonrpc": "2.0", "id": id, "result": result});
                    let mut out = response.to_string();
                    out.push('\n');
                    if write.write_all(out.as_bytes()).await.is_err() {
                        break;
                    }
                }
            });
        }
    });
}

/// Point the client host at the stub socket for `server_name`.
fn wire_socket(server_name: &str, dir: &tempfile::TempDir, tool_calls: Arc<AtomicU32>) -> McpServerConfig {
    let socket_path = dir.path().join(format!("{}.sock", server_name));
    let listener = UnixListener::bind(&socket_path).unwrap();
    spawn_stub_server(listener, tool_calls);

    std::env::set_var("MCP_NESTED", "1");
    std::env::set_var(
        format!("MCP_{}_SOCKET", server_name.to_uppercase()),
        &socket_path,
    );

    McpServerConfig {
        command: "unused-when-socket-is-set".to_string(),
        args: vec![],
        env: HashMap::new(),
        system_prompt: None,
        settings: McpServerSettings {
            max_tool_follow_up: Some(2),
            strict_mode: false,
        },
    }
}

#[tokio::test]
async fn connect_list_and_call_over_socket() {
    let dir = tempfile::tempdir().unwrap();
    let tool_calls = Arc::new(AtomicU32::new(0));
    let config = wire_socket("sockecho", &dir, tool_calls.clone());

    let mut configs = HashMap::new();
    configs.insert("sockecho".to_string(), config);
    let pool = McpPool::new(configs);

    let tools = pool.tools(&["sockecho".to_string()]).await.unwrap();
    assert_eq!(tools.len(), 1);
    assert_eq!(tools[0].name, "echo");
    assert_eq!(tools[0].server, "sockecho");

    let result = pool
        .call(
            "sockecho",
            "echo",
            json!({"text": "ping"}),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(result, "echo: ping");
    assert_eq!(tool_calls.load(Ordering::SeqCst), 1);

    // unknown tool on a known server
    let err = pool
        .call("sockecho", "ghost", json!({}), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("ghost"));

    pool.shutdown().await;
}

/// Provider stub that always asks for one echo tool call.
struct ToolHungryProvider {
    completions: AtomicU32,
}

#[async_trait]
impl LlmProvider for ToolHungryProvider {
    fn name(&self) -> &str {
        "hungry"
    }
    fn model(&self) -> &str {
        "hungry-model"
    }
    async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let n = self.completions.fetch_add(1, Ordering::SeqCst);
        Ok(CompletionResponse {
            id: format!("r{}", n),
            content: format!("round {}", n),
            tool_calls: vec![ToolCall {
                id: format!("call_{}", n),
                name: "echo".to_string(),
                arguments: json!({"text": format!("n{}", n)}),
                thought_signature: None,
            }],
            usage: Usage::default(),
        })
    }
    async fn stream(
        &self,
        request: CompletionRequest,
        _sink: mpsc::Sender<String>,
    ) -> Result<CompletionResponse, LlmError> {
        self.complete(request).await
    }
    async fn embed(&self, _request: EmbeddingRequest) -> Result<EmbeddingResponse, LlmError> {
        Err(LlmError::Configuration("none".to_string()))
    }
}

struct HungrySource {
    provider: Arc<ToolHungryProvider>,
}

impl ProviderSource for HungrySource {
    fn create(
        &self,
        _name: &str,
        _model: Option<&str>,
    ) -> Result<Arc<dyn LlmProvider>, LlmError> {
        Ok(self.provider.clone() as Arc<dyn LlmProvider>)
    }
}

/// Scenario: server-level max_tool_follow_up=2 bounds the loop to
/// exactly two rounds of tool invocation; the third provider response is
/// returned even though it still requests tool calls.
#[tokio::test]
async fn tool_call_loop_bounded_by_server_cap() {
    let dir = tempfile::tempdir().unwrap();
    let tool_calls = Arc::new(AtomicU32::new(0));
    let server_config = wire_socket("looptest", &dir, tool_calls.clone());

    let workflow: Workflow = serde_yaml::from_str(
        r#"
$schema: workflow/v2.0
name: toolish
context:
  provider: hungry
  servers: [looptest]
steps:
  - name: chat
    run: "go use tools"
"#,
    )
    .unwrap();

    let mut servers = HashMap::new();
    servers.insert("looptest".to_string(), server_config);
    let mut providers = HashMap::new();
    providers.insert(
        "hungry".to_string(),
        ProviderDescriptor {
            interface_type: InterfaceType::OllamaNative,
            provider_name: "hungry".to_string(),
            config: ProviderConfig::default(),
        },
    );
    let mut workflows = HashMap::new();
    workflows.insert("toolish".to_string(), workflow);

    let config = AppConfig {
        providers,
        servers,
        workflows,
        settings: Settings {
            default_provider: Some("hungry".to_string()),
            ..Default::default()
        },
        ..Default::default()
    };

    let provider = Arc::new(ToolHungryProvider {
        completions: AtomicU32::new(0),
    });
    let engine = Engine::builder(config)
        .providers(Arc::new(HungrySource {
            provider: provider.clone(),
        }))
        .build()
        .unwrap();

    let run = engine
        .run("toolish", Value::Null, &CancellationToken::new())
        .await
        .unwrap();

    assert!(run.success, "failure: {:?}", run.failure);
    // two rounds of tool execution, three provider calls
    assert_eq!(tool_calls.load(Ordering::SeqCst), 2);
    assert_eq!(provider.completions.load(Ordering::SeqCst), 3);
    // the last assistant message is returned verbatim
    assert_eq!(run.scope["chat"], json!("round 2"));

    engine.pool().shutdown().await;
}
