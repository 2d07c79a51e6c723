//! MCP server facade
//!
//! Exposes the workflow engine as an MCP server. A `runas` config
//! declares the server info and the tool -> workflow mapping; the facade
//! serves stdio always and a Unix socket when `MCP_SOCKET_PATH` is set.
//! A `tools/call` carrying a `task` object is handed to the task manager
//! and answered immediately with a `CreateTaskResult`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{RunasConfig, RunasTool, ServerInfo};
use crate::mcp::jsonrpc::{
    Frame, Request, Response, INTERNAL_ERROR, INVALID_PARAMS, METHOD_NOT_FOUND, PARSE_ERROR,
    TASK_NOT_FOUND, TASK_NOT_READY,
};
use crate::mcp::PROTOCOL_VERSION;
use crate::tasks::{TaskError, TaskManager};
use crate::workflow::subst::value_to_string;
use crate::workflow::{Engine, Scope};

pub struct Facade {
    info: ServerInfo,
    tools: Vec<RunasTool>,
    engine: Arc<Engine>,
    tasks: Arc<TaskManager>,
    /// stdin payload forwarded into `input_mapping` as `input_data`
    input_data: Option<String>,
}

impl Facade {
    pub fn new(
        runas: &RunasConfig,
        engine: Arc<Engine>,
        tasks: Arc<TaskManager>,
        input_data: Option<String>,
    ) -> Self {
        Self {
            info: runas.server_info.clone(),
            tools: runas.tools.clone(),
            engine,
            tasks,
            input_data,
        }
    }

    /// Dispatch one request. Notifications produce no response.
    pub async fn handle(&self, request: Request) -> Option<Response> {
        let id = request.id.clone()?;
        let params = request.params.unwrap_or_else(|| json!({}));

        let response = match request.method.as_str() {
            "initialize" => Response::success(
                id,
                json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": {
                        "tools": {},
                        "tasks": {
                            "requests": {"tools/call": true},
                            "list": true,
                            "cancel": true,
                        },
                    },
                    "serverInfo": {
                        "name": self.info.name,
                        "version": self.info.version,
                    },
                }),
            ),
            "ping" => Response::success(id, json!({})),
            "tools/list" => Response::success(
                id,
                json!({
                    "tools": self
                        .tools
                        .iter()
                        .map(|t| {
                            json!({
                                "name": t.name,
                                "description": t.description,
                                "inputSchema": t.input_schema,
                            })
                        })
                        .collect::<Vec<_>>(),
                }),
            ),
            "tools/call" => self.handle_tool_call(id, params).await,
            "tasks/get" => match self.task_id(&params) {
                Ok(task_id) => match self.tasks.get(&task_id).await {
                    Ok(meta) => Response::success(id, meta.to_wire()),
                    Err(e) => task_error(id, e),
                },
                Err(message) => Response::failure(id, INVALID_PARAMS, message),
            },
            "tasks/result" => match self.task_id(&params) {
                Ok(task_id) => match self.tasks.wait_result(&task_id).await {
                    Ok(result) => Response::success(id, result),
                    Err(e) => task_error(id, e),
                },
                Err(message) => Response::failure(id, INVALID_PARAMS, message),
            },
            "tasks/list" => {
                let cursor = params["cursor"].as_str().map(str::to_string);
                let (page, next) = self.tasks.list(cursor.as_deref()).await;
                let mut result = json!({
                    "tasks": page.iter().map(|m| m.to_wire()).collect::<Vec<_>>(),
                });
                if let Some(next) = next {
                    result["nextCursor"] = json!(next);
                }
                Response::success(id, result)
            }
            "tasks/cancel" => match self.task_id(&params) {
                Ok(task_id) => match self.tasks.cancel(&task_id).await {
                    Ok(meta) => Response::success(id, meta.to_wire()),
                    Err(e) => task_error(id, e),
                },
                Err(message) => Response::failure(id, INVALID_PARAMS, message),
            },
            other => Response::failure(id, METHOD_NOT_FOUND, format!("unknown method '{}'", other)),
        };
        Some(response)
    }

    fn task_id(&self, params: &Value) -> Result<String, String> {
        params["taskId"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| "taskId is required".to_string())
    }

    /// Build the workflow's initial variables from the tool's
    /// `input_mapping`, substituting over `arguments.*` and `input_data`.
    fn initial_variables(&self, tool: &RunasTool, arguments: &Value) -> HashMap<String, Value> {
        let mut outputs = HashMap::new();
        outputs.insert("arguments".to_string(), arguments.clone());
        if let Some(input_data) = &self.input_data {
            outputs.insert("input_data".to_string(), Value::String(input_data.clone()));
        }
        let scope = Scope::child(HashMap::new(), outputs);

        let mut initial = HashMap::new();
        for (name, template) in &tool.input_mapping {
            match crate::workflow::subst::resolve_value(template, &scope, false) {
                Ok(value) => {
                    initial.insert(name.clone(), value);
                }
                Err(e) => warn!(variable = name, error = %e, "input mapping failed"),
            }
        }
        initial
    }

    async fn handle_tool_call(&self, id: Value, params: Value) -> Response {
        let name = match params["name"].as_str() {
            Some(n) => n,
            None => return Response::failure(id, INVALID_PARAMS, "tool name is required"),
        };
        let tool = match self.tools.iter().find(|t| t.name == name) {
            Some(t) => t.clone(),
            None => {
                return Response::failure(id, INVALID_PARAMS, format!("unknown tool '{}'", name))
            }
        };
        let arguments = params
            .get("arguments")
            .cloned()
            .unwrap_or_else(|| json!({}));
        let initial = self.initial_variables(&tool, &arguments);

        // Task-augmented call: hand off and answer immediately.
        if let Some(task) = params.get("task") {
            let ttl = task.get("ttl").and_then(Value::as_u64);
            let meta = self.tasks.create("tools/call", ttl).await;
            let token = match self.tasks.cancel_token(&meta.task_id).await {
                Ok(token) => token,
                Err(e) => return Response::failure(id, INTERNAL_ERROR, e.to_string()),
            };

            let engine = self.engine.clone();
            let tasks = self.tasks.clone();
            let task_id = meta.task_id.clone();
            let workflow = tool.workflow.clone();
            info!(task_id = %task_id, workflow = %workflow, "task-augmented tool call");

            tokio::spawn(async move {
                let outcome = engine
                    .run_with(&workflow, initial, arguments, &token, 0)
                    .await;
                let result = match outcome {
                    Ok(run) if run.success => {
                        tasks.set_result(&task_id, wrap_content(&run.result)).await
                    }
                    Ok(run) => {
                        let message = run
                            .failure
                            .map(|f| format!("step '{}': {}", f.step, f.message))
                            .unwrap_or_else(|| "workflow failed".to_string());
                        tasks.set_error(&task_id, message).await
                    }
                    Err(crate::workflow::WorkflowError::Cancelled) => {
                        tasks.set_cancelled(&task_id).await
                    }
                    Err(e) => tasks.set_error(&task_id, e.to_string()).await,
                };
                if let Err(e) = result {
                    error!(task_id = %task_id, error = %e, "failed to record task outcome");
                }
            });

            return Response::success(id, json!({"task": meta.to_wire()}));
        }

        // Synchronous call: run the workflow and wrap the result.
        let cancel = CancellationToken::new();
        match self
            .engine
            .run_with(&tool.workflow, initial, arguments, &cancel, 0)
            .await
        {
            Ok(run) if run.success => Response::success(id, wrap_content(&run.result)),
            Ok(run) => {
                let message = run
                    .failure
                    .map(|f| format!("step '{}': {}", f.step, f.message))
                    .unwrap_or_else(|| "workflow failed".to_string());
                Response::failure(id, INTERNAL_ERROR, message)
            }
            Err(e) => Response::failure(id, INTERNAL_ERROR, e.to_string()),
        }
    }
}

fn wrap_content(result: &Value) -> Value {
    json!({"content": [{"type": "text", "text": value_to_string(result)}]})
}

fn task_error(id: Value, error: TaskError) -> Response {
    let code = match &error {
        TaskError::NotFound(_) => TASK_NOT_FOUND,
        TaskError::NotTerminal(_) => TASK_NOT_READY,
        _ => INTERNAL_ERROR,
    };
    Response::failure(id, code, error.to_string())
}

/// Serve one connection: read newline-framed requests, dispatch each in
/// its own task so a blocking `tasks/result` does not stall the channel.
pub async fn run_connection<R, W>(
    facade: Arc<Facade>,
    read: R,
    write: W,
    cancel: CancellationToken,
) -> anyhow::Result<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let writer = Arc::new(Mutex::new(write));
    let mut reader = BufReader::new(read);
    let mut line = String::new();

    loop {
        line.clear();
        let read_count = tokio::select! {
            _ = cancel.cancelled() => break,
            result = reader.read_line(&mut line) => result?,
        };
        if read_count == 0 {
            break;
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let frame: Frame = match serde_json::from_str(trimmed) {
            Ok(frame) => frame,
            Err(e) => {
                let response = Response::failure(Value::Null, PARSE_ERROR, e.to_string());
                write_response(&writer, &response).await?;
                continue;
            }
        };
        let request = match frame.into_request() {
            Some(request) => request,
            None => {
                debug!("ignoring response frame on server channel");
                continue;
            }
        };

        let facade = facade.clone();
        let writer = writer.clone();
        tokio::spawn(async move {
            if let Some(response) = facade.handle(request).await {
                if let Err(e) = write_response(&writer, &response).await {
                    warn!(error = %e, "failed to write response");
                }
            }
        });
    }
    Ok(())
}

async fn write_response<W: AsyncWrite + Unpin>(
    writer: &Arc<Mutex<W>>,
    response: &Response,
) -> anyhow::Result<()> {
    let mut line = serde_json::to_string(response)?;
    line.push('\n');
    let mut writer = writer.lock().await;
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// Serve stdio, plus a Unix socket when `MCP_SOCKET_PATH` is set. A
/// relative socket path lands inside `socket_dir`.
pub async fn serve(
    facade: Arc<Facade>,
    socket_dir: PathBuf,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let socket_task = match std::env::var("MCP_SOCKET_PATH") {
        Ok(path) => {
            let path = PathBuf::from(path);
            let path = if path.is_absolute() {
                path
            } else {
                socket_dir.join(path)
            };
            let facade = facade.clone();
            let cancel = cancel.clone();
            Some(tokio::spawn(serve_socket(facade, path, cancel)))
        }
        Err(_) => None,
    };

    info!(server = %facade.info.name, "serving MCP on stdio");
    let result = run_connection(facade, tokio::io::stdin(), tokio::io::stdout(), cancel.clone()).await;

    cancel.cancel();
    if let Some(task) = socket_task {
        let _ = task.await;
    }
    result
}

async fn serve_socket(
    facade: Arc<Facade>,
    path: PathBuf,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir).await?;
        std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))?;
    }
    let _ = tokio::fs::remove_file(&path).await;

    let listener = tokio::net::UnixListener::bind(&path)?;
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))?;
    info!(socket = %path.display(), "serving MCP on unix socket");

    loop {
        let stream = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => stream,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    continue;
                }
            },
        };
        let (read, write) = stream.into_split();
        let facade = facade.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = run_connection(facade, read, write, cancel).await {
                warn!(error = %e, "socket connection error");
            }
        });
    }

    let _ = tokio::fs::remove_file(&path).await;
    Ok(())
}
