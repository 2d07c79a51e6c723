//! JSON-RPC channel to one MCP server
//!
//! A single reader task parses newline-framed messages and routes
//! responses through an id -> one-shot-waiter map; writes are serialised
//! by an outbox mutex so concurrent callers can share the channel.
//! Abnormal EOF wakes every pending waiter with an error.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::Child;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::jsonrpc::{Frame, Request, Response};
use super::McpError;

type Waiter = oneshot::Sender<Response>;

#[derive(Default)]
struct Pending {
    waiters: HashMap<i64, Waiter>,
    closed: bool,
}

impl Pending {
    fn fail_all(&mut self) {
        self.closed = true;
        // Dropping the senders wakes every waiter with RecvError.
        self.waiters.clear();
    }
}

pub struct Transport {
    writer: Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
    pending: Arc<std::sync::Mutex<Pending>>,
    next_id: AtomicI64,
    child: Mutex<Option<Child>>,
    reader: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Transport {
    /// Channel over a spawned child's stdin/stdout. The transport owns
    /// the subprocess and terminates it on close.
    pub fn stdio(mut child: Child, server: &str) -> Result<Self, McpError> {
        let stdin = child.stdin.take().ok_or_else(|| {
            McpError::Transport(format!("server '{}' has no piped stdin", server))
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            McpError::Transport(format!("server '{}' has no piped stdout", server))
        })?;
        let mut transport = Self::from_io(stdout, stdin);
        transport.child = Mutex::new(Some(child));
        Ok(transport)
    }

    /// Channel over a connected Unix socket. Framing is identical.
    pub fn socket(stream: tokio::net::UnixStream) -> Self {
        let (read, write) = stream.into_split();
        Self::from_io(read, write)
    }

    /// Build from any read/write pair; tests use in-memory pipes.
    pub fn from_io(
        read: impl AsyncRead + Send + Unpin + 'static,
        write: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Self {
        let pending: Arc<std::sync::Mutex<Pending>> = Arc::default();
        let reader = spawn_reader(read, pending.clone());
        Self {
            writer: Mutex::new(Box::new(write)),
            pending,
            next_id: AtomicI64::new(1),
            child: Mutex::new(None),
            reader: std::sync::Mutex::new(Some(reader)),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.pending.lock().expect("pending poisoned").closed
    }

    async fn write_line(&self, payload: &impl serde::Serialize) -> Result<(), McpError> {
        let mut line = serde_json::to_string(payload)
            .map_err(|e| McpError::Protocol(e.to_string()))?;
        line.push('\n');
        let mut writer = self.writer.lock().await;
        writer
            .write_all(line.as_bytes())
            .await
            .map_err(|e| McpError::Transport(e.to_string()))?;
        writer
            .flush()
            .await
            .map_err(|e| McpError::Transport(e.to_string()))
    }

    /// Fire-and-forget notification.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), McpError> {
        self.write_line(&Request::notification(method, params)).await
    }

    /// Send a request and await its response. Cancellation and the
    /// deadline both abort the in-flight waiter with a typed error.
    pub async fn request(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Value, McpError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().expect("pending poisoned");
            if pending.closed {
                return Err(McpError::Transport("connection closed".to_string()));
            }
            pending.waiters.insert(id, tx);
        }

        if let Err(e) = self.write_line(&Request::call(id, method, params)).await {
            self.pending
                .lock()
                .expect("pending poisoned")
                .waiters
                .remove(&id);
            return Err(e);
        }

        let remove_waiter = || {
            self.pending
                .lock()
                .expect("pending poisoned")
                .waiters
                .remove(&id);
        };

        let response = tokio::select! {
            _ = cancel.cancelled() => {
                remove_waiter();
                return Err(McpError::Cancelled);
            }
            _ = tokio::time::sleep(timeout) => {
                remove_waiter();
                return Err(McpError::Timeout);
            }
            received = rx => match received {
                Ok(response) => response,
                Err(_) => return Err(McpError::Transport("connection closed".to_string())),
            },
        };

        if let Some(error) = response.error {
            return Err(McpError::Rpc {
                code: error.code,
                message: error.message,
            });
        }
        Ok(response.result.unwrap_or(Value::Null))
    }

    /// Graceful close: SIGTERM the subprocess, SIGKILL after the grace
    /// period. Safe to call more than once.
    pub async fn close(&self, grace: Duration) {
        if let Some(handle) = self.reader.lock().expect("reader poisoned").take() {
            handle.abort();
        }
        self.pending.lock().expect("pending poisoned").fail_all();

        let child = self.child.lock().await.take();
        if let Some(mut child) = child {
            if let Some(pid) = child.id() {
                // Do not rely on the child exiting when stdio closes.
                unsafe {
                    libc::kill(pid as libc::pid_t, libc::SIGTERM);
                }
            }
            match tokio::time::timeout(grace, child.wait()).await {
                Ok(Ok(status)) => debug!(?status, "MCP server exited"),
                Ok(Err(e)) => warn!(error = %e, "error waiting for MCP server"),
                Err(_) => {
                    warn!("MCP server ignored SIGTERM, killing");
                    let _ = child.kill().await;
                }
            }
        }
    }
}

fn spawn_reader(
    read: impl AsyncRead + Send + Unpin + 'static,
    pending: Arc<std::sync::Mutex<Pending>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut reader = BufReader::new(read);
        let mut line = String::new();
        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "MCP transport read error");
                    break;
                }
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            let frame: Frame = match serde_json::from_str(trimmed) {
                Ok(f) => f,
                Err(e) => {
                    warn!(error = %e, "dropping unparseable MCP frame");
                    continue;
                }
            };

            if frame.is_response() {
                let id = frame.id.as_ref().and_then(Value::as_i64);
                let response = frame.into_response().unwrap();
                let waiter = id.and_then(|id| {
                    pending.lock().expect("pending poisoned").waiters.remove(&id)
                });
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(response);
                    }
                    None => debug!(?id, "dropping response with no waiter"),
                }
            } else {
                // Server-initiated requests and notifications are not
                // part of the client contract; log and drop.
                debug!(method = ?frame.method, "ignoring server-initiated message");
            }
        }
        pending.lock().expect("pending poisoned").fail_all();
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::AsyncReadExt;

    /// A transport wired to an in-memory server loop that answers
    /// `double` requests with twice the sent number.
    fn doubling_server() -> Transport {
        let (client_side, server_side) = tokio::io::duplex(4096);
        let (server_read, server_write) = tokio::io::split(server_side);
        let (client_read, client_write) = tokio::io::split(client_side);

        tokio::spawn(async move {
            let mut reader = BufReader::new(server_read);
            let mut writer = server_write;
            let mut line = String::new();
            loop {
                line.clear();
                if reader.read_line(&mut line).await.unwrap_or(0) == 0 {
                    break;
                }
                let request: Request = serde_json::from_str(line.trim()).unwrap();
                let n = request.params.as_ref().unwrap()["n"].as_i64().unwrap();
                let response = Response::success(request.id.unwrap(), json!({"doubled": n * 2}));
                let mut out = serde_json::to_string(&response).unwrap();
                out.push('\n');
                writer.write_all(out.as_bytes()).await.unwrap();
            }
        });

        Transport::from_io(client_read, client_write)
    }

    #[tokio::test]
    async fn test_request_response_matching() {
        let transport = doubling_server();
        let cancel = CancellationToken::new();
        let result = transport
            .request("double", json!({"n": 21}), Duration::from_secs(5), &cancel)
            .await
            .unwrap();
        assert_eq!(result["doubled"], 42);
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_channel() {
        let transport = Arc::new(doubling_server());
        let cancel = CancellationToken::new();

        let mut handles = Vec::new();
        for n in 0..10i64 {
            let transport = transport.clone();
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                transport
                    .request("double", json!({"n": n}), Duration::from_secs(5), &cancel)
                    .await
                    .unwrap()["doubled"]
                    .as_i64()
                    .unwrap()
            }));
        }
        for (n, handle) in handles.into_iter().enumerate() {
            assert_eq!(handle.await.unwrap(), (n as i64) * 2);
        }
    }

    #[tokio::test]
    async fn test_eof_fails_pending_waiters() {
        let (client_side, server_side) = tokio::io::duplex(4096);
        let (client_read, client_write) = tokio::io::split(client_side);
        let transport = Transport::from_io(client_read, client_write);
        let cancel = CancellationToken::new();

        // Server reads the request then hangs up without answering.
        let handle = tokio::spawn(async move {
            let mut buf = vec![0u8; 1024];
            let (mut read, _write) = tokio::io::split(server_side);
            let _ = read.read(&mut buf).await;
            // both halves drop here
        });

        let err = transport
            .request("never", json!({}), Duration::from_secs(5), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::Transport(_)));
        handle.await.unwrap();
        assert!(transport.is_closed());
    }

    #[tokio::test]
    async fn test_cancellation_aborts_waiter() {
        let (client_side, _server_side) = tokio::io::duplex(4096);
        let (client_read, client_write) = tokio::io::split(client_side);
        let transport = Transport::from_io(client_read, client_write);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = transport
            .request("slow", json!({}), Duration::from_secs(5), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::Cancelled));
    }

    #[tokio::test]
    async fn test_rpc_error_surfaces() {
        let (client_side, server_side) = tokio::io::duplex(4096);
        let (server_read, server_write) = tokio::io::split(server_side);
        let (client_read, client_write) = tokio::io::split(client_side);

        tokio::spawn(async move {
            let mut reader = BufReader::new(server_read);
            let mut writer = server_write;
            let mut line = String::new();
            reader.read_line(&mut line).await.unwrap();
            let request: Request = serde_json::from_str(line.trim()).unwrap();
            let response = Response::failure(request.id.unwrap(), -32601, "no such method");
            let mut out = serde_json::to_string(&response).unwrap();
            out.push('\n');
            writer.write_all(out.as_bytes()).await.unwrap();
        });

        let transport = Transport::from_io(client_read, client_write);
        let err = transport
            .request("ghost", json!({}), Duration::from_secs(5), &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            McpError::Rpc { code, .. } => assert_eq!(code, -32601),
            other => panic!("expected Rpc error, got {:?}", other),
        }
    }
}
