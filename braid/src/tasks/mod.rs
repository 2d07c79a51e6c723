//! Task manager (SEP-1686)
//!
//! In-memory task store behind a reader-writer lock. Each task carries a
//! watch-channel completion signal and a cancellation token; terminal
//! states are absorbing and a background sweeper reclaims expired
//! terminal tasks.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{watch, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Page size for `tasks/list`
const PAGE_SIZE: usize = 20;
/// Sweep interval for expired terminal tasks
const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);
/// Bounded wait used by `tasks/result`
const RESULT_WAIT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Working,
    Completed,
    Failed,
    Cancelled,
    InputRequired,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// The state machine: `working -> {completed, failed, cancelled,
    /// input_required}`, `input_required -> {working, cancelled}`,
    /// terminal states are absorbing.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        match self {
            TaskStatus::Working => matches!(
                next,
                TaskStatus::Completed
                    | TaskStatus::Failed
                    | TaskStatus::Cancelled
                    | TaskStatus::InputRequired
            ),
            TaskStatus::InputRequired => {
                matches!(next, TaskStatus::Working | TaskStatus::Cancelled)
            }
            _ => false,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Working => "working",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::InputRequired => "input_required",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone)]
pub struct TaskMeta {
    pub task_id: String,
    pub method: String,
    pub status: TaskStatus,
    pub status_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
    pub ttl_ms: u64,
    pub poll_interval_ms: u64,
}

impl TaskMeta {
    /// SEP-1686 wire shape.
    pub fn to_wire(&self) -> Value {
        json!({
            "taskId": self.task_id,
            "status": self.status.to_string(),
            "statusMessage": self.status_message,
            "createdAt": self.created_at.to_rfc3339(),
            "lastUpdatedAt": self.last_updated_at.to_rfc3339(),
            "ttl": self.ttl_ms,
            "pollInterval": self.poll_interval_ms,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("task not found: {0}")]
    NotFound(String),

    #[error("task {0} has not reached a terminal state")]
    NotTerminal(String),

    #[error("task failed: {0}")]
    Failed(String),

    #[error("task was cancelled")]
    Cancelled,
}

struct TaskEntry {
    meta: TaskMeta,
    outcome: Option<Result<Value, String>>,
    done: watch::Sender<bool>,
    cancel: CancellationToken,
}

pub struct TaskManager {
    tasks: RwLock<HashMap<String, TaskEntry>>,
    default_ttl_ms: u64,
    max_ttl_ms: u64,
    poll_interval_ms: u64,
}

impl TaskManager {
    pub fn new(default_ttl_ms: u64, max_ttl_ms: u64, poll_interval_ms: u64) -> Self {
        Self {
            tasks: RwLock::new(HashMap::new()),
            default_ttl_ms,
            max_ttl_ms,
            poll_interval_ms,
        }
    }

    /// Allocate a task in `working` state. A requested TTL is clamped to
    /// the `[default, max]` window; no request means the default.
    pub async fn create(&self, method: &str, requested_ttl_ms: Option<u64>) -> TaskMeta {
        let ttl_ms = requested_ttl_ms
            .map(|t| t.clamp(self.default_ttl_ms.min(self.max_ttl_ms), self.max_ttl_ms))
            .unwrap_or(self.default_ttl_ms);

        let now = Utc::now();
        let meta = TaskMeta {
            task_id: uuid::Uuid::new_v4().to_string(),
            method: method.to_string(),
            status: TaskStatus::Working,
            status_message: None,
            created_at: now,
            last_updated_at: now,
            ttl_ms,
            poll_interval_ms: self.poll_interval_ms,
        };

        let (done, _) = watch::channel(false);
        let entry = TaskEntry {
            meta: meta.clone(),
            outcome: None,
            done,
            cancel: CancellationToken::new(),
        };
        self.tasks.write().await.insert(meta.task_id.clone(), entry);
        info!(task_id = %meta.task_id, method, ttl_ms, "task created");
        meta
    }

    pub async fn get(&self, task_id: &str) -> Result<TaskMeta, TaskError> {
        self.tasks
            .read()
            .await
            .get(task_id)
            .map(|e| e.meta.clone())
            .ok_or_else(|| TaskError::NotFound(task_id.to_string()))
    }

    pub async fn cancel_token(&self, task_id: &str) -> Result<CancellationToken, TaskError> {
        self.tasks
            .read()
            .await
            .get(task_id)
            .map(|e| e.cancel.clone())
            .ok_or_else(|| TaskError::NotFound(task_id.to_string()))
    }

    async fn transition(
        &self,
        task_id: &str,
        next: TaskStatus,
        message: Option<String>,
        outcome: Option<Result<Value, String>>,
    ) -> Result<bool, TaskError> {
        let mut tasks = self.tasks.write().await;
        let entry = tasks
            .get_mut(task_id)
            .ok_or_else(|| TaskError::NotFound(task_id.to_string()))?;

        // Transitions out of a terminal state are idempotent no-ops.
        if !entry.meta.status.can_transition_to(next) {
            debug!(task_id, from = %entry.meta.status, to = %next, "ignoring transition");
            return Ok(false);
        }

        entry.meta.status = next;
        entry.meta.status_message = message;
        entry.meta.last_updated_at = Utc::now();
        if outcome.is_some() {
            entry.outcome = outcome;
        }
        if next.is_terminal() {
            // send_replace: the flag must stick even with no subscribers
            entry.done.send_replace(true);
        }
        Ok(true)
    }

    pub async fn set_result(&self, task_id: &str, result: Value) -> Result<bool, TaskError> {
        self.transition(task_id, TaskStatus::Completed, None, Some(Ok(result)))
            .await
    }

    pub async fn set_error(&self, task_id: &str, message: String) -> Result<bool, TaskError> {
        self.transition(
            task_id,
            TaskStatus::Failed,
            Some(message.clone()),
            Some(Err(message)),
        )
        .await
    }

    pub async fn set_cancelled(&self, task_id: &str) -> Result<bool, TaskError> {
        self.transition(
            task_id,
            TaskStatus::Cancelled,
            Some("cancelled".to_string()),
            None,
        )
        .await
    }

    /// `input_required` is declared unsupported: there is no resumption
    /// endpoint, so a pause request fails the task instead.
    pub async fn require_input(&self, task_id: &str, message: String) -> Result<bool, TaskError> {
        self.set_error(task_id, format!("input_required is not supported: {}", message))
            .await
    }

    /// Signal the running workflow's cancellation token. The status
    /// flips to `cancelled` once the runner observes the token; a
    /// terminal task is untouched and its current state is returned.
    pub async fn cancel(&self, task_id: &str) -> Result<TaskMeta, TaskError> {
        let (meta, token) = {
            let tasks = self.tasks.read().await;
            let entry = tasks
                .get(task_id)
                .ok_or_else(|| TaskError::NotFound(task_id.to_string()))?;
            (entry.meta.clone(), entry.cancel.clone())
        };

        if meta.status.is_terminal() {
            return Ok(meta);
        }
        token.cancel();
        self.get(task_id).await
    }

    /// Block until the task reaches a terminal state (bounded wait), then
    /// return the stored result or the failure.
    pub async fn wait_result(&self, task_id: &str) -> Result<Value, TaskError> {
        let mut done_rx = {
            let tasks = self.tasks.read().await;
            let entry = tasks
                .get(task_id)
                .ok_or_else(|| TaskError::NotFound(task_id.to_string()))?;
            if entry.meta.status.is_terminal() {
                return Self::outcome_of(entry);
            }
            entry.done.subscribe()
        };

        let wait = async {
            loop {
                if *done_rx.borrow() {
                    return;
                }
                if done_rx.changed().await.is_err() {
                    return;
                }
            }
        };
        if tokio::time::timeout(RESULT_WAIT, wait).await.is_err() {
            return Err(TaskError::NotTerminal(task_id.to_string()));
        }

        let tasks = self.tasks.read().await;
        let entry = tasks
            .get(task_id)
            .ok_or_else(|| TaskError::NotFound(task_id.to_string()))?;
        Self::outcome_of(entry)
    }

    fn outcome_of(entry: &TaskEntry) -> Result<Value, TaskError> {
        match entry.meta.status {
            TaskStatus::Completed => match &entry.outcome {
                Some(Ok(value)) => Ok(value.clone()),
                _ => Err(TaskError::Failed("result missing".to_string())),
            },
            TaskStatus::Failed => Err(TaskError::Failed(
                entry
                    .meta
                    .status_message
                    .clone()
                    .unwrap_or_else(|| "unknown failure".to_string()),
            )),
            TaskStatus::Cancelled => Err(TaskError::Cancelled),
            _ => Err(TaskError::NotTerminal(entry.meta.task_id.clone())),
        }
    }

    /// Paginated listing, oldest first. The cursor is an opaque offset.
    pub async fn list(&self, cursor: Option<&str>) -> (Vec<TaskMeta>, Option<String>) {
        let offset: usize = cursor.and_then(|c| c.parse().ok()).unwrap_or(0);

        let tasks = self.tasks.read().await;
        let mut metas: Vec<TaskMeta> = tasks.values().map(|e| e.meta.clone()).collect();
        metas.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.task_id.cmp(&b.task_id)));

        let page: Vec<TaskMeta> = metas.iter().skip(offset).take(PAGE_SIZE).cloned().collect();
        let next = if offset + page.len() < metas.len() {
            Some((offset + page.len()).to_string())
        } else {
            None
        };
        (page, next)
    }

    /// Remove terminal tasks whose TTL elapsed.
    pub async fn sweep(&self) -> usize {
        let now = Utc::now();
        let mut tasks = self.tasks.write().await;
        let before = tasks.len();
        tasks.retain(|_, entry| {
            if !entry.meta.status.is_terminal() {
                return true;
            }
            let expiry = entry.meta.last_updated_at
                + chrono::Duration::milliseconds(entry.meta.ttl_ms as i64);
            expiry > now
        });
        let removed = before - tasks.len();
        if removed > 0 {
            debug!(removed, "swept expired tasks");
        }
        removed
    }

    /// Background sweeper on a fixed interval.
    pub fn spawn_cleanup(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(CLEANUP_INTERVAL);
            loop {
                interval.tick().await;
                manager.sweep().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> TaskManager {
        TaskManager::new(1_000, 10_000, 100)
    }

    #[tokio::test]
    async fn test_ttl_clamped() {
        let m = manager();
        assert_eq!(m.create("tools/call", None).await.ttl_ms, 1_000);
        assert_eq!(m.create("tools/call", Some(500)).await.ttl_ms, 1_000);
        assert_eq!(m.create("tools/call", Some(5_000)).await.ttl_ms, 5_000);
        assert_eq!(m.create("tools/call", Some(99_999)).await.ttl_ms, 10_000);
    }

    #[tokio::test]
    async fn test_terminal_states_absorbing() {
        let m = manager();
        let meta = m.create("tools/call", None).await;

        assert!(m.set_result(&meta.task_id, json!("done")).await.unwrap());
        // idempotent no-ops after terminal
        assert!(!m.set_error(&meta.task_id, "late".to_string()).await.unwrap());
        assert!(!m.set_cancelled(&meta.task_id).await.unwrap());

        let current = m.get(&meta.task_id).await.unwrap();
        assert_eq!(current.status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn test_wait_result_blocks_until_done() {
        let m = Arc::new(manager());
        let meta = m.create("tools/call", None).await;

        let waiter = {
            let m = m.clone();
            let id = meta.task_id.clone();
            tokio::spawn(async move { m.wait_result(&id).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        m.set_result(&meta.task_id, json!({"ok": true})).await.unwrap();

        let result = waiter.await.unwrap().unwrap();
        assert_eq!(result["ok"], true);
    }

    #[tokio::test]
    async fn test_cancel_terminal_is_noop() {
        let m = manager();
        let meta = m.create("tools/call", None).await;
        m.set_result(&meta.task_id, json!(1)).await.unwrap();

        let after = m.cancel(&meta.task_id).await.unwrap();
        assert_eq!(after.status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn test_cancel_signals_token() {
        let m = manager();
        let meta = m.create("tools/call", None).await;
        let token = m.cancel_token(&meta.task_id).await.unwrap();
        assert!(!token.is_cancelled());

        m.cancel(&meta.task_id).await.unwrap();
        assert!(token.is_cancelled());
        // still working until the runner observes the signal
        assert_eq!(m.get(&meta.task_id).await.unwrap().status, TaskStatus::Working);

        m.set_cancelled(&meta.task_id).await.unwrap();
        assert_eq!(
            m.get(&meta.task_id).await.unwrap().status,
            TaskStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn test_sweep_removes_expired_terminal() {
        let m = TaskManager::new(0, 10, 100);
        let done = m.create("tools/call", None).await;
        let live = m.create("tools/call", None).await;
        m.set_result(&done.task_id, json!(1)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        let removed = m.sweep().await;
        assert_eq!(removed, 1);
        assert!(m.get(&done.task_id).await.is_err());
        assert!(m.get(&live.task_id).await.is_ok());
    }

    #[tokio::test]
    async fn test_pagination() {
        let m = manager();
        for _ in 0..45 {
            m.create("tools/call", None).await;
        }

        let (page1, cursor1) = m.list(None).await;
        assert_eq!(page1.len(), 20);
        let (page2, cursor2) = m.list(cursor1.as_deref()).await;
        assert_eq!(page2.len(), 20);
        let (page3, cursor3) = m.list(cursor2.as_deref()).await;
        assert_eq!(page3.len(), 5);
        assert!(cursor3.is_none());

        // no overlap between pages
        let mut seen = std::collections::HashSet::new();
        for meta in page1.iter().chain(&page2).chain(&page3) {
            assert!(seen.insert(meta.task_id.clone()));
        }
    }

    #[tokio::test]
    async fn test_get_idempotent() {
        let m = manager();
        let meta = m.create("tools/call", None).await;
        let a = m.get(&meta.task_id).await.unwrap();
        let b = m.get(&meta.task_id).await.unwrap();
        assert_eq!(a.status, b.status);
        assert_eq!(a.created_at, b.created_at);
        assert_eq!(a.ttl_ms, b.ttl_ms);
    }
}
