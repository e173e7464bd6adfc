//! Session registry and the four operations callers interact with:
//! run, status, send_input, and list.
//!
//! The registry mutex is held only for insert, lookup, and eviction. Every
//! operation that touches a child runs on a cloned `Arc<CommandSession>`
//! outside the registry lock, so a slow drain never blocks other sessions.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio::time::{Instant, sleep};

use crate::backend::{SpawnBackend, create_backend};
use crate::config::ManagerConfig;
use crate::error::ExecError;
use crate::session::{CommandSession, CommandStatus};

/// Upper bound on any timeout or wait window.
pub const MAX_WAIT: Duration = Duration::from_secs(10);

/// Drain slice while waiting for a command inside run/status.
const WAIT_SLICE: Duration = Duration::from_millis(100);

/// Quick per-session drain during list.
const LIST_DRAIN: Duration = Duration::from_millis(20);

/// Cap on how long send_input pauses before collecting the response.
const INPUT_SETTLE: Duration = Duration::from_millis(500);

/// Lines included in a run result.
const RUN_OUTPUT_LINES: usize = 100;

/// Lines included in a send_input snapshot.
const INPUT_OUTPUT_LINES: usize = 50;

/// Result of a run: the session id plus a snapshot of where it got to
/// within the timeout window.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub command_id: String,
    pub status: CommandStatus,
    pub output: String,
    pub exit_code: Option<i32>,
}

/// Point-in-time view of an existing session.
#[derive(Debug, Clone)]
pub struct StatusSnapshot {
    pub status: CommandStatus,
    pub output: String,
    pub exit_code: Option<i32>,
}

/// One row of a list result.
#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub command_id: String,
    pub status: CommandStatus,
    pub output_lines: usize,
    pub exit_code: Option<i32>,
    pub started_at: DateTime<Utc>,
}

/// What send_input should do to the session.
#[derive(Debug, Clone)]
pub enum InputAction {
    /// Write the text to the child's stdin verbatim
    Text(String),
    /// Stop the child and close the session's descriptor
    Terminate,
}

pub struct CommandManager {
    config: ManagerConfig,
    backend: Box<dyn SpawnBackend>,
    sessions: Mutex<HashMap<String, Arc<CommandSession>>>,
    counter: AtomicU64,
}

impl CommandManager {
    pub fn new(config: ManagerConfig) -> Self {
        let backend = create_backend(&config);
        Self::with_backend(config, backend)
    }

    /// Construct with an explicit backend, mainly for tests.
    pub fn with_backend(config: ManagerConfig, backend: Box<dyn SpawnBackend>) -> Self {
        Self {
            config,
            backend,
            sessions: Mutex::new(HashMap::new()),
            counter: AtomicU64::new(0),
        }
    }

    /// Spawn `command` and wait up to `timeout` for it to finish. Returns a
    /// running result with the session id if it does not; the session keeps
    /// producing in the background and can be polled later.
    pub async fn run(
        &self,
        command: &str,
        cwd: Option<&str>,
        timeout: Duration,
    ) -> Result<RunOutcome, ExecError> {
        let timeout = timeout.min(MAX_WAIT);
        self.evict_done().await;

        let cwd = cwd.map(resolve_cwd).transpose()?;
        let child = self.backend.spawn(command, cwd.as_deref())?;

        let seq = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        let id = format!("cmd_{seq}");
        let session = Arc::new(CommandSession::new(id.clone(), seq, child, &self.config));
        self.sessions
            .lock()
            .await
            .insert(id.clone(), Arc::clone(&session));
        tracing::info!(id = %id, command, "command session started");

        wait_while_running(&session, Instant::now() + timeout).await;

        // recent_output takes one more short drain to catch bytes that raced
        // the exit, then reaps.
        let lines = session.recent_output(RUN_OUTPUT_LINES).await;
        let status = session.status();
        let exit_code = session.exit_code();
        if status == CommandStatus::Done {
            session.close_controller();
            self.evict_done().await;
        }

        Ok(RunOutcome {
            command_id: id,
            status,
            output: lines.join("\n"),
            exit_code,
        })
    }

    /// Snapshot a session, optionally waiting up to `wait` for it to finish
    /// first.
    pub async fn status(
        &self,
        id: &str,
        wait: Duration,
        output_lines: usize,
    ) -> Result<StatusSnapshot, ExecError> {
        let session = self.get(id).await?;
        let wait = wait.min(MAX_WAIT);

        if !wait.is_zero() && session.status() == CommandStatus::Running {
            wait_while_running(&session, Instant::now() + wait).await;
        }

        let lines = session.recent_output(output_lines).await;
        Ok(StatusSnapshot {
            status: session.status(),
            output: lines.join("\n"),
            exit_code: session.exit_code(),
        })
    }

    /// Deliver input to a running session, or terminate it. Either way the
    /// response is a fresh snapshot of the session.
    pub async fn send_input(
        &self,
        id: &str,
        action: InputAction,
        wait: Duration,
    ) -> Result<StatusSnapshot, ExecError> {
        let session = self.get(id).await?;
        let wait = wait.min(MAX_WAIT);

        match action {
            InputAction::Terminate => {
                session.terminate().await;
            }
            InputAction::Text(text) => {
                session.write(&text).await?;
                // Give the child a moment to react before collecting
                sleep(wait.min(INPUT_SETTLE)).await;
                session.drain_output(wait).await;
                session.check_exit();
            }
        }

        let lines = session.recent_output(INPUT_OUTPUT_LINES).await;
        Ok(StatusSnapshot {
            status: session.status(),
            output: lines.join("\n"),
            exit_code: session.exit_code(),
        })
    }

    /// Summarize every live session, oldest first. Each gets a quick drain
    /// and reap so the line counts and statuses are current.
    pub async fn list(&self) -> Vec<SessionSummary> {
        let mut sessions: Vec<Arc<CommandSession>> =
            self.sessions.lock().await.values().cloned().collect();
        sessions.sort_by_key(|s| s.seq());

        let mut summaries = Vec::with_capacity(sessions.len());
        for session in sessions {
            session.drain_output(LIST_DRAIN).await;
            session.check_exit();
            summaries.push(SessionSummary {
                command_id: session.id().to_string(),
                status: session.status(),
                output_lines: session.line_count(),
                exit_code: session.exit_code(),
                started_at: session.started_at(),
            });
        }
        summaries
    }

    async fn get(&self, id: &str) -> Result<Arc<CommandSession>, ExecError> {
        self.sessions
            .lock()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| ExecError::SessionNotFound(id.to_string()))
    }

    /// Drop the oldest completed sessions beyond the retention cap. Running
    /// sessions are never evicted.
    async fn evict_done(&self) {
        let mut sessions = self.sessions.lock().await;
        let mut done: Vec<(u64, String)> = sessions
            .values()
            .filter(|s| s.status() == CommandStatus::Done)
            .map(|s| (s.seq(), s.id().to_string()))
            .collect();
        if done.len() <= self.config.max_done_sessions {
            return;
        }
        done.sort();
        let excess = done.len() - self.config.max_done_sessions;
        for (_, id) in done.into_iter().take(excess) {
            sessions.remove(&id);
            tracing::debug!(id = %id, "evicted completed session");
        }
    }
}

/// Drain in short slices until the session completes or the deadline passes.
async fn wait_while_running(session: &CommandSession, deadline: Instant) {
    loop {
        let now = Instant::now();
        if now >= deadline || session.status() == CommandStatus::Done {
            return;
        }
        session
            .drain_output(WAIT_SLICE.min(deadline.duration_since(now)))
            .await;
        session.check_exit();
        if session.status() == CommandStatus::Done {
            return;
        }
    }
}

/// Expand a leading `~` and make relative paths absolute against the
/// process's current directory.
fn resolve_cwd(raw: &str) -> Result<PathBuf, ExecError> {
    let expanded = if raw == "~" {
        dirs::home_dir().unwrap_or_else(|| PathBuf::from(raw))
    } else if let Some(rest) = raw.strip_prefix("~/") {
        match dirs::home_dir() {
            Some(home) => home.join(rest),
            None => PathBuf::from(raw),
        }
    } else {
        PathBuf::from(raw)
    };
    if expanded.is_absolute() {
        Ok(expanded)
    } else {
        Ok(std::env::current_dir()?.join(expanded))
    }
}
