//! A single command session: one child process, its controller descriptor,
//! its accumulated output, and its exit state.
//!
//! Locking: `controller`, `output`, and `state` are each behind a std mutex
//! that is never held across an await point. `controller` is taken before
//! `output` when both are needed.

use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use nix::sys::signal::{Signal, kill};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::{self, Pid};
use serde::Serialize;
use tokio::time::{Instant, sleep};

use crate::backend::SpawnedChild;
use crate::config::ManagerConfig;
use crate::error::ExecError;
use crate::output::OutputBuffer;

/// Sleep between empty polls while waiting out a drain window.
const IDLE_SLICE: Duration = Duration::from_millis(10);

/// Short drain before taking an output snapshot.
const SNAPSHOT_DRAIN: Duration = Duration::from_millis(50);

/// Drain after termination to pick up output that raced the kill.
const FINAL_DRAIN: Duration = Duration::from_millis(100);

/// Byte cap per drain call so a flooding child cannot pin the caller.
const MAX_DRAIN_BYTES: usize = 256 * 1024;

/// EAGAIN retries before a write gives up (~1s at 1ms per retry).
const WRITE_RETRY_LIMIT: u32 = 1000;

/// Whether the child process is still running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandStatus {
    Running,
    Done,
}

#[derive(Debug, Clone, Copy)]
struct ExitState {
    status: CommandStatus,
    exit_code: Option<i32>,
}

/// Outcome of one non-blocking read pass over the controller descriptor.
enum Progress {
    /// At least one chunk was read
    Data,
    /// Nothing ready right now
    Idle,
    /// EOF, EIO, or the descriptor is already closed
    Closed,
}

pub struct CommandSession {
    id: String,
    seq: u64,
    pid: Pid,
    started_at: DateTime<Utc>,
    grace_period: Duration,
    read_chunk_size: usize,
    controller: Mutex<Option<OwnedFd>>,
    output: Mutex<OutputBuffer>,
    state: Mutex<ExitState>,
}

impl CommandSession {
    pub(crate) fn new(id: String, seq: u64, child: SpawnedChild, config: &ManagerConfig) -> Self {
        Self {
            id,
            seq,
            pid: child.pid,
            started_at: Utc::now(),
            grace_period: config.grace_period,
            read_chunk_size: config.read_chunk_size,
            controller: Mutex::new(Some(child.controller)),
            output: Mutex::new(OutputBuffer::new()),
            state: Mutex::new(ExitState {
                status: CommandStatus::Running,
                exit_code: None,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Spawn order, used for oldest-first eviction.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn status(&self) -> CommandStatus {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .status
    }

    /// Exit code if the child has been reaped: the raw code for a normal
    /// exit, the negated signal number for a signal death, -1 when the real
    /// code could not be observed.
    pub fn exit_code(&self) -> Option<i32> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .exit_code
    }

    pub fn line_count(&self) -> usize {
        self.output
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .line_count()
    }

    /// Drain available output for up to `timeout`. Returns as soon as the
    /// stream closes; with a zero timeout, takes whatever is ready and
    /// returns immediately.
    pub async fn drain_output(&self, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        loop {
            match self.read_burst() {
                Progress::Closed => return,
                Progress::Data => {
                    if Instant::now() >= deadline {
                        return;
                    }
                }
                Progress::Idle => {
                    let now = Instant::now();
                    if now >= deadline {
                        return;
                    }
                    sleep(IDLE_SLICE.min(deadline.duration_since(now))).await;
                }
            }
        }
    }

    /// One non-blocking pass: read ready chunks until EAGAIN, EOF, or the
    /// per-call byte cap.
    fn read_burst(&self) -> Progress {
        let io = self
            .controller
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let Some(fd) = io.as_ref() else {
            return Progress::Closed;
        };

        let mut buf = vec![0u8; self.read_chunk_size];
        let mut total = 0usize;
        let mut progress = Progress::Idle;
        while total < MAX_DRAIN_BYTES {
            if !readable_now(fd) {
                break;
            }
            match unistd::read(fd.as_raw_fd(), &mut buf) {
                Ok(0) => return Progress::Closed,
                Ok(n) => {
                    self.output
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .append(&buf[..n]);
                    total += n;
                    progress = Progress::Data;
                }
                Err(Errno::EAGAIN) => break,
                // EIO from a PTY controller means the dependent side closed
                Err(_) => return Progress::Closed,
            }
        }
        progress
    }

    /// Reap the child if it has exited. Idempotent: once done, the recorded
    /// status and exit code never change.
    pub fn check_exit(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.status == CommandStatus::Done {
            return;
        }
        let (done, exit_code) = match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => (false, None),
            Ok(WaitStatus::Exited(_, code)) => (true, Some(code)),
            Ok(WaitStatus::Signaled(_, signal, _)) => (true, Some(-(signal as i32))),
            // Stopped or continued: still our child, still running
            Ok(_) => (false, None),
            // ECHILD: reaped elsewhere, real code unobservable
            Err(_) => (true, Some(-1)),
        };
        if done {
            state.status = CommandStatus::Done;
            state.exit_code = exit_code;
            tracing::debug!(id = %self.id, exit_code = ?exit_code, "command completed");
        }
    }

    /// Drain briefly, reap, and return the most recent `max_lines` lines.
    pub async fn recent_output(&self, max_lines: usize) -> Vec<String> {
        self.drain_output(SNAPSHOT_DRAIN).await;
        self.check_exit();
        self.output
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .recent_lines(max_lines)
    }

    /// Write `text` to the child's stdin. Bytes are passed through verbatim;
    /// callers append their own newline when they want the line submitted.
    pub async fn write(&self, text: &str) -> Result<(), ExecError> {
        let data = text.as_bytes();
        let mut written = 0usize;
        let mut retries = 0u32;
        while written < data.len() {
            // Lock only around the write itself, never across the sleep.
            let result = {
                let io = self
                    .controller
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                let Some(fd) = io.as_ref() else {
                    return Err(ExecError::Io(std::io::Error::new(
                        std::io::ErrorKind::BrokenPipe,
                        "controller descriptor closed",
                    )));
                };
                unistd::write(fd.as_fd(), &data[written..])
            };
            match result {
                Ok(n) => {
                    written += n;
                    retries = 0;
                }
                Err(Errno::EAGAIN) => {
                    retries += 1;
                    if retries > WRITE_RETRY_LIMIT {
                        return Err(ExecError::Io(std::io::Error::new(
                            std::io::ErrorKind::WouldBlock,
                            "child did not accept input",
                        )));
                    }
                    sleep(Duration::from_millis(1)).await;
                }
                Err(e) => return Err(ExecError::Io(std::io::Error::from_raw_os_error(e as i32))),
            }
        }
        Ok(())
    }

    /// Stop the child: SIGTERM, a grace period, then SIGKILL if it is still
    /// alive, a final drain, and closing the controller descriptor.
    /// Idempotent: calling again after completion changes nothing.
    pub async fn terminate(&self) {
        if self.status() == CommandStatus::Done {
            return;
        }
        tracing::debug!(id = %self.id, pid = self.pid.as_raw(), "terminating command");

        // ESRCH just means the child already exited
        let _ = kill(self.pid, Signal::SIGTERM);
        sleep(self.grace_period).await;
        self.check_exit();
        if self.status() == CommandStatus::Running {
            let _ = kill(self.pid, Signal::SIGKILL);
        }

        self.drain_output(FINAL_DRAIN).await;
        self.check_exit();

        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if state.status == CommandStatus::Running {
                // Unreapable child: mark done so the session can be evicted
                state.status = CommandStatus::Done;
                state.exit_code = Some(-1);
                tracing::warn!(id = %self.id, "child did not exit after SIGKILL, marking done");
            }
        }
        self.close_controller();
    }

    /// Close the controller descriptor. Safe to call more than once.
    pub fn close_controller(&self) {
        let mut io = self
            .controller
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if io.take().is_some() {
            tracing::debug!(id = %self.id, "controller descriptor closed");
        }
    }
}

fn readable_now(fd: &OwnedFd) -> bool {
    let mut fds = [PollFd::new(fd.as_fd(), PollFlags::POLLIN)];
    match poll(&mut fds, PollTimeout::ZERO) {
        Ok(0) => false,
        Ok(_) => fds[0]
            .revents()
            .is_some_and(|r| r.intersects(PollFlags::POLLIN | PollFlags::POLLHUP)),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{PtySpawnBackend, SpawnBackend};

    fn spawn_session(command: &str) -> CommandSession {
        let config = ManagerConfig::default();
        let backend = PtySpawnBackend::new("/bin/sh".into());
        let child = backend.spawn(command, None).expect("spawn");
        CommandSession::new("cmd_1".to_string(), 1, child, &config)
    }

    async fn wait_done(session: &CommandSession, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            session.drain_output(Duration::from_millis(50)).await;
            session.check_exit();
            if session.status() == CommandStatus::Done {
                return;
            }
        }
        panic!("command did not finish within {timeout:?}");
    }

    #[tokio::test]
    async fn echo_completes_with_exit_zero() {
        let session = spawn_session("echo hello session");
        wait_done(&session, Duration::from_secs(5)).await;

        assert_eq!(session.exit_code(), Some(0));
        let lines = session.recent_output(50).await;
        assert!(
            lines.iter().any(|l| l.trim_end().contains("hello session")),
            "expected 'hello session' in {lines:?}"
        );
    }

    #[tokio::test]
    async fn failing_command_reports_nonzero_exit() {
        let session = spawn_session("exit 3");
        wait_done(&session, Duration::from_secs(5)).await;
        assert_eq!(session.exit_code(), Some(3));
    }

    #[tokio::test]
    async fn terminate_reports_negated_signal() {
        let session = spawn_session("sleep 30");
        assert_eq!(session.status(), CommandStatus::Running);

        session.terminate().await;
        assert_eq!(session.status(), CommandStatus::Done);
        // The shell dies on SIGTERM; exit is the negated signal number
        assert_eq!(session.exit_code(), Some(-(Signal::SIGTERM as i32)));
    }

    #[tokio::test]
    async fn terminate_is_idempotent() {
        let session = spawn_session("sleep 30");
        session.terminate().await;
        let first = (session.status(), session.exit_code());

        session.terminate().await;
        assert_eq!((session.status(), session.exit_code()), first);
    }

    #[tokio::test]
    async fn write_reaches_child_stdin() {
        let session = spawn_session("cat");
        session.write("ping\n").await.expect("write");

        session.drain_output(Duration::from_millis(500)).await;
        let lines = session.recent_output(50).await;
        assert!(
            lines.iter().any(|l| l.trim_end().contains("ping")),
            "expected echoed 'ping' in {lines:?}"
        );

        session.terminate().await;
    }

    #[tokio::test]
    async fn write_after_close_fails() {
        let session = spawn_session("sleep 30");
        session.terminate().await;

        let result = session.write("late\n").await;
        assert!(matches!(result, Err(ExecError::Io(_))));
    }

    #[tokio::test]
    async fn close_controller_twice_is_harmless() {
        let session = spawn_session("echo x");
        wait_done(&session, Duration::from_secs(5)).await;
        session.close_controller();
        session.close_controller();
    }
}
