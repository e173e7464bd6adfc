//! Manager configuration

use std::path::PathBuf;
use std::time::Duration;

/// Configuration for a [`CommandManager`](crate::CommandManager).
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Shell used to run commands as `<shell> -c <command>`
    /// (defaults to `/bin/bash`, overridable via CMDPTY_SHELL)
    pub shell: PathBuf,
    /// Completed sessions retained before the oldest are evicted
    pub max_done_sessions: usize,
    /// Grace period between SIGTERM and SIGKILL in `terminate`
    pub grace_period: Duration,
    /// Bytes read per chunk while draining
    pub read_chunk_size: usize,
    /// Use a socketpair instead of a PTY (for hosts without /dev/ptmx)
    /// Enabled via CMDPTY_PIPE_BACKEND=1 env var
    pub pipe_backend: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        let shell = std::env::var("CMDPTY_SHELL")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/bin/bash"));

        let pipe_backend = std::env::var("CMDPTY_PIPE_BACKEND")
            .map(|v| v == "1" || v.to_lowercase() == "true")
            .unwrap_or(false);

        tracing::debug!(
            shell = %shell.display(),
            pipe_backend = pipe_backend,
            "ManagerConfig initialized"
        );

        Self {
            shell,
            max_done_sessions: 5,
            grace_period: Duration::from_millis(200),
            read_chunk_size: 4096,
            pipe_backend,
        }
    }
}
