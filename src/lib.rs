//! cmdpty: run shell commands in pseudo-terminal sessions
//!
//! This crate provides the building blocks for hosting shell commands on
//! behalf of an automated caller:
//!
//! - **Spawning** - [`SpawnBackend`] with PTY and socketpair implementations
//! - **Sessions** - [`CommandSession`] owning one child process, its output
//!   log, and its exit state
//! - **Management** - [`CommandManager`] for the run/status/send_input/list
//!   operations, session ids, and eviction of completed sessions
//! - **JSON surface** - [`api`] request/response types with string-encoded
//!   numeric parameters
//!
//! Commands run as `<shell> -c <command>` inside their own session with the
//! PTY as controlling terminal, so stdout and stderr interleave the way a
//! terminal user would see them. A run that outlives its timeout keeps
//! executing; its id can be polled, fed input, or terminated later.
//!
//! # Quick Start
//!
//! ```no_run
//! use cmdpty::{CommandManager, ManagerConfig};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), cmdpty::ExecError> {
//! let manager = CommandManager::new(ManagerConfig::default());
//!
//! let outcome = manager.run("echo hello", None, Duration::from_secs(5)).await?;
//! println!("{}: {}", outcome.command_id, outcome.output);
//! # Ok(())
//! # }
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────┐
//! │                 CommandManager                   │
//! │  ┌────────────────────────────────────────────┐  │
//! │  │              CommandSession                │  │
//! │  │  ┌──────────────┐  ┌────────────────────┐  │  │
//! │  │  │ PTY control- │  │   shell -c <cmd>   │  │  │
//! │  │  │ ler + output │  │   (child process)  │  │  │
//! │  │  └──────────────┘  └────────────────────┘  │  │
//! │  └────────────────────────────────────────────┘  │
//! └──────────────────────────────────────────────────┘
//! ```

pub mod api;
pub mod backend;
pub mod config;
pub mod error;
pub mod manager;
pub mod output;
pub mod session;

// Re-export key types for convenience
pub use backend::{PipeSpawnBackend, PtySpawnBackend, SpawnBackend, SpawnedChild, create_backend};
pub use config::ManagerConfig;
pub use error::ExecError;
pub use manager::{CommandManager, InputAction, RunOutcome, SessionSummary, StatusSnapshot};
pub use output::OutputBuffer;
pub use session::{CommandSession, CommandStatus};
