//! Spawn backend trait and implementations
//!
//! Spawning is hidden behind a trait so the PTY-based backend can be swapped
//! for a socketpair-based one on hosts without pseudo-terminal support.
//!
//! The child is always `<shell> -c <command>` with stdin/stdout/stderr
//! redirected onto the dependent side of the device pair, and an environment
//! that keeps pagers and interactive prompts quiet.

use std::ffi::CString;
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::{Path, PathBuf};

use nix::fcntl::{FcntlArg, OFlag, fcntl};
use nix::pty::openpty;
use nix::sys::socket::{AddressFamily, SockFlag, SockType, socketpair};
use nix::unistd::{self, ForkResult, Pid};

use crate::config::ManagerConfig;
use crate::error::ExecError;

/// A freshly spawned child: its pid and the controller side of the device
/// pair, set non-blocking. Both are owned by exactly one `CommandSession`.
pub struct SpawnedChild {
    pub pid: Pid,
    pub controller: OwnedFd,
}

/// Trait for spawn backend implementations
pub trait SpawnBackend: Send + Sync {
    /// Spawn `command` under the configured shell.
    ///
    /// `cwd` must already be absolute; resolution against the manager's
    /// current directory happens in the manager.
    fn spawn(&self, command: &str, cwd: Option<&Path>) -> Result<SpawnedChild, ExecError>;
}

/// Real backend: allocates a pseudo-terminal pair and makes the dependent
/// side the child's controlling terminal.
pub struct PtySpawnBackend {
    shell: PathBuf,
}

impl PtySpawnBackend {
    pub fn new(shell: PathBuf) -> Self {
        Self { shell }
    }
}

impl SpawnBackend for PtySpawnBackend {
    fn spawn(&self, command: &str, cwd: Option<&Path>) -> Result<SpawnedChild, ExecError> {
        let program = ChildProgram::prepare(&self.shell, command, cwd)?;

        let pty = openpty(None, None)
            .map_err(|e| ExecError::SpawnFailed(format!("openpty failed: {e}")))?;

        // Safety: the child execs immediately; all exec arguments were
        // allocated before the fork.
        match unsafe { unistd::fork() } {
            Ok(ForkResult::Child) => {
                drop(pty.master);
                program.exec_in_child(pty.slave, true)
            }
            Ok(ForkResult::Parent { child }) => {
                drop(pty.slave);
                set_nonblocking(&pty.master)?;
                tracing::debug!(pid = child.as_raw(), "spawned PTY child");
                Ok(SpawnedChild {
                    pid: child,
                    controller: pty.master,
                })
            }
            // Both descriptors are OwnedFd and drop here: nothing leaks.
            Err(e) => Err(ExecError::SpawnFailed(format!("fork failed: {e}"))),
        }
    }
}

/// Substitute backend over a socketpair, for hosts without /dev/ptmx.
/// Programs that adapt to non-tty output will behave as if piped.
pub struct PipeSpawnBackend {
    shell: PathBuf,
}

impl PipeSpawnBackend {
    pub fn new(shell: PathBuf) -> Self {
        Self { shell }
    }
}

impl SpawnBackend for PipeSpawnBackend {
    fn spawn(&self, command: &str, cwd: Option<&Path>) -> Result<SpawnedChild, ExecError> {
        let program = ChildProgram::prepare(&self.shell, command, cwd)?;

        let (controller, dependent) = socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::empty(),
        )
        .map_err(|e| ExecError::SpawnFailed(format!("socketpair failed: {e}")))?;

        match unsafe { unistd::fork() } {
            Ok(ForkResult::Child) => {
                drop(controller);
                program.exec_in_child(dependent, false)
            }
            Ok(ForkResult::Parent { child }) => {
                drop(dependent);
                set_nonblocking(&controller)?;
                tracing::debug!(pid = child.as_raw(), "spawned socketpair child");
                Ok(SpawnedChild {
                    pid: child,
                    controller,
                })
            }
            Err(e) => Err(ExecError::SpawnFailed(format!("fork failed: {e}"))),
        }
    }
}

/// Create the appropriate backend for the configuration
pub fn create_backend(config: &ManagerConfig) -> Box<dyn SpawnBackend> {
    if config.pipe_backend {
        tracing::info!(shell = %config.shell.display(), "Using socketpair spawn backend");
        Box::new(PipeSpawnBackend::new(config.shell.clone()))
    } else {
        tracing::info!(shell = %config.shell.display(), "Using PTY spawn backend");
        Box::new(PtySpawnBackend::new(config.shell.clone()))
    }
}

/// Exec arguments prepared before forking, so the child never allocates.
struct ChildProgram {
    argv: Vec<CString>,
    envp: Vec<CString>,
    cwd: Option<CString>,
}

impl ChildProgram {
    fn prepare(shell: &Path, command: &str, cwd: Option<&Path>) -> Result<Self, ExecError> {
        let exe = CString::new(shell.as_os_str().as_bytes())
            .map_err(|_| ExecError::InvalidParam("shell path contains NUL".into()))?;
        let argv = vec![
            exe,
            CString::new("-c").map_err(|_| ExecError::SpawnFailed("argv".into()))?,
            CString::new(command)
                .map_err(|_| ExecError::InvalidParam("command contains NUL".into()))?,
        ];

        let mut envp = Vec::new();
        for (key, value) in std::env::vars_os() {
            if key == "TERM" || key == "PAGER" || key == "GIT_PAGER" {
                continue;
            }
            let mut entry = key.into_vec();
            entry.push(b'=');
            entry.extend(value.into_vec());
            if let Ok(entry) = CString::new(entry) {
                envp.push(entry);
            }
        }
        // Keep pagers and interactive programs non-interactive in the child.
        for fixed in ["TERM=dumb", "PAGER=cat", "GIT_PAGER=cat"] {
            if let Ok(entry) = CString::new(fixed) {
                envp.push(entry);
            }
        }

        let cwd = cwd
            .map(|dir| {
                CString::new(dir.as_os_str().as_bytes())
                    .map_err(|_| ExecError::InvalidParam("cwd contains NUL".into()))
            })
            .transpose()?;

        Ok(Self { argv, envp, cwd })
    }

    /// Child-side setup after fork. Never returns: on any failure the child
    /// must `_exit` rather than unwind back into the parent's code path.
    fn exec_in_child(self, dependent: OwnedFd, set_controlling_terminal: bool) -> ! {
        let err = (move || -> Result<(), String> {
            unistd::setsid().map_err(|e| format!("setsid: {e}"))?;

            if set_controlling_terminal {
                // Safety: plain ioctl on a descriptor we own.
                unsafe {
                    if libc::ioctl(dependent.as_raw_fd(), libc::TIOCSCTTY as _, 0) < 0 {
                        return Err(format!(
                            "TIOCSCTTY: {}",
                            std::io::Error::last_os_error()
                        ));
                    }
                }
            }

            unistd::dup2(dependent.as_raw_fd(), libc::STDIN_FILENO)
                .map_err(|e| format!("dup2 stdin: {e}"))?;
            unistd::dup2(dependent.as_raw_fd(), libc::STDOUT_FILENO)
                .map_err(|e| format!("dup2 stdout: {e}"))?;
            unistd::dup2(dependent.as_raw_fd(), libc::STDERR_FILENO)
                .map_err(|e| format!("dup2 stderr: {e}"))?;
            drop(dependent);

            if let Some(dir) = &self.cwd {
                unistd::chdir(dir.as_c_str()).map_err(|e| format!("chdir: {e}"))?;
            }

            unistd::execvpe(&self.argv[0], &self.argv, &self.envp)
                .map_err(|e| format!("exec: {e}"))?;
            Ok(()) // unreachable: execvpe replaces the process
        })();

        if let Err(e) = err {
            eprintln!("cmdpty: child setup failed: {e}");
        }
        unsafe { libc::_exit(127) };
    }
}

fn set_nonblocking(fd: &OwnedFd) -> Result<(), ExecError> {
    let flags = fcntl(fd.as_raw_fd(), FcntlArg::F_GETFL)
        .map_err(|e| ExecError::SpawnFailed(format!("fcntl F_GETFL: {e}")))?;
    let flags = OFlag::from_bits_truncate(flags);
    fcntl(fd.as_raw_fd(), FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))
        .map_err(|e| ExecError::SpawnFailed(format!("fcntl F_SETFL: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::errno::Errno;
    use nix::sys::wait::waitpid;
    use std::time::Duration;

    /// Read everything the child produces, retrying over ~2 seconds.
    fn read_to_end(fd: &OwnedFd) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = [0u8; 1024];
        for _ in 0..100 {
            match unistd::read(fd.as_raw_fd(), &mut buf) {
                Ok(0) => break,
                Ok(n) => out.extend_from_slice(&buf[..n]),
                Err(Errno::EAGAIN) => {
                    std::thread::sleep(Duration::from_millis(20));
                }
                Err(_) => break,
            }
        }
        out
    }

    #[test]
    fn pty_backend_runs_command() {
        let backend = PtySpawnBackend::new("/bin/sh".into());
        let child = backend.spawn("echo hello backend", None).expect("spawn");

        let output = read_to_end(&child.controller);
        let text = String::from_utf8_lossy(&output);
        assert!(
            text.contains("hello backend"),
            "expected 'hello backend' in output: {text:?}"
        );

        waitpid(child.pid, None).expect("reap child");
    }

    #[test]
    fn pipe_backend_runs_command() {
        let backend = PipeSpawnBackend::new("/bin/sh".into());
        let child = backend.spawn("echo hello pipe", None).expect("spawn");

        let output = read_to_end(&child.controller);
        let text = String::from_utf8_lossy(&output);
        assert!(
            text.contains("hello pipe"),
            "expected 'hello pipe' in output: {text:?}"
        );

        waitpid(child.pid, None).expect("reap child");
    }

    #[test]
    fn child_runs_in_requested_directory() {
        let dir = tempfile::tempdir().expect("tempdir");
        let canonical = dir.path().canonicalize().expect("canonicalize");

        let backend = PtySpawnBackend::new("/bin/sh".into());
        let child = backend.spawn("pwd", Some(&canonical)).expect("spawn");

        let output = read_to_end(&child.controller);
        let text = String::from_utf8_lossy(&output);
        assert!(
            text.contains(&*canonical.to_string_lossy()),
            "expected {canonical:?} in output: {text:?}"
        );

        waitpid(child.pid, None).expect("reap child");
    }

    #[test]
    fn command_with_nul_is_rejected() {
        let backend = PtySpawnBackend::new("/bin/sh".into());
        let result = backend.spawn("echo \0oops", None);
        assert!(matches!(result, Err(ExecError::InvalidParam(_))));
    }
}
