//! Uniform wrapper for invoking external helpers.
//!
//! Every other component in this crate shells out through [`run`] or
//! [`capture`] rather than constructing a [`tokio::process::Command`]
//! directly, so that the argv and textual output of every subprocess this
//! tool ever spawns shows up in a single, consistently-shaped debug trace.

use std::ffi::OsStr;
use std::process::Stdio;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{Error, Result};

/// A single external-process invocation, ready to run.
#[derive(Debug, Clone)]
pub struct Command {
    program: String,
    args: Vec<String>,
    stdin: Option<Vec<u8>>,
    env: Vec<(String, String)>,
}

impl Command {
    pub fn new(program: impl Into<String>) -> Self {
        Command {
            program: program.into(),
            args: Vec::new(),
            stdin: None,
            env: Vec::new(),
        }
    }

    /// Sets an environment variable for this invocation only (e.g.
    /// `LVM_SUPPRESS_FD_WARNINGS`, per §6).
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Feed bytes on stdin. Used by LUKS passphrase piping; everything else
    /// in this tool deliberately feeds empty stdin (see `parted`'s hang
    /// resistance requirement) or inherits nothing.
    pub fn stdin_bytes(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(data.into());
        self
    }

    fn argv_string(&self) -> String {
        let mut parts = vec![self.program.clone()];
        parts.extend(self.args.iter().cloned());
        parts.join(" ")
    }

    fn to_tokio(&self) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&self.args);
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd
    }
}

/// Runs a command, discarding stdout, and mapping a nonzero exit (or a spawn
/// failure) to [`Error::Subsystem`].
pub async fn run(cmd: Command) -> Result<()> {
    capture(cmd).await.map(|_| ())
}

/// Runs a command and returns its decoded stdout. Every invocation is
/// debug-logged with the full argv; on success, the first 150 characters of
/// stdout are logged too; on failure, stderr (if any) is logged at the same
/// level before the error is raised.
pub async fn capture(cmd: Command) -> Result<String> {
    let argv = cmd.argv_string();
    debug!(argv = %argv, "running command");

    let mut child = cmd
        .to_tokio()
        .spawn()
        .map_err(|e| Error::subsystem(&cmd.program, e))?;

    if let Some(data) = &cmd.stdin {
        use tokio::io::AsyncWriteExt;
        if let Some(mut stdin) = child.stdin.take() {
            let _ = stdin.write_all(data).await;
        }
    } else {
        // Always close stdin even when nothing is written: several helpers
        // (parted, in particular) block waiting on stdin when it is left
        // open and connected to a terminal-like stream. Dropping the piped
        // handle gives them immediate EOF instead.
        drop(child.stdin.take());
    }

    let output = child
        .wait_with_output()
        .await
        .map_err(|e| Error::subsystem(&cmd.program, e))?;

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();

    if output.status.success() {
        let preview: String = stdout.chars().take(150).collect();
        debug!(argv = %argv, output = %preview, "command succeeded");
        Ok(stdout)
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            warn!(argv = %argv, stderr = %stderr.trim(), "command failed");
        } else {
            warn!(argv = %argv, status = %output.status, "command failed");
        }
        Err(Error::subsystem(
            &cmd.program,
            format!("exited with {}: {}", output.status, stderr.trim()),
        ))
    }
}

/// Runs a command with a bounded deadline, terminating (not killing) the
/// child if it hasn't finished in time. Used exclusively by the `fsstat`
/// stats-extraction step, which is known to hang on certain images.
///
/// Returns whatever stdout had been produced up to the point the child
/// exited or was terminated; a timeout is not itself an error, since partial
/// `fsstat` output is still useful.
pub async fn capture_with_timeout(cmd: Command, timeout: Duration) -> Result<String> {
    let argv = cmd.argv_string();
    debug!(argv = %argv, timeout_ms = timeout.as_millis(), "running bounded command");

    let mut child = cmd
        .to_tokio()
        .spawn()
        .map_err(|e| Error::subsystem(&cmd.program, e))?;
    drop(child.stdin.take());

    let pid = child.id();

    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => Ok(String::from_utf8_lossy(&output.stdout).into_owned()),
        Ok(Err(e)) => Err(Error::subsystem(&cmd.program, e)),
        Err(_) => {
            warn!(argv = %argv, "command exceeded deadline, terminating");
            if let Some(pid) = pid {
                terminate(pid);
            }
            Ok(String::new())
        }
    }
}

/// Sends SIGTERM (not SIGKILL) to a process id, best-effort. Matches the
/// spec's "terminate, not kill" cancellation discipline: if the process
/// ignores SIGTERM, the core does not escalate to force-killing it.
#[cfg(unix)]
fn terminate(pid: u32) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;
    let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
}

#[cfg(not(unix))]
fn terminate(_pid: u32) {}

/// Convenience: true if `program` resolves on `PATH`.
pub fn is_available(program: impl AsRef<OsStr>) -> bool {
    which::which(program).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn capture_true_succeeds() {
        let out = capture(Command::new("true")).await;
        assert!(out.is_ok());
    }

    #[tokio::test]
    async fn capture_false_is_subsystem_error() {
        let err = capture(Command::new("false")).await.unwrap_err();
        assert!(matches!(err, Error::Subsystem { .. }));
    }

    #[tokio::test]
    async fn capture_echo_returns_stdout() {
        let out = capture(Command::new("echo").arg("hello")).await.unwrap();
        assert_eq!(out.trim(), "hello");
    }

    #[tokio::test]
    async fn stdin_is_always_closed() {
        // `cat` with no stdin data and closed stdin should return immediately
        // with empty output rather than hang.
        let out = capture(Command::new("cat")).await.unwrap();
        assert_eq!(out, "");
    }

    #[test]
    fn is_available_finds_sh() {
        assert!(is_available("sh"));
    }

    #[test]
    fn is_available_rejects_nonsense() {
        assert!(!is_available("this-program-does-not-exist-anywhere"));
    }
}
