//! Shell process state machine
//!
//! A [`ShellProcess`] is the execution unit: one command bound to one
//! connection, driven through `Created → Starting → Running ⇄ Communicating
//! → Terminated`. Instances are single-use; a new command always allocates
//! a new process. Once terminated, every stream is closed, the exit status
//! is fixed, and further I/O operations fail with
//! [`Error::ProcessTerminated`].

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_io::Timer;
use async_process::{Child, ChildStderr, ChildStdout};
use futures_lite::future;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::comm::{communicate, CommGoal, StreamSet};
use crate::command::Command;
use crate::connection::Connection;
use crate::error::{CapturedStreams, Error, Result};
use crate::params::ExecutionParams;
use crate::stdin::StdinHandle;

/// Grace period for reaping a process after SIGKILL
const KILL_REAP_GRACE: Duration = Duration::from_secs(1);

/// Process exit status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitStatus {
    /// Exit code if the process exited normally
    pub code: Option<i32>,
    /// Signal that terminated the process (Unix only)
    #[cfg(unix)]
    pub signal: Option<i32>,
}

impl ExitStatus {
    /// Returns true if the process exited successfully (code 0)
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    pub(crate) fn from_std(status: std::process::ExitStatus) -> Self {
        Self {
            code: status.code(),
            #[cfg(unix)]
            signal: {
                use std::os::unix::process::ExitStatusExt;
                status.signal()
            },
        }
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(code) = self.code {
            return write!(f, "{}", code);
        }
        #[cfg(unix)]
        if let Some(signal) = self.signal {
            return write!(f, "signal {}", signal);
        }
        f.write_str("unknown")
    }
}

/// Lifecycle state of a shell process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Constructed, not yet started
    Created,
    /// Command composition resolved, transport spawn in progress
    Starting,
    /// Underlying process or exec channel exists
    Running,
    /// The communication loop is moving bytes
    Communicating,
    /// Streams closed, exit status fixed
    Terminated,
}

/// A command executing on a connection
pub struct ShellProcess {
    command: Command,
    resolved: Command,
    params: ExecutionParams,
    connection: Arc<dyn Connection>,
    state: ProcessState,
    child: Option<Child>,
    streams: StreamSet,
    exit_status: Option<ExitStatus>,
}

impl ShellProcess {
    /// Bind a command to a connection; no side effects until `execute`
    pub fn new(connection: Arc<dyn Connection>, command: Command, params: ExecutionParams) -> Self {
        Self {
            resolved: command.clone(),
            command,
            params,
            connection,
            state: ProcessState::Created,
            child: None,
            streams: StreamSet::default(),
            exit_status: None,
        }
    }

    /// The command as given by the caller
    pub fn command(&self) -> &Command {
        &self.command
    }

    /// The command after sudo/namespace/shell composition
    pub fn resolved_command(&self) -> &Command {
        &self.resolved
    }

    /// The parameters this process runs with
    pub fn params(&self) -> &ExecutionParams {
        &self.params
    }

    /// Current lifecycle state
    pub fn state(&self) -> ProcessState {
        self.state
    }

    /// OS process id of the underlying child, if started
    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().map(Child::id)
    }

    /// Bytes captured from stdout so far
    pub fn stdout(&self) -> &[u8] {
        self.streams.stdout_bytes()
    }

    /// Bytes captured from stderr so far
    pub fn stderr(&self) -> &[u8] {
        self.streams.stderr_bytes()
    }

    /// Snapshot of all captured stream content
    pub fn captured(&self) -> CapturedStreams {
        self.streams.captured()
    }

    /// Idempotent setup trigger: compose the command and spawn it
    ///
    /// Returns `self` for chaining. For a remote connection the spawn is
    /// wrapped in the connect retry policy; a failed attempt force-closes
    /// the connection before retrying so a known-bad transport is never
    /// reused.
    pub async fn execute(&mut self) -> Result<&mut Self> {
        if self.state != ProcessState::Created {
            return Ok(self);
        }
        self.state = ProcessState::Starting;
        self.resolved = self.command.compose(&self.params);
        debug!("starting `{}`", self.resolved);

        let spawned = if self.connection.is_local() {
            self.connection.spawn(&self.resolved, &self.params).await
        } else {
            self.spawn_remote().await
        };
        let mut child = match spawned {
            Ok(child) => child,
            Err(err) => {
                self.state = ProcessState::Terminated;
                return Err(err);
            }
        };

        self.streams.attach(&mut child);
        if let Some(data) = self.params.stdin_data() {
            self.streams.queue_stdin(data);
        }
        self.child = Some(child);
        self.state = ProcessState::Running;
        Ok(self)
    }

    async fn spawn_remote(&mut self) -> Result<Child> {
        let policy = self.params.connect_retry_policy();
        let mut attempts = policy.attempts();
        while let Some(attempt) = attempts.next().await {
            match self.connection.spawn(&self.resolved, &self.params).await {
                Ok(child) => return Ok(child),
                Err(err) if attempt.is_last => return Err(err),
                Err(err) => {
                    warn!(
                        "remote spawn attempt {} failed, reconnecting: {}",
                        attempt.number, err
                    );
                    if let Err(close_err) = self.connection.close().await {
                        warn!("failed to close bad connection: {}", close_err);
                    }
                }
            }
        }
        Err(Error::spawn_failed("remote spawn retries exhausted"))
    }

    /// Write the full payload to stdin, multiplexing reads meanwhile
    pub async fn send_all(&mut self, data: &[u8]) -> Result<()> {
        self.ensure_not_terminated()?;
        self.execute().await?;
        if !self.streams.stdin_open() {
            return Err(Error::StdinClosed);
        }
        self.streams.queue_stdin(data);
        self.run_comm(CommGoal::Flush, None).await?;
        if self.streams.stdin_broken() {
            return Err(Error::StdinClosed);
        }
        Ok(())
    }

    /// Drain stdout and stderr to EOF
    pub async fn receive_all(&mut self) -> Result<()> {
        self.ensure_not_terminated()?;
        self.execute().await?;
        self.run_comm(CommGoal::Drain, None).await
    }

    /// Drain all streams, then retrieve the exit status
    ///
    /// Closes stdin first so a command reading to EOF is not held open
    /// indefinitely. On timeout the process is killed and
    /// [`Error::TimeoutExpired`] carries the captured partial output.
    pub async fn wait(&mut self, timeout: Option<Duration>) -> Result<ExitStatus> {
        if let Some(status) = self.exit_status {
            return Ok(status);
        }
        self.ensure_not_terminated()?;
        self.execute().await?;

        let bound = timeout.or(self.params.timeout());
        let deadline = bound.map(|t| Instant::now() + t);
        self.streams.request_close_stdin();
        self.run_comm(CommGoal::Drain, timeout).await?;

        let left = deadline.map(|d| d.saturating_duration_since(Instant::now()));
        self.status_within(left, bound).await
    }

    async fn run_comm(&mut self, goal: CommGoal, timeout: Option<Duration>) -> Result<()> {
        self.state = ProcessState::Communicating;
        let mut attempts = self.params.deadline_policy(timeout).map(|p| p.attempts());
        let result = communicate(
            &mut self.streams,
            goal,
            self.params.buffer_size(),
            self.params.poll_interval(),
            attempts.as_mut(),
        )
        .await;
        self.state = ProcessState::Running;

        match result {
            // Unify the I/O deadline with the process-lifetime timeout: a
            // zero-bounded status wait either finds the process already
            // finished or raises the detailed timeout error, quoting the
            // deadline that actually expired.
            Err(Error::RetryTimeLimit { timeout, .. }) => self
                .status_within(Some(Duration::ZERO), Some(timeout))
                .await
                .map(|_| ()),
            other => other,
        }
    }

    /// Return the cached exit status or wait (bounded) for completion
    ///
    /// Remote status waits are clamped to the configured ceiling; the
    /// status is cached write-once on first retrieval.
    pub async fn get_exit_status(&mut self, timeout: Option<Duration>) -> Result<ExitStatus> {
        self.status_within(timeout, timeout).await
    }

    /// Bounded status wait; `reported` is the deadline quoted in a raised
    /// timeout error when it differs from the wait bound (a drain already
    /// consumed part of the caller's budget)
    async fn status_within(
        &mut self,
        timeout: Option<Duration>,
        reported: Option<Duration>,
    ) -> Result<ExitStatus> {
        if let Some(status) = self.exit_status {
            return Ok(status);
        }
        if self.child.is_none() {
            return Err(Error::ProcessNotTerminated);
        }

        let bound = if self.connection.is_local() {
            timeout
        } else {
            let ceiling = self.params.status_wait_ceiling();
            Some(timeout.unwrap_or(ceiling).min(ceiling))
        };

        let outcome = {
            // child presence checked above
            let Some(child) = self.child.as_mut() else {
                return Err(Error::ProcessNotTerminated);
            };
            match bound {
                None => Some(child.status().await?),
                Some(limit) => {
                    let wait = async { child.status().await.map(Some) };
                    let timer = async {
                        Timer::after(limit).await;
                        Ok(None)
                    };
                    future::or(wait, timer).await?
                }
            }
        };

        match outcome {
            Some(status) => {
                let status = ExitStatus::from_std(status);
                self.finalize(status);
                Ok(status)
            }
            None => {
                let limit = reported.or(bound).unwrap_or_default();
                warn!(
                    "`{}` did not terminate within {:?}, killing",
                    self.resolved, limit
                );
                self.kill_for_timeout(limit).await
            }
        }
    }

    async fn kill_for_timeout(&mut self, limit: Duration) -> Result<ExitStatus> {
        if let Err(err) = self.kill().await {
            warn!("failed to kill `{}`: {}", self.resolved, err);
        }
        if let Some(child) = self.child.as_mut() {
            // Reap briefly so the killed child does not linger as a zombie
            let reap = async { child.status().await.ok() };
            let grace = async {
                Timer::after(KILL_REAP_GRACE).await;
                None
            };
            if let Some(status) = future::or(reap, grace).await {
                self.exit_status = Some(ExitStatus::from_std(status));
            }
        }

        let streams = self.streams.captured();
        self.streams.close_all();
        self.child = None;
        self.state = ProcessState::Terminated;
        Err(Error::TimeoutExpired {
            command: self.resolved.render(),
            timeout: limit,
            streams,
        })
    }

    /// Assert the process terminated with the expected exit status
    pub fn check_exit_status(&mut self, expected: i32) -> Result<()> {
        let status = match self.exit_status {
            Some(status) => status,
            None => {
                let Some(child) = self.child.as_mut() else {
                    return Err(Error::ProcessNotTerminated);
                };
                match child.try_status()? {
                    Some(status) => {
                        let status = ExitStatus::from_std(status);
                        self.finalize(status);
                        status
                    }
                    None => return Err(Error::ProcessNotTerminated),
                }
            }
        };

        if status.code == Some(expected) {
            Ok(())
        } else {
            Err(Error::CommandFailed {
                command: self.resolved.render(),
                exit_status: status,
                expected,
                streams: self.streams.captured(),
            })
        }
    }

    /// Send SIGKILL (or equivalent) to the underlying process
    pub async fn kill(&mut self) -> Result<()> {
        let Some(child) = self.child.as_mut() else {
            return Ok(());
        };

        #[cfg(unix)]
        {
            use nix::errno::Errno;
            use nix::sys::signal::{self, Signal};
            use nix::unistd::Pid;

            let pid = Pid::from_raw(child.id() as i32);
            match signal::kill(pid, Signal::SIGKILL) {
                Ok(()) | Err(Errno::ESRCH) => Ok(()),
                Err(e) => Err(Error::signal_failed(9, e.to_string())),
            }
        }

        #[cfg(not(unix))]
        {
            child
                .kill()
                .map_err(|e| Error::signal_failed(-1, e.to_string()))
        }
    }

    /// Force the process to the terminated state, killing it if needed
    pub async fn close(&mut self) -> Result<()> {
        if self.state == ProcessState::Terminated {
            return Ok(());
        }
        if let Some(child) = self.child.as_mut() {
            match child.try_status()? {
                Some(status) => {
                    let status = ExitStatus::from_std(status);
                    self.finalize(status);
                    return Ok(());
                }
                None => {
                    if let Err(err) = self.kill().await {
                        warn!("failed to kill `{}`: {}", self.resolved, err);
                    }
                    if let Some(child) = self.child.as_mut() {
                        let reap = async { child.status().await.ok() };
                        let grace = async {
                            Timer::after(KILL_REAP_GRACE).await;
                            None
                        };
                        if let Some(status) = future::or(reap, grace).await {
                            self.exit_status = Some(ExitStatus::from_std(status));
                        }
                    }
                }
            }
        }
        self.streams.close_all();
        self.child = None;
        self.state = ProcessState::Terminated;
        Ok(())
    }

    /// Whether the process has reached the terminal state
    pub fn is_terminated(&self) -> bool {
        self.state == ProcessState::Terminated
    }

    /// Hand the stdin handle to the caller for streaming use
    ///
    /// The stream leaves the communication loop's working set.
    pub fn take_stdin(&mut self) -> Option<StdinHandle> {
        self.streams.take_stdin().map(|s| StdinHandle::new(s, None))
    }

    /// Hand the stdout handle to the caller for streaming use
    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.streams.take_stdout()
    }

    /// Hand the stderr handle to the caller for streaming use
    pub fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.streams.take_stderr()
    }

    fn finalize(&mut self, status: ExitStatus) {
        debug!("`{}` exited with {}", self.resolved, status);
        self.exit_status = Some(status);
        self.streams.close_all();
        self.child = None;
        self.state = ProcessState::Terminated;
    }

    fn ensure_not_terminated(&self) -> Result<()> {
        if self.state == ProcessState::Terminated {
            return Err(Error::ProcessTerminated {
                exit_status: self.exit_status.unwrap_or_default(),
                streams: self.streams.captured(),
            });
        }
        Ok(())
    }
}

impl Drop for ShellProcess {
    fn drop(&mut self) {
        if let Some(child) = self.child.as_mut() {
            // Never leak a process past its handle
            let _ = child.kill();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_status_display() {
        let ok = ExitStatus {
            code: Some(0),
            #[cfg(unix)]
            signal: None,
        };
        assert_eq!(ok.to_string(), "0");
        assert!(ok.success());

        #[cfg(unix)]
        {
            let killed = ExitStatus {
                code: None,
                signal: Some(9),
            };
            assert_eq!(killed.to_string(), "signal 9");
            assert!(!killed.success());
        }
    }

    #[test]
    fn test_exit_status_serializes() {
        let status = ExitStatus {
            code: Some(7),
            #[cfg(unix)]
            signal: None,
        };
        let json = serde_json::to_string(&status).unwrap();
        let back: ExitStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(status, back);
    }
}
