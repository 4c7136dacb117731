//! Readiness-driven I/O multiplexer
//!
//! Moves bytes between the caller and the three streams of a running shell
//! process without deadlocking: a child blocked writing to a full stdout
//! pipe is drained even while the engine still has stdin payload to flush.
//!
//! Each round polls every active stream once, in order (stdin write, stdout
//! read, stderr read), racing the poll against a timer. The timer delay
//! starts at zero so already-ready data is drained without waiting, and
//! widens to the configured poll interval once a round moves nothing. Idle
//! rounds consult the retry policy's limit check, so an overall deadline is
//! enforced even while individual reads and writes keep succeeding.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use async_io::Timer;
use async_process::{Child, ChildStderr, ChildStdin, ChildStdout};
use futures::future::poll_fn;
use futures::io::{AsyncRead, AsyncWrite};
use futures_lite::future;
use tracing::trace;

use crate::error::{CapturedStreams, Error, Result};
use crate::retry::Attempts;

/// Completion condition for a communication drive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CommGoal {
    /// Stop once the pending stdin payload is fully flushed
    Flush,
    /// Stop once every requested stream has reached EOF
    Drain,
}

/// The active stream set of a running process, plus captured content
#[derive(Default)]
pub(crate) struct StreamSet {
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
    /// Pending stdin payload; bytes before `sent` are already written
    pending: Vec<u8>,
    sent: usize,
    close_stdin: bool,
    stdin_broken: bool,
    stdin_log: Vec<u8>,
    stdout_buf: Vec<u8>,
    stderr_buf: Vec<u8>,
}

impl StreamSet {
    /// Take ownership of the child's stream handles
    pub(crate) fn attach(&mut self, child: &mut Child) {
        self.stdin = child.stdin.take();
        self.stdout = child.stdout.take();
        self.stderr = child.stderr.take();
    }

    /// Queue payload bytes to be written to stdin
    pub(crate) fn queue_stdin(&mut self, data: &[u8]) {
        self.pending.extend_from_slice(data);
    }

    /// Request that stdin be closed once the pending payload is flushed
    pub(crate) fn request_close_stdin(&mut self) {
        self.close_stdin = true;
    }

    /// Whether the stdin handle is still held and usable
    pub(crate) fn stdin_open(&self) -> bool {
        self.stdin.is_some()
    }

    /// Whether the peer closed the read side while payload remained
    pub(crate) fn stdin_broken(&self) -> bool {
        self.stdin_broken
    }

    /// Hand the stdin handle to the caller, removing it from the loop
    pub(crate) fn take_stdin(&mut self) -> Option<ChildStdin> {
        self.stdin.take()
    }

    /// Hand the stdout handle to the caller, removing it from the loop
    pub(crate) fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.stdout.take()
    }

    /// Hand the stderr handle to the caller, removing it from the loop
    pub(crate) fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.stderr.take()
    }

    /// Bytes captured from stdout so far
    pub(crate) fn stdout_bytes(&self) -> &[u8] {
        &self.stdout_buf
    }

    /// Bytes captured from stderr so far
    pub(crate) fn stderr_bytes(&self) -> &[u8] {
        &self.stderr_buf
    }

    /// Snapshot the captured stream content for diagnostics
    pub(crate) fn captured(&self) -> CapturedStreams {
        CapturedStreams::from_bytes(&self.stdin_log, &self.stdout_buf, &self.stderr_buf)
    }

    /// Drop every stream handle; captured content is retained
    pub(crate) fn close_all(&mut self) {
        self.stdin = None;
        self.stdout = None;
        self.stderr = None;
        self.sent = self.pending.len();
    }

    fn pending_remaining(&self) -> usize {
        self.pending.len() - self.sent
    }

    fn write_done(&self) -> bool {
        // Without a handle nothing more can be written, however much is
        // pending; with one, the payload must flush and a requested close
        // must complete.
        match self.stdin {
            None => true,
            Some(_) => self.pending_remaining() == 0 && !self.close_stdin,
        }
    }

    fn goal_met(&self, goal: CommGoal) -> bool {
        match goal {
            CommGoal::Flush => self.write_done(),
            CommGoal::Drain => {
                self.write_done() && self.stdout.is_none() && self.stderr.is_none()
            }
        }
    }

    fn drop_stdin(&mut self, broken: bool) {
        self.stdin = None;
        self.sent = self.pending.len();
        self.stdin_broken |= broken;
    }

    /// Poll every active stream once; `Ready(Ok(true))` means data moved or
    /// a stream left the active set this round
    fn poll_round(&mut self, cx: &mut Context<'_>, scratch: &mut [u8]) -> Poll<Result<bool>> {
        // stdin: flush pending payload, then close if requested
        if let Some(stdin) = self.stdin.as_mut() {
            // computed from fields directly: `stdin` holds a mutable borrow
            let pending_remaining = self.pending.len() - self.sent;
            if pending_remaining > 0 {
                let end = (self.sent + scratch.len()).min(self.pending.len());
                match Pin::new(stdin).poll_write(cx, &self.pending[self.sent..end]) {
                    Poll::Ready(Ok(0)) => {
                        self.drop_stdin(true);
                        return Poll::Ready(Ok(true));
                    }
                    Poll::Ready(Ok(n)) => {
                        let written = &self.pending[self.sent..self.sent + n];
                        self.stdin_log.extend_from_slice(written);
                        self.sent += n;
                        return Poll::Ready(Ok(true));
                    }
                    Poll::Ready(Err(err)) if err.kind() == io::ErrorKind::BrokenPipe => {
                        trace!("peer closed stdin with {} bytes pending", pending_remaining);
                        self.drop_stdin(true);
                        return Poll::Ready(Ok(true));
                    }
                    Poll::Ready(Err(err)) => return Poll::Ready(Err(err.into())),
                    Poll::Pending => {}
                }
            } else if self.close_stdin {
                match Pin::new(stdin).poll_close(cx) {
                    Poll::Ready(_) => {
                        self.stdin = None;
                        return Poll::Ready(Ok(true));
                    }
                    Poll::Pending => {}
                }
            }
        }

        // stdout: read up to one chunk, drop on EOF
        if let Some(stdout) = self.stdout.as_mut() {
            match Pin::new(stdout).poll_read(cx, scratch) {
                Poll::Ready(Ok(0)) => {
                    self.stdout = None;
                    return Poll::Ready(Ok(true));
                }
                Poll::Ready(Ok(n)) => {
                    self.stdout_buf.extend_from_slice(&scratch[..n]);
                    return Poll::Ready(Ok(true));
                }
                Poll::Ready(Err(_)) => {
                    // Error reading stdout, remove it
                    self.stdout = None;
                    return Poll::Ready(Ok(true));
                }
                Poll::Pending => {}
            }
        }

        // stderr: same treatment as stdout
        if let Some(stderr) = self.stderr.as_mut() {
            match Pin::new(stderr).poll_read(cx, scratch) {
                Poll::Ready(Ok(0)) => {
                    self.stderr = None;
                    return Poll::Ready(Ok(true));
                }
                Poll::Ready(Ok(n)) => {
                    self.stderr_buf.extend_from_slice(&scratch[..n]);
                    return Poll::Ready(Ok(true));
                }
                Poll::Ready(Err(_)) => {
                    self.stderr = None;
                    return Poll::Ready(Ok(true));
                }
                Poll::Pending => {}
            }
        }

        Poll::Pending
    }
}

/// Drive the stream set until the goal is met or the deadline passes
///
/// `attempts` of `None` means the drive is unbounded; with a bound, an idle
/// round past the deadline fails with [`Error::RetryTimeLimit`], which the
/// process layer unifies into its timeout error path.
pub(crate) async fn communicate(
    streams: &mut StreamSet,
    goal: CommGoal,
    buffer_size: usize,
    poll_interval: Duration,
    mut attempts: Option<&mut Attempts>,
) -> Result<()> {
    let mut scratch = vec![0u8; buffer_size];
    let mut delay = Duration::ZERO;

    loop {
        if streams.goal_met(goal) {
            return Ok(());
        }

        let round = poll_fn(|cx| streams.poll_round(cx, &mut scratch));
        let idle = async {
            Timer::after(delay).await;
            Ok::<bool, Error>(false)
        };
        let progressed = future::or(round, idle).await?;

        if progressed {
            delay = Duration::ZERO;
        } else {
            delay = poll_interval;
            if let Some(attempts) = attempts.as_deref_mut() {
                attempts.check_limits()?;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_set_meets_drain_goal() {
        let streams = StreamSet::default();
        assert!(streams.goal_met(CommGoal::Drain));
        assert!(streams.goal_met(CommGoal::Flush));
    }

    #[test]
    fn test_pending_payload_blocks_flush_goal() {
        let mut streams = StreamSet::default();
        streams.queue_stdin(b"payload");
        // No stdin handle: the payload can never flush, so the goal is
        // already met rather than spinning forever.
        assert!(streams.goal_met(CommGoal::Flush));
        assert_eq!(streams.pending_remaining(), 7);

        streams.drop_stdin(true);
        assert!(streams.stdin_broken());
        assert_eq!(streams.pending_remaining(), 0);
    }

    #[test]
    fn test_multi_chunk_payload_flushes_and_drains() {
        futures::executor::block_on(async {
            let mut child = async_process::Command::new("cat")
                .stdin(async_process::Stdio::piped())
                .stdout(async_process::Stdio::piped())
                .stderr(async_process::Stdio::null())
                .spawn()
                .unwrap();

            let mut streams = StreamSet::default();
            streams.attach(&mut child);
            let payload = vec![b'z'; 10_000];
            streams.queue_stdin(&payload);
            streams.request_close_stdin();

            // Chunk size far below the payload forces many write rounds
            communicate(
                &mut streams,
                CommGoal::Drain,
                512,
                Duration::from_millis(10),
                None,
            )
            .await
            .unwrap();

            assert_eq!(streams.stdout_bytes(), &payload[..]);
            assert!(child.status().await.unwrap().success());
        });
    }

    #[test]
    fn test_captured_snapshot() {
        let mut streams = StreamSet::default();
        streams.stdout_buf.extend_from_slice(b"out");
        streams.stderr_buf.extend_from_slice(b"err");
        streams.stdin_log.extend_from_slice(b"in");

        let captured = streams.captured();
        assert_eq!(captured.stdout, "out");
        assert_eq!(captured.stderr, "err");
        assert_eq!(captured.stdin, "in");
    }
}
