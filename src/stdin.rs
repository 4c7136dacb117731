//! Stdin handle for streaming callers
//!
//! A [`StdinHandle`] is obtained from a shell process when the caller wants
//! to interleave its own logic with a long-running command (for example a
//! background ping loop fed line by line). It supports direct writes and
//! channel-based forwarding.

use async_channel::Receiver;
use futures::io::AsyncWriteExt;

use crate::error::{Error, Result};

/// Handle for writing to a process's stdin
pub struct StdinHandle {
    /// The actual stdin writer
    stdin: Option<async_process::ChildStdin>,
    /// Optional channel to receive input from
    channel: Option<Receiver<String>>,
}

impl StdinHandle {
    /// Create a new stdin handle
    pub(crate) fn new(
        stdin: async_process::ChildStdin,
        channel: Option<Receiver<String>>,
    ) -> Self {
        Self {
            stdin: Some(stdin),
            channel,
        }
    }

    /// Write a line to stdin (adds newline)
    pub async fn write_line(&mut self, line: &str) -> Result<()> {
        let stdin = self.stdin.as_mut().ok_or(Error::StdinClosed)?;
        stdin.write_all(line.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
        Ok(())
    }

    /// Write raw bytes to stdin
    pub async fn write(&mut self, data: &[u8]) -> Result<()> {
        let stdin = self.stdin.as_mut().ok_or(Error::StdinClosed)?;
        stdin.write_all(data).await?;
        stdin.flush().await?;
        Ok(())
    }

    /// Attach a channel whose lines will be forwarded to stdin
    pub fn with_channel(mut self, channel: Receiver<String>) -> Self {
        self.channel = Some(channel);
        self
    }

    /// Forward lines from the attached channel until it closes
    ///
    /// Consumes the handle; stdin is closed when forwarding ends so the
    /// process sees EOF.
    pub async fn forward_channel(mut self) -> Result<()> {
        if let Some(channel) = self.channel.take() {
            while let Ok(line) = channel.recv().await {
                self.write_line(&line).await?;
            }
        }
        self.close();
        Ok(())
    }

    /// Close stdin by dropping the writer
    pub fn close(&mut self) {
        self.stdin.take();
    }

    /// Whether the writer is still open
    pub fn is_open(&self) -> bool {
        self.stdin.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_after_close_fails() {
        futures::executor::block_on(async {
            let mut child = async_process::Command::new("cat")
                .stdin(async_process::Stdio::piped())
                .stdout(async_process::Stdio::null())
                .spawn()
                .unwrap();

            let mut handle = StdinHandle::new(child.stdin.take().unwrap(), None);
            handle.write_line("hello").await.unwrap();
            handle.close();
            assert!(!handle.is_open());

            let err = handle.write(b"more").await.unwrap_err();
            assert!(matches!(err, Error::StdinClosed));

            let status = child.status().await.unwrap();
            assert!(status.success());
        });
    }
}
