//! Error types for shell command execution

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::process::ExitStatus;

/// Partial stream content captured before an error was raised.
///
/// Timeouts and status mismatches in a test harness are debugged from the
/// output the process managed to produce, so every terminal error carries
/// whatever was buffered at the time it fired.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapturedStreams {
    /// Bytes written to the process stdin so far (lossily decoded)
    pub stdin: String,
    /// Bytes read from the process stdout so far (lossily decoded)
    pub stdout: String,
    /// Bytes read from the process stderr so far (lossily decoded)
    pub stderr: String,
}

impl CapturedStreams {
    /// Build a capture from raw stream buffers
    pub fn from_bytes(stdin: &[u8], stdout: &[u8], stderr: &[u8]) -> Self {
        Self {
            stdin: String::from_utf8_lossy(stdin).into_owned(),
            stdout: String::from_utf8_lossy(stdout).into_owned(),
            stderr: String::from_utf8_lossy(stderr).into_owned(),
        }
    }
}

/// Unified error type for shell command execution
#[derive(Error, Debug)]
pub enum Error {
    /// A command was built from an empty token sequence
    #[error("invalid command: {reason}")]
    InvalidCommand {
        /// Why the command was rejected
        reason: String,
    },

    /// Execution parameters failed validation before any side effect
    #[error("invalid execution parameters: {reason}")]
    InvalidParams {
        /// Why the parameters were rejected
        reason: String,
    },

    /// A retry policy was constructed without a finite bound
    #[error("invalid retry policy: {reason}")]
    InvalidRetryPolicy {
        /// Why the policy was rejected
        reason: String,
    },

    /// A bounded retry deadline has passed
    #[error("retry time limit exceeded after {elapsed:?} (limit {timeout:?})")]
    RetryTimeLimit {
        /// Time elapsed since the first attempt
        elapsed: Duration,
        /// The configured deadline
        timeout: Duration,
    },

    /// Failed to spawn a process
    #[error("failed to spawn process: {reason}")]
    SpawnFailed {
        /// The reason for the spawn failure
        reason: String,
    },

    /// Failed to establish or maintain a connection to a remote host
    #[cfg(feature = "ssh")]
    #[error("connection to {host} failed: {reason}")]
    ConnectionFailed {
        /// The hostname or IP address that failed to connect
        host: String,
        /// The detailed reason for the connection failure
        reason: String,
    },

    /// The connection cache is at capacity
    #[error("connection cache is full ({capacity} connections)")]
    ConnectionLimit {
        /// The configured cache capacity
        capacity: usize,
    },

    /// An I/O operation was attempted after the process terminated
    #[error("shell process already terminated with status {exit_status}")]
    ProcessTerminated {
        /// The status the process terminated with
        exit_status: ExitStatus,
        /// Stream content captured before termination
        streams: CapturedStreams,
    },

    /// Exit status was requested or asserted before the process finished
    #[error("shell process has not terminated yet")]
    ProcessNotTerminated,

    /// A bounded wait exceeded its deadline
    #[error("command `{command}` timed out after {timeout:?}")]
    TimeoutExpired {
        /// The rendered command line
        command: String,
        /// The deadline that was exceeded
        timeout: Duration,
        /// Partial stream content captured before the timeout
        streams: CapturedStreams,
    },

    /// A write was attempted after the peer closed the read side of stdin
    #[error("process stdin is closed")]
    StdinClosed,

    /// The process terminated with an unexpected exit status
    #[error("command `{command}` failed with exit status {exit_status} (expected {expected})")]
    CommandFailed {
        /// The rendered command line
        command: String,
        /// The actual exit status
        exit_status: ExitStatus,
        /// The status the caller expected
        expected: i32,
        /// Full stream content captured from the process
        streams: CapturedStreams,
    },

    /// Failed to send a signal to a process
    #[error("failed to send signal {signal}: {reason}")]
    SignalFailed {
        /// The signal number that failed to send
        signal: i32,
        /// The reason for the signal failure
        reason: String,
    },

    /// I/O error
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Nix error (Unix signal handling)
    #[cfg(unix)]
    #[error(transparent)]
    Nix(#[from] nix::Error),
}

// For convenience, re-export specific error constructors
impl Error {
    /// Create an invalid command error
    pub fn invalid_command(reason: impl Into<String>) -> Self {
        Self::InvalidCommand {
            reason: reason.into(),
        }
    }

    /// Create an invalid parameters error
    pub fn invalid_params(reason: impl Into<String>) -> Self {
        Self::InvalidParams {
            reason: reason.into(),
        }
    }

    /// Create an invalid retry policy error
    pub fn invalid_retry_policy(reason: impl Into<String>) -> Self {
        Self::InvalidRetryPolicy {
            reason: reason.into(),
        }
    }

    /// Create a spawn failed error
    pub fn spawn_failed(reason: impl Into<String>) -> Self {
        Self::SpawnFailed {
            reason: reason.into(),
        }
    }

    /// Create a connection failed error
    #[cfg(feature = "ssh")]
    pub fn connection_failed(host: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ConnectionFailed {
            host: host.into(),
            reason: reason.into(),
        }
    }

    /// Create a signal failed error
    pub fn signal_failed(signal: i32, reason: impl Into<String>) -> Self {
        Self::SignalFailed {
            signal,
            reason: reason.into(),
        }
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
