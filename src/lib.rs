//! Runtime-agnostic shell command execution library
//!
//! This crate provides one contract for running shell commands across
//! execution contexts: local subprocesses and remote SSH hosts. A command
//! runs the same way everywhere: composed once (sudo, network namespace,
//! shell wrapping), spawned through a [`Connection`], driven by a
//! [`ShellProcess`] that multiplexes stdin/stdout/stderr without
//! deadlocking, and bounded by explicit retry and timeout policies.
//!
//! # Example
//!
//! ```no_run
//! use shell_executor::{Command, ConnectionManager, ExecutionParams};
//!
//! # async fn example() -> shell_executor::Result<()> {
//! let manager = ConnectionManager::new();
//! let output = manager
//!     .execute(
//!         None, // local
//!         Command::new("uname").arg("-a"),
//!         ExecutionParams::builder().build()?,
//!     )
//!     .await?;
//! println!("{}", output.stdout_line());
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod backends;
pub mod command;
mod comm;
pub mod connection;
pub mod error;
pub mod execute;
pub mod params;
pub mod process;
pub mod retry;
pub mod stdin;

pub use command::Command;
pub use connection::{Connection, ConnectionId, ConnectionManager};
pub use error::{CapturedStreams, Error, Result};
pub use execute::{execute_with, process_with, ExecuteOutput};
pub use params::{ExecutionParams, ExecutionParamsBuilder, ShellPolicy, SudoPolicy};
pub use process::{ExitStatus, ProcessState, ShellProcess};
pub use retry::{Attempt, Attempts, RetryPolicy};
pub use stdin::StdinHandle;

#[cfg(feature = "ssh")]
pub use backends::ssh::{SshConnection, SshEndpoint};
pub use backends::local::LocalConnection;
