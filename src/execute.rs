//! One-shot execution front door
//!
//! [`execute_with`] runs a command to completion and returns a
//! [`ExecuteOutput`] with the captured streams and timing; [`process_with`]
//! hands back the live [`ShellProcess`] for streaming use. Both are also
//! reachable through [`ConnectionManager::execute`] and
//! [`ConnectionManager::process`], which resolve the connection first.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::command::Command;
use crate::connection::{Connection, ConnectionId, ConnectionManager};
use crate::error::Result;
use crate::params::ExecutionParams;
use crate::process::{ExitStatus, ShellProcess};

/// Captured result of a completed command
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteOutput {
    /// The composed command line that ran
    pub command: String,
    /// Final exit status
    pub exit_status: ExitStatus,
    /// Everything the command wrote to stdout
    pub stdout: String,
    /// Everything the command wrote to stderr
    pub stderr: String,
    /// When the process was spawned
    pub started_at: DateTime<Utc>,
    /// When the exit status was retrieved
    pub finished_at: DateTime<Utc>,
}

impl ExecuteOutput {
    /// Wall-clock duration of the execution
    pub fn duration(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }

    /// Stdout with the trailing newline stripped
    pub fn stdout_line(&self) -> &str {
        self.stdout.trim_end_matches('\n')
    }
}

/// Run a command to completion on the given connection
///
/// Drains all output, retrieves the exit status and, when the parameters
/// carry an expected status, fails with `Error::CommandFailed` on a
/// mismatch. The timeout comes from the parameters.
pub async fn execute_with(
    connection: Arc<dyn Connection>,
    command: Command,
    params: ExecutionParams,
) -> Result<ExecuteOutput> {
    let started_at = Utc::now();
    let expected = params.expect_exit_status();

    let mut process = ShellProcess::new(connection, command, params);
    process.execute().await?;
    let exit_status = process.wait(None).await?;
    if let Some(expected) = expected {
        process.check_exit_status(expected)?;
    }

    let streams = process.captured();
    let finished_at = Utc::now();
    debug!(
        "`{}` finished with {} in {:?}",
        process.resolved_command(),
        exit_status,
        (finished_at - started_at).to_std().unwrap_or_default()
    );
    Ok(ExecuteOutput {
        command: process.resolved_command().render(),
        exit_status,
        stdout: streams.stdout,
        stderr: streams.stderr,
        started_at,
        finished_at,
    })
}

/// Spawn a command on the given connection and return the live process
///
/// The caller drives I/O and termination through the [`ShellProcess`] API.
pub async fn process_with(
    connection: Arc<dyn Connection>,
    command: Command,
    params: ExecutionParams,
) -> Result<ShellProcess> {
    let mut process = ShellProcess::new(connection, command, params);
    process.execute().await?;
    Ok(process)
}

impl ConnectionManager {
    /// Run a command to completion on the identified connection
    ///
    /// `None` selects the local connection.
    pub async fn execute(
        &self,
        id: Option<&ConnectionId>,
        command: Command,
        params: ExecutionParams,
    ) -> Result<ExecuteOutput> {
        let connection = match id {
            Some(id) => self.get(id).await?,
            None => self.local().await?,
        };
        execute_with(connection, command, params).await
    }

    /// Spawn a command on the identified connection for streaming use
    pub async fn process(
        &self,
        id: Option<&ConnectionId>,
        command: Command,
        params: ExecutionParams,
    ) -> Result<ShellProcess> {
        let connection = match id {
            Some(id) => self.get(id).await?,
            None => self.local().await?,
        };
        process_with(connection, command, params).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;

    #[test]
    fn test_execute_captures_stdout() {
        block_on(async {
            let manager = ConnectionManager::new();
            let output = manager
                .execute(
                    None,
                    Command::new("echo").arg("hello"),
                    ExecutionParams::builder().build().unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(output.stdout_line(), "hello");
            assert!(output.exit_status.success());
            assert!(output.finished_at >= output.started_at);
        });
    }

    #[test]
    fn test_output_round_trips_as_json() {
        block_on(async {
            let manager = ConnectionManager::new();
            let output = manager
                .execute(
                    None,
                    Command::new("echo").arg("x"),
                    ExecutionParams::builder().build().unwrap(),
                )
                .await
                .unwrap();
            let json = serde_json::to_string(&output).unwrap();
            let back: ExecuteOutput = serde_json::from_str(&json).unwrap();
            assert_eq!(back.stdout, output.stdout);
            assert_eq!(back.exit_status, output.exit_status);
        });
    }
}
