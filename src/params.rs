//! Execution parameters
//!
//! All tunables for a single command execution live in [`ExecutionParams`],
//! an explicit value object constructed through a validating builder. There
//! is no dynamic fallback or hidden global configuration: what the builder
//! accepted is what the engine runs with.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::retry::RetryPolicy;

/// Default read/write chunk size for the communication loop
pub const DEFAULT_BUFFER_SIZE: usize = 4096;

/// Default idle readiness-poll interval for the communication loop
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Default attempt count for remote process creation
pub const DEFAULT_CONNECT_COUNT: u32 = 3;

/// Default sleep between remote process creation attempts
pub const DEFAULT_CONNECT_INTERVAL: Duration = Duration::from_secs(5);

/// Default overall deadline for remote process creation
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(120);

/// Default ceiling on a remote exit-status wait
///
/// An SSH exec channel can outlive its remote process when the transport
/// degrades, so remote status waits are never unbounded. Configurable via
/// [`ExecutionParamsBuilder::status_wait_ceiling`].
pub const DEFAULT_STATUS_WAIT_CEILING: Duration = Duration::from_secs(120);

/// Whether and how to prefix a command with sudo
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum SudoPolicy {
    /// No preference; sudo is applied only when implied (network namespace)
    #[default]
    Unset,
    /// Prefix with the default `sudo`
    Enabled,
    /// Never prefix with sudo, even when a namespace would imply it
    Disabled,
    /// Prefix with an explicit override command, e.g. `sudo -E`
    Command(String),
}

/// Whether and how to hand the command to a shell interpreter
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ShellPolicy {
    /// No shell wrapping
    #[default]
    Unset,
    /// Explicitly no shell wrapping
    Disabled,
    /// Wrap with the default `/bin/sh -c`
    Enabled,
    /// Wrap with an explicit interpreter, e.g. `bash -c`
    Command(String),
}

/// Configuration for a single command execution
#[derive(Debug, Clone)]
pub struct ExecutionParams {
    environment: HashMap<String, String>,
    current_dir: Option<PathBuf>,
    timeout: Option<Duration>,
    stdin: bool,
    stdout: bool,
    stderr: bool,
    stdin_data: Option<Vec<u8>>,
    sudo: SudoPolicy,
    shell: ShellPolicy,
    network_namespace: Option<String>,
    buffer_size: usize,
    poll_interval: Duration,
    connect_count: u32,
    connect_interval: Duration,
    connect_timeout: Duration,
    expect_exit_status: Option<i32>,
    status_wait_ceiling: Duration,
}

impl ExecutionParams {
    /// Create a builder with the default parameter set
    pub fn builder() -> ExecutionParamsBuilder {
        ExecutionParamsBuilder::new()
    }

    /// Environment variables to set for the process
    pub fn environment(&self) -> &HashMap<String, String> {
        &self.environment
    }

    /// Working directory for the process
    pub fn current_dir(&self) -> Option<&Path> {
        self.current_dir.as_deref()
    }

    /// Overall execution deadline; `None` means unbounded
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Whether stdin is attached
    pub fn stdin(&self) -> bool {
        self.stdin
    }

    /// Whether stdout is attached
    pub fn stdout(&self) -> bool {
        self.stdout
    }

    /// Whether stderr is attached
    pub fn stderr(&self) -> bool {
        self.stderr
    }

    /// Payload to feed to the process stdin, if any
    pub fn stdin_data(&self) -> Option<&[u8]> {
        self.stdin_data.as_deref()
    }

    /// Sudo composition policy
    pub fn sudo(&self) -> &SudoPolicy {
        &self.sudo
    }

    /// Shell composition policy
    pub fn shell(&self) -> &ShellPolicy {
        &self.shell
    }

    /// Network namespace to execute inside, if any
    pub fn network_namespace(&self) -> Option<&str> {
        self.network_namespace.as_deref()
    }

    /// Read/write chunk size for the communication loop
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Idle readiness-poll interval for the communication loop
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Exit status the caller expects; `None` disables the check
    pub fn expect_exit_status(&self) -> Option<i32> {
        self.expect_exit_status
    }

    /// Ceiling applied to a remote exit-status wait
    pub fn status_wait_ceiling(&self) -> Duration {
        self.status_wait_ceiling
    }

    /// Retry policy for establishing a remote process
    pub fn connect_retry_policy(&self) -> RetryPolicy {
        RetryPolicy::from_parts(
            Some(self.connect_count),
            self.connect_interval,
            Some(self.connect_timeout),
        )
    }

    /// Retry policy bounding a communication loop, if a deadline applies
    ///
    /// The returned policy carries only a time bound; the communication loop
    /// consults it cooperatively between readiness rounds.
    pub fn deadline_policy(&self, timeout: Option<Duration>) -> Option<RetryPolicy> {
        let bound = timeout.or(self.timeout)?;
        Some(RetryPolicy::from_parts(None, self.poll_interval, Some(bound)))
    }
}

impl Default for ExecutionParams {
    fn default() -> Self {
        Self {
            environment: HashMap::new(),
            current_dir: None,
            timeout: None,
            stdin: false,
            stdout: true,
            stderr: true,
            stdin_data: None,
            sudo: SudoPolicy::Unset,
            shell: ShellPolicy::Unset,
            network_namespace: None,
            buffer_size: DEFAULT_BUFFER_SIZE,
            poll_interval: DEFAULT_POLL_INTERVAL,
            connect_count: DEFAULT_CONNECT_COUNT,
            connect_interval: DEFAULT_CONNECT_INTERVAL,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            expect_exit_status: Some(0),
            status_wait_ceiling: DEFAULT_STATUS_WAIT_CEILING,
        }
    }
}

/// Builder for [`ExecutionParams`]
///
/// Validation happens in [`build`](ExecutionParamsBuilder::build), before
/// any side effect of the execution occurs.
#[derive(Debug, Clone, Default)]
pub struct ExecutionParamsBuilder {
    params: ExecutionParams,
}

impl ExecutionParamsBuilder {
    /// Create a builder with the default parameter set
    pub fn new() -> Self {
        Self::default()
    }

    /// Set an environment variable for the process
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.environment.insert(key.into(), value.into());
        self
    }

    /// Set the working directory for the process
    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.params.current_dir = Some(dir.into());
        self
    }

    /// Set the overall execution deadline
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.params.timeout = Some(timeout);
        self
    }

    /// Attach or detach stdin
    pub fn stdin(mut self, attach: bool) -> Self {
        self.params.stdin = attach;
        self
    }

    /// Attach or detach stdout
    pub fn stdout(mut self, attach: bool) -> Self {
        self.params.stdout = attach;
        self
    }

    /// Attach or detach stderr
    pub fn stderr(mut self, attach: bool) -> Self {
        self.params.stderr = attach;
        self
    }

    /// Feed the given payload to the process stdin (implies `stdin(true)`)
    pub fn stdin_data(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.params.stdin = true;
        self.params.stdin_data = Some(data.into());
        self
    }

    /// Enable or disable the sudo prefix
    pub fn sudo(mut self, enabled: bool) -> Self {
        self.params.sudo = if enabled {
            SudoPolicy::Enabled
        } else {
            SudoPolicy::Disabled
        };
        self
    }

    /// Use an explicit sudo override command, e.g. `sudo -E`
    pub fn sudo_command(mut self, command: impl Into<String>) -> Self {
        self.params.sudo = SudoPolicy::Command(command.into());
        self
    }

    /// Enable or disable shell wrapping
    pub fn shell(mut self, enabled: bool) -> Self {
        self.params.shell = if enabled {
            ShellPolicy::Enabled
        } else {
            ShellPolicy::Disabled
        };
        self
    }

    /// Use an explicit shell interpreter, e.g. `bash -c`
    pub fn shell_command(mut self, command: impl Into<String>) -> Self {
        self.params.shell = ShellPolicy::Command(command.into());
        self
    }

    /// Execute inside the given network namespace (implies sudo)
    pub fn network_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.params.network_namespace = Some(namespace.into());
        self
    }

    /// Set the read/write chunk size for the communication loop
    pub fn buffer_size(mut self, size: usize) -> Self {
        self.params.buffer_size = size;
        self
    }

    /// Set the idle readiness-poll interval for the communication loop
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.params.poll_interval = interval;
        self
    }

    /// Set the attempt count for remote process creation
    pub fn connect_count(mut self, count: u32) -> Self {
        self.params.connect_count = count;
        self
    }

    /// Set the sleep between remote process creation attempts
    pub fn connect_interval(mut self, interval: Duration) -> Self {
        self.params.connect_interval = interval;
        self
    }

    /// Set the overall deadline for remote process creation
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.params.connect_timeout = timeout;
        self
    }

    /// Set the exit status the caller expects (default 0)
    pub fn expect_exit_status(mut self, status: i32) -> Self {
        self.params.expect_exit_status = Some(status);
        self
    }

    /// Disable the expected exit status check
    pub fn no_status_check(mut self) -> Self {
        self.params.expect_exit_status = None;
        self
    }

    /// Set the ceiling applied to a remote exit-status wait
    pub fn status_wait_ceiling(mut self, ceiling: Duration) -> Self {
        self.params.status_wait_ceiling = ceiling;
        self
    }

    /// Validate and build the parameter set
    pub fn build(self) -> Result<ExecutionParams> {
        let params = self.params;
        if params.buffer_size == 0 {
            return Err(Error::invalid_params("buffer_size must be non-zero"));
        }
        if params.poll_interval.is_zero() {
            return Err(Error::invalid_params("poll_interval must be non-zero"));
        }
        if params.connect_count == 0 {
            return Err(Error::invalid_params("connect_count must be non-zero"));
        }
        if params.connect_timeout.is_zero() {
            return Err(Error::invalid_params("connect_timeout must be non-zero"));
        }
        if params.status_wait_ceiling.is_zero() {
            return Err(Error::invalid_params(
                "status_wait_ceiling must be non-zero",
            ));
        }
        if params.stdin_data.is_some() && !params.stdin {
            return Err(Error::invalid_params(
                "stdin_data requires stdin to be attached",
            ));
        }
        Ok(params)
    }
}
