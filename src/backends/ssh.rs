//! SSH remote execution transport
//!
//! The SSH protocol itself is delegated to the OpenSSH client. One logical
//! connection per endpoint identity is realized as a ControlMaster session:
//! the master (`ssh -M -N -S <socket>`) owns the TCP connection, and every
//! exec channel is a multiplexed client over its control socket. File
//! transfers ride the same socket through `scp`, serialized by a single
//! transfer token so concurrent copies through one connection never
//! interleave. Closing the connection tears the master down; a later use
//! reconnects from scratch.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_channel::{Receiver, Sender};
use async_process::{Child, Command as AsyncCommand, Stdio};
use async_trait::async_trait;
use futures::io::AsyncReadExt;
use futures::lock::Mutex;
use tempfile::TempDir;
use tracing::{debug, warn};

use crate::command::{shell_escape, Command};
use crate::connection::{Connection, ConnectionId};
use crate::error::{Error, Result};
use crate::params::{ExecutionParams, DEFAULT_CONNECT_TIMEOUT};
use crate::retry::RetryPolicy;

/// Interval between checks for the control socket while connecting
const SOCKET_PROBE_INTERVAL: Duration = Duration::from_millis(100);

/// Identity of an SSH endpoint: equal tuples share one cached connection
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SshEndpoint {
    host: String,
    port: u16,
    user: Option<String>,
    identity_file: Option<PathBuf>,
}

impl SshEndpoint {
    /// Create an endpoint for the given host with default port 22
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: 22,
            user: None,
            identity_file: None,
        }
    }

    /// Set the SSH user
    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    /// Set the SSH port
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the identity file (private key)
    pub fn with_identity_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.identity_file = Some(path.into());
        self
    }

    /// Get the host
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Get the destination string (user@host if user is specified)
    pub fn destination(&self) -> String {
        match &self.user {
            Some(user) => format!("{}@{}", user, self.host),
            None => self.host.clone(),
        }
    }
}

/// Interior transport state guarded by one lock
#[derive(Default)]
struct MasterState {
    master: Option<Child>,
    control: Option<TempDir>,
    hostname: Option<String>,
    remote_temp_dirs: Vec<PathBuf>,
}

impl MasterState {
    fn control_path(&self) -> Option<PathBuf> {
        self.control
            .as_ref()
            .map(|dir| dir.path().join("control.sock"))
    }
}

/// Connection that executes commands on a remote host over SSH
pub struct SshConnection {
    endpoint: SshEndpoint,
    /// Extra `-o` options passed to every ssh/scp invocation
    options: Vec<String>,
    connect_timeout: Duration,
    state: Mutex<MasterState>,
    transfer_tx: Sender<()>,
    transfer_rx: Receiver<()>,
}

impl SshConnection {
    /// Create a connection for the given endpoint; no I/O happens here
    pub fn new(endpoint: SshEndpoint) -> Self {
        let (transfer_tx, transfer_rx) = async_channel::bounded(1);
        // Seed the single transfer token
        let _ = transfer_tx.try_send(());
        Self {
            endpoint,
            options: Vec::new(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            state: Mutex::new(MasterState::default()),
            transfer_tx,
            transfer_rx,
        }
    }

    /// Add an `-o` option applied to every ssh/scp invocation
    pub fn with_option(mut self, option: impl Into<String>) -> Self {
        self.options.push(option.into());
        self
    }

    /// Set the deadline for establishing the control master
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    fn base_args(&self, control: &Path) -> Vec<String> {
        let mut args = vec![
            "-S".to_string(),
            control.to_string_lossy().into_owned(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
        ];
        if self.endpoint.port != 22 {
            args.push("-p".to_string());
            args.push(self.endpoint.port.to_string());
        }
        if let Some(identity) = &self.endpoint.identity_file {
            args.push("-i".to_string());
            args.push(identity.to_string_lossy().into_owned());
        }
        for option in &self.options {
            args.push("-o".to_string());
            args.push(option.clone());
        }
        args
    }

    /// Argument vector for an exec channel running `line` on the remote
    fn client_args(&self, control: &Path, line: &str) -> Vec<String> {
        let mut args = self.base_args(control);
        args.push(self.endpoint.destination());
        args.push("--".to_string());
        args.push(line.to_string());
        args
    }

    /// Ensure the control master is up, returning the control socket path
    async fn ensure_master(&self, state: &mut MasterState) -> Result<PathBuf> {
        if let Some(master) = state.master.as_mut() {
            match master.try_status()? {
                None => {
                    if let Some(path) = state.control_path() {
                        return Ok(path);
                    }
                }
                Some(status) => {
                    warn!(
                        "ssh control master for {} exited with {}",
                        self.endpoint.host, status
                    );
                    state.master = None;
                    state.control = None;
                    state.hostname = None;
                }
            }
        }

        let control = tempfile::Builder::new().prefix("shexec-ssh-").tempdir()?;
        let control_path = control.path().join("control.sock");

        let mut cmd = AsyncCommand::new("ssh");
        cmd.arg("-M").arg("-N");
        cmd.args(self.base_args(&control_path));
        cmd.arg(self.endpoint.destination());
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());

        debug!("establishing ssh control master for {}", self.endpoint.host);
        let mut master = cmd.spawn().map_err(|e| {
            Error::connection_failed(&self.endpoint.host, format!("failed to run ssh: {}", e))
        })?;

        // The socket appears once the master has authenticated
        let policy =
            RetryPolicy::from_parts(None, SOCKET_PROBE_INTERVAL, Some(self.connect_timeout));
        let mut attempts = policy.attempts();
        let mut established = false;
        while let Some(attempt) = attempts.next().await {
            if control_path.exists() {
                established = true;
                break;
            }
            if let Some(status) = master.try_status()? {
                let stderr = drain_stderr(&mut master).await;
                return Err(Error::connection_failed(
                    &self.endpoint.host,
                    format!("ssh exited with {}: {}", status, stderr),
                ));
            }
            if attempt.is_last {
                break;
            }
        }

        if !established {
            let _ = master.kill();
            return Err(Error::connection_failed(
                &self.endpoint.host,
                format!(
                    "timed out waiting for control socket after {:?}",
                    self.connect_timeout
                ),
            ));
        }

        state.master = Some(master);
        state.control = Some(control);
        Ok(control_path)
    }

    /// Run a short housekeeping command on the remote, capturing its output
    async fn run_remote(&self, control: &Path, line: &str) -> Result<std::process::Output> {
        let mut cmd = AsyncCommand::new("ssh");
        cmd.args(self.client_args(control, line));
        cmd.stdin(Stdio::null());
        cmd.output()
            .await
            .map_err(|e| Error::spawn_failed(format!("failed to run ssh: {}", e)))
    }

    /// Build the remote command line: working directory, environment, command
    fn remote_line(command: &Command, params: &ExecutionParams) -> String {
        let mut line = String::new();
        if let Some(dir) = params.current_dir() {
            line.push_str("cd ");
            line.push_str(&shell_escape(&dir.to_string_lossy()));
            line.push_str(" && ");
        }
        if !params.environment().is_empty() {
            line.push_str("env");
            let mut entries: Vec<_> = params.environment().iter().collect();
            entries.sort();
            for (key, value) in entries {
                line.push(' ');
                line.push_str(key);
                line.push('=');
                line.push_str(&shell_escape(value));
            }
            line.push(' ');
        }
        line.push_str(&command.render());
        line
    }

    async fn transfer(&self, source: String, target: String) -> Result<()> {
        // Single-writer discipline: one transfer per connection at a time
        let _token = TransferToken::acquire(self).await;
        let control = {
            let mut state = self.state.lock().await;
            self.ensure_master(&mut state).await?
        };

        let mut cmd = AsyncCommand::new("scp");
        cmd.arg("-o")
            .arg(format!("ControlPath={}", control.display()))
            .arg("-o")
            .arg("BatchMode=yes");
        if self.endpoint.port != 22 {
            cmd.arg("-P").arg(self.endpoint.port.to_string());
        }
        if let Some(identity) = &self.endpoint.identity_file {
            cmd.arg("-i").arg(identity);
        }
        for option in &self.options {
            cmd.arg("-o").arg(option);
        }
        cmd.arg(&source).arg(&target);
        cmd.stdin(Stdio::null());

        let output = cmd
            .output()
            .await
            .map_err(|e| Error::spawn_failed(format!("failed to run scp: {}", e)))?;
        if !output.status.success() {
            return Err(Error::connection_failed(
                &self.endpoint.host,
                format!(
                    "scp {} -> {} failed: {}",
                    source,
                    target,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            ));
        }
        Ok(())
    }

    fn remote_path(&self, path: &Path) -> String {
        format!("{}:{}", self.endpoint.destination(), path.display())
    }
}

/// Holder of the connection's single file-transfer token
struct TransferToken<'a> {
    tx: &'a Sender<()>,
}

impl<'a> TransferToken<'a> {
    async fn acquire(connection: &'a SshConnection) -> TransferToken<'a> {
        // Both channel ends live as long as the connection
        let _ = connection.transfer_rx.recv().await;
        TransferToken {
            tx: &connection.transfer_tx,
        }
    }
}

impl Drop for TransferToken<'_> {
    fn drop(&mut self) {
        let _ = self.tx.try_send(());
    }
}

async fn drain_stderr(child: &mut Child) -> String {
    match child.stderr.take() {
        Some(mut stderr) => {
            let mut buf = String::new();
            let _ = stderr.read_to_string(&mut buf).await;
            buf.trim().to_string()
        }
        None => String::new(),
    }
}

#[async_trait]
impl Connection for SshConnection {
    fn id(&self) -> ConnectionId {
        ConnectionId::Ssh(self.endpoint.clone())
    }

    fn is_local(&self) -> bool {
        false
    }

    async fn connect(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        self.ensure_master(&mut state).await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(control) = state.control_path() {
            for dir in std::mem::take(&mut state.remote_temp_dirs) {
                let line = format!("rm -rf {}", shell_escape(&dir.to_string_lossy()));
                if let Err(err) = self.run_remote(&control, &line).await {
                    warn!("failed to remove remote temp dir {:?}: {}", dir, err);
                }
            }

            // Ask the master to exit cleanly before falling back to kill
            let mut cmd = AsyncCommand::new("ssh");
            cmd.arg("-O").arg("exit");
            cmd.args(self.base_args(&control));
            cmd.arg(self.endpoint.destination());
            cmd.stdin(Stdio::null());
            let _ = cmd.output().await;
        }

        if let Some(mut master) = state.master.take() {
            let _ = master.kill();
            let _ = master.status().await;
            debug!("closed ssh control master for {}", self.endpoint.host);
        }
        state.control = None;
        state.hostname = None;
        Ok(())
    }

    async fn spawn(&self, command: &Command, params: &ExecutionParams) -> Result<Child> {
        let control = {
            let mut state = self.state.lock().await;
            self.ensure_master(&mut state).await?
        };

        let line = Self::remote_line(command, params);
        let mut cmd = AsyncCommand::new("ssh");
        cmd.args(self.client_args(&control, &line));
        cmd.stdin(stdio_for(params.stdin()));
        cmd.stdout(stdio_for(params.stdout()));
        cmd.stderr(stdio_for(params.stderr()));

        cmd.spawn()
            .map_err(|e| Error::spawn_failed(format!("failed to spawn `{}`: {}", command, e)))
    }

    async fn put_file(&self, local: &Path, remote: &Path) -> Result<()> {
        self.transfer(local.display().to_string(), self.remote_path(remote))
            .await
    }

    async fn get_file(&self, remote: &Path, local: &Path) -> Result<()> {
        self.transfer(self.remote_path(remote), local.display().to_string())
            .await
    }

    async fn create_temp_dir(&self, auto_remove: bool) -> Result<PathBuf> {
        let control = {
            let mut state = self.state.lock().await;
            self.ensure_master(&mut state).await?
        };

        let output = self.run_remote(&control, "mktemp -d").await?;
        if !output.status.success() {
            return Err(Error::spawn_failed(format!(
                "remote mktemp exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let path = PathBuf::from(String::from_utf8_lossy(&output.stdout).trim());
        if auto_remove {
            self.state.lock().await.remote_temp_dirs.push(path.clone());
        }
        Ok(path)
    }

    async fn hostname(&self) -> Result<String> {
        let control = {
            let mut state = self.state.lock().await;
            if let Some(hostname) = state.hostname.as_ref() {
                return Ok(hostname.clone());
            }
            self.ensure_master(&mut state).await?
        };

        let output = self.run_remote(&control, "hostname").await?;
        if !output.status.success() {
            return Err(Error::connection_failed(
                &self.endpoint.host,
                format!("hostname probe exited with {}", output.status),
            ));
        }

        let hostname = String::from_utf8_lossy(&output.stdout).trim().to_string();
        self.state.lock().await.hostname = Some(hostname.clone());
        Ok(hostname)
    }
}

fn stdio_for(attach: bool) -> Stdio {
    if attach {
        Stdio::piped()
    } else {
        Stdio::null()
    }
}
