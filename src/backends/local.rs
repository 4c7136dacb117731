//! Local process execution transport

use std::path::{Path, PathBuf};

use async_process::{Child, Command as AsyncCommand, Stdio};
use async_trait::async_trait;
use futures::lock::Mutex;
use tempfile::TempDir;
use tracing::debug;

use crate::command::Command;
use crate::connection::{Connection, ConnectionId};
use crate::error::{Error, Result};
use crate::params::ExecutionParams;

/// Connection that executes commands on the local machine
///
/// Temporary directories created through this connection are registered for
/// automatic removal when the connection closes, unless the caller opts out.
pub struct LocalConnection {
    hostname: Mutex<Option<String>>,
    temp_dirs: Mutex<Vec<TempDir>>,
}

impl LocalConnection {
    /// Create a local connection
    pub fn new() -> Self {
        Self {
            hostname: Mutex::new(None),
            temp_dirs: Mutex::new(Vec::new()),
        }
    }

    /// Prepare an `async_process::Command` from a composed command and params
    fn prepare(command: &Command, params: &ExecutionParams) -> AsyncCommand {
        let mut cmd = AsyncCommand::new(command.program());
        cmd.args(&command.tokens()[1..]);

        for (key, value) in params.environment() {
            cmd.env(key, value);
        }
        if let Some(dir) = params.current_dir() {
            cmd.current_dir(dir);
        }

        cmd.stdin(stdio_for(params.stdin()));
        cmd.stdout(stdio_for(params.stdout()));
        cmd.stderr(stdio_for(params.stderr()));
        cmd
    }
}

fn stdio_for(attach: bool) -> Stdio {
    if attach {
        Stdio::piped()
    } else {
        Stdio::null()
    }
}

impl Default for LocalConnection {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connection for LocalConnection {
    fn id(&self) -> ConnectionId {
        ConnectionId::Local
    }

    fn is_local(&self) -> bool {
        true
    }

    async fn connect(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        // Dropping a registered TempDir removes the directory
        let removed = self.temp_dirs.lock().await.drain(..).count();
        if removed > 0 {
            debug!("removed {} temporary directories", removed);
        }
        self.hostname.lock().await.take();
        Ok(())
    }

    async fn spawn(&self, command: &Command, params: &ExecutionParams) -> Result<Child> {
        Self::prepare(command, params)
            .spawn()
            .map_err(|e| Error::spawn_failed(format!("failed to spawn `{}`: {}", command, e)))
    }

    async fn put_file(&self, local: &Path, remote: &Path) -> Result<()> {
        async_fs::copy(local, remote).await?;
        Ok(())
    }

    async fn get_file(&self, remote: &Path, local: &Path) -> Result<()> {
        async_fs::copy(remote, local).await?;
        Ok(())
    }

    async fn create_temp_dir(&self, auto_remove: bool) -> Result<PathBuf> {
        let dir = TempDir::new()?;
        let path = dir.path().to_path_buf();
        if auto_remove {
            self.temp_dirs.lock().await.push(dir);
        } else {
            // Caller owns cleanup from here on
            let _ = dir.keep();
        }
        Ok(path)
    }

    async fn hostname(&self) -> Result<String> {
        let mut cached = self.hostname.lock().await;
        if let Some(hostname) = cached.as_ref() {
            return Ok(hostname.clone());
        }

        let output = AsyncCommand::new("hostname")
            .output()
            .await
            .map_err(|e| Error::spawn_failed(format!("failed to probe hostname: {}", e)))?;
        if !output.status.success() {
            return Err(Error::spawn_failed(format!(
                "hostname probe exited with {}",
                output.status
            )));
        }

        let hostname = String::from_utf8_lossy(&output.stdout).trim().to_string();
        *cached = Some(hostname.clone());
        Ok(hostname)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_temp_dir_removed_on_close() {
        futures::executor::block_on(async {
            let connection = LocalConnection::new();
            let path = connection.create_temp_dir(true).await.unwrap();
            assert!(path.is_dir());

            connection.close().await.unwrap();
            assert!(!path.exists());
        });
    }

    #[test]
    fn test_temp_dir_opt_out_survives_close() {
        futures::executor::block_on(async {
            let connection = LocalConnection::new();
            let path = connection.create_temp_dir(false).await.unwrap();

            connection.close().await.unwrap();
            assert!(path.is_dir());

            std::fs::remove_dir_all(&path).unwrap();
        });
    }

    #[test]
    fn test_hostname_probe_cached() {
        futures::executor::block_on(async {
            let connection = LocalConnection::new();
            let first = connection.hostname().await.unwrap();
            assert!(!first.is_empty());

            let second = connection.hostname().await.unwrap();
            assert_eq!(first, second);
        });
    }

    #[test]
    fn test_file_copy_roundtrip() {
        futures::executor::block_on(async {
            let connection = LocalConnection::new();
            let dir = connection.create_temp_dir(true).await.unwrap();

            let src = dir.join("src.txt");
            let dst = dir.join("dst.txt");
            std::fs::write(&src, b"payload").unwrap();

            connection.put_file(&src, &dst).await.unwrap();
            assert_eq!(std::fs::read(&dst).unwrap(), b"payload");

            connection.close().await.unwrap();
        });
    }

    #[test]
    fn test_spawn_respects_stdio_flags() {
        futures::executor::block_on(async {
            let connection = LocalConnection::new();
            let params = ExecutionParams::builder().build().unwrap();
            let command = Command::new("true");

            let mut child = connection.spawn(&command, &params).await.unwrap();
            assert!(child.stdin.is_none());
            assert!(child.stdout.is_some());
            assert!(child.stderr.is_some());

            let status = child.status().await.unwrap();
            assert!(status.success());
        });
    }
}
