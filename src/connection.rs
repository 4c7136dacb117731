//! Shell connections and the connection cache
//!
//! A [`Connection`] is "where commands run": the local machine or a remote
//! host behind SSH. Connections are cached by identity in an explicit
//! [`ConnectionManager`] owned by the test-session context. Repeated
//! requests for the same endpoint share one logical transport, and closing
//! an entry invalidates it so a later request reconnects.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_process::Child;
use async_trait::async_trait;
use futures::lock::Mutex;
use tracing::{debug, warn};

use crate::command::Command;
use crate::error::{Error, Result};
use crate::params::ExecutionParams;

use crate::backends::local::LocalConnection;
#[cfg(feature = "ssh")]
use crate::backends::ssh::{SshConnection, SshEndpoint};

/// Default maximum number of cached connections
pub const DEFAULT_CONNECTION_CAPACITY: usize = 64;

/// Identity of a connection; equal identities share one cached instance
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ConnectionId {
    /// The local machine
    Local,
    /// A remote host reached over SSH
    #[cfg(feature = "ssh")]
    Ssh(SshEndpoint),
}

/// A transport commands can be executed through
///
/// Implemented by [`LocalConnection`] and [`SshConnection`]; the process
/// state machine and the communication loop are shared by composition, not
/// inheritance, so a transport only supplies process creation, file
/// transfer, and lifecycle primitives.
#[async_trait]
pub trait Connection: Send + Sync {
    /// The identity this connection serves
    fn id(&self) -> ConnectionId;

    /// Whether commands run on the local machine
    fn is_local(&self) -> bool;

    /// Establish the transport; idempotent
    async fn connect(&self) -> Result<()>;

    /// Release the transport and any cached sub-resources; idempotent
    async fn close(&self) -> Result<()>;

    /// Create an OS process or exec channel for the composed command
    ///
    /// Stdio attachment, environment, and working directory come from the
    /// execution parameters. The returned child owns three byte streams and
    /// an eventual integer exit status; that is the entire wire contract.
    async fn spawn(&self, command: &Command, params: &ExecutionParams) -> Result<Child>;

    /// Copy a local file to the connection's filesystem
    async fn put_file(&self, local: &Path, remote: &Path) -> Result<()>;

    /// Copy a file from the connection's filesystem to a local path
    async fn get_file(&self, remote: &Path, local: &Path) -> Result<()>;

    /// Create a temporary directory on the connection's filesystem
    ///
    /// With `auto_remove` the directory is removed when the connection
    /// closes; without it the caller owns cleanup.
    async fn create_temp_dir(&self, auto_remove: bool) -> Result<PathBuf>;

    /// The hostname of the machine commands run on; probed once and cached
    async fn hostname(&self) -> Result<String>;
}

/// Cache of connections keyed by identity
///
/// Constructed once per test session and torn down explicitly; there is no
/// process-wide singleton. The cache is safe for concurrent lookup: a
/// get-or-create race resolves to exactly one connection per identity.
pub struct ConnectionManager {
    connections: Mutex<HashMap<ConnectionId, Arc<dyn Connection>>>,
    capacity: usize,
}

impl ConnectionManager {
    /// Create a manager with the default capacity
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CONNECTION_CAPACITY)
    }

    /// Create a manager bounded to the given number of cached connections
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
            capacity,
        }
    }

    /// Get the cached connection for an identity, constructing it lazily
    ///
    /// Construction is cheap and performs no I/O; the transport is
    /// established on first use via [`Connection::connect`].
    pub async fn get(&self, id: &ConnectionId) -> Result<Arc<dyn Connection>> {
        let mut connections = self.connections.lock().await;
        if let Some(connection) = connections.get(id) {
            return Ok(Arc::clone(connection));
        }
        if connections.len() >= self.capacity {
            return Err(Error::ConnectionLimit {
                capacity: self.capacity,
            });
        }

        let connection: Arc<dyn Connection> = match id {
            ConnectionId::Local => Arc::new(LocalConnection::new()),
            #[cfg(feature = "ssh")]
            ConnectionId::Ssh(endpoint) => Arc::new(SshConnection::new(endpoint.clone())),
        };
        debug!("caching new connection for {:?}", id);
        connections.insert(id.clone(), Arc::clone(&connection));
        Ok(connection)
    }

    /// Get the local connection
    pub async fn local(&self) -> Result<Arc<dyn Connection>> {
        self.get(&ConnectionId::Local).await
    }

    /// Pre-seed the cache with a connection the caller already holds
    ///
    /// Replaces any cached instance with the same identity.
    pub async fn register(&self, connection: Arc<dyn Connection>) -> Result<()> {
        let mut connections = self.connections.lock().await;
        let id = connection.id();
        if !connections.contains_key(&id) && connections.len() >= self.capacity {
            return Err(Error::ConnectionLimit {
                capacity: self.capacity,
            });
        }
        connections.insert(id, connection);
        Ok(())
    }

    /// Close and forget the connection for an identity
    ///
    /// A subsequent [`get`](Self::get) for the same identity reconnects.
    pub async fn close(&self, id: &ConnectionId) -> Result<()> {
        let removed = self.connections.lock().await.remove(id);
        if let Some(connection) = removed {
            connection.close().await?;
        }
        Ok(())
    }

    /// Close every cached connection; used at session teardown
    ///
    /// Every connection is visited even when one fails to close; the first
    /// failure is returned after the sweep completes.
    pub async fn close_all(&self) -> Result<()> {
        let connections: Vec<_> = self.connections.lock().await.drain().collect();
        let mut first_err = None;
        for (id, connection) in connections {
            debug!("closing connection for {:?}", id);
            if let Err(err) = connection.close().await {
                warn!("failed to close connection for {:?}: {}", id, err);
                first_err.get_or_insert(err);
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}
