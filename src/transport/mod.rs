//! Connection-oriented IPC transport between the CLI and the daemon
//!
//! Unix domain sockets on POSIX, named pipes on Windows. The daemon owns one
//! fixed, well-known address; every client session binds its own ephemeral
//! address derived from its [`ClientId`](crate::daemon::protocol::ClientId) so
//! the daemon can dial back with replies.

#[cfg(unix)]
mod unix;
#[cfg(unix)]
use unix as sys;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
use windows as sys;

use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::daemon::protocol::ClientId;

/// Interval between connection attempts while waiting for an address to appear
pub const DIAL_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Default time to wait for an address to become reachable
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(1);

/// A bidirectional byte stream over the platform IPC primitive
pub trait IpcStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> IpcStream for T {}

/// Boxed stream handed out by dials and accepts
pub type Connection = Box<dyn IpcStream>;

/// Errors raised by the transport layer
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("timed out waiting for {} to become reachable", .address.display())]
    Timeout { address: PathBuf },

    #[error("another process is already listening on {}", .address.display())]
    AlreadyRunning { address: PathBuf },

    #[error("IPC error on {}: {source}", .address.display())]
    Io {
        address: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl TransportError {
    fn io(address: &Path, source: std::io::Error) -> Self {
        Self::Io {
            address: address.to_path_buf(),
            source,
        }
    }
}

/// A bound IPC address accepting inbound connections
pub struct Listener {
    inner: sys::Listener,
    address: PathBuf,
}

impl Listener {
    /// Wait for the next inbound connection
    pub async fn accept(&mut self) -> Result<Connection, TransportError> {
        self.inner
            .accept()
            .await
            .map_err(|e| TransportError::io(&self.address, e))
    }

    /// Address this listener is bound to
    pub fn address(&self) -> &Path {
        &self.address
    }
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("address", &self.address)
            .finish()
    }
}

/// The daemon's well-known address and the per-client addresses derived from it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    server: PathBuf,
}

impl Default for Endpoint {
    fn default() -> Self {
        Self::new(default_server_address())
    }
}

impl Endpoint {
    /// Create an endpoint rooted at the given daemon address
    pub fn new(server: impl Into<PathBuf>) -> Self {
        Self {
            server: server.into(),
        }
    }

    /// The daemon's fixed address
    pub fn server_address(&self) -> &Path {
        &self.server
    }

    /// Ephemeral address for a client session: `<server>-<client id>`
    pub fn client_address(&self, client_id: &ClientId) -> PathBuf {
        let mut address = self.server.clone().into_os_string();
        address.push(format!("-{}", client_id));
        PathBuf::from(address)
    }

    /// Connect to the daemon, waiting up to `timeout` for it to appear
    pub async fn dial_server(&self, timeout: Duration) -> Result<Connection, TransportError> {
        dial(&self.server, timeout).await
    }

    /// Connect to a client's ephemeral address, waiting up to `timeout`
    pub async fn dial_client(
        &self,
        client_id: &ClientId,
        timeout: Duration,
    ) -> Result<Connection, TransportError> {
        dial(&self.client_address(client_id), timeout).await
    }

    /// Bind the daemon's fixed address exclusively
    ///
    /// Fails with [`TransportError::AlreadyRunning`] when a live process
    /// already owns the address.
    pub fn listen_server(&self) -> Result<Listener, TransportError> {
        listen(&self.server, true)
    }

    /// Bind a client's ephemeral address
    pub fn listen_client(&self, client_id: &ClientId) -> Result<Listener, TransportError> {
        listen(&self.client_address(client_id), false)
    }

    /// Check for a running daemon by contending for its address
    ///
    /// A successful bind means nothing owns the address; the transient
    /// listener is released immediately. This is a secondary guard only, the
    /// client's ping handshake is the authoritative liveness check.
    pub fn probe_server_alive(&self) -> bool {
        match self.listen_server() {
            Ok(listener) => {
                drop(listener);
                false
            }
            Err(TransportError::AlreadyRunning { .. }) => true,
            Err(e) => {
                debug!("Server probe bind failed: {}", e);
                true
            }
        }
    }

    /// Remove the filesystem artifact backing the daemon's address
    pub fn teardown(&self) -> Result<(), TransportError> {
        sys::remove(&self.server).map_err(|e| TransportError::io(&self.server, e))
    }
}

async fn dial(address: &Path, timeout: Duration) -> Result<Connection, TransportError> {
    let deadline = Instant::now() + timeout;
    loop {
        match sys::connect(address).await {
            Ok(stream) => return Ok(stream),
            Err(e) if sys::is_retryable(&e) => {}
            Err(e) => return Err(TransportError::io(address, e)),
        }
        if Instant::now() + DIAL_POLL_INTERVAL > deadline {
            return Err(TransportError::Timeout {
                address: address.to_path_buf(),
            });
        }
        tokio::time::sleep(DIAL_POLL_INTERVAL).await;
    }
}

fn listen(address: &Path, exclusive: bool) -> Result<Listener, TransportError> {
    let inner = sys::listen(address, exclusive).map_err(|e| match e.kind() {
        std::io::ErrorKind::AddrInUse => TransportError::AlreadyRunning {
            address: address.to_path_buf(),
        },
        _ => TransportError::io(address, e),
    })?;
    if let Err(e) = sys::grant_local_users(address) {
        warn!("Failed to relax permissions on {:?}: {}", address, e);
    }
    debug!("Listening on {:?}", address);
    Ok(Listener {
        inner,
        address: address.to_path_buf(),
    })
}

/// Default daemon address for this platform
pub fn default_server_address() -> PathBuf {
    sys::default_server_address()
}
