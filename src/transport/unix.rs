use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tokio::net::{UnixListener, UnixStream};
use tracing::debug;

use super::Connection;

pub(super) struct Listener {
    listener: UnixListener,
    path: PathBuf,
}

impl Listener {
    pub(super) async fn accept(&mut self) -> io::Result<Connection> {
        let (stream, _addr) = self.listener.accept().await?;
        Ok(Box::new(stream))
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

pub(super) fn listen(path: &Path, exclusive: bool) -> io::Result<Listener> {
    let listener = match UnixListener::bind(path) {
        Ok(listener) => listener,
        Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
            // Socket files outlive crashed processes; only a live peer counts
            if exclusive && std::os::unix::net::UnixStream::connect(path).is_ok() {
                return Err(e);
            }
            debug!("Removing stale socket at {:?}", path);
            std::fs::remove_file(path)?;
            UnixListener::bind(path)?
        }
        Err(e) => return Err(e),
    };
    Ok(Listener {
        listener,
        path: path.to_path_buf(),
    })
}

pub(super) async fn connect(path: &Path) -> io::Result<Connection> {
    let stream = UnixStream::connect(path).await?;
    Ok(Box::new(stream))
}

/// Missing or not-yet-listening sockets are worth another attempt
pub(super) fn is_retryable(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused
    )
}

/// The daemon usually runs as root while the CLI does not
pub(super) fn grant_local_users(path: &Path) -> io::Result<()> {
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o666))
}

pub(super) fn remove(path: &Path) -> io::Result<()> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

pub(super) fn default_server_address() -> PathBuf {
    std::env::temp_dir().join("wock.sock")
}
