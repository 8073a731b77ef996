//! Daemon client used by short-lived CLI invocations
//!
//! A [`Client`] owns one outbound connection to the daemon's fixed address
//! and one ephemeral inbound address the daemon dials back with replies. A
//! background task accepts those reply connections and forwards every reply
//! into a small channel; each call then waits on that channel for the reply
//! carrying its own request id.

use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tokio::io::BufReader;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::daemon::protocol::{
    encode_payload, read_message, write_message, ClientId, Message, MessageType, MockData,
    MockedHost, ProtocolError, RequestId, UnmockData,
};
use crate::hosts::normalize_hostname;
use crate::transport::{Connection, Endpoint, Listener, TransportError, DEFAULT_DIAL_TIMEOUT};

/// Time to wait for the reply to a call
pub const CLIENT_TIMEOUT: Duration = Duration::from_secs(5);

/// Time to wait for the reply to a liveness ping
pub const PING_TIMEOUT: Duration = Duration::from_secs(1);

/// Timeout for daemon startup check
const STARTUP_TIMEOUT: Duration = Duration::from_secs(5);

/// Replies buffered between the reader task and the caller
const RESPONSE_CHANNEL_CAPACITY: usize = 2;

/// Errors that can occur when communicating with the daemon
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Daemon is not running")]
    DaemonNotRunning,

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Request timed out")]
    Timeout,

    #[error("Daemon returned error: {0}")]
    DaemonError(String),

    #[error("Unexpected response from daemon")]
    UnexpectedResponse,

    #[error("Connection closed by daemon")]
    ConnectionClosed,

    #[error("Failed to start daemon: {0}")]
    DaemonStartFailed(String),

    #[error("Invalid hostname '{0}'")]
    InvalidHostname(String),

    #[error("Invalid directory {}: {reason}", .path.display())]
    InvalidDirectory { path: PathBuf, reason: String },
}

/// Client session talking to the wock daemon
pub struct Client {
    server: Connection,
    client_id: ClientId,
    endpoint: Endpoint,
    received: mpsc::Receiver<Message>,
    reader: JoinHandle<()>,
    timeout: Duration,
}

impl Client {
    /// Connect to an existing daemon at the default address
    pub async fn connect() -> Result<Self, ClientError> {
        Self::connect_to(Endpoint::default()).await
    }

    /// Connect to an existing daemon at the given endpoint
    pub async fn connect_to(endpoint: Endpoint) -> Result<Self, ClientError> {
        Self::connect_with(endpoint, DEFAULT_DIAL_TIMEOUT).await
    }

    /// Connect, waiting up to `dial_timeout` for the daemon's address
    pub async fn connect_with(endpoint: Endpoint, dial_timeout: Duration) -> Result<Self, ClientError> {
        let client_id = ClientId::new();
        debug!(%client_id, "Connecting to daemon at {:?}", endpoint.server_address());

        let server = endpoint
            .dial_server(dial_timeout)
            .await
            .map_err(|e| match e {
                TransportError::Timeout { .. } => ClientError::DaemonNotRunning,
                other => ClientError::Transport(other),
            })?;

        let inbox = endpoint.listen_client(&client_id)?;
        let (tx, received) = mpsc::channel(RESPONSE_CHANNEL_CAPACITY);
        let reader = tokio::spawn(read_replies(inbox, tx));

        Ok(Self {
            server,
            client_id,
            endpoint,
            received,
            reader,
            timeout: CLIENT_TIMEOUT,
        })
    }

    /// Connect to the daemon, starting it if not running
    ///
    /// This will:
    /// 1. Ping an existing daemon
    /// 2. If there is none, spawn `wock start` as a detached process
    /// 3. Wait up to 5 seconds for its address to accept connections
    pub async fn connect_or_start(endpoint: Endpoint) -> Result<Self, ClientError> {
        if daemon_running(&endpoint).await {
            debug!("Connected to existing daemon");
            return Self::connect_to(endpoint).await;
        }

        debug!("Daemon not running, starting it");
        start_daemon()?;

        match Self::connect_with(endpoint, STARTUP_TIMEOUT).await {
            Ok(client) => {
                info!("Connected to newly started daemon");
                Ok(client)
            }
            Err(ClientError::DaemonNotRunning) => Err(ClientError::DaemonStartFailed(
                "Daemon started but did not become reachable within timeout".to_string(),
            )),
            Err(e) => Err(e),
        }
    }

    /// Override the per-call reply timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Send a request and wait for the reply carrying its request id
    async fn call(
        &mut self,
        msg_type: MessageType,
        data: Vec<u8>,
        timeout: Duration,
    ) -> Result<Message, ClientError> {
        let request_id = RequestId::new();
        let request = Message::request(msg_type, self.client_id, request_id, data);
        debug!(client_id = %self.client_id, %request_id, ?msg_type, "Sending request");
        write_message(&mut self.server, &request).await?;

        let deadline = Instant::now() + timeout;
        let reply = loop {
            match tokio::time::timeout_at(deadline, self.received.recv()).await {
                Err(_) => break Message::timeout(),
                Ok(None) => return Err(ClientError::ConnectionClosed),
                Ok(Some(reply)) if reply.request_id == Some(request_id) => break reply,
                Ok(Some(stale)) => {
                    debug!(request_id = ?stale.request_id, "Discarding stale reply");
                }
            }
        };

        match reply.msg_type {
            MessageType::Success => Ok(reply),
            MessageType::Error => Err(ClientError::DaemonError(reply.text())),
            MessageType::Timeout => Err(ClientError::Timeout),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    /// Check if the daemon is alive with a Status round trip
    pub async fn ping(&mut self) -> Result<(), ClientError> {
        self.call(MessageType::Status, Vec::new(), PING_TIMEOUT)
            .await
            .map(|_| ())
    }

    /// List the mocked hosts
    pub async fn status(&mut self) -> Result<Vec<MockedHost>, ClientError> {
        let reply = self.call(MessageType::Status, Vec::new(), self.timeout).await?;
        if reply.data.is_empty() {
            return Ok(Vec::new());
        }
        Ok(reply.payload()?)
    }

    /// Map `host` to `directory`
    ///
    /// The hostname is normalized and a relative directory is resolved
    /// against the working directory before anything is sent. Returns the
    /// mapping as the daemon stores it.
    pub async fn mock(
        &mut self,
        host: &str,
        directory: impl AsRef<Path>,
    ) -> Result<MockedHost, ClientError> {
        let host =
            normalize_hostname(host).map_err(|_| ClientError::InvalidHostname(host.to_string()))?;
        let directory = resolve_directory(directory.as_ref())?;

        let data = encode_payload(&MockData {
            host: host.clone(),
            directory: directory.clone(),
        })?;
        self.call(MessageType::Mock, data, self.timeout).await?;
        Ok(MockedHost::new(host, directory))
    }

    /// Remove the mapping for `host`
    pub async fn unmock(&mut self, host: &str) -> Result<(), ClientError> {
        let host =
            normalize_hostname(host).map_err(|_| ClientError::InvalidHostname(host.to_string()))?;
        let data = encode_payload(&UnmockData { host })?;
        self.call(MessageType::Unmock, data, self.timeout).await?;
        Ok(())
    }

    /// Remove every mapping
    pub async fn clear(&mut self) -> Result<(), ClientError> {
        self.call(MessageType::Clear, Vec::new(), self.timeout)
            .await?;
        Ok(())
    }

    /// Request the daemon to shut down
    pub async fn stop(&mut self) -> Result<(), ClientError> {
        self.call(MessageType::Stop, Vec::new(), self.timeout).await?;
        Ok(())
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        // Dropping the reader's listener removes the ephemeral address
        self.reader.abort();
    }
}

/// Accept reply connections and forward every reply to the session
async fn read_replies(mut inbox: Listener, tx: mpsc::Sender<Message>) {
    loop {
        let conn = match inbox.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!("Failed to accept reply connection: {}", e);
                return;
            }
        };

        let mut reader = BufReader::new(conn);
        loop {
            match read_message(&mut reader).await {
                Ok(Some(reply)) => {
                    if tx.send(reply).await.is_err() {
                        return;
                    }
                }
                Ok(None) => break,
                Err(e) if e.is_recoverable() => warn!("Skipping malformed reply: {}", e),
                Err(e) => {
                    debug!("Reply connection failed: {}", e);
                    break;
                }
            }
        }
    }
}

/// Absolute form of `directory`, which must exist and be a directory
fn resolve_directory(directory: &Path) -> Result<PathBuf, ClientError> {
    let invalid = |reason: &str| ClientError::InvalidDirectory {
        path: directory.to_path_buf(),
        reason: reason.to_string(),
    };

    let absolute = if directory.is_absolute() {
        directory.to_path_buf()
    } else {
        std::env::current_dir()?.join(directory)
    };
    let absolute = absolute
        .canonicalize()
        .map_err(|_| invalid("does not exist"))?;
    if !absolute.is_dir() {
        return Err(invalid("not a directory"));
    }
    Ok(absolute)
}

/// Start the daemon process
fn start_daemon() -> Result<(), ClientError> {
    use std::process::{Command, Stdio};

    info!("Starting daemon process");

    // Get the current executable path
    let exe = std::env::current_exe().map_err(|e| {
        ClientError::DaemonStartFailed(format!("Failed to get current executable: {}", e))
    })?;

    let mut command = Command::new(&exe);
    command
        .arg("start")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        // Keep terminal signals aimed at the CLI away from the daemon
        command.process_group(0);
    }

    #[cfg(windows)]
    {
        use std::os::windows::process::CommandExt;
        const DETACHED_PROCESS: u32 = 0x0000_0008;
        command.creation_flags(DETACHED_PROCESS);
    }

    command.spawn().map_err(|e| {
        ClientError::DaemonStartFailed(format!("Failed to spawn daemon process: {}", e))
    })?;

    debug!("Daemon process spawned");
    Ok(())
}

/// Mocked hosts of the daemon at `endpoint`, or `None` when no daemon runs
///
/// Only an absent daemon maps to `None`; a daemon that fails to answer is an
/// error.
pub async fn query_status(endpoint: Endpoint) -> Result<Option<Vec<MockedHost>>, ClientError> {
    let mut client = match Client::connect_to(endpoint).await {
        Ok(client) => client,
        Err(ClientError::DaemonNotRunning) => return Ok(None),
        Err(e) => return Err(e),
    };
    client.status().await.map(Some)
}

/// Check if a daemon is running and answering at `endpoint`
///
/// The exclusive-bind probe rules out an absent daemon quickly; a running one
/// must then answer a ping.
pub async fn daemon_running(endpoint: &Endpoint) -> bool {
    if !endpoint.probe_server_alive() {
        return false;
    }
    match Client::connect_to(endpoint.clone()).await {
        Ok(mut client) => client.ping().await.is_ok(),
        Err(_) => false,
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::cert::{CertProvider, LocalCa};
    use crate::daemon::server::{DaemonConfig, DaemonHandle, DaemonServer};
    use crate::hosts::HostsFile;
    use crate::server::{find_available_port, ListenerConfig};
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::atomic::{AtomicU16, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;

    /// Helper to create a test daemon server and return its endpoint
    static NEXT_BASE_PORT: AtomicU16 = AtomicU16::new(51000);

    async fn create_test_setup(temp_dir: &TempDir) -> (DaemonHandle, Endpoint) {
        let endpoint = Endpoint::new(temp_dir.path().join("test.sock"));
        let hosts_path = temp_dir.path().join("hosts");
        std::fs::write(&hosts_path, "127.0.0.1 localhost\n").unwrap();
        let base_port = NEXT_BASE_PORT.fetch_add(20, Ordering::Relaxed);
        let http_port = find_available_port(base_port).unwrap();
        let https_port = find_available_port(http_port + 1).unwrap();

        let certs: Arc<dyn CertProvider> = Arc::new(LocalCa::with_dirs(
            temp_dir.path().join("ca"),
            temp_dir.path().join("certs"),
        ));
        let server = DaemonServer::new(
            DaemonConfig {
                endpoint: endpoint.clone(),
                listeners: ListenerConfig {
                    bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
                    http_port,
                    https_port,
                },
            },
            HostsFile::with_path(hosts_path),
            certs,
        );
        let handle = server.run().await.expect("Failed to start server");
        (handle, endpoint)
    }

    #[tokio::test]
    async fn test_connect_daemon_not_running() {
        let temp_dir = TempDir::new().unwrap();
        let endpoint = Endpoint::new(temp_dir.path().join("nonexistent.sock"));

        let start = std::time::Instant::now();
        let result = Client::connect_to(endpoint.clone()).await;
        assert!(matches!(result, Err(ClientError::DaemonNotRunning)));
        assert!(start.elapsed() < Duration::from_secs(3));
        assert!(!daemon_running(&endpoint).await);
    }

    #[tokio::test]
    async fn test_ping_and_daemon_running() {
        let temp_dir = TempDir::new().unwrap();
        let (handle, endpoint) = create_test_setup(&temp_dir).await;

        let mut client = Client::connect_to(endpoint.clone())
            .await
            .expect("Failed to connect");
        client.ping().await.expect("Ping failed");
        assert!(daemon_running(&endpoint).await);

        handle.shutdown();
        handle.wait().await;
    }

    #[tokio::test]
    async fn test_mock_status_unmock() {
        let temp_dir = TempDir::new().unwrap();
        let site = TempDir::new().unwrap();
        let (handle, endpoint) = create_test_setup(&temp_dir).await;

        let mut client = Client::connect_to(endpoint).await.expect("Failed to connect");
        let mocked = client.mock(" Test.Local ", site.path()).await.unwrap();
        assert_eq!(mocked.host, "test.local");

        let hosts = client.status().await.unwrap();
        assert_eq!(hosts, vec![mocked]);

        client.unmock("test.local").await.unwrap();
        assert!(client.status().await.unwrap().is_empty());

        let result = client.unmock("test.local").await;
        assert!(matches!(result, Err(ClientError::DaemonError(msg)) if msg.contains("not mocked")));

        handle.shutdown();
        handle.wait().await;
    }

    #[tokio::test]
    async fn test_mock_validates_before_sending() {
        let temp_dir = TempDir::new().unwrap();
        let (handle, endpoint) = create_test_setup(&temp_dir).await;
        let mut client = Client::connect_to(endpoint).await.expect("Failed to connect");

        let result = client.mock("not a host", temp_dir.path()).await;
        assert!(matches!(result, Err(ClientError::InvalidHostname(_))));

        let result = client
            .mock("test.local", temp_dir.path().join("missing"))
            .await;
        assert!(matches!(result, Err(ClientError::InvalidDirectory { .. })));

        let file = temp_dir.path().join("file.txt");
        std::fs::write(&file, "x").unwrap();
        let result = client.mock("test.local", &file).await;
        assert!(matches!(result, Err(ClientError::InvalidDirectory { .. })));

        assert!(handle.registry().is_empty());
        handle.shutdown();
        handle.wait().await;
    }

    #[tokio::test]
    async fn test_multiple_requests_same_session() {
        let temp_dir = TempDir::new().unwrap();
        let site = TempDir::new().unwrap();
        let (handle, endpoint) = create_test_setup(&temp_dir).await;

        let mut client = Client::connect_to(endpoint).await.expect("Failed to connect");

        // Send multiple requests over the same session
        client.ping().await.expect("Ping 1 failed");
        client.mock("a.local", site.path()).await.expect("Mock failed");
        client.clear().await.expect("Clear failed");
        client.ping().await.expect("Ping 2 failed");
        assert!(client.status().await.unwrap().is_empty());

        handle.shutdown();
        handle.wait().await;
    }

    #[tokio::test]
    async fn test_stop() {
        let temp_dir = TempDir::new().unwrap();
        let (handle, endpoint) = create_test_setup(&temp_dir).await;

        let mut client = Client::connect_to(endpoint.clone())
            .await
            .expect("Failed to connect");
        client.stop().await.unwrap();
        handle.wait().await;

        // Socket should be cleaned up
        assert!(!endpoint.server_address().exists());
        assert!(!daemon_running(&endpoint).await);
    }

    #[tokio::test]
    async fn test_drop_removes_ephemeral_address() {
        let temp_dir = TempDir::new().unwrap();
        let (handle, endpoint) = create_test_setup(&temp_dir).await;

        let client = Client::connect_to(endpoint.clone())
            .await
            .expect("Failed to connect");
        let address = endpoint.client_address(&client.client_id());
        assert!(address.exists());

        drop(client);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!address.exists());

        handle.shutdown();
        handle.wait().await;
    }

    /// Daemon stand-in that answers the first request late
    async fn slow_first_reply_daemon(endpoint: Endpoint, delay: Duration) {
        let mut listener = endpoint.listen_server().unwrap();
        let conn = listener.accept().await.unwrap();
        let mut reader = BufReader::new(conn);
        let mut first = true;

        while let Ok(Some(request)) = read_message(&mut reader).await {
            let client_id = request.client_id.unwrap();
            let hosts = if first {
                tokio::time::sleep(delay).await;
                vec![MockedHost::new("stale.local", "/srv/stale")]
            } else {
                Vec::new()
            };
            first = false;

            let mut reply_conn = endpoint
                .dial_client(&client_id, Duration::from_secs(1))
                .await
                .unwrap();
            let reply = Message::success(encode_payload(&hosts).unwrap())
                .in_reply_to(request.request_id);
            write_message(&mut reply_conn, &reply).await.unwrap();
        }
    }

    /// Daemon stand-in that rejects every request
    async fn failing_daemon(endpoint: Endpoint) {
        let mut listener = endpoint.listen_server().unwrap();
        let conn = listener.accept().await.unwrap();
        let mut reader = BufReader::new(conn);

        while let Ok(Some(request)) = read_message(&mut reader).await {
            let client_id = request.client_id.unwrap();
            let mut reply_conn = endpoint
                .dial_client(&client_id, Duration::from_secs(1))
                .await
                .unwrap();
            let reply = Message::error("registry unavailable").in_reply_to(request.request_id);
            write_message(&mut reply_conn, &reply).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_query_status_offline() {
        let temp_dir = TempDir::new().unwrap();
        let endpoint = Endpoint::new(temp_dir.path().join("absent.sock"));

        let hosts = query_status(endpoint).await.unwrap();
        assert!(hosts.is_none());
    }

    #[tokio::test]
    async fn test_query_status_running() {
        let temp_dir = TempDir::new().unwrap();
        let (handle, endpoint) = create_test_setup(&temp_dir).await;

        let hosts = query_status(endpoint).await.unwrap();
        assert_eq!(hosts, Some(Vec::new()));

        handle.shutdown();
        handle.wait().await;
    }

    #[tokio::test]
    async fn test_query_status_reports_daemon_failure() {
        let temp_dir = TempDir::new().unwrap();
        let endpoint = Endpoint::new(temp_dir.path().join("failing.sock"));
        let daemon = tokio::spawn(failing_daemon(endpoint.clone()));

        let result = query_status(endpoint).await;
        match result {
            Err(ClientError::DaemonError(reason)) => assert_eq!(reason, "registry unavailable"),
            other => panic!("expected a daemon error, got {:?}", other.map(|_| ())),
        }

        daemon.abort();
    }

    #[tokio::test]
    async fn test_stale_reply_is_discarded() {
        let temp_dir = TempDir::new().unwrap();
        let endpoint = Endpoint::new(temp_dir.path().join("slow.sock"));
        let daemon = tokio::spawn(slow_first_reply_daemon(
            endpoint.clone(),
            Duration::from_millis(300),
        ));

        let mut client = Client::connect_with(endpoint, Duration::from_secs(1))
            .await
            .unwrap()
            .with_timeout(Duration::from_millis(100));

        let first = client.status().await;
        assert!(matches!(first, Err(ClientError::Timeout)));

        // The late reply to the first call arrives while this one waits
        client.set_timeout(Duration::from_secs(2));
        let second = client.status().await.unwrap();
        assert!(second.is_empty());

        drop(client);
        daemon.abort();
    }
}
