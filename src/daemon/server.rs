//! Daemon server owning the mocked-host registry
//!
//! The daemon listens on the fixed IPC address and handles requests from CLI
//! clients. Replies are never written back on the request connection; the
//! daemon dials the client's ephemeral address and writes one reply there.
//! Every operation is serialized by one read-write lock, which also guards
//! the running HTTP/HTTPS listeners.

use std::sync::Arc;

use thiserror::Error;
use tokio::io::BufReader;
use tokio::signal;
use tokio::sync::{broadcast, mpsc, oneshot, RwLock};
use tokio::task::{JoinError, JoinSet};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use crate::cert::{CertError, CertProvider};
use crate::daemon::protocol::{
    encode_payload, read_message, write_message, ClientId, Message, MessageType, MockData,
    MockedHost, UnmockData,
};
use crate::daemon::registry::Registry;
use crate::hosts::{normalize_hostname, HostsFile};
use crate::server::{build_router, load_tls_acceptor, ListenerConfig, ListenerError, Listeners};
use crate::transport::{Connection, Endpoint, TransportError, DEFAULT_DIAL_TIMEOUT};

/// Errors that can occur in the daemon server
#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Certificate error: {0}")]
    Cert(#[from] CertError),

    #[error("Listener error: {0}")]
    Listener(#[from] ListenerError),

    #[error("Background task failed: {0}")]
    Task(#[from] JoinError),
}

/// Why the daemon stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DaemonExit {
    /// Stop request, shutdown handle or OS signal
    Stopped,
    /// Certificate setup failed while restarting the listeners
    Fatal(String),
}

/// Runtime settings of a daemon instance
#[derive(Debug, Clone, Default)]
pub struct DaemonConfig {
    pub endpoint: Endpoint,
    pub listeners: ListenerConfig,
}

/// State guarded by the operation lock
#[derive(Debug, Default)]
struct Control {
    listeners: Listeners,
}

struct Shared {
    config: DaemonConfig,
    registry: Registry,
    control: RwLock<Control>,
    hosts: HostsFile,
    certs: Arc<dyn CertProvider>,
    exit_tx: mpsc::UnboundedSender<DaemonExit>,
}

/// Daemon server state
pub struct DaemonServer {
    config: DaemonConfig,
    hosts: HostsFile,
    certs: Arc<dyn CertProvider>,
    shutdown_tx: broadcast::Sender<()>,
}

/// Handle to control a running daemon server
pub struct DaemonHandle {
    shutdown_tx: broadcast::Sender<()>,
    exit_rx: oneshot::Receiver<DaemonExit>,
    registry: Registry,
}

impl DaemonHandle {
    /// Signal the daemon to shut down gracefully
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Read-only view of the mocked hosts
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Wait until the daemon has stopped and cleaned up
    pub async fn wait(self) -> DaemonExit {
        self.exit_rx
            .await
            .unwrap_or_else(|_| DaemonExit::Fatal("daemon task ended unexpectedly".to_string()))
    }
}

impl DaemonServer {
    pub fn new(config: DaemonConfig, hosts: HostsFile, certs: Arc<dyn CertProvider>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            hosts,
            certs,
            shutdown_tx,
        }
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    /// Run the daemon server
    ///
    /// Binds the fixed IPC address and starts accepting connections. The
    /// daemon runs until a Stop request, a fatal certificate error, an OS
    /// signal (SIGTERM/SIGINT) or [`DaemonHandle::shutdown`].
    pub async fn run(self) -> Result<DaemonHandle, ServerError> {
        let mut listener = self.config.endpoint.listen_server()?;
        info!("Daemon listening on {:?}", listener.address());

        let (exit_tx, mut exit_rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = oneshot::channel();
        let registry = Registry::new();

        let shared = Arc::new(Shared {
            config: self.config,
            registry: registry.clone(),
            control: RwLock::new(Control::default()),
            hosts: self.hosts,
            certs: self.certs,
            exit_tx,
        });

        let handle = DaemonHandle {
            shutdown_tx: self.shutdown_tx.clone(),
            exit_rx: done_rx,
            registry,
        };

        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut connections = JoinSet::new();
            let os_signal = shutdown_signal();
            tokio::pin!(os_signal);

            let exit = loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        match accepted {
                            Ok(conn) => {
                                debug!("Accepted new connection");
                                connections.spawn(handle_connection(conn, Arc::clone(&shared)));
                            }
                            Err(e) => {
                                error!("Failed to accept connection: {}", e);
                            }
                        }
                    }

                    Some(exit) = exit_rx.recv() => break exit,

                    _ = shutdown_rx.recv() => {
                        info!("Received shutdown signal, stopping daemon");
                        break DaemonExit::Stopped;
                    }

                    _ = &mut os_signal => {
                        info!("Received OS signal, stopping daemon");
                        break DaemonExit::Stopped;
                    }

                    Some(_) = connections.join_next(), if !connections.is_empty() => {}
                }
            };

            // Cleanup
            connections.shutdown().await;
            shared.control.write().await.listeners.shutdown().await;
            drop(listener);
            if let Err(e) = shared.config.endpoint.teardown() {
                warn!("Failed to remove daemon address: {}", e);
            }

            match &exit {
                DaemonExit::Stopped => info!("Daemon stopped"),
                DaemonExit::Fatal(reason) => error!("Daemon stopped after fatal error: {}", reason),
            }
            let _ = done_tx.send(exit);
        });

        Ok(handle)
    }
}

/// Handle a single client connection
async fn handle_connection(conn: Connection, shared: Arc<Shared>) {
    let mut reader = BufReader::new(conn);

    loop {
        match read_message(&mut reader).await {
            Ok(Some(message)) => dispatch(message, &shared).await,
            Ok(None) => {
                debug!("Client disconnected");
                return;
            }
            Err(e) if e.is_recoverable() => {
                warn!("Skipping malformed message: {}", e);
            }
            Err(e) => {
                debug!("Read error: {}", e);
                return;
            }
        }
    }
}

/// Handle a request and deliver the reply to the client's ephemeral address
async fn dispatch(message: Message, shared: &Shared) {
    let msg_type = message.msg_type;
    if matches!(
        msg_type,
        MessageType::Terminate | MessageType::Success | MessageType::Error | MessageType::Timeout
    ) {
        debug!(?msg_type, "Ignoring message with no handler");
        return;
    }

    let Some(client_id) = message.client_id else {
        warn!(?msg_type, "Dropping message without client id");
        return;
    };

    let mut reply_conn = match shared
        .config
        .endpoint
        .dial_client(&client_id, DEFAULT_DIAL_TIMEOUT)
        .await
    {
        Ok(conn) => conn,
        Err(e) => {
            warn!(%client_id, ?msg_type, "Failed to dial client, dropping request: {}", e);
            return;
        }
    };
    let request_id = message.request_id;
    debug!(%client_id, ?msg_type, "Handling request");

    match msg_type {
        MessageType::Status => {
            let _control = shared.control.read().await;
            let reply = shared.status();
            send_reply(&mut reply_conn, reply, &message, client_id).await;
        }

        MessageType::Mock | MessageType::Unmock => {
            let mut control = shared.control.write().await;
            let reply = if msg_type == MessageType::Mock {
                shared.mock(&message)
            } else {
                shared.unmock(&message)
            };
            let changed = reply.msg_type == MessageType::Success;
            send_reply(&mut reply_conn, reply, &message, client_id).await;
            if changed {
                shared.restart_listeners(&mut control).await;
            }
        }

        MessageType::Clear => {
            let _control = shared.control.write().await;
            let reply = shared.clear();
            send_reply(&mut reply_conn, reply, &message, client_id).await;
        }

        MessageType::Stop => {
            let _control = shared.control.write().await;
            info!(%client_id, "Handling Stop request");
            send_reply(&mut reply_conn, Message::success(Vec::new()), &message, client_id).await;
            let _ = shared.exit_tx.send(DaemonExit::Stopped);
        }

        MessageType::Terminate
        | MessageType::Success
        | MessageType::Error
        | MessageType::Timeout => {
            debug!(?request_id, "Unhandled message type");
        }
    }
}

async fn send_reply(conn: &mut Connection, reply: Message, request: &Message, client_id: ClientId) {
    let reply = reply.in_reply_to(request.request_id);
    if let Err(e) = write_message(conn, &reply).await {
        warn!(%client_id, "Failed to send reply: {}", e);
    }
}

impl Shared {
    fn status(&self) -> Message {
        match encode_payload(&self.registry.snapshot()) {
            Ok(data) => Message::success(data),
            Err(e) => Message::error(format!("failed to encode status: {}", e)),
        }
    }

    fn mock(&self, message: &Message) -> Message {
        let data: MockData = match message.payload() {
            Ok(data) => data,
            Err(e) => return Message::error(format!("invalid mock request: {}", e)),
        };
        let host = match normalize_hostname(&data.host) {
            Ok(host) => host,
            Err(e) => return Message::error(e.to_string()),
        };
        if !data.directory.is_absolute() {
            return Message::error(format!(
                "directory {} is not an absolute path",
                data.directory.display()
            ));
        }
        if !data.directory.is_dir() {
            return Message::error(format!(
                "directory {} does not exist or is not a directory",
                data.directory.display()
            ));
        }

        let previous = self
            .registry
            .insert(MockedHost::new(host.clone(), data.directory.clone()));
        if let Err(e) = self.hosts.update(&host, true) {
            error!(host = %host, "Failed to update hosts file: {}", e);
            match previous {
                Some(previous) => {
                    self.registry.insert(previous);
                }
                None => {
                    self.registry.remove(&host);
                }
            }
            return Message::error(e.to_string());
        }

        info!(host = %host, directory = ?data.directory, "Mocked host");
        Message::success(Vec::new())
    }

    fn unmock(&self, message: &Message) -> Message {
        let data: UnmockData = match message.payload() {
            Ok(data) => data,
            Err(e) => return Message::error(format!("invalid unmock request: {}", e)),
        };
        let host = match normalize_hostname(&data.host) {
            Ok(host) => host,
            Err(e) => return Message::error(e.to_string()),
        };

        let removed = self.registry.remove(&host);
        if removed.is_empty() {
            return Message::error(format!("host {} is not mocked", host));
        }
        if let Err(e) = self.hosts.update(&host, false) {
            error!(host = %host, "Failed to update hosts file: {}", e);
            for entry in removed {
                self.registry.insert(entry);
            }
            return Message::error(e.to_string());
        }

        info!(host = %host, "Unmocked host");
        Message::success(Vec::new())
    }

    fn clear(&self) -> Message {
        if let Err(e) = self.hosts.clear() {
            error!("Failed to clear hosts file: {}", e);
            return Message::error(e.to_string());
        }
        let removed = self.registry.clear();
        info!(count = removed.len(), "Cleared mocked hosts");
        Message::success(Vec::new())
    }

    /// Tear the listeners down and bring them back up for the current hosts
    async fn restart_listeners(&self, control: &mut Control) {
        control.listeners.shutdown().await;

        let hosts = self.registry.host_names();
        if hosts.is_empty() {
            info!("No mocked hosts, listeners stay down");
            return;
        }

        match self.load_certificate(hosts).await {
            Ok(acceptor) => {
                let router = build_router(self.registry.clone());
                control.listeners =
                    Listeners::launch(&self.config.listeners, router, acceptor).await;
            }
            Err(e) => {
                error!("Failed to set up certificate: {}", e);
                let _ = self.exit_tx.send(DaemonExit::Fatal(e.to_string()));
            }
        }
    }

    async fn load_certificate(&self, hosts: Vec<String>) -> Result<TlsAcceptor, ServerError> {
        let certs = Arc::clone(&self.certs);
        tokio::task::spawn_blocking(move || -> Result<TlsAcceptor, ServerError> {
            certs.create_cert(&hosts)?;
            Ok(load_tls_acceptor(certs.cert_file(), certs.key_file())?)
        })
        .await?
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
