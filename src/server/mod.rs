//! HTTP and HTTPS listeners serving mocked hosts.

pub mod routes;

pub use routes::build_router;

use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use hyper::server::conn::http1;
use hyper_util::rt::TokioIo;
use hyper_util::service::TowerToHyperService;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use thiserror::Error;
use tokio::net::TcpListener as TokioTcpListener;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

/// Time a client gets to finish the TLS handshake
const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Time in-flight requests get to finish once a listener is shut down
const GRACEFUL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Find an available port starting from the given base port.
///
/// Tries ports sequentially until finding one that's available.
/// Returns the available port number.
pub fn find_available_port(base_port: u16) -> Option<u16> {
    (base_port..=base_port.saturating_add(100))
        .find(|&port| TcpListener::bind(("127.0.0.1", port)).is_ok())
}

/// Where the web listeners bind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerConfig {
    pub bind_address: IpAddr,
    pub http_port: u16,
    pub https_port: u16,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            http_port: 80,
            https_port: 443,
        }
    }
}

/// Errors while preparing the TLS configuration
#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("invalid PEM in {}: {source}", .path.display())]
    Pem {
        path: PathBuf,
        #[source]
        source: rustls::pki_types::pem::Error,
    },

    #[error("no certificate found in {}", .0.display())]
    NoCertificate(PathBuf),

    #[error("TLS configuration error: {0}")]
    Tls(#[from] rustls::Error),
}

/// Load a certificate chain and private key into a TLS acceptor.
pub fn load_tls_acceptor(cert_file: &Path, key_file: &Path) -> Result<TlsAcceptor, ListenerError> {
    let pem_error = |path: &Path| {
        let path = path.to_path_buf();
        move |source| ListenerError::Pem { path, source }
    };

    let certs = CertificateDer::pem_file_iter(cert_file)
        .map_err(pem_error(cert_file))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(pem_error(cert_file))?;
    if certs.is_empty() {
        return Err(ListenerError::NoCertificate(cert_file.to_path_buf()));
    }
    let key = PrivateKeyDer::from_pem_file(key_file).map_err(pem_error(key_file))?;

    let mut config =
        rustls::ServerConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_single_cert(certs, key)?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// One listener task and the means to stop it
#[derive(Debug)]
struct RunningListener {
    addr: SocketAddr,
    shutdown_tx: watch::Sender<()>,
    task: JoinHandle<()>,
}

impl RunningListener {
    async fn shutdown(mut self) {
        let _ = self.shutdown_tx.send(());
        match tokio::time::timeout(GRACEFUL_SHUTDOWN_TIMEOUT, &mut self.task).await {
            Ok(_) => debug!("Listener on {} stopped", self.addr),
            Err(_) => {
                warn!("Listener on {} did not drain in time, aborting", self.addr);
                self.task.abort();
            }
        }
    }
}

/// The currently running HTTP and HTTPS listeners; either may be absent.
#[derive(Debug, Default)]
pub struct Listeners {
    http: Option<RunningListener>,
    https: Option<RunningListener>,
}

impl Listeners {
    /// Bind and launch both listeners.
    ///
    /// Both ports are bound before this returns. A port that fails to bind is
    /// logged and its listener is left absent.
    pub async fn launch(config: &ListenerConfig, router: Router, acceptor: TlsAcceptor) -> Self {
        let http = match bind(config.bind_address, config.http_port).await {
            Some(listener) => Some(spawn_listener(listener, |listener, shutdown_rx| {
                serve_http(listener, router.clone(), shutdown_rx)
            })),
            None => None,
        };
        let https = match bind(config.bind_address, config.https_port).await {
            Some(listener) => Some(spawn_listener(listener, |listener, shutdown_rx| {
                serve_https(listener, acceptor, router, shutdown_rx)
            })),
            None => None,
        };
        Self { http, https }
    }

    pub fn http_addr(&self) -> Option<SocketAddr> {
        self.http.as_ref().map(|listener| listener.addr)
    }

    pub fn https_addr(&self) -> Option<SocketAddr> {
        self.https.as_ref().map(|listener| listener.addr)
    }

    pub fn is_running(&self) -> bool {
        self.http.is_some() || self.https.is_some()
    }

    /// Stop both listeners, waiting briefly for in-flight requests.
    pub async fn shutdown(&mut self) {
        if let Some(listener) = self.http.take() {
            listener.shutdown().await;
        }
        if let Some(listener) = self.https.take() {
            listener.shutdown().await;
        }
    }
}

async fn bind(address: IpAddr, port: u16) -> Option<TokioTcpListener> {
    let addr = SocketAddr::new(address, port);
    match TokioTcpListener::bind(addr).await {
        Ok(listener) => Some(listener),
        Err(e) => {
            error!("Failed to bind {}: {}", addr, e);
            None
        }
    }
}

fn spawn_listener<F, Fut>(listener: TokioTcpListener, serve: F) -> RunningListener
where
    F: FnOnce(TokioTcpListener, watch::Receiver<()>) -> Fut,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let (shutdown_tx, shutdown_rx) = watch::channel(());
    let addr = listener
        .local_addr()
        .unwrap_or_else(|_| SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0));
    let task = tokio::spawn(serve(listener, shutdown_rx));
    RunningListener {
        addr,
        shutdown_tx,
        task,
    }
}

async fn serve_http(listener: TokioTcpListener, router: Router, mut shutdown_rx: watch::Receiver<()>) {
    if let Ok(addr) = listener.local_addr() {
        info!("HTTP listening on http://{}", addr);
    }
    let result = axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.changed().await;
        })
        .await;
    if let Err(e) = result {
        error!("HTTP listener failed: {}", e);
    }
}

async fn serve_https(
    listener: TokioTcpListener,
    acceptor: TlsAcceptor,
    router: Router,
    mut shutdown_rx: watch::Receiver<()>,
) {
    if let Ok(addr) = listener.local_addr() {
        info!("HTTPS listening on https://{}", addr);
    }
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("Failed to accept HTTPS connection: {}", e);
                        continue;
                    }
                };
                let acceptor = acceptor.clone();
                let service = TowerToHyperService::new(router.clone());
                let mut conn_shutdown_rx = shutdown_rx.clone();

                connections.spawn(async move {
                    let tls = match tokio::time::timeout(TLS_HANDSHAKE_TIMEOUT, acceptor.accept(stream)).await {
                        Ok(Ok(tls)) => tls,
                        Ok(Err(e)) => {
                            debug!(%peer, "TLS handshake failed: {}", e);
                            return;
                        }
                        Err(_) => {
                            debug!(%peer, "TLS handshake timed out");
                            return;
                        }
                    };

                    let conn = http1::Builder::new().serve_connection(TokioIo::new(tls), service);
                    tokio::pin!(conn);
                    tokio::select! {
                        result = conn.as_mut() => {
                            if let Err(e) = result {
                                debug!(%peer, "Error serving HTTPS connection: {}", e);
                            }
                        }
                        _ = conn_shutdown_rx.changed() => {
                            conn.as_mut().graceful_shutdown();
                            if let Err(e) = conn.await {
                                debug!(%peer, "Error draining HTTPS connection: {}", e);
                            }
                        }
                    }
                });
            }

            Some(_) = connections.join_next(), if !connections.is_empty() => {}

            _ = shutdown_rx.changed() => break,
        }
    }

    drop(listener);
    while connections.join_next().await.is_some() {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cert::{CertProvider, LocalCa};
    use crate::daemon::registry::Registry;
    use tempfile::TempDir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn test_acceptor(temp_dir: &TempDir) -> TlsAcceptor {
        let ca = LocalCa::with_dirs(temp_dir.path().join("ca"), temp_dir.path().join("out"));
        ca.create_cert(&["test.local".to_string()]).unwrap();
        load_tls_acceptor(ca.cert_file(), ca.key_file()).unwrap()
    }

    fn loopback_config(base_port: u16) -> ListenerConfig {
        let http_port = find_available_port(base_port).unwrap();
        let https_port = find_available_port(http_port + 1).unwrap();
        ListenerConfig {
            bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            http_port,
            https_port,
        }
    }

    #[test]
    fn test_find_available_port() {
        // The first port should generally be available in tests
        let port = find_available_port(49152); // Use ephemeral port range
        assert!(port.is_some());
        let port = port.unwrap();
        assert!(port >= 49152);
    }

    #[test]
    fn test_listener_config_default() {
        let config = ListenerConfig::default();
        assert_eq!(config.http_port, 80);
        assert_eq!(config.https_port, 443);
        assert_eq!(config.bind_address, IpAddr::V4(Ipv4Addr::UNSPECIFIED));
    }

    #[test]
    fn test_load_tls_acceptor_rejects_missing_files() {
        let temp_dir = TempDir::new().unwrap();
        let result = load_tls_acceptor(
            &temp_dir.path().join("cert.pem"),
            &temp_dir.path().join("key.pem"),
        );
        assert!(matches!(result, Err(ListenerError::Pem { .. })));
    }

    #[test]
    fn test_load_tls_acceptor_rejects_empty_chain() {
        let temp_dir = TempDir::new().unwrap();
        let cert_file = temp_dir.path().join("cert.pem");
        std::fs::write(&cert_file, "").unwrap();
        let result = load_tls_acceptor(&cert_file, &temp_dir.path().join("key.pem"));
        assert!(matches!(result, Err(ListenerError::NoCertificate(_))));
    }

    #[tokio::test]
    async fn test_launch_serves_http_and_shuts_down() {
        let temp_dir = TempDir::new().unwrap();
        let site = TempDir::new().unwrap();
        std::fs::write(site.path().join("index.html"), "hello").unwrap();
        let registry = Registry::new();
        registry.insert(crate::daemon::protocol::MockedHost::new("test.local", site.path()));

        let config = loopback_config(49200);
        let mut listeners =
            Listeners::launch(&config, build_router(registry), test_acceptor(&temp_dir)).await;
        let http_addr = listeners.http_addr().unwrap();
        assert!(listeners.https_addr().is_some());

        let mut stream = tokio::net::TcpStream::connect(http_addr).await.unwrap();
        stream
            .write_all(b"GET / HTTP/1.1\r\nHost: test.local\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.ends_with("hello"));

        listeners.shutdown().await;
        assert!(!listeners.is_running());
        assert!(tokio::net::TcpStream::connect(http_addr).await.is_err());
    }

    #[tokio::test]
    async fn test_bind_failure_leaves_listener_absent() {
        let temp_dir = TempDir::new().unwrap();
        let config = loopback_config(49400);
        let _taken = TcpListener::bind(("127.0.0.1", config.http_port)).unwrap();

        let mut listeners =
            Listeners::launch(&config, build_router(Registry::new()), test_acceptor(&temp_dir))
                .await;
        assert!(listeners.http_addr().is_none());
        assert!(listeners.https_addr().is_some());

        listeners.shutdown().await;
    }
}
