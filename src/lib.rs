//! wock serves a local directory under any hostname over HTTP and HTTPS.
//!
//! A background daemon owns the mapping of mocked hosts to directories,
//! keeps matching entries in the system hosts file, issues a certificate for
//! the mocked hosts from a local CA and routes incoming requests by host.
//! Short-lived CLI invocations drive it over a local IPC channel.

pub mod cert;
pub mod config;
pub mod daemon;
pub mod hosts;
pub mod logging;
pub mod server;
pub mod transport;
