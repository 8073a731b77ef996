//! Daemon module for mocked-host management
//!
//! The daemon runs as a separate, long-lived process that owns the registry of
//! mocked hosts, the managed hosts-file entries and the web listeners. CLI
//! invocations talk to it through [`client::Client`].

pub mod client;
pub mod protocol;
pub mod registry;
pub mod server;

pub use client::{daemon_running, query_status, Client, ClientError};
pub use protocol::{ClientId, Message, MessageType, MockedHost, RequestId};
pub use registry::Registry;
pub use server::{DaemonConfig, DaemonExit, DaemonHandle, DaemonServer, ServerError};
