//! Configuration management for wock
//!
//! Handles loading and saving configuration from ~/.config/wock/config.toml

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::daemon::server::DaemonConfig;
use crate::hosts::default_hosts_path;
use crate::logging::default_log_file;
use crate::server::ListenerConfig;
use crate::transport::{default_server_address, Endpoint};

/// Configuration file name
const CONFIG_FILE: &str = "config.toml";

/// Application name for config directory
const APP_NAME: &str = "wock";

const DEFAULT_HTTP_PORT: u16 = 80;
const DEFAULT_HTTPS_PORT: u16 = 443;
const DEFAULT_BIND_ADDRESS: IpAddr = IpAddr::V4(Ipv4Addr::UNSPECIFIED);

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] io::Error),

    #[error("Failed to parse config file: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    SerializeError(#[from] toml::ser::Error),

    #[error("Could not determine config directory")]
    NoConfigDir,

    #[error("Unknown config key '{0}'")]
    UnknownKey(String),

    #[error("Invalid value '{value}' for {key}")]
    InvalidValue { key: String, value: String },
}

/// Result type for config operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    /// Port of the HTTP listener
    #[serde(default)]
    pub http_port: Option<u16>,

    /// Port of the HTTPS listener
    #[serde(default)]
    pub https_port: Option<u16>,

    /// Address both listeners bind to
    #[serde(default)]
    pub bind_address: Option<IpAddr>,

    /// Daemon IPC address (socket path or pipe name)
    #[serde(default)]
    pub socket_path: Option<PathBuf>,

    /// Hosts file to manage
    #[serde(default)]
    pub hosts_file: Option<PathBuf>,

    /// Daemon log file
    #[serde(default)]
    pub log_file: Option<PathBuf>,
}

impl Config {
    /// Create a new empty configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the config file path
    ///
    /// Returns ~/.config/wock/config.toml on Linux
    pub fn config_path() -> ConfigResult<PathBuf> {
        Ok(Self::config_dir()?.join(CONFIG_FILE))
    }

    /// Get the config directory path
    pub fn config_dir() -> ConfigResult<PathBuf> {
        let config_dir = dirs::config_dir().ok_or(ConfigError::NoConfigDir)?;
        Ok(config_dir.join(APP_NAME))
    }

    /// Load configuration from the default file
    ///
    /// Returns default config if file doesn't exist
    pub fn load() -> ConfigResult<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to the default file
    pub fn save(&self) -> ConfigResult<()> {
        self.save_to(&Self::config_path()?)
    }

    /// Save configuration, creating the parent directory if needed
    pub fn save_to(&self, path: &Path) -> ConfigResult<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }

        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }

    /// Check if any configuration is set
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Set or clear (`None`) a field by its config key
    pub fn set_value(&mut self, key: &str, value: Option<&str>) -> ConfigResult<()> {
        let invalid = |value: &str| ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        };

        match key {
            "http_port" | "https_port" => {
                let port = value
                    .map(|v| v.parse::<u16>().map_err(|_| invalid(v)))
                    .transpose()?;
                if key == "http_port" {
                    self.http_port = port;
                } else {
                    self.https_port = port;
                }
            }
            "bind_address" => {
                self.bind_address = value
                    .map(|v| v.parse::<IpAddr>().map_err(|_| invalid(v)))
                    .transpose()?;
            }
            "socket_path" => self.socket_path = value.map(PathBuf::from),
            "hosts_file" => self.hosts_file = value.map(PathBuf::from),
            "log_file" => self.log_file = value.map(PathBuf::from),
            other => return Err(ConfigError::UnknownKey(other.to_string())),
        }
        Ok(())
    }

    pub fn effective_http_port(&self) -> u16 {
        self.http_port.unwrap_or(DEFAULT_HTTP_PORT)
    }

    pub fn effective_https_port(&self) -> u16 {
        self.https_port.unwrap_or(DEFAULT_HTTPS_PORT)
    }

    pub fn effective_bind_address(&self) -> IpAddr {
        self.bind_address.unwrap_or(DEFAULT_BIND_ADDRESS)
    }

    pub fn effective_socket_path(&self) -> PathBuf {
        self.socket_path.clone().unwrap_or_else(default_server_address)
    }

    pub fn effective_hosts_file(&self) -> PathBuf {
        self.hosts_file.clone().unwrap_or_else(default_hosts_path)
    }

    pub fn effective_log_file(&self) -> PathBuf {
        self.log_file.clone().unwrap_or_else(default_log_file)
    }

    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.effective_socket_path())
    }

    /// Runtime settings for the daemon
    pub fn daemon_config(&self) -> DaemonConfig {
        DaemonConfig {
            endpoint: self.endpoint(),
            listeners: ListenerConfig {
                bind_address: self.effective_bind_address(),
                http_port: self.effective_http_port(),
                https_port: self.effective_https_port(),
            },
        }
    }
}

/// Format the configuration for display
pub fn format_config(config: &Config) -> String {
    fn line(key: &str, value: Option<String>, default: String) -> String {
        match value {
            Some(value) => format!("  {} = {}", key, value),
            None => format!("  {} = (not set, using {})", key, default),
        }
    }

    let quoted = |path: &Option<PathBuf>| path.as_ref().map(|p| format!("\"{}\"", p.display()));

    let lines = [
        "Current configuration:".to_string(),
        String::new(),
        line(
            "http_port",
            config.http_port.map(|p| p.to_string()),
            DEFAULT_HTTP_PORT.to_string(),
        ),
        line(
            "https_port",
            config.https_port.map(|p| p.to_string()),
            DEFAULT_HTTPS_PORT.to_string(),
        ),
        line(
            "bind_address",
            config.bind_address.map(|a| format!("\"{}\"", a)),
            DEFAULT_BIND_ADDRESS.to_string(),
        ),
        line(
            "socket_path",
            quoted(&config.socket_path),
            default_server_address().display().to_string(),
        ),
        line(
            "hosts_file",
            quoted(&config.hosts_file),
            default_hosts_path().display().to_string(),
        ),
        line(
            "log_file",
            quoted(&config.log_file),
            default_log_file().display().to_string(),
        ),
    ];

    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.http_port.is_none());
        assert!(config.socket_path.is_none());
        assert!(config.is_empty());
        assert_eq!(config.effective_http_port(), 80);
        assert_eq!(config.effective_https_port(), 443);
        assert_eq!(config.effective_bind_address(), DEFAULT_BIND_ADDRESS);
        assert_eq!(config.effective_socket_path(), default_server_address());
    }

    #[test]
    fn test_set_value() {
        let mut config = Config::new();

        config.set_value("http_port", Some("8080")).unwrap();
        config.set_value("bind_address", Some("127.0.0.1")).unwrap();
        config.set_value("hosts_file", Some("/tmp/hosts")).unwrap();
        assert_eq!(config.effective_http_port(), 8080);
        assert_eq!(
            config.effective_bind_address(),
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        );
        assert_eq!(config.effective_hosts_file(), PathBuf::from("/tmp/hosts"));
        assert!(!config.is_empty());

        config.set_value("http_port", None).unwrap();
        assert_eq!(config.effective_http_port(), 80);
    }

    #[test]
    fn test_set_value_rejects_bad_input() {
        let mut config = Config::new();
        assert!(matches!(
            config.set_value("http_port", Some("eighty")),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(matches!(
            config.set_value("bind_address", Some("localhost")),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(matches!(
            config.set_value("color", Some("blue")),
            Err(ConfigError::UnknownKey(_))
        ));
        assert!(config.is_empty());
    }

    #[test]
    fn test_config_serialize_empty() {
        let config = Config::new();
        let toml_str = toml::to_string(&config).unwrap();

        // Empty config should serialize to minimal TOML
        assert!(!toml_str.contains("http_port"));
        assert!(!toml_str.contains("socket_path"));
    }

    #[test]
    fn test_config_deserialize_partial() {
        let toml_str = r#"
            https_port = 8443
            bind_address = "127.0.0.1"
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.https_port, Some(8443));
        assert_eq!(config.bind_address, Some(IpAddr::V4(Ipv4Addr::LOCALHOST)));
        assert!(config.http_port.is_none());
    }

    #[test]
    fn test_daemon_config() {
        let mut config = Config::new();
        config.set_value("socket_path", Some("/tmp/test-wock.sock")).unwrap();
        config.set_value("https_port", Some("8443")).unwrap();

        let daemon = config.daemon_config();
        assert_eq!(
            daemon.endpoint.server_address(),
            Path::new("/tmp/test-wock.sock")
        );
        assert_eq!(daemon.listeners.http_port, 80);
        assert_eq!(daemon.listeners.https_port, 8443);
    }

    #[test]
    fn test_format_config_empty() {
        let config = Config::new();
        let output = format_config(&config);

        assert!(output.contains("http_port = (not set, using 80)"));
        assert!(output.contains("https_port = (not set, using 443)"));
        assert!(output.contains("bind_address = (not set, using 0.0.0.0)"));
    }

    #[test]
    fn test_format_config_with_values() {
        let mut config = Config::new();
        config.set_value("http_port", Some("8080")).unwrap();
        config.set_value("log_file", Some("/tmp/wock.log")).unwrap();

        let output = format_config(&config);

        assert!(output.contains("http_port = 8080"));
        assert!(output.contains("log_file = \"/tmp/wock.log\""));
    }

    #[test]
    fn test_config_path() {
        let result = Config::config_path();
        // This should work on most systems
        if let Ok(path) = result {
            assert!(path.to_string_lossy().contains("wock"));
            assert!(path.to_string_lossy().contains("config.toml"));
        }
    }

    #[test]
    fn test_save_and_load_config() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("nested").join("config.toml");

        let mut config = Config::new();
        config.set_value("http_port", Some("8080")).unwrap();
        config.set_value("socket_path", Some("/tmp/other.sock")).unwrap();
        config.save_to(&config_path).unwrap();

        let loaded = Config::load_from(&config_path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_load_missing_file_gives_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let loaded = Config::load_from(&temp_dir.path().join("config.toml")).unwrap();
        assert!(loaded.is_empty());
    }
}
