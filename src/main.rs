use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use wock::cert::LocalCa;
use wock::config::{format_config, Config};
use wock::daemon::{query_status, Client, ClientError, DaemonExit, DaemonServer, MockedHost};
use wock::hosts::HostsFile;
use wock::logging::{init_logging, LogConfig, LogGuard, Verbosity};

#[derive(Parser)]
#[command(name = "wock")]
#[command(version)]
#[command(about = "Mock web hosts")]
#[command(
    long_about = "wock maps a hostname to a local directory and serves it over HTTP and HTTPS from this machine, editing the hosts file and issuing a locally trusted certificate as it goes."
)]
struct Cli {
    /// Increase log output (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon in the foreground
    Start {
        /// Write the daemon log file as JSON lines
        #[arg(long)]
        json_logs: bool,
    },
    /// Serve a directory under a hostname, starting the daemon if needed
    Mock {
        /// Hostname to mock, e.g. example.com or *.example.com
        host: String,
        /// Directory to serve
        directory: PathBuf,
    },
    /// Remove a mocked host
    Rm {
        /// Hostname to remove
        host: String,
    },
    /// Check the current status of the daemon
    Status,
    /// Remove all mocked hosts
    Clear,
    /// Stop the daemon
    Stop,
    /// Print the daemon's logs to stdout
    Logs,
    /// Generate the local certificate authority
    Install,
    /// Delete the local certificate authority
    Uninstall,
    /// Show or change configuration
    Config {
        #[command(subcommand)]
        action: Option<ConfigAction>,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Set a configuration value
    Set { key: String, value: String },
    /// Reset a configuration value to its default
    Unset { key: String },
    /// Print the config file path
    Path,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load().context("Failed to load configuration")?;
    let verbosity = Verbosity::from_occurrences(cli.verbose);

    // Only the daemon writes the log file
    let log_config = match &cli.command {
        Commands::Start { json_logs } => LogConfig {
            verbosity,
            log_file: Some(config.effective_log_file()),
            json: *json_logs,
        },
        _ => LogConfig {
            verbosity,
            ..LogConfig::default()
        },
    };
    let guard = init_logging(&log_config);

    match cli.command {
        Commands::Start { .. } => run_daemon(&config, guard).await?,
        Commands::Mock { host, directory } => {
            let mut client = Client::connect_or_start(config.endpoint())
                .await
                .context("Failed to reach daemon")?;
            let mocked = client
                .mock(&host, &directory)
                .await
                .with_context(|| format!("Failed to mock host {}", host))?;
            println!(
                "Mocking {} with {}",
                mocked.host,
                mocked.directory.display()
            );
        }
        Commands::Rm { host } => match Client::connect_to(config.endpoint()).await {
            Ok(mut client) => {
                client
                    .unmock(&host)
                    .await
                    .with_context(|| format!("Failed to remove host {}", host))?;
                println!("Removed {}", host);
            }
            Err(ClientError::DaemonNotRunning) => {
                println!("Daemon is offline, no hosts to remove");
            }
            Err(e) => return Err(e).context("Failed to reach daemon"),
        },
        Commands::Status => {
            let hosts = query_status(config.endpoint())
                .await
                .context("Failed to query daemon status")?;
            print_status(hosts.as_deref());
        }
        Commands::Clear => {
            let mut client = Client::connect_or_start(config.endpoint())
                .await
                .context("Failed to reach daemon")?;
            client.clear().await.context("Failed to clear hosts")?;
            println!("Successfully cleared all hosts");
        }
        Commands::Stop => match Client::connect_to(config.endpoint()).await {
            Ok(mut client) => {
                client.stop().await.context("Failed to stop daemon")?;
                println!("Daemon stopped");
            }
            Err(ClientError::DaemonNotRunning) => println!("Daemon is already offline"),
            Err(e) => return Err(e).context("Failed to reach daemon"),
        },
        Commands::Logs => {
            let log_file = config.effective_log_file();
            let mut file = std::fs::File::open(&log_file)
                .with_context(|| format!("Unable to read daemon logs at {}", log_file.display()))?;
            let mut stdout = std::io::stdout().lock();
            std::io::copy(&mut file, &mut stdout).context("Unable to write daemon logs")?;
            stdout.flush()?;
        }
        Commands::Install => {
            let ca = LocalCa::new()?;
            if ca.install().context("Failed to install local CA")? {
                println!(
                    "Successfully installed local CA at {}",
                    ca.ca_cert_file().display()
                );
                println!("Add it to your system and browser trust stores to trust mocked hosts");
            } else {
                println!("Local CA is already installed");
            }
        }
        Commands::Uninstall => {
            let ca = LocalCa::new()?;
            if ca.uninstall().context("Failed to uninstall local CA")? {
                println!("Successfully uninstalled local CA");
            } else {
                println!("Local CA is not installed");
            }
        }
        Commands::Config { action } => run_config(config, action)?,
    }

    Ok(())
}

/// Run the daemon until it stops; a fatal error exits with status 1
async fn run_daemon(config: &Config, guard: LogGuard) -> Result<()> {
    let _ = rustls::crypto::ring::default_provider().install_default();

    let certs = Arc::new(LocalCa::new()?);
    let hosts = HostsFile::with_path(config.effective_hosts_file());
    let server = DaemonServer::new(config.daemon_config(), hosts, certs);
    let handle = server.run().await.context("Failed to start daemon")?;

    match handle.wait().await {
        DaemonExit::Stopped => Ok(()),
        DaemonExit::Fatal(reason) => {
            eprintln!("Daemon stopped: {}", reason);
            drop(guard);
            std::process::exit(1);
        }
    }
}

fn run_config(mut config: Config, action: Option<ConfigAction>) -> Result<()> {
    match action {
        None => println!("{}", format_config(&config)),
        Some(ConfigAction::Path) => println!("{}", Config::config_path()?.display()),
        Some(ConfigAction::Set { key, value }) => {
            config.set_value(&key, Some(&value))?;
            config.save().context("Failed to save configuration")?;
            println!("Set {} = {}", key, value);
        }
        Some(ConfigAction::Unset { key }) => {
            config.set_value(&key, None)?;
            config.save().context("Failed to save configuration")?;
            println!("Unset {}", key);
        }
    }
    Ok(())
}

fn print_status(hosts: Option<&[MockedHost]>) {
    println!();
    let Some(hosts) = hosts else {
        println!("wock daemon [offline]");
        return;
    };
    println!("wock daemon [online]");
    println!();

    const HOST_HEADER: &str = "MOCKED HOST";
    let width = hosts
        .iter()
        .map(|entry| entry.host.len())
        .chain(std::iter::once(HOST_HEADER.len()))
        .max()
        .unwrap_or(HOST_HEADER.len());

    println!("  {:<width$}  DIRECTORY SERVED", HOST_HEADER, width = width);
    for entry in hosts {
        println!(
            "  {:<width$}  {}",
            entry.host,
            entry.directory.display(),
            width = width
        );
    }
}
