//! peershell
//!
//! SSH shell sessions between peers, addressed by node id.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use iroh::{NodeAddr, NodeId, RelayUrl};
use peershell::config::{default_config_path, Config};
use peershell::engine::ClientCredential;
use peershell::identity::load_or_generate_node_key;
use peershell::orchestrator::{
    bind_iroh, connect, ConnectRequest, LocalAttachment, Server, SHUTDOWN_GRACE,
};
use peershell::CloseReason;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::Layer;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Exit code when the session was cancelled locally.
const EXIT_CANCELLED: i32 = 130;

/// peershell - interactive SSH sessions over peer-to-peer streams.
#[derive(Parser, Debug)]
#[command(name = "peershell")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Serve login shells to peers
    Serve,

    /// Open a shell on a remote peer
    Connect {
        /// Node id of the peer
        node_id: String,

        /// User to log in as
        #[arg(long, short)]
        user: Option<String>,

        /// Private key for public-key authentication
        #[arg(long, short, value_name = "FILE")]
        identity: Option<PathBuf>,

        /// Relay server the peer is reachable through
        #[arg(long, value_name = "URL")]
        relay: Option<String>,

        /// Direct address of the peer (repeatable)
        #[arg(long, value_name = "IP:PORT")]
        addr: Vec<SocketAddr>,
    },

    /// Print this machine's node id
    Id,

    /// Manage the configuration file
    #[command(subcommand)]
    Config(ConfigCommands),
}

/// Subcommands for configuration management.
#[derive(Subcommand, Debug, Clone)]
pub enum ConfigCommands {
    /// Write a configuration file with default values
    Init {
        /// Overwrite an existing file
        #[arg(long, short)]
        force: bool,
    },

    /// Print the effective configuration
    Show,

    /// Print the configuration file path
    Path,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let mut config = Config::load(&config_path)?;
    config.apply_env_overrides();
    if let Some(level) = &cli.log_level {
        config.general.log_level = level.clone();
    }

    let log_guard = init_tracing(&config, cli.log_level.is_some(), quiet_stderr(&cli))?;
    tracing::debug!("Using config file: {:?}", config_path);

    let code = match cli.command {
        Commands::Serve => {
            config.validate()?;
            run_server(&config).await?;
            0
        }
        Commands::Connect {
            node_id,
            user,
            identity,
            relay,
            addr,
        } => {
            if let Some(user) = user {
                config.client.user = user;
            }
            if let Some(identity) = identity {
                config.client.identity_file = Some(identity);
            }
            if let Some(relay) = relay {
                config.network.relay_url = Some(relay);
            }
            config.validate_client()?;
            run_client(&config, &node_id, addr).await?
        }
        Commands::Id => {
            let key = load_or_generate_node_key(&config.node_key_path())?;
            println!("{}", key.public());
            0
        }
        Commands::Config(command) => {
            handle_config(command, &config, &config_path)?;
            0
        }
    };

    if code != 0 {
        drop(log_guard);
        std::process::exit(code);
    }
    Ok(())
}

/// Install the subscriber: stderr, plus a daily log file when enabled.
///
/// `RUST_LOG` wins over the configured level unless `--log-level` was given.
/// With `quiet` only warnings and errors reach stderr; the log file
/// still gets the full level.
fn init_tracing(
    config: &Config,
    explicit_level: bool,
    quiet: bool,
) -> anyhow::Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) if !explicit_level => filter,
        _ => EnvFilter::try_new(&config.general.log_level)
            .with_context(|| format!("Invalid log level: {}", config.general.log_level))?,
    };

    let (file_layer, guard) = if config.general.log_to_file {
        let appender = tracing_appender::rolling::daily(&config.general.data_dir, "peershell.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        let layer = tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(writer);
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(stderr_level(quiet)),
        )
        .with(file_layer)
        .init();

    Ok(guard)
}

/// Session output shares the terminal with stderr, so `connect` keeps it
/// quiet unless a level was asked for.
fn quiet_stderr(cli: &Cli) -> bool {
    matches!(cli.command, Commands::Connect { .. }) && cli.log_level.is_none()
}

fn stderr_level(quiet: bool) -> LevelFilter {
    if quiet {
        LevelFilter::WARN
    } else {
        LevelFilter::TRACE
    }
}

/// Serve until SIGINT or SIGTERM.
async fn run_server(config: &Config) -> anyhow::Result<()> {
    let server = Server::from_config(config)?;
    let transport = bind_iroh(config).await?;

    let addr = transport.node_addr().await?;
    println!("Node ID: {}", transport.node_id());
    if let Some(relay) = &addr.relay_url {
        println!("Relay:   {}", relay);
    }
    for direct in &addr.direct_addresses {
        println!("Address: {}", direct);
    }

    tokio::select! {
        result = server.listen(&transport) => result?,
        _ = wait_for_shutdown_signal() => tracing::info!("Received shutdown signal"),
    }

    server.shutdown(SHUTDOWN_GRACE).await;
    transport.close().await;
    Ok(())
}

/// Connect to `node_id` and return the process exit code.
async fn run_client(
    config: &Config,
    node_id: &str,
    addrs: Vec<SocketAddr>,
) -> anyhow::Result<i32> {
    let node_id: NodeId = node_id
        .parse()
        .with_context(|| format!("Invalid node id: {}", node_id))?;

    let credential = match &config.client.identity_file {
        Some(path) => ClientCredential::load_key(path)?,
        None => prompt_password(&config.client.user, &node_id)?,
    };

    let transport = bind_iroh(config).await?;
    let relay: Option<RelayUrl> = config.relay_url();
    if relay.is_some() || !addrs.is_empty() {
        transport.add_node_addr(NodeAddr::from_parts(node_id, relay, addrs));
    }

    let cancel = CancellationToken::new();
    let request = ConnectRequest::from_config(config, node_id.to_string(), credential);
    let outcome = match LocalAttachment::process(&cancel) {
        Ok(local) => connect(&transport, request, local, &cancel).await,
        Err(e) => Err(e),
    };
    cancel.cancel();
    transport.close().await;

    let outcome = outcome?;
    tracing::debug!(reason = %outcome.reason, exit_status = ?outcome.exit_status, "Disconnected");
    Ok(match (outcome.exit_status, outcome.reason) {
        (Some(status), _) => status as i32,
        (None, CloseReason::Cancelled) => EXIT_CANCELLED,
        (None, _) => 0,
    })
}

fn prompt_password(user: &str, node_id: &NodeId) -> anyhow::Result<ClientCredential> {
    let secret = inquire::Password::new(&format!("{}@{} password:", user, node_id.fmt_short()))
        .without_confirmation()
        .with_display_mode(inquire::PasswordDisplayMode::Hidden)
        .prompt()
        .context("Failed to read password")?;
    Ok(ClientCredential::password(secret))
}

fn handle_config(command: ConfigCommands, config: &Config, path: &Path) -> anyhow::Result<()> {
    match command {
        ConfigCommands::Init { force } => {
            if path.exists() && !force {
                anyhow::bail!(
                    "Config file already exists: {} (use --force to overwrite)",
                    path.display()
                );
            }
            Config::default().save(path)?;
            println!("Wrote default configuration to {}", path.display());
        }
        ConfigCommands::Show => print!("{}", config.to_toml()?),
        ConfigCommands::Path => println!("{}", path.display()),
    }
    Ok(())
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to register SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM");
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received SIGINT");
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
