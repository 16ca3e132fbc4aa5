// Meshvault node entry point

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::fs;
use tokio::signal;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use meshvault_config::NodeConfig;
use meshvault_crypto::Secret;
use meshvault_server::{FileServer, FileServerOptions};

/// Meshvault node CLI arguments
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Path to a YAML configuration file
    #[clap(short, long)]
    config: Option<PathBuf>,

    /// Listen address
    #[clap(short, long)]
    listen: Option<SocketAddr>,

    /// Bootstrap peer address; may be given multiple times
    #[clap(short, long = "peer")]
    peers: Vec<SocketAddr>,

    /// Storage root directory
    #[clap(long)]
    data_dir: Option<PathBuf>,

    /// Shared secret as hex
    #[clap(long)]
    secret_hex: Option<String>,

    /// File holding the shared secret
    #[clap(long)]
    secret_file: Option<PathBuf>,

    /// Log level
    #[clap(long, default_value = "info")]
    log_level: String,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a storage node until interrupted
    Serve,
    /// Store a file on the mesh under the given key
    Store { key: String, path: PathBuf },
    /// Fetch a key from the mesh into the given path
    Get { key: String, path: PathBuf },
    /// Generate a fresh shared secret and print it as hex
    Keygen,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging
    let log_level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    if let Command::Keygen = args.command {
        println!("{}", Secret::generate().to_hex());
        return Ok(());
    }

    // Load configuration, then layer CLI flags on top.
    let mut config = match &args.config {
        Some(path) => NodeConfig::from_file(path)
            .with_context(|| format!("failed to load configuration from {}", path.display()))?,
        None => NodeConfig::from_env().context("failed to load configuration")?,
    };
    if let Some(listen) = args.listen {
        config.listen_addr = listen;
    }
    if !args.peers.is_empty() {
        config.bootstrap_peers = args.peers.clone();
    }
    if let Some(data_dir) = &args.data_dir {
        config.storage_root = data_dir.clone();
    }
    if args.secret_hex.is_some() {
        config.secret_hex = args.secret_hex.clone();
    }
    if args.secret_file.is_some() {
        config.secret_file = args.secret_file.clone();
    }

    let secret = config.secret().context("failed to load shared secret")?;

    match args.command {
        Command::Serve => serve(&config, secret).await,
        Command::Store { key, path } => store(&config, secret, &key, &path).await,
        Command::Get { key, path } => get(&config, secret, &key, &path).await,
        Command::Keygen => unreachable!("handled above"),
    }
}

async fn serve(config: &NodeConfig, secret: Secret) -> Result<()> {
    let server = FileServer::start(
        FileServerOptions {
            listen_addr: config.listen_addr,
            storage_root: config.storage_root.clone(),
            bootstrap_peers: config.bootstrap_peers.clone(),
            fetch_timeout: config.fetch_timeout(),
        },
        secret,
    )
    .await
    .context("failed to start node")?;

    info!(addr = %server.local_addr(), "node running, press Ctrl+C to exit");
    signal::ctrl_c().await?;

    info!("shutting down");
    server.shutdown();
    info!("node shutdown complete");
    Ok(())
}

/// Join the mesh on an ephemeral port, run one operation, leave.
async fn ephemeral_node(config: &NodeConfig, secret: Secret) -> Result<std::sync::Arc<FileServer>> {
    let server = FileServer::start(
        FileServerOptions {
            listen_addr: "127.0.0.1:0".parse().expect("static address"),
            storage_root: config.storage_root.clone(),
            bootstrap_peers: config.bootstrap_peers.clone(),
            fetch_timeout: config.fetch_timeout(),
        },
        secret,
    )
    .await
    .context("failed to start node")?;

    if !config.bootstrap_peers.is_empty() && server.peer_count().await == 0 {
        warn!("no bootstrap peer reachable; operating on local storage only");
    }
    Ok(server)
}

async fn store(config: &NodeConfig, secret: Secret, key: &str, path: &Path) -> Result<()> {
    let server = ephemeral_node(config, secret).await?;

    let mut file = fs::File::open(path)
        .await
        .with_context(|| format!("failed to open {}", path.display()))?;
    let stored = server
        .store(key, &mut file)
        .await
        .with_context(|| format!("failed to store {key}"))?;

    println!("stored {key} ({stored} bytes on disk)");
    server.shutdown();
    Ok(())
}

async fn get(config: &NodeConfig, secret: Secret, key: &str, path: &Path) -> Result<()> {
    let server = ephemeral_node(config, secret).await?;

    let mut file = fs::File::create(path)
        .await
        .with_context(|| format!("failed to create {}", path.display()))?;
    match server.retrieve(key, &mut file).await {
        Ok(written) => {
            println!("retrieved {key} into {} ({written} bytes)", path.display());
            server.shutdown();
            Ok(())
        }
        Err(e) => {
            drop(file);
            let _ = fs::remove_file(path).await;
            server.shutdown();
            if e.is_not_found() {
                anyhow::bail!("key not found on the mesh: {key}");
            }
            Err(e).with_context(|| format!("failed to retrieve {key}"))
        }
    }
}
