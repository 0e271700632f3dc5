//! WolfKV - Multi-master Replicated Key-Value Store
//!
//! Node daemon: serves the peer protocol, dials configured peers and
//! exposes the replicated store over HTTP.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wolfkv::api::HttpServer;
use wolfkv::cluster::NodeEvent;
use wolfkv::config::{LoggingConfig, WolfKvConfig};
use wolfkv::error::Result;
use wolfkv::node::Node;
use wolfkv::store::{SqliteStore, Store};

/// Interval between sweeps of expired keys
const PURGE_INTERVAL: Duration = Duration::from_secs(60);

/// WolfKV - Multi-master Replicated Key-Value Store
#[derive(Parser)]
#[command(name = "wolfkv")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "wolfkv.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the WolfKV node
    Start,

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "wolfkv.toml")]
        output: PathBuf,

        /// Host name peers use to reach this node
        #[arg(long, default_value = "localhost")]
        host: String,

        /// Cluster port
        #[arg(long, default_value_t = 7654)]
        port: u16,
    },

    /// Validate configuration file
    Validate,

    /// Show node information
    Info,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start => run_start(cli.config, cli.log_level).await,
        Commands::Init { output, host, port } => {
            init_logging(&LoggingConfig::default(), cli.log_level.as_deref());
            run_init(output, host, port)
        }
        Commands::Validate => {
            init_logging(&LoggingConfig::default(), cli.log_level.as_deref());
            run_validate(cli.config)
        }
        Commands::Info => {
            init_logging(&LoggingConfig::default(), cli.log_level.as_deref());
            run_info(cli.config)
        }
    }
}

/// Initialize logging
fn init_logging(logging: &LoggingConfig, level: Option<&str>) {
    let level = level.unwrap_or(&logging.level);
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    let registry = tracing_subscriber::registry().with(env_filter);
    if logging.format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Start the WolfKV node
async fn run_start(config_path: PathBuf, log_level: Option<String>) -> Result<()> {
    let config = WolfKvConfig::from_file(&config_path)?;
    init_logging(&config.logging, log_level.as_deref());

    tracing::info!("Starting WolfKV node {}", config.identity());

    std::fs::create_dir_all(config.data_dir())?;
    let store: Arc<dyn Store> = Arc::new(SqliteStore::open(&config.store_path())?);
    tracing::info!("Local store opened at {}", config.store_path().display());

    let listener = tokio::net::TcpListener::bind(config.bind_address()).await?;
    let node = Node::create(Arc::clone(&store), config.cluster_config()?).await?;

    // Event logger
    let mut events = node.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(NodeEvent::Ready) => tracing::info!("Node is ready"),
                Ok(NodeEvent::PeerConnected(peer)) => tracing::info!("Peer {} connected", peer),
                Ok(NodeEvent::PeerDisconnected(peer)) => {
                    tracing::warn!("Peer {} disconnected", peer)
                }
                Ok(NodeEvent::Error(e)) => tracing::warn!("Node error: {}", e),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    tracing::debug!("Event logger skipped {} events", n)
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    // Peer protocol
    let server_node = node.clone();
    tokio::spawn(async move {
        if let Err(e) = server_node.serve(listener).await {
            tracing::error!("Peer server error: {}", e);
        }
    });

    // HTTP API
    if config.api.enabled {
        let http = HttpServer::new(config.api.clone(), node.clone());
        tokio::spawn(async move {
            if let Err(e) = http.start().await {
                tracing::error!("HTTP API error: {}", e);
            }
        });
    }

    // Expired key sweeper
    let sweep_store = Arc::clone(&store);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(PURGE_INTERVAL);
        loop {
            interval.tick().await;
            match sweep_store.purge_expired().await {
                Ok(0) => {}
                Ok(n) => tracing::debug!("Purged {} expired keys", n),
                Err(e) => tracing::warn!("Expiry sweep failed: {}", e),
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");
    node.close().await;

    Ok(())
}

/// Initialize configuration file
fn run_init(output: PathBuf, host: String, port: u16) -> Result<()> {
    let config_content = format!(
        r#"# WolfKV Configuration
# Generated configuration file

[node]
host = "{host}"
port = {port}
data_dir = "/var/lib/wolfkv/{host}-{port}"
# bind_address = "0.0.0.0:{port}"

[cluster]
peers = []
# peers = ["node-2.example.com:7654", "node-3.example.com:7654"]
mode = "semisync"
default_ttl_secs = 0
fail_after = 100
retry_interval_ms = 10
sync_poll_interval_ms = 500
reconnect_interval_ms = 1000
connect_timeout_ms = 5000

[api]
enabled = true
bind_address = "0.0.0.0:8080"

[logging]
level = "info"
format = "pretty"
"#
    );

    std::fs::write(&output, config_content)?;
    println!("Configuration file created: {}", output.display());
    println!("\nEdit the file to configure your cluster peers.");
    println!("Then start with: wolfkv --config {} start", output.display());

    Ok(())
}

/// Validate configuration
fn run_validate(config_path: PathBuf) -> Result<()> {
    match WolfKvConfig::from_file(&config_path).and_then(|c| c.cluster_config().map(|cc| (c, cc))) {
        Ok((config, cluster)) => {
            println!("✓ Configuration is valid");
            println!("  Node:           {}", cluster.identity);
            println!("  Bind Address:   {}", config.bind_address());
            println!("  Peers:          {}", cluster.peers.len());
            println!("  Mode:           {}", cluster.mode);
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e)
        }
    }
}

/// Show node information
fn run_info(config_path: PathBuf) -> Result<()> {
    let config = WolfKvConfig::from_file(&config_path)?;
    let cluster = config.cluster_config()?;

    println!("WolfKV Node Information");
    println!("=======================");
    println!();
    println!("Node:             {}", cluster.identity);
    println!("Bind Address:     {}", config.bind_address());
    println!("Data Directory:   {}", config.data_dir().display());
    println!("Store:            {}", config.store_path().display());
    println!();
    println!("Cluster Configuration:");
    for peer in &cluster.peers {
        println!("  Peer:           {}", peer);
    }
    println!("  Mode:           {}", cluster.mode);
    println!(
        "  Default TTL:    {}",
        cluster
            .default_ttl
            .map(|t| format!("{} s", t.as_secs()))
            .unwrap_or_else(|| "none".to_string())
    );
    println!("  Fail After:     {} polls", cluster.fail_after);
    println!("  Retry Interval: {} ms", cluster.retry_interval.as_millis());
    println!();
    println!("API:              {}", if config.api.enabled { config.api.bind_address.as_str() } else { "disabled" });

    Ok(())
}
