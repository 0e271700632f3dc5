//! WolfKVCtl - Command line tool for WolfKV nodes
//!
//! Usage:
//!   wolfkvctl get KEY              - Read a key
//!   wolfkvctl put KEY VALUE        - Write a key on every ready peer
//!   wolfkvctl delete KEY           - Remove a key on every ready peer
//!   wolfkvctl range --start X_     - List committed entries
//!   wolfkvctl status               - Show node and peer status

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};

/// WolfKV Control Tool
#[derive(Parser)]
#[command(name = "wolfkvctl")]
#[command(about = "Read, write and monitor WolfKV nodes", long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "/etc/wolfkv/config.toml")]
    config: PathBuf,

    /// API endpoint to connect to (overrides config)
    #[arg(short, long)]
    endpoint: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Read a key
    Get { key: String },
    /// Write a key
    Put {
        key: String,
        value: String,
        /// Expire the key after this many seconds
        #[arg(long)]
        ttl: Option<u64>,
    },
    /// Remove a key
    Delete { key: String },
    /// List committed entries in [start, end)
    Range {
        #[arg(long, default_value = "")]
        start: String,
        #[arg(long)]
        end: Option<String>,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Show status of the node and its peers
    Status,
    /// Check node health
    Health,
}

// ============ API Types ============

#[derive(Debug, Deserialize)]
struct KvEntry {
    key: String,
    value: String,
}

#[derive(Debug, Serialize)]
struct PutRequest {
    value: String,
    ttl_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct PeerStatus {
    peer: String,
    state: String,
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    node: String,
    ready: bool,
    uptime_seconds: u64,
    #[serde(default)]
    ready_peers: Vec<String>,
    #[serde(default)]
    peers: Vec<PeerStatus>,
}

#[derive(Debug, Deserialize)]
struct HealthResponse {
    healthy: bool,
    node: String,
    ready: bool,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Debug, Deserialize, Default)]
struct Config {
    #[serde(default)]
    api: ApiConfig,
}

#[derive(Debug, Deserialize, Default)]
struct ApiConfig {
    #[serde(default = "default_api_bind")]
    bind_address: String,
}

fn default_api_bind() -> String {
    "0.0.0.0:8080".to_string()
}

// ============ Main ============

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let endpoint = cli.endpoint.clone().unwrap_or_else(|| endpoint_from_config(&cli.config));
    let client = reqwest::Client::new();

    let result = match cli.command {
        Commands::Get { key } => get(&client, &endpoint, &key).await,
        Commands::Put { key, value, ttl } => put(&client, &endpoint, &key, value, ttl).await,
        Commands::Delete { key } => delete(&client, &endpoint, &key).await,
        Commands::Range { start, end, limit } => {
            range(&client, &endpoint, &start, end.as_deref(), limit).await
        }
        Commands::Status => show_status(&client, &endpoint).await,
        Commands::Health => show_health(&client, &endpoint).await,
    };

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

/// API endpoint from the node config, or the default
fn endpoint_from_config(path: &PathBuf) -> String {
    let addr = std::fs::read_to_string(path)
        .ok()
        .and_then(|content| toml::from_str::<Config>(&content).ok())
        .map(|config| config.api.bind_address)
        .unwrap_or_else(default_api_bind);

    // Convert bind address to localhost if it's 0.0.0.0
    match addr.strip_prefix("0.0.0.0:") {
        Some(port) => format!("http://127.0.0.1:{}", port),
        None => format!("http://{}", addr),
    }
}

/// Turn a non-success response into an error carrying the API message
async fn check(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    match response.json::<ErrorResponse>().await {
        Ok(body) => bail!("{} ({})", body.error, status),
        Err(_) => bail!("API error: {}", status),
    }
}

// ============ Commands ============

async fn get(client: &reqwest::Client, endpoint: &str, key: &str) -> Result<()> {
    let response = client
        .get(format!("{}/kv/{}", endpoint, key))
        .send()
        .await
        .context("request failed")?;
    let entry: KvEntry = check(response).await?.json().await?;
    println!("{}", entry.value);
    Ok(())
}

async fn put(
    client: &reqwest::Client,
    endpoint: &str,
    key: &str,
    value: String,
    ttl: Option<u64>,
) -> Result<()> {
    let response = client
        .put(format!("{}/kv/{}", endpoint, key))
        .json(&PutRequest { value, ttl_secs: ttl })
        .send()
        .await
        .context("request failed")?;
    check(response).await?;
    println!("OK");
    Ok(())
}

async fn delete(client: &reqwest::Client, endpoint: &str, key: &str) -> Result<()> {
    let response = client
        .delete(format!("{}/kv/{}", endpoint, key))
        .send()
        .await
        .context("request failed")?;
    check(response).await?;
    println!("OK");
    Ok(())
}

async fn range(
    client: &reqwest::Client,
    endpoint: &str,
    start: &str,
    end: Option<&str>,
    limit: Option<usize>,
) -> Result<()> {
    let mut query: Vec<(&str, String)> = vec![("start", start.to_string())];
    if let Some(end) = end {
        query.push(("end", end.to_string()));
    }
    if let Some(limit) = limit {
        query.push(("limit", limit.to_string()));
    }

    let response = client
        .get(format!("{}/range", endpoint))
        .query(&query)
        .send()
        .await
        .context("request failed")?;
    let entries: Vec<KvEntry> = check(response).await?.json().await?;

    for entry in &entries {
        println!("{:<30} {}", entry.key, entry.value);
    }
    println!("({} entries)", entries.len());
    Ok(())
}

async fn show_status(client: &reqwest::Client, endpoint: &str) -> Result<()> {
    let response = client
        .get(format!("{}/status", endpoint))
        .send()
        .await
        .context("request failed")?;
    let status: StatusResponse = check(response).await?.json().await?;

    println!();
    println!("WolfKV Node Status (wolfkvctl v{})", env!("CARGO_PKG_VERSION"));
    println!("=====================================");
    println!();
    println!("Node:         {}", status.node);
    println!("Ready:        {}", if status.ready { "yes" } else { "no (syncing)" });
    println!("Uptime:       {}s", status.uptime_seconds);
    println!("Ready Peers:  {}", status.ready_peers.len());
    println!();

    println!("{:<30} {:<15}", "PEER", "STATE");
    println!("{}", "-".repeat(45));
    for peer in &status.peers {
        // Pad state to fixed width BEFORE adding color codes
        let state_padded = format!("{:<15}", peer.state);
        let state_colored = match peer.state.as_str() {
            "READY" => format!("\x1b[32m{}\x1b[0m", state_padded),
            "CONNECTED" | "DIALING" => format!("\x1b[33m{}\x1b[0m", state_padded),
            "DISCONNECTED" => format!("\x1b[31m{}\x1b[0m", state_padded),
            _ => state_padded,
        };
        println!("{:<30} {}", peer.peer, state_colored);
    }
    println!();

    Ok(())
}

async fn show_health(client: &reqwest::Client, endpoint: &str) -> Result<()> {
    let response = client
        .get(format!("{}/health", endpoint))
        .send()
        .await
        .context("request failed")?;
    let health: HealthResponse = check(response).await?.json().await?;

    println!(
        "{}: {} ({})",
        health.node,
        if health.healthy { "healthy" } else { "unhealthy" },
        if health.ready { "ready" } else { "not ready" }
    );
    Ok(())
}
