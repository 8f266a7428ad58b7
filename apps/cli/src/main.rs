//! Tidewatch CLI
//!
//! Operator surface for running a node, auditing peers and relaying
//! commands to compute nodes through a gateway.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use libp2p::identity::Keypair;
use libp2p::Multiaddr;
use serde_json::Value;
use tracing::{info, warn};

use tidewatch_keystore::{default_config_dir, default_keyfile, expand_path, resolve_identity};
use tidewatch_logging::LogLevel;
use tidewatch_network::{
    parse_bootstrap_list, start_gateway_client, Command, GatewayConfig, GatewayReply, GatewayResponse,
    HealthCheckConfig, NodeHandle, PeerHealthChecker, StreamClientConfig, SystemResolver, TransportNode, TransportNodeConfig,
};

/// Environment variable holding a comma-separated bootstrap list
const BOOTSTRAP_NODES_ENV: &str = "BOOTSTRAP_NODES";

const DEFAULT_CONFIG_FILE: &str = "config.json";

/// Tidewatch - peer-to-peer node manager for a decentralized compute network
#[derive(Parser)]
#[command(name = "tidewatch")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Node configuration file (JSON)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Hex-encoded secp256k1 private key used as node identity
    #[arg(long, env = "PRIVATE_KEY", hide_env_values = true, global = true)]
    private_key: Option<String>,

    /// Identity file, used when no private key is given
    #[arg(long, global = true)]
    keyfile: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a node until interrupted
    Run {
        /// Audit known peers every N seconds (0 disables)
        #[arg(long, default_value = "0")]
        audit_interval: u64,

        /// Parallel checks per audit round
        #[arg(long, default_value = "8")]
        concurrency: usize,
    },

    /// Check whether one peer is eligible
    Check {
        /// Peer ID to check
        peer: String,

        /// Known addresses of the peer (skips peer store and DHT)
        #[arg(long = "addr")]
        addrs: Vec<Multiaddr>,

        /// Seconds to let the node join the network first
        #[arg(long, default_value = "10")]
        warmup: u64,
    },

    /// Check every peer the node learns about
    Audit {
        #[arg(long, default_value = "10")]
        warmup: u64,

        #[arg(long, default_value = "8")]
        concurrency: usize,
    },

    /// Send a command to a compute node through the gateway
    Command {
        /// Wire command (status, nonce, getComputeEnvironments, ...)
        command: Command,

        /// Target node peer ID
        target: String,

        /// Extra request fields as a JSON object
        #[arg(long)]
        body: Option<String>,

        /// Authorization token
        #[arg(long)]
        auth: Option<String>,

        /// Gateway multiaddress ending in /p2p/<id>
        #[arg(long)]
        gateway: Option<Multiaddr>,
    },

    /// Print network statistics after joining
    Stats {
        #[arg(long, default_value = "10")]
        warmup: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    tidewatch_logging::init(LogLevel::from_verbosity(cli.verbose));

    let keyfile = cli.keyfile.as_deref().map(expand_path).unwrap_or_else(default_keyfile);
    let keypair = resolve_identity(cli.private_key.as_deref(), &keyfile).context("Failed to load node identity")?;

    match cli.command {
        Commands::Run {
            audit_interval,
            concurrency,
        } => {
            let config = load_config(cli.config.as_deref())?;
            run_node(config, keypair, audit_interval, concurrency).await?;
        }
        Commands::Check { peer, addrs, warmup } => {
            let config = load_config(cli.config.as_deref())?;
            check(config, keypair, &peer, &addrs, warmup).await?;
        }
        Commands::Audit { warmup, concurrency } => {
            let config = load_config(cli.config.as_deref())?;
            audit(config, keypair, warmup, concurrency).await?;
        }
        Commands::Command {
            command,
            target,
            body,
            auth,
            gateway,
        } => {
            send_command(keypair, command, &target, body.as_deref(), auth.as_deref(), gateway).await?;
        }
        Commands::Stats { warmup } => {
            let config = load_config(cli.config.as_deref())?;
            stats(config, keypair, warmup).await?;
        }
    }

    Ok(())
}

/// Config file (explicit, else `config.json` in the default config dir,
/// else defaults), then `BOOTSTRAP_NODES` on top.
fn load_config(path: Option<&Path>) -> Result<TransportNodeConfig> {
    let path = match path {
        Some(path) => Some(expand_path(path)),
        None => Some(default_config_dir().join(DEFAULT_CONFIG_FILE)).filter(|p| p.exists()),
    };
    let mut config = match path {
        Some(path) => {
            let json = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config {}", path.display()))?;
            TransportNodeConfig::from_json(&json).context("Invalid node configuration")?
        }
        None => TransportNodeConfig::default(),
    };

    if let Ok(list) = std::env::var(BOOTSTRAP_NODES_ENV) {
        let nodes = parse_bootstrap_list(&list);
        if nodes.is_empty() {
            warn!("{} set but holds no usable address, keeping configured list", BOOTSTRAP_NODES_ENV);
        } else {
            config.bootstrap_nodes = nodes;
        }
    }
    Ok(config)
}

fn checker(node: &TransportNode) -> PeerHealthChecker<NodeHandle, SystemResolver> {
    let config = HealthCheckConfig {
        client: StreamClientConfig::from_env(),
        ..HealthCheckConfig::default()
    };
    PeerHealthChecker::new(node.handle(), SystemResolver, config)
}

async fn warm_up(seconds: u64) {
    if seconds > 0 {
        info!("Joining the network for {}s", seconds);
        tokio::time::sleep(Duration::from_secs(seconds)).await;
    }
}

async fn run_node(config: TransportNodeConfig, keypair: Keypair, audit_interval: u64, concurrency: usize) -> Result<()> {
    let node = TransportNode::start(config, keypair).await?;
    info!("Node {} running. Press Ctrl+C to stop.", node.local_peer_id());

    if audit_interval == 0 {
        tokio::signal::ctrl_c().await?;
    } else {
        let checker = checker(&node);
        let window = Duration::from_secs(audit_interval);
        let mut ticker = tokio::time::interval(window);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let results = checker.check_known_peers(concurrency, window).await;
                    let eligible = results.iter().filter(|r| r.succeeded).count();
                    info!("Audit round: {}/{} peers eligible", eligible, results.len());
                }
                _ = tokio::signal::ctrl_c() => break,
            }
        }
    }

    node.shutdown().await;
    Ok(())
}

async fn check(config: TransportNodeConfig, keypair: Keypair, peer: &str, addrs: &[Multiaddr], warmup: u64) -> Result<()> {
    let node = TransportNode::start(config, keypair).await?;
    if addrs.is_empty() {
        warm_up(warmup).await;
    }

    let result = checker(&node).check_peer(peer, addrs, Duration::ZERO).await;
    println!("{}", serde_json::to_string_pretty(&result)?);

    node.shutdown().await;
    Ok(())
}

async fn audit(config: TransportNodeConfig, keypair: Keypair, warmup: u64, concurrency: usize) -> Result<()> {
    let node = TransportNode::start(config, keypair).await?;
    warm_up(warmup).await;

    let results = checker(&node)
        .check_known_peers(concurrency, Duration::from_secs(warmup))
        .await;
    for result in &results {
        println!("{}", serde_json::to_string(result)?);
    }

    node.shutdown().await;
    Ok(())
}

async fn send_command(
    keypair: Keypair,
    command: Command,
    target: &str,
    body: Option<&str>,
    auth: Option<&str>,
    gateway: Option<Multiaddr>,
) -> Result<()> {
    let body = match body {
        Some(text) => match serde_json::from_str::<Value>(text).context("Invalid --body")? {
            Value::Object(map) => Some(map),
            _ => bail!("--body must be a JSON object"),
        },
        None => None,
    };

    let config = match gateway {
        Some(addr) => GatewayConfig::with_relay(addr),
        None => GatewayConfig::default(),
    };
    let (client, node) = start_gateway_client(config, keypair).await?;
    info!("Relaying {} through gateway {}", command, client.relay_peer());

    let outcome = async {
        match client.send_command(command, target, body.as_ref(), auth).await? {
            GatewayReply::Response(GatewayResponse::Json(json)) => {
                println!("{}", serde_json::to_string_pretty(&json)?);
            }
            GatewayReply::Response(GatewayResponse::Raw(bytes)) => {
                std::io::stdout().write_all(&bytes)?;
            }
            GatewayReply::Stream(mut stream) => {
                let mut stdout = std::io::stdout();
                while let Some(chunk) = stream.next_chunk().await? {
                    stdout.write_all(&chunk)?;
                    stdout.flush()?;
                }
            }
        }
        Ok::<_, anyhow::Error>(())
    }
    .await;

    node.shutdown().await;
    outcome
}

async fn stats(config: TransportNodeConfig, keypair: Keypair, warmup: u64) -> Result<()> {
    let node = TransportNode::start(config, keypair).await?;
    warm_up(warmup).await;

    let stats = node.handle().network_stats().await?;
    println!("{}", serde_json::to_string_pretty(&stats)?);

    node.shutdown().await;
    Ok(())
}
