//! Otter node binary
//!
//! Runs a node, lists registry peers, and manages configuration files.

mod cli;

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tracing::{info, warn};

use otter_node::config::init_config;
use otter_node::logging::{self, LogGuards};
use otter_node::registry::RegistryClient;
use otter_node::{payload_from_json, Error, Node, NodeConfig, PayloadMap, Result};

use crate::cli::{Cli, Commands, ConfigSubcommand};

fn main() {
    let cli = Cli::parse();

    if let Err(e) = dispatch(cli) {
        eprint!("{}", e.format_for_terminal());
        std::process::exit(e.exit_code());
    }
}

fn dispatch(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Config { subcommand } => {
            logging::init_simple(tracing::Level::WARN)?;
            handle_config_command(subcommand)
        }
        Commands::Run {
            config,
            send,
            await_data,
        } => {
            let config = NodeConfig::load(config.as_deref())?;
            let _log_guards = init_logging_from_config(&config, cli.verbose, cli.quiet)?;

            info!(version = env!("CARGO_PKG_VERSION"), "Starting otter-node");

            // Read the payload before touching the network so a bad file fails fast
            let payload = send.map(|path| read_payload(&path)).transpose()?;
            let await_data = await_data.map(Duration::from_secs);

            build_runtime()?.block_on(run_node(config, payload, await_data))
        }
        Commands::Peers { config } => {
            let config = NodeConfig::load_unvalidated(config.as_deref())?;
            let _log_guards = init_logging_from_config(&config, cli.verbose, cli.quiet)?;

            build_runtime()?.block_on(list_peers(config))
        }
    }
}

fn init_logging_from_config(config: &NodeConfig, verbose: u8, quiet: bool) -> Result<LogGuards> {
    logging::init_logging(&config.logging, verbose, quiet)
}

fn build_runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .worker_threads(num_cpus::get().clamp(2, 8))
        .thread_name("otter-node")
        .build()
        .map_err(|e| Error::Internal(format!("Failed to create async runtime: {}", e)))
}

/// Parse a JSON payload file
fn read_payload(path: &str) -> Result<PayloadMap> {
    let path = PathBuf::from(shellexpand::tilde(path).as_ref());
    let content = fs::read_to_string(&path).map_err(|e| Error::IoRead {
        path: path.clone(),
        source: e,
    })?;
    let json: serde_json::Value = serde_json::from_str(&content)?;
    Ok(payload_from_json(&json)?)
}

async fn run_node(config: NodeConfig, payload: Option<PayloadMap>, await_data: Option<Duration>) -> Result<()> {
    let node = Node::start(config, None).await?;

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    if let Some(payload) = payload {
        if let Some(timeout) = await_data {
            info!(timeout_secs = timeout.as_secs(), "Waiting for inbound data before sending");
            tokio::select! {
                arrived = node.wait_for_data(timeout) => {
                    if !arrived {
                        warn!(timeout_secs = timeout.as_secs(), "No data received, sending anyway");
                    }
                }
                res = &mut shutdown => {
                    res?;
                    info!("Shutdown signal received");
                    node.shutdown().await;
                    return Ok(());
                }
            }
        }
        node.send_data_to_peers(payload)?;
    }

    shutdown.await?;
    info!(
        senders = node.received_data().len(),
        delivered = node.sent_peer_count(),
        "Shutdown signal received"
    );
    node.shutdown().await;
    Ok(())
}

async fn list_peers(config: NodeConfig) -> Result<()> {
    let client = RegistryClient::new(&config.registry)?;
    let peers = client.fetch_peers().await?;
    let self_id = config.node_id();
    let roles = &config.dispatch.target_roles;

    println!("{:<24} {:<16} {:<24} {:<7} TAGS", "ID", "SERVICE", "ENDPOINT", "");
    for peer in &peers {
        let marker = if peer.id == self_id {
            "self"
        } else if peer.matches_roles(roles) {
            "target"
        } else {
            ""
        };
        println!(
            "{:<24} {:<16} {:<24} {:<7} {}",
            peer.id,
            peer.service_name,
            peer.endpoint(),
            marker,
            peer.tags.join(",")
        );
    }
    println!("\n{} peer(s)", peers.len());
    Ok(())
}

fn handle_config_command(subcommand: ConfigSubcommand) -> Result<()> {
    match subcommand {
        ConfigSubcommand::Show { config } => {
            let cfg = NodeConfig::load_unvalidated(config.as_deref())?;
            println!("{}", toml::to_string_pretty(&cfg)?);
        }
        ConfigSubcommand::Init { path, force } => {
            let created = init_config(path.as_deref(), force)?;
            println!("Configuration file created: {}", created.display());
        }
        ConfigSubcommand::Validate { config } => {
            NodeConfig::load(config.as_deref())?;
            println!("Configuration is valid.");
        }
    }

    Ok(())
}
