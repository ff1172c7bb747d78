//! CLI argument parsing using clap v4

use clap::{Parser, Subcommand};

/// Otter node - registry-discovered peer data exchange
///
/// Registers with the discovery registry, receives data batches from peers
/// and sends a payload once to every peer playing one of the target roles.
#[derive(Parser, Debug)]
#[command(name = "otter-node")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Increase logging verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a node until interrupted
    Run {
        /// Path to configuration file
        #[arg(short, long, env = "OTTER_CONFIG")]
        config: Option<String>,

        /// JSON file with the payload to send to target peers
        #[arg(short, long)]
        send: Option<String>,

        /// Wait up to SECS for inbound data before sending
        #[arg(long, value_name = "SECS", requires = "send")]
        await_data: Option<u64>,
    },

    /// Poll the registry once and list peers
    Peers {
        /// Path to configuration file
        #[arg(short, long, env = "OTTER_CONFIG")]
        config: Option<String>,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },
}

/// Configuration subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum ConfigSubcommand {
    /// Display the effective configuration
    Show {
        /// Path to configuration file
        #[arg(short, long)]
        config: Option<String>,
    },

    /// Initialize a new configuration file
    Init {
        /// Path where to create the config file
        #[arg(short, long)]
        path: Option<String>,

        /// Overwrite existing configuration
        #[arg(short, long)]
        force: bool,
    },

    /// Validate a configuration file
    Validate {
        /// Path to configuration file to validate
        #[arg(short, long)]
        config: Option<String>,
    },
}
