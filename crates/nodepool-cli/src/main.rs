//! nodepool — test node lifecycle from the command line.
//!
//! # Usage
//!
//! ```text
//! nodepool --config /etc/nodepool/nodepool.toml list --locked --machine-type smithi
//! nodepool stale --owner scheduled_alice@teuthology
//! nodepool create --node-type openstack-small --num 3 --os-type ubuntu --os-version 22.04
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::debug;

use nodepool_core::NodepoolConfig;

mod commands;

#[derive(Parser)]
#[command(
    name = "nodepool",
    about = "Provision, inspect, and reclaim test nodes",
    version,
    propagate_version = true
)]
struct Cli {
    /// Configuration file.
    #[arg(short, long, default_value = "/etc/nodepool/nodepool.toml", global = true)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the lock status of named nodes (all nodes if none given)
    Status {
        names: Vec<String>,
    },
    /// List nodes matching filters
    List {
        /// Only locked nodes
        #[arg(long, conflicts_with = "unlocked")]
        locked: bool,
        /// Only unlocked nodes
        #[arg(long)]
        unlocked: bool,
        /// Machine type, or several separated by commas
        #[arg(long)]
        machine_type: Option<String>,
        /// Only nodes locked by this owner
        #[arg(long)]
        owner: Option<String>,
        /// Print an object keyed by node name
        #[arg(long)]
        by_name: bool,
    },
    /// Is the node a virtual machine?
    IsVm {
        name: String,
    },
    /// Locked nodes whose job is no longer running
    Stale {
        #[arg(long)]
        owner: Option<String>,
    },
    /// Configured node types
    Types,
    /// Create a batch of ready nodes
    Create {
        #[arg(long)]
        node_type: String,
        #[arg(long, default_value = "1")]
        num: u32,
        #[arg(long)]
        os_type: String,
        #[arg(long)]
        os_version: String,
        #[arg(long)]
        arch: Option<String>,
        /// Resource hint as JSON, e.g. '{"machine": {"ram": 16000}}'. Repeatable.
        #[arg(long = "hint")]
        hints: Vec<String>,
    },
    /// Destroy a node by name or id
    Destroy {
        #[arg(long)]
        node_type: String,
        name_or_id: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,nodepool=debug")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = NodepoolConfig::from_file(&cli.config)?;
    debug!(config = %cli.config.display(), "loaded configuration");

    match cli.command {
        Commands::Status { names } => commands::lock::status(&config, &names).await,
        Commands::List {
            locked,
            unlocked,
            machine_type,
            owner,
            by_name,
        } => {
            let filter = commands::lock::ListFilter {
                locked: match (locked, unlocked) {
                    (true, _) => Some(true),
                    (_, true) => Some(false),
                    _ => None,
                },
                machine_type,
                owner,
            };
            commands::lock::list(&config, &filter, by_name).await
        }
        Commands::IsVm { name } => commands::lock::is_vm(&config, &name).await,
        Commands::Stale { owner } => commands::lock::stale(&config, owner.as_deref()).await,
        Commands::Types => commands::provision::types(&config),
        Commands::Create {
            node_type,
            num,
            os_type,
            os_version,
            arch,
            hints,
        } => {
            commands::provision::create(&config, &node_type, num, os_type, os_version, arch, &hints)
                .await
        }
        Commands::Destroy {
            node_type,
            name_or_id,
        } => commands::provision::destroy(&config, &node_type, &name_or_id).await,
    }
}
