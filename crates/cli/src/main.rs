//! VNF Operator CLI
//!
//! A command-line tool for declaring VNFs, inspecting their lifecycle
//! state and checking the health of the VNF lifecycle operator.

mod client;
mod commands;
mod config;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};
use commands::{operator, vnfs};
use std::path::PathBuf;

/// VNF Operator CLI
#[derive(Parser)]
#[command(name = "vnfctl")]
#[command(author, version, about = "CLI for the VNF lifecycle operator", long_about = None)]
pub struct Cli {
    /// API endpoint URL (can also be set via VNFCTL_API_URL env var)
    #[arg(long, env = "VNFCTL_API_URL", global = true)]
    pub api_url: Option<String>,

    /// Namespace for VNFs named without one
    #[arg(long, short, global = true)]
    pub namespace: Option<String>,

    /// Output format
    #[arg(long, short, global = true)]
    pub format: Option<output::OutputFormat>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List declared VNFs and their lifecycle phase
    List {
        /// Show every namespace, ignoring --namespace
        #[arg(long, short = 'A')]
        all_namespaces: bool,
    },

    /// Show one VNF (format: namespace/name or just name)
    Get {
        vnf: String,
    },

    /// Show the lifecycle events recorded for a VNF
    Events {
        vnf: String,

        /// Number of most recent events to show
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// Create or update a VNF from a JSON spec file
    Apply {
        vnf: String,

        /// Path to the spec file
        #[arg(long, short = 'F')]
        file: PathBuf,
    },

    /// Request deletion of a VNF
    Delete {
        vnf: String,
    },

    /// Show operator component health
    Health,

    /// Save CLI defaults to ~/.config/vnfctl/config.json
    Config {
        #[arg(long)]
        set_api_url: Option<String>,

        #[arg(long)]
        set_namespace: Option<String>,

        #[arg(long)]
        set_format: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        output::print_error(&format!("{:#}", e));
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = config::Config::load()?;
    let format = config.format(cli.format)?;
    let namespace = config.namespace(cli.namespace.as_deref());
    let api_url = config.api_url(cli.api_url.as_deref());

    let connect = || client::ApiClient::new(&api_url);
    let parse = |vnf: &str| client::VnfRef::parse(vnf, &namespace);

    match cli.command {
        Commands::List { all_namespaces } => {
            // Without an explicit namespace, list everything
            let filter = match (all_namespaces, cli.namespace) {
                (false, Some(ns)) => Some(ns),
                _ => None,
            };
            vnfs::list(&connect()?, filter, format).await?;
        }
        Commands::Get { vnf } => {
            vnfs::get(&connect()?, &parse(&vnf)?, format).await?;
        }
        Commands::Events { vnf, limit } => {
            vnfs::events(&connect()?, &parse(&vnf)?, limit, format).await?;
        }
        Commands::Apply { vnf, file } => {
            vnfs::apply(&connect()?, &parse(&vnf)?, &file, format).await?;
        }
        Commands::Delete { vnf } => {
            vnfs::delete(&connect()?, &parse(&vnf)?).await?;
        }
        Commands::Health => {
            operator::health(&connect()?, format).await?;
        }
        Commands::Config {
            set_api_url,
            set_namespace,
            set_format,
        } => {
            operator::set_config(set_api_url, set_namespace, set_format)?;
        }
    }

    Ok(())
}
