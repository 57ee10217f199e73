//! remedy - maintenance CLI for the remediation pipeline
//!
//! Inspects and cleans the coordination store behind a running
//! coordinator: cooldown records and alert dedup markers.

mod commands;
mod config;
mod output;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use commands::{cooldown, keys, keys::NamespaceScope};
use output::OutputFormat;
use remedy_lib::coordinator::RemoteCoordinator;

/// Remediation pipeline maintenance CLI
#[derive(Debug, Parser)]
#[command(name = "remedy")]
#[command(author, version, about = "Maintenance CLI for the remediation pipeline", long_about = None)]
pub struct Cli {
    /// Coordinator URL (can also be set via REMEDY_COORDINATOR_URL env var)
    #[arg(long, env = "REMEDY_COORDINATOR_URL")]
    pub coordinator_url: Option<String>,

    /// Output format
    #[arg(long, short)]
    pub format: Option<OutputFormat>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Inspect or clean namespaced store keys
    #[command(subcommand)]
    Keys(KeysCommands),

    /// Show remediation state of targets
    #[command(subcommand)]
    Cooldown(CooldownCommands),

    /// Check that the coordinator is reachable
    Status,
}

#[derive(Debug, Subcommand)]
pub enum KeysCommands {
    /// List live keys
    List {
        /// Namespace to list
        #[arg(long, short, value_enum, default_value_t = NamespaceScope::All)]
        namespace: NamespaceScope,
    },

    /// Delete live keys
    Purge {
        /// Namespace to purge
        #[arg(long, short, value_enum, default_value_t = NamespaceScope::All)]
        namespace: NamespaceScope,

        /// List the keys that would be deleted without deleting them
        #[arg(long)]
        dry_run: bool,
    },
}

#[derive(Debug, Subcommand)]
pub enum CooldownCommands {
    /// Show the phase of one target
    Show {
        /// Target identifier
        target_id: String,
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
    let file_config = config::Config::load()?;
    let format = match cli.format {
        Some(format) => format,
        None => file_config
            .default_format
            .as_deref()
            .and_then(|raw| OutputFormat::from_str(raw, true).ok())
            .unwrap_or_default(),
    };
    let coordinator_url = file_config.coordinator_url(cli.coordinator_url);

    let coordinator = RemoteCoordinator::new(&coordinator_url)
        .with_context(|| format!("Invalid coordinator URL {}", coordinator_url))?;

    match cli.command {
        Commands::Keys(keys_cmd) => match keys_cmd {
            KeysCommands::List { namespace } => {
                keys::list_keys(&coordinator, namespace, format).await?;
            }
            KeysCommands::Purge { namespace, dry_run } => {
                keys::purge_keys(&coordinator, namespace, dry_run, format).await?;
            }
        },
        Commands::Cooldown(cooldown_cmd) => match cooldown_cmd {
            CooldownCommands::Show { target_id } => {
                cooldown::show_cooldown(&coordinator, &target_id, format).await?;
            }
        },
        Commands::Status => {
            coordinator.health().await?;
            match format {
                OutputFormat::Json => output::print_json(&serde_json::json!({
                    "coordinator_url": coordinator_url,
                    "reachable": true,
                }))?,
                OutputFormat::Table => {
                    output::print_success(&format!("Coordinator {} is healthy", coordinator_url))
                }
            }
        }
    }

    Ok(())
}
