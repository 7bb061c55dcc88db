// ABOUTME: CLI entry point for seafarm-sync
// ABOUTME: Parses commands, resolves connection settings and routes to handlers

use anyhow::Context;
use clap::{Parser, Subcommand};
use seafarm_store::{MemoryStore, RemoteStore};
use seafarm_sync::channel::ChannelManager;
use seafarm_sync::commands;
use seafarm_sync::config::SyncConfig;
use seafarm_sync::mutation::MutationGateway;
use seafarm_sync::supabase::SupabaseStore;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "seafarm-sync")]
#[command(about = "Realtime table sync, retrying writes and presence for SeaFarm", long_about = None)]
#[command(version)]
struct Cli {
    /// Set the log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log: String,
    /// Path to config.toml (defaults to ~/.seafarm-sync/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Project base URL (falls back to SUPABASE_URL, the config file, then `project set`)
    #[arg(long, env = "SUPABASE_URL", global = true)]
    url: Option<String>,
    /// Anonymous API key (falls back to SUPABASE_ANON_KEY env)
    #[arg(long = "anon-key", env = "SUPABASE_ANON_KEY", hide_env_values = true, global = true)]
    anon_key: Option<String>,
    /// Use an empty in-process store instead of a project (for trying commands offline)
    #[arg(long, global = true, default_value_t = false)]
    memory: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Mirror tables locally and log every reconciled change until Ctrl-C
    Watch {
        /// Tables to follow (repeatable; defaults to `tables` in the config file)
        #[arg(long = "table")]
        tables: Vec<String>,
    },
    /// Insert a row, retrying transient failures
    Insert {
        #[arg(long)]
        table: String,
        /// Row as a JSON object
        #[arg(long)]
        json: String,
    },
    /// Update a row by id, retrying transient failures
    Update {
        #[arg(long)]
        table: String,
        #[arg(long)]
        id: String,
        /// Fields to change as a JSON object
        #[arg(long)]
        json: String,
    },
    /// Delete rows by id, retrying transient failures
    Delete {
        #[arg(long)]
        table: String,
        /// Row ids to delete (repeatable or comma-separated)
        #[arg(long = "id", value_delimiter = ',', required = true)]
        ids: Vec<String>,
    },
    /// Check that the project answers a one-row read
    Health,
    /// Join a presence channel and print peers until Ctrl-C
    Presence {
        #[arg(long)]
        channel: String,
        /// This peer's presence key
        #[arg(long)]
        key: String,
        /// Payload to track for this peer, as a JSON object
        #[arg(long)]
        json: Option<String>,
    },
    /// Manage the default project URL
    Project {
        #[command(flatten)]
        args: commands::project::ProjectArgs,
    },
}

fn connect(cli: &Cli, config: &SyncConfig) -> anyhow::Result<Arc<dyn RemoteStore>> {
    if cli.memory {
        tracing::info!("Using in-process memory store");
        return Ok(Arc::new(MemoryStore::new()));
    }
    let state = seafarm_sync::state::load()?;
    let settings = config.supabase_settings(
        cli.url.as_deref(),
        cli.anon_key.as_deref(),
        state.project_url.as_deref(),
    )?;
    tracing::info!("Connecting to {}", settings.project_url);
    let store = SupabaseStore::new(&settings).context("Failed to create store client")?;
    Ok(Arc::new(store))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // RUST_LOG wins over --log. Logs go to stderr so command output stays pipeable.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log.clone()));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    if let Commands::Project { args } = cli.command {
        return commands::project(args).await;
    }

    let config = SyncConfig::load(cli.config.as_deref())?;
    let store = connect(&cli, &config)?;

    match &cli.command {
        Commands::Watch { tables } => {
            let tables = if tables.is_empty() {
                config.tables.clone()
            } else {
                tables.clone()
            };
            commands::watch(ChannelManager::new(store), tables).await
        }
        Commands::Insert { table, json } => {
            let gateway = MutationGateway::new(store).with_policy(config.retry.policy());
            commands::insert(&gateway, table, json).await
        }
        Commands::Update { table, id, json } => {
            let gateway = MutationGateway::new(store).with_policy(config.retry.policy());
            commands::update(&gateway, table, id, json).await
        }
        Commands::Delete { table, ids } => {
            let gateway = MutationGateway::new(store).with_policy(config.retry.policy());
            commands::delete(&gateway, table, ids).await
        }
        Commands::Health => commands::health(store).await,
        Commands::Presence { channel, key, json } => {
            commands::presence(store, channel, key, json.as_deref()).await
        }
        Commands::Project { .. } => Ok(()),
    }
}
