mod logging;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dexops_core::{BatchRange, TopQuery};
use dexops_storage::{Session, Store};
use dexops_sync::{ServiceConfig, SyncEngine};
use serde::Serialize;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "dexops")]
#[command(about = "PokeDex-Ops: mirror upstream Pokemon records and query them")]
struct Cli {
    /// YAML config file; falls back to DEXOPS_CONFIG.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the HTTP service.
    Serve,
    /// Apply pending migrations.
    Migrate,
    /// Sync a single id from the catalog.
    Sync { id: i64 },
    /// Sync every id in an inclusive range.
    SyncBatch {
        #[arg(long)]
        start: i64,
        #[arg(long)]
        end: i64,
    },
    /// Rank stored Pokemon by one base stat.
    Top {
        #[arg(long)]
        stat: String,
        #[arg(long)]
        limit: Option<i64>,
    },
    /// Count stored Pokemon per type.
    Types,
    /// Row counts per table.
    Stats,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = ServiceConfig::load(cli.config.as_deref())?;
    logging::init_logging(&config)?;

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => dexops_web::serve(&config).await?,
        Commands::Migrate => {
            let store = open_store(&config).await?;
            store.close().await;
            info!(database_url = %config.database_url, "migrations applied");
        }
        Commands::Sync { id } => {
            let store = open_store(&config).await?;
            let engine = SyncEngine::from_config(&config)?;
            let mut session = store.session().await?;
            let outcome = engine.sync_one(&mut session, id).await?;
            print_json(&outcome)?;
            finish(store, session).await;
        }
        Commands::SyncBatch { start, end } => {
            let range = BatchRange::new(start, end)?;
            let store = open_store(&config).await?;
            let engine = SyncEngine::from_config(&config)?;
            let mut session = store.session().await?;
            let report = engine.sync_batch(&mut session, range).await;
            print_json(&report)?;
            finish(store, session).await;
        }
        Commands::Top { stat, limit } => {
            let query = TopQuery::parse(&stat, limit)?;
            let store = open_store(&config).await?;
            let mut session = store.session().await?;
            print_json(&session.top_by_stat(&query).await?)?;
            finish(store, session).await;
        }
        Commands::Types => {
            let store = open_store(&config).await?;
            let mut session = store.session().await?;
            print_json(&session.type_distribution().await?)?;
            finish(store, session).await;
        }
        Commands::Stats => {
            let store = open_store(&config).await?;
            let mut session = store.session().await?;
            print_json(&session.counts().await?)?;
            finish(store, session).await;
        }
    }

    Ok(())
}

async fn open_store(config: &ServiceConfig) -> Result<Store> {
    let store = Store::open(&config.store_config())
        .await
        .with_context(|| format!("opening {}", config.database_url))?;
    store.migrate().await.context("applying migrations")?;
    Ok(store)
}

async fn finish(store: Store, session: Session) {
    drop(session);
    store.close().await;
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
