use std::path::PathBuf;
use std::sync::Arc;

use almanac_storage::{connect_pool, ArticleStore, MemoryArticleStore, PgArticleStore};
use almanac_sync::{
    build_ingest_scheduler, http_pipeline, IngestPipeline, ReplayFeedFetcher, RunOutcome, SyncConfig,
};
use almanac_web::AppState;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "almanac")]
#[command(about = "Scheduled news feed ingestion")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the HTTP API and the periodic collector.
    Serve {
        /// Keep articles in memory instead of Postgres.
        #[arg(long)]
        ephemeral: bool,
    },
    /// Run one collection and exit.
    Sync {
        /// Feed a saved response through the pipeline instead of calling upstream.
        #[arg(long, value_name = "FILE")]
        replay: Option<PathBuf>,
        #[arg(long)]
        ephemeral: bool,
    },
    /// Apply database migrations.
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env()?;

    match cli.command.unwrap_or(Commands::Serve { ephemeral: false }) {
        Commands::Serve { ephemeral } => serve(config, ephemeral).await?,
        Commands::Sync { replay, ephemeral } => {
            let store = open_store(&config, ephemeral).await?;
            let pipeline = match replay {
                Some(path) => IngestPipeline::new(
                    Arc::new(ReplayFeedFetcher::from_path(&path).await?),
                    store,
                    config.timezone,
                ),
                None => http_pipeline(&config, store).await?,
            };
            match pipeline.run_once().await? {
                RunOutcome::Completed(summary) => println!(
                    "sync complete: run_id={} fetched={} skipped={} duplicates={} already_stored={} inserted={}",
                    summary.run_id,
                    summary.fetched,
                    summary.skipped,
                    summary.duplicates,
                    summary.already_stored,
                    summary.inserted
                ),
                RunOutcome::Skipped => println!("sync skipped: another run is in flight"),
            }
        }
        Commands::Migrate => {
            let store = PgArticleStore::new(
                connect_pool(&config.database_url, config.db_max_connections)
                    .await
                    .context("connecting to database")?,
            );
            store.migrate().await.context("running migrations")?;
            println!("migrations applied");
        }
    }

    Ok(())
}

async fn open_store(config: &SyncConfig, ephemeral: bool) -> Result<Arc<dyn ArticleStore>> {
    if ephemeral {
        warn!("using in-memory article store; nothing survives a restart");
        return Ok(Arc::new(MemoryArticleStore::new()));
    }
    let pool = connect_pool(&config.database_url, config.db_max_connections)
        .await
        .context("connecting to database")?;
    let store = PgArticleStore::new(pool);
    store.migrate().await.context("running migrations")?;
    Ok(Arc::new(store))
}

async fn serve(config: SyncConfig, ephemeral: bool) -> Result<()> {
    let store = open_store(&config, ephemeral).await?;
    let pipeline = Arc::new(http_pipeline(&config, store).await?);

    let mut scheduler = build_ingest_scheduler(Arc::clone(&pipeline), &config)
        .await
        .context("building scheduler")?;
    if let Some(sched) = &scheduler {
        sched.start().await.context("starting scheduler")?;
    }

    let listener = TcpListener::bind(("0.0.0.0", config.listen_port))
        .await
        .with_context(|| format!("binding port {}", config.listen_port))?;
    almanac_web::serve(listener, AppState::new(pipeline), shutdown_signal()).await?;

    if let Some(sched) = scheduler.as_mut() {
        sched.shutdown().await.context("stopping scheduler")?;
    }
    info!("almanac stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!("listening for ctrl-c failed: {err}");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}
