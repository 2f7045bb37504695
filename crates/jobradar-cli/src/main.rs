use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "jobradar")]
#[command(about = "Job Radar command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one ingestion pass and print its summary.
    Sync,
    /// Apply database migrations.
    Migrate,
    /// Serve the web API, plus the recurring scheduler when enabled.
    Serve,
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let pipeline = jobradar_sync::pipeline_from_env().await?;
            let summary = pipeline.run_once().await?;
            println!(
                "sync complete: run_id={} sources_ok={}/{} unique={} inserted={} updated={}",
                summary.run_id,
                summary.sources_attempted - summary.sources_failed,
                summary.sources_attempted,
                summary.records_unique,
                summary.inserted,
                summary.updated,
            );
        }
        Commands::Migrate => {
            let config = jobradar_sync::SyncConfig::from_env();
            let store = jobradar_storage::PgJobStore::connect(&config.database_url).await?;
            store.migrate().await?;
            println!("migrations applied");
        }
        Commands::Serve => {
            let pipeline = jobradar_sync::pipeline_from_env().await?;
            // warm the read view from whatever earlier runs persisted
            if let Err(err) = pipeline.cache().refresh(pipeline.store().as_ref()).await {
                tracing::warn!(error = %err, "serving with an empty cache until the first run");
            }
            let config = pipeline.config().clone();
            if config.scheduler_enabled {
                let scheduler =
                    jobradar_sync::build_scheduler(pipeline.clone(), &config.sync_cron).await?;
                scheduler.start().await.context("starting scheduler")?;
            }
            jobradar_web::serve(pipeline, config.web_port).await?;
        }
    }

    Ok(())
}
