use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::watch;

use feedhub::api;
use feedhub::config::Config;
use feedhub::feed::FeedFetcher;
use feedhub::pipeline::{Scheduler, Worker};
use feedhub::storage::Database;

#[derive(Parser, Debug)]
#[command(name = "feedhub", about = "RSS/Atom feed aggregation backend")]
struct Cli {
    /// Path to the configuration file (optional; defaults apply if missing)
    #[arg(long, value_name = "FILE", default_value = "config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the HTTP API
    Api,
    /// Run the scheduler loop (promotes stale completed jobs)
    Scheduler,
    /// Run the worker loop (claims, fetches and commits refresh jobs)
    Worker,
    /// Create or migrate the database, then exit
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::load(&cli.config).context("Failed to load configuration")?;

    let db = Database::open(&config.database_path)
        .await
        .with_context(|| format!("Failed to open database at {}", config.database_path))?;

    if let Command::Migrate = cli.command {
        println!("Database ready at {}", config.database_path);
        return Ok(());
    }

    // ctrl-c flips the watch; each loop finishes its in-flight tick and exits
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to listen for shutdown signal");
            return;
        }
        tracing::info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    match cli.command {
        Command::Api => {
            api::serve(db, &config.api.listen_addr, shutdown_rx).await?;
        }
        Command::Scheduler => {
            Scheduler::new(db, &config.scheduler, &config.refresh)
                .run(shutdown_rx)
                .await;
        }
        Command::Worker => {
            let fetcher = FeedFetcher::new(
                Duration::from_secs(config.refresh.fetch_timeout_s),
                config.refresh.max_feed_size_b,
            )
            .context("Failed to build HTTP client")?;
            Worker::new(db, fetcher, &config.worker, &config.refresh)
                .run(shutdown_rx)
                .await;
        }
        Command::Migrate => unreachable!(),
    }

    Ok(())
}
