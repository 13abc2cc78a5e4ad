use anyhow::Result;
use clap::{Parser, Subcommand};
use quill_sync::{run_migrations, run_sync_once, SyncConfig, SyncOptions};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "quill")]
#[command(about = "Quill content sync and serving CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Sync content from the external source into the database.
    Sync {
        /// Target the local development database instead of the remote one.
        #[arg(long)]
        local: bool,
        /// Override the source database id from the environment.
        #[arg(long)]
        database_id: Option<String>,
        /// Resume the source listing from an explicit pagination cursor.
        #[arg(long)]
        start_cursor: Option<String>,
        /// Insert records missing from the destination instead of upserting
        /// everything.
        #[arg(long)]
        missing_only: bool,
    },
    /// Serve the read API.
    Serve,
    /// Apply database migrations.
    Migrate {
        /// Target the local development database instead of the remote one.
        #[arg(long)]
        local: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Sync {
            local,
            database_id,
            start_cursor,
            missing_only,
        } => {
            let mut config = SyncConfig::from_env(local)?;
            if let Some(database_id) = database_id {
                config.notion_database_id = database_id;
            }
            let options = SyncOptions {
                start_cursor,
                missing_only,
            };
            let summary = run_sync_once(&config, &options).await?;
            println!(
                "sync complete: run_id={} fetched={} {}",
                summary.run_id,
                summary.fetched,
                summary.counts_line()
            );
        }
        Commands::Serve => {
            quill_web::serve_from_env().await?;
        }
        Commands::Migrate { local } => {
            let database_url = SyncConfig::database_url_from_env(local)?;
            run_migrations(&database_url).await?;
            println!("migrations applied");
        }
    }

    Ok(())
}
