use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ors_drive::{DriveClient, DriveConfig};
use ors_mongo::MongoOrderStore;
use ors_sync::{SyncConfig, SyncPipeline};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "ors")]
#[command(about = "Sync per-account order reports into Drive-hosted workbooks")]
struct Cli {
    /// Path to a .env file to load before reading configuration.
    #[arg(long, global = true)]
    env_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Full build on first run (no remote report), incremental otherwise.
    Sync {
        /// Account id to process; defaults to ACCOUNT_IDS from the environment.
        #[arg(long)]
        account_id: Option<String>,

        #[arg(long)]
        output_dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("ERROR: {err:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    if let Some(env_file) = &cli.env_file {
        dotenvy::from_path(env_file)
            .with_context(|| format!("loading {}", env_file.display()))?;
    } else {
        let _ = dotenvy::dotenv();
    }
    init_tracing();

    match cli.command.unwrap_or(Commands::Sync {
        account_id: None,
        output_dir: None,
    }) {
        Commands::Sync {
            account_id,
            output_dir,
        } => {
            let mut config = SyncConfig::from_env();
            if let Some(account_id) = account_id {
                config.account_ids = vec![account_id];
            }
            if let Some(output_dir) = output_dir {
                config.output_dir = output_dir;
            }
            anyhow::ensure!(
                !config.account_ids.is_empty(),
                "provide --account-id or set ACCOUNT_IDS in the environment"
            );
            let mongo_uri = config
                .mongo_uri
                .clone()
                .context("MONGO_URI must be set in the environment")?;
            let client_email = config
                .drive_client_email
                .clone()
                .context("GOOGLE_CLIENT_EMAIL must be set in the environment")?;
            let private_key = config
                .drive_private_key
                .clone()
                .context("GOOGLE_PRIVATE_KEY must be set in the environment")?;
            anyhow::ensure!(
                config.drive_folder_id.is_some(),
                "GOOGLE_DRIVE_FOLDER_ID must be set in the environment"
            );

            let store = MongoOrderStore::connect(&mongo_uri)
                .await
                .context("connecting to the order store")?;
            let drive = DriveClient::new(DriveConfig {
                client_email,
                private_key,
            })
            .context("initializing the drive client")?;

            let pipeline = SyncPipeline::new(config, Arc::new(store), Arc::new(drive))?;
            let summary = pipeline.run().await?;
            println!(
                "sync complete: run_id={} accounts={} failed={} created={} updated={}",
                summary.run_id,
                summary.accounts_processed,
                summary.accounts_failed,
                summary.rows_created,
                summary.rows_updated
            );
        }
    }

    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
