use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use devsnap::config::AppConfig;
use devsnap::core::{DedupIndex, Digest, GlobProbe, SqliteDedupIndex, Supervisor};
use devsnap::{adapters, context::AppContext, db, logging};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::info;

#[derive(Parser)]
#[command(name = "devsnap")]
#[command(about = "Unattended backup of removable storage devices", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (default /etc/devsnap/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Watch for devices and back them up as they are attached
    Daemon(DaemonArgs),
    /// Print the resolved configuration
    ShowConfig,
    /// Find the stored copy of a file by its SHA-512 digest
    Lookup { digest: String },
}

#[derive(Args, Serialize)]
struct DaemonArgs {
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    backup_directory: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    mount_directory: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    verbose: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    debug: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    simulation: Option<bool>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_file = cli.config.as_deref();

    let config = match &cli.command {
        Commands::Daemon(args) => AppConfig::load(config_file, Some(args))?,
        _ => AppConfig::load(config_file, None::<&DaemonArgs>)?,
    };

    logging::init(logging::LogConfig::from(&config));

    match cli.command {
        Commands::Daemon(_) => run_daemon(config).await.context("Daemon failed")?,
        Commands::ShowConfig => {
            let rendered = toml::to_string_pretty(&config).context("Failed to render config")?;
            print!("{}", rendered);
        }
        Commands::Lookup { digest } => run_lookup(config, &digest).await?,
    }

    Ok(())
}

async fn run_daemon(config: AppConfig) -> Result<()> {
    // Without these the daemon cannot do anything useful
    std::fs::create_dir_all(&config.backup_directory).with_context(|| {
        format!(
            "Failed to create backup directory {}",
            config.backup_directory.display()
        )
    })?;
    std::fs::create_dir_all(&config.mount_directory).with_context(|| {
        format!(
            "Failed to create mount directory {}",
            config.mount_directory.display()
        )
    })?;

    let conn = db::init(&config.database_path()).await?;
    let index = Arc::new(SqliteDedupIndex::new(conn));
    let fs = adapters::get_fs_ops(config.simulation);
    let probe = Box::new(GlobProbe::new(config.device_patterns.clone()));

    if config.simulation {
        info!("Simulation mode: device patterns name plain directories");
    }

    let ctx = AppContext::new(config, fs, index);
    let supervisor = Supervisor::new(ctx, probe);

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received");
            let _ = shutdown_tx.send(());
        }
    });

    supervisor.run(shutdown_rx).await;
    Ok(())
}

async fn run_lookup(config: AppConfig, digest: &str) -> Result<()> {
    let digest = Digest::from_hex(digest.trim())
        .with_context(|| format!("Not a SHA-512 hex digest: {}", digest))?;

    let conn = db::init(&config.database_path()).await?;
    let index = SqliteDedupIndex::new(conn);

    let found = tokio::task::spawn_blocking(move || index.lookup(&digest))
        .await
        .context("Lookup task failed")??;

    match found {
        Some(path) => println!("{}", path.display()),
        None => println!("No stored copy of {}", digest),
    }
    Ok(())
}
