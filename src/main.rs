//! P2P backup node daemon
//!
//! Joins the DHT, answers family coordination packets for the customers
//! this node stores data for and runs the employer and blockchain loops
//! enabled in the configuration.

use clap::Parser;
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use p2p_backup_lib::{Config, CoreContext};

#[derive(Parser)]
#[command(name = "p2p-backup-node")]
#[command(about = "Supplier and customer node of the P2P backup network")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, env = "P2P_BACKUP_CONFIG", default_value = "p2p-backup.toml")]
    config: PathBuf,

    /// Data directory (overrides the config file)
    #[arg(short, long, env = "P2P_BACKUP_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// IDURL of this node (overrides the config file)
    #[arg(long, env = "P2P_BACKUP_IDURL")]
    idurl: Option<String>,
}

fn load_config(path: &Path) -> anyhow::Result<Config> {
    if path.exists() {
        return Ok(Config::load(path)?);
    }
    info!("Config file {} not found, using defaults", path.display());
    Ok(Config::default())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    let mut config = load_config(&cli.config)?;
    if let Some(data_dir) = cli.data_dir {
        config.node.data_dir = data_dir;
    }
    if let Some(idurl) = cli.idurl {
        config.node.idurl = idurl;
    }

    info!("Starting P2P backup node {}", config.node.idurl);
    info!("Data dir: {}", config.node.data_dir.display());

    let mut context = CoreContext::start(config).await?;
    context.spawn_services().await?;

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    context.shutdown().await;
    Ok(())
}
