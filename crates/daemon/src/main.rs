//! Block cache daemon binary.

use anyhow::{Context, Result};
use bcv_core::DaemonConfig;
use bcv_daemon::{Engine, daemon};
use bcv_storage::StorageOpener;
use clap::Parser;
use figment::Figment;
use figment::providers::{Env, Format, Toml};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// bcvd - shared block cache for cloud-backed databases
#[derive(Parser, Debug)]
#[command(name = "bcvd")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, env = "BCV_CONFIG", default_value = "config/bcvd.toml")]
    config: String,

    /// Override the cache directory
    #[arg(short, long)]
    directory: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("bcvd v{}", env!("CARGO_PKG_VERSION"));

    // Defaults apply to anything neither the file nor the environment sets.
    let mut figment = Figment::from(figment::providers::Serialized::defaults(
        DaemonConfig::default(),
    ));
    if std::path::Path::new(&args.config).exists() {
        tracing::info!(config_path = %args.config, "Loading configuration from file");
        figment = figment.merge(Toml::file(&args.config));
    } else {
        tracing::debug!("No config file found at {}", args.config);
    }
    let mut config: DaemonConfig = figment
        .merge(Env::prefixed("BCV_").split("__"))
        .extract()
        .context("failed to load configuration")?;
    if let Some(directory) = args.directory {
        config.directory = directory;
    }
    config
        .validate()
        .map_err(|e| anyhow::anyhow!(e))
        .context("invalid configuration")?;

    let listener = TcpListener::bind(&config.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.bind))?;
    let engine = Engine::open(config, StorageOpener::new(), None)
        .await
        .context("failed to open cache directory")?;
    tracing::info!(
        cache_file = %engine.cache_file_path().display(),
        slots = engine.cache().n_slots(),
        "Cache opened"
    );
    tracing::info!("Listening on {}", listener.local_addr()?);

    let (shutdown, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("Shutting down");
                let _ = shutdown.send(true);
            }
            Err(e) => {
                tracing::warn!(error = %e, "cannot listen for ctrl-c");
                std::future::pending::<()>().await;
            }
        }
    });

    daemon::run(engine, listener, shutdown_rx)
        .await
        .context("daemon failed")?;
    Ok(())
}
