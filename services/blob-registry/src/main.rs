//! Blob registry server binary.

use std::net::SocketAddr;

use blob_registry::{RegistryBuilder, RegistryConfig};
use camino::Utf8PathBuf;
use clap::Parser;
use eyre::WrapErr as _;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Serve the blob registry API.
#[derive(Parser, Debug)]
#[command(name = "registry-server", version, about, long_about = None)]
struct Args {
    /// Path to a TOML configuration file. Defaults apply when omitted.
    #[arg(short, long, env = "REGISTRY_CONFIG")]
    config: Option<Utf8PathBuf>,

    /// Address to listen on
    #[arg(short, long, env = "REGISTRY_LISTEN", default_value = "127.0.0.1:5000")]
    listen: SocketAddr,

    /// Log as JSON lines
    #[arg(long)]
    json: bool,
}

async fn load_config(path: Option<&Utf8PathBuf>) -> eyre::Result<RegistryConfig> {
    let Some(path) = path else {
        return Ok(RegistryConfig::default());
    };

    let text = tokio::fs::read_to_string(path)
        .await
        .wrap_err_with(|| format!("reading {path}"))?;
    toml_edit::de::from_str(&text).wrap_err_with(|| format!("parsing {path}"))
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    let args = Args::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,blob_registry=debug".into());
    if args.json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    let config = load_config(args.config.as_ref()).await?;
    tracing::debug!(?config, "loaded configuration");

    let registry = RegistryBuilder::from_config(&config)
        .wrap_err("configuring storage")?
        .registry();

    let reclaimed = registry
        .uploads()
        .reclaim_orphans()
        .await
        .wrap_err("reclaiming orphaned uploads")?;
    tracing::info!(reclaimed, "startup cleanup finished");

    let reaper = registry
        .uploads()
        .spawn_reaper(config.sweep_interval(), config.session_max_age());

    let listener = tokio::net::TcpListener::bind(args.listen)
        .await
        .wrap_err_with(|| format!("binding {}", args.listen))?;
    tracing::info!("Blob registry listening on http://{}", args.listen);

    let served = axum::serve(listener, registry.router())
        .with_graceful_shutdown(async {
            if let Err(error) = tokio::signal::ctrl_c().await {
                tracing::error!(%error, "unable to listen for shutdown signal");
            }
        })
        .await;

    reaper.abort();
    served.wrap_err("serving")
}
