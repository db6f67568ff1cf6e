//! `vidforged` — the vidforge server binary.
//!
//! Usage:
//!   vidforged -c <config-name-or-path> [--listen <addr>]
//!
//! The config name resolves to `/etc/vidforge/<name>.toml`.
//! If a path with `/` or `.` is given, it's used directly.

mod config;
mod routes;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::info;

use job::handlers::{FfmpegFrameExtractor, FrameExtractor};
use job::provider::{DemoProvider, VeoClient, VideoProvider};
use job::store::JobStore;
use job::JobModule;
use vidforge_core::Module;

use config::ServerConfig;
use routes::AppState;

/// Vidforge server.
#[derive(Parser, Debug)]
#[command(name = "vidforged", about = "Vidforge video job server")]
struct Cli {
    /// Config name or path to config file.
    #[arg(short = 'c', long = "config", required = true)]
    config: String,

    /// Listen address.
    #[arg(long = "listen", default_value = "0.0.0.0:8080")]
    listen: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();

    let config_path = ServerConfig::resolve_path(&cli.config);
    info!("Loading configuration from {}", config_path.display());
    let server_config = ServerConfig::load(&config_path)?;

    let data_dir = Path::new(&server_config.storage.data_dir);
    std::fs::create_dir_all(data_dir)?;

    let store = Arc::new(
        JobStore::open(&data_dir.join("jobs.sqlite"))
            .map_err(|e| anyhow::anyhow!("failed to open job store: {e}"))?,
    );

    let provider: Arc<dyn VideoProvider> = match server_config.provider.mode.as_str() {
        "veo" => {
            let api_key = std::env::var(&server_config.provider.api_key_env).map_err(|_| {
                anyhow::anyhow!(
                    "provider mode is \"veo\" but {} is not set",
                    server_config.provider.api_key_env
                )
            })?;
            info!(model = %server_config.provider.model, "using Veo provider");
            Arc::new(VeoClient::new(
                &server_config.provider.base_url,
                &server_config.provider.model,
                &api_key,
            ))
        }
        "demo" => {
            info!(
                delay_secs = server_config.provider.demo_delay_secs,
                "using demo provider"
            );
            Arc::new(DemoProvider::new(
                Duration::from_secs(server_config.provider.demo_delay_secs),
                "demo://generated.mp4",
            ))
        }
        other => anyhow::bail!("unknown provider mode {other:?} (expected \"veo\" or \"demo\")"),
    };

    let extractor: Arc<dyn FrameExtractor> =
        Arc::new(FfmpegFrameExtractor::new(&data_dir.join("frames")));

    let module = JobModule::new(store, provider, extractor, server_config.job_module_config())
        .map_err(|e| anyhow::anyhow!("failed to start job module: {e}"))?;
    info!("Job module initialized");

    let state = AppState { engine: Arc::clone(module.engine()) };
    let module_routes = vec![(module.name().to_string(), module.routes())];
    let app = routes::build_router(state, module_routes);

    let listener = tokio::net::TcpListener::bind(&cli.listen).await?;
    info!("vidforged listening on {}", cli.listen);
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await?;

    module.shutdown();
    Ok(())
}
