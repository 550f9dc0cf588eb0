// src/main.rs

use anyhow::Context;
use chat_app::{
    ChatState,
    config::{ConfigSource, LoggingSettings, Settings, StorageBackend},
    database::{ChatStore, PgStore},
    memory::MemoryStore,
};
use clap::Parser;
use std::{path::PathBuf, sync::Arc};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "chat_app", about = "WebSocket chat server")]
struct Args {
    /// JSON settings file. Missing files fall back to defaults.
    #[arg(long, env = "CHAT_CONFIG")]
    config: Option<PathBuf>,
}

/// The main entry point for our application.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let (settings, source) =
        Settings::load(args.config.as_deref()).context("failed to load settings")?;
    init_tracing(&settings.logging);
    match &source {
        ConfigSource::Defaults => tracing::info!("no config file given, using defaults"),
        ConfigSource::File(path) => tracing::info!(path = %path.display(), "loaded config file"),
        ConfigSource::MissingFile(path) => {
            tracing::info!(path = %path.display(), "config file not found, using defaults")
        }
    }

    let store: Arc<dyn ChatStore> = match settings.database.backend {
        StorageBackend::Postgres => Arc::new(
            PgStore::connect(&settings.database)
                .await
                .context("failed to connect to PostgreSQL")?,
        ),
        StorageBackend::Memory => {
            tracing::warn!("using in-memory storage, nothing will be persisted across restarts");
            Arc::new(MemoryStore::new())
        }
    };

    let state = ChatState::new(store, settings.websocket.clone());
    let app = chat_app::router(state);

    let addr = settings.listen_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(%addr, "WebSocket server listening on ws://{addr}/ws");

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    tracing::info!("server stopped");
    Ok(())
}

/// `RUST_LOG` takes precedence over the configured filter.
fn init_tracing(logging: &LoggingSettings) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.filter));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
    }
}
