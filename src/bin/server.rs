//! capability-runtime HTTP server binary.
//!
//! Registers the built-in capabilities, starts the maintenance sweep and
//! serves the admin/execution API.
//!
//! # Environment Variables
//!
//! - `PORT` - HTTP port (default: 8080)
//! - `CAPRT_CONFIG` - Path to a YAML [`RuntimeConfig`] file (optional)
//! - `CAPRT_*` - Individual config overrides, applied after the file
//! - `RUST_LOG` - Tracing filter (default: "info,capability_runtime=debug")
//!
//! # Usage
//!
//! ```bash
//! CAPRT_CACHE_TTL_SECS=600 cargo run --bin server
//! ```

use std::sync::Arc;

use anyhow::Context;
use capability_runtime::builtin::register_builtins;
use capability_runtime::config::RuntimeConfig;
use capability_runtime::runtime::RuntimeContext;
use capability_runtime::server::{app_router, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,capability_runtime=debug".into()),
        )
        .init();

    let config = match std::env::var("CAPRT_CONFIG") {
        Ok(path) => RuntimeConfig::from_yaml_file(&path)
            .with_context(|| format!("loading config from {}", path))?,
        Err(_) => RuntimeConfig::default(),
    }
    .apply_env()
    .context("applying CAPRT_* overrides")?;
    tracing::debug!(?config, "Runtime configuration");

    let runtime = Arc::new(RuntimeContext::new(config));
    let report = register_builtins(runtime.registry()).await;
    for (name, error) in &report.failed {
        tracing::warn!("Built-in capability {} not registered: {}", name, error);
    }
    runtime.start_maintenance();

    let port = std::env::var("PORT").unwrap_or_else(|_| "8080".to_string());
    let bind_addr = format!("0.0.0.0:{}", port);
    let app = app_router(AppState::new(Arc::clone(&runtime)));

    tracing::info!(
        "capability-runtime {} starting on {} with {} capabilities",
        capability_runtime::VERSION,
        bind_addr,
        runtime.registry().len()
    );

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("binding {}", bind_addr))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server failed")?;

    runtime.stop_maintenance();
    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
