use anyhow::Result;
use conclave_server::engine::LocalEngine;
use conclave_server::state::{Config, LogFormat};
use std::future::IntoFuture;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load()?;

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "conclave_server=debug,tower_http=debug".into());
    let registry = tracing_subscriber::registry().with(filter);
    match config.log_format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).init(),
    }

    tracing::info!("Starting Conclave signaling server...");

    let engine = Arc::new(LocalEngine::new(config.engine_settings()));
    let (app, state) = conclave_server::create_app(config.clone(), engine);
    let engine_events = state.coordinator.spawn_engine_events();

    // Start the server
    let listener = tokio::net::TcpListener::bind(&config.bind_address).await?;
    tracing::info!("Listening on {}", config.bind_address);

    tokio::select! {
        result = axum::serve(listener, app).into_future() => {
            result?;
        }
        failure = engine_events => {
            let reason = match failure {
                Ok(failure) => failure.reason,
                Err(e) => format!("engine event task failed: {}", e),
            };
            let delay = config.worker_exit_delay();
            tracing::error!(%reason, ?delay, "Media engine died, exiting");
            tokio::time::sleep(delay).await;
            std::process::exit(1);
        }
    }

    Ok(())
}
