mod app;
mod bootstrap;
mod chat;
mod health;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use returndesk_agent::AgentRuntime;
use returndesk_core::config::{AppConfig, LoadOptions};
use tracing_subscriber::EnvFilter;

use crate::chat::ChatState;
use crate::health::HealthState;

const SWEEP_INTERVAL_CAP: Duration = Duration::from_secs(60);

fn init_logging(config: &AppConfig) {
    use returndesk_core::config::LogFormat::*;

    let filter = EnvFilter::try_new(&config.logging.level).unwrap_or_else(|_| EnvFilter::new("info"));

    match config.logging.format {
        Compact => {
            tracing_subscriber::fmt().with_target(false).with_env_filter(filter).compact().init();
        }
        Pretty => {
            tracing_subscriber::fmt().with_target(false).with_env_filter(filter).pretty().init();
        }
        Json => {
            tracing_subscriber::fmt().with_target(false).with_env_filter(filter).json().init();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    run().await
}

pub async fn run() -> Result<()> {
    // logging has to exist before bootstrap emits its events
    let config = AppConfig::load(LoadOptions::default())?;
    init_logging(&config);

    let app = bootstrap::bootstrap_with_config(config).await?;
    let config = &app.config;

    let sweeper = spawn_idle_sweeper(Arc::clone(&app.runtime), config.sessions.idle_ttl_secs);

    let routes = app::router(
        ChatState { runtime: Arc::clone(&app.runtime) },
        HealthState { db_pool: app.db_pool.clone(), policy: app.policy.clone() },
        &config.server.allowed_origins,
    );
    let address = format!("{}:{}", config.server.bind_address, config.server.port);
    let listener = tokio::net::TcpListener::bind(&address).await?;
    tracing::info!(
        event_name = "system.server.started",
        correlation_id = "bootstrap",
        bind_address = %address,
        "returndesk-server listening"
    );

    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let server = tokio::spawn(async move {
        axum::serve(listener, routes)
            .with_graceful_shutdown(async {
                let _ = stop_rx.await;
            })
            .await
    });

    wait_for_shutdown().await?;
    tracing::info!(
        event_name = "system.server.stopping",
        correlation_id = "shutdown",
        grace_secs = config.server.graceful_shutdown_secs,
        "returndesk-server stopping"
    );
    let _ = stop_tx.send(());
    if let Some(sweeper) = sweeper {
        sweeper.abort();
    }

    match tokio::time::timeout(Duration::from_secs(config.server.graceful_shutdown_secs), server).await {
        Ok(joined) => joined??,
        Err(_) => tracing::warn!(
            event_name = "system.server.shutdown_timeout",
            correlation_id = "shutdown",
            "in-flight requests did not finish within the grace period"
        ),
    }

    app.db_pool.close().await;
    Ok(())
}

/// Periodically evicts threads idle for longer than `idle_ttl_secs`. Zero disables it.
fn spawn_idle_sweeper(
    runtime: Arc<AgentRuntime>,
    idle_ttl_secs: u64,
) -> Option<tokio::task::JoinHandle<()>> {
    if idle_ttl_secs == 0 {
        return None;
    }
    let idle_for = Duration::from_secs(idle_ttl_secs);
    let period = idle_for.min(SWEEP_INTERVAL_CAP);

    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match runtime.evict_idle_threads(idle_for).await {
                Ok(0) => {}
                Ok(evicted) => tracing::info!(
                    event_name = "system.sessions.evicted",
                    correlation_id = "sweeper",
                    evicted,
                    "idle conversation threads evicted"
                ),
                Err(error) => tracing::warn!(
                    event_name = "system.sessions.sweep_failed",
                    correlation_id = "sweeper",
                    error = %error,
                    "idle thread sweep failed"
                ),
            }
        }
    }))
}

async fn wait_for_shutdown() -> Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}
