mod api;
mod bootstrap;
mod health;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use pricewise_core::config::{AppConfig, LoadOptions};
use pricewise_store::reaper::SessionReaper;
use tokio::sync::watch;

use crate::api::{ApiState, UploadLimits};

fn init_logging(config: &AppConfig) {
    use pricewise_core::config::LogFormat::*;
    use tracing::Level;

    let log_level = config.logging.level.parse::<Level>().unwrap_or(Level::INFO);

    match config.logging.format {
        Compact => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).compact().init();
        }
        Pretty => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).pretty().init();
        }
        Json => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).json().init();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    run().await
}

pub async fn run() -> Result<()> {
    // Logging needs the config, so load it before bootstrapping anything else.
    let config = AppConfig::load(LoadOptions::default())?;
    init_logging(&config);

    let app = bootstrap::bootstrap_with_config(config).await?;

    let (fatal_tx, fatal_rx) = watch::channel(false);
    let (reaper_stop_tx, reaper_stop_rx) = watch::channel(false);
    let reaper = SessionReaper::from_config(app.store.clone(), &app.config.sessions).spawn(reaper_stop_rx);

    let state = ApiState::new(
        app.runtime.clone(),
        UploadLimits::from_config(&app.config.server),
        Arc::new(fatal_tx),
    );
    let router = api::router(state, app.files.clone());

    let address = format!("{}:{}", app.config.server.bind_address, app.config.server.port);
    let listener = tokio::net::TcpListener::bind(&address).await?;
    tracing::info!(
        event_name = "system.server.started",
        correlation_id = "bootstrap",
        bind_address = %address,
        "pricewise-server listening"
    );

    axum::serve(listener, router).with_graceful_shutdown(wait_for_shutdown(fatal_rx.clone())).await?;

    tracing::info!(
        event_name = "system.server.stopping",
        correlation_id = "shutdown",
        "pricewise-server stopping"
    );
    reaper_stop_tx.send_replace(true);
    let grace = Duration::from_secs(app.config.server.graceful_shutdown_secs);
    if tokio::time::timeout(grace, reaper).await.is_err() {
        tracing::warn!(
            event_name = "system.server.reaper_timeout",
            correlation_id = "shutdown",
            "session reaper did not stop within the grace period"
        );
    }

    if *fatal_rx.borrow() {
        bail!("stopped after a fatal storage error");
    }
    Ok(())
}

async fn wait_for_shutdown(mut fatal: watch::Receiver<bool>) {
    let fatal_raised = async move {
        while !*fatal.borrow_and_update() {
            if fatal.changed().await.is_err() {
                // Sender dropped without raising; wait for ctrl-c instead.
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::pin!(fatal_raised);

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(error) = result {
                tracing::error!(
                    event_name = "system.server.signal_error",
                    correlation_id = "shutdown",
                    error = %error,
                    "could not listen for ctrl-c; only a fatal error will stop the server"
                );
                (&mut fatal_raised).await;
            }
        }
        _ = &mut fatal_raised => {}
    }
}
