// Copyright (C) 2026 Novita Labs
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Novita Core - GPU Instance Control Plane
//!
//! Responsible for:
//! - The instance lifecycle state machine (create/start/stop/delete)
//! - The persistent job queue and worker loop driving startup monitoring,
//!   webhooks, spot migration, and auto-stop
//! - Periodic maintenance: upstream sync, migration sweeps, auto-stop sweeps
//!
//! Note: the client-facing HTTP surface lives outside this crate; this
//! binary only runs the queue worker and scheduler loops against the shared
//! [`novita_core::app::AppContext`].

use std::time::Duration;

use anyhow::Result;
use tracing::{error, info};

use novita_core::app::AppContext;
use novita_core::config::Config;

const QUEUE_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("novita_core=info".parse().unwrap()),
        )
        .init();

    info!("Starting Novita Core");

    let config = Config::from_env().map_err(|err| {
        error!("Configuration error: {}", err);
        err
    })?;

    info!(
        api_base_url = %config.novita_api_base_url,
        default_region = %config.default_region,
        migration_enabled = config.migration_enabled,
        sync_enable_automatic_sync = config.sync_enable_automatic_sync,
        "Configuration loaded"
    );

    info!("Wiring application context...");
    let app = AppContext::new(config).await?;
    info!(store_backend = app.store.backend_name(), "Application context ready");

    let background = app.spawn_background_tasks();

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, draining background tasks...");

    background.shutdown().await;
    app.queue.shutdown(QUEUE_DRAIN_TIMEOUT).await;

    info!("Shutdown complete");
    Ok(())
}
