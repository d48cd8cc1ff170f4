// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Windlass History - Sharded History Engine
//!
//! Standalone entry point: opens the SQLite store, provisions shard rows,
//! and runs the history service until interrupted.
//!
//! Note: task dispatch and visibility recording are wired to no-op clients
//! here; a deployment embeds the service and provides real ones.

use std::sync::Arc;

use anyhow::Result;
use tracing::{error, info};

use windlass_history::client::{NoopMatchingClient, NoopVisibilityClient};
use windlass_history::config::Config;
use windlass_history::runtime::HistoryService;
use windlass_persistence::{SqliteStore, provision_shards};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (from crate directory or parent directories)
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("windlass_history=info".parse()?),
        )
        .init();

    info!("Starting Windlass History");

    let config = Config::from_env();
    info!(
        number_of_shards = config.number_of_shards,
        range_size_bits = config.range_size_bits,
        "Configuration loaded"
    );

    let database_path = std::env::var("WINDLASS_DATABASE_PATH")
        .unwrap_or_else(|_| ".data/windlass.db".to_string());
    info!(database_path = %database_path, "Opening store");
    let store = Arc::new(SqliteStore::from_path(&database_path).await.map_err(|e| {
        error!("Store initialization error: {e}");
        anyhow::anyhow!(e)
    })?);

    info!("Provisioning shard rows");
    provision_shards(store.as_ref(), config.number_of_shards)
        .await
        .map_err(|e| anyhow::anyhow!(e))?;

    let service = HistoryService::builder()
        .config(config)
        .stores(store.clone(), store.clone(), store)
        .matching(Arc::new(NoopMatchingClient))
        .visibility(Arc::new(NoopVisibilityClient))
        .build()?
        .start()
        .await?;

    info!("Windlass History initialized successfully");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    service.shutdown().await?;
    info!("Shutdown complete");

    Ok(())
}
