// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shard controller.
//!
//! Places shards onto this host, recovers from ownership loss, and
//! demultiplexes requests by shard id. The routing table maps shard id to
//! engine; requests for shards this host does not hold fail with ownership
//! loss so the caller can redirect. Shard contexts report ownership loss on
//! a close channel; the controller unloads the engine and the next
//! acquisition tick may take the shard back.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::{Mutex, mpsc, watch};
use tracing::{info, warn};
use windlass_persistence::{ExecutionStore, HistoryStore, ShardStore};

use crate::client::{MatchingClient, VisibilityClient};
use crate::config::Config;
use crate::engine::HistoryEngine;
use crate::error::{EngineError, Result};
use crate::membership::Membership;
use crate::metrics::{EngineMetrics, incr};
use crate::shard::ShardContext;

fn fnv1a_32(data: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for byte in data {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

/// Owns this host's shard engines and routes requests to them.
pub struct ShardController {
    config: Arc<Config>,
    membership: Arc<dyn Membership>,
    shard_store: Arc<dyn ShardStore>,
    execution_store: Arc<dyn ExecutionStore>,
    history_store: Arc<dyn HistoryStore>,
    matching: Arc<dyn MatchingClient>,
    visibility: Arc<dyn VisibilityClient>,
    metrics: Arc<EngineMetrics>,
    engines: RwLock<HashMap<u32, Arc<HistoryEngine>>>,
    close_tx: mpsc::UnboundedSender<u32>,
    close_rx: Mutex<Option<mpsc::UnboundedReceiver<u32>>>,
}

impl ShardController {
    /// Build a controller; call [`Self::run`] to start acquiring shards.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<Config>,
        membership: Arc<dyn Membership>,
        shard_store: Arc<dyn ShardStore>,
        execution_store: Arc<dyn ExecutionStore>,
        history_store: Arc<dyn HistoryStore>,
        matching: Arc<dyn MatchingClient>,
        visibility: Arc<dyn VisibilityClient>,
        metrics: Arc<EngineMetrics>,
    ) -> Arc<Self> {
        let (close_tx, close_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            config,
            membership,
            shard_store,
            execution_store,
            history_store,
            matching,
            visibility,
            metrics,
            engines: RwLock::new(HashMap::new()),
            close_tx,
            close_rx: Mutex::new(Some(close_rx)),
        })
    }

    /// Deterministic shard for a workflow id.
    pub fn shard_id_for_workflow(&self, workflow_id: &str) -> u32 {
        fnv1a_32(workflow_id.as_bytes()) % self.config.number_of_shards
    }

    /// Engine owning a workflow's shard; ownership loss when this host does
    /// not hold it.
    pub fn engine_for_workflow(&self, workflow_id: &str) -> Result<Arc<HistoryEngine>> {
        self.engine_for_shard(self.shard_id_for_workflow(workflow_id))
    }

    /// Engine for a shard id; ownership loss when this host does not hold it.
    pub fn engine_for_shard(&self, shard_id: u32) -> Result<Arc<HistoryEngine>> {
        self.engines
            .read()
            .get(&shard_id)
            .cloned()
            .ok_or(EngineError::ShardOwnershipLost { shard_id })
    }

    /// Number of shards currently held.
    pub fn owned_shard_count(&self) -> usize {
        self.engines.read().len()
    }

    /// Acquisition loop: take owed shards on a fixed interval and unload
    /// shards whose contexts report ownership loss. Returns after a
    /// shutdown signal, with every engine stopped.
    pub async fn run(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        let mut close_rx = self
            .close_rx
            .lock()
            .await
            .take()
            .expect("controller run loop started twice");
        let mut acquire_interval = tokio::time::interval(self.config.acquire_shard_interval);

        info!(
            host = self.membership.host_identity(),
            shards = self.config.number_of_shards,
            "shard controller started"
        );

        loop {
            tokio::select! {
                biased;

                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }

                Some(shard_id) = close_rx.recv() => {
                    self.unload_shard(shard_id).await;
                }

                _ = acquire_interval.tick() => {
                    self.acquire_shards().await;
                }
            }
        }

        self.stop_all().await;
        info!("shard controller stopped");
    }

    async fn acquire_shards(&self) {
        for shard_id in 0..self.config.number_of_shards {
            if !self.membership.owns_shard(shard_id) {
                continue;
            }
            if self.engines.read().contains_key(&shard_id) {
                continue;
            }

            let acquired = ShardContext::acquire(
                shard_id,
                self.membership.host_identity().to_string(),
                self.config.clone(),
                self.shard_store.clone(),
                self.execution_store.clone(),
                self.history_store.clone(),
                self.close_tx.clone(),
            )
            .await;

            match acquired {
                Ok(shard) => {
                    let engine = HistoryEngine::new(
                        shard,
                        self.config.clone(),
                        self.execution_store.clone(),
                        self.matching.clone(),
                        self.visibility.clone(),
                        self.metrics.clone(),
                    );
                    engine.start();
                    self.engines.write().insert(shard_id, engine);
                    incr(&self.metrics.shards_acquired);
                    info!(shard_id, "shard acquired");
                }
                Err(err) => {
                    // Retried on the next acquisition tick.
                    warn!(shard_id, error = %err, "shard acquisition failed");
                }
            }
        }
    }

    async fn unload_shard(&self, shard_id: u32) {
        let engine = self.engines.write().remove(&shard_id);
        if let Some(engine) = engine {
            incr(&self.metrics.shards_unloaded);
            warn!(shard_id, "unloading shard after ownership loss");
            engine.stop().await;
        }
    }

    async fn stop_all(&self) {
        let engines: Vec<(u32, Arc<HistoryEngine>)> = self.engines.write().drain().collect();
        for (shard_id, engine) in engines {
            info!(shard_id, "stopping shard engine");
            engine.stop().await;
        }
    }
}
