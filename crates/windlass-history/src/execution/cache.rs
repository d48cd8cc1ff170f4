// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Execution context cache.
//!
//! LRU of live [`WorkflowExecutionContext`]s keyed by
//! `(domain, workflow, run)`. Each entry carries the per-execution mutex
//! that serializes the load/mutate/persist sequence; lookups hand out the
//! same `Arc` so concurrent callers contend on one lock. Entries past the
//! TTL are replaced on lookup.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Instant;

use lru::LruCache;
use parking_lot::RwLock;
use tokio::sync::Mutex;
use windlass_api::WorkflowExecution;
use windlass_persistence::ExecutionStore;

use crate::config::Config;
use crate::execution::context::WorkflowExecutionContext;
use crate::shard::ShardContext;

type CacheKey = (String, String, String);

#[derive(Clone)]
struct CacheEntry {
    context: Arc<Mutex<WorkflowExecutionContext>>,
    inserted_at: Instant,
}

/// LRU + TTL cache of execution contexts for one shard.
pub struct ExecutionCache {
    config: Arc<Config>,
    inner: RwLock<LruCache<CacheKey, CacheEntry>>,
}

impl ExecutionCache {
    /// Create a cache with capacity `history_cache_max_size`.
    pub fn new(config: Arc<Config>) -> Self {
        let capacity = NonZeroUsize::new(config.history_cache_max_size.max(1))
            .expect("cache capacity is at least 1");
        Self {
            config,
            inner: RwLock::new(LruCache::new(capacity)),
        }
    }

    /// Context for an execution, creating it on miss or TTL expiry.
    pub fn get_or_create(
        &self,
        domain_id: &str,
        execution: &WorkflowExecution,
        shard: &Arc<ShardContext>,
        execution_store: &Arc<dyn ExecutionStore>,
    ) -> Arc<Mutex<WorkflowExecutionContext>> {
        let key = (
            domain_id.to_string(),
            execution.workflow_id.clone(),
            execution.run_id.clone(),
        );

        {
            let mut cache = self.inner.write();
            if let Some(entry) = cache.get(&key) {
                if entry.inserted_at.elapsed() < self.config.history_cache_ttl {
                    return entry.context.clone();
                }
                cache.pop(&key);
            }
        }

        let context = Arc::new(Mutex::new(WorkflowExecutionContext::new(
            domain_id.to_string(),
            execution.clone(),
            shard.clone(),
            execution_store.clone(),
            self.config.clone(),
        )));
        self.inner.write().push(
            key,
            CacheEntry {
                context: context.clone(),
                inserted_at: Instant::now(),
            },
        );
        context
    }

    /// Drop one execution's cached context.
    pub fn remove(&self, domain_id: &str, execution: &WorkflowExecution) {
        let key = (
            domain_id.to_string(),
            execution.workflow_id.clone(),
            execution.run_id.clone(),
        );
        self.inner.write().pop(&key);
    }

    /// Drop every cached context; called on shard unload.
    pub fn clear(&self) {
        self.inner.write().clear();
    }

    /// Number of cached contexts.
    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    /// True when nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc;
    use windlass_persistence::{MemoryStore, ShardStore, provision_shards};

    use super::*;

    async fn test_shard(store: &Arc<MemoryStore>) -> Arc<ShardContext> {
        provision_shards(store.as_ref(), 1).await.unwrap();
        let (close_tx, _close_rx) = mpsc::unbounded_channel();
        ShardContext::acquire(
            0,
            "host-a".into(),
            Arc::new(Config::default()),
            store.clone() as Arc<dyn ShardStore>,
            store.clone() as Arc<dyn windlass_persistence::ExecutionStore>,
            store.clone() as Arc<dyn windlass_persistence::HistoryStore>,
            close_tx,
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn same_key_returns_same_context() {
        let store = Arc::new(MemoryStore::new());
        let shard = test_shard(&store).await;
        let execution_store = store.clone() as Arc<dyn ExecutionStore>;
        let cache = ExecutionCache::new(Arc::new(Config::default()));

        let execution = WorkflowExecution::new("w1", "r1");
        let a = cache.get_or_create("d1", &execution, &shard, &execution_store);
        let b = cache.get_or_create("d1", &execution, &shard, &execution_store);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn lru_capacity_is_bounded() {
        let store = Arc::new(MemoryStore::new());
        let shard = test_shard(&store).await;
        let execution_store = store.clone() as Arc<dyn ExecutionStore>;
        let config = Config {
            history_cache_max_size: 2,
            ..Config::default()
        };
        let cache = ExecutionCache::new(Arc::new(config));

        for run in ["r1", "r2", "r3"] {
            let execution = WorkflowExecution::new("w1", run);
            cache.get_or_create("d1", &execution, &shard, &execution_store);
        }
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test]
    async fn ttl_expiry_replaces_entry() {
        let store = Arc::new(MemoryStore::new());
        let shard = test_shard(&store).await;
        let execution_store = store.clone() as Arc<dyn ExecutionStore>;
        let config = Config {
            history_cache_ttl: Duration::from_millis(10),
            ..Config::default()
        };
        let cache = ExecutionCache::new(Arc::new(config));

        let execution = WorkflowExecution::new("w1", "r1");
        let a = cache.get_or_create("d1", &execution, &shard, &execution_store);
        tokio::time::sleep(Duration::from_millis(20)).await;
        let b = cache.get_or_create("d1", &execution, &shard, &execution_store);
        assert!(!Arc::ptr_eq(&a, &b));
    }
}
