// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for windlass-history integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use windlass_api::events::{HistoryEvent, deserialize_event_batch};
use windlass_api::{StartWorkflowExecutionRequest, WorkflowExecution};
use windlass_history::client::{RecordingMatchingClient, RecordingVisibilityClient};
use windlass_history::config::Config;
use windlass_history::engine::HistoryEngine;
use windlass_history::metrics::EngineMetrics;
use windlass_history::runtime::HistoryService;
use windlass_history::shard::ShardContext;
use windlass_persistence::{
    ExecutionStore, HistoryStore, MemoryStore, ShardStore, provision_shards,
};

/// A fully wired service over a memory store with recording clients.
pub struct TestService {
    pub store: Arc<MemoryStore>,
    pub matching: Arc<RecordingMatchingClient>,
    pub visibility: Arc<RecordingVisibilityClient>,
    pub service: HistoryService,
}

/// Start a service over a fresh memory store and wait until every shard is
/// held.
pub async fn start_service(config: Config) -> TestService {
    let store = Arc::new(MemoryStore::new());
    provision_shards(store.as_ref(), config.number_of_shards)
        .await
        .expect("provision shards");

    let matching = Arc::new(RecordingMatchingClient::new());
    let visibility = Arc::new(RecordingVisibilityClient::new());
    let number_of_shards = config.number_of_shards;

    let service = HistoryService::builder()
        .config(config)
        .stores(
            store.clone() as Arc<dyn ShardStore>,
            store.clone() as Arc<dyn ExecutionStore>,
            store.clone() as Arc<dyn HistoryStore>,
        )
        .matching(matching.clone())
        .visibility(visibility.clone())
        .build()
        .expect("build service")
        .start()
        .await
        .expect("start service");

    wait_until(
        || service.controller().owned_shard_count() == number_of_shards as usize,
        "all shards acquired",
    )
    .await;

    TestService {
        store,
        matching,
        visibility,
        service,
    }
}

/// An engine over shard 0 with no queue processors running, plus the close
/// channel receiver for observing unload requests.
pub struct TestEngine {
    pub store: Arc<MemoryStore>,
    pub matching: Arc<RecordingMatchingClient>,
    pub visibility: Arc<RecordingVisibilityClient>,
    pub engine: Arc<HistoryEngine>,
    pub close_rx: mpsc::UnboundedReceiver<u32>,
}

/// Acquire shard 0 over a fresh memory store and build its engine without
/// starting the queue processors.
pub async fn start_engine(config: Config) -> TestEngine {
    let store = Arc::new(MemoryStore::new());
    provision_shards(store.as_ref(), 1).await.expect("provision shards");

    let (close_tx, close_rx) = mpsc::unbounded_channel();
    let config = Arc::new(config);
    let shard = ShardContext::acquire(
        0,
        "test-host".into(),
        config.clone(),
        store.clone() as Arc<dyn ShardStore>,
        store.clone() as Arc<dyn ExecutionStore>,
        store.clone() as Arc<dyn HistoryStore>,
        close_tx,
    )
    .await
    .expect("acquire shard");

    let matching = Arc::new(RecordingMatchingClient::new());
    let visibility = Arc::new(RecordingVisibilityClient::new());
    let engine = HistoryEngine::new(
        shard,
        config,
        store.clone() as Arc<dyn ExecutionStore>,
        matching.clone(),
        visibility.clone(),
        Arc::new(EngineMetrics::new()),
    );

    TestEngine {
        store,
        matching,
        visibility,
        engine,
        close_rx,
    }
}

/// Poll `condition` until it holds, panicking after five seconds.
pub async fn wait_until<F>(mut condition: F, what: &str)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

/// A start request with sane defaults.
pub fn start_request(workflow_id: &str, request_id: &str) -> StartWorkflowExecutionRequest {
    StartWorkflowExecutionRequest {
        domain_id: "d1".into(),
        workflow_id: workflow_id.into(),
        workflow_type: "order-fulfillment".into(),
        task_list: "default".into(),
        input: Some(b"{}".to_vec()),
        execution_start_to_close_timeout_seconds: 3600,
        task_start_to_close_timeout_seconds: 10,
        request_id: request_id.into(),
    }
}

/// All history events of a run, concatenated across batches in order.
pub async fn history_events(
    store: &Arc<MemoryStore>,
    domain_id: &str,
    execution: &WorkflowExecution,
) -> Vec<HistoryEvent> {
    let batches = store
        .get_workflow_execution_history(domain_id, &execution.workflow_id, &execution.run_id)
        .await
        .expect("read history");
    batches
        .iter()
        .flat_map(|batch| deserialize_event_batch(&batch.data).expect("decode batch"))
        .collect()
}
