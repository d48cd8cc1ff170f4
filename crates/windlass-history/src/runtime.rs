// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable history service runtime.
//!
//! [`HistoryService`] wraps the shard controller so the engine can run
//! inside an existing tokio application. It is also the RPC-facing surface:
//! every operation routes to the owning shard's engine by workflow id.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use windlass_history::runtime::HistoryService;
//! use windlass_persistence::{MemoryStore, provision_shards};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let store = Arc::new(MemoryStore::new());
//!     provision_shards(store.as_ref(), 4).await?;
//!
//!     let service = HistoryService::builder()
//!         .stores(store.clone(), store.clone(), store)
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     // ... serve RPCs through `service` ...
//!
//!     service.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};
use uuid::Uuid;
use windlass_api::{
    GetWorkflowExecutionNextEventIdRequest, GetWorkflowExecutionNextEventIdResponse,
    RecordActivityTaskHeartbeatRequest, RecordActivityTaskHeartbeatResponse,
    RecordActivityTaskStartedRequest, RecordActivityTaskStartedResponse,
    RecordDecisionTaskStartedRequest, RecordDecisionTaskStartedResponse,
    RequestCancelWorkflowExecutionRequest, RespondActivityTaskCanceledRequest,
    RespondActivityTaskCompletedRequest, RespondActivityTaskFailedRequest,
    RespondDecisionTaskCompletedRequest, SignalWorkflowExecutionRequest,
    StartWorkflowExecutionRequest, StartWorkflowExecutionResponse,
    TerminateWorkflowExecutionRequest,
};
use windlass_persistence::{ExecutionStore, HistoryStore, ShardStore};

use crate::client::{MatchingClient, NoopMatchingClient, NoopVisibilityClient, VisibilityClient};
use crate::config::Config;
use crate::error::EngineError;
use crate::membership::{Membership, SingleHostMembership};
use crate::metrics::{EngineMetrics, MetricsSnapshot};
use crate::shard::controller::ShardController;

/// Builder for a [`HistoryService`].
pub struct HistoryServiceBuilder {
    config: Config,
    shard_store: Option<Arc<dyn ShardStore>>,
    execution_store: Option<Arc<dyn ExecutionStore>>,
    history_store: Option<Arc<dyn HistoryStore>>,
    matching: Arc<dyn MatchingClient>,
    visibility: Arc<dyn VisibilityClient>,
    membership: Option<Arc<dyn Membership>>,
}

impl Default for HistoryServiceBuilder {
    fn default() -> Self {
        Self {
            config: Config::default(),
            shard_store: None,
            execution_store: None,
            history_store: None,
            matching: Arc::new(NoopMatchingClient),
            visibility: Arc::new(NoopVisibilityClient),
            membership: None,
        }
    }
}

impl HistoryServiceBuilder {
    /// Create a builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the configuration (default: [`Config::default`]).
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Set the three store interfaces (required). A single backend normally
    /// implements all of them.
    pub fn stores(
        mut self,
        shard_store: Arc<dyn ShardStore>,
        execution_store: Arc<dyn ExecutionStore>,
        history_store: Arc<dyn HistoryStore>,
    ) -> Self {
        self.shard_store = Some(shard_store);
        self.execution_store = Some(execution_store);
        self.history_store = Some(history_store);
        self
    }

    /// Set the matching client (default: no-op).
    pub fn matching(mut self, matching: Arc<dyn MatchingClient>) -> Self {
        self.matching = matching;
        self
    }

    /// Set the visibility client (default: no-op).
    pub fn visibility(mut self, visibility: Arc<dyn VisibilityClient>) -> Self {
        self.visibility = visibility;
        self
    }

    /// Set the membership (default: single host with a random identity).
    pub fn membership(mut self, membership: Arc<dyn Membership>) -> Self {
        self.membership = Some(membership);
        self
    }

    /// Build the service configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<HistoryServiceConfig> {
        let shard_store = self
            .shard_store
            .ok_or_else(|| anyhow::anyhow!("stores are required"))?;
        let execution_store = self
            .execution_store
            .ok_or_else(|| anyhow::anyhow!("stores are required"))?;
        let history_store = self
            .history_store
            .ok_or_else(|| anyhow::anyhow!("stores are required"))?;
        let membership = self.membership.unwrap_or_else(|| {
            Arc::new(SingleHostMembership::new(format!(
                "history-{}",
                Uuid::new_v4()
            )))
        });

        Ok(HistoryServiceConfig {
            config: Arc::new(self.config),
            shard_store,
            execution_store,
            history_store,
            matching: self.matching,
            visibility: self.visibility,
            membership,
        })
    }
}

/// Built configuration, ready to start.
pub struct HistoryServiceConfig {
    config: Arc<Config>,
    shard_store: Arc<dyn ShardStore>,
    execution_store: Arc<dyn ExecutionStore>,
    history_store: Arc<dyn HistoryStore>,
    matching: Arc<dyn MatchingClient>,
    visibility: Arc<dyn VisibilityClient>,
    membership: Arc<dyn Membership>,
}

impl HistoryServiceConfig {
    /// Start the service: spawn the controller's acquisition loop and wait
    /// until every shard owed to this host is held.
    pub async fn start(self) -> Result<HistoryService> {
        let metrics = Arc::new(EngineMetrics::new());
        let controller = ShardController::new(
            self.config.clone(),
            self.membership,
            self.shard_store,
            self.execution_store,
            self.history_store,
            self.matching,
            self.visibility,
            metrics.clone(),
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let run_controller = controller.clone();
        let controller_handle = tokio::spawn(run_controller.run(shutdown_rx));

        // First acquisition happens on the interval's immediate first tick;
        // give it a bounded moment so callers see a routable service.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while controller.owned_shard_count() == 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        info!(
            owned_shards = controller.owned_shard_count(),
            "history service started"
        );

        Ok(HistoryService {
            controller,
            metrics,
            shutdown_tx,
            controller_handle,
        })
    }
}

/// A running history service.
pub struct HistoryService {
    controller: Arc<ShardController>,
    metrics: Arc<EngineMetrics>,
    shutdown_tx: watch::Sender<bool>,
    controller_handle: JoinHandle<()>,
}

impl HistoryService {
    /// Create a new builder.
    pub fn builder() -> HistoryServiceBuilder {
        HistoryServiceBuilder::new()
    }

    /// The shard controller, for routing and introspection.
    pub fn controller(&self) -> &Arc<ShardController> {
        &self.controller
    }

    /// Point-in-time engine counters.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Gracefully shut down: stop acquiring, stop every engine's
    /// processors, and wait for the controller to finish.
    pub async fn shutdown(self) -> Result<()> {
        info!("history service shutting down");
        let _ = self.shutdown_tx.send(true);
        match self.controller_handle.await {
            Ok(()) => {
                info!("history service shutdown complete");
                Ok(())
            }
            Err(err) => {
                error!("controller task panicked: {err}");
                Err(anyhow::anyhow!("controller task panicked: {err}"))
            }
        }
    }

    /// Start a new workflow execution.
    pub async fn start_workflow_execution(
        &self,
        request: StartWorkflowExecutionRequest,
    ) -> std::result::Result<StartWorkflowExecutionResponse, EngineError> {
        self.controller
            .engine_for_workflow(&request.workflow_id)?
            .start_workflow_execution(request)
            .await
    }

    /// Current run id and next event id of a workflow.
    pub async fn get_workflow_execution_next_event_id(
        &self,
        request: GetWorkflowExecutionNextEventIdRequest,
    ) -> std::result::Result<GetWorkflowExecutionNextEventIdResponse, EngineError> {
        self.controller
            .engine_for_workflow(&request.workflow_id)?
            .get_workflow_execution_next_event_id(request)
            .await
    }

    /// Record that a poller started the pending decision task.
    pub async fn record_decision_task_started(
        &self,
        request: RecordDecisionTaskStartedRequest,
    ) -> std::result::Result<RecordDecisionTaskStartedResponse, EngineError> {
        self.controller
            .engine_for_workflow(&request.execution.workflow_id)?
            .record_decision_task_started(request)
            .await
    }

    /// Complete the started decision task and apply its decisions.
    pub async fn respond_decision_task_completed(
        &self,
        request: RespondDecisionTaskCompletedRequest,
    ) -> std::result::Result<(), EngineError> {
        self.controller
            .engine_for_workflow(&request.execution.workflow_id)?
            .respond_decision_task_completed(request)
            .await
    }

    /// Record that a poller started a scheduled activity task.
    pub async fn record_activity_task_started(
        &self,
        request: RecordActivityTaskStartedRequest,
    ) -> std::result::Result<RecordActivityTaskStartedResponse, EngineError> {
        self.controller
            .engine_for_workflow(&request.execution.workflow_id)?
            .record_activity_task_started(request)
            .await
    }

    /// Record activity liveness and progress details.
    pub async fn record_activity_task_heartbeat(
        &self,
        request: RecordActivityTaskHeartbeatRequest,
    ) -> std::result::Result<RecordActivityTaskHeartbeatResponse, EngineError> {
        self.controller
            .engine_for_workflow(&request.execution.workflow_id)?
            .record_activity_task_heartbeat(request)
            .await
    }

    /// Report successful completion of a started activity.
    pub async fn respond_activity_task_completed(
        &self,
        request: RespondActivityTaskCompletedRequest,
    ) -> std::result::Result<(), EngineError> {
        self.controller
            .engine_for_workflow(&request.execution.workflow_id)?
            .respond_activity_task_completed(request)
            .await
    }

    /// Report failure of a started activity.
    pub async fn respond_activity_task_failed(
        &self,
        request: RespondActivityTaskFailedRequest,
    ) -> std::result::Result<(), EngineError> {
        self.controller
            .engine_for_workflow(&request.execution.workflow_id)?
            .respond_activity_task_failed(request)
            .await
    }

    /// Report cancellation of a started activity.
    pub async fn respond_activity_task_canceled(
        &self,
        request: RespondActivityTaskCanceledRequest,
    ) -> std::result::Result<(), EngineError> {
        self.controller
            .engine_for_workflow(&request.execution.workflow_id)?
            .respond_activity_task_canceled(request)
            .await
    }

    /// Deliver a signal to a running workflow.
    pub async fn signal_workflow_execution(
        &self,
        request: SignalWorkflowExecutionRequest,
    ) -> std::result::Result<(), EngineError> {
        self.controller
            .engine_for_workflow(&request.workflow_id)?
            .signal_workflow_execution(request)
            .await
    }

    /// Request cooperative cancellation of a running workflow.
    pub async fn request_cancel_workflow_execution(
        &self,
        request: RequestCancelWorkflowExecutionRequest,
    ) -> std::result::Result<(), EngineError> {
        self.controller
            .engine_for_workflow(&request.workflow_id)?
            .request_cancel_workflow_execution(request)
            .await
    }

    /// Forcibly close a running workflow.
    pub async fn terminate_workflow_execution(
        &self,
        request: TerminateWorkflowExecutionRequest,
    ) -> std::result::Result<(), EngineError> {
        self.controller
            .engine_for_workflow(&request.workflow_id)?
            .terminate_workflow_execution(request)
            .await
    }

    /// True while the controller loop is running.
    pub fn is_running(&self) -> bool {
        !self.controller_handle.is_finished()
    }
}
