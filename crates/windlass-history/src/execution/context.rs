// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Workflow execution context.
//!
//! Binds one [`MutableStateBuilder`] to one execution and drives the
//! two-phase update transaction:
//!
//! 1. append the session's new events as a history batch, keyed by the
//!    first new event id and the caller's transaction id;
//! 2. conditionally update the execution row with the mutable-state diff.
//!
//! A crash between the phases leaves an orphan batch; the next update's
//! append collides on the key and is resolved by the shard's overwrite
//! retry, which is safe precisely because phase 2 never committed. Any
//! conflict invalidates the cached builder so the caller reloads.

use std::sync::Arc;

use windlass_api::{WorkflowExecution, WorkflowState, events};
use windlass_persistence::{
    AppendHistoryEventsRequest, ContinueAsNewExecution, ExecutionStore,
    GetWorkflowExecutionRequest, StoreError, TimerTask, TransferTask,
    UpdateWorkflowExecutionRequest,
};

use crate::backoff::{RetryPolicy, retry};
use crate::config::Config;
use crate::error::{EngineError, Result};
use crate::execution::mutable_state::MutableStateBuilder;
use crate::shard::ShardContext;

/// Load → mutate → persist sequencing for one workflow execution.
///
/// Callers hold the per-execution mutex handed out by the cache for the
/// whole sequence.
pub struct WorkflowExecutionContext {
    domain_id: String,
    execution: WorkflowExecution,
    shard: Arc<ShardContext>,
    execution_store: Arc<dyn ExecutionStore>,
    config: Arc<Config>,
    ms_builder: Option<MutableStateBuilder>,
    update_condition: i64,
}

impl WorkflowExecutionContext {
    /// Create an unloaded context.
    pub fn new(
        domain_id: String,
        execution: WorkflowExecution,
        shard: Arc<ShardContext>,
        execution_store: Arc<dyn ExecutionStore>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            domain_id,
            execution,
            shard,
            execution_store,
            config,
            ms_builder: None,
            update_condition: 0,
        }
    }

    /// Execution this context is bound to.
    pub fn execution(&self) -> &WorkflowExecution {
        &self.execution
    }

    /// Ensure the mutable state is loaded; no-op when already cached.
    pub async fn load(&mut self) -> Result<()> {
        if self.ms_builder.is_some() {
            return Ok(());
        }

        let store = self.execution_store.clone();
        let request = GetWorkflowExecutionRequest {
            domain_id: self.domain_id.clone(),
            workflow_id: self.execution.workflow_id.clone(),
            run_id: self.execution.run_id.clone(),
        };
        let state = retry(
            &RetryPolicy::persistence(),
            move || {
                let store = store.clone();
                let request = request.clone();
                async move { store.get_workflow_execution(request).await }
            },
            StoreError::is_transient,
        )
        .await?;

        self.update_condition = state.execution_info.next_event_id;
        let mut builder = MutableStateBuilder::new(self.config.clone());
        builder.load(state);
        self.ms_builder = Some(builder);
        Ok(())
    }

    /// Loaded mutable state; fails when [`Self::load`] has not run.
    pub fn mutable_state(&mut self) -> Result<&mut MutableStateBuilder> {
        self.ms_builder
            .as_mut()
            .ok_or_else(|| EngineError::Fatal("mutable state accessed before load".into()))
    }

    /// Drop cached state; the next access reloads from persistence.
    pub fn clear(&mut self) {
        self.ms_builder = None;
    }

    /// Run the two-phase update transaction for the current session.
    pub async fn update_workflow_execution(
        &mut self,
        transfer_tasks: Vec<TransferTask>,
        timer_tasks: Vec<TimerTask>,
        transaction_id: i64,
    ) -> Result<()> {
        self.update_internal(transfer_tasks, timer_tasks, None, transaction_id)
            .await
    }

    /// Close this run and create the new one in a single transaction.
    ///
    /// The new run's first batch is appended with transaction id 0: the run
    /// id is fresh, so there is no duplicate to resolve. A failure after
    /// that append leaves the batch orphaned; the current run is untouched
    /// and the caller retries.
    pub async fn continue_as_new_workflow_execution(
        &mut self,
        new_run_first_batch: Vec<u8>,
        new_execution: ContinueAsNewExecution,
        transfer_tasks: Vec<TransferTask>,
        timer_tasks: Vec<TimerTask>,
        transaction_id: i64,
    ) -> Result<()> {
        let append = AppendHistoryEventsRequest {
            shard_id: self.shard.shard_id(),
            range_id: 0,
            domain_id: new_execution.execution_info.domain_id.clone(),
            workflow_id: new_execution.execution_info.workflow_id.clone(),
            run_id: new_execution.execution_info.run_id.clone(),
            first_event_id: 1,
            transaction_id: 0,
            events: new_run_first_batch,
            overwrite: false,
        };
        self.shard.append_history_events(append).await?;

        self.update_internal(
            transfer_tasks,
            timer_tasks,
            Some(new_execution),
            transaction_id,
        )
        .await
    }

    async fn update_internal(
        &mut self,
        transfer_tasks: Vec<TransferTask>,
        timer_tasks: Vec<TimerTask>,
        continue_as_new: Option<ContinueAsNewExecution>,
        transaction_id: i64,
    ) -> Result<()> {
        let (updates, execution_info, next_event_id) = {
            let builder = self
                .ms_builder
                .as_mut()
                .ok_or_else(|| EngineError::Fatal("update before load".into()))?;
            let updates = builder.close_update_session();
            (
                updates,
                builder.execution_info().clone(),
                builder.next_event_id(),
            )
        };

        // Phase 1: history append. Skipped for row-only sessions such as
        // heartbeats and decision starts.
        if let Some(first_event) = updates.new_events.first() {
            let first_event_id = first_event.event_id;
            let data = match events::serialize_event_batch(&updates.new_events) {
                Ok(data) => data,
                Err(err) => {
                    self.clear();
                    return Err(EngineError::Fatal(format!(
                        "history batch serialization failed: {err}"
                    )));
                }
            };
            let append = AppendHistoryEventsRequest {
                shard_id: self.shard.shard_id(),
                range_id: 0,
                domain_id: self.domain_id.clone(),
                workflow_id: self.execution.workflow_id.clone(),
                run_id: self.execution.run_id.clone(),
                first_event_id,
                transaction_id,
                events: data,
                overwrite: false,
            };
            if let Err(err) = self.shard.append_history_events(append).await {
                self.clear();
                return Err(err);
            }
        }

        // Phase 2: conditional row update.
        let close_execution = execution_info.state == WorkflowState::Completed;
        let request = UpdateWorkflowExecutionRequest {
            shard_id: self.shard.shard_id(),
            range_id: 0,
            condition: self.update_condition,
            execution_info,
            transfer_tasks,
            timer_tasks,
            upsert_activity_infos: updates.upsert_activity_infos,
            delete_activity_info: updates.delete_activity_info,
            upsert_timer_infos: updates.upsert_timer_infos,
            delete_timer_infos: updates.delete_timer_infos,
            upsert_child_execution_infos: updates.upsert_child_execution_infos,
            delete_child_execution_info: updates.delete_child_execution_info,
            continue_as_new,
            close_execution,
        };

        let shard = self.shard.clone();
        let result = retry(
            &RetryPolicy::persistence(),
            move || {
                let shard = shard.clone();
                let request = request.clone();
                async move { shard.update_workflow_execution(request).await }
            },
            EngineError::is_retryable,
        )
        .await;

        if let Err(err) = result {
            self.clear();
            return Err(err);
        }

        self.update_condition = next_event_id;
        if let Some(builder) = self.ms_builder.as_mut() {
            builder.touch();
        }
        Ok(())
    }
}
