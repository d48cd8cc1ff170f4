// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! History engine facade.
//!
//! One engine per owned shard. Every mutation runs the same sequence: look
//! up the execution context in the cache, take its mutex, load mutable
//! state, apply the operation, and drive the two-phase update. A conflict
//! invalidates the cached state and the whole sequence is retried from a
//! fresh load, bounded by the conditional retry count.

use std::sync::Arc;

use chrono::{TimeDelta, Utc};
use parking_lot::Mutex;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::{info, instrument};
use uuid::Uuid;
use windlass_api::{
    Decision, GetWorkflowExecutionNextEventIdRequest, GetWorkflowExecutionNextEventIdResponse,
    RecordActivityTaskHeartbeatRequest, RecordActivityTaskHeartbeatResponse,
    RecordActivityTaskStartedRequest, RecordActivityTaskStartedResponse,
    RecordDecisionTaskStartedRequest, RecordDecisionTaskStartedResponse,
    RequestCancelWorkflowExecutionRequest, RespondActivityTaskCanceledRequest,
    RespondActivityTaskCompletedRequest, RespondActivityTaskFailedRequest,
    RespondDecisionTaskCompletedRequest, SignalWorkflowExecutionRequest,
    StartWorkflowExecutionRequest, StartWorkflowExecutionResponse,
    TerminateWorkflowExecutionRequest, events,
};
use windlass_api::{TimeoutType, WorkflowExecution};
use windlass_persistence::{
    AppendHistoryEventsRequest, ContinueAsNewExecution, CreateWorkflowExecutionRequest,
    ExecutionStore, TimerTask, TimerTaskKind, TransferTask, TransferTaskKind,
    WorkflowExecutionInfo,
};

use crate::client::{MatchingClient, VisibilityClient};
use crate::config::Config;
use crate::error::{EngineError, Result};
use crate::execution::ExecutionCache;
use crate::execution::mutable_state::MutableStateBuilder;
use crate::metrics::{EngineMetrics, incr};
use crate::queue::{timer::TimerQueueProcessor, transfer::TransferQueueProcessor};
use crate::shard::{CONDITIONAL_RETRY_COUNT, ShardContext};

/// Tasks produced by one mutation, enqueued with the row update.
struct PostUpdateActions {
    transfer_tasks: Vec<TransferTask>,
    timer_tasks: Vec<TimerTask>,
}

impl PostUpdateActions {
    fn none() -> Self {
        Self {
            transfer_tasks: Vec::new(),
            timer_tasks: Vec::new(),
        }
    }
}

fn decision_transfer_task(info: &WorkflowExecutionInfo, schedule_id: i64) -> TransferTask {
    TransferTask {
        task_id: 0,
        domain_id: info.domain_id.clone(),
        workflow_id: info.workflow_id.clone(),
        run_id: info.run_id.clone(),
        kind: TransferTaskKind::DecisionTask {
            task_list: info.task_list.clone(),
            schedule_id,
        },
    }
}

fn activity_transfer_task(
    info: &WorkflowExecutionInfo,
    task_list: &str,
    schedule_id: i64,
) -> TransferTask {
    TransferTask {
        task_id: 0,
        domain_id: info.domain_id.clone(),
        workflow_id: info.workflow_id.clone(),
        run_id: info.run_id.clone(),
        kind: TransferTaskKind::ActivityTask {
            task_list: task_list.to_string(),
            schedule_id,
        },
    }
}

fn close_transfer_task(info: &WorkflowExecutionInfo) -> TransferTask {
    TransferTask {
        task_id: 0,
        domain_id: info.domain_id.clone(),
        workflow_id: info.workflow_id.clone(),
        run_id: info.run_id.clone(),
        kind: TransferTaskKind::CloseExecution,
    }
}

fn require(condition: bool, field: &str) -> Result<()> {
    if condition {
        Ok(())
    } else {
        Err(EngineError::BadRequest(format!("{field} is required")))
    }
}

/// The engine for one shard.
pub struct HistoryEngine {
    pub(crate) shard: Arc<ShardContext>,
    pub(crate) config: Arc<Config>,
    pub(crate) execution_store: Arc<dyn ExecutionStore>,
    pub(crate) cache: ExecutionCache,
    pub(crate) matching: Arc<dyn MatchingClient>,
    pub(crate) visibility: Arc<dyn VisibilityClient>,
    pub(crate) metrics: Arc<EngineMetrics>,
    pub(crate) transfer_notify: Notify,
    pub(crate) timer_notify: Notify,
    shutdown_tx: watch::Sender<bool>,
    processor_handles: Mutex<Vec<JoinHandle<()>>>,
}

impl HistoryEngine {
    /// Build an engine over an acquired shard. Call [`Self::start`] to run
    /// its queue processors.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        shard: Arc<ShardContext>,
        config: Arc<Config>,
        execution_store: Arc<dyn ExecutionStore>,
        matching: Arc<dyn MatchingClient>,
        visibility: Arc<dyn VisibilityClient>,
        metrics: Arc<EngineMetrics>,
    ) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            cache: ExecutionCache::new(config.clone()),
            shard,
            config,
            execution_store,
            matching,
            visibility,
            metrics,
            transfer_notify: Notify::new(),
            timer_notify: Notify::new(),
            shutdown_tx,
            processor_handles: Mutex::new(Vec::new()),
        })
    }

    /// Shard this engine serves.
    pub fn shard(&self) -> &Arc<ShardContext> {
        &self.shard
    }

    /// Start the transfer and timer queue processors.
    pub fn start(self: &Arc<Self>) {
        let mut handles = self.processor_handles.lock();
        if !handles.is_empty() {
            return;
        }
        let transfer =
            TransferQueueProcessor::new(self.clone(), self.shutdown_tx.subscribe());
        let timer = TimerQueueProcessor::new(self.clone(), self.shutdown_tx.subscribe());
        handles.push(tokio::spawn(transfer.run()));
        handles.push(tokio::spawn(timer.run()));
        info!(shard_id = self.shard.shard_id(), "history engine started");
    }

    /// Stop the queue processors and evict the execution cache.
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        let handles: Vec<JoinHandle<()>> = self.processor_handles.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
        self.cache.clear();
        info!(shard_id = self.shard.shard_id(), "history engine stopped");
    }

    async fn resolve_execution(
        &self,
        domain_id: &str,
        workflow_id: &str,
        run_id: Option<&str>,
    ) -> Result<WorkflowExecution> {
        match run_id {
            Some(run_id) if !run_id.is_empty() => {
                Ok(WorkflowExecution::new(workflow_id, run_id))
            }
            _ => {
                let current = self
                    .execution_store
                    .get_current_run_id(domain_id, workflow_id)
                    .await?;
                Ok(WorkflowExecution::new(workflow_id, current))
            }
        }
    }

    /// Load → mutate → persist with bounded conflict retries.
    ///
    /// The action returns the tasks to enqueue, or `None` to skip the
    /// persistence round-trip entirely (it must not mutate in that case).
    async fn update_workflow_execution_with_action<F>(
        &self,
        domain_id: &str,
        execution: &WorkflowExecution,
        mut action: F,
    ) -> Result<()>
    where
        F: FnMut(&mut MutableStateBuilder) -> Result<Option<PostUpdateActions>>,
    {
        for _attempt in 0..CONDITIONAL_RETRY_COUNT {
            let context_arc =
                self.cache
                    .get_or_create(domain_id, execution, &self.shard, &self.execution_store);
            let mut context = context_arc.lock().await;
            context.load().await?;

            let actions = {
                let builder = context.mutable_state()?;
                if !builder.is_running() {
                    return Err(EngineError::NotFound(
                        "workflow execution already completed".into(),
                    ));
                }
                match action(builder) {
                    Ok(Some(actions)) => actions,
                    Ok(None) => return Ok(()),
                    Err(err) => {
                        context.clear();
                        return Err(err);
                    }
                }
            };

            let transaction_id = self.shard.next_transfer_task_id().await?;
            let had_transfer = !actions.transfer_tasks.is_empty();
            let had_timer = !actions.timer_tasks.is_empty();
            match context
                .update_workflow_execution(actions.transfer_tasks, actions.timer_tasks, transaction_id)
                .await
            {
                Ok(()) => {
                    if had_transfer {
                        self.transfer_notify.notify_one();
                    }
                    if had_timer {
                        self.timer_notify.notify_one();
                    }
                    return Ok(());
                }
                Err(EngineError::Conflict) => {
                    incr(&self.metrics.update_conflicts);
                    continue;
                }
                Err(err) => {
                    if matches!(err, EngineError::ShardOwnershipLost { .. }) {
                        incr(&self.metrics.ownership_lost);
                    }
                    return Err(err);
                }
            }
        }
        Err(EngineError::MaxAttemptsExceeded)
    }

    /// Start a new workflow execution.
    ///
    /// A retried start carrying the request id of the existing open run
    /// returns that run instead of failing.
    #[instrument(skip(self, request), fields(workflow_id = %request.workflow_id))]
    pub async fn start_workflow_execution(
        &self,
        request: StartWorkflowExecutionRequest,
    ) -> Result<StartWorkflowExecutionResponse> {
        require(!request.domain_id.is_empty(), "domain_id")?;
        require(!request.workflow_id.is_empty(), "workflow_id")?;
        require(!request.workflow_type.is_empty(), "workflow_type")?;
        require(!request.task_list.is_empty(), "task_list")?;
        require(!request.request_id.is_empty(), "request_id")?;
        require(
            request.execution_start_to_close_timeout_seconds > 0,
            "execution_start_to_close_timeout_seconds",
        )?;
        require(
            request.task_start_to_close_timeout_seconds > 0,
            "task_start_to_close_timeout_seconds",
        )?;

        let run_id = Uuid::new_v4().to_string();
        let mut builder = MutableStateBuilder::new(self.config.clone());
        builder.add_workflow_execution_started_event(&run_id, &request, None);
        let decision_schedule_id = builder.schedule_decision_task().ok_or_else(|| {
            EngineError::Fatal("fresh run failed to schedule its first decision".into())
        })?;

        let updates = builder.close_update_session();
        let data = events::serialize_event_batch(&updates.new_events)
            .map_err(|err| EngineError::Fatal(format!("history batch serialization failed: {err}")))?;

        // First batch goes in with transaction id 0: the run id is fresh, so
        // there is no duplicate to resolve.
        self.shard
            .append_history_events(AppendHistoryEventsRequest {
                shard_id: self.shard.shard_id(),
                range_id: 0,
                domain_id: request.domain_id.clone(),
                workflow_id: request.workflow_id.clone(),
                run_id: run_id.clone(),
                first_event_id: 1,
                transaction_id: 0,
                events: data,
                overwrite: false,
            })
            .await?;

        let info = builder.execution_info().clone();
        let create = CreateWorkflowExecutionRequest {
            shard_id: self.shard.shard_id(),
            range_id: 0,
            transfer_tasks: vec![decision_transfer_task(&info, decision_schedule_id)],
            timer_tasks: Vec::new(),
            execution_info: info,
        };
        match self.shard.create_workflow_execution(create).await {
            Ok(()) => {
                self.transfer_notify.notify_one();
                info!(run_id = %run_id, "workflow execution started");
                Ok(StartWorkflowExecutionResponse { run_id })
            }
            Err(EngineError::WorkflowExecutionAlreadyStarted {
                start_request_id,
                run_id: existing_run_id,
            }) => {
                if start_request_id == request.request_id {
                    // Same start retried; hand back the run it already made.
                    Ok(StartWorkflowExecutionResponse {
                        run_id: existing_run_id,
                    })
                } else {
                    Err(EngineError::WorkflowExecutionAlreadyStarted {
                        start_request_id,
                        run_id: existing_run_id,
                    })
                }
            }
            Err(err) => Err(err),
        }
    }

    /// Current run id and next event id of a workflow.
    #[instrument(skip(self, request), fields(workflow_id = %request.workflow_id))]
    pub async fn get_workflow_execution_next_event_id(
        &self,
        request: GetWorkflowExecutionNextEventIdRequest,
    ) -> Result<GetWorkflowExecutionNextEventIdResponse> {
        let execution = self
            .resolve_execution(
                &request.domain_id,
                &request.workflow_id,
                request.run_id.as_deref(),
            )
            .await?;
        let context_arc = self.cache.get_or_create(
            &request.domain_id,
            &execution,
            &self.shard,
            &self.execution_store,
        );
        let mut context = context_arc.lock().await;
        context.load().await?;
        let builder = context.mutable_state()?;
        Ok(GetWorkflowExecutionNextEventIdResponse {
            run_id: execution.run_id.clone(),
            next_event_id: builder.next_event_id(),
            task_list: builder.execution_info().task_list.clone(),
        })
    }

    /// Record that a poller started the pending decision task.
    #[instrument(skip(self, request), fields(workflow_id = %request.execution.workflow_id, schedule_id = request.schedule_id))]
    pub async fn record_decision_task_started(
        &self,
        request: RecordDecisionTaskStartedRequest,
    ) -> Result<RecordDecisionTaskStartedResponse> {
        let mut response = None;
        self.update_workflow_execution_with_action(
            &request.domain_id,
            &request.execution,
            |builder| {
                let workflow_type = builder.execution_info().workflow_type.clone();
                let previous_started_event_id = builder.execution_info().last_processed_event_id;
                let timeout_seconds =
                    builder.execution_info().task_start_to_close_timeout_seconds;
                let started_event_id =
                    builder.add_decision_task_started(request.schedule_id, &request.request_id)?;
                response = Some(RecordDecisionTaskStartedResponse {
                    workflow_type,
                    previous_started_event_id,
                    started_event_id,
                    next_event_id: builder.next_event_id(),
                });
                let info = builder.execution_info();
                Ok(Some(PostUpdateActions {
                    transfer_tasks: Vec::new(),
                    timer_tasks: vec![TimerTask {
                        task_id: 0,
                        visibility_time: Utc::now() + TimeDelta::seconds(i64::from(timeout_seconds)),
                        domain_id: info.domain_id.clone(),
                        workflow_id: info.workflow_id.clone(),
                        run_id: info.run_id.clone(),
                        kind: TimerTaskKind::DecisionTimeout {
                            schedule_id: request.schedule_id,
                        },
                    }],
                }))
            },
        )
        .await?;
        response.ok_or_else(|| EngineError::Fatal("decision start produced no response".into()))
    }

    /// Complete the started decision task and apply its decisions.
    #[instrument(skip(self, request), fields(workflow_id = %request.execution.workflow_id, schedule_id = request.schedule_id))]
    pub async fn respond_decision_task_completed(
        &self,
        request: RespondDecisionTaskCompletedRequest,
    ) -> Result<()> {
        for _attempt in 0..CONDITIONAL_RETRY_COUNT {
            let context_arc = self.cache.get_or_create(
                &request.domain_id,
                &request.execution,
                &self.shard,
                &self.execution_store,
            );
            let mut context = context_arc.lock().await;
            context.load().await?;

            let mut transfer_tasks = Vec::new();
            let mut timer_tasks = Vec::new();
            let mut continue_as_new: Option<(Vec<u8>, ContinueAsNewExecution)> = None;

            let apply = (|| -> Result<()> {
                let builder = context.mutable_state()?;
                if !builder.is_running() {
                    return Err(EngineError::NotFound(
                        "workflow execution already completed".into(),
                    ));
                }
                let completed_event_id = builder.add_decision_task_completed_event(
                    request.schedule_id,
                    &request.identity,
                    request.execution_context.clone(),
                )?;

                for decision in &request.decisions {
                    if !builder.is_running() {
                        return Err(EngineError::BadRequest(
                            "decision follows a workflow-closing decision".into(),
                        ));
                    }
                    match decision {
                        Decision::ScheduleActivityTask {
                            activity_id,
                            activity_type,
                            task_list,
                            input,
                            schedule_to_close_timeout_seconds,
                            schedule_to_start_timeout_seconds,
                            start_to_close_timeout_seconds,
                            heartbeat_timeout_seconds,
                        } => {
                            let (schedule_id, activity) = builder
                                .add_activity_task_scheduled_event(
                                    completed_event_id,
                                    activity_id,
                                    activity_type,
                                    task_list,
                                    input.clone(),
                                    *schedule_to_close_timeout_seconds,
                                    *schedule_to_start_timeout_seconds,
                                    *start_to_close_timeout_seconds,
                                    *heartbeat_timeout_seconds,
                                )?;
                            let info = builder.execution_info();
                            transfer_tasks.push(activity_transfer_task(
                                info,
                                task_list,
                                schedule_id,
                            ));
                            timer_tasks.push(TimerTask {
                                task_id: 0,
                                visibility_time: activity.scheduled_time
                                    + TimeDelta::seconds(i64::from(
                                        activity.schedule_to_close_timeout_seconds,
                                    )),
                                domain_id: info.domain_id.clone(),
                                workflow_id: info.workflow_id.clone(),
                                run_id: info.run_id.clone(),
                                kind: TimerTaskKind::ActivityTimeout {
                                    timeout_type: TimeoutType::ScheduleToClose,
                                    schedule_id,
                                },
                            });
                        }
                        Decision::StartTimer {
                            timer_id,
                            start_to_fire_timeout_seconds,
                        } => {
                            let (_, timer) = builder.add_timer_started_event(
                                completed_event_id,
                                timer_id,
                                *start_to_fire_timeout_seconds,
                            )?;
                            let info = builder.execution_info();
                            timer_tasks.push(TimerTask {
                                task_id: 0,
                                visibility_time: timer.expiry,
                                domain_id: info.domain_id.clone(),
                                workflow_id: info.workflow_id.clone(),
                                run_id: info.run_id.clone(),
                                kind: TimerTaskKind::UserTimer {
                                    timer_id: timer_id.clone(),
                                },
                            });
                        }
                        Decision::CancelTimer { timer_id } => {
                            builder.add_timer_canceled_event(completed_event_id, timer_id)?;
                        }
                        Decision::CompleteWorkflowExecution { result } => {
                            builder.add_workflow_execution_completed_event(
                                completed_event_id,
                                result.clone(),
                            );
                            transfer_tasks.push(close_transfer_task(builder.execution_info()));
                        }
                        Decision::FailWorkflowExecution { reason, details } => {
                            builder.add_workflow_execution_failed_event(
                                completed_event_id,
                                reason,
                                details.clone(),
                            );
                            transfer_tasks.push(close_transfer_task(builder.execution_info()));
                        }
                        Decision::ContinueAsNewWorkflowExecution {
                            workflow_type,
                            task_list,
                            input,
                            execution_start_to_close_timeout_seconds,
                            task_start_to_close_timeout_seconds,
                        } => {
                            let new_run_id = Uuid::new_v4().to_string();
                            let (mut new_builder, new_decision_schedule_id) = builder
                                .add_continued_as_new_event(
                                    completed_event_id,
                                    &new_run_id,
                                    workflow_type,
                                    task_list,
                                    input.clone(),
                                    *execution_start_to_close_timeout_seconds,
                                    *task_start_to_close_timeout_seconds,
                                )?;
                            transfer_tasks.push(close_transfer_task(builder.execution_info()));

                            let new_updates = new_builder.close_update_session();
                            let batch = events::serialize_event_batch(&new_updates.new_events)
                                .map_err(|err| {
                                    EngineError::Fatal(format!(
                                        "history batch serialization failed: {err}"
                                    ))
                                })?;
                            let new_info = new_builder.execution_info().clone();
                            let new_run_tasks =
                                vec![decision_transfer_task(&new_info, new_decision_schedule_id)];
                            continue_as_new = Some((
                                batch,
                                ContinueAsNewExecution {
                                    execution_info: new_info,
                                    transfer_tasks: new_run_tasks,
                                    timer_tasks: Vec::new(),
                                },
                            ));
                        }
                    }
                }
                Ok(())
            })();

            if let Err(err) = apply {
                context.clear();
                return Err(err);
            }

            let transaction_id = self.shard.next_transfer_task_id().await?;
            let result = match continue_as_new {
                Some((batch, new_execution)) => {
                    context
                        .continue_as_new_workflow_execution(
                            batch,
                            new_execution,
                            transfer_tasks,
                            timer_tasks,
                            transaction_id,
                        )
                        .await
                }
                None => {
                    context
                        .update_workflow_execution(transfer_tasks, timer_tasks, transaction_id)
                        .await
                }
            };

            match result {
                Ok(()) => {
                    self.transfer_notify.notify_one();
                    self.timer_notify.notify_one();
                    return Ok(());
                }
                Err(EngineError::Conflict) => {
                    incr(&self.metrics.update_conflicts);
                    continue;
                }
                Err(err) => {
                    if matches!(err, EngineError::ShardOwnershipLost { .. }) {
                        incr(&self.metrics.ownership_lost);
                    }
                    return Err(err);
                }
            }
        }
        Err(EngineError::MaxAttemptsExceeded)
    }

    /// Record that a poller started a scheduled activity task.
    #[instrument(skip(self, request), fields(workflow_id = %request.execution.workflow_id, schedule_id = request.schedule_id))]
    pub async fn record_activity_task_started(
        &self,
        request: RecordActivityTaskStartedRequest,
    ) -> Result<RecordActivityTaskStartedResponse> {
        let mut response = None;
        self.update_workflow_execution_with_action(
            &request.domain_id,
            &request.execution,
            |builder| {
                let (started_event_id, activity) = builder.add_activity_task_started_event(
                    request.schedule_id,
                    &request.request_id,
                    &request.identity,
                )?;
                response = Some(RecordActivityTaskStartedResponse {
                    activity_type: activity.activity_type.clone(),
                    input: activity.input.clone(),
                    started_event_id,
                    start_to_close_timeout_seconds: activity.start_to_close_timeout_seconds,
                    heartbeat_timeout_seconds: activity.heartbeat_timeout_seconds,
                });
                Ok(Some(PostUpdateActions::none()))
            },
        )
        .await?;
        response.ok_or_else(|| EngineError::Fatal("activity start produced no response".into()))
    }

    /// Record activity liveness; mutable-state-only update.
    #[instrument(skip(self, request), fields(workflow_id = %request.execution.workflow_id, schedule_id = request.schedule_id))]
    pub async fn record_activity_task_heartbeat(
        &self,
        request: RecordActivityTaskHeartbeatRequest,
    ) -> Result<RecordActivityTaskHeartbeatResponse> {
        let mut cancel_requested = false;
        self.update_workflow_execution_with_action(
            &request.domain_id,
            &request.execution,
            |builder| {
                cancel_requested =
                    builder.record_activity_heartbeat(request.schedule_id, request.details.clone())?;
                Ok(Some(PostUpdateActions::none()))
            },
        )
        .await?;
        Ok(RecordActivityTaskHeartbeatResponse { cancel_requested })
    }

    /// Report successful completion of a started activity.
    #[instrument(skip(self, request), fields(workflow_id = %request.execution.workflow_id, schedule_id = request.schedule_id))]
    pub async fn respond_activity_task_completed(
        &self,
        request: RespondActivityTaskCompletedRequest,
    ) -> Result<()> {
        self.update_workflow_execution_with_action(
            &request.domain_id,
            &request.execution,
            |builder| {
                builder.add_activity_task_completed_event(
                    request.schedule_id,
                    request.result.clone(),
                    &request.identity,
                )?;
                Ok(Some(post_decision_actions(builder)))
            },
        )
        .await
    }

    /// Report failure of a started activity.
    #[instrument(skip(self, request), fields(workflow_id = %request.execution.workflow_id, schedule_id = request.schedule_id))]
    pub async fn respond_activity_task_failed(
        &self,
        request: RespondActivityTaskFailedRequest,
    ) -> Result<()> {
        self.update_workflow_execution_with_action(
            &request.domain_id,
            &request.execution,
            |builder| {
                builder.add_activity_task_failed_event(
                    request.schedule_id,
                    &request.reason,
                    request.details.clone(),
                    &request.identity,
                )?;
                Ok(Some(post_decision_actions(builder)))
            },
        )
        .await
    }

    /// Report cancellation of a started activity.
    #[instrument(skip(self, request), fields(workflow_id = %request.execution.workflow_id, schedule_id = request.schedule_id))]
    pub async fn respond_activity_task_canceled(
        &self,
        request: RespondActivityTaskCanceledRequest,
    ) -> Result<()> {
        self.update_workflow_execution_with_action(
            &request.domain_id,
            &request.execution,
            |builder| {
                builder.add_activity_task_canceled_event(
                    request.schedule_id,
                    request.details.clone(),
                    &request.identity,
                )?;
                Ok(Some(post_decision_actions(builder)))
            },
        )
        .await
    }

    /// Deliver a signal.
    #[instrument(skip(self, request), fields(workflow_id = %request.workflow_id))]
    pub async fn signal_workflow_execution(
        &self,
        request: SignalWorkflowExecutionRequest,
    ) -> Result<()> {
        require(!request.signal_name.is_empty(), "signal_name")?;
        let execution = self
            .resolve_execution(
                &request.domain_id,
                &request.workflow_id,
                request.run_id.as_deref(),
            )
            .await?;
        self.update_workflow_execution_with_action(&request.domain_id, &execution, |builder| {
            builder.add_workflow_execution_signaled_event(
                &request.signal_name,
                request.input.clone(),
                &request.identity,
            );
            Ok(Some(post_decision_actions(builder)))
        })
        .await
    }

    /// Request cooperative cancellation. Idempotent: a repeated request is
    /// acknowledged without a new event.
    #[instrument(skip(self, request), fields(workflow_id = %request.workflow_id))]
    pub async fn request_cancel_workflow_execution(
        &self,
        request: RequestCancelWorkflowExecutionRequest,
    ) -> Result<()> {
        let execution = self
            .resolve_execution(
                &request.domain_id,
                &request.workflow_id,
                request.run_id.as_deref(),
            )
            .await?;
        self.update_workflow_execution_with_action(&request.domain_id, &execution, |builder| {
            if builder
                .add_workflow_execution_cancel_requested_event(&request.identity)
                .is_none()
            {
                return Ok(None);
            }
            Ok(Some(post_decision_actions(builder)))
        })
        .await
    }

    /// Forcibly close a running workflow, bypassing its decider.
    #[instrument(skip(self, request), fields(workflow_id = %request.workflow_id))]
    pub async fn terminate_workflow_execution(
        &self,
        request: TerminateWorkflowExecutionRequest,
    ) -> Result<()> {
        let execution = self
            .resolve_execution(
                &request.domain_id,
                &request.workflow_id,
                request.run_id.as_deref(),
            )
            .await?;
        self.update_workflow_execution_with_action(&request.domain_id, &execution, |builder| {
            builder.add_workflow_execution_terminated_event(
                &request.reason,
                request.details.clone(),
                &request.identity,
            );
            Ok(Some(PostUpdateActions {
                transfer_tasks: vec![close_transfer_task(builder.execution_info())],
                timer_tasks: Vec::new(),
            }))
        })
        .await
    }

    /// Fire one timer task. Stale tasks (the referenced timer, activity, or
    /// decision is no longer pending, or the run is gone) are acknowledged
    /// without effect.
    pub(crate) async fn process_timer_task(&self, task: &TimerTask) -> Result<()> {
        let execution = WorkflowExecution::new(task.workflow_id.clone(), task.run_id.clone());
        let result = match &task.kind {
            TimerTaskKind::UserTimer { timer_id } => {
                self.update_workflow_execution_with_action(&task.domain_id, &execution, |builder| {
                    if builder.pending_timer(timer_id).is_none() {
                        return Ok(None);
                    }
                    builder.add_timer_fired_event(timer_id)?;
                    Ok(Some(post_decision_actions(builder)))
                })
                .await
            }
            TimerTaskKind::ActivityTimeout {
                timeout_type,
                schedule_id,
            } => {
                let timeout_type = *timeout_type;
                let schedule_id = *schedule_id;
                self.update_workflow_execution_with_action(&task.domain_id, &execution, |builder| {
                    if builder.pending_activity(schedule_id).is_none() {
                        return Ok(None);
                    }
                    builder.add_activity_task_timed_out_event(schedule_id, timeout_type)?;
                    Ok(Some(post_decision_actions(builder)))
                })
                .await
            }
            TimerTaskKind::DecisionTimeout { schedule_id } => {
                let schedule_id = *schedule_id;
                self.update_workflow_execution_with_action(&task.domain_id, &execution, |builder| {
                    let info = builder.execution_info();
                    if info.decision_schedule_id != schedule_id
                        || info.decision_started_id == windlass_persistence::EMPTY_EVENT_ID
                    {
                        return Ok(None);
                    }
                    builder.add_decision_task_timed_out_event(schedule_id)?;
                    Ok(Some(post_decision_actions(builder)))
                })
                .await
            }
        };

        match result {
            // The run is closed or gone; the timer is obsolete.
            Err(EngineError::NotFound(_)) => Ok(()),
            other => other,
        }
    }
}

/// Schedule a decision if none is pending and return the matching tasks.
fn post_decision_actions(builder: &mut MutableStateBuilder) -> PostUpdateActions {
    let mut actions = PostUpdateActions::none();
    if builder.is_running()
        && let Some(schedule_id) = builder.schedule_decision_task()
    {
        actions
            .transfer_tasks
            .push(decision_transfer_task(builder.execution_info(), schedule_id));
    }
    actions
}
