// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory mutable state of one workflow execution.
//!
//! The builder is the authoritative state between loads. High-level
//! operations append to an in-progress event batch and mutate the pending
//! maps; [`MutableStateBuilder::close_update_session`] drains everything
//! accumulated since the last close into one [`SessionUpdates`] diff for
//! persistence. `next_event_id` advances by exactly the number of events
//! appended in the session.
//!
//! Decision tasks never materialize scheduled/started events: the pending
//! decision is a synthetic `(schedule_id, started_id)` pair in the
//! execution record, drawn from the event-id counter. Only completion and
//! timeout reach history.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{TimeDelta, Utc};
use uuid::Uuid;
use windlass_api::events::{EventAttributes, HistoryEvent, TimeoutType};
use windlass_api::{CloseStatus, StartWorkflowExecutionRequest, WorkflowState};
use windlass_persistence::{
    ActivityInfo, ChildExecutionInfo, EMPTY_EVENT_ID, TimerInfo, WorkflowExecutionInfo,
    WorkflowMutableState,
};

use crate::config::Config;
use crate::error::{EngineError, Result};

/// Everything one session changed, drained by
/// [`MutableStateBuilder::close_update_session`].
#[derive(Debug, Default)]
pub struct SessionUpdates {
    /// Events appended this session, in order.
    pub new_events: Vec<HistoryEvent>,
    /// Pending activities inserted or replaced.
    pub upsert_activity_infos: Vec<ActivityInfo>,
    /// Pending activity removed.
    pub delete_activity_info: Option<i64>,
    /// Pending timers inserted or replaced.
    pub upsert_timer_infos: Vec<TimerInfo>,
    /// Pending timers removed.
    pub delete_timer_infos: Vec<String>,
    /// Pending children inserted or replaced.
    pub upsert_child_execution_infos: Vec<ChildExecutionInfo>,
    /// Pending child removed.
    pub delete_child_execution_info: Option<i64>,
}

fn blank_execution_info() -> WorkflowExecutionInfo {
    WorkflowExecutionInfo {
        domain_id: String::new(),
        workflow_id: String::new(),
        run_id: String::new(),
        workflow_type: String::new(),
        task_list: String::new(),
        input: None,
        execution_start_to_close_timeout_seconds: 0,
        task_start_to_close_timeout_seconds: 0,
        state: WorkflowState::Created,
        close_status: CloseStatus::None,
        next_event_id: 1,
        last_processed_event_id: EMPTY_EVENT_ID,
        start_request_id: String::new(),
        cancel_requested: false,
        execution_context: None,
        decision_schedule_id: EMPTY_EVENT_ID,
        decision_started_id: EMPTY_EVENT_ID,
        decision_request_id: String::new(),
        continued_from_run_id: None,
        start_time: Utc::now(),
        last_updated: Utc::now(),
    }
}

/// Builder over one execution's mutable state.
pub struct MutableStateBuilder {
    config: Arc<Config>,
    execution_info: WorkflowExecutionInfo,
    pending_activities: HashMap<i64, ActivityInfo>,
    pending_timers: HashMap<String, TimerInfo>,
    pending_children: HashMap<i64, ChildExecutionInfo>,

    new_events: Vec<HistoryEvent>,
    activity_upserts: BTreeMap<i64, ActivityInfo>,
    activity_delete: Option<i64>,
    timer_upserts: BTreeMap<String, TimerInfo>,
    timer_deletes: BTreeSet<String>,
    child_upserts: BTreeMap<i64, ChildExecutionInfo>,
    child_delete: Option<i64>,
}

impl MutableStateBuilder {
    /// Empty builder; populate with [`Self::load`] or
    /// [`Self::add_workflow_execution_started_event`].
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            config,
            execution_info: blank_execution_info(),
            pending_activities: HashMap::new(),
            pending_timers: HashMap::new(),
            pending_children: HashMap::new(),
            new_events: Vec::new(),
            activity_upserts: BTreeMap::new(),
            activity_delete: None,
            timer_upserts: BTreeMap::new(),
            timer_deletes: BTreeSet::new(),
            child_upserts: BTreeMap::new(),
            child_delete: None,
        }
    }

    /// Replace state from a persisted load.
    pub fn load(&mut self, state: WorkflowMutableState) {
        self.execution_info = state.execution_info;
        self.pending_activities = state.activity_infos;
        self.pending_timers = state.timer_infos;
        self.pending_children = state.child_execution_infos;
    }

    /// Execution record as currently built.
    pub fn execution_info(&self) -> &WorkflowExecutionInfo {
        &self.execution_info
    }

    /// Next history event id.
    pub fn next_event_id(&self) -> i64 {
        self.execution_info.next_event_id
    }

    /// True while the execution is open.
    pub fn is_running(&self) -> bool {
        self.execution_info.state != WorkflowState::Completed
    }

    /// True while a decision task is scheduled or started.
    pub fn has_pending_decision(&self) -> bool {
        self.execution_info.decision_schedule_id != EMPTY_EVENT_ID
    }

    /// Pending activity by scheduled event id.
    pub fn pending_activity(&self, schedule_id: i64) -> Option<&ActivityInfo> {
        self.pending_activities.get(&schedule_id)
    }

    /// Pending timer by timer id.
    pub fn pending_timer(&self, timer_id: &str) -> Option<&TimerInfo> {
        self.pending_timers.get(timer_id)
    }

    /// Stamp the last successful row update.
    pub(crate) fn touch(&mut self) {
        self.execution_info.last_updated = Utc::now();
    }

    fn add_event(&mut self, attributes: EventAttributes) -> i64 {
        let event_id = self.execution_info.next_event_id;
        self.execution_info.next_event_id += 1;
        self.new_events.push(HistoryEvent {
            event_id,
            timestamp: Utc::now(),
            attributes,
        });
        event_id
    }

    fn upsert_activity(&mut self, activity: ActivityInfo) {
        self.pending_activities
            .insert(activity.schedule_id, activity.clone());
        self.activity_upserts.insert(activity.schedule_id, activity);
    }

    fn upsert_timer(&mut self, timer: TimerInfo) {
        self.pending_timers
            .insert(timer.timer_id.clone(), timer.clone());
        self.timer_upserts.insert(timer.timer_id.clone(), timer);
    }

    // ========================================================================
    // Workflow lifecycle
    // ========================================================================

    /// First event of a run; populates the execution record.
    pub fn add_workflow_execution_started_event(
        &mut self,
        run_id: &str,
        request: &StartWorkflowExecutionRequest,
        continued_from_run_id: Option<String>,
    ) -> i64 {
        self.execution_info = WorkflowExecutionInfo {
            domain_id: request.domain_id.clone(),
            workflow_id: request.workflow_id.clone(),
            run_id: run_id.to_string(),
            workflow_type: request.workflow_type.clone(),
            task_list: request.task_list.clone(),
            input: request.input.clone(),
            execution_start_to_close_timeout_seconds: request
                .execution_start_to_close_timeout_seconds,
            task_start_to_close_timeout_seconds: request.task_start_to_close_timeout_seconds,
            start_request_id: request.request_id.clone(),
            continued_from_run_id: continued_from_run_id.clone(),
            ..blank_execution_info()
        };
        self.add_event(EventAttributes::WorkflowExecutionStarted {
            workflow_type: request.workflow_type.clone(),
            task_list: request.task_list.clone(),
            input: request.input.clone(),
            execution_start_to_close_timeout_seconds: request
                .execution_start_to_close_timeout_seconds,
            task_start_to_close_timeout_seconds: request.task_start_to_close_timeout_seconds,
            continued_from_run_id,
        })
    }

    /// Signal delivery.
    pub fn add_workflow_execution_signaled_event(
        &mut self,
        signal_name: &str,
        input: Option<Vec<u8>>,
        identity: &str,
    ) -> i64 {
        self.add_event(EventAttributes::WorkflowExecutionSignaled {
            signal_name: signal_name.to_string(),
            input,
            identity: identity.to_string(),
        })
    }

    /// Record a cancellation request; `None` when one is already recorded.
    pub fn add_workflow_execution_cancel_requested_event(
        &mut self,
        identity: &str,
    ) -> Option<i64> {
        if self.execution_info.cancel_requested {
            return None;
        }
        self.execution_info.cancel_requested = true;
        Some(self.add_event(EventAttributes::WorkflowExecutionCancelRequested {
            identity: identity.to_string(),
        }))
    }

    /// Close the run successfully.
    pub fn add_workflow_execution_completed_event(
        &mut self,
        decision_completed_event_id: i64,
        result: Option<Vec<u8>>,
    ) -> i64 {
        self.execution_info.state = WorkflowState::Completed;
        self.execution_info.close_status = CloseStatus::Completed;
        self.add_event(EventAttributes::WorkflowExecutionCompleted {
            result,
            decision_completed_event_id,
        })
    }

    /// Close the run as failed.
    pub fn add_workflow_execution_failed_event(
        &mut self,
        decision_completed_event_id: i64,
        reason: &str,
        details: Option<Vec<u8>>,
    ) -> i64 {
        self.execution_info.state = WorkflowState::Completed;
        self.execution_info.close_status = CloseStatus::Failed;
        self.add_event(EventAttributes::WorkflowExecutionFailed {
            reason: reason.to_string(),
            details,
            decision_completed_event_id,
        })
    }

    /// Close the run by operator termination.
    pub fn add_workflow_execution_terminated_event(
        &mut self,
        reason: &str,
        details: Option<Vec<u8>>,
        identity: &str,
    ) -> i64 {
        self.execution_info.state = WorkflowState::Completed;
        self.execution_info.close_status = CloseStatus::Terminated;
        self.add_event(EventAttributes::WorkflowExecutionTerminated {
            reason: reason.to_string(),
            details,
            identity: identity.to_string(),
        })
    }

    /// Close this run in favor of a fresh one and return the new run's
    /// builder, already holding its started event and a scheduled decision.
    #[allow(clippy::too_many_arguments)]
    pub fn add_continued_as_new_event(
        &mut self,
        decision_completed_event_id: i64,
        new_run_id: &str,
        workflow_type: &str,
        task_list: &str,
        input: Option<Vec<u8>>,
        execution_start_to_close_timeout_seconds: i32,
        task_start_to_close_timeout_seconds: i32,
    ) -> Result<(MutableStateBuilder, i64)> {
        self.execution_info.state = WorkflowState::Completed;
        self.execution_info.close_status = CloseStatus::ContinuedAsNew;
        self.add_event(EventAttributes::WorkflowExecutionContinuedAsNew {
            new_run_id: new_run_id.to_string(),
            workflow_type: workflow_type.to_string(),
            task_list: task_list.to_string(),
            input: input.clone(),
            execution_start_to_close_timeout_seconds,
            task_start_to_close_timeout_seconds,
            decision_completed_event_id,
        });

        let start_request = StartWorkflowExecutionRequest {
            domain_id: self.execution_info.domain_id.clone(),
            workflow_id: self.execution_info.workflow_id.clone(),
            workflow_type: workflow_type.to_string(),
            task_list: task_list.to_string(),
            input,
            execution_start_to_close_timeout_seconds,
            task_start_to_close_timeout_seconds,
            request_id: Uuid::new_v4().to_string(),
        };
        let mut new_builder = MutableStateBuilder::new(self.config.clone());
        new_builder.add_workflow_execution_started_event(
            new_run_id,
            &start_request,
            Some(self.execution_info.run_id.clone()),
        );
        let new_decision_schedule_id = new_builder.schedule_decision_task().ok_or_else(|| {
            EngineError::Fatal("fresh run failed to schedule its first decision".into())
        })?;
        Ok((new_builder, new_decision_schedule_id))
    }

    // ========================================================================
    // Decision tasks
    // ========================================================================

    /// Schedule a decision task; `None` when one is already pending.
    ///
    /// No event is appended; the schedule id is drawn from the event-id
    /// counter and tracked in the execution record.
    pub fn schedule_decision_task(&mut self) -> Option<i64> {
        if self.has_pending_decision() {
            return None;
        }
        let schedule_id = self.execution_info.next_event_id;
        self.execution_info.decision_schedule_id = schedule_id;
        self.execution_info.decision_started_id = EMPTY_EVENT_ID;
        self.execution_info.decision_request_id = String::new();
        Some(schedule_id)
    }

    /// Mark the pending decision started; mutable-state-only update.
    ///
    /// A replay with the same poller `request_id` returns the existing
    /// started id. A second distinct start fails.
    pub fn add_decision_task_started(&mut self, schedule_id: i64, request_id: &str) -> Result<i64> {
        if self.execution_info.decision_schedule_id != schedule_id {
            return Err(EngineError::NotFound(format!(
                "no pending decision with schedule id {schedule_id}"
            )));
        }
        if self.execution_info.decision_started_id != EMPTY_EVENT_ID {
            if self.execution_info.decision_request_id == request_id {
                return Ok(self.execution_info.decision_started_id);
            }
            return Err(EngineError::InvalidState(format!(
                "decision {schedule_id} already started"
            )));
        }
        let started_id = self.execution_info.next_event_id;
        self.execution_info.decision_started_id = started_id;
        self.execution_info.decision_request_id = request_id.to_string();
        self.execution_info.state = WorkflowState::Running;
        Ok(started_id)
    }

    /// Complete the started decision.
    pub fn add_decision_task_completed_event(
        &mut self,
        schedule_id: i64,
        identity: &str,
        execution_context: Option<Vec<u8>>,
    ) -> Result<i64> {
        if self.execution_info.decision_schedule_id != schedule_id {
            return Err(EngineError::NotFound(format!(
                "no pending decision with schedule id {schedule_id}"
            )));
        }
        let started_id = self.execution_info.decision_started_id;
        if started_id == EMPTY_EVENT_ID {
            return Err(EngineError::InvalidState(format!(
                "decision {schedule_id} not started"
            )));
        }
        let event_id = self.add_event(EventAttributes::DecisionTaskCompleted {
            scheduled_id: schedule_id,
            started_id,
            identity: identity.to_string(),
            execution_context: execution_context.clone(),
        });
        self.execution_info.last_processed_event_id = started_id;
        self.execution_info.execution_context = execution_context;
        self.execution_info.decision_schedule_id = EMPTY_EVENT_ID;
        self.execution_info.decision_started_id = EMPTY_EVENT_ID;
        self.execution_info.decision_request_id = String::new();
        Ok(event_id)
    }

    /// Time out the started decision.
    pub fn add_decision_task_timed_out_event(&mut self, schedule_id: i64) -> Result<i64> {
        if self.execution_info.decision_schedule_id != schedule_id
            || self.execution_info.decision_started_id == EMPTY_EVENT_ID
        {
            return Err(EngineError::NotFound(format!(
                "no started decision with schedule id {schedule_id}"
            )));
        }
        let event_id = self.add_event(EventAttributes::DecisionTaskTimedOut {
            scheduled_id: schedule_id,
            started_id: self.execution_info.decision_started_id,
        });
        self.execution_info.decision_schedule_id = EMPTY_EVENT_ID;
        self.execution_info.decision_started_id = EMPTY_EVENT_ID;
        self.execution_info.decision_request_id = String::new();
        Ok(event_id)
    }

    // ========================================================================
    // Activities
    // ========================================================================

    /// Schedule an activity; the scheduled event id keys the pending map.
    #[allow(clippy::too_many_arguments)]
    pub fn add_activity_task_scheduled_event(
        &mut self,
        decision_completed_event_id: i64,
        activity_id: &str,
        activity_type: &str,
        task_list: &str,
        input: Option<Vec<u8>>,
        schedule_to_close_timeout_seconds: i32,
        schedule_to_start_timeout_seconds: i32,
        start_to_close_timeout_seconds: i32,
        heartbeat_timeout_seconds: i32,
    ) -> Result<(i64, ActivityInfo)> {
        let schedule_to_close = if schedule_to_close_timeout_seconds > 0 {
            schedule_to_close_timeout_seconds
        } else {
            self.config.default_activity_schedule_to_close_timeout_seconds
        };
        let schedule_to_start = if schedule_to_start_timeout_seconds > 0 {
            schedule_to_start_timeout_seconds
        } else {
            self.config.default_activity_schedule_to_start_timeout_seconds
        };
        let start_to_close = if start_to_close_timeout_seconds > 0 {
            start_to_close_timeout_seconds
        } else {
            self.config.default_activity_start_to_close_timeout_seconds
        };

        let event_id = self.add_event(EventAttributes::ActivityTaskScheduled {
            activity_id: activity_id.to_string(),
            activity_type: activity_type.to_string(),
            task_list: task_list.to_string(),
            input: input.clone(),
            schedule_to_close_timeout_seconds: schedule_to_close,
            schedule_to_start_timeout_seconds: schedule_to_start,
            start_to_close_timeout_seconds: start_to_close,
            heartbeat_timeout_seconds,
            decision_completed_event_id,
        });
        let activity = ActivityInfo {
            schedule_id: event_id,
            started_id: EMPTY_EVENT_ID,
            activity_id: activity_id.to_string(),
            activity_type: activity_type.to_string(),
            task_list: task_list.to_string(),
            input,
            request_id: String::new(),
            details: None,
            schedule_to_close_timeout_seconds: schedule_to_close,
            schedule_to_start_timeout_seconds: schedule_to_start,
            start_to_close_timeout_seconds: start_to_close,
            heartbeat_timeout_seconds,
            cancel_requested: false,
            scheduled_time: Utc::now(),
            started_time: None,
            last_heartbeat: None,
        };
        self.upsert_activity(activity.clone());
        Ok((event_id, activity))
    }

    /// Mark a scheduled activity started. A replay with the same poller
    /// `request_id` returns the existing started event.
    pub fn add_activity_task_started_event(
        &mut self,
        schedule_id: i64,
        request_id: &str,
        identity: &str,
    ) -> Result<(i64, ActivityInfo)> {
        let Some(existing) = self.pending_activities.get(&schedule_id) else {
            return Err(EngineError::NotFound(format!(
                "no pending activity with schedule id {schedule_id}"
            )));
        };
        if existing.started_id != EMPTY_EVENT_ID {
            if existing.request_id == request_id {
                return Ok((existing.started_id, existing.clone()));
            }
            return Err(EngineError::InvalidState(format!(
                "activity {schedule_id} already started"
            )));
        }

        let event_id = self.add_event(EventAttributes::ActivityTaskStarted {
            scheduled_event_id: schedule_id,
            identity: identity.to_string(),
            request_id: request_id.to_string(),
        });
        let mut activity = self
            .pending_activities
            .get(&schedule_id)
            .cloned()
            .ok_or_else(|| EngineError::Fatal("pending activity vanished mid-update".into()))?;
        activity.started_id = event_id;
        activity.request_id = request_id.to_string();
        activity.started_time = Some(Utc::now());
        self.upsert_activity(activity.clone());
        Ok((event_id, activity))
    }

    /// Complete a started activity and drop it from the pending map.
    pub fn add_activity_task_completed_event(
        &mut self,
        schedule_id: i64,
        result: Option<Vec<u8>>,
        identity: &str,
    ) -> Result<i64> {
        let activity = self.take_started_activity(schedule_id)?;
        Ok(self.add_event(EventAttributes::ActivityTaskCompleted {
            scheduled_event_id: schedule_id,
            started_event_id: activity.started_id,
            result,
            identity: identity.to_string(),
        }))
    }

    /// Fail a started activity and drop it from the pending map.
    pub fn add_activity_task_failed_event(
        &mut self,
        schedule_id: i64,
        reason: &str,
        details: Option<Vec<u8>>,
        identity: &str,
    ) -> Result<i64> {
        let activity = self.take_started_activity(schedule_id)?;
        Ok(self.add_event(EventAttributes::ActivityTaskFailed {
            scheduled_event_id: schedule_id,
            started_event_id: activity.started_id,
            reason: reason.to_string(),
            details,
            identity: identity.to_string(),
        }))
    }

    /// Record a started activity's cancellation and drop it.
    pub fn add_activity_task_canceled_event(
        &mut self,
        schedule_id: i64,
        details: Option<Vec<u8>>,
        identity: &str,
    ) -> Result<i64> {
        let activity = self.take_started_activity(schedule_id)?;
        Ok(self.add_event(EventAttributes::ActivityTaskCanceled {
            scheduled_event_id: schedule_id,
            started_event_id: activity.started_id,
            details,
            identity: identity.to_string(),
        }))
    }

    /// Time out a pending activity (started or not) and drop it.
    pub fn add_activity_task_timed_out_event(
        &mut self,
        schedule_id: i64,
        timeout_type: TimeoutType,
    ) -> Result<i64> {
        let Some(activity) = self.pending_activities.remove(&schedule_id) else {
            return Err(EngineError::NotFound(format!(
                "no pending activity with schedule id {schedule_id}"
            )));
        };
        self.activity_upserts.remove(&schedule_id);
        self.activity_delete = Some(schedule_id);
        Ok(self.add_event(EventAttributes::ActivityTaskTimedOut {
            scheduled_event_id: schedule_id,
            started_event_id: activity.started_id,
            timeout_type,
        }))
    }

    /// Record heartbeat details; no event is appended. Returns true when the
    /// worker should cancel.
    pub fn record_activity_heartbeat(
        &mut self,
        schedule_id: i64,
        details: Option<Vec<u8>>,
    ) -> Result<bool> {
        let Some(existing) = self.pending_activities.get(&schedule_id) else {
            return Err(EngineError::NotFound(format!(
                "no pending activity with schedule id {schedule_id}"
            )));
        };
        if existing.started_id == EMPTY_EVENT_ID {
            return Err(EngineError::InvalidState(format!(
                "activity {schedule_id} not started"
            )));
        }
        let mut activity = existing.clone();
        activity.details = details;
        activity.last_heartbeat = Some(Utc::now());
        let cancel_requested = self.execution_info.cancel_requested || activity.cancel_requested;
        self.upsert_activity(activity);
        Ok(cancel_requested)
    }

    fn take_started_activity(&mut self, schedule_id: i64) -> Result<ActivityInfo> {
        let Some(activity) = self.pending_activities.get(&schedule_id) else {
            return Err(EngineError::NotFound(format!(
                "no pending activity with schedule id {schedule_id}"
            )));
        };
        if activity.started_id == EMPTY_EVENT_ID {
            return Err(EngineError::InvalidState(format!(
                "activity {schedule_id} not started"
            )));
        }
        let activity = self
            .pending_activities
            .remove(&schedule_id)
            .ok_or_else(|| EngineError::Fatal("pending activity vanished mid-update".into()))?;
        self.activity_upserts.remove(&schedule_id);
        self.activity_delete = Some(schedule_id);
        Ok(activity)
    }

    // ========================================================================
    // Timers
    // ========================================================================

    /// Start a user timer; the timer id must not collide with a pending one.
    pub fn add_timer_started_event(
        &mut self,
        decision_completed_event_id: i64,
        timer_id: &str,
        start_to_fire_timeout_seconds: i64,
    ) -> Result<(i64, TimerInfo)> {
        if start_to_fire_timeout_seconds < 0 {
            return Err(EngineError::BadRequest(format!(
                "negative timer timeout for '{timer_id}'"
            )));
        }
        if self.pending_timers.contains_key(timer_id) {
            return Err(EngineError::InvalidState(format!(
                "timer '{timer_id}' already started"
            )));
        }
        let event_id = self.add_event(EventAttributes::TimerStarted {
            timer_id: timer_id.to_string(),
            start_to_fire_timeout_seconds,
            decision_completed_event_id,
        });
        let timer = TimerInfo {
            timer_id: timer_id.to_string(),
            started_event_id: event_id,
            expiry: Utc::now() + TimeDelta::seconds(start_to_fire_timeout_seconds),
        };
        self.upsert_timer(timer.clone());
        Ok((event_id, timer))
    }

    /// Fire a pending timer and drop it.
    pub fn add_timer_fired_event(&mut self, timer_id: &str) -> Result<i64> {
        let Some(timer) = self.pending_timers.remove(timer_id) else {
            return Err(EngineError::NotFound(format!(
                "no pending timer '{timer_id}'"
            )));
        };
        self.timer_upserts.remove(timer_id);
        self.timer_deletes.insert(timer_id.to_string());
        Ok(self.add_event(EventAttributes::TimerFired {
            timer_id: timer_id.to_string(),
            started_event_id: timer.started_event_id,
        }))
    }

    /// Cancel a pending timer and drop it.
    pub fn add_timer_canceled_event(
        &mut self,
        decision_completed_event_id: i64,
        timer_id: &str,
    ) -> Result<i64> {
        let Some(timer) = self.pending_timers.remove(timer_id) else {
            return Err(EngineError::NotFound(format!(
                "no pending timer '{timer_id}'"
            )));
        };
        self.timer_upserts.remove(timer_id);
        self.timer_deletes.insert(timer_id.to_string());
        Ok(self.add_event(EventAttributes::TimerCanceled {
            timer_id: timer_id.to_string(),
            started_event_id: timer.started_event_id,
            decision_completed_event_id,
        }))
    }

    // ========================================================================
    // Session close
    // ========================================================================

    /// Atomically package everything accumulated since the last close.
    pub fn close_update_session(&mut self) -> SessionUpdates {
        SessionUpdates {
            new_events: std::mem::take(&mut self.new_events),
            upsert_activity_infos: std::mem::take(&mut self.activity_upserts)
                .into_values()
                .collect(),
            delete_activity_info: self.activity_delete.take(),
            upsert_timer_infos: std::mem::take(&mut self.timer_upserts)
                .into_values()
                .collect(),
            delete_timer_infos: std::mem::take(&mut self.timer_deletes)
                .into_iter()
                .collect(),
            upsert_child_execution_infos: std::mem::take(&mut self.child_upserts)
                .into_values()
                .collect(),
            delete_child_execution_info: self.child_delete.take(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn start_request() -> StartWorkflowExecutionRequest {
        StartWorkflowExecutionRequest {
            domain_id: "d1".into(),
            workflow_id: "w1".into(),
            workflow_type: "order-fulfillment".into(),
            task_list: "default".into(),
            input: Some(b"{}".to_vec()),
            execution_start_to_close_timeout_seconds: 3600,
            task_start_to_close_timeout_seconds: 10,
            request_id: "start-req-1".into(),
        }
    }

    fn started_builder() -> MutableStateBuilder {
        let mut builder = MutableStateBuilder::new(Arc::new(Config::default()));
        builder.add_workflow_execution_started_event("run-1", &start_request(), None);
        builder
    }

    #[test]
    fn start_appends_one_event_and_schedules_decision() {
        let mut builder = started_builder();
        assert_eq!(builder.next_event_id(), 2);

        let schedule_id = builder.schedule_decision_task().unwrap();
        assert_eq!(schedule_id, 2);
        // Scheduling a decision is bookkeeping only, no event.
        assert_eq!(builder.next_event_id(), 2);
        assert!(builder.has_pending_decision());
        assert!(builder.schedule_decision_task().is_none());
    }

    #[test]
    fn decision_cannot_start_twice() {
        let mut builder = started_builder();
        let schedule_id = builder.schedule_decision_task().unwrap();

        let started = builder.add_decision_task_started(schedule_id, "poll-1").unwrap();
        // Replay with the same request id is idempotent.
        assert_eq!(
            builder.add_decision_task_started(schedule_id, "poll-1").unwrap(),
            started
        );
        // A different poller must not start it again.
        let err = builder
            .add_decision_task_started(schedule_id, "poll-2")
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidState(_)));
    }

    #[test]
    fn next_event_id_advances_by_events_appended() {
        let mut builder = started_builder();
        let schedule_id = builder.schedule_decision_task().unwrap();
        builder.add_decision_task_started(schedule_id, "poll-1").unwrap();
        let before = builder.next_event_id();

        let completed = builder
            .add_decision_task_completed_event(schedule_id, "worker", None)
            .unwrap();
        builder
            .add_activity_task_scheduled_event(
                completed, "a1", "charge-card", "default", None, 0, 0, 0, 0,
            )
            .unwrap();
        builder.add_timer_started_event(completed, "t1", 30).unwrap();

        let updates = builder.close_update_session();
        assert_eq!(updates.new_events.len(), 3);
        assert_eq!(builder.next_event_id(), before + 3);
        assert_eq!(
            updates.new_events.iter().map(|e| e.event_id).collect::<Vec<_>>(),
            vec![before, before + 1, before + 2]
        );
    }

    #[test]
    fn activity_schedule_id_keys_pending_map() {
        let mut builder = started_builder();
        let schedule_id = builder.schedule_decision_task().unwrap();
        builder.add_decision_task_started(schedule_id, "poll-1").unwrap();
        let completed = builder
            .add_decision_task_completed_event(schedule_id, "worker", None)
            .unwrap();

        let (event_id, activity) = builder
            .add_activity_task_scheduled_event(
                completed, "a1", "charge-card", "default", None, 120, 0, 0, 0,
            )
            .unwrap();
        assert_eq!(activity.schedule_id, event_id);
        assert!(builder.pending_activity(event_id).is_some());
        // Defaults fill the zeroed timeouts.
        assert_eq!(activity.schedule_to_close_timeout_seconds, 120);
        assert_eq!(
            activity.start_to_close_timeout_seconds,
            Config::default().default_activity_start_to_close_timeout_seconds
        );
    }

    #[test]
    fn duplicate_timer_id_rejected() {
        let mut builder = started_builder();
        let schedule_id = builder.schedule_decision_task().unwrap();
        builder.add_decision_task_started(schedule_id, "poll-1").unwrap();
        let completed = builder
            .add_decision_task_completed_event(schedule_id, "worker", None)
            .unwrap();

        builder.add_timer_started_event(completed, "t1", 30).unwrap();
        let err = builder
            .add_timer_started_event(completed, "t1", 60)
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidState(_)));
    }

    #[test]
    fn completing_activity_deletes_pending_entry() {
        let mut builder = started_builder();
        let schedule_id = builder.schedule_decision_task().unwrap();
        builder.add_decision_task_started(schedule_id, "poll-1").unwrap();
        let completed = builder
            .add_decision_task_completed_event(schedule_id, "worker", None)
            .unwrap();
        let (activity_schedule_id, _) = builder
            .add_activity_task_scheduled_event(
                completed, "a1", "charge-card", "default", None, 0, 0, 0, 0,
            )
            .unwrap();
        builder.close_update_session();

        builder
            .add_activity_task_started_event(activity_schedule_id, "poll-2", "worker-2")
            .unwrap();
        builder
            .add_activity_task_completed_event(activity_schedule_id, Some(b"ok".to_vec()), "worker-2")
            .unwrap();

        assert!(builder.pending_activity(activity_schedule_id).is_none());
        let updates = builder.close_update_session();
        assert_eq!(updates.delete_activity_info, Some(activity_schedule_id));
        // The started-then-completed activity must not also be upserted.
        assert!(updates.upsert_activity_infos.is_empty());
    }

    #[test]
    fn failed_and_canceled_activities_drop_pending_entries() {
        let mut builder = started_builder();
        let schedule_id = builder.schedule_decision_task().unwrap();
        builder.add_decision_task_started(schedule_id, "poll-1").unwrap();
        let completed = builder
            .add_decision_task_completed_event(schedule_id, "worker", None)
            .unwrap();
        let (failed_id, _) = builder
            .add_activity_task_scheduled_event(
                completed, "a1", "charge-card", "default", None, 0, 0, 0, 0,
            )
            .unwrap();
        let (canceled_id, _) = builder
            .add_activity_task_scheduled_event(
                completed, "a2", "send-receipt", "default", None, 0, 0, 0, 0,
            )
            .unwrap();
        builder
            .add_activity_task_started_event(failed_id, "poll-2", "worker-2")
            .unwrap();
        builder
            .add_activity_task_started_event(canceled_id, "poll-3", "worker-3")
            .unwrap();
        builder.close_update_session();

        builder
            .add_activity_task_failed_event(failed_id, "card declined", None, "worker-2")
            .unwrap();
        assert!(builder.pending_activity(failed_id).is_none());
        let updates = builder.close_update_session();
        assert_eq!(updates.delete_activity_info, Some(failed_id));
        assert!(matches!(
            updates.new_events[0].attributes,
            EventAttributes::ActivityTaskFailed { scheduled_event_id, .. }
                if scheduled_event_id == failed_id
        ));

        builder
            .add_activity_task_canceled_event(canceled_id, Some(b"stopping".to_vec()), "worker-3")
            .unwrap();
        assert!(builder.pending_activity(canceled_id).is_none());
        let updates = builder.close_update_session();
        assert_eq!(updates.delete_activity_info, Some(canceled_id));
        assert!(matches!(
            updates.new_events[0].attributes,
            EventAttributes::ActivityTaskCanceled { scheduled_event_id, .. }
                if scheduled_event_id == canceled_id
        ));

        // A dropped activity cannot be resolved a second time.
        let err = builder
            .add_activity_task_canceled_event(canceled_id, None, "worker-3")
            .unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
    }

    #[test]
    fn heartbeat_is_a_row_only_session() {
        let mut builder = started_builder();
        let schedule_id = builder.schedule_decision_task().unwrap();
        builder.add_decision_task_started(schedule_id, "poll-1").unwrap();
        let completed = builder
            .add_decision_task_completed_event(schedule_id, "worker", None)
            .unwrap();
        let (activity_schedule_id, _) = builder
            .add_activity_task_scheduled_event(
                completed, "a1", "charge-card", "default", None, 0, 0, 0, 0,
            )
            .unwrap();
        builder
            .add_activity_task_started_event(activity_schedule_id, "poll-2", "worker-2")
            .unwrap();
        builder.close_update_session();

        let cancel = builder
            .record_activity_heartbeat(activity_schedule_id, Some(b"50%".to_vec()))
            .unwrap();
        assert!(!cancel);

        let updates = builder.close_update_session();
        assert!(updates.new_events.is_empty());
        assert_eq!(updates.upsert_activity_infos.len(), 1);
        assert_eq!(
            updates.upsert_activity_infos[0].details.as_deref(),
            Some(b"50%".as_slice())
        );
    }

    #[test]
    fn cancel_request_is_recorded_once() {
        let mut builder = started_builder();
        assert!(
            builder
                .add_workflow_execution_cancel_requested_event("ops")
                .is_some()
        );
        assert!(
            builder
                .add_workflow_execution_cancel_requested_event("ops")
                .is_none()
        );
        assert!(builder.execution_info().cancel_requested);
    }

    #[test]
    fn continue_as_new_builds_fresh_run() {
        let mut builder = started_builder();
        let schedule_id = builder.schedule_decision_task().unwrap();
        builder.add_decision_task_started(schedule_id, "poll-1").unwrap();
        let completed = builder
            .add_decision_task_completed_event(schedule_id, "worker", None)
            .unwrap();

        let (new_builder, new_decision) = builder
            .add_continued_as_new_event(completed, "run-2", "order-fulfillment", "default", None, 3600, 10)
            .unwrap();

        assert!(!builder.is_running());
        assert_eq!(builder.execution_info().close_status, CloseStatus::ContinuedAsNew);
        assert_eq!(new_builder.execution_info().run_id, "run-2");
        assert_eq!(
            new_builder.execution_info().continued_from_run_id.as_deref(),
            Some("run-1")
        );
        assert_eq!(new_builder.next_event_id(), 2);
        assert_eq!(new_decision, 2);
    }
}
