// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Downstream clients the queue processors dispatch to.
//!
//! Matching (task dispatch to pollers) and visibility (closed-execution
//! records) are external services; the engine only needs these traits.
//! Recording implementations ship in-tree for tests and local runs.

use std::sync::Mutex;

use async_trait::async_trait;
use windlass_api::{CloseStatus, WorkflowExecution};

use crate::error::Result;

/// Task dispatch to the matching service.
#[async_trait]
pub trait MatchingClient: Send + Sync {
    /// Offer a pending decision task to pollers of `task_list`.
    async fn add_decision_task(
        &self,
        domain_id: &str,
        execution: &WorkflowExecution,
        task_list: &str,
        schedule_id: i64,
    ) -> Result<()>;

    /// Offer a scheduled activity task to pollers of `task_list`.
    async fn add_activity_task(
        &self,
        domain_id: &str,
        execution: &WorkflowExecution,
        task_list: &str,
        schedule_id: i64,
    ) -> Result<()>;
}

/// Closed-execution records for the visibility store.
#[async_trait]
pub trait VisibilityClient: Send + Sync {
    /// Record that an execution closed and how.
    async fn record_closed_execution(
        &self,
        domain_id: &str,
        execution: &WorkflowExecution,
        close_status: CloseStatus,
    ) -> Result<()>;
}

/// Matching client that drops every task.
#[derive(Debug, Default)]
pub struct NoopMatchingClient;

#[async_trait]
impl MatchingClient for NoopMatchingClient {
    async fn add_decision_task(
        &self,
        _domain_id: &str,
        _execution: &WorkflowExecution,
        _task_list: &str,
        _schedule_id: i64,
    ) -> Result<()> {
        Ok(())
    }

    async fn add_activity_task(
        &self,
        _domain_id: &str,
        _execution: &WorkflowExecution,
        _task_list: &str,
        _schedule_id: i64,
    ) -> Result<()> {
        Ok(())
    }
}

/// Visibility client that drops every record.
#[derive(Debug, Default)]
pub struct NoopVisibilityClient;

#[async_trait]
impl VisibilityClient for NoopVisibilityClient {
    async fn record_closed_execution(
        &self,
        _domain_id: &str,
        _execution: &WorkflowExecution,
        _close_status: CloseStatus,
    ) -> Result<()> {
        Ok(())
    }
}

/// One task handed to matching.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchedTask {
    /// Domain of the source workflow.
    pub domain_id: String,
    /// Source execution.
    pub execution: WorkflowExecution,
    /// Task list the task was offered on.
    pub task_list: String,
    /// Schedule id of the task.
    pub schedule_id: i64,
}

/// Matching client that records every dispatched task.
#[derive(Debug, Default)]
pub struct RecordingMatchingClient {
    decision_tasks: Mutex<Vec<DispatchedTask>>,
    activity_tasks: Mutex<Vec<DispatchedTask>>,
}

impl RecordingMatchingClient {
    /// Create an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Decision tasks dispatched so far.
    pub fn decision_tasks(&self) -> Vec<DispatchedTask> {
        self.decision_tasks.lock().expect("mutex poisoned").clone()
    }

    /// Activity tasks dispatched so far.
    pub fn activity_tasks(&self) -> Vec<DispatchedTask> {
        self.activity_tasks.lock().expect("mutex poisoned").clone()
    }
}

#[async_trait]
impl MatchingClient for RecordingMatchingClient {
    async fn add_decision_task(
        &self,
        domain_id: &str,
        execution: &WorkflowExecution,
        task_list: &str,
        schedule_id: i64,
    ) -> Result<()> {
        self.decision_tasks
            .lock()
            .expect("mutex poisoned")
            .push(DispatchedTask {
                domain_id: domain_id.to_string(),
                execution: execution.clone(),
                task_list: task_list.to_string(),
                schedule_id,
            });
        Ok(())
    }

    async fn add_activity_task(
        &self,
        domain_id: &str,
        execution: &WorkflowExecution,
        task_list: &str,
        schedule_id: i64,
    ) -> Result<()> {
        self.activity_tasks
            .lock()
            .expect("mutex poisoned")
            .push(DispatchedTask {
                domain_id: domain_id.to_string(),
                execution: execution.clone(),
                task_list: task_list.to_string(),
                schedule_id,
            });
        Ok(())
    }
}

/// Visibility client that records every closed execution.
#[derive(Debug, Default)]
pub struct RecordingVisibilityClient {
    closed: Mutex<Vec<(String, WorkflowExecution, CloseStatus)>>,
}

impl RecordingVisibilityClient {
    /// Create an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Closed executions recorded so far.
    pub fn closed_executions(&self) -> Vec<(String, WorkflowExecution, CloseStatus)> {
        self.closed.lock().expect("mutex poisoned").clone()
    }
}

#[async_trait]
impl VisibilityClient for RecordingVisibilityClient {
    async fn record_closed_execution(
        &self,
        domain_id: &str,
        execution: &WorkflowExecution,
        close_status: CloseStatus,
    ) -> Result<()> {
        self.closed.lock().expect("mutex poisoned").push((
            domain_id.to_string(),
            execution.clone(),
            close_status,
        ));
        Ok(())
    }
}
