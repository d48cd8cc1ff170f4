// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory persistence backend.
//!
//! Implements the full store contract over hash maps behind one mutex, with
//! the same CAS classification a production backend performs. Supports
//! one-shot fault injection per operation so engine tests can exercise the
//! conflict, ownership-loss, and uncertain-write paths.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{Result, StoreError};
use crate::store::{ExecutionStore, HistoryStore, ShardStore};
use crate::types::{
    AppendHistoryEventsRequest, CreateWorkflowExecutionRequest, GetWorkflowExecutionRequest,
    ShardInfo, StoredHistoryBatch, TimerTask, TransferTask, UpdateWorkflowExecutionRequest,
    WorkflowMutableState,
};

/// Store operations, used to target fault injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    /// [`ShardStore::get_shard`]
    GetShard,
    /// [`ShardStore::update_shard`]
    UpdateShard,
    /// [`ExecutionStore::create_workflow_execution`]
    CreateWorkflowExecution,
    /// [`ExecutionStore::get_workflow_execution`]
    GetWorkflowExecution,
    /// [`ExecutionStore::update_workflow_execution`]
    UpdateWorkflowExecution,
    /// [`HistoryStore::append_history_events`]
    AppendHistoryEvents,
    /// [`ExecutionStore::get_transfer_tasks`]
    GetTransferTasks,
    /// [`ExecutionStore::complete_transfer_task`]
    CompleteTransferTask,
    /// [`ExecutionStore::get_timer_tasks`]
    GetTimerTasks,
    /// [`ExecutionStore::complete_timer_task`]
    CompleteTimerTask,
}

type ExecKey = (String, String, String);

struct StoredBatch {
    transaction_id: i64,
    data: Vec<u8>,
}

#[derive(Default)]
struct Inner {
    shards: HashMap<u32, ShardInfo>,
    executions: HashMap<ExecKey, WorkflowMutableState>,
    current_runs: HashMap<(String, String), String>,
    history: HashMap<ExecKey, BTreeMap<i64, StoredBatch>>,
    transfer_tasks: HashMap<u32, BTreeMap<i64, TransferTask>>,
    timer_tasks: HashMap<u32, BTreeMap<(DateTime<Utc>, i64), TimerTask>>,
    injected: HashMap<StoreOp, VecDeque<StoreError>>,
}

/// Hash-map backed store with fault injection.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an error to be returned by the next call to `op`. Multiple
    /// injections for the same operation are consumed in order.
    pub fn inject_failure(&self, op: StoreOp, err: StoreError) {
        let mut inner = self.inner.lock().expect("store mutex poisoned");
        inner.injected.entry(op).or_default().push_back(err);
    }

    /// Number of transfer tasks currently queued on a shard.
    pub fn transfer_task_count(&self, shard_id: u32) -> usize {
        let inner = self.inner.lock().expect("store mutex poisoned");
        inner
            .transfer_tasks
            .get(&shard_id)
            .map_or(0, BTreeMap::len)
    }

    /// Number of timer tasks currently queued on a shard.
    pub fn timer_task_count(&self, shard_id: u32) -> usize {
        let inner = self.inner.lock().expect("store mutex poisoned");
        inner.timer_tasks.get(&shard_id).map_or(0, BTreeMap::len)
    }
}

fn take_injected(inner: &mut Inner, op: StoreOp) -> Result<()> {
    if let Some(queue) = inner.injected.get_mut(&op)
        && let Some(err) = queue.pop_front()
    {
        return Err(err);
    }
    Ok(())
}

fn check_range(inner: &Inner, shard_id: u32, range_id: i64) -> Result<()> {
    let shard = inner
        .shards
        .get(&shard_id)
        .ok_or_else(|| StoreError::NotFound(format!("shard {shard_id}")))?;
    if shard.range_id != range_id {
        return Err(StoreError::ShardOwnershipLost {
            shard_id,
            message: format!(
                "request range {} does not match shard range {}",
                range_id, shard.range_id
            ),
        });
    }
    Ok(())
}

fn enqueue_tasks(
    inner: &mut Inner,
    shard_id: u32,
    transfer_tasks: &[TransferTask],
    timer_tasks: &[TimerTask],
) {
    let transfer = inner.transfer_tasks.entry(shard_id).or_default();
    for task in transfer_tasks {
        transfer.insert(task.task_id, task.clone());
    }
    let timer = inner.timer_tasks.entry(shard_id).or_default();
    for task in timer_tasks {
        timer.insert((task.visibility_time, task.task_id), task.clone());
    }
}

#[async_trait]
impl ShardStore for MemoryStore {
    async fn create_shard(&self, shard: ShardInfo) -> Result<()> {
        let mut inner = self.inner.lock().expect("store mutex poisoned");
        inner.shards.entry(shard.shard_id).or_insert(shard);
        Ok(())
    }

    async fn get_shard(&self, shard_id: u32) -> Result<ShardInfo> {
        let mut inner = self.inner.lock().expect("store mutex poisoned");
        take_injected(&mut inner, StoreOp::GetShard)?;
        inner
            .shards
            .get(&shard_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("shard {shard_id}")))
    }

    async fn update_shard(&self, shard: ShardInfo, previous_range_id: i64) -> Result<()> {
        let mut inner = self.inner.lock().expect("store mutex poisoned");
        take_injected(&mut inner, StoreOp::UpdateShard)?;
        let shard_id = shard.shard_id;
        let stored = inner
            .shards
            .get_mut(&shard_id)
            .ok_or_else(|| StoreError::NotFound(format!("shard {shard_id}")))?;
        if stored.range_id != previous_range_id {
            return Err(StoreError::ShardOwnershipLost {
                shard_id,
                message: format!(
                    "stored range {} does not match expected {}",
                    stored.range_id, previous_range_id
                ),
            });
        }
        *stored = shard;
        Ok(())
    }
}

#[async_trait]
impl ExecutionStore for MemoryStore {
    async fn create_workflow_execution(&self, req: CreateWorkflowExecutionRequest) -> Result<()> {
        let mut inner = self.inner.lock().expect("store mutex poisoned");
        take_injected(&mut inner, StoreOp::CreateWorkflowExecution)?;
        check_range(&inner, req.shard_id, req.range_id)?;

        let info = &req.execution_info;
        let workflow_key = (info.domain_id.clone(), info.workflow_id.clone());
        if let Some(current_run) = inner.current_runs.get(&workflow_key) {
            let current_key = (
                info.domain_id.clone(),
                info.workflow_id.clone(),
                current_run.clone(),
            );
            if let Some(current) = inner.executions.get(&current_key)
                && current.execution_info.close_status.is_open()
            {
                return Err(StoreError::WorkflowExecutionAlreadyStarted {
                    workflow_id: info.workflow_id.clone(),
                    start_request_id: current.execution_info.start_request_id.clone(),
                    run_id: current_run.clone(),
                });
            }
        }

        let run_key = (
            info.domain_id.clone(),
            info.workflow_id.clone(),
            info.run_id.clone(),
        );
        inner
            .current_runs
            .insert(workflow_key, info.run_id.clone());
        inner
            .executions
            .insert(run_key, WorkflowMutableState::new(req.execution_info.clone()));
        enqueue_tasks(&mut inner, req.shard_id, &req.transfer_tasks, &req.timer_tasks);
        Ok(())
    }

    async fn get_workflow_execution(
        &self,
        req: GetWorkflowExecutionRequest,
    ) -> Result<WorkflowMutableState> {
        let mut inner = self.inner.lock().expect("store mutex poisoned");
        take_injected(&mut inner, StoreOp::GetWorkflowExecution)?;
        let key = (req.domain_id, req.workflow_id, req.run_id);
        inner
            .executions
            .get(&key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("execution {}/{}", key.1, key.2)))
    }

    async fn update_workflow_execution(&self, req: UpdateWorkflowExecutionRequest) -> Result<()> {
        let mut inner = self.inner.lock().expect("store mutex poisoned");
        take_injected(&mut inner, StoreOp::UpdateWorkflowExecution)?;
        check_range(&inner, req.shard_id, req.range_id)?;

        let info = &req.execution_info;
        let key = (
            info.domain_id.clone(),
            info.workflow_id.clone(),
            info.run_id.clone(),
        );
        {
            let stored = inner.executions.get_mut(&key).ok_or_else(|| {
                StoreError::NotFound(format!("execution {}/{}", key.1, key.2))
            })?;
            if stored.execution_info.next_event_id != req.condition {
                return Err(StoreError::ConditionFailed(format!(
                    "next event id {} does not match condition {}",
                    stored.execution_info.next_event_id, req.condition
                )));
            }

            stored.execution_info = req.execution_info.clone();
            for activity in &req.upsert_activity_infos {
                stored
                    .activity_infos
                    .insert(activity.schedule_id, activity.clone());
            }
            if let Some(schedule_id) = req.delete_activity_info {
                stored.activity_infos.remove(&schedule_id);
            }
            for timer in &req.upsert_timer_infos {
                stored.timer_infos.insert(timer.timer_id.clone(), timer.clone());
            }
            for timer_id in &req.delete_timer_infos {
                stored.timer_infos.remove(timer_id);
            }
            for child in &req.upsert_child_execution_infos {
                stored
                    .child_execution_infos
                    .insert(child.initiated_id, child.clone());
            }
            if let Some(initiated_id) = req.delete_child_execution_info {
                stored.child_execution_infos.remove(&initiated_id);
            }
        }
        enqueue_tasks(&mut inner, req.shard_id, &req.transfer_tasks, &req.timer_tasks);

        if let Some(new_run) = &req.continue_as_new {
            let new_info = &new_run.execution_info;
            let new_key = (
                new_info.domain_id.clone(),
                new_info.workflow_id.clone(),
                new_info.run_id.clone(),
            );
            inner.current_runs.insert(
                (new_info.domain_id.clone(), new_info.workflow_id.clone()),
                new_info.run_id.clone(),
            );
            inner
                .executions
                .insert(new_key, WorkflowMutableState::new(new_info.clone()));
            enqueue_tasks(&mut inner, req.shard_id, &new_run.transfer_tasks, &new_run.timer_tasks);
        }
        Ok(())
    }

    async fn delete_workflow_execution(
        &self,
        domain_id: &str,
        workflow_id: &str,
        run_id: &str,
    ) -> Result<()> {
        let mut inner = self.inner.lock().expect("store mutex poisoned");
        let key = (
            domain_id.to_string(),
            workflow_id.to_string(),
            run_id.to_string(),
        );
        inner.executions.remove(&key);
        let workflow_key = (domain_id.to_string(), workflow_id.to_string());
        if inner.current_runs.get(&workflow_key).map(String::as_str) == Some(run_id) {
            inner.current_runs.remove(&workflow_key);
        }
        Ok(())
    }

    async fn get_current_run_id(&self, domain_id: &str, workflow_id: &str) -> Result<String> {
        let inner = self.inner.lock().expect("store mutex poisoned");
        inner
            .current_runs
            .get(&(domain_id.to_string(), workflow_id.to_string()))
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("workflow {workflow_id}")))
    }

    async fn get_transfer_tasks(
        &self,
        shard_id: u32,
        read_level: i64,
        max_read_level: i64,
        batch_size: usize,
    ) -> Result<Vec<TransferTask>> {
        let mut inner = self.inner.lock().expect("store mutex poisoned");
        take_injected(&mut inner, StoreOp::GetTransferTasks)?;
        if read_level >= max_read_level {
            return Ok(Vec::new());
        }
        let Some(queue) = inner.transfer_tasks.get(&shard_id) else {
            return Ok(Vec::new());
        };
        Ok(queue
            .range(read_level + 1..=max_read_level)
            .take(batch_size)
            .map(|(_, task)| task.clone())
            .collect())
    }

    async fn complete_transfer_task(&self, shard_id: u32, task_id: i64) -> Result<()> {
        let mut inner = self.inner.lock().expect("store mutex poisoned");
        take_injected(&mut inner, StoreOp::CompleteTransferTask)?;
        if let Some(queue) = inner.transfer_tasks.get_mut(&shard_id) {
            queue.remove(&task_id);
        }
        Ok(())
    }

    async fn get_timer_tasks(
        &self,
        shard_id: u32,
        min_time: DateTime<Utc>,
        max_time: DateTime<Utc>,
        batch_size: usize,
    ) -> Result<Vec<TimerTask>> {
        let mut inner = self.inner.lock().expect("store mutex poisoned");
        take_injected(&mut inner, StoreOp::GetTimerTasks)?;
        if min_time > max_time {
            return Ok(Vec::new());
        }
        let Some(queue) = inner.timer_tasks.get(&shard_id) else {
            return Ok(Vec::new());
        };
        Ok(queue
            .range((min_time, i64::MIN)..=(max_time, i64::MAX))
            .take(batch_size)
            .map(|(_, task)| task.clone())
            .collect())
    }

    async fn complete_timer_task(
        &self,
        shard_id: u32,
        visibility_time: DateTime<Utc>,
        task_id: i64,
    ) -> Result<()> {
        let mut inner = self.inner.lock().expect("store mutex poisoned");
        take_injected(&mut inner, StoreOp::CompleteTimerTask)?;
        if let Some(queue) = inner.timer_tasks.get_mut(&shard_id) {
            queue.remove(&(visibility_time, task_id));
        }
        Ok(())
    }
}

#[async_trait]
impl HistoryStore for MemoryStore {
    async fn append_history_events(&self, req: AppendHistoryEventsRequest) -> Result<()> {
        let mut inner = self.inner.lock().expect("store mutex poisoned");
        take_injected(&mut inner, StoreOp::AppendHistoryEvents)?;
        check_range(&inner, req.shard_id, req.range_id)?;

        let key = (
            req.domain_id.clone(),
            req.workflow_id.clone(),
            req.run_id.clone(),
        );
        let branch = inner.history.entry(key).or_default();
        if let Some(existing) = branch.get(&req.first_event_id)
            && !req.overwrite
        {
            return Err(StoreError::ConditionFailed(format!(
                "batch at event {} already written by transaction {}",
                req.first_event_id, existing.transaction_id
            )));
        }
        branch.insert(
            req.first_event_id,
            StoredBatch {
                transaction_id: req.transaction_id,
                data: req.events,
            },
        );
        Ok(())
    }

    async fn get_workflow_execution_history(
        &self,
        domain_id: &str,
        workflow_id: &str,
        run_id: &str,
    ) -> Result<Vec<StoredHistoryBatch>> {
        let inner = self.inner.lock().expect("store mutex poisoned");
        let key = (
            domain_id.to_string(),
            workflow_id.to_string(),
            run_id.to_string(),
        );
        let Some(branch) = inner.history.get(&key) else {
            return Ok(Vec::new());
        };
        Ok(branch
            .iter()
            .map(|(first_event_id, batch)| StoredHistoryBatch {
                first_event_id: *first_event_id,
                transaction_id: batch.transaction_id,
                data: batch.data.clone(),
            })
            .collect())
    }

    async fn delete_workflow_execution_history(
        &self,
        domain_id: &str,
        workflow_id: &str,
        run_id: &str,
    ) -> Result<()> {
        let mut inner = self.inner.lock().expect("store mutex poisoned");
        let key = (
            domain_id.to_string(),
            workflow_id.to_string(),
            run_id.to_string(),
        );
        inner.history.remove(&key);
        Ok(())
    }
}
