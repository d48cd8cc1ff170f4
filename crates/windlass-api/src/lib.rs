// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Windlass API - History Service Types
//!
//! Shared request/response and domain types for the windlass history service.
//! Every request on the history RPC surface carries a `domain_id`; a workflow
//! execution is addressed by `(domain_id, workflow_id, run_id)`.
//!
//! # Modules
//!
//! - [`events`]: History event types. Events are appended in batches; a batch
//!   is serialized as JSON and stored as an opaque blob by the persistence
//!   layer.
//! - [`requests`]: Request/response structs for every history RPC operation.

#![deny(missing_docs)]

/// History event types and batch serialization.
pub mod events;

/// Request/response types for the history RPC surface.
pub mod requests;

pub use events::{EventAttributes, HistoryEvent, TimeoutType};
pub use requests::*;

use serde::{Deserialize, Serialize};

/// Identifies one run of a workflow.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkflowExecution {
    /// Client-chosen workflow identifier, unique per domain among open runs.
    pub workflow_id: String,
    /// Server-assigned run identifier, unique forever.
    pub run_id: String,
}

impl WorkflowExecution {
    /// Create a new execution identity.
    pub fn new(workflow_id: impl Into<String>, run_id: impl Into<String>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            run_id: run_id.into(),
        }
    }
}

impl std::fmt::Display for WorkflowExecution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.workflow_id, self.run_id)
    }
}

/// Lifecycle state of a workflow execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowState {
    /// Row created, first decision not yet dispatched.
    Created,
    /// Actively making progress.
    Running,
    /// Closed; see [`CloseStatus`] for how.
    Completed,
}

/// How a closed workflow execution ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseStatus {
    /// Still open.
    None,
    /// Completed successfully.
    Completed,
    /// Failed with an application error.
    Failed,
    /// Canceled by request.
    Canceled,
    /// Terminated by an operator.
    Terminated,
    /// Closed in favor of a fresh run of the same workflow.
    ContinuedAsNew,
    /// Exceeded its execution timeout.
    TimedOut,
}

impl CloseStatus {
    /// True when the execution is still open.
    pub fn is_open(self) -> bool {
        matches!(self, CloseStatus::None)
    }
}
