// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Store error taxonomy.
//!
//! Callers branch on these variants, never on message strings. The taxonomy
//! is closed: a backend maps every failure onto exactly one variant.

use thiserror::Error;

/// Result type using [`StoreError`].
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors surfaced by the persistence layer.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// A conditional write found a different `range_id` on the shard row.
    /// The caller no longer owns the shard and must unload it.
    #[error("shard {shard_id} ownership lost: {message}")]
    ShardOwnershipLost {
        /// Shard whose lease was lost.
        shard_id: u32,
        /// Backend detail, for logging only.
        message: String,
    },

    /// A compare-and-set condition did not hold (execution row condition or
    /// history append collision). The caller reloads and retries above.
    #[error("conditional update failed: {0}")]
    ConditionFailed(String),

    /// An open run already exists for this workflow id.
    #[error("workflow '{workflow_id}' already started with run {run_id}")]
    WorkflowExecutionAlreadyStarted {
        /// Workflow identifier.
        workflow_id: String,
        /// Idempotency token the existing run was started with.
        start_request_id: String,
        /// Run id of the existing open run.
        run_id: String,
    },

    /// The addressed entity does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The backend timed out; safe to retry with backoff.
    #[error("store timeout during {0}")]
    Timeout(String),

    /// The backend is shedding load; safe to retry with backoff.
    #[error("store busy: {0}")]
    Busy(String),

    /// A record failed to encode or decode.
    #[error("serialization failure: {0}")]
    Serialization(String),

    /// Any other backend failure. The outcome of the attempted write is
    /// unknown to the caller.
    #[error("store failure: {0}")]
    Internal(String),
}

impl StoreError {
    /// True for failures worth retrying in place with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Timeout(_) | StoreError::Busy(_))
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}
