// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Engine error taxonomy.
//!
//! A closed set of error kinds drives the branching in every update path:
//! retry-in-place is allowed only for `Transient`, a `Conflict` is retried
//! at the load-mutate-persist level after invalidating cached state, and
//! `ShardOwnershipLost` unloads the shard so the caller can redirect.

use thiserror::Error;
use windlass_persistence::StoreError;

/// Result type using [`EngineError`].
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors surfaced by the history engine.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    /// The shard's lease was lost; the engine is unloading. Callers redirect
    /// to the new owner.
    #[error("shard {shard_id} ownership lost")]
    ShardOwnershipLost {
        /// Shard whose lease was lost.
        shard_id: u32,
    },

    /// An optimistic-concurrency condition failed; cached state was
    /// invalidated and the operation can be retried from a fresh load.
    #[error("workflow execution update conflict")]
    Conflict,

    /// Conditional retries were exhausted without resolving a range race.
    #[error("max attempts exceeded on conditional update")]
    MaxAttemptsExceeded,

    /// An open run already exists for this workflow id.
    #[error("workflow already started with run {run_id}")]
    WorkflowExecutionAlreadyStarted {
        /// Idempotency token the existing run was started with.
        start_request_id: String,
        /// Run id of the existing open run.
        run_id: String,
    },

    /// The addressed entity does not exist (or is already closed).
    #[error("not found: {0}")]
    NotFound(String),

    /// The request itself is malformed.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// The request is valid but the execution is not in a state that
    /// permits it (e.g. a second start for a started decision).
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// A transient backend failure; retry with backoff.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Serialization or invariant failure; surfaced as an internal error.
    #[error("internal failure: {0}")]
    Fatal(String),
}

impl EngineError {
    /// True for failures worth retrying in place with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Transient(_))
    }
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::ShardOwnershipLost { shard_id, .. } => {
                EngineError::ShardOwnershipLost { shard_id }
            }
            StoreError::ConditionFailed(_) => EngineError::Conflict,
            StoreError::WorkflowExecutionAlreadyStarted {
                start_request_id,
                run_id,
                ..
            } => EngineError::WorkflowExecutionAlreadyStarted {
                start_request_id,
                run_id,
            },
            StoreError::NotFound(what) => EngineError::NotFound(what),
            StoreError::Timeout(op) => EngineError::Transient(format!("store timeout: {op}")),
            StoreError::Busy(op) => EngineError::Transient(format!("store busy: {op}")),
            StoreError::Serialization(msg) => EngineError::Fatal(msg),
            StoreError::Internal(msg) => EngineError::Fatal(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_error_mapping() {
        let err: EngineError = StoreError::ConditionFailed("x".into()).into();
        assert!(matches!(err, EngineError::Conflict));

        let err: EngineError = StoreError::ShardOwnershipLost {
            shard_id: 2,
            message: "stolen".into(),
        }
        .into();
        assert!(matches!(err, EngineError::ShardOwnershipLost { shard_id: 2 }));

        let err: EngineError = StoreError::Busy("poll".into()).into();
        assert!(err.is_retryable());

        let err: EngineError = StoreError::Serialization("bad json".into()).into();
        assert!(!err.is_retryable());
        assert!(matches!(err, EngineError::Fatal(_)));
    }
}
