// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-execution state: the mutable-state builder, the execution context
//! driving the update transaction, and the context cache.

pub mod cache;
pub mod context;
pub mod mutable_state;

pub use cache::ExecutionCache;
pub use context::WorkflowExecutionContext;
pub use mutable_state::{MutableStateBuilder, SessionUpdates};
