// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Windlass History - Sharded History Engine
//!
//! The history engine durably records workflow event histories, schedules
//! decision and activity tasks, and guarantees exactly-once progression of
//! each workflow despite worker crashes and host restarts.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Frontend / RPC                           │
//! └─────────────────────────────────────────────────────────────────┘
//!                                 │
//!                                 ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  HistoryService ── ShardController (routing by workflow id)     │
//! │       │                                                         │
//! │       ▼  one per owned shard                                    │
//! │  HistoryEngine ── ShardContext (range lease, task-id sequencer) │
//! │       │            │                                            │
//! │       │            ├── TransferQueueProcessor ──▶ Matching      │
//! │       │            └── TimerQueueProcessor                      │
//! │       ▼                                                         │
//! │  ExecutionCache ── WorkflowExecutionContext ── MutableState     │
//! └─────────────────────────────────────────────────────────────────┘
//!                                 │
//!                                 ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │     Persistence (shard rows, execution rows, history blobs,     │
//! │                  transfer/timer task queues)                    │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Ownership protocol
//!
//! Workflow ids hash onto a fixed number of shards; each shard is owned by
//! at most one host at a time. Ownership is a lease fenced by the shard
//! row's `range_id`: acquiring or renewing a shard increments it with a
//! compare-and-set on the previous value, and every conditional write under
//! the shard carries the current value. A host that loses the CAS observes
//! `ShardOwnershipLost`, stamps a sentinel range id so later writes
//! short-circuit, and asks the controller to unload the shard.
//!
//! # Task ids
//!
//! Task ids under range `r` are drawn from `[r << bits, (r + 1) << bits)`.
//! Renewal strictly raises the floor of the id space, so ids on a shard are
//! unique forever and increase in commit order.
//!
//! # Update transaction
//!
//! Every mutation appends its new events as one history batch, then
//! conditionally updates the execution row with `next_event_id` as the
//! optimistic-concurrency condition. A crash between the phases leaves an
//! orphan batch that the next attempt's transaction id resolves by
//! overwrite.
//!
//! # Modules
//!
//! - [`config`]: tuning knobs, loaded from `WINDLASS_*` environment variables
//! - [`error`]: the closed [`EngineError`] taxonomy
//! - [`shard`]: shard context, ownership protocol, controller
//! - [`execution`]: mutable-state builder, execution context, cache
//! - [`queue`]: transfer and timer queue processors
//! - [`engine`]: the per-shard engine facade
//! - [`runtime`]: embeddable service runtime and RPC surface
//! - [`client`]: matching/visibility client traits
//! - [`membership`]: shard placement
//! - [`backoff`]: generic retry with exponential backoff
//! - [`metrics`]: engine counters

#![deny(missing_docs)]

/// Generic retry with exponential backoff.
pub mod backoff;

/// Matching and visibility client traits with no-op and recording impls.
pub mod client;

/// History service configuration.
pub mod config;

/// The per-shard engine facade.
pub mod engine;

/// Engine error taxonomy.
pub mod error;

/// Mutable-state builder, execution context, and execution cache.
pub mod execution;

/// Shard placement.
pub mod membership;

/// Engine counters.
pub mod metrics;

/// Transfer and timer queue processors.
pub mod queue;

/// Embeddable service runtime and RPC dispatch.
pub mod runtime;

/// Shard context, ownership protocol, and controller.
pub mod shard;

pub use client::{
    DispatchedTask, MatchingClient, NoopMatchingClient, NoopVisibilityClient,
    RecordingMatchingClient, RecordingVisibilityClient, VisibilityClient,
};
pub use config::Config;
pub use engine::HistoryEngine;
pub use error::{EngineError, Result};
pub use membership::{Membership, SingleHostMembership};
pub use metrics::{EngineMetrics, MetricsSnapshot};
pub use runtime::{HistoryService, HistoryServiceBuilder};
pub use shard::ShardContext;
pub use shard::controller::ShardController;
