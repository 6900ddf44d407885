// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! DynaFlow Processor - worker roles for the DynaFlow orchestration engine
//!
//! A processor process runs one or both roles against a shared task store:
//!
//! ```text
//!                 ┌──────────────────────────────┐
//!                 │          Task store          │
//!                 │  (dynaflow-core, SQL backed) │
//!                 └──────────────────────────────┘
//!                   ▲                          ▲
//!     claim / build │                          │ claim / record
//!                   │                          │
//!          ┌────────────────┐  processor  ┌────────────────┐
//!          │  Master role   │ ──queue───► │  Task runner   │
//!          │ sweep, builds, │             │ dispatch, retry│
//!          │ serve, drain   │ ◄──result── │ policy         │
//!          └────────────────┘    queue    └────────────────┘
//! ```
//!
//! Without a queue the task runner polls the run to-do list itself. Every
//! ownership change goes through [`claim::ClaimProtocol`], so any number of
//! processors may share a store.
//!
//! # Modules
//!
//! | Module | Role |
//! |--------|------|
//! | [`claim`] | Guarded ownership claims on tasks and flow builds |
//! | [`registry`] | Task handlers and flow builders by type name |
//! | [`retry`] | Retry and completion transitions |
//! | [`master`] | Scheduled sweep, flow builds, queue serving and draining |
//! | [`task_runner`] | DB-poll and queue-consume execution |
//! | [`recovery`] | Startup reset of this processor's own claims |
//! | [`queue`] | Peek-lock message queue backends |
//! | [`runtime`] | Wiring and the run loop |

pub mod claim;
pub mod config;
pub mod error;
pub mod handlers;
pub mod instance_id;
pub mod master;
pub mod queue;
pub mod recovery;
pub mod registry;
pub mod retry;
pub mod runtime;
pub mod task_runner;

pub use claim::{ClaimOutcome, ClaimProtocol, ConflictReason};
pub use config::{Config, ConfigError, QueueNames, RunMode};
pub use error::{Error, Result};
pub use registry::{
    FailureKind, FlowBuilder, FlowRegistry, HandlerError, NewTaskSpec, TaskContext, TaskHandler,
    TaskOutput,
};
pub use retry::{RetryPolicy, TaskTransition};
pub use runtime::{ProcessorRuntime, ProcessorRuntimeBuilder};
