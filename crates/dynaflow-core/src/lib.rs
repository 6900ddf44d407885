// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! DynaFlow Core - task store for the DynaFlow orchestration engine
//!
//! This crate holds the records a DynaFlow deployment persists and the store
//! that persists them:
//!
//! ```text
//! Pac (partition)
//!  ├── DynaFlowType ──────┐        DfMaintenance (sweep lock, one per pac)
//!  ├── DynaFlowTaskType ─┐│        DynaFlowTypeSchedule (recurring flows)
//!  │                     ││
//!  └── DynaFlow ◄────────┘┘ (parent / root / dependency links)
//!       └── DynaFlowTask ◄── task type
//! ```
//!
//! # Store
//!
//! [`persistence::TaskStore`] hands out [`persistence::StoreSession`]s, one
//! database transaction each. Two backends are provided:
//!
//! | Backend | URL | Row locking |
//! |---------|-----|-------------|
//! | [`persistence::SqliteTaskStore`] | `sqlite:...` | database write lock |
//! | [`persistence::PostgresTaskStore`] | `postgres://...` | `SELECT ... FOR UPDATE` |
//!
//! Both embed their migrations and apply them on connect.
//!
//! # Flow manager
//!
//! [`manager::FlowManager`] is the API the surrounding application uses to
//! submit flows, request hierarchical cancellation and pause the scheduled
//! sweep.

pub mod error;
pub mod manager;
pub mod persistence;

pub use error::{Result, StoreError};
pub use manager::{FlowManager, FlowRequest, FlowStatus};
pub use persistence::{
    BuildTodoFilter, DfMaintenance, DynaFlow, DynaFlowTask, DynaFlowTaskType, DynaFlowType,
    DynaFlowTypeSchedule, FlowRef, FlowTypeSpec, NewDynaFlow, NewDynaFlowTask, NewSchedule, Pac,
    PostgresTaskStore, PriorityOrder, RecordKey, RunTodoFilter, SqliteTaskStore, StoreSession,
    TaskRef, TaskSearch, TaskStore, TaskTypeSpec, connect,
};
