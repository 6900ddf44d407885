// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Ownership claims on tasks and flow builds.
//!
//! A claim is its own short unit of work: lock the row, check the
//! in-progress flag, run the guarded claim update, commit. The work itself
//! happens afterwards in separate sessions, so a slow or crashing handler never
//! holds a database transaction open.
//!
//! Losing a claim is a normal outcome, not an error. Persistence failures
//! (including SQLite busy errors from a concurrent writer) are logged and
//! reported as [`ConflictReason::PersistenceFailure`].

use std::sync::Arc;

use chrono::Utc;
use dynaflow_core::{StoreError, TaskStore};
use tracing::{debug, warn};

/// Why a claim was not granted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictReason {
    NotFound,
    /// Another worker holds the claim.
    AlreadyStarted,
    /// The row is completed, canceled, or (for flows) already built.
    AlreadyCompleted,
    /// The claim session failed and was rolled back.
    PersistenceFailure,
}

/// Result of a claim attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    Owned,
    Conflict(ConflictReason),
}

impl ClaimOutcome {
    pub fn is_owned(&self) -> bool {
        matches!(self, ClaimOutcome::Owned)
    }
}

/// Claims rows on behalf of one processor identifier.
#[derive(Clone)]
pub struct ClaimProtocol {
    store: Arc<dyn TaskStore>,
    owner: String,
}

impl ClaimProtocol {
    pub fn new(store: Arc<dyn TaskStore>, owner: impl Into<String>) -> Self {
        Self {
            store,
            owner: owner.into(),
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Take the run claim on a task.
    ///
    /// On success the task is started, owned by this processor, and carries
    /// the current `max_retry_count` of its task type.
    pub async fn claim_task(&self, task_id: i64) -> ClaimOutcome {
        match self.try_claim_task(task_id).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(task_id, owner = %self.owner, error = %e, "Task claim failed");
                ClaimOutcome::Conflict(ConflictReason::PersistenceFailure)
            }
        }
    }

    /// Take the task-build claim on a flow.
    ///
    /// On success the flow's task creation is started, owned by this
    /// processor, and the flow carries the current `priority_level` of its
    /// flow type.
    pub async fn claim_flow_for_build(&self, flow_id: i64) -> ClaimOutcome {
        match self.try_claim_flow(flow_id).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(flow_id, owner = %self.owner, error = %e, "Flow build claim failed");
                ClaimOutcome::Conflict(ConflictReason::PersistenceFailure)
            }
        }
    }

    async fn try_claim_task(&self, task_id: i64) -> Result<ClaimOutcome, StoreError> {
        let mut uow = self.store.begin().await?;

        let Some(task) = uow.lock_task(task_id).await? else {
            uow.rollback().await?;
            return Ok(ClaimOutcome::Conflict(ConflictReason::NotFound));
        };

        let refused = if task.is_terminal() {
            Some(ConflictReason::AlreadyCompleted)
        } else if task.is_started {
            Some(ConflictReason::AlreadyStarted)
        } else {
            None
        };
        if let Some(reason) = refused {
            uow.rollback().await?;
            debug!(task_id, ?reason, "Task claim refused");
            return Ok(ClaimOutcome::Conflict(reason));
        }

        let max_retry_count = uow
            .get_task_type(task.dyna_flow_task_type_id)
            .await?
            .map_or(task.max_retry_count, |t| t.max_retry_count);

        if !uow
            .claim_task_run(task.id, &self.owner, max_retry_count, Utc::now())
            .await?
        {
            uow.rollback().await?;
            debug!(task_id, "Task claim lost to a concurrent worker");
            return Ok(ClaimOutcome::Conflict(ConflictReason::AlreadyStarted));
        }

        uow.commit().await?;
        debug!(task_id, task_code = %task.code, owner = %self.owner, "Task claimed");
        Ok(ClaimOutcome::Owned)
    }

    async fn try_claim_flow(&self, flow_id: i64) -> Result<ClaimOutcome, StoreError> {
        let mut uow = self.store.begin().await?;

        let Some(flow) = uow.lock_flow(flow_id).await? else {
            uow.rollback().await?;
            return Ok(ClaimOutcome::Conflict(ConflictReason::NotFound));
        };

        let refused = if flow.is_completed || flow.is_tasks_created {
            Some(ConflictReason::AlreadyCompleted)
        } else if flow.is_task_creation_started {
            Some(ConflictReason::AlreadyStarted)
        } else {
            None
        };
        if let Some(reason) = refused {
            uow.rollback().await?;
            debug!(flow_id, ?reason, "Flow build claim refused");
            return Ok(ClaimOutcome::Conflict(reason));
        }

        let priority_level = uow
            .get_flow_type(flow.dyna_flow_type_id)
            .await?
            .map_or(flow.priority_level, |t| t.priority_level);

        if !uow
            .claim_flow_build(flow.id, &self.owner, priority_level, Utc::now())
            .await?
        {
            uow.rollback().await?;
            debug!(flow_id, "Flow build claim lost to a concurrent worker");
            return Ok(ClaimOutcome::Conflict(ConflictReason::AlreadyStarted));
        }

        uow.commit().await?;
        debug!(flow_id, flow_code = %flow.code, owner = %self.owner, "Flow build claimed");
        Ok(ClaimOutcome::Owned)
    }
}
