// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Startup recovery of this processor's own unfinished claims.
//!
//! A processor that crashed or was killed leaves rows claimed under its
//! identifier. On the next start with the same identifier those rows are
//! returned to the unclaimed pool. Claims of other processors are left to
//! the master sweep's abandoned-claim reset.

use std::sync::Arc;

use dynaflow_core::{TaskSearch, TaskStore};
use tracing::info;

use crate::error::Result;

/// Rows returned to the pool by one recovery sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub tasks_reset: usize,
    pub flow_builds_released: usize,
}

impl RecoveryReport {
    pub fn is_empty(&self) -> bool {
        self.tasks_reset == 0 && self.flow_builds_released == 0
    }
}

/// Reset every started, uncompleted task and unfinished flow build owned by
/// `owner`. Running it twice in a row is a no-op the second time.
pub async fn recover_own_claims(store: &Arc<dyn TaskStore>, owner: &str) -> Result<RecoveryReport> {
    let mut uow = store.begin().await?;
    let mut report = RecoveryReport::default();

    let tasks = uow
        .search_tasks(&TaskSearch {
            processor_identifier: Some(owner.to_string()),
            is_started: Some(true),
            is_completed: Some(false),
            ..Default::default()
        })
        .await?;
    for mut task in tasks {
        task.processor_identifier.clear();
        task.is_started = false;
        task.is_completed = false;
        uow.save_task(&task).await?;
        report.tasks_reset += 1;
    }

    for mut flow in uow.get_unfinished_flow_builds(owner).await? {
        flow.is_task_creation_started = false;
        flow.task_creation_processor_identifier.clear();
        flow.task_creation_started_utc_date_time = None;
        uow.save_flow(&flow).await?;
        report.flow_builds_released += 1;
    }

    uow.commit().await?;

    if !report.is_empty() {
        info!(
            owner = %owner,
            tasks_reset = report.tasks_reset,
            flow_builds_released = report.flow_builds_released,
            "Recovered unfinished claims from a previous run"
        );
    }
    Ok(report)
}
