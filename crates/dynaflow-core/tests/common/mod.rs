// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for dynaflow-core store tests.
//!
//! PostgreSQL tests run against TEST_DATABASE_URL and are skipped when it is
//! unset. Each context works in its own partition so tests can share a database.

#![allow(dead_code)]

use std::sync::Arc;

use dynaflow_core::{
    FlowManager, FlowTypeSpec, PostgresTaskStore, SqliteTaskStore, TaskStore, TaskTypeSpec,
};
use uuid::Uuid;

pub struct TestContext {
    pub store: Arc<dyn TaskStore>,
    pub manager: FlowManager,
    pub pac_id: i64,
    _dir: Option<tempfile::TempDir>,
}

pub fn task_types() -> Vec<TaskTypeSpec> {
    vec![TaskTypeSpec {
        lookup_enum_name: "Step".to_string(),
        description: "Test step".to_string(),
        max_retry_count: 2,
    }]
}

pub fn flow_types() -> Vec<FlowTypeSpec> {
    vec![FlowTypeSpec {
        lookup_enum_name: "Batch".to_string(),
        description: "Test batch".to_string(),
        priority_level: 1,
    }]
}

impl TestContext {
    /// PostgreSQL context, or `None` when TEST_DATABASE_URL is unset or unreachable.
    pub async fn postgres() -> Option<Self> {
        let database_url = std::env::var("TEST_DATABASE_URL").ok()?;
        let store = PostgresTaskStore::connect(&database_url).await.ok()?;
        Self::bootstrap(Arc::new(store), None).await
    }

    /// File-backed SQLite context with a multi-connection pool.
    pub async fn sqlite_file() -> Self {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let store = SqliteTaskStore::from_path(dir.path().join("dynaflow.db"))
            .await
            .expect("Failed to open SQLite store");
        Self::bootstrap(Arc::new(store), Some(dir))
            .await
            .expect("Failed to bootstrap")
    }

    async fn bootstrap(store: Arc<dyn TaskStore>, dir: Option<tempfile::TempDir>) -> Option<Self> {
        let pac_code = format!("test-{}", Uuid::new_v4());
        let (manager, pac) =
            FlowManager::bootstrap(store.clone(), &pac_code, &task_types(), &flow_types())
                .await
                .ok()?;
        Some(Self {
            store,
            manager,
            pac_id: pac.id,
            _dir: dir,
        })
    }
}

/// Skip test if TEST_DATABASE_URL is not set.
#[macro_export]
macro_rules! skip_if_no_db {
    () => {
        if std::env::var("TEST_DATABASE_URL").is_err() {
            eprintln!("Skipping test: TEST_DATABASE_URL not set");
            return;
        }
    };
}
