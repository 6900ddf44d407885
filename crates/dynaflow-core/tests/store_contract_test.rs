// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Store behavior shared by both backends: guarded claims under concurrency,
//! unit-of-work rollback, and cancellation requests across a flow tree.

mod common;

use std::sync::Arc;

use chrono::Utc;
use common::*;
use dynaflow_core::{
    DynaFlowTask, FlowRequest, NewDynaFlowTask, RecordKey, StoreError, TaskStore,
};

async fn flow_with_task(ctx: &TestContext) -> DynaFlowTask {
    let flow = ctx
        .manager
        .submit_flow(FlowRequest::new("Batch"))
        .await
        .expect("Failed to submit flow");

    let mut uow = ctx.store.begin().await.unwrap();
    let task_type = uow
        .find_task_type(ctx.pac_id, "Step")
        .await
        .unwrap()
        .expect("task type should be bootstrapped");
    let task = uow
        .insert_task(&NewDynaFlowTask {
            dyna_flow_id: flow.id,
            dyna_flow_task_type_id: task_type.id,
            max_retry_count: task_type.max_retry_count,
            ..Default::default()
        })
        .await
        .unwrap();
    uow.commit().await.unwrap();
    task
}

async fn claim_once(
    store: Arc<dyn TaskStore>,
    task_id: i64,
    owner: String,
) -> Result<bool, StoreError> {
    let mut uow = store.begin().await?;
    let Some(task) = uow.lock_task(task_id).await? else {
        return Ok(false);
    };
    if task.is_started {
        return Ok(false);
    }
    if !uow.claim_task_run(task_id, &owner, 2, Utc::now()).await? {
        return Ok(false);
    }
    uow.commit().await?;
    Ok(true)
}

async fn try_claim(store: Arc<dyn TaskStore>, task_id: i64, owner: String) -> bool {
    claim_once(store, task_id, owner).await.unwrap_or(false)
}

async fn assert_single_winner(ctx: &TestContext) {
    let task = flow_with_task(ctx).await;

    let claims = (0..8).map(|i| try_claim(ctx.store.clone(), task.id, format!("worker-{}", i)));
    let wins = futures::future::join_all(claims)
        .await
        .into_iter()
        .filter(|owned| *owned)
        .count();
    assert_eq!(wins, 1, "exactly one claimant must own the task");

    let mut uow = ctx.store.begin().await.unwrap();
    let loaded = uow.load_task(RecordKey::Id(task.id)).await.unwrap().unwrap();
    assert!(loaded.is_started);
    assert!(loaded.processor_identifier.starts_with("worker-"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_sqlite_concurrent_claims_single_winner() {
    let ctx = TestContext::sqlite_file().await;
    assert_single_winner(&ctx).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_postgres_concurrent_claims_single_winner() {
    skip_if_no_db!();

    let Some(ctx) = TestContext::postgres().await else {
        eprintln!("Skipping test: failed to create test context");
        return;
    };
    assert_single_winner(&ctx).await;
}

async fn complete_then_fail(store: &Arc<dyn TaskStore>, task_id: i64) -> Result<(), StoreError> {
    let mut uow = store.begin().await?;
    let mut loaded = uow
        .lock_task(task_id)
        .await?
        .ok_or_else(|| StoreError::not_found("task", task_id))?;
    loaded.is_completed = true;
    uow.save_task(&loaded).await?;
    // Saving a row that does not exist fails; the session is dropped uncommitted.
    loaded.id = -1;
    uow.save_task(&loaded).await?;
    uow.commit().await
}

async fn assert_rollback_on_error(ctx: &TestContext) {
    let task = flow_with_task(ctx).await;

    let result = complete_then_fail(&ctx.store, task.id).await;
    assert!(matches!(result, Err(StoreError::NotFound { .. })));

    let mut uow = ctx.store.begin().await.unwrap();
    let loaded = uow.load_task(RecordKey::Id(task.id)).await.unwrap().unwrap();
    assert!(!loaded.is_completed);
}

#[tokio::test]
async fn test_sqlite_failed_unit_of_work_rolls_back() {
    let ctx = TestContext::sqlite_file().await;
    assert_rollback_on_error(&ctx).await;
}

#[tokio::test]
async fn test_postgres_failed_unit_of_work_rolls_back() {
    skip_if_no_db!();

    let Some(ctx) = TestContext::postgres().await else {
        eprintln!("Skipping test: failed to create test context");
        return;
    };
    assert_rollback_on_error(&ctx).await;
}

#[tokio::test]
async fn test_postgres_cancel_request_reaches_grandchildren() {
    skip_if_no_db!();

    let Some(ctx) = TestContext::postgres().await else {
        eprintln!("Skipping test: failed to create test context");
        return;
    };

    let root = ctx.manager.submit_flow(FlowRequest::new("Batch")).await.unwrap();
    let child = ctx
        .manager
        .submit_flow(FlowRequest {
            parent_code: Some(root.code.clone()),
            ..FlowRequest::new("Batch")
        })
        .await
        .unwrap();
    let grandchild = ctx
        .manager
        .submit_flow(FlowRequest {
            parent_code: Some(child.code.clone()),
            ..FlowRequest::new("Batch")
        })
        .await
        .unwrap();

    assert_eq!(ctx.manager.request_cancel(&root.code).await.unwrap(), 3);

    let status = ctx
        .manager
        .flow_status(&grandchild.code)
        .await
        .unwrap()
        .unwrap();
    assert!(status.flow.is_cancel_requested);
    assert_eq!(status.flow.root_dyna_flow_id, Some(root.id));
}
