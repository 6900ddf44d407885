// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! DynaFlow Processor - worker process
//!
//! Runs the master and/or task-runner roles for one partition, as selected
//! by `DYNAFLOW_*` environment variables.

use tracing::{error, info, warn};

use dynaflow_processor::config::Config;
use dynaflow_processor::registry::FlowRegistry;
use dynaflow_processor::runtime::ProcessorRuntime;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "dynaflow_processor=info,dynaflow_core=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Invalid configuration");
            std::process::exit(1);
        }
    };

    info!(
        pac = %config.pac_code,
        master_role = config.master_role,
        processor_role = config.processor_role,
        queue_mode = config.task_queue_enabled,
        "Starting DynaFlow processor"
    );

    let runtime = ProcessorRuntime::builder()
        .config(config)
        .registry(FlowRegistry::with_builtins())
        .build()
        .await?;

    let shutdown = runtime.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
            shutdown.notify_one();
        }
    });

    runtime.run().await?;

    info!("DynaFlow processor stopped");
    Ok(())
}
