// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable processor runtime.
//!
//! [`ProcessorRuntime`] wires the store, the optional queue and the handler
//! registry into the master and task-runner roles and drives them in a loop.
//!
//! ```rust,ignore
//! use dynaflow_processor::config::Config;
//! use dynaflow_processor::registry::FlowRegistry;
//! use dynaflow_processor::runtime::ProcessorRuntime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut registry = FlowRegistry::with_builtins();
//!     registry.register_task(TaskTypeSpec::new("SendInvoice", 3), Arc::new(SendInvoice))?;
//!
//!     let runtime = ProcessorRuntime::builder()
//!         .config(Config::from_env()?)
//!         .registry(registry)
//!         .build()
//!         .await?;
//!
//!     runtime.run().await?;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;

use dynaflow_core::{FlowManager, TaskStore};
use tokio::sync::Notify;
use tracing::{debug, error, info};

use crate::claim::ClaimProtocol;
use crate::config::{Config, RunMode};
use crate::error::{Error, Result};
use crate::instance_id;
use crate::master::{MasterConfig, MasterRole, SweepReport};
use crate::queue::{self, MessageQueue};
use crate::recovery::{self, RecoveryReport};
use crate::registry::FlowRegistry;
use crate::retry::RetryPolicy;
use crate::task_runner::{RunnerReport, TaskRunner};

/// Work still visible after an iteration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Backlog {
    pub run_todo: usize,
    pub build_todo: usize,
    pub result_messages: u64,
    pub processor_messages: u64,
}

impl Backlog {
    pub fn is_empty(&self) -> bool {
        self.run_todo == 0
            && self.build_todo == 0
            && self.result_messages == 0
            && self.processor_messages == 0
    }
}

/// What one iteration of both roles did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IterationReport {
    pub master: Option<SweepReport>,
    pub runner: Option<RunnerReport>,
    pub backlog: Backlog,
}

/// Builder for [`ProcessorRuntime`].
#[derive(Default)]
pub struct ProcessorRuntimeBuilder {
    config: Option<Config>,
    store: Option<Arc<dyn TaskStore>>,
    queue: Option<Arc<dyn MessageQueue>>,
    registry: Option<FlowRegistry>,
}

impl ProcessorRuntimeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the configuration (required).
    pub fn config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    /// Use an existing store instead of connecting to `config.database_url`.
    pub fn store(mut self, store: Arc<dyn TaskStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Use an existing queue instead of connecting to
    /// `config.queue_connection_string`. Only used in queue mode.
    pub fn queue(mut self, queue: Arc<dyn MessageQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    /// Set the handler registry.
    ///
    /// Default: [`FlowRegistry::with_builtins`]
    pub fn registry(mut self, registry: FlowRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Connect what is missing and bootstrap the partition and catalogs.
    pub async fn build(self) -> Result<ProcessorRuntime> {
        let config = self
            .config
            .ok_or_else(|| Error::Other("config is required".to_string()))?;
        config.validate()?;

        let store = match self.store {
            Some(store) => store,
            None => dynaflow_core::connect(&config.database_url).await?,
        };

        let queue = if config.task_queue_enabled {
            Some(match self.queue {
                Some(queue) => queue,
                None => queue::connect(&config.queue_connection_string).await?,
            })
        } else {
            None
        };

        let registry = Arc::new(self.registry.unwrap_or_else(FlowRegistry::with_builtins));
        let (manager, pac) = FlowManager::bootstrap(
            store.clone(),
            &config.pac_code,
            &registry.task_type_specs(),
            &registry.flow_type_specs(),
        )
        .await?;

        let identifier = instance_id::processor_identifier(config.processor_identifier.as_deref());
        let claims = ClaimProtocol::new(store.clone(), identifier.clone());

        let master = MasterRole::new(
            store.clone(),
            registry.clone(),
            claims.clone(),
            pac.id,
            MasterConfig {
                sweep_interval: config.sweep_interval,
                sweep_stale_after: config.sweep_stale_after,
                abandoned_claim_ttl: config.abandoned_claim_ttl,
                batch_size: config.batch_size,
            },
        );
        let runner = TaskRunner::new(
            store.clone(),
            registry,
            claims,
            RetryPolicy::new(config.retry_backoff),
            pac.id,
            config.batch_size,
        );

        info!(
            pac = %pac.code,
            processor_identifier = %identifier,
            master_role = config.master_role,
            processor_role = config.processor_role,
            queue_mode = config.task_queue_enabled,
            run_mode = ?config.run_mode,
            "Processor runtime ready"
        );

        Ok(ProcessorRuntime {
            config,
            store,
            queue,
            manager,
            master,
            runner,
            identifier,
            shutdown: Arc::new(Notify::new()),
        })
    }
}

/// A bootstrapped processor: both roles over one store.
pub struct ProcessorRuntime {
    config: Config,
    store: Arc<dyn TaskStore>,
    queue: Option<Arc<dyn MessageQueue>>,
    manager: FlowManager,
    master: MasterRole,
    runner: TaskRunner,
    identifier: String,
    shutdown: Arc<Notify>,
}

impl ProcessorRuntime {
    pub fn builder() -> ProcessorRuntimeBuilder {
        ProcessorRuntimeBuilder::new()
    }

    /// Flow submission API for the bootstrapped partition.
    pub fn manager(&self) -> &FlowManager {
        &self.manager
    }

    pub fn processor_identifier(&self) -> &str {
        &self.identifier
    }

    pub fn master(&self) -> &MasterRole {
        &self.master
    }

    pub fn runner(&self) -> &TaskRunner {
        &self.runner
    }

    /// Get a handle that can be used to signal shutdown.
    ///
    /// Use `notify_one`; the loop picks the signal up between iterations.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Return this processor's unfinished claims from a previous run.
    pub async fn recover(&self) -> Result<RecoveryReport> {
        recovery::recover_own_claims(&self.store, &self.identifier).await
    }

    /// Run recovery, then iterate until the backlog is empty (`Once`) or
    /// until shutdown (`Forever`).
    ///
    /// Store and queue failures never end the loop: a failed recovery or
    /// iteration is logged and the loop waits one poll interval before
    /// trying again. A failed iteration never counts as a drained backlog.
    pub async fn run(&self) -> Result<()> {
        if let Err(e) = self.recover().await {
            error!(error = %e, "Recovery of unfinished claims failed");
        }

        info!(run_mode = ?self.config.run_mode, "Processor loop started");
        let mut iterations = 0u64;
        let mut failures = 0u64;
        loop {
            let backlog = match self.run_iteration().await {
                Ok(report) => Some(report.backlog),
                Err(e) => {
                    failures += 1;
                    error!(error = %e, failures, "Processor iteration failed");
                    None
                }
            };
            iterations += 1;

            let drained = backlog.is_some_and(|b| b.is_empty());
            if drained && self.config.run_mode == RunMode::Once {
                info!(iterations, failures, "Backlog drained, exiting");
                break;
            }

            let delay = match backlog {
                Some(b) if !b.is_empty() => Duration::ZERO,
                _ => self.config.poll_interval,
            };

            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!(iterations, failures, "Processor loop shutting down");
                    break;
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }

        Ok(())
    }

    /// One pass of every enabled role followed by a backlog count.
    pub async fn run_iteration(&self) -> Result<IterationReport> {
        let queue = self
            .queue
            .as_deref()
            .map(|queue| (queue, &self.config.queue_names));

        let mut report = IterationReport::default();

        if self.config.master_role {
            report.master = Some(self.master.sweep(queue).await);
        }

        if self.config.processor_role {
            report.runner = Some(match queue {
                Some((queue, names)) => self.runner.consume_queue(queue, names).await,
                None => self.runner.poll_once().await,
            });
        }

        report.backlog = self.backlog().await?;
        debug!(?report, "Iteration finished");
        Ok(report)
    }

    async fn backlog(&self) -> Result<Backlog> {
        let mut backlog = Backlog::default();
        let queue_mode = self.queue.is_some();

        // Runnable tasks are served by the master in queue mode and run
        // directly by the task runner otherwise.
        if (self.config.master_role && queue_mode) || (self.config.processor_role && !queue_mode) {
            backlog.run_todo = self.runner.run_todo_count().await?;
        }
        if self.config.master_role {
            backlog.build_todo = self.master.build_todo_count().await?;
        }
        if let Some(queue) = &self.queue {
            let names = &self.config.queue_names;
            if self.config.master_role {
                backlog.result_messages = queue.peek_count(&names.result).await?;
            }
            if self.config.processor_role {
                backlog.processor_messages = queue.peek_count(&names.processor).await?;
            }
        }
        Ok(backlog)
    }
}
