// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for dynaflow-processor.
//!
//! Read once at startup from `DYNAFLOW_*` environment variables (a `.env`
//! file is honored by the binary). Invalid combinations are rejected before
//! any store connection is made.

use std::str::FromStr;
use std::time::Duration;

/// Whether the processor drains its work once or keeps polling.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RunMode {
    /// Exit after a sweep in which no role found any work.
    #[default]
    Once,
    /// Sleep the poll interval after idle sweeps and run until shutdown.
    Forever,
}

impl FromStr for RunMode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "once" => Ok(RunMode::Once),
            "forever" | "daemon" => Ok(RunMode::Forever),
            _ => Err(()),
        }
    }
}

/// Names of the three logical queues.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueNames {
    pub processor: String,
    pub result: String,
    pub dead_letter: String,
}

/// Processor configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Task store URL (`sqlite:...` or `postgres://...`)
    pub database_url: String,
    /// Partition this processor works on
    pub pac_code: String,
    /// Bridge the master and runner roles through the message queue
    pub task_queue_enabled: bool,
    pub master_role: bool,
    pub processor_role: bool,
    pub queue_names: QueueNames,
    /// Queue backend (`memory://`, `sqlite:...`, `postgres://...`)
    pub queue_connection_string: String,
    pub run_mode: RunMode,
    /// Sleep between idle sweeps in forever mode
    pub poll_interval: Duration,
    /// Delay before a failed task becomes eligible again
    pub retry_backoff: Duration,
    /// Claims older than this are considered abandoned by the master sweep
    pub abandoned_claim_ttl: Duration,
    /// Gap between scheduled sweeps
    pub sweep_interval: Duration,
    /// A started sweep older than this no longer blocks a new one
    pub sweep_stale_after: Duration,
    /// Upper bound on rows fetched per to-do list
    pub batch_size: i64,
    /// Overrides the derived processor identifier
    pub processor_identifier: Option<String>,
}

impl Config {
    /// Configuration with default settings for the given store.
    pub fn new(database_url: impl Into<String>) -> Self {
        let database_url = database_url.into();
        Self {
            queue_connection_string: database_url.clone(),
            database_url,
            pac_code: "default".to_string(),
            task_queue_enabled: false,
            master_role: true,
            processor_role: true,
            queue_names: QueueNames::default(),
            run_mode: RunMode::Once,
            poll_interval: Duration::from_secs(5),
            retry_backoff: Duration::from_secs(180),
            abandoned_claim_ttl: Duration::from_secs(7200),
            sweep_interval: Duration::from_secs(1800),
            sweep_stale_after: Duration::from_secs(86400),
            batch_size: 100,
            processor_identifier: None,
        }
    }

    /// Load configuration from environment variables and validate it.
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("DYNAFLOW_DATABASE_URL")
            .map_err(|_| ConfigError::MissingEnvVar("DYNAFLOW_DATABASE_URL"))?;

        let mut config = Self::new(database_url);

        if let Some(pac_code) = env_string("DYNAFLOW_PAC_CODE") {
            config.pac_code = pac_code;
        }
        config.task_queue_enabled = env_bool("DYNAFLOW_TASK_QUEUE_ENABLED", false)?;
        config.master_role = env_bool("DYNAFLOW_TASK_MASTER_ROLE", true)?;
        config.processor_role = env_bool("DYNAFLOW_TASK_PROCESSOR_ROLE", true)?;

        config.queue_names = QueueNames {
            processor: env_string("DYNAFLOW_PROCESSOR_QUEUE_NAME").unwrap_or_default(),
            result: env_string("DYNAFLOW_RESULT_QUEUE_NAME").unwrap_or_default(),
            dead_letter: env_string("DYNAFLOW_DEAD_LETTER_QUEUE_NAME").unwrap_or_default(),
        };
        if let Some(queue) = env_string("DYNAFLOW_QUEUE_CONNECTION_STRING") {
            config.queue_connection_string = queue;
        }

        if let Some(mode) = env_string("DYNAFLOW_RUN_MODE") {
            config.run_mode = mode.parse().map_err(|_| ConfigError::InvalidValue {
                var: "DYNAFLOW_RUN_MODE",
                value: mode,
            })?;
        }

        config.poll_interval = env_secs("DYNAFLOW_POLL_INTERVAL_SECS", config.poll_interval)?;
        config.retry_backoff = env_secs("DYNAFLOW_RETRY_BACKOFF_SECS", config.retry_backoff)?;
        config.abandoned_claim_ttl =
            env_secs("DYNAFLOW_ABANDONED_CLAIM_TTL_SECS", config.abandoned_claim_ttl)?;
        config.sweep_interval = env_secs("DYNAFLOW_SWEEP_INTERVAL_SECS", config.sweep_interval)?;
        config.sweep_stale_after =
            env_secs("DYNAFLOW_SWEEP_STALE_SECS", config.sweep_stale_after)?;

        if let Some(raw) = env_string("DYNAFLOW_BATCH_SIZE") {
            config.batch_size = raw
                .parse::<i64>()
                .ok()
                .filter(|n| *n > 0)
                .ok_or(ConfigError::InvalidValue {
                    var: "DYNAFLOW_BATCH_SIZE",
                    value: raw,
                })?;
        }

        config.processor_identifier = env_string("DYNAFLOW_PROCESSOR_IDENTIFIER");

        config.validate()?;
        Ok(config)
    }

    /// Reject role and queue combinations the processor cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.master_role && !self.processor_role {
            return Err(ConfigError::NoRoleEnabled);
        }

        if self.task_queue_enabled {
            if self.queue_names.processor.trim().is_empty() {
                return Err(ConfigError::MissingQueueName("DYNAFLOW_PROCESSOR_QUEUE_NAME"));
            }
            if self.queue_names.result.trim().is_empty() {
                return Err(ConfigError::MissingQueueName("DYNAFLOW_RESULT_QUEUE_NAME"));
            }
            if self.queue_names.dead_letter.trim().is_empty() {
                return Err(ConfigError::MissingQueueName(
                    "DYNAFLOW_DEAD_LETTER_QUEUE_NAME",
                ));
            }
        }

        Ok(())
    }
}

/// Non-empty value of an environment variable.
fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_bool(name: &'static str, default: bool) -> Result<bool, ConfigError> {
    match env_string(name) {
        None => Ok(default),
        Some(v) => match v.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(true),
            "false" | "0" | "no" => Ok(false),
            _ => Err(ConfigError::InvalidValue {
                var: name,
                value: v,
            }),
        },
    }
}

fn env_secs(name: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    match env_string(name) {
        None => Ok(default),
        Some(v) => v
            .trim()
            .parse::<u64>()
            .map(Duration::from_secs)
            .map_err(|_| ConfigError::InvalidValue {
                var: name,
                value: v,
            }),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(&'static str),
    /// An environment variable could not be parsed.
    #[error("Invalid value for {var}: '{value}'")]
    InvalidValue { var: &'static str, value: String },
    /// Queue mode is enabled but a queue name is empty.
    #[error("Task queue is enabled but {0} is empty")]
    MissingQueueName(&'static str),
    /// Neither the master nor the processor role is enabled.
    #[error("At least one of DYNAFLOW_TASK_MASTER_ROLE or DYNAFLOW_TASK_PROCESSOR_ROLE must be enabled")]
    NoRoleEnabled,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    // Mutex to serialize tests that modify environment variables
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    const ALL_VARS: &[&str] = &[
        "DYNAFLOW_DATABASE_URL",
        "DYNAFLOW_PAC_CODE",
        "DYNAFLOW_TASK_QUEUE_ENABLED",
        "DYNAFLOW_TASK_MASTER_ROLE",
        "DYNAFLOW_TASK_PROCESSOR_ROLE",
        "DYNAFLOW_PROCESSOR_QUEUE_NAME",
        "DYNAFLOW_RESULT_QUEUE_NAME",
        "DYNAFLOW_DEAD_LETTER_QUEUE_NAME",
        "DYNAFLOW_QUEUE_CONNECTION_STRING",
        "DYNAFLOW_RUN_MODE",
        "DYNAFLOW_POLL_INTERVAL_SECS",
        "DYNAFLOW_RETRY_BACKOFF_SECS",
        "DYNAFLOW_ABANDONED_CLAIM_TTL_SECS",
        "DYNAFLOW_SWEEP_INTERVAL_SECS",
        "DYNAFLOW_SWEEP_STALE_SECS",
        "DYNAFLOW_BATCH_SIZE",
        "DYNAFLOW_PROCESSOR_IDENTIFIER",
    ];

    /// Helper to set env vars for a test and restore them after
    struct EnvGuard {
        vars: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        /// Start from a clean slate: every DYNAFLOW_ variable removed.
        fn clean() -> Self {
            let mut guard = Self { vars: Vec::new() };
            for var in ALL_VARS {
                guard.remove(var);
            }
            guard
        }

        fn set(&mut self, key: &str, value: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::set_var(key, value) };
        }

        fn remove(&mut self, key: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::remove_var(key) };
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, value) in self.vars.drain(..).rev() {
                // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
                unsafe {
                    match value {
                        Some(v) => env::set_var(&key, v),
                        None => env::remove_var(&key),
                    }
                }
            }
        }
    }

    #[test]
    fn test_missing_database_url() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let _guard = EnvGuard::clean();

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar("DYNAFLOW_DATABASE_URL")));
    }

    #[test]
    fn test_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::clean();
        guard.set("DYNAFLOW_DATABASE_URL", "sqlite:dynaflow.db");

        let config = Config::from_env().unwrap();
        assert_eq!(config.pac_code, "default");
        assert!(!config.task_queue_enabled);
        assert!(config.master_role);
        assert!(config.processor_role);
        assert_eq!(config.queue_connection_string, "sqlite:dynaflow.db");
        assert_eq!(config.run_mode, RunMode::Once);
        assert_eq!(config.poll_interval, Duration::from_secs(5));
        assert_eq!(config.retry_backoff, Duration::from_secs(180));
        assert_eq!(config.abandoned_claim_ttl, Duration::from_secs(7200));
        assert_eq!(config.sweep_interval, Duration::from_secs(1800));
        assert_eq!(config.sweep_stale_after, Duration::from_secs(86400));
        assert_eq!(config.batch_size, 100);
        assert!(config.processor_identifier.is_none());
    }

    #[test]
    fn test_overrides() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::clean();
        guard.set("DYNAFLOW_DATABASE_URL", "postgres://localhost/dynaflow");
        guard.set("DYNAFLOW_PAC_CODE", "acme");
        guard.set("DYNAFLOW_TASK_QUEUE_ENABLED", "true");
        guard.set("DYNAFLOW_PROCESSOR_QUEUE_NAME", "df-processor");
        guard.set("DYNAFLOW_RESULT_QUEUE_NAME", "df-result");
        guard.set("DYNAFLOW_DEAD_LETTER_QUEUE_NAME", "df-dead");
        guard.set("DYNAFLOW_QUEUE_CONNECTION_STRING", "memory://");
        guard.set("DYNAFLOW_RUN_MODE", "forever");
        guard.set("DYNAFLOW_RETRY_BACKOFF_SECS", "60");
        guard.set("DYNAFLOW_BATCH_SIZE", "25");
        guard.set("DYNAFLOW_PROCESSOR_IDENTIFIER", "worker-7");

        let config = Config::from_env().unwrap();
        assert_eq!(config.pac_code, "acme");
        assert!(config.task_queue_enabled);
        assert_eq!(config.queue_names.dead_letter, "df-dead");
        assert_eq!(config.queue_connection_string, "memory://");
        assert_eq!(config.run_mode, RunMode::Forever);
        assert_eq!(config.retry_backoff, Duration::from_secs(60));
        assert_eq!(config.batch_size, 25);
        assert_eq!(config.processor_identifier.as_deref(), Some("worker-7"));
    }

    #[test]
    fn test_queue_enabled_requires_names() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::clean();
        guard.set("DYNAFLOW_DATABASE_URL", "sqlite:dynaflow.db");
        guard.set("DYNAFLOW_TASK_QUEUE_ENABLED", "1");
        guard.set("DYNAFLOW_PROCESSOR_QUEUE_NAME", "df-processor");
        guard.set("DYNAFLOW_RESULT_QUEUE_NAME", "df-result");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::MissingQueueName("DYNAFLOW_DEAD_LETTER_QUEUE_NAME")
        ));
    }

    #[test]
    fn test_no_role_enabled() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::clean();
        guard.set("DYNAFLOW_DATABASE_URL", "sqlite:dynaflow.db");
        guard.set("DYNAFLOW_TASK_MASTER_ROLE", "false");
        guard.set("DYNAFLOW_TASK_PROCESSOR_ROLE", "0");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::NoRoleEnabled));
    }

    #[test]
    fn test_invalid_values() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::clean();
        guard.set("DYNAFLOW_DATABASE_URL", "sqlite:dynaflow.db");
        guard.set("DYNAFLOW_RUN_MODE", "sometimes");
        assert!(matches!(
            Config::from_env().unwrap_err(),
            ConfigError::InvalidValue { var: "DYNAFLOW_RUN_MODE", .. }
        ));

        guard.set("DYNAFLOW_RUN_MODE", "once");
        guard.set("DYNAFLOW_BATCH_SIZE", "0");
        assert!(matches!(
            Config::from_env().unwrap_err(),
            ConfigError::InvalidValue { var: "DYNAFLOW_BATCH_SIZE", .. }
        ));

        guard.set("DYNAFLOW_BATCH_SIZE", "10");
        guard.set("DYNAFLOW_TASK_MASTER_ROLE", "maybe");
        assert!(matches!(
            Config::from_env().unwrap_err(),
            ConfigError::InvalidValue { var: "DYNAFLOW_TASK_MASTER_ROLE", .. }
        ));
    }

    #[test]
    fn test_run_mode_parse() {
        assert_eq!("Once".parse::<RunMode>(), Ok(RunMode::Once));
        assert_eq!(" forever ".parse::<RunMode>(), Ok(RunMode::Forever));
        assert!("never".parse::<RunMode>().is_err());
    }
}
