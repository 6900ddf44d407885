// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for dynaflow-core.
//!
//! Every store operation reports failure as a [`StoreError`]. Callers treat any
//! of these as a persistence failure: the unit of work is rolled back, the
//! error is logged and the processing loop moves on.

use thiserror::Error;

/// Result type using StoreError
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors raised by the task store.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// Database operation failed (includes lock and serialization conflicts).
    #[error("database error during {operation}: {details}")]
    Database {
        /// The operation that failed.
        operation: &'static str,
        /// Error details.
        details: String,
    },

    /// Applying embedded migrations failed.
    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A record that the caller expected to exist was not found.
    #[error("{entity} not found: {key}")]
    NotFound {
        /// Kind of record ("flow", "task", "flow type", ...).
        entity: &'static str,
        /// Id, code or name that was looked up.
        key: String,
    },

    /// The database URL names a backend this crate does not support.
    #[error("unsupported database url '{0}' (expected sqlite: or postgres://)")]
    UnsupportedUrl(String),

    /// Payload (de)serialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    /// Shorthand for a [`StoreError::NotFound`].
    pub fn not_found(entity: &'static str, key: impl ToString) -> Self {
        StoreError::NotFound {
            entity,
            key: key.to_string(),
        }
    }

    /// Returns true if the database reported a lock or serialization conflict.
    ///
    /// Concurrent claimants losing a race surface as one of these; they are
    /// expected and logged at a lower level than other failures.
    pub fn is_conflict(&self) -> bool {
        match self {
            StoreError::Database { details, .. } => {
                let details = details.to_ascii_lowercase();
                details.contains("database is locked")
                    || details.contains("busy")
                    || details.contains("could not serialize")
                    || details.contains("deadlock")
            }
            _ => false,
        }
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Database {
            operation: "query",
            details: err.to_string(),
        }
    }
}
