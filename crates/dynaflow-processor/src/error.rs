// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for dynaflow-processor.

use thiserror::Error;

/// Processor errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Task store operation failed.
    #[error("Store error: {0}")]
    Store(#[from] dynaflow_core::StoreError),

    /// Message queue operation failed.
    #[error("Queue error: {0}")]
    Queue(#[from] crate::queue::QueueError),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Handler registration conflict.
    #[error("Registry error: {0}")]
    Registry(String),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// Result type using processor Error.
pub type Result<T> = std::result::Result<T, Error>;
