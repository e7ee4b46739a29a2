// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the replication agent.
//!
//! Errors are categorized by their source (configuration, node connectivity,
//! database driver) and carry the node name and operation so a log line is
//! enough to find the failing side of the pair.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `Config` | No | Missing master/slave entry, unknown strategy token, bad values |
//! | `Connectivity` | Yes | Probe failed, connection refused |
//! | `Timeout` | Yes | Probe or driver call exceeded the node timeout |
//! | `Driver` | Yes | Query/write failed while creating schema or copying points |
//! | `InvalidState` | No | Lifecycle misuse (e.g. `start()` twice) |
//! | `Shutdown` | No | Agent is shutting down |
//! | `Internal` | No | Unexpected internal error |
//!
//! # Retry Behavior
//!
//! The supervisor never propagates a retryable error out of its loop: the
//! failing cycle is logged and skipped, and the next cycle repeats the same
//! comparison from scratch. Non-retryable errors indicate something an
//! operator has to fix.

use std::time::Duration;
use thiserror::Error;

/// Result type alias for agent operations.
pub type Result<T> = std::result::Result<T, ReplicationError>;

/// Errors that can occur while monitoring or replicating.
#[derive(Error, Debug, Clone)]
pub enum ReplicationError {
    /// Invalid or missing configuration.
    ///
    /// Bootstrap keeps retrying on these; the initial strategy step is
    /// skipped when its token is unknown.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Node unreachable or probe rejected.
    #[error("Connectivity error ({node}): {message}")]
    Connectivity { node: String, message: String },

    /// Call exceeded the per-node timeout.
    #[error("Timeout ({node}): no answer within {}ms", timeout.as_millis())]
    Timeout { node: String, timeout: Duration },

    /// Database driver failure during schema or data replication.
    #[error("Driver error ({node}, {operation}): {message}")]
    Driver {
        node: String,
        operation: String,
        message: String,
    },

    /// Lifecycle state machine violation.
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Shutdown in progress.
    #[error("Shutdown in progress")]
    Shutdown,

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ReplicationError {
    /// Create a connectivity error for a node.
    pub fn connectivity(node: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Connectivity {
            node: node.into(),
            message: message.into(),
        }
    }

    /// Create a driver error with node and operation context.
    pub fn driver(
        node: impl Into<String>,
        operation: impl Into<String>,
        message: impl std::fmt::Display,
    ) -> Self {
        Self::Driver {
            node: node.into(),
            operation: operation.into(),
            message: message.to_string(),
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connectivity { .. } => true,
            Self::Timeout { .. } => true,
            Self::Driver { .. } => true,
            Self::Config(_) => false,
            Self::InvalidState { .. } => false,
            Self::Shutdown => false,
            Self::Internal(_) => false,
        }
    }

    /// Short label used for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::Connectivity { .. } => "connectivity",
            Self::Timeout { .. } => "timeout",
            Self::Driver { .. } => "driver",
            Self::InvalidState { .. } => "invalid_state",
            Self::Shutdown => "shutdown",
            Self::Internal(_) => "internal",
        }
    }
}

impl From<serde_yaml::Error> for ReplicationError {
    fn from(e: serde_yaml::Error) -> Self {
        Self::Config(format!("invalid YAML: {}", e))
    }
}
