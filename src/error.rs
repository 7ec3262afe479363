//! Error types for the pipeline.

use std::time::Duration;

use uuid::Uuid;

use crate::item::{Channel, Stage};

/// Top-level error type for the pipeline.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    #[error("Decision error: {0}")]
    Decision(#[from] DecisionError),

    #[error("Gate error: {0}")]
    Gate(#[from] GateError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Invalid cron expression '{expr}': {message}")]
    InvalidCron { expr: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Pipeline store errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Item not found: {id}")]
    NotFound { id: Uuid },

    #[error("Item {id} is in stage {actual}, expected {expected}")]
    StageConflict {
        id: Uuid,
        expected: Stage,
        actual: Stage,
    },

    #[error("Illegal transition for item {id}: {from} → {to}")]
    IllegalTransition { id: Uuid, from: Stage, to: Stage },

    #[error("Duplicate event: {channel}/{external_id} already admitted")]
    Duplicate {
        channel: Channel,
        external_id: String,
    },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Migration failed: {0}")]
    Migration(String),
}

/// Channel source errors. All variants are retryable at the next poll cycle.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("Authentication expired for channel {channel}")]
    AuthExpired { channel: Channel },

    #[error("Rate limited on channel {channel}, retry after {retry_after:?}")]
    RateLimited {
        channel: Channel,
        retry_after: Option<Duration>,
    },

    #[error("Forbidden scope on channel {channel}: {scope}")]
    ForbiddenScope { channel: Channel, scope: String },

    #[error("Malformed event from channel {channel}: {reason}")]
    Malformed { channel: Channel, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Decision engine errors.
#[derive(Debug, thiserror::Error)]
pub enum DecisionError {
    #[error("Cannot classify item {id}: {reason}")]
    Indeterminate { id: Uuid, reason: String },

    #[error("Invalid policy rule '{pattern}': {message}")]
    InvalidRule { pattern: String, message: String },
}

/// Approval gate errors.
#[derive(Debug, thiserror::Error)]
pub enum GateError {
    #[error("Item {id} not found")]
    NotFound { id: Uuid },

    #[error("Stale decision for item {id}: already in stage {actual}")]
    StaleDecision { id: Uuid, actual: Stage },

    #[error("Item {id} is in stage {stage}, not awaiting approval")]
    NotPending { id: Uuid, stage: Stage },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Capability dispatch errors.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Dispatch timed out after {timeout:?}")]
    Timeout { timeout: Duration },

    #[error("Transient failure: {0}")]
    Transient(String),

    #[error("Permanent failure: {0}")]
    Permanent(String),

    #[error("No capability registered for action kind {kind}")]
    NoCapability { kind: String },
}

impl DispatchError {
    /// Whether the executor should retry this failure with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Transient(_))
    }
}

/// Result type alias for the pipeline.
pub type Result<T> = std::result::Result<T, Error>;
