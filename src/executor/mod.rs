//! Executor — dispatches approved Items to capability handlers.
//!
//! A `Capability` is an external collaborator implementing one action
//! kind behind a uniform `execute(Item) → Outcome` contract. The
//! registry maps action kinds to handlers; the dispatch loop in
//! `dispatch.rs` drives leasing, timeouts, and retries.

pub mod archive;
pub mod dispatch;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::ExecutorConfig;
use crate::error::DispatchError;
use crate::item::{ActionKind, Item};

pub use archive::ArchiveFileCapability;
pub use dispatch::{Executor, spawn_executor};

/// Result of one capability execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Outcome {
    /// Whether the external effect succeeded.
    pub success: bool,
    /// Human-readable summary or failure explanation.
    pub detail: String,
    /// Diagnostic snapshot for post-mortem, where the handler supports one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<serde_json::Value>,
}

impl Outcome {
    pub fn ok(detail: impl Into<String>) -> Self {
        Self {
            success: true,
            detail: detail.into(),
            artifact: None,
        }
    }

    pub fn with_artifact(mut self, artifact: serde_json::Value) -> Self {
        self.artifact = Some(artifact);
        self
    }
}

/// A capability handler for one action kind.
///
/// Handlers must tolerate at-least-once invocation: a timed-out dispatch
/// is retried, so re-executing after a timeout must not duplicate the
/// external effect where the platform allows (idempotency tokens).
#[async_trait]
pub trait Capability: Send + Sync {
    /// The action kind this handler implements.
    fn kind(&self) -> ActionKind;

    /// Perform the Item's action.
    async fn execute(&self, item: &Item) -> Result<Outcome, DispatchError>;
}

/// Registry of capability handlers, keyed by action kind.
pub struct CapabilityRegistry {
    handlers: RwLock<HashMap<ActionKind, Arc<dyn Capability>>>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
        }
    }

    /// Register a handler. Replaces any previous handler for the kind.
    pub fn register(&self, capability: Arc<dyn Capability>) {
        let kind = capability.kind();
        self.handlers
            .write()
            .expect("capability registry lock poisoned")
            .insert(kind, capability);
    }

    pub fn get(&self, kind: ActionKind) -> Option<Arc<dyn Capability>> {
        self.handlers
            .read()
            .expect("capability registry lock poisoned")
            .get(&kind)
            .cloned()
    }

    pub fn count(&self) -> usize {
        self.handlers
            .read()
            .expect("capability registry lock poisoned")
            .len()
    }
}

impl Default for CapabilityRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Exponential backoff with jitter for transient failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum attempts per approval before the Item fails.
    pub max_attempts: u32,
    /// First retry delay; doubles per attempt.
    pub base: Duration,
    /// Backoff ceiling.
    pub max: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &ExecutorConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base: config.backoff_base,
            max: config.backoff_max,
        }
    }

    /// Delay before the next attempt, given how many attempts have run.
    /// `base · 2^(attempts-1)`, capped, plus up to 20% jitter.
    pub fn delay_for(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(16);
        let backoff = self
            .base
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(self.max);
        let jitter_ms = (backoff.as_millis() as u64) / 5;
        let jitter = if jitter_ms > 0 {
            Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
        } else {
            Duration::ZERO
        };
        backoff + jitter
    }
}
