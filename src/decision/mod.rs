//! Decision engine — pluggable classification and planning.
//!
//! The pipeline treats the engine as a black box: Item in, Decision out.
//! The default `KeywordEngine` is a deterministic rules engine; other
//! backends (a language model, a hybrid) can implement `DecisionEngine`
//! as long as `requires_approval` and `priority` stay deterministic for
//! the same content and policy.

pub mod engine;
pub mod policy;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::DecisionError;
use crate::item::{ActionKind, Item, PlanStep, Priority};

pub use engine::KeywordEngine;
pub use policy::{PolicyTable, RuleField};

/// Output of the decision engine for one Item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    /// Classification tag ("email", "social", "erp", "file", "unknown").
    pub classification: String,
    /// Assigned priority.
    pub priority: Priority,
    /// Whether a human must approve before execution.
    pub requires_approval: bool,
    /// Capability the plan dispatches to.
    pub action: ActionKind,
    /// Ordered plan steps.
    pub plan: Vec<PlanStep>,
}

impl Decision {
    /// The fallback decision when classification fails: route to a human.
    pub fn unknown(action: ActionKind) -> Self {
        Self {
            classification: "unknown".into(),
            priority: Priority::P3,
            requires_approval: true,
            action,
            plan: vec![PlanStep::new("Review manually — classification failed")],
        }
    }
}

/// Pluggable decision function: Item → (classification, priority,
/// approval-required, plan).
#[async_trait]
pub trait DecisionEngine: Send + Sync {
    async fn decide(&self, item: &Item, policy: &PolicyTable) -> Result<Decision, DecisionError>;
}
