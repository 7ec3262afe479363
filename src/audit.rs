//! Append-only audit log records and stage-path validation.
//!
//! Every stage transition writes exactly one audit record in the same
//! store transaction. Non-transition events (defer decisions) append a
//! same-stage record, which path validation skips.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::item::{Channel, Stage};

/// Who caused a transition or decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Actor {
    /// A channel watcher admitting an event.
    Watcher(Channel),
    /// The planner driving classification and planning.
    Planner,
    /// Policy auto-approval of items that need no human decision.
    AutoPolicy,
    /// A human actor at the gate.
    Gate(String),
    /// The dispatch executor.
    Executor,
    /// An operator action (resubmit, manual retry).
    Operator(String),
}

impl std::fmt::Display for Actor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Watcher(channel) => write!(f, "watcher:{channel}"),
            Self::Planner => write!(f, "planner"),
            Self::AutoPolicy => write!(f, "auto-policy"),
            Self::Gate(user) => write!(f, "gate:{user}"),
            Self::Executor => write!(f, "executor"),
            Self::Operator(user) => write!(f, "operator:{user}"),
        }
    }
}

impl std::str::FromStr for Actor {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(channel) = s.strip_prefix("watcher:") {
            return Ok(Self::Watcher(channel.parse()?));
        }
        if let Some(user) = s.strip_prefix("gate:") {
            return Ok(Self::Gate(user.to_string()));
        }
        if let Some(user) = s.strip_prefix("operator:") {
            return Ok(Self::Operator(user.to_string()));
        }
        match s {
            "planner" => Ok(Self::Planner),
            "auto-policy" => Ok(Self::AutoPolicy),
            "executor" => Ok(Self::Executor),
            _ => Err(format!("Unknown actor: {}", s)),
        }
    }
}

/// One audit log record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    /// Monotonic sequence number assigned by the store.
    pub seq: i64,
    pub ts: DateTime<Utc>,
    pub item_id: Uuid,
    /// `None` for the admission record.
    pub from_stage: Option<Stage>,
    pub to_stage: Stage,
    pub actor: Actor,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl AuditRecord {
    /// A defer or other decision that did not move the Item.
    pub fn is_same_stage(&self) -> bool {
        self.from_stage == Some(self.to_stage)
    }
}

/// Validate that an Item's audit records form a legal path through the
/// stage machine. Same-stage records are skipped; the first record must
/// be the admission into Intake.
pub fn validate_path(records: &[AuditRecord]) -> Result<(), String> {
    let mut current: Option<Stage> = None;
    for record in records {
        if record.is_same_stage() {
            continue;
        }
        match (current, record.from_stage) {
            (None, None) => {
                if record.to_stage != Stage::Intake {
                    return Err(format!(
                        "first transition must admit to intake, got {}",
                        record.to_stage
                    ));
                }
            }
            (Some(stage), Some(from)) if stage == from => {
                if !from.can_transition_to(record.to_stage) {
                    return Err(format!("illegal transition {} → {}", from, record.to_stage));
                }
            }
            (current, from) => {
                return Err(format!(
                    "discontinuous audit trail: at {:?}, record claims from {:?}",
                    current, from
                ));
            }
        }
        current = Some(record.to_stage);
    }
    Ok(())
}
