//! Item data model — the unit of pipeline work, its stage machine, and
//! the enums that classify it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// External source of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    /// Inbox mail.
    Mail,
    /// Public social mention.
    SocialMention,
    /// Social direct message.
    SocialDm,
    /// ERP/business-record request.
    ErpRequest,
    /// Local drop folder.
    LocalDrop,
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Mail => "mail",
            Self::SocialMention => "social_mention",
            Self::SocialDm => "social_dm",
            Self::ErpRequest => "erp_request",
            Self::LocalDrop => "local_drop",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for Channel {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mail" => Ok(Self::Mail),
            "social_mention" => Ok(Self::SocialMention),
            "social_dm" => Ok(Self::SocialDm),
            "erp_request" => Ok(Self::ErpRequest),
            "local_drop" => Ok(Self::LocalDrop),
            _ => Err(format!("Unknown channel: {}", s)),
        }
    }
}

/// Position of an Item in the pipeline state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Freshly admitted by a watcher.
    Intake,
    /// Classification and priority assigned.
    Classified,
    /// Plan attached.
    Planned,
    /// Awaiting a human (or auto-policy) decision.
    PendingApproval,
    /// Cleared for execution.
    Approved,
    /// Declined by the gate; feedback attached.
    Rejected,
    /// Executed successfully.
    Done,
    /// Retries exhausted or permanent failure.
    Failed,
}

impl Stage {
    /// Check whether a transition along the pipeline graph is legal.
    ///
    /// The only backward edges are explicit operator actions:
    /// Rejected → Planned (resubmit) and Failed → Approved (manual retry).
    pub fn can_transition_to(&self, target: Stage) -> bool {
        use Stage::*;

        matches!(
            (self, target),
            (Intake, Classified)
                | (Classified, Planned)
                | (Planned, PendingApproval)
                | (PendingApproval, Approved)
                | (PendingApproval, Rejected)
                | (Approved, Done)
                | (Approved, Failed)
                | (Rejected, Planned)
                | (Failed, Approved)
        )
    }

    /// Terminal unless explicitly re-submitted or retried.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Rejected | Self::Failed)
    }

    /// Whether the executor may pick this Item up.
    pub fn is_executable(&self) -> bool {
        matches!(self, Self::Approved)
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Intake => "intake",
            Self::Classified => "classified",
            Self::Planned => "planned",
            Self::PendingApproval => "pending_approval",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for Stage {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "intake" => Ok(Self::Intake),
            "classified" => Ok(Self::Classified),
            "planned" => Ok(Self::Planned),
            "pending_approval" => Ok(Self::PendingApproval),
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            "done" => Ok(Self::Done),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Unknown stage: {}", s)),
        }
    }
}

/// Priority assigned by the decision engine, never by a watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Priority {
    P1,
    P2,
    P3,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::P1 => "p1",
            Self::P2 => "p2",
            Self::P3 => "p3",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for Priority {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "p1" => Ok(Self::P1),
            "p2" => Ok(Self::P2),
            "p3" => Ok(Self::P3),
            _ => Err(format!("Unknown priority: {}", s)),
        }
    }
}

/// The external effect an approved Item's plan produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    /// Send a reply through the originating channel.
    SendMessage,
    /// Publish a public post.
    PublishPost,
    /// Post an entry to the business ledger.
    PostLedgerEntry,
    /// File a dropped document into the archive.
    ArchiveFile,
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::SendMessage => "send_message",
            Self::PublishPost => "publish_post",
            Self::PostLedgerEntry => "post_ledger_entry",
            Self::ArchiveFile => "archive_file",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for ActionKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "send_message" => Ok(Self::SendMessage),
            "publish_post" => Ok(Self::PublishPost),
            "post_ledger_entry" => Ok(Self::PostLedgerEntry),
            "archive_file" => Ok(Self::ArchiveFile),
            _ => Err(format!("Unknown action kind: {}", s)),
        }
    }
}

/// One step of an Item's plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStep {
    /// What this step does.
    pub description: String,
    /// Completion flag, set by the executor.
    #[serde(default)]
    pub done: bool,
}

impl PlanStep {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            done: false,
        }
    }
}

/// Outcome of one execution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Succeeded,
    TransientFailure,
    PermanentFailure,
}

impl std::fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Succeeded => "succeeded",
            Self::TransientFailure => "transient_failure",
            Self::PermanentFailure => "permanent_failure",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for AttemptOutcome {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "succeeded" => Ok(Self::Succeeded),
            "transient_failure" => Ok(Self::TransientFailure),
            "permanent_failure" => Ok(Self::PermanentFailure),
            _ => Err(format!("Unknown attempt outcome: {}", s)),
        }
    }
}

/// One recorded execution attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attempt {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: AttemptOutcome,
    /// Error detail or success summary.
    pub detail: String,
    /// Diagnostic snapshot captured by the capability, where supported.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<serde_json::Value>,
}

/// Normalized event payload carried by an Item.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Payload {
    /// Sender identifier (address, handle), if the channel has one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    /// Subject or title, if the channel has one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    /// Body content.
    pub body: String,
    /// Channel-specific metadata (threading headers, record ids, file paths).
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl Payload {
    /// Concatenated text the policy rules match against.
    pub fn text(&self) -> String {
        let mut text = String::with_capacity(self.body.len() + 64);
        if let Some(ref subject) = self.subject {
            text.push_str(subject);
            text.push('\n');
        }
        text.push_str(&self.body);
        text
    }
}

/// The unit of pipeline work, derived from one external event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Item {
    /// Pipeline-internal ID.
    pub id: Uuid,
    /// Originating channel.
    pub channel: Channel,
    /// Channel-native event ID. `(channel, external_id)` is globally unique.
    pub external_id: String,
    /// Normalized event content.
    pub payload: Payload,
    /// Current pipeline stage.
    pub stage: Stage,
    /// Classification tag, assigned by the decision engine.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classification: Option<String>,
    /// Priority, assigned by the decision engine.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
    /// Sticky approval flag — once true, only a human decision resolves it.
    pub requires_approval: bool,
    /// Capability selector, assigned by the decision engine.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<ActionKind>,
    /// Ordered plan steps, present once stage ≥ Planned.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub plan: Vec<PlanStep>,
    /// Rejection feedback from the gate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<String>,
    /// Execution attempt history, oldest first. Loaded on single-item
    /// reads; list queries leave it empty.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attempts: Vec<Attempt>,
    /// Set by the startup consistency check when audit and stage disagree.
    pub review_required: bool,
    /// Retry schedule — the executor skips the Item until this passes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_attempt_at: Option<DateTime<Utc>>,
    /// When the channel reported the event.
    pub received_at: DateTime<Utc>,
    /// When the Item was admitted.
    pub created_at: DateTime<Utc>,
    /// When the Item last changed stage.
    pub last_transition_at: DateTime<Utc>,
}

/// A new Item before admission — everything the watcher knows.
#[derive(Debug, Clone)]
pub struct NewItem {
    pub channel: Channel,
    pub external_id: String,
    pub payload: Payload,
    pub received_at: DateTime<Utc>,
}

impl NewItem {
    pub fn new(
        channel: Channel,
        external_id: impl Into<String>,
        payload: Payload,
        received_at: DateTime<Utc>,
    ) -> Self {
        Self {
            channel,
            external_id: external_id.into(),
            payload,
            received_at,
        }
    }
}
