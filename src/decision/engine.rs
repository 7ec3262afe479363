//! Keyword decision engine — the deterministic default behind the
//! `DecisionEngine` trait.
//!
//! Given the same item content and the same policy table, the same
//! classification, priority, and approval flag always result. LLM-backed
//! engines can replace this behind the same trait, but may not let
//! generative variation leak into `requires_approval` or `priority`.

use async_trait::async_trait;

use crate::decision::policy::PolicyTable;
use crate::decision::{Decision, DecisionEngine};
use crate::error::DecisionError;
use crate::item::{ActionKind, Channel, Item, PlanStep};

/// Rule-driven decision engine.
pub struct KeywordEngine;

impl KeywordEngine {
    pub fn new() -> Self {
        Self
    }

    /// Pick the capability an item's plan dispatches to.
    fn action_for(item: &Item) -> ActionKind {
        match item.channel {
            Channel::Mail | Channel::SocialDm => ActionKind::SendMessage,
            Channel::SocialMention => ActionKind::PublishPost,
            Channel::ErpRequest => ActionKind::PostLedgerEntry,
            Channel::LocalDrop => ActionKind::ArchiveFile,
        }
    }

    /// Build the ordered plan for an action kind.
    fn plan_for(action: ActionKind, item: &Item) -> Vec<PlanStep> {
        let source = item
            .payload
            .sender
            .as_deref()
            .unwrap_or("the originating channel");
        match action {
            ActionKind::SendMessage => vec![
                PlanStep::new(format!("Draft a reply to {source}")),
                PlanStep::new("Send the reply through the originating channel"),
                PlanStep::new("Record the sent message for the thread history"),
            ],
            ActionKind::PublishPost => vec![
                PlanStep::new("Draft a public response to the mention"),
                PlanStep::new("Publish the post"),
            ],
            ActionKind::PostLedgerEntry => vec![
                PlanStep::new("Validate the business record fields"),
                PlanStep::new("Post the entry to the ledger"),
                PlanStep::new("Confirm the posted entry"),
            ],
            ActionKind::ArchiveFile => vec![
                PlanStep::new("File the dropped document into the archive"),
            ],
        }
    }
}

impl Default for KeywordEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DecisionEngine for KeywordEngine {
    async fn decide(&self, item: &Item, policy: &PolicyTable) -> Result<Decision, DecisionError> {
        let text = item.payload.text();
        let sender = item.payload.sender.as_deref();
        let subject = item.payload.subject.as_deref();

        // Empty payloads cannot be classified — surface as indeterminate
        // so the planner routes them to a human.
        if text.trim().is_empty() {
            return Err(DecisionError::Indeterminate {
                id: item.id,
                reason: "empty payload".into(),
            });
        }

        let classification = policy.classification_for(item.channel).to_string();
        let priority = policy.priority_for(sender, subject, &text);
        let approval_reason = policy.approval_reason(sender, subject, &text);
        let action = Self::action_for(item);
        let plan = Self::plan_for(action, item);

        Ok(Decision {
            classification,
            priority,
            requires_approval: approval_reason.is_some(),
            action,
            plan,
        })
    }
}
