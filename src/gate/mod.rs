//! Approval gate — the mandatory human checkpoint.
//!
//! **Core invariant: no external effect without an approval decision.**
//! Every Item passes through PendingApproval; the executor only ever
//! consumes Approved. Decisions are compare-and-set on the pending stage,
//! so a second decision on the same Item is a stale-decision conflict.

pub mod routes;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{info, warn};
use uuid::Uuid;

use crate::audit::Actor;
use crate::error::{GateError, StoreError};
use crate::item::{Item, Stage};
use crate::store::PipelineStore;

/// Default broadcast channel capacity.
const DEFAULT_BROADCAST_CAPACITY: usize = 256;

/// A human decision on a pending Item.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum GateDecision {
    /// Clear the Item for execution.
    Approve,
    /// Decline, with feedback for re-planning.
    Reject { feedback: String },
    /// Leave the Item pending.
    Defer,
}

/// Events broadcast to gate clients (WebSocket fan-out).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GateEvent {
    /// An Item reached PendingApproval.
    ItemPending { item: Box<Item> },
    /// A decision moved an Item.
    ItemDecided { id: Uuid, stage: Stage },
    /// Full pending sync (sent on connect).
    PendingSync { items: Vec<Item> },
}

/// The approval gate over the pipeline store.
pub struct ApprovalGate {
    store: Arc<dyn PipelineStore>,
    tx: broadcast::Sender<GateEvent>,
}

impl ApprovalGate {
    pub fn new(store: Arc<dyn PipelineStore>) -> Arc<Self> {
        let (tx, _rx) = broadcast::channel(DEFAULT_BROADCAST_CAPACITY);
        Arc::new(Self { store, tx })
    }

    /// Subscribe to gate events. Each WS client calls this.
    pub fn subscribe(&self) -> broadcast::Receiver<GateEvent> {
        self.tx.subscribe()
    }

    /// Broadcast that an Item reached PendingApproval (called by the
    /// planner after promotion).
    pub fn notify_pending(&self, item: &Item) {
        let _ = self.tx.send(GateEvent::ItemPending {
            item: Box::new(item.clone()),
        });
    }

    /// Items awaiting a decision, oldest first.
    pub async fn pending(&self) -> Result<Vec<Item>, GateError> {
        Ok(self.store.items_in_stage(Stage::PendingApproval, 500).await?)
    }

    /// Record a decision on a pending Item.
    ///
    /// Conflict handling: the underlying transition is compare-and-set on
    /// PendingApproval. If another decision landed first, this returns
    /// `GateError::StaleDecision` and changes nothing.
    pub async fn decide(
        &self,
        id: Uuid,
        decision: GateDecision,
        user: &str,
    ) -> Result<Stage, GateError> {
        let actor = Actor::Gate(user.to_string());

        match decision {
            GateDecision::Approve => {
                self.transition_pending(id, Stage::Approved, &actor, Some("approved"))
                    .await?;
                info!(item_id = %id, user, "Item approved");
                let _ = self.tx.send(GateEvent::ItemDecided {
                    id,
                    stage: Stage::Approved,
                });
                Ok(Stage::Approved)
            }
            GateDecision::Reject { feedback } => {
                // Feedback lands before the transition so a re-planning
                // pass always sees it once the Item is Rejected.
                self.store.set_feedback(id, &feedback).await?;
                self.transition_pending(id, Stage::Rejected, &actor, Some("rejected"))
                    .await?;
                info!(item_id = %id, user, "Item rejected");
                let _ = self.tx.send(GateEvent::ItemDecided {
                    id,
                    stage: Stage::Rejected,
                });
                Ok(Stage::Rejected)
            }
            GateDecision::Defer => {
                // Not a transition — audit the decision and leave the
                // Item pending.
                let item = self
                    .store
                    .get_item(id)
                    .await?
                    .ok_or(GateError::NotFound { id })?;
                if item.stage != Stage::PendingApproval {
                    return Err(GateError::NotPending {
                        id,
                        stage: item.stage,
                    });
                }
                self.store
                    .append_audit(
                        id,
                        Some(Stage::PendingApproval),
                        Stage::PendingApproval,
                        &actor,
                        Some("deferred"),
                    )
                    .await?;
                info!(item_id = %id, user, "Item deferred");
                Ok(Stage::PendingApproval)
            }
        }
    }

    /// Explicit re-submission of a rejected Item back to planning.
    /// Never happens automatically.
    pub async fn resubmit(&self, id: Uuid, user: &str) -> Result<(), GateError> {
        let actor = Actor::Operator(user.to_string());
        self.store
            .transition(id, Stage::Rejected, Stage::Planned, &actor, Some("resubmitted"))
            .await
            .map_err(|e| self.map_conflict(id, e))?;
        info!(item_id = %id, user, "Rejected item resubmitted for planning");
        Ok(())
    }

    /// Manual retry of a failed Item: back to Approved with a fresh
    /// attempt budget.
    pub async fn retry_failed(&self, id: Uuid, user: &str) -> Result<(), GateError> {
        let actor = Actor::Operator(user.to_string());
        self.store
            .transition(id, Stage::Failed, Stage::Approved, &actor, Some("manual retry"))
            .await
            .map_err(|e| self.map_conflict(id, e))?;
        self.store.clear_retry(id).await?;
        info!(item_id = %id, user, "Failed item queued for manual retry");
        let _ = self.tx.send(GateEvent::ItemDecided {
            id,
            stage: Stage::Approved,
        });
        Ok(())
    }

    async fn transition_pending(
        &self,
        id: Uuid,
        to: Stage,
        actor: &Actor,
        detail: Option<&str>,
    ) -> Result<(), GateError> {
        self.store
            .transition(id, Stage::PendingApproval, to, actor, detail)
            .await
            .map_err(|e| self.map_conflict(id, e))
    }

    fn map_conflict(&self, id: Uuid, e: StoreError) -> GateError {
        match e {
            StoreError::StageConflict { actual, .. } => {
                warn!(item_id = %id, %actual, "Stale gate decision");
                GateError::StaleDecision { id, actual }
            }
            StoreError::NotFound { id } => GateError::NotFound { id },
            other => GateError::Store(other),
        }
    }
}
