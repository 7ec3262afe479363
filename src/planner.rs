//! Planner — the stage driver between intake and the gate.
//!
//! Each cycle drains Intake through the decision engine
//! (Intake → Classified → Planned), then promotes Planned items to
//! PendingApproval. Items that need no human decision are auto-approved
//! there under the `auto-policy` actor, so every Item reaches Approved
//! through the same gate stage. Failures on individual items are logged
//! and contained; the cycle continues.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::audit::Actor;
use crate::decision::{Decision, DecisionEngine, PolicyTable};
use crate::gate::ApprovalGate;
use crate::item::{Item, Stage};
use crate::store::PipelineStore;

/// How many items one cycle pulls per stage.
const CYCLE_BATCH: usize = 100;

/// Drives items from Intake to the gate.
pub struct Planner {
    store: Arc<dyn PipelineStore>,
    engine: Arc<dyn DecisionEngine>,
    policy: PolicyTable,
    gate: Arc<ApprovalGate>,
}

impl Planner {
    pub fn new(
        store: Arc<dyn PipelineStore>,
        engine: Arc<dyn DecisionEngine>,
        policy: PolicyTable,
        gate: Arc<ApprovalGate>,
    ) -> Self {
        Self {
            store,
            engine,
            policy,
            gate,
        }
    }

    /// Run one planning cycle. Returns how many items moved.
    pub async fn run_cycle(&self) -> usize {
        let mut moved = 0;
        moved += self.classify_intake().await;
        moved += self.promote_planned().await;
        moved
    }

    /// Intake → Classified → Planned, via the decision engine.
    async fn classify_intake(&self) -> usize {
        let items = match self.store.items_in_stage(Stage::Intake, CYCLE_BATCH).await {
            Ok(items) => items,
            Err(e) => {
                error!(error = %e, "Failed to list intake items");
                return 0;
            }
        };

        let mut moved = 0;
        for item in items {
            match self.classify_one(&item).await {
                Ok(()) => moved += 1,
                Err(e) => {
                    error!(item_id = %item.id, error = %e, "Planning failed for item");
                }
            }
        }
        moved
    }

    async fn classify_one(&self, item: &Item) -> crate::error::Result<()> {
        // A failed decision is a classification error, not a pipeline
        // failure: force "unknown" and route to a human.
        let decision = match self.engine.decide(item, &self.policy).await {
            Ok(decision) => decision,
            Err(e) => {
                warn!(item_id = %item.id, error = %e, "Classification indeterminate, routing to human");
                Decision::unknown(default_action(item))
            }
        };

        self.store.record_decision(item.id, &decision).await?;
        self.store
            .transition(
                item.id,
                Stage::Intake,
                Stage::Classified,
                &Actor::Planner,
                Some(&format!(
                    "classified {} priority {}",
                    decision.classification, decision.priority
                )),
            )
            .await?;
        self.store
            .transition(
                item.id,
                Stage::Classified,
                Stage::Planned,
                &Actor::Planner,
                Some(&format!("{} plan steps", decision.plan.len())),
            )
            .await?;

        debug!(
            item_id = %item.id,
            classification = %decision.classification,
            priority = %decision.priority,
            requires_approval = decision.requires_approval,
            "Item planned"
        );
        Ok(())
    }

    /// Planned → PendingApproval, auto-approving items that need no
    /// human decision.
    async fn promote_planned(&self) -> usize {
        let items = match self.store.items_in_stage(Stage::Planned, CYCLE_BATCH).await {
            Ok(items) => items,
            Err(e) => {
                error!(error = %e, "Failed to list planned items");
                return 0;
            }
        };

        let mut moved = 0;
        for item in items {
            match self.promote_one(&item).await {
                Ok(()) => moved += 1,
                Err(e) => {
                    error!(item_id = %item.id, error = %e, "Promotion failed for item");
                }
            }
        }
        moved
    }

    async fn promote_one(&self, item: &Item) -> crate::error::Result<()> {
        self.store
            .transition(
                item.id,
                Stage::Planned,
                Stage::PendingApproval,
                &Actor::Planner,
                None,
            )
            .await?;

        if item.requires_approval {
            if let Ok(Some(pending)) = self.store.get_item(item.id).await {
                self.gate.notify_pending(&pending);
            }
            return Ok(());
        }

        // No human decision needed — auto-approve through the same stage
        // so the audit trail shows a single legal path to Approved.
        self.store
            .transition(
                item.id,
                Stage::PendingApproval,
                Stage::Approved,
                &Actor::AutoPolicy,
                Some("auto-approved: no approval signal"),
            )
            .await?;
        info!(item_id = %item.id, "Item auto-approved");
        Ok(())
    }
}

/// Fallback action kind when classification fails.
fn default_action(item: &Item) -> crate::item::ActionKind {
    use crate::item::{ActionKind, Channel};
    match item.channel {
        Channel::Mail | Channel::SocialDm => ActionKind::SendMessage,
        Channel::SocialMention => ActionKind::PublishPost,
        Channel::ErpRequest => ActionKind::PostLedgerEntry,
        Channel::LocalDrop => ActionKind::ArchiveFile,
    }
}

/// Spawn the planner on an interval. Returns the handle and a shutdown flag.
pub fn spawn_planner(planner: Arc<Planner>, interval: Duration) -> (JoinHandle<()>, Arc<AtomicBool>) {
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = Arc::clone(&shutdown);

    let handle = tokio::spawn(async move {
        info!("Planner started — cycle every {:?}", interval);
        let mut tick = tokio::time::interval(interval);

        loop {
            tick.tick().await;
            if shutdown.load(Ordering::Relaxed) {
                info!("Planner shutting down");
                return;
            }
            planner.run_cycle().await;
        }
    });

    (handle, shutdown_flag)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision::KeywordEngine;
    use crate::error::DecisionError;
    use crate::item::{Channel, NewItem, Payload, Priority};
    use crate::store::LibSqlStore;
    use async_trait::async_trait;
    use chrono::Utc;

    async fn setup() -> (Arc<dyn PipelineStore>, Planner) {
        let store: Arc<dyn PipelineStore> = Arc::new(LibSqlStore::open_memory().await.unwrap());
        let gate = ApprovalGate::new(Arc::clone(&store));
        let planner = Planner::new(
            Arc::clone(&store),
            Arc::new(KeywordEngine::new()),
            PolicyTable::default_rules(),
            gate,
        );
        (store, planner)
    }

    async fn admit(store: &Arc<dyn PipelineStore>, channel: Channel, body: &str) -> Item {
        let new_item = NewItem::new(
            channel,
            uuid::Uuid::new_v4().to_string(),
            Payload {
                sender: Some("alice@example.com".into()),
                subject: None,
                body: body.into(),
                metadata: serde_json::json!({}),
            },
            Utc::now(),
        );
        store.admit(&new_item, &Actor::Watcher(channel)).await.unwrap()
    }

    #[tokio::test]
    async fn gated_item_stops_at_pending_approval() {
        let (store, planner) = setup().await;
        let item = admit(&store, Channel::Mail, "my payment failed, please reply").await;

        planner.run_cycle().await;

        let loaded = store.get_item(item.id).await.unwrap().unwrap();
        assert_eq!(loaded.stage, Stage::PendingApproval);
        assert_eq!(loaded.priority, Some(Priority::P1));
        assert!(loaded.requires_approval);
        assert_eq!(loaded.classification.as_deref(), Some("email"));
    }

    #[tokio::test]
    async fn ungated_item_is_auto_approved() {
        let (store, planner) = setup().await;
        let item = admit(&store, Channel::Mail, "weekly metrics attached for your records").await;

        planner.run_cycle().await;

        let loaded = store.get_item(item.id).await.unwrap().unwrap();
        assert_eq!(loaded.stage, Stage::Approved);
        assert!(!loaded.requires_approval);

        // Auto-approval still passed through the gate stage in the audit.
        let audit = store.audit_for_item(item.id).await.unwrap();
        let stages: Vec<Stage> = audit.iter().map(|r| r.to_stage).collect();
        assert!(stages.contains(&Stage::PendingApproval));
        assert!(crate::audit::validate_path(&audit).is_ok());
        let auto = audit
            .iter()
            .find(|r| r.to_stage == Stage::Approved)
            .unwrap();
        assert_eq!(auto.actor, Actor::AutoPolicy);
    }

    #[tokio::test]
    async fn cycle_is_idempotent_when_nothing_new() {
        let (store, planner) = setup().await;
        admit(&store, Channel::Mail, "weekly metrics attached for your records").await;

        planner.run_cycle().await;
        assert_eq!(planner.run_cycle().await, 0);
    }

    /// Engine that always fails, to exercise the classification-error path.
    struct BrokenEngine;

    #[async_trait]
    impl DecisionEngine for BrokenEngine {
        async fn decide(
            &self,
            item: &Item,
            _policy: &PolicyTable,
        ) -> Result<Decision, DecisionError> {
            Err(DecisionError::Indeterminate {
                id: item.id,
                reason: "broken".into(),
            })
        }
    }

    #[tokio::test]
    async fn classification_error_routes_to_human_as_unknown() {
        let store: Arc<dyn PipelineStore> = Arc::new(LibSqlStore::open_memory().await.unwrap());
        let gate = ApprovalGate::new(Arc::clone(&store));
        let planner = Planner::new(
            Arc::clone(&store),
            Arc::new(BrokenEngine),
            PolicyTable::default_rules(),
            gate,
        );
        let item = admit(&store, Channel::Mail, "anything").await;

        planner.run_cycle().await;

        let loaded = store.get_item(item.id).await.unwrap().unwrap();
        assert_eq!(loaded.stage, Stage::PendingApproval);
        assert_eq!(loaded.classification.as_deref(), Some("unknown"));
        assert!(loaded.requires_approval);
    }

    #[tokio::test]
    async fn resubmitted_item_is_repromoted() {
        let (store, planner) = setup().await;
        let item = admit(&store, Channel::Mail, "please reply about the invoice").await;

        planner.run_cycle().await;
        assert_eq!(
            store.get_item(item.id).await.unwrap().unwrap().stage,
            Stage::PendingApproval
        );

        // Reject, then explicit resubmit back to Planned.
        store.set_feedback(item.id, "wrong tone").await.unwrap();
        store
            .transition(
                item.id,
                Stage::PendingApproval,
                Stage::Rejected,
                &Actor::Gate("alice".into()),
                None,
            )
            .await
            .unwrap();
        store
            .transition(
                item.id,
                Stage::Rejected,
                Stage::Planned,
                &Actor::Operator("ops".into()),
                None,
            )
            .await
            .unwrap();

        planner.run_cycle().await;
        let loaded = store.get_item(item.id).await.unwrap().unwrap();
        assert_eq!(loaded.stage, Stage::PendingApproval);
        // Feedback survives the loop for the next reviewer.
        assert_eq!(loaded.feedback.as_deref(), Some("wrong tone"));
    }

    #[tokio::test]
    async fn spawned_planner_stops_on_shutdown() {
        let (_store, planner) = setup().await;
        let (handle, shutdown) =
            spawn_planner(Arc::new(planner), Duration::from_millis(10));

        shutdown.store(true, Ordering::Relaxed);
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("planner did not stop")
            .unwrap();
    }
}
