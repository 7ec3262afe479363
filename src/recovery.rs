//! Startup recovery — replay the audit tail against persisted stages.
//!
//! A crash can only leave two classes of damage: a lease held by a dead
//! executor, or (under storage corruption) an Item whose persisted stage
//! disagrees with its last audited transition. Recovery reclaims the
//! former and flags the latter for manual review. A mismatch is fatal
//! for the affected Item only, never for the process.

use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::audit;
use crate::error::Result;
use crate::store::PipelineStore;

/// One inconsistency found at startup.
#[derive(Debug, Clone)]
pub struct ConsistencyIssue {
    pub item_id: Uuid,
    pub reason: String,
}

/// Summary of a recovery pass.
#[derive(Debug, Default)]
pub struct ConsistencyReport {
    /// Items inspected.
    pub checked: usize,
    /// Items flagged for manual review.
    pub flagged: Vec<ConsistencyIssue>,
    /// Expired leases reclaimed.
    pub leases_reclaimed: usize,
}

impl ConsistencyReport {
    pub fn is_clean(&self) -> bool {
        self.flagged.is_empty()
    }
}

/// Run the startup consistency check against the store.
pub async fn check_consistency(store: &dyn PipelineStore) -> Result<ConsistencyReport> {
    let mut report = ConsistencyReport {
        leases_reclaimed: store.expire_leases(Utc::now()).await?,
        ..Default::default()
    };

    for id in store.all_item_ids().await? {
        report.checked += 1;

        let Some(item) = store.get_item(id).await? else {
            continue;
        };
        let records = store.audit_for_item(id).await?;

        let reason = if records.is_empty() {
            Some("no audit records for persisted item".to_string())
        } else {
            let last = records
                .iter()
                .rev()
                .find(|r| !r.is_same_stage())
                .unwrap_or_else(|| records.last().expect("records is non-empty"));
            if last.to_stage != item.stage {
                Some(format!(
                    "persisted stage {} does not match last audited transition to {}",
                    item.stage, last.to_stage
                ))
            } else if let Err(e) = audit::validate_path(&records) {
                Some(format!("invalid audit path: {e}"))
            } else {
                None
            }
        };

        if let Some(reason) = reason {
            warn!(item_id = %id, %reason, "Consistency check failed for item");
            store.flag_for_review(id, &reason).await?;
            report.flagged.push(ConsistencyIssue { item_id: id, reason });
        }
    }

    if report.is_clean() {
        info!(
            checked = report.checked,
            leases_reclaimed = report.leases_reclaimed,
            "Consistency check passed"
        );
    } else {
        warn!(
            checked = report.checked,
            flagged = report.flagged.len(),
            "Consistency check flagged items for manual review"
        );
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::Actor;
    use crate::item::{Channel, NewItem, Payload, Stage};
    use crate::store::{LibSqlStore, PipelineStore};
    use std::sync::Arc;

    async fn admitted_store() -> (Arc<dyn PipelineStore>, Uuid) {
        let store: Arc<dyn PipelineStore> = Arc::new(LibSqlStore::open_memory().await.unwrap());
        let item = store
            .admit(
                &NewItem::new(
                    Channel::Mail,
                    "m-1",
                    Payload {
                        sender: None,
                        subject: None,
                        body: "hello".into(),
                        metadata: serde_json::json!({}),
                    },
                    Utc::now(),
                ),
                &Actor::Watcher(Channel::Mail),
            )
            .await
            .unwrap();
        (store, item.id)
    }

    #[tokio::test]
    async fn clean_store_passes() {
        let (store, id) = admitted_store().await;
        store
            .transition(id, Stage::Intake, Stage::Classified, &Actor::Planner, None)
            .await
            .unwrap();

        let report = check_consistency(store.as_ref()).await.unwrap();
        assert!(report.is_clean());
        assert_eq!(report.checked, 1);

        let item = store.get_item(id).await.unwrap().unwrap();
        assert!(!item.review_required);
    }

    #[tokio::test]
    async fn stale_lease_is_reclaimed() {
        let (store, id) = admitted_store().await;
        let past = Utc::now() - chrono::Duration::seconds(30);
        store.acquire_lease(id, "dead-executor", past).await.unwrap();

        let report = check_consistency(store.as_ref()).await.unwrap();
        assert_eq!(report.leases_reclaimed, 1);
        assert!(report.is_clean());
    }

    #[tokio::test]
    async fn defer_records_do_not_trip_the_check() {
        let (store, id) = admitted_store().await;
        // A same-stage record after the last transition must not be read
        // as the current stage.
        store
            .append_audit(
                id,
                Some(Stage::Intake),
                Stage::Intake,
                &Actor::Gate("alice".into()),
                Some("noted"),
            )
            .await
            .unwrap();

        let report = check_consistency(store.as_ref()).await.unwrap();
        assert!(report.is_clean());
    }

    #[tokio::test]
    async fn mismatched_stage_is_flagged_not_fatal() {
        let (store, id) = admitted_store().await;
        // Simulate corruption: an audit record claiming a transition the
        // item table never saw.
        store
            .append_audit(id, Some(Stage::Intake), Stage::Classified, &Actor::Planner, None)
            .await
            .unwrap();

        let report = check_consistency(store.as_ref()).await.unwrap();
        assert_eq!(report.flagged.len(), 1);
        assert_eq!(report.flagged[0].item_id, id);

        // The item is flagged, still present, still in one stage.
        let item = store.get_item(id).await.unwrap().unwrap();
        assert!(item.review_required);
        assert_eq!(item.stage, Stage::Intake);
    }

    #[tokio::test]
    async fn healthy_items_are_not_affected_by_a_flagged_one() {
        let (store, bad) = admitted_store().await;
        store
            .append_audit(bad, Some(Stage::Intake), Stage::Classified, &Actor::Planner, None)
            .await
            .unwrap();

        let good = store
            .admit(
                &NewItem::new(
                    Channel::Mail,
                    "m-2",
                    Payload {
                        sender: None,
                        subject: None,
                        body: "fine".into(),
                        metadata: serde_json::json!({}),
                    },
                    Utc::now(),
                ),
                &Actor::Watcher(Channel::Mail),
            )
            .await
            .unwrap();

        let report = check_consistency(store.as_ref()).await.unwrap();
        assert_eq!(report.checked, 2);
        assert_eq!(report.flagged.len(), 1);
        assert!(!store.get_item(good.id).await.unwrap().unwrap().review_required);
    }
}
