//! libSQL backend — async `PipelineStore` implementation.
//!
//! Supports local file and in-memory databases. Stage transitions are
//! compare-and-set UPDATEs paired with their audit record inside one
//! transaction, so an Item is never observed between stages and an audit
//! row exists for every transition that committed.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};
use uuid::Uuid;

use crate::audit::{Actor, AuditRecord};
use crate::decision::Decision;
use crate::error::StoreError;
use crate::item::{Attempt, Channel, Item, NewItem, Payload, Stage};
use crate::store::migrations;
use crate::store::traits::PipelineStore;

/// Column list shared by every item SELECT.
///
/// 0:id, 1:channel, 2:external_id, 3:sender, 4:subject, 5:body,
/// 6:metadata, 7:stage, 8:classification, 9:priority,
/// 10:requires_approval, 11:action_kind, 12:plan, 13:feedback,
/// 14:review_required, 15:next_attempt_at, 16:received_at,
/// 17:created_at, 18:last_transition_at
const ITEM_COLUMNS: &str = "id, channel, external_id, sender, subject, body, metadata, stage, \
     classification, priority, requires_approval, action_kind, plan, feedback, \
     review_required, next_attempt_at, received_at, created_at, last_transition_at";

/// libSQL pipeline store.
///
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlStore {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlStore {
    /// Open (or create) a local database file and run migrations.
    pub async fn open_local(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Connection(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| StoreError::Connection(format!("Failed to open database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| StoreError::Connection(format!("Failed to create connection: {e}")))?;

        let store = Self {
            db: Arc::new(db),
            conn,
        };
        migrations::run(&store.conn).await?;
        info!(path = %path.display(), "Pipeline store opened");
        Ok(store)
    }

    /// Create an in-memory database (for tests).
    pub async fn open_memory() -> Result<Self, StoreError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                StoreError::Connection(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| StoreError::Connection(format!("Failed to create connection: {e}")))?;

        let store = Self {
            db: Arc::new(db),
            conn,
        };
        migrations::run(&store.conn).await?;
        Ok(store)
    }

    async fn current_stage(&self, id: Uuid) -> Result<Option<Stage>, StoreError> {
        let mut rows = self
            .conn
            .query(
                "SELECT stage FROM items WHERE id = ?1",
                params![id.to_string()],
            )
            .await
            .map_err(|e| StoreError::Query(format!("current_stage: {e}")))?;

        match rows
            .next()
            .await
            .map_err(|e| StoreError::Query(format!("current_stage: {e}")))?
        {
            Some(row) => {
                let stage_str: String = row
                    .get(0)
                    .map_err(|e| StoreError::Query(format!("current_stage row: {e}")))?;
                Ok(Some(parse_stage(&stage_str)?))
            }
            None => Ok(None),
        }
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 datetime string written by this backend.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn parse_stage(s: &str) -> Result<Stage, StoreError> {
    s.parse()
        .map_err(|e: String| StoreError::Serialization(format!("stage column: {e}")))
}

fn parse_channel(s: &str) -> Result<Channel, StoreError> {
    s.parse()
        .map_err(|e: String| StoreError::Serialization(format!("channel column: {e}")))
}

fn opt_text(v: Option<&str>) -> libsql::Value {
    match v {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

/// Map a libsql Row (ITEM_COLUMNS order) to an Item. Attempts are loaded
/// separately.
fn row_to_item(row: &libsql::Row) -> Result<Item, StoreError> {
    let id_str: String = row
        .get(0)
        .map_err(|e| StoreError::Query(format!("item row id: {e}")))?;
    let channel_str: String = row
        .get(1)
        .map_err(|e| StoreError::Query(format!("item row channel: {e}")))?;
    let external_id: String = row
        .get(2)
        .map_err(|e| StoreError::Query(format!("item row external_id: {e}")))?;
    let sender: Option<String> = row.get::<String>(3).ok();
    let subject: Option<String> = row.get::<String>(4).ok();
    let body: String = row
        .get(5)
        .map_err(|e| StoreError::Query(format!("item row body: {e}")))?;
    let metadata_str: String = row.get::<String>(6).unwrap_or_else(|_| "{}".into());
    let stage_str: String = row
        .get(7)
        .map_err(|e| StoreError::Query(format!("item row stage: {e}")))?;
    let classification: Option<String> = row.get::<String>(8).ok();
    let priority_str: Option<String> = row.get::<String>(9).ok();
    let requires_approval: i64 = row.get::<i64>(10).unwrap_or(0);
    let action_str: Option<String> = row.get::<String>(11).ok();
    let plan_str: String = row.get::<String>(12).unwrap_or_else(|_| "[]".into());
    let feedback: Option<String> = row.get::<String>(13).ok();
    let review_required: i64 = row.get::<i64>(14).unwrap_or(0);
    let next_attempt_str: Option<String> = row.get::<String>(15).ok();
    let received_str: String = row
        .get(16)
        .map_err(|e| StoreError::Query(format!("item row received_at: {e}")))?;
    let created_str: String = row
        .get(17)
        .map_err(|e| StoreError::Query(format!("item row created_at: {e}")))?;
    let transition_str: String = row
        .get(18)
        .map_err(|e| StoreError::Query(format!("item row last_transition_at: {e}")))?;

    let id = Uuid::parse_str(&id_str)
        .map_err(|e| StoreError::Serialization(format!("item id: {e}")))?;
    let metadata = serde_json::from_str(&metadata_str).unwrap_or(serde_json::Value::Null);
    let plan = serde_json::from_str(&plan_str)
        .map_err(|e| StoreError::Serialization(format!("plan column: {e}")))?;

    Ok(Item {
        id,
        channel: parse_channel(&channel_str)?,
        external_id,
        payload: Payload {
            sender,
            subject,
            body,
            metadata,
        },
        stage: parse_stage(&stage_str)?,
        classification,
        priority: priority_str.and_then(|s| s.parse().ok()),
        requires_approval: requires_approval != 0,
        action: action_str.and_then(|s| s.parse().ok()),
        plan,
        feedback,
        attempts: Vec::new(),
        review_required: review_required != 0,
        next_attempt_at: next_attempt_str.as_deref().map(parse_datetime),
        received_at: parse_datetime(&received_str),
        created_at: parse_datetime(&created_str),
        last_transition_at: parse_datetime(&transition_str),
    })
}

fn row_to_attempt(row: &libsql::Row) -> Result<Attempt, StoreError> {
    let started_str: String = row
        .get(0)
        .map_err(|e| StoreError::Query(format!("attempt row: {e}")))?;
    let finished_str: String = row
        .get(1)
        .map_err(|e| StoreError::Query(format!("attempt row: {e}")))?;
    let outcome_str: String = row
        .get(2)
        .map_err(|e| StoreError::Query(format!("attempt row: {e}")))?;
    let detail: String = row
        .get(3)
        .map_err(|e| StoreError::Query(format!("attempt row: {e}")))?;
    let artifact_str: Option<String> = row.get::<String>(4).ok();

    Ok(Attempt {
        started_at: parse_datetime(&started_str),
        finished_at: parse_datetime(&finished_str),
        outcome: outcome_str
            .parse()
            .map_err(|e: String| StoreError::Serialization(format!("outcome column: {e}")))?,
        detail,
        artifact: artifact_str.and_then(|s| serde_json::from_str(&s).ok()),
    })
}

fn row_to_audit(row: &libsql::Row) -> Result<AuditRecord, StoreError> {
    let seq: i64 = row
        .get(0)
        .map_err(|e| StoreError::Query(format!("audit row: {e}")))?;
    let ts_str: String = row
        .get(1)
        .map_err(|e| StoreError::Query(format!("audit row: {e}")))?;
    let item_str: String = row
        .get(2)
        .map_err(|e| StoreError::Query(format!("audit row: {e}")))?;
    let from_str: Option<String> = row.get::<String>(3).ok();
    let to_str: String = row
        .get(4)
        .map_err(|e| StoreError::Query(format!("audit row: {e}")))?;
    let actor_str: String = row
        .get(5)
        .map_err(|e| StoreError::Query(format!("audit row: {e}")))?;
    let detail: Option<String> = row.get::<String>(6).ok();

    Ok(AuditRecord {
        seq,
        ts: parse_datetime(&ts_str),
        item_id: Uuid::parse_str(&item_str)
            .map_err(|e| StoreError::Serialization(format!("audit item id: {e}")))?,
        from_stage: match from_str {
            Some(s) => Some(parse_stage(&s)?),
            None => None,
        },
        to_stage: parse_stage(&to_str)?,
        actor: actor_str
            .parse()
            .map_err(|e: String| StoreError::Serialization(format!("actor column: {e}")))?,
        detail,
    })
}

#[async_trait]
impl PipelineStore for LibSqlStore {
    async fn admit(&self, item: &NewItem, actor: &Actor) -> Result<Item, StoreError> {
        let id = Uuid::new_v4();
        let now = Utc::now();
        let now_str = now.to_rfc3339();
        let metadata_str = item.payload.metadata.to_string();

        let tx = self
            .conn
            .transaction()
            .await
            .map_err(|e| StoreError::Query(format!("admit begin: {e}")))?;

        let insert = tx
            .execute(
                "INSERT INTO items (id, channel, external_id, sender, subject, body, metadata, \
                 stage, received_at, created_at, last_transition_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'intake', ?8, ?9, ?10)",
                params![
                    id.to_string(),
                    item.channel.to_string(),
                    item.external_id.clone(),
                    opt_text(item.payload.sender.as_deref()),
                    opt_text(item.payload.subject.as_deref()),
                    item.payload.body.clone(),
                    metadata_str,
                    item.received_at.to_rfc3339(),
                    now_str.clone(),
                    now_str.clone(),
                ],
            )
            .await;

        if let Err(e) = insert {
            let msg = e.to_string();
            let _ = tx.rollback().await;
            if msg.contains("UNIQUE") {
                return Err(StoreError::Duplicate {
                    channel: item.channel,
                    external_id: item.external_id.clone(),
                });
            }
            return Err(StoreError::Query(format!("admit insert: {msg}")));
        }

        tx.execute(
            "INSERT INTO audit_log (ts, item_id, from_stage, to_stage, actor, detail) \
             VALUES (?1, ?2, NULL, 'intake', ?3, ?4)",
            params![
                now_str,
                id.to_string(),
                actor.to_string(),
                format!("admitted from {}", item.channel),
            ],
        )
        .await
        .map_err(|e| StoreError::Query(format!("admit audit: {e}")))?;

        tx.commit()
            .await
            .map_err(|e| StoreError::Query(format!("admit commit: {e}")))?;

        debug!(item_id = %id, channel = %item.channel, external_id = %item.external_id, "Item admitted");

        Ok(Item {
            id,
            channel: item.channel,
            external_id: item.external_id.clone(),
            payload: item.payload.clone(),
            stage: Stage::Intake,
            classification: None,
            priority: None,
            requires_approval: false,
            action: None,
            plan: Vec::new(),
            feedback: None,
            attempts: Vec::new(),
            review_required: false,
            next_attempt_at: None,
            received_at: item.received_at,
            created_at: now,
            last_transition_at: now,
        })
    }

    async fn get_item(&self, id: Uuid) -> Result<Option<Item>, StoreError> {
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {ITEM_COLUMNS} FROM items WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| StoreError::Query(format!("get_item: {e}")))?;

        match rows
            .next()
            .await
            .map_err(|e| StoreError::Query(format!("get_item: {e}")))?
        {
            Some(row) => {
                let mut item = row_to_item(&row)?;
                item.attempts = self.attempts_for(id).await?;
                Ok(Some(item))
            }
            None => Ok(None),
        }
    }

    async fn items_in_stage(&self, stage: Stage, limit: usize) -> Result<Vec<Item>, StoreError> {
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {ITEM_COLUMNS} FROM items WHERE stage = ?1 \
                     ORDER BY created_at ASC LIMIT ?2"
                ),
                params![stage.to_string(), limit as i64],
            )
            .await
            .map_err(|e| StoreError::Query(format!("items_in_stage: {e}")))?;

        let mut items = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| StoreError::Query(format!("items_in_stage: {e}")))?
        {
            items.push(row_to_item(&row)?);
        }
        Ok(items)
    }

    async fn all_item_ids(&self) -> Result<Vec<Uuid>, StoreError> {
        let mut rows = self
            .conn
            .query("SELECT id FROM items ORDER BY created_at ASC", ())
            .await
            .map_err(|e| StoreError::Query(format!("all_item_ids: {e}")))?;

        let mut ids = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| StoreError::Query(format!("all_item_ids: {e}")))?
        {
            let id_str: String = row
                .get(0)
                .map_err(|e| StoreError::Query(format!("all_item_ids row: {e}")))?;
            ids.push(
                Uuid::parse_str(&id_str)
                    .map_err(|e| StoreError::Serialization(format!("item id: {e}")))?,
            );
        }
        Ok(ids)
    }

    async fn counts_by_stage(&self) -> Result<Vec<(Stage, usize)>, StoreError> {
        let mut rows = self
            .conn
            .query("SELECT stage, COUNT(*) FROM items GROUP BY stage", ())
            .await
            .map_err(|e| StoreError::Query(format!("counts_by_stage: {e}")))?;

        let mut counts = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| StoreError::Query(format!("counts_by_stage: {e}")))?
        {
            let stage_str: String = row
                .get(0)
                .map_err(|e| StoreError::Query(format!("counts row: {e}")))?;
            let count: i64 = row
                .get(1)
                .map_err(|e| StoreError::Query(format!("counts row: {e}")))?;
            counts.push((parse_stage(&stage_str)?, count as usize));
        }
        Ok(counts)
    }

    async fn transition(
        &self,
        id: Uuid,
        from: Stage,
        to: Stage,
        actor: &Actor,
        detail: Option<&str>,
    ) -> Result<(), StoreError> {
        if !from.can_transition_to(to) {
            return Err(StoreError::IllegalTransition { id, from, to });
        }

        let now_str = Utc::now().to_rfc3339();

        let tx = self
            .conn
            .transaction()
            .await
            .map_err(|e| StoreError::Query(format!("transition begin: {e}")))?;

        let changed = tx
            .execute(
                "UPDATE items SET stage = ?1, last_transition_at = ?2 \
                 WHERE id = ?3 AND stage = ?4",
                params![
                    to.to_string(),
                    now_str.clone(),
                    id.to_string(),
                    from.to_string()
                ],
            )
            .await
            .map_err(|e| StoreError::Query(format!("transition update: {e}")))?;

        if changed == 0 {
            let _ = tx.rollback().await;
            // Distinguish a missing Item from a stage race.
            return match self.current_stage(id).await? {
                Some(actual) => Err(StoreError::StageConflict {
                    id,
                    expected: from,
                    actual,
                }),
                None => Err(StoreError::NotFound { id }),
            };
        }

        tx.execute(
            "INSERT INTO audit_log (ts, item_id, from_stage, to_stage, actor, detail) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                now_str,
                id.to_string(),
                from.to_string(),
                to.to_string(),
                actor.to_string(),
                opt_text(detail),
            ],
        )
        .await
        .map_err(|e| StoreError::Query(format!("transition audit: {e}")))?;

        tx.commit()
            .await
            .map_err(|e| StoreError::Query(format!("transition commit: {e}")))?;

        debug!(item_id = %id, %from, %to, %actor, "Stage transition");
        Ok(())
    }

    async fn record_decision(&self, id: Uuid, decision: &Decision) -> Result<(), StoreError> {
        let plan_str = serde_json::to_string(&decision.plan)
            .map_err(|e| StoreError::Serialization(format!("plan: {e}")))?;

        // requires_approval is sticky: OR with the stored flag, never lower.
        let changed = self
            .conn
            .execute(
                "UPDATE items SET classification = ?1, priority = ?2, \
                 requires_approval = MAX(requires_approval, ?3), action_kind = ?4, plan = ?5 \
                 WHERE id = ?6",
                params![
                    decision.classification.clone(),
                    decision.priority.to_string(),
                    i64::from(decision.requires_approval),
                    decision.action.to_string(),
                    plan_str,
                    id.to_string(),
                ],
            )
            .await
            .map_err(|e| StoreError::Query(format!("record_decision: {e}")))?;

        if changed == 0 {
            return Err(StoreError::NotFound { id });
        }
        Ok(())
    }

    async fn set_feedback(&self, id: Uuid, feedback: &str) -> Result<(), StoreError> {
        let changed = self
            .conn
            .execute(
                "UPDATE items SET feedback = ?1 WHERE id = ?2",
                params![feedback, id.to_string()],
            )
            .await
            .map_err(|e| StoreError::Query(format!("set_feedback: {e}")))?;

        if changed == 0 {
            return Err(StoreError::NotFound { id });
        }
        Ok(())
    }

    async fn complete_plan(&self, id: Uuid) -> Result<(), StoreError> {
        let item = self.get_item(id).await?.ok_or(StoreError::NotFound { id })?;
        let plan: Vec<_> = item
            .plan
            .into_iter()
            .map(|mut step| {
                step.done = true;
                step
            })
            .collect();
        let plan_str = serde_json::to_string(&plan)
            .map_err(|e| StoreError::Serialization(format!("plan: {e}")))?;

        self.conn
            .execute(
                "UPDATE items SET plan = ?1 WHERE id = ?2",
                params![plan_str, id.to_string()],
            )
            .await
            .map_err(|e| StoreError::Query(format!("complete_plan: {e}")))?;
        Ok(())
    }

    async fn flag_for_review(&self, id: Uuid, reason: &str) -> Result<(), StoreError> {
        let changed = self
            .conn
            .execute(
                "UPDATE items SET review_required = 1 WHERE id = ?1",
                params![id.to_string()],
            )
            .await
            .map_err(|e| StoreError::Query(format!("flag_for_review: {e}")))?;

        if changed == 0 {
            return Err(StoreError::NotFound { id });
        }
        info!(item_id = %id, reason, "Item flagged for manual review");
        Ok(())
    }

    async fn record_attempt(&self, id: Uuid, attempt: &Attempt) -> Result<(), StoreError> {
        let artifact_str = attempt.artifact.as_ref().map(|a| a.to_string());
        self.conn
            .execute(
                "INSERT INTO attempts (item_id, started_at, finished_at, outcome, detail, artifact) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    id.to_string(),
                    attempt.started_at.to_rfc3339(),
                    attempt.finished_at.to_rfc3339(),
                    attempt.outcome.to_string(),
                    attempt.detail.clone(),
                    opt_text(artifact_str.as_deref()),
                ],
            )
            .await
            .map_err(|e| StoreError::Query(format!("record_attempt: {e}")))?;
        Ok(())
    }

    async fn attempts_for(&self, id: Uuid) -> Result<Vec<Attempt>, StoreError> {
        let mut rows = self
            .conn
            .query(
                "SELECT started_at, finished_at, outcome, detail, artifact \
                 FROM attempts WHERE item_id = ?1 ORDER BY id ASC",
                params![id.to_string()],
            )
            .await
            .map_err(|e| StoreError::Query(format!("attempts_for: {e}")))?;

        let mut attempts = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| StoreError::Query(format!("attempts_for: {e}")))?
        {
            attempts.push(row_to_attempt(&row)?);
        }
        Ok(attempts)
    }

    async fn attempts_since(&self, id: Uuid, since: DateTime<Utc>) -> Result<u32, StoreError> {
        let mut rows = self
            .conn
            .query(
                "SELECT COUNT(*) FROM attempts WHERE item_id = ?1 AND started_at >= ?2",
                params![id.to_string(), since.to_rfc3339()],
            )
            .await
            .map_err(|e| StoreError::Query(format!("attempts_since: {e}")))?;

        match rows
            .next()
            .await
            .map_err(|e| StoreError::Query(format!("attempts_since: {e}")))?
        {
            Some(row) => {
                let count: i64 = row
                    .get(0)
                    .map_err(|e| StoreError::Query(format!("attempts_since row: {e}")))?;
                Ok(count as u32)
            }
            None => Ok(0),
        }
    }

    async fn schedule_retry(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError> {
        self.conn
            .execute(
                "UPDATE items SET next_attempt_at = ?1 WHERE id = ?2",
                params![at.to_rfc3339(), id.to_string()],
            )
            .await
            .map_err(|e| StoreError::Query(format!("schedule_retry: {e}")))?;
        Ok(())
    }

    async fn clear_retry(&self, id: Uuid) -> Result<(), StoreError> {
        self.conn
            .execute(
                "UPDATE items SET next_attempt_at = NULL WHERE id = ?1",
                params![id.to_string()],
            )
            .await
            .map_err(|e| StoreError::Query(format!("clear_retry: {e}")))?;
        Ok(())
    }

    async fn claimable_approved(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Item>, StoreError> {
        let now_str = now.to_rfc3339();
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {ITEM_COLUMNS} FROM items \
                     WHERE stage = 'approved' \
                       AND (next_attempt_at IS NULL OR next_attempt_at <= ?1) \
                       AND NOT EXISTS ( \
                           SELECT 1 FROM leases \
                           WHERE leases.item_id = items.id AND leases.expires_at > ?1) \
                     ORDER BY created_at ASC LIMIT ?2"
                ),
                params![now_str, limit as i64],
            )
            .await
            .map_err(|e| StoreError::Query(format!("claimable_approved: {e}")))?;

        let mut items = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| StoreError::Query(format!("claimable_approved: {e}")))?
        {
            items.push(row_to_item(&row)?);
        }
        Ok(items)
    }

    async fn acquire_lease(
        &self,
        id: Uuid,
        holder: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let now_str = Utc::now().to_rfc3339();
        // Upsert that only steals a lease once it has expired.
        let changed = self
            .conn
            .execute(
                "INSERT INTO leases (item_id, holder, acquired_at, expires_at) \
                 VALUES (?1, ?2, ?3, ?4) \
                 ON CONFLICT(item_id) DO UPDATE SET \
                     holder = excluded.holder, \
                     acquired_at = excluded.acquired_at, \
                     expires_at = excluded.expires_at \
                 WHERE leases.expires_at <= excluded.acquired_at",
                params![
                    id.to_string(),
                    holder,
                    now_str,
                    expires_at.to_rfc3339()
                ],
            )
            .await
            .map_err(|e| StoreError::Query(format!("acquire_lease: {e}")))?;

        Ok(changed > 0)
    }

    async fn release_lease(&self, id: Uuid, holder: &str) -> Result<(), StoreError> {
        self.conn
            .execute(
                "DELETE FROM leases WHERE item_id = ?1 AND holder = ?2",
                params![id.to_string(), holder],
            )
            .await
            .map_err(|e| StoreError::Query(format!("release_lease: {e}")))?;
        Ok(())
    }

    async fn expire_leases(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let changed = self
            .conn
            .execute(
                "DELETE FROM leases WHERE expires_at <= ?1",
                params![now.to_rfc3339()],
            )
            .await
            .map_err(|e| StoreError::Query(format!("expire_leases: {e}")))?;
        Ok(changed as usize)
    }

    async fn seen(&self, channel: Channel, external_id: &str) -> Result<bool, StoreError> {
        let mut rows = self
            .conn
            .query(
                "SELECT 1 FROM ledger WHERE channel = ?1 AND external_id = ?2",
                params![channel.to_string(), external_id],
            )
            .await
            .map_err(|e| StoreError::Query(format!("seen: {e}")))?;

        Ok(rows
            .next()
            .await
            .map_err(|e| StoreError::Query(format!("seen: {e}")))?
            .is_some())
    }

    async fn mark_seen(&self, channel: Channel, external_id: &str) -> Result<(), StoreError> {
        self.conn
            .execute(
                "INSERT OR IGNORE INTO ledger (channel, external_id, marked_at) \
                 VALUES (?1, ?2, ?3)",
                params![
                    channel.to_string(),
                    external_id,
                    Utc::now().to_rfc3339()
                ],
            )
            .await
            .map_err(|e| StoreError::Query(format!("mark_seen: {e}")))?;
        Ok(())
    }

    async fn append_audit(
        &self,
        item_id: Uuid,
        from: Option<Stage>,
        to: Stage,
        actor: &Actor,
        detail: Option<&str>,
    ) -> Result<(), StoreError> {
        self.conn
            .execute(
                "INSERT INTO audit_log (ts, item_id, from_stage, to_stage, actor, detail) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    Utc::now().to_rfc3339(),
                    item_id.to_string(),
                    opt_text(from.map(|s| s.to_string()).as_deref()),
                    to.to_string(),
                    actor.to_string(),
                    opt_text(detail),
                ],
            )
            .await
            .map_err(|e| StoreError::Query(format!("append_audit: {e}")))?;
        Ok(())
    }

    async fn audit_for_item(&self, id: Uuid) -> Result<Vec<AuditRecord>, StoreError> {
        let mut rows = self
            .conn
            .query(
                "SELECT seq, ts, item_id, from_stage, to_stage, actor, detail \
                 FROM audit_log WHERE item_id = ?1 ORDER BY seq ASC",
                params![id.to_string()],
            )
            .await
            .map_err(|e| StoreError::Query(format!("audit_for_item: {e}")))?;

        let mut records = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| StoreError::Query(format!("audit_for_item: {e}")))?
        {
            records.push(row_to_audit(&row)?);
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::{ActionKind, PlanStep, Priority};

    fn new_mail_item(external_id: &str, body: &str) -> NewItem {
        NewItem::new(
            Channel::Mail,
            external_id,
            Payload {
                sender: Some("alice@example.com".into()),
                subject: Some("Hello".into()),
                body: body.into(),
                metadata: serde_json::json!({}),
            },
            Utc::now(),
        )
    }

    fn test_decision() -> Decision {
        Decision {
            classification: "email".into(),
            priority: Priority::P2,
            requires_approval: true,
            action: ActionKind::SendMessage,
            plan: vec![PlanStep::new("Draft reply"), PlanStep::new("Send reply")],
        }
    }

    #[tokio::test]
    async fn admit_writes_item_and_audit() {
        let store = LibSqlStore::open_memory().await.unwrap();
        let actor = Actor::Watcher(Channel::Mail);
        let item = store.admit(&new_mail_item("m-1", "hi"), &actor).await.unwrap();

        assert_eq!(item.stage, Stage::Intake);
        let loaded = store.get_item(item.id).await.unwrap().unwrap();
        assert_eq!(loaded.external_id, "m-1");
        assert_eq!(loaded.payload.sender.as_deref(), Some("alice@example.com"));

        let audit = store.audit_for_item(item.id).await.unwrap();
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].from_stage, None);
        assert_eq!(audit[0].to_stage, Stage::Intake);
    }

    #[tokio::test]
    async fn admit_rejects_duplicate_external_id() {
        let store = LibSqlStore::open_memory().await.unwrap();
        let actor = Actor::Watcher(Channel::Mail);
        store.admit(&new_mail_item("m-1", "hi"), &actor).await.unwrap();

        let err = store
            .admit(&new_mail_item("m-1", "hi again"), &actor)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Duplicate { .. }));

        // Same external_id on a different channel is a different event.
        let other = NewItem::new(
            Channel::SocialDm,
            "m-1",
            Payload {
                sender: None,
                subject: None,
                body: "dm".into(),
                metadata: serde_json::json!({}),
            },
            Utc::now(),
        );
        assert!(store.admit(&other, &Actor::Watcher(Channel::SocialDm)).await.is_ok());
    }

    #[tokio::test]
    async fn transition_is_compare_and_set() {
        let store = LibSqlStore::open_memory().await.unwrap();
        let actor = Actor::Watcher(Channel::Mail);
        let item = store.admit(&new_mail_item("m-1", "hi"), &actor).await.unwrap();

        store
            .transition(item.id, Stage::Intake, Stage::Classified, &Actor::Planner, None)
            .await
            .unwrap();

        // Second transition from Intake must conflict.
        let err = store
            .transition(item.id, Stage::Intake, Stage::Classified, &Actor::Planner, None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::StageConflict {
                actual: Stage::Classified,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn transition_refuses_illegal_edges() {
        let store = LibSqlStore::open_memory().await.unwrap();
        let actor = Actor::Watcher(Channel::Mail);
        let item = store.admit(&new_mail_item("m-1", "hi"), &actor).await.unwrap();

        let err = store
            .transition(item.id, Stage::Intake, Stage::Approved, &Actor::Planner, None)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::IllegalTransition { .. }));

        // Item unchanged, no audit row written.
        let loaded = store.get_item(item.id).await.unwrap().unwrap();
        assert_eq!(loaded.stage, Stage::Intake);
        assert_eq!(store.audit_for_item(item.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn every_transition_has_one_audit_record() {
        let store = LibSqlStore::open_memory().await.unwrap();
        let actor = Actor::Watcher(Channel::Mail);
        let item = store.admit(&new_mail_item("m-1", "hi"), &actor).await.unwrap();

        store
            .transition(item.id, Stage::Intake, Stage::Classified, &Actor::Planner, None)
            .await
            .unwrap();
        store
            .transition(item.id, Stage::Classified, Stage::Planned, &Actor::Planner, None)
            .await
            .unwrap();

        let audit = store.audit_for_item(item.id).await.unwrap();
        assert_eq!(audit.len(), 3);
        assert!(crate::audit::validate_path(&audit).is_ok());
    }

    #[tokio::test]
    async fn record_decision_sets_fields() {
        let store = LibSqlStore::open_memory().await.unwrap();
        let actor = Actor::Watcher(Channel::Mail);
        let item = store.admit(&new_mail_item("m-1", "hi"), &actor).await.unwrap();

        store.record_decision(item.id, &test_decision()).await.unwrap();

        let loaded = store.get_item(item.id).await.unwrap().unwrap();
        assert_eq!(loaded.classification.as_deref(), Some("email"));
        assert_eq!(loaded.priority, Some(Priority::P2));
        assert!(loaded.requires_approval);
        assert_eq!(loaded.action, Some(ActionKind::SendMessage));
        assert_eq!(loaded.plan.len(), 2);
    }

    #[tokio::test]
    async fn requires_approval_is_sticky() {
        let store = LibSqlStore::open_memory().await.unwrap();
        let actor = Actor::Watcher(Channel::Mail);
        let item = store.admit(&new_mail_item("m-1", "hi"), &actor).await.unwrap();

        store.record_decision(item.id, &test_decision()).await.unwrap();

        // A later decision with requires_approval = false must not lower it.
        let mut relaxed = test_decision();
        relaxed.requires_approval = false;
        store.record_decision(item.id, &relaxed).await.unwrap();

        let loaded = store.get_item(item.id).await.unwrap().unwrap();
        assert!(loaded.requires_approval);
    }

    #[tokio::test]
    async fn ledger_seen_and_mark_seen_idempotent() {
        let store = LibSqlStore::open_memory().await.unwrap();
        assert!(!store.seen(Channel::Mail, "m-1").await.unwrap());

        store.mark_seen(Channel::Mail, "m-1").await.unwrap();
        store.mark_seen(Channel::Mail, "m-1").await.unwrap();
        assert!(store.seen(Channel::Mail, "m-1").await.unwrap());
        // Ledger partitions are per-channel.
        assert!(!store.seen(Channel::SocialDm, "m-1").await.unwrap());
    }

    #[tokio::test]
    async fn attempts_roundtrip_and_counting() {
        let store = LibSqlStore::open_memory().await.unwrap();
        let actor = Actor::Watcher(Channel::Mail);
        let item = store.admit(&new_mail_item("m-1", "hi"), &actor).await.unwrap();

        let epoch = Utc::now() - chrono::Duration::seconds(1);
        let attempt = Attempt {
            started_at: Utc::now(),
            finished_at: Utc::now(),
            outcome: crate::item::AttemptOutcome::TransientFailure,
            detail: "timeout".into(),
            artifact: Some(serde_json::json!({"elapsed_ms": 30000})),
        };
        store.record_attempt(item.id, &attempt).await.unwrap();
        store.record_attempt(item.id, &attempt).await.unwrap();

        let attempts = store.attempts_for(item.id).await.unwrap();
        assert_eq!(attempts.len(), 2);
        assert_eq!(attempts[0].detail, "timeout");
        assert!(attempts[0].artifact.is_some());

        assert_eq!(store.attempts_since(item.id, epoch).await.unwrap(), 2);
        let future = Utc::now() + chrono::Duration::seconds(60);
        assert_eq!(store.attempts_since(item.id, future).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn lease_excludes_item_from_claimable() {
        let store = LibSqlStore::open_memory().await.unwrap();
        let actor = Actor::Watcher(Channel::Mail);
        let item = store.admit(&new_mail_item("m-1", "hi"), &actor).await.unwrap();
        store.record_decision(item.id, &test_decision()).await.unwrap();
        store
            .transition(item.id, Stage::Intake, Stage::Classified, &Actor::Planner, None)
            .await
            .unwrap();
        store
            .transition(item.id, Stage::Classified, Stage::Planned, &Actor::Planner, None)
            .await
            .unwrap();
        store
            .transition(item.id, Stage::Planned, Stage::PendingApproval, &Actor::Planner, None)
            .await
            .unwrap();
        store
            .transition(
                item.id,
                Stage::PendingApproval,
                Stage::Approved,
                &Actor::Gate("alice".into()),
                None,
            )
            .await
            .unwrap();

        let now = Utc::now();
        let claimable = store.claimable_approved(now, 10).await.unwrap();
        assert_eq!(claimable.len(), 1);

        let expires = now + chrono::Duration::seconds(120);
        assert!(store.acquire_lease(item.id, "exec-1", expires).await.unwrap());
        // Live lease blocks both claiming and a second holder.
        assert!(store.claimable_approved(now, 10).await.unwrap().is_empty());
        assert!(!store.acquire_lease(item.id, "exec-2", expires).await.unwrap());

        store.release_lease(item.id, "exec-1").await.unwrap();
        assert_eq!(store.claimable_approved(now, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn expired_lease_can_be_stolen() {
        let store = LibSqlStore::open_memory().await.unwrap();
        let actor = Actor::Watcher(Channel::Mail);
        let item = store.admit(&new_mail_item("m-1", "hi"), &actor).await.unwrap();

        let past = Utc::now() - chrono::Duration::seconds(10);
        assert!(store.acquire_lease(item.id, "dead-exec", past).await.unwrap());
        // The old lease has expired, so a new holder may take it.
        let future = Utc::now() + chrono::Duration::seconds(120);
        assert!(store.acquire_lease(item.id, "exec-2", future).await.unwrap());
    }

    #[tokio::test]
    async fn expire_leases_sweeps_stale_rows() {
        let store = LibSqlStore::open_memory().await.unwrap();
        let actor = Actor::Watcher(Channel::Mail);
        let a = store.admit(&new_mail_item("m-1", "hi"), &actor).await.unwrap();
        let b = store.admit(&new_mail_item("m-2", "hi"), &actor).await.unwrap();

        let past = Utc::now() - chrono::Duration::seconds(10);
        let future = Utc::now() + chrono::Duration::seconds(120);
        store.acquire_lease(a.id, "exec-1", past).await.unwrap();
        store.acquire_lease(b.id, "exec-1", future).await.unwrap();

        assert_eq!(store.expire_leases(Utc::now()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn retry_schedule_gates_claimable() {
        let store = LibSqlStore::open_memory().await.unwrap();
        let actor = Actor::Watcher(Channel::Mail);
        let item = store.admit(&new_mail_item("m-1", "hi"), &actor).await.unwrap();
        store.record_decision(item.id, &test_decision()).await.unwrap();
        for (from, to) in [
            (Stage::Intake, Stage::Classified),
            (Stage::Classified, Stage::Planned),
            (Stage::Planned, Stage::PendingApproval),
        ] {
            store
                .transition(item.id, from, to, &Actor::Planner, None)
                .await
                .unwrap();
        }
        store
            .transition(
                item.id,
                Stage::PendingApproval,
                Stage::Approved,
                &Actor::Gate("alice".into()),
                None,
            )
            .await
            .unwrap();

        let now = Utc::now();
        store
            .schedule_retry(item.id, now + chrono::Duration::seconds(60))
            .await
            .unwrap();
        assert!(store.claimable_approved(now, 10).await.unwrap().is_empty());

        store.clear_retry(item.id).await.unwrap();
        assert_eq!(store.claimable_approved(now, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn counts_by_stage_groups() {
        let store = LibSqlStore::open_memory().await.unwrap();
        let actor = Actor::Watcher(Channel::Mail);
        store.admit(&new_mail_item("m-1", "a"), &actor).await.unwrap();
        store.admit(&new_mail_item("m-2", "b"), &actor).await.unwrap();

        let counts = store.counts_by_stage().await.unwrap();
        assert_eq!(counts, vec![(Stage::Intake, 2)]);
    }

    #[tokio::test]
    async fn complete_plan_marks_all_steps() {
        let store = LibSqlStore::open_memory().await.unwrap();
        let actor = Actor::Watcher(Channel::Mail);
        let item = store.admit(&new_mail_item("m-1", "hi"), &actor).await.unwrap();
        store.record_decision(item.id, &test_decision()).await.unwrap();

        store.complete_plan(item.id).await.unwrap();
        let loaded = store.get_item(item.id).await.unwrap().unwrap();
        assert!(loaded.plan.iter().all(|s| s.done));
    }

    #[tokio::test]
    async fn open_local_creates_parent_dirs_and_persists() {
        let tmp = tempfile::tempdir().unwrap();
        let db_path = tmp.path().join("nested").join("pipeline.db");

        {
            let store = LibSqlStore::open_local(&db_path).await.unwrap();
            let actor = Actor::Watcher(Channel::Mail);
            store.admit(&new_mail_item("m-1", "hi"), &actor).await.unwrap();
        }
        assert!(db_path.exists());

        // Reopen: data survived, migrations are idempotent.
        let store = LibSqlStore::open_local(&db_path).await.unwrap();
        assert!(store.seen(Channel::Mail, "m-1").await.is_ok());
        let counts = store.counts_by_stage().await.unwrap();
        assert_eq!(counts, vec![(Stage::Intake, 1)]);
    }
}
