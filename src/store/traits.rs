//! `PipelineStore` trait — single async interface for all persistence.
//!
//! Covers the item table, the dedup ledger, execution attempts, executor
//! leases, and the audit log. One backend implements the whole surface so
//! that a stage transition and its audit record commit in one transaction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::audit::{Actor, AuditRecord};
use crate::decision::Decision;
use crate::error::StoreError;
use crate::item::{Attempt, Channel, Item, NewItem, Stage};

/// Backend-agnostic persistence trait for the pipeline.
#[async_trait]
pub trait PipelineStore: Send + Sync {
    // ── Admission ───────────────────────────────────────────────────

    /// Admit a new Item at Intake, writing the admission audit record in
    /// the same transaction. Fails with `StoreError::Duplicate` when
    /// `(channel, external_id)` has already been admitted.
    async fn admit(&self, item: &NewItem, actor: &Actor) -> Result<Item, StoreError>;

    // ── Reads ───────────────────────────────────────────────────────

    /// Fetch one Item by ID, with its attempt history loaded.
    async fn get_item(&self, id: Uuid) -> Result<Option<Item>, StoreError>;

    /// Items currently in a stage, oldest first.
    async fn items_in_stage(&self, stage: Stage, limit: usize) -> Result<Vec<Item>, StoreError>;

    /// All item IDs (startup consistency check).
    async fn all_item_ids(&self) -> Result<Vec<Uuid>, StoreError>;

    /// Count of Items per stage.
    async fn counts_by_stage(&self) -> Result<Vec<(Stage, usize)>, StoreError>;

    // ── Transitions ─────────────────────────────────────────────────

    /// Atomically move an Item from `from` to `to` and append the audit
    /// record, in one transaction. Compare-and-set on the current stage:
    /// if the Item is no longer in `from`, fails with
    /// `StoreError::StageConflict` and changes nothing.
    async fn transition(
        &self,
        id: Uuid,
        from: Stage,
        to: Stage,
        actor: &Actor,
        detail: Option<&str>,
    ) -> Result<(), StoreError>;

    // ── Decision & gate writes ──────────────────────────────────────

    /// Record the decision engine's output on an Item. `requires_approval`
    /// is sticky: the stored flag is OR-ed with the decision's, never
    /// lowered.
    async fn record_decision(&self, id: Uuid, decision: &Decision) -> Result<(), StoreError>;

    /// Attach rejection feedback.
    async fn set_feedback(&self, id: Uuid, feedback: &str) -> Result<(), StoreError>;

    /// Mark every plan step done (on successful execution).
    async fn complete_plan(&self, id: Uuid) -> Result<(), StoreError>;

    /// Flag an Item for manual review (consistency check).
    async fn flag_for_review(&self, id: Uuid, reason: &str) -> Result<(), StoreError>;

    // ── Attempts & retry schedule ───────────────────────────────────

    /// Append an execution attempt to the Item's history.
    async fn record_attempt(&self, id: Uuid, attempt: &Attempt) -> Result<(), StoreError>;

    /// Attempt history for an Item, oldest first.
    async fn attempts_for(&self, id: Uuid) -> Result<Vec<Attempt>, StoreError>;

    /// Number of attempts started at or after `since` — the executor's
    /// per-approval retry budget.
    async fn attempts_since(&self, id: Uuid, since: DateTime<Utc>) -> Result<u32, StoreError>;

    /// Schedule the next retry; the executor skips the Item until then.
    async fn schedule_retry(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError>;

    /// Clear the retry schedule (on success, failure, or manual retry).
    async fn clear_retry(&self, id: Uuid) -> Result<(), StoreError>;

    // ── Executor leases ─────────────────────────────────────────────

    /// Approved Items eligible for dispatch at `now`: no live lease and
    /// no pending retry delay. Oldest first.
    async fn claimable_approved(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Item>, StoreError>;

    /// Take the per-Item lease. Returns false when another live lease
    /// exists — the caller must not dispatch.
    async fn acquire_lease(
        &self,
        id: Uuid,
        holder: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Release a lease held by `holder`.
    async fn release_lease(&self, id: Uuid, holder: &str) -> Result<(), StoreError>;

    /// Delete leases that expired before `now`. Returns how many.
    async fn expire_leases(&self, now: DateTime<Utc>) -> Result<usize, StoreError>;

    // ── Ledger ──────────────────────────────────────────────────────

    /// Whether this external event was already ingested.
    async fn seen(&self, channel: Channel, external_id: &str) -> Result<bool, StoreError>;

    /// Mark an external event ingested. Idempotent.
    async fn mark_seen(&self, channel: Channel, external_id: &str) -> Result<(), StoreError>;

    // ── Audit ───────────────────────────────────────────────────────

    /// Append a non-transition audit record (defer decisions). Transition
    /// records are written by `admit` and `transition` themselves.
    async fn append_audit(
        &self,
        item_id: Uuid,
        from: Option<Stage>,
        to: Stage,
        actor: &Actor,
        detail: Option<&str>,
    ) -> Result<(), StoreError>;

    /// Audit trail for one Item, in sequence order.
    async fn audit_for_item(&self, id: Uuid) -> Result<Vec<AuditRecord>, StoreError>;
}
