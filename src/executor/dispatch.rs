//! Dispatch loop — drains Approved items under per-Item leases.
//!
//! Each cycle: reclaim expired leases, claim eligible items, dispatch
//! each under a timeout, record the attempt, and move the Item to Done
//! or Failed (or schedule a backoff retry). The lease guarantees
//! at-most-one in-flight attempt per Item; its TTL guarantees a crashed
//! executor cannot strand one.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::audit::Actor;
use crate::config::ExecutorConfig;
use crate::error::DispatchError;
use crate::executor::{CapabilityRegistry, Outcome, RetryPolicy};
use crate::item::{Attempt, AttemptOutcome, Item, Stage};
use crate::store::PipelineStore;

/// How many items one cycle claims at most.
const CLAIM_BATCH: usize = 20;

/// The single consumer of the Approved stage.
pub struct Executor {
    store: Arc<dyn PipelineStore>,
    registry: Arc<CapabilityRegistry>,
    retry: RetryPolicy,
    dispatch_timeout: Duration,
    lease_ttl: Duration,
    /// Lease holder identity for this executor instance.
    holder: String,
}

impl Executor {
    pub fn new(
        store: Arc<dyn PipelineStore>,
        registry: Arc<CapabilityRegistry>,
        config: &ExecutorConfig,
    ) -> Self {
        Self {
            store,
            registry,
            retry: RetryPolicy::from_config(config),
            dispatch_timeout: config.dispatch_timeout,
            lease_ttl: config.lease_ttl,
            holder: format!("executor-{}", uuid::Uuid::new_v4()),
        }
    }

    /// Run one dispatch cycle. Returns how many items were dispatched.
    pub async fn run_cycle(&self) -> usize {
        let now = Utc::now();

        // Reclaim leases from crashed or timed-out executors first.
        match self.store.expire_leases(now).await {
            Ok(0) => {}
            Ok(n) => warn!(reclaimed = n, "Reclaimed expired leases"),
            Err(e) => error!(error = %e, "Lease sweep failed"),
        }

        let claimable = match self.store.claimable_approved(now, CLAIM_BATCH).await {
            Ok(items) => items,
            Err(e) => {
                error!(error = %e, "Failed to list claimable items");
                return 0;
            }
        };

        let mut dispatched = 0;
        for item in claimable {
            let expires = Utc::now()
                + chrono::Duration::from_std(self.lease_ttl)
                    .unwrap_or_else(|_| chrono::Duration::seconds(120));
            match self.store.acquire_lease(item.id, &self.holder, expires).await {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    error!(item_id = %item.id, error = %e, "Lease acquisition failed");
                    continue;
                }
            }

            if let Err(e) = self.dispatch_one(&item).await {
                error!(item_id = %item.id, error = %e, "Dispatch bookkeeping failed");
            }
            dispatched += 1;

            if let Err(e) = self.store.release_lease(item.id, &self.holder).await {
                warn!(item_id = %item.id, error = %e, "Lease release failed");
            }
        }
        dispatched
    }

    /// Dispatch a single leased Item and record the result.
    async fn dispatch_one(&self, item: &Item) -> crate::error::Result<()> {
        let started_at = Utc::now();

        let result = match item.action.and_then(|kind| self.registry.get(kind)) {
            Some(capability) => {
                debug!(item_id = %item.id, action = %capability.kind(), "Dispatching");
                match tokio::time::timeout(self.dispatch_timeout, capability.execute(item)).await {
                    Ok(inner) => inner,
                    Err(_) => Err(DispatchError::Timeout {
                        timeout: self.dispatch_timeout,
                    }),
                }
            }
            None => Err(DispatchError::NoCapability {
                kind: item
                    .action
                    .map(|k| k.to_string())
                    .unwrap_or_else(|| "unassigned".into()),
            }),
        };

        match result {
            Ok(Outcome {
                success: true,
                detail,
                artifact,
            }) => self.complete(item, started_at, detail, artifact).await,
            Ok(Outcome {
                success: false,
                detail,
                artifact,
            }) => {
                // The handler completed and reported the effect cannot
                // succeed — permanent.
                self.fail(item, started_at, detail, artifact).await
            }
            Err(e) if e.is_transient() => self.retry_or_fail(item, started_at, e).await,
            Err(e) => self.fail(item, started_at, e.to_string(), None).await,
        }
    }

    async fn complete(
        &self,
        item: &Item,
        started_at: chrono::DateTime<Utc>,
        detail: String,
        artifact: Option<serde_json::Value>,
    ) -> crate::error::Result<()> {
        self.store
            .record_attempt(
                item.id,
                &Attempt {
                    started_at,
                    finished_at: Utc::now(),
                    outcome: AttemptOutcome::Succeeded,
                    detail: detail.clone(),
                    artifact,
                },
            )
            .await?;
        self.store.complete_plan(item.id).await?;
        self.store.clear_retry(item.id).await?;
        self.store
            .transition(item.id, Stage::Approved, Stage::Done, &Actor::Executor, Some(&detail))
            .await?;
        info!(item_id = %item.id, "Item executed");
        Ok(())
    }

    async fn retry_or_fail(
        &self,
        item: &Item,
        started_at: chrono::DateTime<Utc>,
        e: DispatchError,
    ) -> crate::error::Result<()> {
        self.store
            .record_attempt(
                item.id,
                &Attempt {
                    started_at,
                    finished_at: Utc::now(),
                    outcome: AttemptOutcome::TransientFailure,
                    detail: e.to_string(),
                    artifact: Some(serde_json::json!({
                        "error": e.to_string(),
                        "action": item.action.map(|k| k.to_string()),
                    })),
                },
            )
            .await?;

        // Attempt budget counts since the Item last entered Approved, so
        // a manual Failed → Approved retry starts fresh.
        let attempts = self
            .store
            .attempts_since(item.id, item.last_transition_at)
            .await?;

        if attempts >= self.retry.max_attempts {
            self.store.clear_retry(item.id).await?;
            self.store
                .transition(
                    item.id,
                    Stage::Approved,
                    Stage::Failed,
                    &Actor::Executor,
                    Some(&format!("retries exhausted after {attempts} attempts: {e}")),
                )
                .await?;
            warn!(item_id = %item.id, attempts, "Item failed after exhausting retries");
        } else {
            let delay = self.retry.delay_for(attempts);
            let next = Utc::now()
                + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::seconds(60));
            self.store.schedule_retry(item.id, next).await?;
            info!(item_id = %item.id, attempts, ?delay, "Transient failure, retry scheduled");
        }
        Ok(())
    }

    async fn fail(
        &self,
        item: &Item,
        started_at: chrono::DateTime<Utc>,
        detail: String,
        artifact: Option<serde_json::Value>,
    ) -> crate::error::Result<()> {
        self.store
            .record_attempt(
                item.id,
                &Attempt {
                    started_at,
                    finished_at: Utc::now(),
                    outcome: AttemptOutcome::PermanentFailure,
                    detail: detail.clone(),
                    artifact,
                },
            )
            .await?;
        self.store.clear_retry(item.id).await?;
        self.store
            .transition(item.id, Stage::Approved, Stage::Failed, &Actor::Executor, Some(&detail))
            .await?;
        warn!(item_id = %item.id, detail, "Item failed permanently");
        Ok(())
    }
}

/// Spawn the executor on an interval. Returns the handle and a shutdown flag.
pub fn spawn_executor(
    executor: Arc<Executor>,
    interval: Duration,
) -> (JoinHandle<()>, Arc<AtomicBool>) {
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = Arc::clone(&shutdown);

    let handle = tokio::spawn(async move {
        info!("Executor started — cycle every {:?}", interval);
        let mut tick = tokio::time::interval(interval);

        loop {
            tick.tick().await;
            if shutdown.load(Ordering::Relaxed) {
                info!("Executor shutting down");
                return;
            }
            executor.run_cycle().await;
        }
    });

    (handle, shutdown_flag)
}
