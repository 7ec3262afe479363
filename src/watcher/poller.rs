//! Generic channel poller — fetches, deduplicates, and admits events.
//!
//! One spawned task per channel. Each cycle:
//! 1. `poll()` the source
//! 2. skip events the ledger has seen
//! 3. admit the rest at Intake, in source order
//! 4. mark each admitted event seen
//!
//! Admit-then-mark: the Item row commits before the ledger row, so a
//! crash between the two re-attempts admission next cycle and the
//! UNIQUE (channel, external_id) constraint collapses the duplicate.
//! Source errors end the cycle; they never kill the task.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::audit::Actor;
use crate::error::StoreError;
use crate::item::NewItem;
use crate::store::PipelineStore;
use crate::watcher::{ChannelSource, PollSchedule};

/// Spawn a background task that polls a channel source on its schedule.
///
/// Returns a `JoinHandle` and a shutdown flag. Set the flag to stop
/// polling after the current cycle.
pub fn spawn_watcher(
    source: Arc<dyn ChannelSource>,
    store: Arc<dyn PipelineStore>,
    schedule: PollSchedule,
    shutdown: Arc<AtomicBool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let channel = source.channel();
        info!(%channel, "Watcher started");

        loop {
            let delay = schedule.next_delay(Utc::now());
            tokio::time::sleep(delay).await;

            if shutdown.load(Ordering::Relaxed) {
                info!(%channel, "Watcher shutting down");
                return;
            }

            poll_cycle(source.as_ref(), store.as_ref()).await;
        }
    })
}

/// Run a single poll cycle. Returns how many new Items were admitted.
///
/// Public so tests (and push-triggered channels) can drive a cycle
/// without the timer.
pub async fn poll_cycle(source: &dyn ChannelSource, store: &dyn PipelineStore) -> usize {
    let channel = source.channel();

    let events = match source.poll().await {
        Ok(events) => events,
        Err(e) => {
            // Source errors are contained here: log, skip this cycle,
            // retry next poll.
            warn!(%channel, error = %e, "Poll failed, retrying next cycle");
            return 0;
        }
    };

    if events.is_empty() {
        return 0;
    }
    debug!(%channel, count = events.len(), "Fetched events");

    let mut admitted = 0;
    for event in events {
        // Dedup: skip events the ledger already recorded.
        match store.seen(channel, &event.external_id).await {
            Ok(true) => continue,
            Ok(false) => {}
            Err(e) => {
                error!(%channel, external_id = %event.external_id, error = %e, "Ledger check failed");
                continue;
            }
        }

        let new_item = NewItem::new(
            channel,
            event.external_id.clone(),
            crate::item::Payload {
                sender: event.sender,
                subject: event.subject,
                body: event.body,
                metadata: event.metadata,
            },
            event.received_at,
        );

        match store.admit(&new_item, &Actor::Watcher(channel)).await {
            Ok(item) => {
                debug!(%channel, item_id = %item.id, external_id = %event.external_id, "Item admitted");
                admitted += 1;
            }
            Err(StoreError::Duplicate { .. }) => {
                // Already admitted by a crashed prior cycle; the ledger
                // row below is what was missing.
                debug!(%channel, external_id = %event.external_id, "Duplicate admission collapsed");
            }
            Err(e) => {
                // Leave the event unmarked so the next cycle re-attempts it.
                error!(%channel, external_id = %event.external_id, error = %e, "Admission failed");
                continue;
            }
        }

        if let Err(e) = store.mark_seen(channel, &event.external_id).await {
            warn!(%channel, external_id = %event.external_id, error = %e, "Failed to mark seen");
        }
    }

    if admitted > 0 {
        info!(%channel, admitted, "Poll cycle admitted new items");
    }
    admitted
}
