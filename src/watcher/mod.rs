//! Channel watchers — one poller per external channel.
//!
//! A `ChannelSource` is pure I/O: it reads the channel's native feed and
//! returns normalized `RawEvent`s. Deduplication, admission, and error
//! containment live in the generic poller. Source failures are typed and
//! always retryable at the next cycle.

pub mod local_drop;
pub mod poller;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, SourceError};
use crate::item::Channel;

pub use local_drop::LocalDropSource;
pub use poller::{poll_cycle, spawn_watcher};

/// One event as reported by a channel, before admission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawEvent {
    /// Channel-native event ID — the dedup key within the channel.
    pub external_id: String,
    /// Sender identifier, if the channel has one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    /// Subject or title, if the channel has one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    /// Event content.
    pub body: String,
    /// Channel-specific metadata (threading headers, record ids, paths).
    #[serde(default)]
    pub metadata: serde_json::Value,
    /// When the channel reported the event.
    pub received_at: DateTime<Utc>,
}

/// Trait for channel sources — pure I/O, no pipeline logic.
///
/// Implementations must report events in channel order; the poller
/// admits them in the order returned.
#[async_trait]
pub trait ChannelSource: Send + Sync {
    /// Which channel this source feeds.
    fn channel(&self) -> Channel;

    /// Fetch new events since the last poll. May return events already
    /// ingested — the poller deduplicates against the ledger.
    async fn poll(&self) -> Result<Vec<RawEvent>, SourceError>;
}

/// When a watcher's poll cycles run.
#[derive(Debug, Clone)]
pub enum PollSchedule {
    /// Fixed interval between cycles.
    Interval(Duration),
    /// Cron expression (UTC) for channels polled on business schedules.
    Cron(Box<cron::Schedule>),
}

impl PollSchedule {
    /// Parse a cron expression into a schedule.
    pub fn cron(expr: &str) -> Result<Self, ConfigError> {
        let schedule: cron::Schedule = expr.parse().map_err(|e| ConfigError::InvalidCron {
            expr: expr.to_string(),
            message: format!("{e}"),
        })?;
        Ok(Self::Cron(Box::new(schedule)))
    }

    /// Time until the next cycle should run.
    pub fn next_delay(&self, now: DateTime<Utc>) -> Duration {
        match self {
            Self::Interval(interval) => *interval,
            Self::Cron(schedule) => schedule
                .after(&now)
                .next()
                .and_then(|next| (next - now).to_std().ok())
                // An exhausted cron schedule backs off a minute rather than spinning.
                .unwrap_or(Duration::from_secs(60)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_schedule_returns_interval() {
        let schedule = PollSchedule::Interval(Duration::from_secs(30));
        assert_eq!(schedule.next_delay(Utc::now()), Duration::from_secs(30));
    }

    #[test]
    fn cron_schedule_parses_and_yields_future_delay() {
        // Every minute at second 0.
        let schedule = PollSchedule::cron("0 * * * * *").unwrap();
        let delay = schedule.next_delay(Utc::now());
        assert!(delay <= Duration::from_secs(60));
    }

    #[test]
    fn invalid_cron_is_a_config_error() {
        assert!(PollSchedule::cron("not a cron").is_err());
    }

    #[test]
    fn raw_event_serde_roundtrip() {
        let event = RawEvent {
            external_id: "msg-42".into(),
            sender: Some("alice@example.com".into()),
            subject: None,
            body: "hello".into(),
            metadata: serde_json::json!({"thread": "t-1"}),
            received_at: Utc::now(),
        };
        let json = serde_json::to_string(&event).unwrap();
        let parsed: RawEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.external_id, "msg-42");
        assert_eq!(parsed.metadata["thread"], "t-1");
    }
}
