//! Local drop folder source — files dropped into a directory become events.
//!
//! The filename is the external ID, the file contents the body. Files are
//! never deleted or moved here; the ledger keeps re-polls idempotent, and
//! the archive capability files the payload after execution.

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::warn;

use crate::error::SourceError;
use crate::item::Channel;
use crate::watcher::{ChannelSource, RawEvent};

/// Drop-directory channel source.
pub struct LocalDropSource {
    drop_dir: PathBuf,
}

impl LocalDropSource {
    pub fn new(drop_dir: impl Into<PathBuf>) -> Self {
        Self {
            drop_dir: drop_dir.into(),
        }
    }
}

#[async_trait]
impl ChannelSource for LocalDropSource {
    fn channel(&self) -> Channel {
        Channel::LocalDrop
    }

    async fn poll(&self) -> Result<Vec<RawEvent>, SourceError> {
        if !self.drop_dir.is_dir() {
            // Directory not created yet — nothing dropped.
            return Ok(Vec::new());
        }

        let mut entries = tokio::fs::read_dir(&self.drop_dir).await?;
        let mut files: Vec<(String, PathBuf)> = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if name.starts_with('.') {
                continue;
            }
            files.push((name.to_string(), path));
        }
        // Deterministic admission order across polls.
        files.sort_by(|a, b| a.0.cmp(&b.0));

        let mut events = Vec::with_capacity(files.len());
        for (name, path) in files {
            let body = match tokio::fs::read_to_string(&path).await {
                Ok(body) => body,
                Err(e) => {
                    // Unreadable (binary or mid-write) files are retried
                    // on the next cycle.
                    warn!(file = %path.display(), error = %e, "Skipping unreadable drop file");
                    continue;
                }
            };

            let received_at: DateTime<Utc> = tokio::fs::metadata(&path)
                .await
                .ok()
                .and_then(|m| m.modified().ok())
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(Utc::now);

            events.push(RawEvent {
                external_id: name,
                sender: None,
                subject: None,
                body,
                metadata: serde_json::json!({ "path": path.display().to_string() }),
                received_at,
            });
        }

        Ok(events)
    }
}
