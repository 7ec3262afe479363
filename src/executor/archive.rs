//! Archive capability — files local-drop payloads into the archive
//! directory. The one built-in handler; everything else is an external
//! collaborator.

use std::path::PathBuf;

use async_trait::async_trait;
use tracing::debug;

use crate::error::DispatchError;
use crate::executor::{Capability, Outcome};
use crate::item::{ActionKind, Item};

/// Writes the Item's payload body into the archive directory under its
/// external ID. Idempotent: re-running after a timeout overwrites the
/// same file with the same content.
pub struct ArchiveFileCapability {
    archive_dir: PathBuf,
}

impl ArchiveFileCapability {
    pub fn new(archive_dir: impl Into<PathBuf>) -> Self {
        Self {
            archive_dir: archive_dir.into(),
        }
    }
}

#[async_trait]
impl Capability for ArchiveFileCapability {
    fn kind(&self) -> ActionKind {
        ActionKind::ArchiveFile
    }

    async fn execute(&self, item: &Item) -> Result<Outcome, DispatchError> {
        // External IDs are filenames from the drop folder; refuse anything
        // that could escape the archive directory.
        if item.external_id.contains('/') || item.external_id.contains("..") {
            return Err(DispatchError::Permanent(format!(
                "unsafe archive filename: {}",
                item.external_id
            )));
        }

        tokio::fs::create_dir_all(&self.archive_dir)
            .await
            .map_err(|e| DispatchError::Transient(format!("create archive dir: {e}")))?;

        let target = self.archive_dir.join(&item.external_id);
        tokio::fs::write(&target, item.payload.body.as_bytes())
            .await
            .map_err(|e| DispatchError::Transient(format!("write archive file: {e}")))?;

        debug!(item_id = %item.id, target = %target.display(), "Payload archived");
        Ok(
            Outcome::ok(format!("archived to {}", target.display())).with_artifact(
                serde_json::json!({
                    "archived_to": target.display().to_string(),
                    "bytes": item.payload.body.len(),
                }),
            ),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::{Channel, Payload, Stage};
    use chrono::Utc;
    use uuid::Uuid;

    fn drop_item(external_id: &str, body: &str) -> Item {
        Item {
            id: Uuid::new_v4(),
            channel: Channel::LocalDrop,
            external_id: external_id.into(),
            payload: Payload {
                sender: None,
                subject: None,
                body: body.into(),
                metadata: serde_json::json!({}),
            },
            stage: Stage::Approved,
            classification: Some("file".into()),
            priority: None,
            requires_approval: false,
            action: Some(ActionKind::ArchiveFile),
            plan: Vec::new(),
            feedback: None,
            attempts: Vec::new(),
            review_required: false,
            next_attempt_at: None,
            received_at: Utc::now(),
            created_at: Utc::now(),
            last_transition_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn archives_payload_under_external_id() {
        let tmp = tempfile::tempdir().unwrap();
        let capability = ArchiveFileCapability::new(tmp.path().join("archive"));
        let item = drop_item("note.txt", "remember the milk");

        let outcome = capability.execute(&item).await.unwrap();
        assert!(outcome.success);

        let archived = tmp.path().join("archive").join("note.txt");
        let content = tokio::fs::read_to_string(&archived).await.unwrap();
        assert_eq!(content, "remember the milk");
        assert_eq!(outcome.artifact.unwrap()["bytes"], 17);
    }

    #[tokio::test]
    async fn re_execution_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let capability = ArchiveFileCapability::new(tmp.path());
        let item = drop_item("note.txt", "same content");

        capability.execute(&item).await.unwrap();
        capability.execute(&item).await.unwrap();

        let content = tokio::fs::read_to_string(tmp.path().join("note.txt"))
            .await
            .unwrap();
        assert_eq!(content, "same content");
    }

    #[tokio::test]
    async fn path_escape_is_permanent_failure() {
        let tmp = tempfile::tempdir().unwrap();
        let capability = ArchiveFileCapability::new(tmp.path());
        let item = drop_item("../outside.txt", "nope");

        let err = capability.execute(&item).await.unwrap_err();
        assert!(matches!(err, DispatchError::Permanent(_)));
    }
}
