//! Schema migrations for the pipeline store.

use libsql::Connection;

use crate::error::StoreError;

/// Run all schema migrations. Idempotent — every statement is
/// `IF NOT EXISTS`.
pub async fn run(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS items (
            id TEXT PRIMARY KEY,
            channel TEXT NOT NULL,
            external_id TEXT NOT NULL,
            sender TEXT,
            subject TEXT,
            body TEXT NOT NULL,
            metadata TEXT NOT NULL DEFAULT '{}',
            stage TEXT NOT NULL DEFAULT 'intake',
            classification TEXT,
            priority TEXT,
            requires_approval INTEGER NOT NULL DEFAULT 0,
            action_kind TEXT,
            plan TEXT NOT NULL DEFAULT '[]',
            feedback TEXT,
            review_required INTEGER NOT NULL DEFAULT 0,
            next_attempt_at TEXT,
            received_at TEXT NOT NULL,
            created_at TEXT NOT NULL,
            last_transition_at TEXT NOT NULL,
            UNIQUE(channel, external_id)
        );
        CREATE INDEX IF NOT EXISTS idx_items_stage ON items(stage);
        CREATE INDEX IF NOT EXISTS idx_items_channel ON items(channel);

        CREATE TABLE IF NOT EXISTS ledger (
            channel TEXT NOT NULL,
            external_id TEXT NOT NULL,
            marked_at TEXT NOT NULL,
            PRIMARY KEY(channel, external_id)
        );

        CREATE TABLE IF NOT EXISTS attempts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            item_id TEXT NOT NULL,
            started_at TEXT NOT NULL,
            finished_at TEXT NOT NULL,
            outcome TEXT NOT NULL,
            detail TEXT NOT NULL,
            artifact TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_attempts_item ON attempts(item_id);

        CREATE TABLE IF NOT EXISTS audit_log (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            ts TEXT NOT NULL,
            item_id TEXT NOT NULL,
            from_stage TEXT,
            to_stage TEXT NOT NULL,
            actor TEXT NOT NULL,
            detail TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_audit_item ON audit_log(item_id);

        CREATE TABLE IF NOT EXISTS leases (
            item_id TEXT PRIMARY KEY,
            holder TEXT NOT NULL,
            acquired_at TEXT NOT NULL,
            expires_at TEXT NOT NULL
        );",
    )
    .await
    .map_err(|e| StoreError::Migration(e.to_string()))?;

    Ok(())
}
