//! Durable keyed store of [`GroupChatState`] records.
//!
//! One row per group id, the whole state serialized as a JSON document.
//! Dates live inside the JSON as RFC 3339 strings and come back as
//! `DateTime<Utc>` through chrono's serde support. No business logic here;
//! the manager in `groups.rs` owns all state transitions.

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;

use crate::types::GroupChatState;

pub struct GroupStateStore {
    conn: Mutex<Connection>,
}

impl GroupStateStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path).context("failed to open group state database")?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    fn lock_conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| anyhow::anyhow!("group state lock poisoned: {}", e))
    }

    fn ensure_schema(&self) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS group_states (
                group_id TEXT PRIMARY KEY,
                state_json TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )"#,
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_group_states_updated_at ON group_states(updated_at DESC)",
            [],
        )?;
        Ok(())
    }

    pub fn get(&self, group_id: &str) -> Result<Option<GroupChatState>> {
        let conn = self.lock_conn()?;
        let json: Option<String> = conn
            .query_row(
                "SELECT state_json FROM group_states WHERE group_id = ?1",
                [group_id],
                |row| row.get(0),
            )
            .optional()?;
        match json {
            Some(json) => {
                let state = serde_json::from_str(&json)
                    .with_context(|| format!("corrupt state record for group {}", group_id))?;
                Ok(Some(state))
            }
            None => Ok(None),
        }
    }

    /// Insert or replace the whole record for a group.
    pub fn put(&self, state: &GroupChatState) -> Result<()> {
        let json = serde_json::to_string(state).context("failed to serialize group state")?;
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO group_states (group_id, state_json, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(group_id) DO UPDATE SET state_json = ?2, updated_at = ?3",
            params![state.group_id, json, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// Explicit admin delete; returns whether a record existed.
    pub fn delete(&self, group_id: &str) -> Result<bool> {
        let conn = self.lock_conn()?;
        let affected = conn.execute("DELETE FROM group_states WHERE group_id = ?1", [group_id])?;
        Ok(affected > 0)
    }

    pub fn group_ids(&self) -> Result<Vec<String>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare("SELECT group_id FROM group_states ORDER BY group_id")?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    /// Full-table read. Doubles as the liveness probe for health checks.
    pub fn all(&self) -> Result<Vec<GroupChatState>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare("SELECT group_id, state_json FROM group_states")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        drop(stmt);
        drop(conn);

        let mut states = Vec::with_capacity(rows.len());
        for (group_id, json) in rows {
            let state: GroupChatState = serde_json::from_str(&json)
                .with_context(|| format!("corrupt state record for group {}", group_id))?;
            states.push(state);
        }
        Ok(states)
    }

    /// Re-serialize every record through the current model. Older deployments
    /// stored dates in assorted string shapes; loading through serde
    /// canonicalizes them to RFC 3339 and fills in fields added since.
    /// Records that no longer parse are skipped and reported, not dropped.
    pub fn migrate_legacy_records(&self) -> Result<MigrationReport> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare("SELECT group_id, state_json FROM group_states")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        drop(stmt);
        drop(conn);

        let mut report = MigrationReport::default();
        for (group_id, json) in rows {
            match serde_json::from_str::<GroupChatState>(&json) {
                Ok(state) => {
                    self.put(&state)?;
                    report.migrated += 1;
                }
                Err(e) => {
                    tracing::warn!("skipping unparseable state for group {}: {}", group_id, e);
                    report.skipped.push(group_id);
                }
            }
        }
        Ok(report)
    }
}

#[derive(Debug, Default)]
pub struct MigrationReport {
    pub migrated: usize,
    pub skipped: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{GroupParticipant, ParticipantStatus};

    #[test]
    fn put_get_roundtrip_preserves_dates() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = GroupStateStore::new(dir.path().join("groups.db")).expect("store init");

        let now = Utc::now();
        let mut state = GroupChatState::new("grp-1", None);
        state.participants.insert(
            "0xabc".to_string(),
            GroupParticipant::new("0xabc", ParticipantStatus::Active, now),
        );
        store.put(&state).expect("put");

        let loaded = store.get("grp-1").expect("get").expect("state exists");
        assert_eq!(loaded.group_id, "grp-1");
        assert_eq!(loaded.participants["0xabc"].joined_at, now);
        assert_eq!(loaded.participants["0xabc"].status, ParticipantStatus::Active);
    }

    #[test]
    fn put_replaces_existing_record() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = GroupStateStore::new(dir.path().join("groups.db")).expect("store init");

        let mut state = GroupChatState::new("grp-1", None);
        store.put(&state).expect("first put");
        state.metadata.name = "Degens".to_string();
        store.put(&state).expect("second put");

        let loaded = store.get("grp-1").expect("get").expect("state exists");
        assert_eq!(loaded.metadata.name, "Degens");
        assert_eq!(store.group_ids().expect("ids").len(), 1);
    }

    #[test]
    fn delete_reports_whether_record_existed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = GroupStateStore::new(dir.path().join("groups.db")).expect("store init");

        store.put(&GroupChatState::new("grp-1", None)).expect("put");
        assert!(store.delete("grp-1").expect("delete existing"));
        assert!(!store.delete("grp-1").expect("delete missing"));
        assert!(store.get("grp-1").expect("get").is_none());
    }

    #[test]
    fn migration_rewrites_parseable_records_and_skips_garbage() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = GroupStateStore::new(dir.path().join("groups.db")).expect("store init");

        store.put(&GroupChatState::new("grp-ok", None)).expect("put");
        {
            let conn = store.lock_conn().expect("conn");
            conn.execute(
                "INSERT INTO group_states (group_id, state_json, updated_at) VALUES (?1, ?2, ?3)",
                params!["grp-bad", "{not json", Utc::now().to_rfc3339()],
            )
            .expect("insert garbage");
        }

        let report = store.migrate_legacy_records().expect("migrate");
        assert_eq!(report.migrated, 1);
        assert_eq!(report.skipped, vec!["grp-bad".to_string()]);
    }
}
