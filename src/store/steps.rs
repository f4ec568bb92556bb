//! Step rows, with snapshot/commit attachments and a mirrored error column.

use chrono::Utc;
use rusqlite::params;

use super::Store;
use crate::errors::StoreError;

#[derive(Debug, Clone)]
pub struct StepRow {
    pub id: i64,
    pub name: String,
    pub status: String,
    pub started_at: String,
    pub completed_at: Option<String>,
    pub snapshot_before: Option<String>,
    pub snapshot_after: Option<String>,
    pub commit_created: Option<String>,
    pub error: Option<String>,
}

pub struct StepApi<'a>(pub(crate) &'a Store);

impl StepApi<'_> {
    pub fn start(&self, name: &str) -> Result<i64, StoreError> {
        let now = Utc::now().to_rfc3339();
        let id = self.0.with_conn(|conn| {
            conn.execute(
                "INSERT INTO steps (name, status, started_at) VALUES (?1, 'running', ?2)",
                params![name, now],
            )?;
            Ok(conn.last_insert_rowid())
        })?;
        self.0.emit("steps");
        Ok(id)
    }

    pub fn set_snapshot_before(&self, id: i64, change_id: &str) -> Result<(), StoreError> {
        self.0.with_conn(|conn| {
            conn.execute(
                "UPDATE steps SET snapshot_before = ?1 WHERE id = ?2",
                params![change_id, id],
            )?;
            Ok(())
        })?;
        self.0.emit("steps");
        Ok(())
    }

    /// Finish a step. `error` records a non-fatal failure observed inside
    /// the step (a failed command is not a step failure).
    pub fn complete(
        &self,
        id: i64,
        snapshot_after: Option<&str>,
        commit_created: Option<&str>,
        error: Option<&str>,
    ) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        let updated = self.0.with_conn(|conn| {
            conn.execute(
                "UPDATE steps SET status = 'completed', completed_at = ?1,
                        snapshot_after = COALESCE(?2, snapshot_after),
                        commit_created = COALESCE(?3, commit_created),
                        error = COALESCE(?4, error)
                 WHERE id = ?5 AND status = 'running'",
                params![now, snapshot_after, commit_created, error, id],
            )
        })?;
        if updated > 0 {
            self.0.emit("steps");
        }
        Ok(())
    }

    pub fn fail(&self, id: i64, error: &str) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        let updated = self.0.with_conn(|conn| {
            conn.execute(
                "UPDATE steps SET status = 'failed', completed_at = ?1, error = ?2
                 WHERE id = ?3 AND status = 'running'",
                params![now, error, id],
            )
        })?;
        if updated > 0 {
            self.0.emit("steps");
        }
        Ok(())
    }

    pub fn list(&self) -> Result<Vec<StepRow>, StoreError> {
        self.0.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, name, status, started_at, completed_at, snapshot_before,
                        snapshot_after, commit_created, error
                 FROM steps ORDER BY id",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(StepRow {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    status: row.get(2)?,
                    started_at: row.get(3)?,
                    completed_at: row.get(4)?,
                    snapshot_before: row.get(5)?,
                    snapshot_after: row.get(6)?,
                    commit_created: row.get(7)?,
                    error: row.get(8)?,
                })
            })?;
            rows.collect()
        })
    }
}
