//! VCS event rows: snapshots and commits recorded by the workflow.

use chrono::Utc;
use rusqlite::params;

use super::Store;
use crate::errors::StoreError;

#[derive(Debug, Clone)]
pub struct VcsEventRow {
    pub id: i64,
    pub vcs_type: String,
    pub commit_hash: Option<String>,
    pub change_id: Option<String>,
    pub message: String,
    pub ts: String,
}

pub struct VcsApi<'a>(pub(crate) &'a Store);

impl VcsApi<'_> {
    pub fn record(
        &self,
        vcs_type: &str,
        commit_hash: Option<&str>,
        change_id: Option<&str>,
        message: &str,
    ) -> Result<i64, StoreError> {
        let now = Utc::now().to_rfc3339();
        let id = self.0.with_conn(|conn| {
            conn.execute(
                "INSERT INTO vcs_events (vcs_type, commit_hash, change_id, message, ts)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![vcs_type, commit_hash, change_id, message, now],
            )?;
            Ok(conn.last_insert_rowid())
        })?;
        self.0.emit("vcs_events");
        Ok(id)
    }

    pub fn list(&self) -> Result<Vec<VcsEventRow>, StoreError> {
        self.0.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, vcs_type, commit_hash, change_id, message, ts
                 FROM vcs_events ORDER BY id",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(VcsEventRow {
                    id: row.get(0)?,
                    vcs_type: row.get(1)?,
                    commit_hash: row.get(2)?,
                    change_id: row.get(3)?,
                    message: row.get(4)?,
                    ts: row.get(5)?,
                })
            })?;
            rows.collect()
        })
    }
}
