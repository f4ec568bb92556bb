//! Human interaction rows: pending approvals resolved by an external writer.

use chrono::Utc;
use rusqlite::{OptionalExtension, params};
use serde_json::Value;
use uuid::Uuid;

use super::Store;
use crate::errors::StoreError;
use smithers_common::HumanStatus;

#[derive(Debug, Clone)]
pub struct HumanRow {
    pub id: String,
    pub kind: String,
    pub prompt: String,
    pub status: String,
    pub created_at: String,
    pub resolved_at: Option<String>,
    pub response: Option<Value>,
}

pub struct HumanApi<'a>(pub(crate) &'a Store);

impl HumanApi<'_> {
    /// Create a pending interaction and return its id.
    pub fn create(&self, kind: &str, prompt: &str) -> Result<String, StoreError> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();
        self.0.with_conn(|conn| {
            conn.execute(
                "INSERT INTO human_interactions (id, kind, prompt, status, created_at)
                 VALUES (?1, ?2, ?3, 'pending', ?4)",
                params![id, kind, prompt, now],
            )?;
            Ok(())
        })?;
        self.0.emit("human_interactions");
        Ok(id)
    }

    /// Resolve a pending interaction. Resolution is first-writer-wins; a
    /// second resolve is rejected with `RowNotFound`.
    pub fn resolve(
        &self,
        id: &str,
        status: HumanStatus,
        response: Option<&Value>,
    ) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        let encoded = response.map(|v| v.to_string());
        let updated = self.0.with_conn(|conn| {
            conn.execute(
                "UPDATE human_interactions SET status = ?1, resolved_at = ?2, response = ?3
                 WHERE id = ?4 AND status = 'pending'",
                params![status.as_str(), now, encoded, id],
            )
        })?;
        if updated == 0 {
            return Err(StoreError::RowNotFound {
                entity: "pending human interaction",
                id: id.to_string(),
            });
        }
        self.0.emit("human_interactions");
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<Option<HumanRow>, StoreError> {
        self.0.with_conn(|conn| {
            conn.query_row(
                "SELECT id, kind, prompt, status, created_at, resolved_at, response
                 FROM human_interactions WHERE id = ?1",
                params![id],
                row_to_human,
            )
            .optional()
        })
    }

    /// Pending interactions, oldest first.
    pub fn pending(&self) -> Result<Vec<HumanRow>, StoreError> {
        self.0.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, kind, prompt, status, created_at, resolved_at, response
                 FROM human_interactions WHERE status = 'pending' ORDER BY created_at, id",
            )?;
            let rows = stmt.query_map([], row_to_human)?;
            rows.collect()
        })
    }
}

fn row_to_human(row: &rusqlite::Row<'_>) -> Result<HumanRow, rusqlite::Error> {
    let response: Option<String> = row.get(6)?;
    Ok(HumanRow {
        id: row.get(0)?,
        kind: row.get(1)?,
        prompt: row.get(2)?,
        status: row.get(3)?,
        created_at: row.get(4)?,
        resolved_at: row.get(5)?,
        response: response.and_then(|s| serde_json::from_str(&s).ok()),
    })
}
