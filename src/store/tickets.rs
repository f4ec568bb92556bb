//! Ticket rows: a small work-item board persisted alongside the run.
//!
//! The engine core does not schedule tickets; higher-level workflow helpers
//! read and write them through this API.

use chrono::Utc;
use rusqlite::{OptionalExtension, params};
use uuid::Uuid;

use super::Store;
use crate::errors::StoreError;
use smithers_common::TicketStatus;

#[derive(Debug, Clone, Default)]
pub struct TicketDraft {
    pub title: String,
    pub description: String,
    pub acceptance: Vec<String>,
    pub priority: i64,
    pub dependencies: Vec<String>,
    pub requires_e2e: bool,
}

#[derive(Debug, Clone)]
pub struct TicketRow {
    pub id: String,
    pub title: String,
    pub description: String,
    pub acceptance: Vec<String>,
    pub priority: i64,
    pub status: TicketStatus,
    pub dependencies: Vec<String>,
    pub progress_notes: Vec<String>,
    pub requires_e2e: bool,
    pub created_at: String,
    pub updated_at: String,
}

pub struct TicketApi<'a>(pub(crate) &'a Store);

impl TicketApi<'_> {
    pub fn create(&self, draft: TicketDraft) -> Result<String, StoreError> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();
        let acceptance = serde_json::to_string(&draft.acceptance).unwrap_or_else(|_| "[]".into());
        let deps = serde_json::to_string(&draft.dependencies).unwrap_or_else(|_| "[]".into());
        self.0.with_conn(|conn| {
            conn.execute(
                "INSERT INTO tickets (id, title, description, acceptance, priority, status,
                                      dependencies, progress_notes, requires_e2e,
                                      created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 'todo', ?6, '[]', ?7, ?8, ?8)",
                params![
                    id,
                    draft.title,
                    draft.description,
                    acceptance,
                    draft.priority,
                    deps,
                    draft.requires_e2e,
                    now
                ],
            )?;
            Ok(())
        })?;
        self.0.emit("tickets");
        Ok(id)
    }

    pub fn set_status(&self, id: &str, status: TicketStatus) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        let updated = self.0.with_conn(|conn| {
            conn.execute(
                "UPDATE tickets SET status = ?1, updated_at = ?2 WHERE id = ?3",
                params![status.as_str(), now, id],
            )
        })?;
        if updated == 0 {
            return Err(StoreError::RowNotFound {
                entity: "ticket",
                id: id.to_string(),
            });
        }
        self.0.emit("tickets");
        Ok(())
    }

    /// Append a progress note to the ticket's log.
    pub fn add_note(&self, id: &str, note: &str) -> Result<(), StoreError> {
        let row = self.get(id)?.ok_or_else(|| StoreError::RowNotFound {
            entity: "ticket",
            id: id.to_string(),
        })?;
        let mut notes = row.progress_notes;
        notes.push(note.to_string());
        let encoded = serde_json::to_string(&notes).unwrap_or_else(|_| "[]".into());
        let now = Utc::now().to_rfc3339();
        self.0.with_conn(|conn| {
            conn.execute(
                "UPDATE tickets SET progress_notes = ?1, updated_at = ?2 WHERE id = ?3",
                params![encoded, now, id],
            )?;
            Ok(())
        })?;
        self.0.emit("tickets");
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<Option<TicketRow>, StoreError> {
        self.0.with_conn(|conn| {
            conn.query_row(
                "SELECT id, title, description, acceptance, priority, status, dependencies,
                        progress_notes, requires_e2e, created_at, updated_at
                 FROM tickets WHERE id = ?1",
                params![id],
                row_to_ticket,
            )
            .optional()
        })
    }

    /// Tickets, highest priority first, optionally filtered by status.
    pub fn list(&self, status: Option<TicketStatus>) -> Result<Vec<TicketRow>, StoreError> {
        self.0.with_conn(|conn| {
            let base = "SELECT id, title, description, acceptance, priority, status, dependencies,
                               progress_notes, requires_e2e, created_at, updated_at
                        FROM tickets";
            match status {
                Some(s) => {
                    let sql =
                        format!("{} WHERE status = ?1 ORDER BY priority DESC, created_at", base);
                    let mut stmt = conn.prepare(&sql)?;
                    let rows = stmt.query_map(params![s.as_str()], row_to_ticket)?;
                    rows.collect()
                }
                None => {
                    let sql = format!("{} ORDER BY priority DESC, created_at", base);
                    let mut stmt = conn.prepare(&sql)?;
                    let rows = stmt.query_map([], row_to_ticket)?;
                    rows.collect()
                }
            }
        })
    }
}

fn row_to_ticket(row: &rusqlite::Row<'_>) -> Result<TicketRow, rusqlite::Error> {
    let acceptance: String = row.get(3)?;
    let status: String = row.get(5)?;
    let deps: String = row.get(6)?;
    let notes: String = row.get(7)?;
    Ok(TicketRow {
        id: row.get(0)?,
        title: row.get(1)?,
        description: row.get(2)?,
        acceptance: serde_json::from_str(&acceptance).unwrap_or_default(),
        priority: row.get(4)?,
        status: TicketStatus::parse(&status).unwrap_or_default(),
        dependencies: serde_json::from_str(&deps).unwrap_or_default(),
        progress_notes: serde_json::from_str(&notes).unwrap_or_default(),
        requires_e2e: row.get(8)?,
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
    })
}
