//! Task rows: the unit schedulers use to observe work in progress.
//!
//! Counts exclude `step` and `phase` typed tasks (scheduling artifacts, not
//! work) and are scoped to the current execution. Scope-id counts let
//! sibling steps run side by side without observing each other's tasks.

use chrono::Utc;
use rusqlite::params;
use uuid::Uuid;

use super::Store;
use crate::errors::StoreError;

/// Component types excluded from scheduler counts.
const ARTIFACT_TYPES: &str = "('step', 'phase')";

#[derive(Debug, Clone)]
pub struct TaskRow {
    pub id: String,
    pub execution_id: String,
    pub iteration: u64,
    pub scope_id: Option<String>,
    pub component_type: String,
    pub component_name: String,
    pub status: String,
    pub started_at: String,
    pub ended_at: Option<String>,
}

pub struct TaskApi<'a>(pub(crate) &'a Store);

impl TaskApi<'_> {
    /// Open a running task attributed to the current execution.
    pub fn start(
        &self,
        component_type: &str,
        component_name: &str,
        iteration: u64,
        scope_id: Option<Uuid>,
    ) -> Result<String, StoreError> {
        let execution_id = self.0.execution_id()?;
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();
        let scope = scope_id.map(|s| s.to_string());
        self.0.with_conn(|conn| {
            conn.execute(
                "INSERT INTO tasks (id, execution_id, iteration, scope_id, component_type,
                                    component_name, status, started_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'running', ?7)",
                params![
                    id,
                    execution_id,
                    iteration as i64,
                    scope,
                    component_type,
                    component_name,
                    now
                ],
            )?;
            Ok(())
        })?;
        self.0.emit("tasks");
        Ok(id)
    }

    pub fn complete(&self, id: &str) -> Result<(), StoreError> {
        self.finish(id, "completed")
    }

    pub fn fail(&self, id: &str) -> Result<(), StoreError> {
        self.finish(id, "failed")
    }

    fn finish(&self, id: &str, status: &str) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        let updated = self.0.with_conn(|conn| {
            conn.execute(
                "UPDATE tasks SET status = ?1, ended_at = ?2 WHERE id = ?3 AND status = 'running'",
                params![status, now, id],
            )
        })?;
        if updated > 0 {
            self.0.emit("tasks");
        }
        Ok(())
    }

    /// Re-attach a surviving task (by component name) to the current
    /// execution, iteration, and scope. Used when a human gate resumes
    /// against a database written by a previous process. Returns the task id
    /// when a running row was adopted.
    pub fn adopt(
        &self,
        component_name: &str,
        iteration: u64,
        scope_id: Option<Uuid>,
    ) -> Result<Option<String>, StoreError> {
        let execution_id = self.0.execution_id()?;
        let scope = scope_id.map(|s| s.to_string());
        let adopted: Option<String> = self.0.with_conn(|conn| {
            use rusqlite::OptionalExtension;
            let id: Option<String> = conn
                .query_row(
                    "SELECT id FROM tasks WHERE component_name = ?1 AND status = 'running'
                     ORDER BY started_at DESC LIMIT 1",
                    params![component_name],
                    |row| row.get(0),
                )
                .optional()?;
            if let Some(ref id) = id {
                conn.execute(
                    "UPDATE tasks SET execution_id = ?1, iteration = ?2, scope_id = ?3 WHERE id = ?4",
                    params![execution_id, iteration as i64, scope, id],
                )?;
            }
            Ok(id)
        })?;
        if adopted.is_some() {
            self.0.emit("tasks");
        }
        Ok(adopted)
    }

    /// Running work count for an iteration of the current execution.
    pub fn running_count(&self, iteration: u64) -> Result<u64, StoreError> {
        self.count(iteration, Some("running"))
    }

    /// Total work count (any status) for an iteration of the current execution.
    pub fn total_count(&self, iteration: u64) -> Result<u64, StoreError> {
        self.count(iteration, None)
    }

    fn count(&self, iteration: u64, status: Option<&str>) -> Result<u64, StoreError> {
        let execution_id = self.0.execution_id()?;
        let sql = format!(
            "SELECT COUNT(*) FROM tasks WHERE execution_id = ?1 AND iteration = ?2
             AND component_type NOT IN {} {}",
            ARTIFACT_TYPES,
            if status.is_some() {
                "AND status = ?3"
            } else {
                ""
            }
        );
        self.0.with_conn(|conn| {
            let n: i64 = if let Some(status) = status {
                conn.query_row(&sql, params![execution_id, iteration as i64, status], |r| {
                    r.get(0)
                })?
            } else {
                conn.query_row(&sql, params![execution_id, iteration as i64], |r| r.get(0))?
            };
            Ok(n as u64)
        })
    }

    /// Running work count within a scope at an iteration.
    pub fn scope_running(&self, scope_id: Uuid, iteration: u64) -> Result<u64, StoreError> {
        self.scope_count(scope_id, iteration, Some("running"))
    }

    /// Total work count within a scope at an iteration.
    pub fn scope_total(&self, scope_id: Uuid, iteration: u64) -> Result<u64, StoreError> {
        self.scope_count(scope_id, iteration, None)
    }

    /// Failed work count within a scope at an iteration.
    pub fn scope_failed(&self, scope_id: Uuid, iteration: u64) -> Result<u64, StoreError> {
        self.scope_count(scope_id, iteration, Some("failed"))
    }

    fn scope_count(
        &self,
        scope_id: Uuid,
        iteration: u64,
        status: Option<&str>,
    ) -> Result<u64, StoreError> {
        let sql = format!(
            "SELECT COUNT(*) FROM tasks WHERE scope_id = ?1 AND iteration = ?2
             AND component_type NOT IN {} {}",
            ARTIFACT_TYPES,
            if status.is_some() {
                "AND status = ?3"
            } else {
                ""
            }
        );
        let scope = scope_id.to_string();
        self.0.with_conn(|conn| {
            let n: i64 = if let Some(status) = status {
                conn.query_row(&sql, params![scope, iteration as i64, status], |r| r.get(0))?
            } else {
                conn.query_row(&sql, params![scope, iteration as i64], |r| r.get(0))?
            };
            Ok(n as u64)
        })
    }

    /// All tasks, optionally restricted to one iteration, oldest first.
    pub fn list(&self, iteration: Option<u64>) -> Result<Vec<TaskRow>, StoreError> {
        self.0.with_conn(|conn| {
            let base = "SELECT id, execution_id, iteration, scope_id, component_type,
                               component_name, status, started_at, ended_at
                        FROM tasks";
            let map = |row: &rusqlite::Row<'_>| -> Result<TaskRow, rusqlite::Error> {
                let iteration: i64 = row.get(2)?;
                Ok(TaskRow {
                    id: row.get(0)?,
                    execution_id: row.get(1)?,
                    iteration: iteration as u64,
                    scope_id: row.get(3)?,
                    component_type: row.get(4)?,
                    component_name: row.get(5)?,
                    status: row.get(6)?,
                    started_at: row.get(7)?,
                    ended_at: row.get(8)?,
                })
            };
            match iteration {
                Some(i) => {
                    let sql = format!("{} WHERE iteration = ?1 ORDER BY started_at, id", base);
                    let mut stmt = conn.prepare(&sql)?;
                    let rows = stmt.query_map(params![i as i64], map)?;
                    rows.collect()
                }
                None => {
                    let sql = format!("{} ORDER BY started_at, id", base);
                    let mut stmt = conn.prepare(&sql)?;
                    let rows = stmt.query_map([], map)?;
                    rows.collect()
                }
            }
        })
    }
}
