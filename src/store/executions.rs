//! Execution rows: one per engine run against a database.

use chrono::Utc;
use rusqlite::{OptionalExtension, params};
use serde_json::Value;
use uuid::Uuid;

use super::Store;
use crate::errors::StoreError;
use smithers_common::ExecutionStatus;

#[derive(Debug, Clone)]
pub struct ExecutionRow {
    pub id: String,
    pub name: String,
    pub source_label: String,
    pub status: String,
    pub exit_code: Option<i64>,
    pub end_summary: Option<Value>,
    pub end_reason: Option<String>,
    pub started_at: String,
    pub ended_at: Option<String>,
}

pub struct ExecutionApi<'a>(pub(crate) &'a Store);

impl ExecutionApi<'_> {
    /// Open a fresh execution. Anything still marked running belongs to a
    /// process that died: the execution row is closed as failed/interrupted,
    /// leftover running tasks are swept (human gates excepted, they survive
    /// to be re-adopted by the resuming tree), and dangling phase/step rows
    /// are closed so a database reader never sees two active phases.
    pub fn begin(&self, name: &str, source_label: &str) -> Result<String, StoreError> {
        let now = Utc::now().to_rfc3339();
        self.0.with_conn(|conn| {
            conn.execute(
                "UPDATE executions SET status = 'failed', end_reason = 'interrupted', ended_at = ?1
                 WHERE status = 'running'",
                params![now],
            )?;
            conn.execute(
                "UPDATE tasks SET status = 'completed', ended_at = ?1
                 WHERE status = 'running' AND component_type != 'human_interaction'",
                params![now],
            )?;
            conn.execute(
                "UPDATE phases SET status = 'completed', completed_at = ?1
                 WHERE status = 'active'",
                params![now],
            )?;
            conn.execute(
                "UPDATE steps SET status = 'failed', completed_at = ?1, error = 'interrupted'
                 WHERE status = 'running'",
                params![now],
            )?;
            Ok(())
        })?;

        let id = Uuid::new_v4().to_string();
        self.0.with_conn(|conn| {
            conn.execute(
                "INSERT INTO executions (id, name, source_label, status, started_at)
                 VALUES (?1, ?2, ?3, 'running', ?4)",
                params![id, name, source_label, now],
            )?;
            Ok(())
        })?;
        self.0.set_execution_id(Some(id.clone()));
        self.0.emit("executions");
        self.0.emit("tasks");
        self.0.emit("phases");
        self.0.emit("steps");
        Ok(id)
    }

    /// Finalize the current execution row.
    pub fn finish(
        &self,
        status: ExecutionStatus,
        exit_code: i32,
        end_summary: Option<&Value>,
        end_reason: &str,
    ) -> Result<(), StoreError> {
        let id = self.0.execution_id()?;
        let now = Utc::now().to_rfc3339();
        let summary = end_summary.map(|v| v.to_string());
        self.0.with_conn(|conn| {
            conn.execute(
                "UPDATE executions SET status = ?1, exit_code = ?2, end_summary = ?3,
                 end_reason = ?4, ended_at = ?5 WHERE id = ?6",
                params![status.as_str(), exit_code, summary, end_reason, now, id],
            )?;
            Ok(())
        })?;
        self.0.emit("executions");
        Ok(())
    }

    /// The execution row opened by this process, if any.
    pub fn current(&self) -> Result<Option<ExecutionRow>, StoreError> {
        match self.0.execution_id() {
            Ok(id) => self.get(&id),
            Err(StoreError::NoExecution) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn get(&self, id: &str) -> Result<Option<ExecutionRow>, StoreError> {
        self.0.with_conn(|conn| {
            conn.query_row(
                "SELECT id, name, source_label, status, exit_code, end_summary, end_reason,
                        started_at, ended_at
                 FROM executions WHERE id = ?1",
                params![id],
                row_to_execution,
            )
            .optional()
        })
    }

    /// Most recent execution in the database, running or not.
    pub fn latest(&self) -> Result<Option<ExecutionRow>, StoreError> {
        self.0.with_conn(|conn| {
            conn.query_row(
                "SELECT id, name, source_label, status, exit_code, end_summary, end_reason,
                        started_at, ended_at
                 FROM executions ORDER BY started_at DESC, id DESC LIMIT 1",
                [],
                row_to_execution,
            )
            .optional()
        })
    }
}

fn row_to_execution(row: &rusqlite::Row<'_>) -> Result<ExecutionRow, rusqlite::Error> {
    let summary: Option<String> = row.get(5)?;
    Ok(ExecutionRow {
        id: row.get(0)?,
        name: row.get(1)?,
        source_label: row.get(2)?,
        status: row.get(3)?,
        exit_code: row.get(4)?,
        end_summary: summary.and_then(|s| serde_json::from_str(&s).ok()),
        end_reason: row.get(6)?,
        started_at: row.get(7)?,
        ended_at: row.get(8)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn begin_creates_running_execution() {
        let store = Store::open_in_memory().unwrap();
        let id = store.executions().begin("run", "workflow.rs").unwrap();
        let row = store.executions().get(&id).unwrap().unwrap();
        assert_eq!(row.status, "running");
        assert_eq!(row.name, "run");
        assert_eq!(row.source_label, "workflow.rs");
        assert_eq!(store.execution_id().unwrap(), id);
    }

    #[test]
    fn begin_fails_over_stale_running_executions() {
        let store = Store::open_in_memory().unwrap();
        let first = store.executions().begin("one", "").unwrap();
        let second = store.executions().begin("two", "").unwrap();

        let stale = store.executions().get(&first).unwrap().unwrap();
        assert_eq!(stale.status, "failed");
        assert_eq!(stale.end_reason.as_deref(), Some("interrupted"));

        let live = store.executions().get(&second).unwrap().unwrap();
        assert_eq!(live.status, "running");
    }

    #[test]
    fn begin_sweeps_orphaned_tasks_but_keeps_human_gates() {
        let store = Store::open_in_memory().unwrap();
        store.executions().begin("one", "").unwrap();
        let agent_task = store.tasks().start("agent", "worker", 0, None).unwrap();
        let gate_task = store
            .tasks()
            .start("human_interaction", "human:gate", 0, None)
            .unwrap();

        store.executions().begin("two", "").unwrap();

        let tasks = store.tasks().list(None).unwrap();
        let agent = tasks.iter().find(|t| t.id == agent_task).unwrap();
        let gate = tasks.iter().find(|t| t.id == gate_task).unwrap();
        assert_eq!(agent.status, "completed");
        assert_eq!(gate.status, "running");
    }

    #[test]
    fn begin_closes_dangling_phase_and_step_rows() {
        let store = Store::open_in_memory().unwrap();
        store.executions().begin("one", "").unwrap();
        store.phases().start("build", 0).unwrap();
        let step = store.steps().start("implement").unwrap();

        store.executions().begin("two", "").unwrap();

        let phases = store.phases().list().unwrap();
        assert_eq!(phases[0].status, "completed");
        let steps = store.steps().list().unwrap();
        assert_eq!(steps[0].id, step);
        assert_eq!(steps[0].status, "failed");
        assert_eq!(steps[0].error.as_deref(), Some("interrupted"));
    }

    #[test]
    fn finish_records_summary_and_exit_code() {
        let store = Store::open_in_memory().unwrap();
        let id = store.executions().begin("run", "").unwrap();
        store
            .executions()
            .finish(
                ExecutionStatus::Completed,
                0,
                Some(&serde_json::json!({"phases": 3})),
                "all phases done",
            )
            .unwrap();

        let row = store.executions().get(&id).unwrap().unwrap();
        assert_eq!(row.status, "completed");
        assert_eq!(row.exit_code, Some(0));
        assert_eq!(row.end_summary, Some(serde_json::json!({"phases": 3})));
        assert_eq!(row.end_reason.as_deref(), Some("all phases done"));
        assert!(row.ended_at.is_some());
    }
}
