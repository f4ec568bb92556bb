//! Embedded persistent store for the engine.
//!
//! A single SQLite database holds all durable state: a generic key/value
//! table with history, plus dedicated tables for executions, tasks, phases,
//! steps, human interactions, vcs events, and tickets. Every write helper
//! commits first, then emits a change notification naming the written table
//! so the reactive layer can re-evaluate affected subscriptions.

mod executions;
mod human;
mod phases;
pub mod query;
pub mod reactive;
mod state;
mod steps;
mod tasks;
mod tickets;
mod vcs;

use std::cell::{Cell, RefCell};
use std::path::Path;

use rusqlite::Connection;

use crate::errors::StoreError;

pub use executions::{ExecutionApi, ExecutionRow};
pub use human::{HumanApi, HumanRow};
pub use phases::{PhaseApi, PhaseRow};
pub use query::{Row, Rows};
pub use reactive::{Reactive, SubscriptionId};
pub use state::{HistoryEntry, StateApi};
pub use steps::{StepApi, StepRow};
pub use tasks::{TaskApi, TaskRow};
pub use tickets::{TicketApi, TicketDraft, TicketRow};
pub use vcs::{VcsApi, VcsEventRow};

/// Every table a subscription can depend on.
pub const TABLES: [&str; 9] = [
    "state",
    "state_history",
    "executions",
    "tasks",
    "phases",
    "steps",
    "human_interactions",
    "vcs_events",
    "tickets",
];

/// Handle to the embedded database plus its reactive notifier.
///
/// The store is single-threaded; it is shared as `Rc<Store>` between the
/// engine, elements, and subscriptions.
pub struct Store {
    conn: RefCell<Connection>,
    reactive: Reactive,
    closed: Cell<bool>,
    execution_id: RefCell<Option<String>>,
}

impl Store {
    /// Open (or create) a database at the given path and run migrations.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    /// Create an in-memory database (for tests and dry runs).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        let store = Self {
            conn: RefCell::new(conn),
            reactive: Reactive::new(),
            closed: Cell::new(false),
            execution_id: RefCell::new(None),
        };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> Result<(), StoreError> {
        let conn = self.conn.borrow();
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(MIGRATIONS)?;
        Ok(())
    }

    /// Mark the store closed. Subsequent writes fail with
    /// [`StoreError::Closed`]; callers that check [`Store::is_closed`] first
    /// can treat them as no-ops instead.
    pub fn close(&self) {
        self.closed.set(true);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.get()
    }

    /// The reactive notifier attached to this store.
    pub fn reactive(&self) -> &Reactive {
        &self.reactive
    }

    /// Emit a change notification for a table. Called by every write helper
    /// after its statement commits.
    pub(crate) fn emit(&self, table: &'static str) {
        self.reactive.notify_write(table);
    }

    /// Run a closure against the connection, mapping sqlite failures.
    pub(crate) fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, rusqlite::Error>,
    ) -> Result<T, StoreError> {
        if self.closed.get() {
            return Err(StoreError::Closed);
        }
        let conn = self.conn.borrow();
        f(&conn).map_err(StoreError::from)
    }

    /// Id of the execution opened by [`ExecutionApi::begin`].
    pub fn execution_id(&self) -> Result<String, StoreError> {
        self.execution_id
            .borrow()
            .clone()
            .ok_or(StoreError::NoExecution)
    }

    pub(crate) fn set_execution_id(&self, id: Option<String>) {
        *self.execution_id.borrow_mut() = id;
    }

    /// Run an arbitrary read-only query and return rows as JSON objects.
    /// This is the evaluation path for reactive subscriptions.
    pub fn query_json(
        &self,
        sql: &str,
        params: &[serde_json::Value],
    ) -> Result<Rows, StoreError> {
        self.with_conn(|conn| query::run_json(conn, sql, params))
    }

    // ── Table accessors ───────────────────────────────────────────────

    pub fn state(&self) -> StateApi<'_> {
        StateApi(self)
    }

    pub fn executions(&self) -> ExecutionApi<'_> {
        ExecutionApi(self)
    }

    pub fn tasks(&self) -> TaskApi<'_> {
        TaskApi(self)
    }

    pub fn phases(&self) -> PhaseApi<'_> {
        PhaseApi(self)
    }

    pub fn steps(&self) -> StepApi<'_> {
        StepApi(self)
    }

    pub fn human(&self) -> HumanApi<'_> {
        HumanApi(self)
    }

    pub fn vcs(&self) -> VcsApi<'_> {
        VcsApi(self)
    }

    pub fn tickets(&self) -> TicketApi<'_> {
        TicketApi(self)
    }
}

const MIGRATIONS: &str = "
CREATE TABLE IF NOT EXISTS executions (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    source_label TEXT NOT NULL DEFAULT '',
    status TEXT NOT NULL DEFAULT 'running',
    exit_code INTEGER,
    end_summary TEXT,
    end_reason TEXT,
    started_at TEXT NOT NULL,
    ended_at TEXT
);

CREATE TABLE IF NOT EXISTS state (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    reason TEXT NOT NULL DEFAULT ''
);

CREATE TABLE IF NOT EXISTS state_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    key TEXT NOT NULL,
    old_value TEXT,
    new_value TEXT,
    reason TEXT NOT NULL DEFAULT '',
    ts TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS tasks (
    id TEXT PRIMARY KEY,
    execution_id TEXT NOT NULL REFERENCES executions(id),
    iteration INTEGER NOT NULL DEFAULT 0,
    scope_id TEXT,
    component_type TEXT NOT NULL,
    component_name TEXT NOT NULL DEFAULT '',
    status TEXT NOT NULL DEFAULT 'running',
    started_at TEXT NOT NULL,
    ended_at TEXT
);

CREATE TABLE IF NOT EXISTS phases (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    iteration INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL DEFAULT 'active',
    started_at TEXT NOT NULL,
    completed_at TEXT
);

CREATE TABLE IF NOT EXISTS steps (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'running',
    started_at TEXT NOT NULL,
    completed_at TEXT,
    snapshot_before TEXT,
    snapshot_after TEXT,
    commit_created TEXT,
    error TEXT
);

CREATE TABLE IF NOT EXISTS human_interactions (
    id TEXT PRIMARY KEY,
    kind TEXT NOT NULL DEFAULT 'confirmation',
    prompt TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    created_at TEXT NOT NULL,
    resolved_at TEXT,
    response TEXT
);

CREATE TABLE IF NOT EXISTS vcs_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    vcs_type TEXT NOT NULL DEFAULT 'git',
    commit_hash TEXT,
    change_id TEXT,
    message TEXT NOT NULL DEFAULT '',
    ts TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS tickets (
    id TEXT PRIMARY KEY,
    title TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    acceptance TEXT NOT NULL DEFAULT '[]',
    priority INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL DEFAULT 'todo',
    dependencies TEXT NOT NULL DEFAULT '[]',
    progress_notes TEXT NOT NULL DEFAULT '[]',
    requires_e2e INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_state_history_key ON state_history(key, id);
CREATE INDEX IF NOT EXISTS idx_tasks_execution ON tasks(execution_id, iteration);
CREATE INDEX IF NOT EXISTS idx_tasks_scope ON tasks(scope_id);
CREATE INDEX IF NOT EXISTS idx_phases_iteration ON phases(iteration);
CREATE INDEX IF NOT EXISTS idx_human_status ON human_interactions(status);
";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_in_memory_runs_migrations() {
        let store = Store::open_in_memory().unwrap();
        // All tables exist and are queryable.
        for table in TABLES {
            let sql = format!("SELECT COUNT(*) AS n FROM {}", table);
            let rows = store.query_json(&sql, &[]).unwrap();
            assert_eq!(rows.len(), 1, "table {} should be queryable", table);
        }
    }

    #[test]
    fn closed_store_rejects_writes() {
        let store = Store::open_in_memory().unwrap();
        store.close();
        assert!(store.is_closed());
        let err = store
            .state()
            .set("k", &serde_json::json!(1), "test")
            .unwrap_err();
        assert!(matches!(err, StoreError::Closed));
    }

    #[test]
    fn execution_id_requires_begin() {
        let store = Store::open_in_memory().unwrap();
        assert!(matches!(
            store.execution_id().unwrap_err(),
            StoreError::NoExecution
        ));
    }

    #[test]
    fn constraint_violation_maps_to_sqlite_error() {
        let store = Store::open_in_memory().unwrap();
        // tasks.execution_id has a foreign key to executions.
        let err = store
            .with_conn(|conn| {
                conn.execute(
                    "INSERT INTO tasks (id, execution_id, component_type, started_at)
                     VALUES ('t1', 'missing', 'agent', '2026-01-01T00:00:00Z')",
                    [],
                )
            })
            .unwrap_err();
        assert!(matches!(err, StoreError::Sqlite(_)));
    }
}
