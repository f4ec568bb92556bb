//! Phase rows: one per phase activation per iteration.

use chrono::Utc;
use rusqlite::params;

use super::Store;
use crate::errors::StoreError;

#[derive(Debug, Clone)]
pub struct PhaseRow {
    pub id: i64,
    pub name: String,
    pub iteration: u64,
    pub status: String,
    pub started_at: String,
    pub completed_at: Option<String>,
}

pub struct PhaseApi<'a>(pub(crate) &'a Store);

impl PhaseApi<'_> {
    /// Log a phase activation.
    pub fn start(&self, name: &str, iteration: u64) -> Result<i64, StoreError> {
        self.insert(name, iteration, "active")
    }

    /// Log a skipped phase. Skipped rows are complete on insert.
    pub fn skip(&self, name: &str, iteration: u64) -> Result<i64, StoreError> {
        self.insert(name, iteration, "skipped")
    }

    fn insert(&self, name: &str, iteration: u64, status: &str) -> Result<i64, StoreError> {
        let now = Utc::now().to_rfc3339();
        let completed = (status == "skipped").then(|| now.clone());
        let id = self.0.with_conn(|conn| {
            conn.execute(
                "INSERT INTO phases (name, iteration, status, started_at, completed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![name, iteration as i64, status, now, completed],
            )?;
            Ok(conn.last_insert_rowid())
        })?;
        self.0.emit("phases");
        Ok(id)
    }

    /// Flip an active row to completed.
    pub fn complete(&self, id: i64) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        let updated = self.0.with_conn(|conn| {
            conn.execute(
                "UPDATE phases SET status = 'completed', completed_at = ?1
                 WHERE id = ?2 AND status = 'active'",
                params![now, id],
            )
        })?;
        if updated > 0 {
            self.0.emit("phases");
        }
        Ok(())
    }

    /// All phase rows in insertion order.
    pub fn list(&self) -> Result<Vec<PhaseRow>, StoreError> {
        self.0.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, name, iteration, status, started_at, completed_at
                 FROM phases ORDER BY id",
            )?;
            let rows = stmt.query_map([], |row| {
                let iteration: i64 = row.get(2)?;
                Ok(PhaseRow {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    iteration: iteration as u64,
                    status: row.get(3)?,
                    started_at: row.get(4)?,
                    completed_at: row.get(5)?,
                })
            })?;
            rows.collect()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_then_complete() {
        let store = Store::open_in_memory().unwrap();
        let id = store.phases().start("build", 0).unwrap();
        store.phases().complete(id).unwrap();

        let rows = store.phases().list().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].name, "build");
        assert_eq!(rows[0].status, "completed");
        assert!(rows[0].completed_at.is_some());
    }

    #[test]
    fn skip_is_complete_on_insert() {
        let store = Store::open_in_memory().unwrap();
        store.phases().skip("lint", 3).unwrap();

        let rows = store.phases().list().unwrap();
        assert_eq!(rows[0].status, "skipped");
        assert_eq!(rows[0].iteration, 3);
        assert!(rows[0].completed_at.is_some());
    }

    #[test]
    fn complete_ignores_non_active_rows() {
        let store = Store::open_in_memory().unwrap();
        let id = store.phases().skip("lint", 0).unwrap();
        store.phases().complete(id).unwrap();
        assert_eq!(store.phases().list().unwrap()[0].status, "skipped");
    }
}
