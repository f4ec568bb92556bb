//! Generic key/value state with an append-only history log.
//!
//! Every scheduler cursor (`ralphCount`, `currentPhaseIndex`,
//! `stepIndex_<phase>`, `while.<id>.*`) lives here; the in-memory tree only
//! observes these keys, which is what makes a run crash-resumable.

use chrono::Utc;
use rusqlite::{OptionalExtension, params};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use super::Store;
use crate::errors::StoreError;

/// One entry of a key's change log, newest first.
#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub old_value: Option<Value>,
    pub new_value: Option<Value>,
    pub reason: String,
    pub ts: String,
}

pub struct StateApi<'a>(pub(crate) &'a Store);

impl StateApi<'_> {
    /// Upsert a key, append the change to history, and notify. Setting a key
    /// to its current value still appends history.
    pub fn set<T: Serialize>(&self, key: &str, value: &T, reason: &str) -> Result<(), StoreError> {
        let encoded = serde_json::to_string(value).map_err(|source| StoreError::Encode {
            key: key.to_string(),
            source,
        })?;
        let now = Utc::now().to_rfc3339();

        self.0.with_conn(|conn| {
            let old: Option<String> = conn
                .query_row(
                    "SELECT value FROM state WHERE key = ?1",
                    params![key],
                    |row| row.get(0),
                )
                .optional()?;
            conn.execute(
                "INSERT INTO state (key, value, updated_at, reason) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(key) DO UPDATE SET value = ?2, updated_at = ?3, reason = ?4",
                params![key, encoded, now, reason],
            )?;
            conn.execute(
                "INSERT INTO state_history (key, old_value, new_value, reason, ts)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![key, old, encoded, reason, now],
            )?;
            Ok(())
        })?;

        self.0.emit("state");
        self.0.emit("state_history");
        Ok(())
    }

    /// Latest value of a key, decoded, or None when the key was never set.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        let raw = self.get_raw(key)?;
        match raw {
            Some(value) => {
                let decoded =
                    serde_json::from_value(value).map_err(|source| StoreError::Decode {
                        key: key.to_string(),
                        source,
                    })?;
                Ok(Some(decoded))
            }
            None => Ok(None),
        }
    }

    /// Latest value as raw JSON.
    pub fn get_raw(&self, key: &str) -> Result<Option<Value>, StoreError> {
        let raw: Option<String> = self.0.with_conn(|conn| {
            conn.query_row(
                "SELECT value FROM state WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()
        })?;
        match raw {
            Some(text) => {
                let value =
                    serde_json::from_str(&text).map_err(|source| StoreError::Decode {
                        key: key.to_string(),
                        source,
                    })?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Up to `limit` most recent changes of a key, newest first.
    pub fn history(&self, key: &str, limit: u32) -> Result<Vec<HistoryEntry>, StoreError> {
        self.0.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT old_value, new_value, reason, ts FROM state_history
                 WHERE key = ?1 ORDER BY id DESC LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![key, limit], |row| {
                let old: Option<String> = row.get(0)?;
                let new: Option<String> = row.get(1)?;
                Ok(HistoryEntry {
                    old_value: old.and_then(|s| serde_json::from_str(&s).ok()),
                    new_value: new.and_then(|s| serde_json::from_str(&s).ok()),
                    reason: row.get(2)?,
                    ts: row.get(3)?,
                })
            })?;
            rows.collect()
        })
    }

    /// Keys currently set that start with `prefix`, sorted.
    pub fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let pattern = format!("{}%", prefix.replace('%', "\\%").replace('_', "\\_"));
        self.0.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT key FROM state WHERE key LIKE ?1 ESCAPE '\\' ORDER BY key",
            )?;
            let rows = stmt.query_map(params![pattern], |row| row.get(0))?;
            rows.collect()
        })
    }
}
