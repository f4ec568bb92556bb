//! The declarative element set.
//!
//! `While`/`Ralph` drive iterations, `Phase` and `Step`/`Parallel` schedule
//! work inside them, `Human` suspends for approval, `Command`/`Agent`/
//! `Snapshot`/`Commit` run external work, and `control` holds the pure
//! structural elements (`If`, `Each`, `Switch`, `End`).

pub mod agent;
pub mod command;
pub mod control;
pub mod human;
pub mod phase;
pub mod step;
pub mod vcs;
pub mod while_loop;

pub use agent::Agent;
pub use command::Command;
pub use control::{Each, End, If, Switch};
pub use human::Human;
pub use phase::{Phase, PhaseRegistry};
pub use step::{Parallel, Step, StepAttachments, StepRegistry, StepVcsSlot};
pub use vcs::{Commit, Snapshot, VcsBuilder};
pub use while_loop::{Condition, LoopContext, Ralph, While};

use serde_json::Value;

use crate::store::Rows;

/// Reserved state keys. These exact strings are the durable contract a
/// database reader (and a resumed process) relies on.
pub mod keys {
    pub const RALPH_COUNT: &str = "ralphCount";
    pub const CURRENT_PHASE_INDEX: &str = "currentPhaseIndex";
    pub const STOP_REQUESTED: &str = "stop_requested";

    pub fn while_status(id: &str) -> String {
        format!("while.{}.status", id)
    }

    pub fn while_iteration(id: &str) -> String {
        format!("while.{}.iteration", id)
    }

    pub fn step_index(owner: &str) -> String {
        format!("stepIndex_{}", owner)
    }

    pub fn step_complete(registry: &str, index: usize) -> String {
        format!("stepComplete:{}:{}", registry, index)
    }

    pub fn human(id: &str) -> String {
        format!("human:{}", id)
    }

    pub fn human_content(hash: &str) -> String {
        format!("human:content:{}", hash)
    }
}

/// Decode the `value` column of a single-row state subscription.
pub(crate) fn state_cell(rows: &Rows) -> Option<Value> {
    rows.first()
        .and_then(|row| row.get("value"))
        .and_then(|v| v.as_str())
        .and_then(|s| serde_json::from_str(s).ok())
}

pub(crate) fn state_cell_u64(rows: &Rows) -> Option<u64> {
    state_cell(rows).and_then(|v| v.as_u64())
}

pub(crate) fn state_cell_string(rows: &Rows) -> Option<String> {
    state_cell(rows).and_then(|v| v.as_str().map(|s| s.to_string()))
}

/// First-row count of a `SELECT COUNT(*) AS n` subscription.
pub(crate) fn count_cell(rows: &Rows) -> u64 {
    rows.first()
        .and_then(|row| row.get("n"))
        .and_then(|v| v.as_u64())
        .unwrap_or(0)
}
