//! Execution scope: the `(enabled, scope_id)` pair carried down the tree.
//!
//! Side-effecting leaves check `enabled` before spawning anything, so a
//! subtree rendered for structural visibility (a pending phase, an inactive
//! step) spawns no work. `scope_id` namespaces task counts: a step only
//! observes tasks started under its own scope, never a sibling's.

use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecScope {
    pub enabled: bool,
    pub scope_id: Option<Uuid>,
}

impl Default for ExecScope {
    fn default() -> Self {
        Self {
            enabled: true,
            scope_id: None,
        }
    }
}

impl ExecScope {
    /// Scope for a subtree rendered only for visibility.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            scope_id: None,
        }
    }

    /// Active scope with a fresh namespace for task counts.
    pub fn active(scope_id: Uuid) -> Self {
        Self {
            enabled: true,
            scope_id: Some(scope_id),
        }
    }
}
