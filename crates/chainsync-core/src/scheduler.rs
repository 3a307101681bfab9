//! Catch-up scheduler: turns a cursor position into the next window.

use serde::{Deserialize, Serialize};

use crate::cursor::SyncPosition;

/// A closed range of consecutive heights `start..=end` fetched in one cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncWindow {
    pub start: u64,
    pub end: u64,
}

// A window always holds at least one height.
#[allow(clippy::len_without_is_empty)]
impl SyncWindow {
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    pub fn heights(&self) -> impl Iterator<Item = u64> {
        self.start..=self.end
    }
}

impl std::fmt::Display for SyncWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}..={}", self.start, self.end)
    }
}

/// What the coordinator should do this cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Plan {
    /// Nothing confirmed beyond the cursor; sleep and poll again.
    Idle,
    /// Fetch and persist this window.
    Fetch(SyncWindow),
}

/// Computes bounded windows of work. Stateless.
#[derive(Debug, Clone, Copy)]
pub struct CatchUpScheduler {
    max_window: u64,
}

impl CatchUpScheduler {
    /// `max_window` is clamped to at least one height.
    pub fn new(max_window: u64) -> Self {
        Self {
            max_window: max_window.max(1),
        }
    }

    pub fn max_window(&self) -> u64 {
        self.max_window
    }

    /// Plan `(last_persisted, min(last_persisted + W, safe_height)]`.
    pub fn plan(&self, last_persisted: u64, safe_height: u64) -> Plan {
        if last_persisted == safe_height {
            return Plan::Idle;
        }
        if last_persisted > safe_height {
            // Head went backwards: node switch or inconsistent RPC backend.
            tracing::warn!(
                last_persisted,
                safe_height,
                "safe height is below the persisted height; waiting"
            );
            return Plan::Idle;
        }
        let target = last_persisted.saturating_add(self.max_window).min(safe_height);
        Plan::Fetch(SyncWindow {
            start: last_persisted + 1,
            end: target,
        })
    }

    pub fn plan_for(&self, position: &SyncPosition) -> Plan {
        self.plan(position.last_persisted, position.safe_height)
    }
}
