//! Loop cursors
//!
//! A cursor is created when a loop iterator node runs. It records how many
//! item branches were spawned and which of them have drained, and it counts
//! as outstanding work for its run until the `completed` handle has fired.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use super::BranchPath;

/// Cursor lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    /// Item branches are still running
    Open,
    /// All items drained and one caller owns emitting `completed`
    Completing,
    /// `completed` has been routed
    Closed,
}

impl LoopState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Completing => "completing",
            Self::Closed => "closed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "open" => Some(Self::Open),
            "completing" => Some(Self::Completing),
            "closed" => Some(Self::Closed),
            _ => None,
        }
    }
}

/// Iteration state of one loop node in one branch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopCursor {
    pub run_id: Uuid,
    pub node_id: String,
    /// Branch the loop node ran in
    pub branch: BranchPath,
    /// Length of the resolved array
    pub total: u32,
    /// Number of item branches spawned, bounded by the iteration limit
    pub index: u32,
    pub max_iterations: u32,
    /// Item indexes whose branches have drained
    pub finished: BTreeSet<u32>,
    pub state: LoopState,
    /// Scope handed to the `completed` successors
    pub scope: Map<String, Value>,
    pub updated_at: DateTime<Utc>,
}

/// Result of marking an item branch as drained
#[derive(Debug, Clone, PartialEq)]
pub struct LoopProgress {
    pub cursor: LoopCursor,
    /// True for exactly one caller: the one that must route `completed`
    pub claimed_completion: bool,
}

impl LoopCursor {
    /// Open a cursor over an array of `total` items
    pub fn open(
        run_id: Uuid,
        node_id: impl Into<String>,
        branch: BranchPath,
        total: u32,
        max_iterations: u32,
        scope: Map<String, Value>,
        now: DateTime<Utc>,
    ) -> Self {
        let index = total.min(max_iterations);
        Self {
            run_id,
            node_id: node_id.into(),
            branch,
            total,
            index,
            max_iterations,
            finished: BTreeSet::new(),
            state: if index == 0 {
                LoopState::Closed
            } else {
                LoopState::Open
            },
            scope,
            updated_at: now,
        }
    }

    /// Whether every spawned item branch has drained
    pub fn is_exhausted(&self) -> bool {
        self.finished.len() as u32 >= self.index
    }

    pub fn is_closed(&self) -> bool {
        self.state == LoopState::Closed
    }

    /// Mark item `index` drained. Returns true when this call moved the
    /// cursor into `Completing`.
    pub fn finish_item(&mut self, index: u32, now: DateTime<Utc>) -> bool {
        if index < self.index && self.finished.insert(index) {
            self.updated_at = now;
        }
        if self.state == LoopState::Open && self.is_exhausted() {
            self.state = LoopState::Completing;
            self.updated_at = now;
            return true;
        }
        false
    }

    /// Branch of item `index`
    pub fn item_branch(&self, index: u32) -> BranchPath {
        self.branch.child(&self.node_id, index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cursor(total: u32, max: u32) -> LoopCursor {
        LoopCursor::open(
            Uuid::now_v7(),
            "loop",
            BranchPath::root(),
            total,
            max,
            Map::new(),
            Utc::now(),
        )
    }

    #[test]
    fn test_index_bounded_by_max_iterations() {
        let c = cursor(10, 3);
        assert_eq!(c.total, 10);
        assert_eq!(c.index, 3);
        assert_eq!(c.state, LoopState::Open);
    }

    #[test]
    fn test_empty_array_is_closed_immediately() {
        let c = cursor(0, 5);
        assert!(c.is_closed());
        assert!(c.is_exhausted());
    }

    #[test]
    fn test_completion_claimed_once() {
        let mut c = cursor(2, 5);
        let now = Utc::now();

        assert!(!c.finish_item(0, now));
        // repeated notification for the same item is harmless
        assert!(!c.finish_item(0, now));
        assert!(c.finish_item(1, now));
        assert_eq!(c.state, LoopState::Completing);
        // a late duplicate does not claim completion again
        assert!(!c.finish_item(1, now));
    }

    #[test]
    fn test_out_of_range_index_ignored() {
        let mut c = cursor(1, 1);
        assert!(!c.finish_item(7, Utc::now()));
        assert!(c.finished.is_empty());
    }

    #[test]
    fn test_item_branch() {
        let c = cursor(3, 3);
        assert_eq!(c.item_branch(2).as_str(), "/loop#2");
    }
}
