//! Merge wait sets
//!
//! A wait set tracks which input handles of a merge node have received an
//! arrival within one branch of a run. The decision logic is pure so both
//! store implementations apply it the same way inside their transactions.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{BranchPath, FailureKind, StepFailure};
use crate::definition::MergeStrategy;

/// Arrival bookkeeping for one merge node in one branch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeWaitSet {
    pub run_id: Uuid,
    pub node_id: String,
    pub branch: BranchPath,
    /// Configured input handles of the merge node
    pub inputs: Vec<String>,
    pub arrived: BTreeSet<String>,
    /// Once fired, later arrivals are dropped
    pub fired: bool,
    pub updated_at: DateTime<Utc>,
}

/// What to do after recording an arrival
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeDecision {
    /// Enqueue the merge step now
    Fire,
    /// Keep waiting for the listed handles
    Wait { missing: Vec<String> },
    /// The merge already fired; ignore this arrival
    Drop,
}

impl MergeWaitSet {
    pub fn new(
        run_id: Uuid,
        node_id: impl Into<String>,
        branch: BranchPath,
        inputs: Vec<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            run_id,
            node_id: node_id.into(),
            branch,
            inputs,
            arrived: BTreeSet::new(),
            fired: false,
            updated_at: now,
        }
    }

    /// Record an arrival on `handle` and decide whether the merge fires
    pub fn record(
        &mut self,
        handle: &str,
        strategy: MergeStrategy,
        now: DateTime<Utc>,
    ) -> MergeDecision {
        if self.fired {
            return MergeDecision::Drop;
        }

        self.arrived.insert(handle.to_string());
        self.updated_at = now;

        match strategy {
            MergeStrategy::First => {
                self.fired = true;
                MergeDecision::Fire
            }
            MergeStrategy::WaitAll => {
                let missing = self.missing();
                if missing.is_empty() {
                    self.fired = true;
                    MergeDecision::Fire
                } else {
                    MergeDecision::Wait { missing }
                }
            }
        }
    }

    /// Failure recorded for a merge that can no longer fire
    pub fn incomplete_failure(&self) -> StepFailure {
        StepFailure::new(
            FailureKind::MergeIncomplete,
            format!("merge never received inputs: {}", self.missing().join(", ")),
        )
    }

    /// Input handles that have not arrived yet
    pub fn missing(&self) -> Vec<String> {
        self.inputs
            .iter()
            .filter(|h| !self.arrived.contains(h.as_str()))
            .cloned()
            .collect()
    }
}
