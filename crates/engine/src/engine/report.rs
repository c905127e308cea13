//! Run inspection
//!
//! A [`RunReport`] is the full picture of one run: the run row with its
//! context, every step, merge wait sets, loop cursors, and a digest of
//! what the run is currently blocked on.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::run::{
    BranchPath, LoopCursor, MergeWaitSet, StepFailure, StepInstance, StepState, WorkflowRun,
};

/// Something a run is waiting on, or a reason part of it stopped
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum Blocker {
    /// Ready and waiting for a worker
    Pending {
        step_id: Uuid,
        node_id: String,
        branch: BranchPath,
    },
    /// Held by a worker
    Executing {
        step_id: Uuid,
        node_id: String,
        branch: BranchPath,
        claimed_by: Option<String>,
        claimed_at: Option<DateTime<Utc>>,
    },
    /// Parked until a delay elapses or a retry is due
    Timer {
        step_id: Uuid,
        node_id: String,
        branch: BranchPath,
        attempt: u32,
        due_at: Option<DateTime<Utc>>,
        last_error: Option<String>,
    },
    /// A wait-all merge still missing inputs
    Merge {
        node_id: String,
        branch: BranchPath,
        missing: Vec<String>,
    },
    /// A loop with item branches still running
    Loop {
        node_id: String,
        branch: BranchPath,
        spawned: u32,
        finished: usize,
    },
    /// A branch halted by a failed step
    Failed {
        step_id: Uuid,
        node_id: String,
        branch: BranchPath,
        failure: Option<StepFailure>,
    },
}

/// Everything needed to tell where a run is and why
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    pub run: WorkflowRun,
    pub steps: Vec<StepInstance>,
    pub merges: Vec<MergeWaitSet>,
    pub loops: Vec<LoopCursor>,
    pub blocked_on: Vec<Blocker>,
}

impl RunReport {
    pub fn build(
        run: WorkflowRun,
        mut steps: Vec<StepInstance>,
        merges: Vec<MergeWaitSet>,
        loops: Vec<LoopCursor>,
    ) -> Self {
        steps.sort_by_key(|s| (s.created_at, s.id));

        let mut blocked_on: Vec<Blocker> = steps.iter().filter_map(step_blocker).collect();

        blocked_on.extend(merges.iter().filter(|m| !m.fired).map(|m| Blocker::Merge {
            node_id: m.node_id.clone(),
            branch: m.branch.clone(),
            missing: m.missing(),
        }));

        blocked_on.extend(loops.iter().filter(|c| !c.is_closed()).map(|c| Blocker::Loop {
            node_id: c.node_id.clone(),
            branch: c.branch.clone(),
            spawned: c.index,
            finished: c.finished.len(),
        }));

        Self {
            run,
            steps,
            merges,
            loops,
            blocked_on,
        }
    }

    pub fn step(&self, node_id: &str) -> Option<&StepInstance> {
        self.steps.iter().find(|s| s.node_id == node_id)
    }
}

fn step_blocker(step: &StepInstance) -> Option<Blocker> {
    let (step_id, node_id, branch) = (step.id, step.node_id.clone(), step.branch.clone());
    match step.state {
        StepState::Pending => Some(Blocker::Pending {
            step_id,
            node_id,
            branch,
        }),
        StepState::Executing => Some(Blocker::Executing {
            step_id,
            node_id,
            branch,
            claimed_by: step.claimed_by.clone(),
            claimed_at: step.claimed_at,
        }),
        StepState::Scheduled => Some(Blocker::Timer {
            step_id,
            node_id,
            branch,
            attempt: step.attempt,
            due_at: step.due_at,
            last_error: step.last_error.clone(),
        }),
        StepState::Failed => Some(Blocker::Failed {
            step_id,
            node_id,
            branch,
            failure: step.failure.clone(),
        }),
        StepState::Done | StepState::Cancelled => None,
    }
}
