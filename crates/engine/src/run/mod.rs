//! Workflow runs and their execution state

mod branch;
mod cursor;
mod merge;
mod route;
mod step;

pub use branch::{BranchPath, LoopFrame};
pub use cursor::{LoopCursor, LoopProgress, LoopState};
pub use merge::{MergeDecision, MergeWaitSet};
pub use route::{AppliedRoutes, MergeArrival, Route};
pub use step::{FailureKind, NewStep, StepFailure, StepInstance, StepKey, StepState};

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Run status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Steps are pending or executing
    Running,
    /// Only timers remain
    Waiting,
    /// Every step finished and none failed
    Completed,
    /// Drained with at least one failed step
    Failed,
    /// Cancelled on request
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Waiting => "waiting",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "waiting" => Ok(Self::Waiting),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown run status: {other}")),
        }
    }
}

/// One execution of a workflow definition for one trigger event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub id: Uuid,
    pub definition_id: Uuid,
    pub org_id: String,
    pub trigger_node_id: String,
    pub event_kind: String,
    /// Dedupes redelivered events: one run per (definition, key)
    pub idempotency_key: Option<String>,
    pub status: RunStatus,
    /// Outputs of root-branch steps keyed by node id. Entries are never
    /// overwritten once written.
    pub context: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Set once retention removed the run's steps
    pub purged_at: Option<DateTime<Utc>>,
}

impl WorkflowRun {
    /// Key of the step for `node_id` in `branch` of this run
    pub fn step_key(&self, node_id: &str, branch: &BranchPath) -> StepKey {
        StepKey::new(self.id, node_id, branch.clone())
    }
}
