//! Step instances: one node activation within one branch of a run

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use super::BranchPath;

/// Lifecycle state of a step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    /// Ready to be claimed by a worker
    Pending,
    /// Waiting for a timer (retry backoff or delay node)
    Scheduled,
    /// Claimed by a worker
    Executing,
    /// Finished successfully
    Done,
    /// Finished with a permanent failure
    Failed,
    /// Abandoned because the run was cancelled
    Cancelled,
}

impl StepState {
    /// Pending, scheduled or executing
    pub fn is_active(self) -> bool {
        matches!(self, Self::Pending | Self::Scheduled | Self::Executing)
    }

    pub fn is_terminal(self) -> bool {
        !self.is_active()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Scheduled => "scheduled",
            Self::Executing => "executing",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for StepState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "scheduled" => Ok(Self::Scheduled),
            "executing" => Ok(Self::Executing),
            "done" => Ok(Self::Done),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown step state: {other}")),
        }
    }
}

/// Identity of a step: at most one step exists per key
///
/// The rendered key doubles as the idempotency key for side effects and
/// credit charges of the step.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StepKey {
    pub run_id: Uuid,
    pub node_id: String,
    pub branch: BranchPath,
}

impl StepKey {
    pub fn new(run_id: Uuid, node_id: impl Into<String>, branch: BranchPath) -> Self {
        Self {
            run_id,
            node_id: node_id.into(),
            branch,
        }
    }
}

impl fmt::Display for StepKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}@{}", self.run_id, self.node_id, self.branch)
    }
}

/// Why a step failed permanently
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The behavior handler returned an error
    Handler,
    /// The behavior handler exceeded its timeout
    Timeout,
    /// The org had no credit left for the action
    BudgetExceeded,
    /// The engine could not execute the node (missing behavior, bad data)
    Internal,
    /// A wait-all merge was still missing inputs when its run drained
    MergeIncomplete,
}

/// Terminal failure recorded on a step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl StepFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for StepFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

/// A persisted step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepInstance {
    pub id: Uuid,
    pub run_id: Uuid,
    pub node_id: String,
    pub branch: BranchPath,
    /// Current attempt number, starting at 1
    pub attempt: u32,
    pub state: StepState,
    /// When a scheduled step becomes runnable
    pub due_at: Option<DateTime<Utc>>,
    /// Set once a delay node has armed its timer
    pub wake_at: Option<DateTime<Utc>>,
    /// Branch-local values layered over the run context
    pub scope: Map<String, Value>,
    pub output: Option<Value>,
    pub failure: Option<StepFailure>,
    pub last_error: Option<String>,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StepInstance {
    /// Build a fresh pending step
    pub fn pending(run_id: Uuid, new: NewStep, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::now_v7(),
            run_id,
            node_id: new.node_id,
            branch: new.branch,
            attempt: 1,
            state: StepState::Pending,
            due_at: None,
            wake_at: None,
            scope: new.scope,
            output: None,
            failure: None,
            last_error: None,
            claimed_by: None,
            claimed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn key(&self) -> StepKey {
        StepKey::new(self.run_id, self.node_id.clone(), self.branch.clone())
    }
}

/// A step the coordinator wants to exist
#[derive(Debug, Clone, PartialEq)]
pub struct NewStep {
    pub node_id: String,
    pub branch: BranchPath,
    pub scope: Map<String, Value>,
}

impl NewStep {
    pub fn new(node_id: impl Into<String>, branch: BranchPath, scope: Map<String, Value>) -> Self {
        Self {
            node_id: node_id.into(),
            branch,
            scope,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_activity() {
        assert!(StepState::Pending.is_active());
        assert!(StepState::Scheduled.is_active());
        assert!(StepState::Executing.is_active());
        assert!(StepState::Done.is_terminal());
        assert!(StepState::Failed.is_terminal());
        assert!(StepState::Cancelled.is_terminal());
    }

    #[test]
    fn test_state_parse() {
        for state in [
            StepState::Pending,
            StepState::Scheduled,
            StepState::Executing,
            StepState::Done,
            StepState::Failed,
            StepState::Cancelled,
        ] {
            assert_eq!(state.as_str().parse::<StepState>().unwrap(), state);
        }
        assert!("sleeping".parse::<StepState>().is_err());
    }

    #[test]
    fn test_step_key_display() {
        let run_id = Uuid::nil();
        let key = StepKey::new(run_id, "send", BranchPath::root().child("loop", 1));
        assert_eq!(
            key.to_string(),
            "00000000-0000-0000-0000-000000000000:send@/loop#1"
        );
    }
}
