//! Routing decisions handed to the store

use super::NewStep;
use crate::definition::MergeStrategy;

/// One successor activation produced by a completed step
///
/// Routes are computed by the coordinator and applied by the store inside
/// the same transaction that records the source step's outcome.
#[derive(Debug, Clone, PartialEq)]
pub enum Route {
    /// Insert the step unless one with the same key already exists
    Step(NewStep),
    /// Record an arrival at a merge node and insert its step when it fires
    Merge(MergeArrival),
}

/// An edge arriving at a merge node's input handle
#[derive(Debug, Clone, PartialEq)]
pub struct MergeArrival {
    /// The merge step to insert when the wait set fires
    pub step: NewStep,
    pub handle: String,
    pub strategy: MergeStrategy,
    pub inputs: Vec<String>,
}

impl Route {
    pub fn target(&self) -> &NewStep {
        match self {
            Self::Step(step) => step,
            Self::Merge(arrival) => &arrival.step,
        }
    }
}

/// What applying a batch of routes did
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AppliedRoutes {
    /// Steps newly inserted
    pub enqueued: Vec<uuid::Uuid>,
    /// Merge arrivals still waiting on other inputs
    pub waiting: usize,
    /// Routes ignored because the step existed or the merge had fired
    pub deduplicated: usize,
}

impl AppliedRoutes {
    pub fn absorb(&mut self, other: AppliedRoutes) {
        self.enqueued.extend(other.enqueued);
        self.waiting += other.waiting;
        self.deduplicated += other.deduplicated;
    }
}
