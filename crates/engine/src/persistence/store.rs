//! WorkflowStore trait definition

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::definition::{DefinitionStatus, WorkflowDefinition};
use crate::run::{
    AppliedRoutes, BranchPath, LoopCursor, LoopProgress, MergeWaitSet, Route, RunStatus,
    StepFailure, StepInstance, StepKey, WorkflowRun,
};
use crate::timer::ScheduleTrigger;

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Definition not found
    #[error("definition not found: {0}")]
    DefinitionNotFound(Uuid),

    /// Run not found
    #[error("run not found: {0}")]
    RunNotFound(Uuid),

    /// Step not found
    #[error("step not found: {0}")]
    StepNotFound(Uuid),

    /// Loop cursor not found
    #[error("loop cursor not found: {node_id} in run {run_id} at {branch}")]
    LoopNotFound {
        run_id: Uuid,
        node_id: String,
        branch: BranchPath,
    },

    /// Write rejected because the row changed underneath
    #[error("conflict: {0}")]
    Conflict(String),

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Filter for listing definitions
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DefinitionFilter {
    pub org_id: Option<String>,
    pub status: Option<DefinitionStatus>,
}

/// Result of creating a run
#[derive(Debug, Clone, PartialEq)]
pub enum CreateRunOutcome {
    /// A new run was inserted together with its first steps
    Created {
        run: WorkflowRun,
        applied: AppliedRoutes,
    },
    /// A run for this (definition, idempotency key) already exists
    Duplicate { run_id: Uuid },
}

/// Everything recorded atomically when a step finishes successfully
#[derive(Debug, Clone, PartialEq)]
pub struct StepCompletion {
    pub output: Value,
    /// Successors to activate
    pub routes: Vec<Route>,
    /// Cursor to persist when the step is a loop iterator
    pub open_loop: Option<LoopCursor>,
}

/// Result of completing a step
#[derive(Debug, Clone, PartialEq)]
pub enum CompletionOutcome {
    Completed(AppliedRoutes),
    /// The step was already terminal; nothing was written
    AlreadyFinished,
}

/// What a retention purge removed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeReport {
    pub runs: usize,
    pub steps: usize,
}

/// Durable state of definitions, runs and steps
///
/// Implementations must be thread-safe. Every method that changes more
/// than one row does so atomically: a completed step, its context entry
/// and the successors it routes appear together or not at all.
#[async_trait]
pub trait WorkflowStore: Send + Sync + 'static {
    // =========================================================================
    // Definitions
    // =========================================================================

    async fn insert_definition(&self, def: &WorkflowDefinition) -> Result<(), StoreError>;

    async fn update_definition(&self, def: &WorkflowDefinition) -> Result<(), StoreError>;

    async fn get_definition(&self, id: Uuid) -> Result<WorkflowDefinition, StoreError>;

    async fn list_definitions(
        &self,
        filter: &DefinitionFilter,
    ) -> Result<Vec<WorkflowDefinition>, StoreError>;

    /// Active definitions with an event trigger of this kind
    async fn active_definitions_for_event(
        &self,
        event_kind: &str,
    ) -> Result<Vec<WorkflowDefinition>, StoreError>;

    // =========================================================================
    // Runs
    // =========================================================================

    /// Insert a run and apply its initial routes, unless a run with the same
    /// definition and idempotency key exists
    async fn create_run(
        &self,
        run: &WorkflowRun,
        routes: Vec<Route>,
    ) -> Result<CreateRunOutcome, StoreError>;

    async fn get_run(&self, run_id: Uuid) -> Result<WorkflowRun, StoreError>;

    /// Cancel a non-terminal run and its pending or scheduled steps.
    /// Executing steps are left to finish.
    async fn cancel_run(&self, run_id: Uuid, now: DateTime<Utc>) -> Result<WorkflowRun, StoreError>;

    /// Move a run to `completed` or `failed` if it has no active steps and
    /// no open loops. Returns the new status when this call finalized it.
    ///
    /// Merges that never fired are recorded as failed steps on the merge
    /// node carrying the missing inputs, and fail the run.
    async fn finalize_run_if_drained(
        &self,
        run_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<RunStatus>, StoreError>;

    /// Non-terminal runs that have no active steps or hold a loop cursor in
    /// `completing`. A worker that stopped after recording a step outcome
    /// leaves its run in this shape until it is settled again.
    async fn list_unsettled(&self, limit: usize) -> Result<Vec<Uuid>, StoreError>;

    // =========================================================================
    // Steps
    // =========================================================================

    async fn get_step(&self, step_id: Uuid) -> Result<StepInstance, StoreError>;

    async fn find_step(&self, key: &StepKey) -> Result<Option<StepInstance>, StoreError>;

    async fn list_steps(&self, run_id: Uuid) -> Result<Vec<StepInstance>, StoreError>;

    /// Claim up to `max` pending steps for a worker
    ///
    /// The PostgreSQL implementation uses SELECT FOR UPDATE SKIP LOCKED.
    async fn claim_steps(
        &self,
        worker_id: &str,
        max: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<StepInstance>, StoreError>;

    /// Claim one specific step if it is pending
    async fn begin_step(
        &self,
        step_id: Uuid,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<StepInstance>, StoreError>;

    /// Mark a step done, record its output and apply its routes
    async fn complete_step(
        &self,
        step_id: Uuid,
        completion: StepCompletion,
        now: DateTime<Utc>,
    ) -> Result<CompletionOutcome, StoreError>;

    /// Mark a step failed. Returns false if it was already terminal.
    async fn fail_step(
        &self,
        step_id: Uuid,
        failure: StepFailure,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Schedule the next attempt of a step
    async fn retry_step(
        &self,
        step_id: Uuid,
        due_at: DateTime<Utc>,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Park a step until `wake_at` (delay nodes)
    async fn schedule_wake(
        &self,
        step_id: Uuid,
        wake_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Mark a non-terminal step cancelled
    async fn cancel_step(&self, step_id: Uuid, now: DateTime<Utc>) -> Result<(), StoreError>;

    /// Move scheduled steps whose due time has passed back to pending
    async fn release_due_steps(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Uuid>, StoreError>;

    /// Return executing steps claimed before `claimed_before` to pending
    async fn reclaim_stale_steps(
        &self,
        claimed_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<Uuid>, StoreError>;

    /// Active steps plus unclosed loop cursors inside `branch`
    async fn count_active_work(
        &self,
        run_id: Uuid,
        branch: &BranchPath,
    ) -> Result<usize, StoreError>;

    // =========================================================================
    // Merges and loops
    // =========================================================================

    async fn list_merge_wait_sets(&self, run_id: Uuid) -> Result<Vec<MergeWaitSet>, StoreError>;

    async fn list_loop_cursors(&self, run_id: Uuid) -> Result<Vec<LoopCursor>, StoreError>;

    /// Mark one item branch of a loop drained
    async fn finish_loop_item(
        &self,
        run_id: Uuid,
        loop_node: &str,
        branch: &BranchPath,
        index: u32,
        now: DateTime<Utc>,
    ) -> Result<LoopProgress, StoreError>;

    /// Apply the `completed` routes of a loop and close its cursor
    async fn close_loop(
        &self,
        run_id: Uuid,
        loop_node: &str,
        branch: &BranchPath,
        routes: Vec<Route>,
        now: DateTime<Utc>,
    ) -> Result<AppliedRoutes, StoreError>;

    // =========================================================================
    // Effect dedup records
    // =========================================================================

    async fn get_effect(&self, key: &StepKey) -> Result<Option<Value>, StoreError>;

    async fn record_effect(
        &self,
        key: &StepKey,
        output: &Value,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    // =========================================================================
    // Schedule triggers
    // =========================================================================

    /// Replace every schedule trigger of a definition
    async fn replace_schedules(
        &self,
        definition_id: Uuid,
        schedules: Vec<ScheduleTrigger>,
    ) -> Result<(), StoreError>;

    async fn list_schedules(&self, definition_id: Uuid) -> Result<Vec<ScheduleTrigger>, StoreError>;

    async fn due_schedules(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ScheduleTrigger>, StoreError>;

    /// Move a schedule from `expected_fire_at` to `next_fire_at` (or delete
    /// it when there is no next fire). Returns false if another sweeper
    /// already advanced it.
    async fn advance_schedule(
        &self,
        definition_id: Uuid,
        node_id: &str,
        expected_fire_at: DateTime<Utc>,
        next_fire_at: Option<DateTime<Utc>>,
    ) -> Result<bool, StoreError>;

    // =========================================================================
    // Retention
    // =========================================================================

    /// Delete steps, merges, cursors and effects of runs that finished
    /// before the cutoff. Run rows are kept and stamped `purged_at = now`.
    async fn purge_finished_runs(
        &self,
        finished_before: DateTime<Utc>,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<PurgeReport, StoreError>;
}
