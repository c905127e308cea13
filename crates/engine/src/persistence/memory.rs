//! In-memory implementation of WorkflowStore for tests and dev mode

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde_json::Value;
use uuid::Uuid;

use super::store::*;
use crate::definition::{DefinitionStatus, TriggerSource, WorkflowDefinition};
use crate::run::{
    AppliedRoutes, BranchPath, LoopCursor, LoopProgress, LoopState, MergeDecision, MergeWaitSet,
    NewStep, Route, RunStatus, StepFailure, StepInstance, StepKey, StepState, WorkflowRun,
};
use crate::timer::ScheduleTrigger;

#[derive(Default)]
struct State {
    definitions: HashMap<Uuid, WorkflowDefinition>,
    runs: HashMap<Uuid, WorkflowRun>,
    run_keys: HashMap<(Uuid, String), Uuid>,
    steps: HashMap<Uuid, StepInstance>,
    step_keys: HashMap<StepKey, Uuid>,
    merges: HashMap<StepKey, MergeWaitSet>,
    loops: HashMap<StepKey, LoopCursor>,
    effects: HashMap<StepKey, Value>,
    schedules: HashMap<(Uuid, String), ScheduleTrigger>,
}

impl State {
    fn insert_step(&mut self, run_id: Uuid, new: NewStep, now: DateTime<Utc>) -> Option<Uuid> {
        let key = StepKey::new(run_id, new.node_id.clone(), new.branch.clone());
        if self.step_keys.contains_key(&key) {
            return None;
        }
        let step = StepInstance::pending(run_id, new, now);
        let id = step.id;
        self.step_keys.insert(key, id);
        self.steps.insert(id, step);
        Some(id)
    }

    fn apply_routes(&mut self, run_id: Uuid, routes: Vec<Route>, now: DateTime<Utc>) -> AppliedRoutes {
        let mut applied = AppliedRoutes::default();
        for route in routes {
            let to_insert = match route {
                Route::Step(new) => Some(new),
                Route::Merge(arrival) => {
                    let key = StepKey::new(
                        run_id,
                        arrival.step.node_id.clone(),
                        arrival.step.branch.clone(),
                    );
                    let set = self.merges.entry(key).or_insert_with(|| {
                        MergeWaitSet::new(
                            run_id,
                            arrival.step.node_id.clone(),
                            arrival.step.branch.clone(),
                            arrival.inputs.clone(),
                            now,
                        )
                    });
                    match set.record(&arrival.handle, arrival.strategy, now) {
                        MergeDecision::Fire => Some(arrival.step),
                        MergeDecision::Wait { .. } => {
                            applied.waiting += 1;
                            None
                        }
                        MergeDecision::Drop => {
                            applied.deduplicated += 1;
                            None
                        }
                    }
                }
            };

            if let Some(new) = to_insert {
                match self.insert_step(run_id, new, now) {
                    Some(id) => applied.enqueued.push(id),
                    None => applied.deduplicated += 1,
                }
            }
        }
        applied
    }

    fn run_steps(&self, run_id: Uuid) -> impl Iterator<Item = &StepInstance> {
        self.steps.values().filter(move |s| s.run_id == run_id)
    }

    /// Running while any step is ready or executing, waiting while only
    /// timers remain
    fn refresh_run_status(&mut self, run_id: Uuid, now: DateTime<Utc>) {
        let (mut ready, mut scheduled) = (false, false);
        for step in self.run_steps(run_id) {
            match step.state {
                StepState::Pending | StepState::Executing => ready = true,
                StepState::Scheduled => scheduled = true,
                _ => {}
            }
        }
        let Some(run) = self.runs.get_mut(&run_id) else {
            return;
        };
        if run.status.is_terminal() {
            return;
        }
        let status = if ready {
            RunStatus::Running
        } else if scheduled {
            RunStatus::Waiting
        } else {
            run.status
        };
        if status != run.status {
            run.status = status;
            run.updated_at = now;
        }
    }

    fn active_work(&self, run_id: Uuid, branch: &BranchPath) -> usize {
        let steps = self
            .run_steps(run_id)
            .filter(|s| s.state.is_active() && branch.contains(&s.branch))
            .count();
        let loops = self
            .loops
            .values()
            .filter(|c| c.run_id == run_id && !c.is_closed() && branch.contains(&c.branch))
            .count();
        steps + loops
    }

    /// Record each unfired merge of a drained run as a failed step
    fn fail_incomplete_merges(&mut self, run_id: Uuid, now: DateTime<Utc>) {
        let stalled: Vec<MergeWaitSet> = self
            .merges
            .values()
            .filter(|m| m.run_id == run_id && !m.fired)
            .cloned()
            .collect();
        for set in stalled {
            let new = NewStep::new(set.node_id.clone(), set.branch.clone(), Default::default());
            let Some(id) = self.insert_step(run_id, new, now) else {
                continue;
            };
            if let Some(step) = self.steps.get_mut(&id) {
                let failure = set.incomplete_failure();
                step.state = StepState::Failed;
                step.last_error = Some(failure.message.clone());
                step.failure = Some(failure);
            }
        }
    }

    fn run_is_terminal(&self, run_id: Uuid) -> bool {
        self.runs
            .get(&run_id)
            .is_some_and(|r| r.status.is_terminal())
    }

    fn step_mut(&mut self, step_id: Uuid) -> Result<&mut StepInstance, StoreError> {
        self.steps
            .get_mut(&step_id)
            .ok_or(StoreError::StepNotFound(step_id))
    }
}

/// In-memory implementation of WorkflowStore
///
/// Provides the same semantics as the PostgreSQL implementation. A single
/// lock guards all state, which makes every operation atomic.
///
/// # Example
///
/// ```
/// use flowline_engine::InMemoryWorkflowStore;
///
/// let store = InMemoryWorkflowStore::new();
/// assert_eq!(store.run_count(), 0);
/// ```
#[derive(Default)]
pub struct InMemoryWorkflowStore {
    state: RwLock<State>,
}

impl InMemoryWorkflowStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the number of runs
    pub fn run_count(&self) -> usize {
        self.state.read().runs.len()
    }

    /// Get the number of stored steps
    pub fn step_count(&self) -> usize {
        self.state.read().steps.len()
    }

    /// Get the number of pending steps
    pub fn pending_step_count(&self) -> usize {
        self.state
            .read()
            .steps
            .values()
            .filter(|s| s.state == StepState::Pending)
            .count()
    }
}

#[async_trait]
impl WorkflowStore for InMemoryWorkflowStore {
    async fn insert_definition(&self, def: &WorkflowDefinition) -> Result<(), StoreError> {
        let mut state = self.state.write();
        if state.definitions.contains_key(&def.id) {
            return Err(StoreError::Conflict(format!("definition {} exists", def.id)));
        }
        state.definitions.insert(def.id, def.clone());
        Ok(())
    }

    async fn update_definition(&self, def: &WorkflowDefinition) -> Result<(), StoreError> {
        let mut state = self.state.write();
        let slot = state
            .definitions
            .get_mut(&def.id)
            .ok_or(StoreError::DefinitionNotFound(def.id))?;
        *slot = def.clone();
        Ok(())
    }

    async fn get_definition(&self, id: Uuid) -> Result<WorkflowDefinition, StoreError> {
        self.state
            .read()
            .definitions
            .get(&id)
            .cloned()
            .ok_or(StoreError::DefinitionNotFound(id))
    }

    async fn list_definitions(
        &self,
        filter: &DefinitionFilter,
    ) -> Result<Vec<WorkflowDefinition>, StoreError> {
        let mut defs: Vec<WorkflowDefinition> = self
            .state
            .read()
            .definitions
            .values()
            .filter(|d| filter.org_id.as_ref().map_or(true, |org| &d.org_id == org))
            .filter(|d| filter.status.map_or(true, |s| d.status == s))
            .cloned()
            .collect();
        defs.sort_by_key(|d| d.id);
        Ok(defs)
    }

    async fn active_definitions_for_event(
        &self,
        event_kind: &str,
    ) -> Result<Vec<WorkflowDefinition>, StoreError> {
        let mut defs: Vec<WorkflowDefinition> = self
            .state
            .read()
            .definitions
            .values()
            .filter(|d| d.status == DefinitionStatus::Active)
            .filter(|d| {
                d.triggers.iter().any(|t| match &t.source {
                    TriggerSource::Event { event_kind: kind, .. } => kind == event_kind,
                    TriggerSource::Schedule { .. } => false,
                })
            })
            .cloned()
            .collect();
        defs.sort_by_key(|d| d.id);
        Ok(defs)
    }

    async fn create_run(
        &self,
        run: &WorkflowRun,
        routes: Vec<Route>,
    ) -> Result<CreateRunOutcome, StoreError> {
        let mut state = self.state.write();

        if let Some(key) = &run.idempotency_key {
            let dedup = (run.definition_id, key.clone());
            if let Some(&existing) = state.run_keys.get(&dedup) {
                return Ok(CreateRunOutcome::Duplicate { run_id: existing });
            }
            state.run_keys.insert(dedup, run.id);
        }

        state.runs.insert(run.id, run.clone());
        let applied = state.apply_routes(run.id, routes, run.created_at);
        state.refresh_run_status(run.id, run.created_at);

        let run = state
            .runs
            .get(&run.id)
            .cloned()
            .ok_or(StoreError::RunNotFound(run.id))?;
        Ok(CreateRunOutcome::Created { run, applied })
    }

    async fn get_run(&self, run_id: Uuid) -> Result<WorkflowRun, StoreError> {
        self.state
            .read()
            .runs
            .get(&run_id)
            .cloned()
            .ok_or(StoreError::RunNotFound(run_id))
    }

    async fn cancel_run(&self, run_id: Uuid, now: DateTime<Utc>) -> Result<WorkflowRun, StoreError> {
        let mut state = self.state.write();
        let run = state
            .runs
            .get_mut(&run_id)
            .ok_or(StoreError::RunNotFound(run_id))?;
        if run.status.is_terminal() {
            return Ok(run.clone());
        }
        run.status = RunStatus::Cancelled;
        run.finished_at = Some(now);
        run.updated_at = now;
        let run = run.clone();

        for step in state.steps.values_mut().filter(|s| s.run_id == run_id) {
            if matches!(step.state, StepState::Pending | StepState::Scheduled) {
                step.state = StepState::Cancelled;
                step.updated_at = now;
            }
        }
        Ok(run)
    }

    async fn finalize_run_if_drained(
        &self,
        run_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<RunStatus>, StoreError> {
        let mut state = self.state.write();
        let run = state
            .runs
            .get(&run_id)
            .ok_or(StoreError::RunNotFound(run_id))?;
        if run.status.is_terminal() || state.active_work(run_id, &BranchPath::root()) > 0 {
            return Ok(None);
        }

        state.fail_incomplete_merges(run_id, now);
        let failed = state
            .run_steps(run_id)
            .any(|s| s.state == StepState::Failed);
        let status = if failed {
            RunStatus::Failed
        } else {
            RunStatus::Completed
        };

        if let Some(run) = state.runs.get_mut(&run_id) {
            run.status = status;
            run.finished_at = Some(now);
            run.updated_at = now;
        }
        Ok(Some(status))
    }

    async fn list_unsettled(&self, limit: usize) -> Result<Vec<Uuid>, StoreError> {
        let state = self.state.read();
        let mut ids: Vec<Uuid> = state
            .runs
            .values()
            .filter(|r| !r.status.is_terminal())
            .filter(|r| {
                !state.run_steps(r.id).any(|s| s.state.is_active())
                    || state
                        .loops
                        .values()
                        .any(|c| c.run_id == r.id && c.state == LoopState::Completing)
            })
            .map(|r| r.id)
            .collect();
        ids.sort();
        ids.truncate(limit);
        Ok(ids)
    }

    async fn get_step(&self, step_id: Uuid) -> Result<StepInstance, StoreError> {
        self.state
            .read()
            .steps
            .get(&step_id)
            .cloned()
            .ok_or(StoreError::StepNotFound(step_id))
    }

    async fn find_step(&self, key: &StepKey) -> Result<Option<StepInstance>, StoreError> {
        let state = self.state.read();
        Ok(state
            .step_keys
            .get(key)
            .and_then(|id| state.steps.get(id))
            .cloned())
    }

    async fn list_steps(&self, run_id: Uuid) -> Result<Vec<StepInstance>, StoreError> {
        let mut steps: Vec<StepInstance> = self.state.read().run_steps(run_id).cloned().collect();
        steps.sort_by_key(|s| (s.created_at, s.id));
        Ok(steps)
    }

    async fn claim_steps(
        &self,
        worker_id: &str,
        max: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<StepInstance>, StoreError> {
        let mut state = self.state.write();
        let mut ids: Vec<(DateTime<Utc>, Uuid)> = state
            .steps
            .values()
            .filter(|s| s.state == StepState::Pending)
            .map(|s| (s.created_at, s.id))
            .collect();
        ids.sort();
        ids.truncate(max);

        let mut claimed = Vec::with_capacity(ids.len());
        for (_, id) in ids {
            let step = state.step_mut(id)?;
            step.state = StepState::Executing;
            step.claimed_by = Some(worker_id.to_string());
            step.claimed_at = Some(now);
            step.updated_at = now;
            claimed.push(step.clone());
        }
        Ok(claimed)
    }

    async fn begin_step(
        &self,
        step_id: Uuid,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<StepInstance>, StoreError> {
        let mut state = self.state.write();
        let step = state.step_mut(step_id)?;
        if step.state != StepState::Pending {
            return Ok(None);
        }
        step.state = StepState::Executing;
        step.claimed_by = Some(worker_id.to_string());
        step.claimed_at = Some(now);
        step.updated_at = now;
        Ok(Some(step.clone()))
    }

    async fn complete_step(
        &self,
        step_id: Uuid,
        completion: StepCompletion,
        now: DateTime<Utc>,
    ) -> Result<CompletionOutcome, StoreError> {
        let mut state = self.state.write();
        let step = state.step_mut(step_id)?;
        if step.state.is_terminal() {
            return Ok(CompletionOutcome::AlreadyFinished);
        }
        step.state = StepState::Done;
        step.output = Some(completion.output.clone());
        step.due_at = None;
        step.updated_at = now;
        let (run_id, node_id, branch) = (step.run_id, step.node_id.clone(), step.branch.clone());

        if branch.is_root() {
            if let Some(run) = state.runs.get_mut(&run_id) {
                if !run.context.contains_key(&node_id) {
                    run.context.insert(node_id.clone(), completion.output);
                    run.updated_at = now;
                }
            }
        }

        if let Some(cursor) = completion.open_loop {
            let key = StepKey::new(run_id, cursor.node_id.clone(), cursor.branch.clone());
            state.loops.entry(key).or_insert(cursor);
        }

        // an in-flight step of a cancelled run may finish but routes nowhere
        let applied = if state.run_is_terminal(run_id) {
            AppliedRoutes::default()
        } else {
            state.apply_routes(run_id, completion.routes, now)
        };
        state.refresh_run_status(run_id, now);
        Ok(CompletionOutcome::Completed(applied))
    }

    async fn fail_step(
        &self,
        step_id: Uuid,
        failure: StepFailure,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.write();
        let step = state.step_mut(step_id)?;
        if step.state.is_terminal() {
            return Ok(false);
        }
        step.state = StepState::Failed;
        step.last_error = Some(failure.message.clone());
        step.failure = Some(failure);
        step.due_at = None;
        step.updated_at = now;
        let run_id = step.run_id;
        state.refresh_run_status(run_id, now);
        Ok(true)
    }

    async fn retry_step(
        &self,
        step_id: Uuid,
        due_at: DateTime<Utc>,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.write();
        let step = state.step_mut(step_id)?;
        if step.state.is_terminal() {
            return Ok(());
        }
        step.state = StepState::Scheduled;
        step.attempt += 1;
        step.due_at = Some(due_at);
        step.last_error = Some(error.to_string());
        step.claimed_by = None;
        step.claimed_at = None;
        step.updated_at = now;
        let run_id = step.run_id;
        state.refresh_run_status(run_id, now);
        Ok(())
    }

    async fn schedule_wake(
        &self,
        step_id: Uuid,
        wake_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.write();
        let step = state.step_mut(step_id)?;
        if step.state.is_terminal() {
            return Ok(());
        }
        step.state = StepState::Scheduled;
        step.due_at = Some(wake_at);
        step.wake_at = Some(wake_at);
        step.claimed_by = None;
        step.claimed_at = None;
        step.updated_at = now;
        let run_id = step.run_id;
        state.refresh_run_status(run_id, now);
        Ok(())
    }

    async fn cancel_step(&self, step_id: Uuid, now: DateTime<Utc>) -> Result<(), StoreError> {
        let mut state = self.state.write();
        let step = state.step_mut(step_id)?;
        if step.state.is_active() {
            step.state = StepState::Cancelled;
            step.updated_at = now;
        }
        Ok(())
    }

    async fn release_due_steps(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Uuid>, StoreError> {
        let mut state = self.state.write();
        let mut due: Vec<(DateTime<Utc>, Uuid)> = state
            .steps
            .values()
            .filter(|s| s.state == StepState::Scheduled)
            .filter_map(|s| s.due_at.filter(|at| *at <= now).map(|at| (at, s.id)))
            .collect();
        due.sort();
        due.truncate(limit);

        let mut released = Vec::with_capacity(due.len());
        for (_, id) in due {
            let step = state.step_mut(id)?;
            step.state = StepState::Pending;
            step.due_at = None;
            step.updated_at = now;
            let run_id = step.run_id;
            released.push(id);
            state.refresh_run_status(run_id, now);
        }
        Ok(released)
    }

    async fn reclaim_stale_steps(
        &self,
        claimed_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<Uuid>, StoreError> {
        let mut state = self.state.write();
        let mut reclaimed = Vec::new();
        for step in state.steps.values_mut() {
            if step.state == StepState::Executing
                && step.claimed_at.is_some_and(|at| at < claimed_before)
            {
                step.state = StepState::Pending;
                step.claimed_by = None;
                step.claimed_at = None;
                step.updated_at = now;
                reclaimed.push(step.id);
            }
        }
        Ok(reclaimed)
    }

    async fn count_active_work(
        &self,
        run_id: Uuid,
        branch: &BranchPath,
    ) -> Result<usize, StoreError> {
        Ok(self.state.read().active_work(run_id, branch))
    }

    async fn list_merge_wait_sets(&self, run_id: Uuid) -> Result<Vec<MergeWaitSet>, StoreError> {
        let mut sets: Vec<MergeWaitSet> = self
            .state
            .read()
            .merges
            .values()
            .filter(|m| m.run_id == run_id)
            .cloned()
            .collect();
        sets.sort_by(|a, b| (&a.node_id, &a.branch).cmp(&(&b.node_id, &b.branch)));
        Ok(sets)
    }

    async fn list_loop_cursors(&self, run_id: Uuid) -> Result<Vec<LoopCursor>, StoreError> {
        let mut cursors: Vec<LoopCursor> = self
            .state
            .read()
            .loops
            .values()
            .filter(|c| c.run_id == run_id)
            .cloned()
            .collect();
        cursors.sort_by(|a, b| (&a.node_id, &a.branch).cmp(&(&b.node_id, &b.branch)));
        Ok(cursors)
    }

    async fn finish_loop_item(
        &self,
        run_id: Uuid,
        loop_node: &str,
        branch: &BranchPath,
        index: u32,
        now: DateTime<Utc>,
    ) -> Result<LoopProgress, StoreError> {
        let mut state = self.state.write();
        let key = StepKey::new(run_id, loop_node, branch.clone());
        let cursor = state.loops.get_mut(&key).ok_or_else(|| StoreError::LoopNotFound {
            run_id,
            node_id: loop_node.to_string(),
            branch: branch.clone(),
        })?;
        let claimed_completion = cursor.finish_item(index, now);
        Ok(LoopProgress {
            cursor: cursor.clone(),
            claimed_completion,
        })
    }

    async fn close_loop(
        &self,
        run_id: Uuid,
        loop_node: &str,
        branch: &BranchPath,
        routes: Vec<Route>,
        now: DateTime<Utc>,
    ) -> Result<AppliedRoutes, StoreError> {
        let mut state = self.state.write();
        let key = StepKey::new(run_id, loop_node, branch.clone());
        let cursor = state.loops.get_mut(&key).ok_or_else(|| StoreError::LoopNotFound {
            run_id,
            node_id: loop_node.to_string(),
            branch: branch.clone(),
        })?;
        if cursor.state == LoopState::Closed {
            return Ok(AppliedRoutes::default());
        }
        cursor.state = LoopState::Closed;
        cursor.updated_at = now;

        let applied = if state.run_is_terminal(run_id) {
            AppliedRoutes::default()
        } else {
            state.apply_routes(run_id, routes, now)
        };
        state.refresh_run_status(run_id, now);
        Ok(applied)
    }

    async fn get_effect(&self, key: &StepKey) -> Result<Option<Value>, StoreError> {
        Ok(self.state.read().effects.get(key).cloned())
    }

    async fn record_effect(
        &self,
        key: &StepKey,
        output: &Value,
        _now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.state
            .write()
            .effects
            .entry(key.clone())
            .or_insert_with(|| output.clone());
        Ok(())
    }

    async fn replace_schedules(
        &self,
        definition_id: Uuid,
        schedules: Vec<ScheduleTrigger>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.write();
        state
            .schedules
            .retain(|(def_id, _), _| *def_id != definition_id);
        for schedule in schedules {
            state
                .schedules
                .insert((definition_id, schedule.node_id.clone()), schedule);
        }
        Ok(())
    }

    async fn list_schedules(&self, definition_id: Uuid) -> Result<Vec<ScheduleTrigger>, StoreError> {
        let mut schedules: Vec<ScheduleTrigger> = self
            .state
            .read()
            .schedules
            .values()
            .filter(|s| s.definition_id == definition_id)
            .cloned()
            .collect();
        schedules.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        Ok(schedules)
    }

    async fn due_schedules(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ScheduleTrigger>, StoreError> {
        let mut due: Vec<ScheduleTrigger> = self
            .state
            .read()
            .schedules
            .values()
            .filter(|s| s.next_fire_at <= now)
            .cloned()
            .collect();
        due.sort_by_key(|s| s.next_fire_at);
        due.truncate(limit);
        Ok(due)
    }

    async fn advance_schedule(
        &self,
        definition_id: Uuid,
        node_id: &str,
        expected_fire_at: DateTime<Utc>,
        next_fire_at: Option<DateTime<Utc>>,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.write();
        let key = (definition_id, node_id.to_string());
        let Some(schedule) = state.schedules.get_mut(&key) else {
            return Ok(false);
        };
        if schedule.next_fire_at != expected_fire_at {
            return Ok(false);
        }
        match next_fire_at {
            Some(next) => {
                schedule.last_fired_at = Some(expected_fire_at);
                schedule.next_fire_at = next;
            }
            None => {
                state.schedules.remove(&key);
            }
        }
        Ok(true)
    }

    async fn purge_finished_runs(
        &self,
        finished_before: DateTime<Utc>,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<PurgeReport, StoreError> {
        let mut state = self.state.write();
        let mut expired: Vec<Uuid> = state
            .runs
            .values()
            .filter(|r| r.status.is_terminal() && r.purged_at.is_none())
            .filter(|r| r.finished_at.is_some_and(|at| at < finished_before))
            .map(|r| r.id)
            .collect();
        expired.sort();
        expired.truncate(limit);

        let mut report = PurgeReport::default();
        for run_id in expired {
            let before = state.steps.len();
            state.steps.retain(|_, s| s.run_id != run_id);
            report.steps += before - state.steps.len();
            state.step_keys.retain(|k, _| k.run_id != run_id);
            state.merges.retain(|k, _| k.run_id != run_id);
            state.loops.retain(|k, _| k.run_id != run_id);
            state.effects.retain(|k, _| k.run_id != run_id);
            if let Some(run) = state.runs.get_mut(&run_id) {
                run.purged_at = Some(now);
            }
            report.runs += 1;
        }
        Ok(report)
    }
}
