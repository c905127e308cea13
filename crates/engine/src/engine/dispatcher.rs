//! Run dispatcher
//!
//! Turns a trigger event into one run per matching active definition. The
//! run row and the trigger node's first successors are written together,
//! and a repeated idempotency key resolves to the run it created before.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::coordinator::routes_for;
use crate::definition::{handles, DefinitionStatus, WorkflowDefinition};
use crate::persistence::{CreateRunOutcome, StoreError, WorkflowStore};
use crate::run::{BranchPath, RunStatus, WorkflowRun};
use crate::timer::{TimerError, TimerService};

/// Event kind recorded on runs started by a cron fire
pub const SCHEDULE_EVENT_KIND: &str = "schedule";

/// An external event offered to the dispatcher
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerEvent {
    pub event_kind: String,

    #[serde(default)]
    pub payload: Value,

    /// Redelivery of the same key never creates a second run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,

    /// Restrict matching to one org's definitions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub org_id: Option<String>,
}

impl TriggerEvent {
    pub fn new(event_kind: impl Into<String>, payload: Value) -> Self {
        Self {
            event_kind: event_kind.into(),
            payload,
            idempotency_key: None,
            org_id: None,
        }
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn for_org(mut self, org_id: impl Into<String>) -> Self {
        self.org_id = Some(org_id.into());
        self
    }
}

/// One run resolved for an event
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DispatchedRun {
    pub run_id: Uuid,
    pub definition_id: Uuid,
    /// False when an earlier delivery already created this run
    pub created: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatchOutcome {
    pub runs: Vec<DispatchedRun>,
}

impl DispatchOutcome {
    pub fn run_ids(&self) -> Vec<Uuid> {
        self.runs.iter().map(|r| r.run_id).collect()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("timer error: {0}")]
    Timer(#[from] TimerError),
}

/// Creates runs from trigger events and cron fires
#[derive(Clone)]
pub struct RunDispatcher {
    store: Arc<dyn WorkflowStore>,
    timers: TimerService,
}

impl RunDispatcher {
    pub fn new(store: Arc<dyn WorkflowStore>, timers: TimerService) -> Self {
        Self { store, timers }
    }

    /// Start a run for every active definition whose trigger matches
    #[instrument(skip(self, event), fields(event_kind = %event.event_kind))]
    pub async fn dispatch(&self, event: &TriggerEvent) -> Result<DispatchOutcome, DispatchError> {
        let definitions = self
            .store
            .active_definitions_for_event(&event.event_kind)
            .await?;

        let mut outcome = DispatchOutcome::default();
        for def in &definitions {
            if event.org_id.as_ref().is_some_and(|org| *org != def.org_id) {
                continue;
            }
            let Some(trigger) = def.matching_trigger(&event.event_kind, &event.payload) else {
                continue;
            };
            let node_id = trigger.node_id.clone();
            let dispatched = self
                .start_run(
                    def,
                    &node_id,
                    &event.event_kind,
                    event.payload.clone(),
                    event.idempotency_key.clone(),
                )
                .await?;
            outcome.runs.push(dispatched);
        }

        if outcome.runs.is_empty() {
            debug!("no active definition matched");
        }
        Ok(outcome)
    }

    /// Fire every due cron schedule at most once
    ///
    /// Each fire is claimed by advancing the schedule first, so concurrent
    /// sweepers never start the same fire twice. Schedules of definitions
    /// that are no longer active are advanced but start nothing.
    #[instrument(skip(self))]
    pub async fn fire_due_schedules(&self, limit: usize) -> Result<DispatchOutcome, DispatchError> {
        let mut outcome = DispatchOutcome::default();
        for schedule in self.timers.due_schedules(limit).await? {
            if !self.timers.claim_fire(&schedule).await? {
                continue;
            }

            let def = match self.store.get_definition(schedule.definition_id).await {
                Ok(def) => def,
                Err(StoreError::DefinitionNotFound(id)) => {
                    warn!(definition_id = %id, "schedule points at a missing definition");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            if def.status != DefinitionStatus::Active {
                debug!(definition_id = %def.id, status = %def.status, "skipping fire of inactive definition");
                continue;
            }

            let fired_at = schedule.next_fire_at;
            let dispatched = self
                .start_run(
                    &def,
                    &schedule.node_id,
                    SCHEDULE_EVENT_KIND,
                    json!({ "fired_at": fired_at, "cron": schedule.cron }),
                    Some(schedule.fire_key(fired_at)),
                )
                .await?;
            outcome.runs.push(dispatched);
        }
        Ok(outcome)
    }

    async fn start_run(
        &self,
        def: &WorkflowDefinition,
        trigger_node_id: &str,
        event_kind: &str,
        payload: Value,
        idempotency_key: Option<String>,
    ) -> Result<DispatchedRun, DispatchError> {
        let now = self.timers.now();
        // The payload is the trigger node's output
        let mut context = Map::new();
        context.insert(trigger_node_id.to_string(), payload);

        let run = WorkflowRun {
            id: Uuid::now_v7(),
            definition_id: def.id,
            org_id: def.org_id.clone(),
            trigger_node_id: trigger_node_id.to_string(),
            event_kind: event_kind.to_string(),
            idempotency_key,
            status: RunStatus::Running,
            context,
            created_at: now,
            updated_at: now,
            finished_at: None,
            purged_at: None,
        };
        let routes = routes_for(
            def,
            trigger_node_id,
            handles::OUT,
            &BranchPath::root(),
            &Map::new(),
        );

        match self.store.create_run(&run, routes).await? {
            CreateRunOutcome::Created { run, applied } => {
                info!(
                    run_id = %run.id,
                    definition_id = %def.id,
                    trigger = trigger_node_id,
                    enqueued = applied.enqueued.len(),
                    "run created"
                );
                // A trigger wired to nothing, or only to a merge still
                // waiting on other inputs, leaves nothing to execute
                if applied.enqueued.is_empty() {
                    self.store.finalize_run_if_drained(run.id, now).await?;
                }
                Ok(DispatchedRun {
                    run_id: run.id,
                    definition_id: def.id,
                    created: true,
                })
            }
            CreateRunOutcome::Duplicate { run_id } => {
                debug!(%run_id, definition_id = %def.id, "duplicate delivery, reusing run");
                Ok(DispatchedRun {
                    run_id,
                    definition_id: def.id,
                    created: false,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{Edge, Node, TriggerSpec};
    use crate::persistence::InMemoryWorkflowStore;
    use crate::timer::{Clock, ManualClock};
    use chrono::{Duration, TimeZone, Utc};

    fn definition(status: DefinitionStatus, triggers: Vec<TriggerSpec>) -> WorkflowDefinition {
        let now = Utc::now();
        WorkflowDefinition {
            id: Uuid::now_v7(),
            org_id: "org-1".into(),
            name: "welcome".into(),
            version: 2,
            status,
            nodes: vec![
                Node::trigger_event("signup"),
                Node::trigger_schedule("nightly"),
                Node::action("welcome", "send_email", json!({})).terminal(),
            ],
            edges: vec![
                Edge::simple("e1", "signup", "welcome"),
                Edge::simple("e2", "nightly", "welcome"),
            ],
            triggers,
            created_at: now,
            updated_at: now,
        }
    }

    fn dispatcher(clock: Arc<ManualClock>) -> (RunDispatcher, Arc<InMemoryWorkflowStore>) {
        let store = Arc::new(InMemoryWorkflowStore::new());
        let timers = TimerService::new(store.clone(), clock);
        (RunDispatcher::new(store.clone(), timers), store)
    }

    #[tokio::test]
    async fn test_dispatch_seeds_trigger_context_and_first_step() {
        let (dispatcher, store) = dispatcher(Arc::new(ManualClock::starting_now()));
        let def = definition(
            DefinitionStatus::Active,
            vec![TriggerSpec::event("signup", "user_signed_up")],
        );
        store.insert_definition(&def).await.unwrap();

        let event = TriggerEvent::new("user_signed_up", json!({ "email": "a@example.com" }));
        let outcome = dispatcher.dispatch(&event).await.unwrap();
        assert_eq!(outcome.runs.len(), 1);
        assert!(outcome.runs[0].created);

        let run = store.get_run(outcome.runs[0].run_id).await.unwrap();
        assert_eq!(run.context["signup"]["email"], "a@example.com");
        assert_eq!(run.trigger_node_id, "signup");

        let steps = store.list_steps(run.id).await.unwrap();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].node_id, "welcome");
    }

    #[tokio::test]
    async fn test_same_key_resolves_to_same_run() {
        let (dispatcher, store) = dispatcher(Arc::new(ManualClock::starting_now()));
        let def = definition(
            DefinitionStatus::Active,
            vec![TriggerSpec::event("signup", "user_signed_up")],
        );
        store.insert_definition(&def).await.unwrap();

        let event = TriggerEvent::new("user_signed_up", json!({})).with_idempotency_key("evt-1");
        let first = dispatcher.dispatch(&event).await.unwrap();
        let second = dispatcher.dispatch(&event).await.unwrap();

        assert_eq!(first.run_ids(), second.run_ids());
        assert!(!second.runs[0].created);
        assert_eq!(store.run_count(), 1);
    }

    #[tokio::test]
    async fn test_inactive_and_other_org_definitions_ignored() {
        let (dispatcher, store) = dispatcher(Arc::new(ManualClock::starting_now()));
        let paused = definition(
            DefinitionStatus::Paused,
            vec![TriggerSpec::event("signup", "user_signed_up")],
        );
        let active = definition(
            DefinitionStatus::Active,
            vec![TriggerSpec::event("signup", "user_signed_up")],
        );
        store.insert_definition(&paused).await.unwrap();
        store.insert_definition(&active).await.unwrap();

        let event = TriggerEvent::new("user_signed_up", json!({})).for_org("org-2");
        assert!(dispatcher.dispatch(&event).await.unwrap().runs.is_empty());

        let event = TriggerEvent::new("user_signed_up", json!({}));
        let outcome = dispatcher.dispatch(&event).await.unwrap();
        assert_eq!(outcome.runs.len(), 1);
        assert_eq!(outcome.runs[0].definition_id, active.id);
    }

    #[tokio::test]
    async fn test_schedule_fire_starts_one_run() {
        let start = Utc.with_ymd_and_hms(2026, 3, 1, 2, 0, 0).unwrap();
        let clock = Arc::new(ManualClock::new(start));
        let (dispatcher, store) = dispatcher(clock.clone());
        let def = definition(
            DefinitionStatus::Active,
            vec![TriggerSpec::schedule("nightly", "0 3 * * *")],
        );
        store.insert_definition(&def).await.unwrap();
        dispatcher.timers.register_schedules(&def).await.unwrap();

        assert!(dispatcher.fire_due_schedules(10).await.unwrap().runs.is_empty());

        clock.advance(Duration::hours(1));
        let outcome = dispatcher.fire_due_schedules(10).await.unwrap();
        assert_eq!(outcome.runs.len(), 1);
        assert!(dispatcher.fire_due_schedules(10).await.unwrap().runs.is_empty());

        let run = store.get_run(outcome.runs[0].run_id).await.unwrap();
        assert_eq!(run.event_kind, SCHEDULE_EVENT_KIND);
        assert_eq!(run.trigger_node_id, "nightly");
        assert_eq!(run.created_at, clock.now());
        assert_eq!(run.context["nightly"]["cron"], "0 3 * * *");
    }
}
