//! Durable timers
//!
//! Delays and retry backoff are `scheduled` step rows with a `due_at`; cron
//! triggers are rows in the schedule table. Nothing here keeps an
//! in-process timer: a periodic sweep asks the store what is due.

mod clock;
mod schedule;

pub use clock::{Clock, ManualClock, SystemClock};
pub use schedule::{next_fire_after, parse_schedule, ScheduleError, ScheduleTrigger};

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::definition::{TriggerSource, WorkflowDefinition};
use crate::persistence::{StoreError, WorkflowStore};

/// Errors from the timer subsystem
#[derive(Debug, thiserror::Error)]
pub enum TimerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Schedule(#[from] ScheduleError),
}

/// Store-backed timer operations, read against an injected clock
#[derive(Clone)]
pub struct TimerService {
    store: Arc<dyn WorkflowStore>,
    clock: Arc<dyn Clock>,
}

impl TimerService {
    pub fn new(store: Arc<dyn WorkflowStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Park a step until `due_at`
    pub async fn schedule_wake(&self, step_id: Uuid, due_at: DateTime<Utc>) -> Result<(), TimerError> {
        self.store.schedule_wake(step_id, due_at, self.now()).await?;
        debug!(%step_id, %due_at, "scheduled wake");
        Ok(())
    }

    /// Return due scheduled steps to the ready queue
    pub async fn poll_due(&self, limit: usize) -> Result<Vec<Uuid>, TimerError> {
        Ok(self.store.release_due_steps(self.now(), limit).await?)
    }

    /// Arm one recurring timer per schedule trigger of `def`
    #[instrument(skip(self, def), fields(definition_id = %def.id))]
    pub async fn register_schedules(&self, def: &WorkflowDefinition) -> Result<usize, TimerError> {
        let now = self.now();
        let mut schedules = Vec::new();
        for spec in &def.triggers {
            let TriggerSource::Schedule { cron } = &spec.source else {
                continue;
            };
            if let Some(next_fire_at) = next_fire_after(cron, now)? {
                schedules.push(ScheduleTrigger {
                    definition_id: def.id,
                    node_id: spec.node_id.clone(),
                    cron: cron.clone(),
                    next_fire_at,
                    last_fired_at: None,
                });
            }
        }

        let count = schedules.len();
        self.store.replace_schedules(def.id, schedules).await?;
        debug!(count, "registered schedules");
        Ok(count)
    }

    /// Disarm every recurring timer of a definition
    pub async fn clear_schedules(&self, definition_id: Uuid) -> Result<(), TimerError> {
        self.store.replace_schedules(definition_id, Vec::new()).await?;
        Ok(())
    }

    pub async fn due_schedules(&self, limit: usize) -> Result<Vec<ScheduleTrigger>, TimerError> {
        Ok(self.store.due_schedules(self.now(), limit).await?)
    }

    /// Claim the due fire of `schedule` by moving it to its next fire time.
    ///
    /// Fires missed while no sweeper ran collapse into this one; the next
    /// fire is computed from the later of the due time and now. Returns
    /// false when another sweeper claimed it first.
    pub async fn claim_fire(&self, schedule: &ScheduleTrigger) -> Result<bool, TimerError> {
        let after = schedule.next_fire_at.max(self.now());
        let next = next_fire_after(&schedule.cron, after)?;
        let claimed = self
            .store
            .advance_schedule(
                schedule.definition_id,
                &schedule.node_id,
                schedule.next_fire_at,
                next,
            )
            .await?;
        Ok(claimed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{DefinitionStatus, Node, TriggerSpec};
    use crate::persistence::InMemoryWorkflowStore;
    use chrono::{Duration, TimeZone};

    fn scheduled_definition() -> WorkflowDefinition {
        let now = Utc::now();
        WorkflowDefinition {
            id: Uuid::now_v7(),
            org_id: "org-1".into(),
            name: "nightly".into(),
            version: 1,
            status: DefinitionStatus::Active,
            nodes: vec![Node::trigger_schedule("nightly")],
            edges: vec![],
            triggers: vec![TriggerSpec::schedule("nightly", "0 3 * * *")],
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn test_register_and_claim_fire() {
        let store = Arc::new(InMemoryWorkflowStore::new());
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2026, 3, 1, 2, 0, 0).unwrap());
        let timers = TimerService::new(store.clone(), Arc::new(clock.clone()));
        let def = scheduled_definition();

        assert_eq!(timers.register_schedules(&def).await.unwrap(), 1);
        assert!(timers.due_schedules(10).await.unwrap().is_empty());

        clock.advance(Duration::hours(1));
        let due = timers.due_schedules(10).await.unwrap();
        assert_eq!(due.len(), 1);

        assert!(timers.claim_fire(&due[0]).await.unwrap());
        assert!(!timers.claim_fire(&due[0]).await.unwrap());

        let armed = store.list_schedules(def.id).await.unwrap();
        assert_eq!(
            armed[0].next_fire_at,
            Utc.with_ymd_and_hms(2026, 3, 2, 3, 0, 0).unwrap()
        );
    }

    #[tokio::test]
    async fn test_missed_fires_collapse() {
        let store = Arc::new(InMemoryWorkflowStore::new());
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2026, 3, 1, 2, 0, 0).unwrap());
        let timers = TimerService::new(store.clone(), Arc::new(clock.clone()));
        let def = scheduled_definition();
        timers.register_schedules(&def).await.unwrap();

        clock.advance(Duration::days(5));
        let due = timers.due_schedules(10).await.unwrap();
        assert!(timers.claim_fire(&due[0]).await.unwrap());
        assert!(timers.due_schedules(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_clear_schedules() {
        let store = Arc::new(InMemoryWorkflowStore::new());
        let timers = TimerService::new(store.clone(), Arc::new(SystemClock));
        let def = scheduled_definition();
        timers.register_schedules(&def).await.unwrap();

        timers.clear_schedules(def.id).await.unwrap();
        assert!(store.list_schedules(def.id).await.unwrap().is_empty());
    }
}
