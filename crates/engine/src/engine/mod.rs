//! Workflow execution engine
//!
//! [`Engine`] wires the dispatcher, step executor, timers, metering and
//! definition service over one store. Worker pools and the sweeper drive it
//! in production; tests call [`Engine::run_until_idle`] directly.

mod coordinator;
mod dispatcher;
mod executor;
mod report;

pub use coordinator::{loop_item_routes, routes_for, split_bucket, split_handle, successor_scope};
pub use dispatcher::{
    DispatchError, DispatchOutcome, DispatchedRun, RunDispatcher, TriggerEvent,
    SCHEDULE_EVENT_KIND,
};
pub use executor::{ExecutorConfig, ExecutorError, SkipReason, StepExecutor, StepOutcome};
pub use report::{Blocker, RunReport};

use std::sync::Arc;

use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::behavior::BehaviorRegistry;
use crate::definition::{DefinitionError, DefinitionService};
use crate::metering::{CreditLedger, InMemoryCreditLedger, LedgerError, MeteringGate};
use crate::persistence::{StoreError, WorkflowStore};
use crate::run::WorkflowRun;
use crate::timer::{Clock, SystemClock, TimerError, TimerService};

/// Steps claimed per round by [`Engine::run_until_idle`]
const DRAIN_BATCH: usize = 64;

/// Top-level engine errors
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("run not found: {0}")]
    RunNotFound(Uuid),

    #[error(transparent)]
    Definition(#[from] DefinitionError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Executor(#[from] ExecutorError),

    #[error(transparent)]
    Timer(#[from] TimerError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::RunNotFound(id) => Self::RunNotFound(id),
            other => Self::Store(other),
        }
    }
}

/// Counts from one [`Engine::run_until_idle`] call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub executed: usize,
    pub released: usize,
}

/// Builder for [`Engine`]
pub struct EngineBuilder {
    store: Arc<dyn WorkflowStore>,
    behaviors: BehaviorRegistry,
    ledger: Option<Arc<dyn CreditLedger>>,
    clock: Option<Arc<dyn Clock>>,
    executor_config: ExecutorConfig,
}

impl EngineBuilder {
    pub fn new(store: Arc<dyn WorkflowStore>) -> Self {
        Self {
            store,
            behaviors: BehaviorRegistry::new(),
            ledger: None,
            clock: None,
            executor_config: ExecutorConfig::default(),
        }
    }

    pub fn behaviors(mut self, behaviors: BehaviorRegistry) -> Self {
        self.behaviors = behaviors;
        self
    }

    /// Defaults to an unmetered in-memory ledger
    pub fn ledger(mut self, ledger: Arc<dyn CreditLedger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    /// Defaults to the system clock
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn executor_config(mut self, config: ExecutorConfig) -> Self {
        self.executor_config = config;
        self
    }

    pub fn build(self) -> Engine {
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let ledger = self
            .ledger
            .unwrap_or_else(|| Arc::new(InMemoryCreditLedger::with_default_balance(u64::MAX)));
        let behaviors = Arc::new(self.behaviors);
        let timers = TimerService::new(self.store.clone(), clock.clone());

        let executor = StepExecutor::new(
            self.store.clone(),
            behaviors.clone(),
            MeteringGate::new(ledger.clone()),
            timers.clone(),
            self.executor_config,
        );

        Engine {
            definitions: DefinitionService::new(self.store.clone(), behaviors.clone(), timers.clone()),
            dispatcher: RunDispatcher::new(self.store.clone(), timers.clone()),
            executor: Arc::new(executor),
            store: self.store,
            behaviors,
            ledger,
            clock,
            timers,
        }
    }
}

/// The workflow engine
///
/// # Example
///
/// ```ignore
/// use flowline_engine::prelude::*;
///
/// let mut behaviors = BehaviorRegistry::new();
/// behaviors.register_fn("send_email", |ctx| async move {
///     Ok(serde_json::json!({ "to": ctx.param_str("to") }))
/// });
///
/// let engine = EngineBuilder::new(Arc::new(InMemoryWorkflowStore::new()))
///     .behaviors(behaviors)
///     .build();
///
/// let outcome = engine
///     .dispatch(&TriggerEvent::new("user_signed_up", payload))
///     .await?;
/// engine.run_until_idle().await?;
/// ```
#[derive(Clone)]
pub struct Engine {
    store: Arc<dyn WorkflowStore>,
    behaviors: Arc<BehaviorRegistry>,
    ledger: Arc<dyn CreditLedger>,
    clock: Arc<dyn Clock>,
    timers: TimerService,
    definitions: DefinitionService,
    dispatcher: RunDispatcher,
    executor: Arc<StepExecutor>,
}

impl Engine {
    pub fn builder(store: Arc<dyn WorkflowStore>) -> EngineBuilder {
        EngineBuilder::new(store)
    }

    pub fn definitions(&self) -> &DefinitionService {
        &self.definitions
    }

    pub fn dispatcher(&self) -> &RunDispatcher {
        &self.dispatcher
    }

    pub fn executor(&self) -> Arc<StepExecutor> {
        self.executor.clone()
    }

    pub fn store(&self) -> &Arc<dyn WorkflowStore> {
        &self.store
    }

    pub fn behaviors(&self) -> &Arc<BehaviorRegistry> {
        &self.behaviors
    }

    pub fn ledger(&self) -> &Arc<dyn CreditLedger> {
        &self.ledger
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn timers(&self) -> &TimerService {
        &self.timers
    }

    pub async fn dispatch(&self, event: &TriggerEvent) -> Result<DispatchOutcome, EngineError> {
        Ok(self.dispatcher.dispatch(event).await?)
    }

    pub async fn fire_due_schedules(&self, limit: usize) -> Result<DispatchOutcome, EngineError> {
        Ok(self.dispatcher.fire_due_schedules(limit).await?)
    }

    pub async fn execute_step(&self, step_id: Uuid) -> Result<StepOutcome, EngineError> {
        Ok(self.executor.execute(step_id).await?)
    }

    /// Finish loop completions and finalization a stopped worker left undone
    pub async fn settle_run(&self, run_id: Uuid) -> Result<(), EngineError> {
        Ok(self.executor.resettle(run_id).await?)
    }

    /// Snapshot of a run and what it is blocked on
    pub async fn inspect_run(&self, run_id: Uuid) -> Result<RunReport, EngineError> {
        let run = self.store.get_run(run_id).await?;
        let steps = self.store.list_steps(run_id).await?;
        let merges = self.store.list_merge_wait_sets(run_id).await?;
        let loops = self.store.list_loop_cursors(run_id).await?;
        Ok(RunReport::build(run, steps, merges, loops))
    }

    /// Cancel a run; steps already executing finish but route nowhere
    #[instrument(skip(self))]
    pub async fn cancel_run(&self, run_id: Uuid) -> Result<WorkflowRun, EngineError> {
        let run = self.store.cancel_run(run_id, self.timers.now()).await?;
        info!(%run_id, status = %run.status, "run cancel requested");
        Ok(run)
    }

    /// Add credit to an org and return the new balance
    pub async fn credit(&self, org_id: &str, amount: u64) -> Result<u64, EngineError> {
        Ok(self.ledger.credit(org_id, amount).await?)
    }

    pub async fn balance(&self, org_id: &str) -> Result<u64, EngineError> {
        Ok(self.ledger.balance(org_id).await?)
    }

    /// Release due timers and execute ready steps until none are left
    ///
    /// Steps parked on timers that are not yet due stay parked; advance the
    /// clock and call again to continue.
    pub async fn run_until_idle(&self) -> Result<DrainReport, EngineError> {
        let mut report = DrainReport::default();
        loop {
            report.released += self.timers.poll_due(DRAIN_BATCH).await?.len();

            let claimed = self
                .store
                .claim_steps(self.executor.worker_id(), DRAIN_BATCH, self.timers.now())
                .await?;
            if claimed.is_empty() {
                break;
            }
            for step in claimed {
                self.executor.execute_claimed(step).await?;
                report.executed += 1;
            }
        }
        debug!(executed = report.executed, released = report.released, "engine idle");
        Ok(report)
    }
}
