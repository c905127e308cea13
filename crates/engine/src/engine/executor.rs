//! Step executor
//!
//! Runs one claimed step to an outcome:
//! - looks up the node and builds the step's context view
//! - for actions: replays a recorded effect, charges credits, invokes the
//!   behavior under a timeout, and retries or fails on error
//! - resolves which handles fired and hands the routes to the store, which
//!   records the outcome and enqueues successors in one transaction
//! - settles loop item branches and finalizes the run once it drains

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::coordinator::{loop_item_routes, routes_for, split_bucket, split_handle, successor_scope};
use crate::behavior::{BehaviorContext, BehaviorError, BehaviorRegistry};
use crate::context::{context_view, render_params, resolve_path};
use crate::definition::{
    handles, ActionConfig, DelayConfig, LoopConfig, NodeKind, WorkflowDefinition,
};
use crate::metering::{LedgerError, MeteringError, MeteringGate};
use crate::persistence::{CompletionOutcome, StepCompletion, StoreError, WorkflowStore};
use crate::reliability::{duration_millis, RetryPolicy};
use crate::run::{
    BranchPath, FailureKind, LoopCursor, LoopState, Route, StepFailure, StepInstance, StepState,
    WorkflowRun,
};
use crate::timer::{TimerError, TimerService};

/// Configuration for the step executor
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Identity recorded on claimed steps
    pub worker_id: String,

    /// Handler timeout when the action sets none
    #[serde(with = "duration_millis")]
    pub default_timeout: Duration,

    /// Retry policy when the action sets none
    pub default_retry: RetryPolicy,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::now_v7()),
            default_timeout: Duration::from_secs(30),
            default_retry: RetryPolicy::default(),
        }
    }
}

impl ExecutorConfig {
    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn with_default_retry(mut self, policy: RetryPolicy) -> Self {
        self.default_retry = policy;
        self
    }
}

/// Errors from executor operations
///
/// Handler failures are not errors here; they end up as a
/// [`StepOutcome`]. These are infrastructure failures that leave the step
/// for the sweeper to reclaim.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("timer error: {0}")]
    Timer(#[from] TimerError),
}

/// Why a step was not executed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Done, failed or cancelled already
    AlreadyFinished,
    /// Another worker holds it
    InFlight,
    /// Parked on a timer
    NotDue,
    /// Lost the claim race
    Claimed,
}

/// What happened to a step
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StepOutcome {
    Completed { enqueued: Vec<Uuid> },
    Waiting { wake_at: DateTime<Utc> },
    Retrying { attempt: u32, due_at: DateTime<Utc> },
    Failed { kind: FailureKind },
    Cancelled,
    Skipped { reason: SkipReason },
}

/// Executes steps against a store
pub struct StepExecutor {
    store: Arc<dyn WorkflowStore>,
    behaviors: Arc<BehaviorRegistry>,
    metering: MeteringGate,
    timers: TimerService,
    config: ExecutorConfig,
}

impl StepExecutor {
    pub fn new(
        store: Arc<dyn WorkflowStore>,
        behaviors: Arc<BehaviorRegistry>,
        metering: MeteringGate,
        timers: TimerService,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            store,
            behaviors,
            metering,
            timers,
            config,
        }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    /// Claim a pending step by id and run it
    #[instrument(skip(self))]
    pub async fn execute(&self, step_id: Uuid) -> Result<StepOutcome, ExecutorError> {
        let claimed = self
            .store
            .begin_step(step_id, &self.config.worker_id, self.timers.now())
            .await?;

        let Some(step) = claimed else {
            let current = self.store.get_step(step_id).await?;
            let reason = match current.state {
                StepState::Executing => SkipReason::InFlight,
                StepState::Scheduled => SkipReason::NotDue,
                StepState::Pending => SkipReason::Claimed,
                _ => SkipReason::AlreadyFinished,
            };
            debug!(%step_id, ?reason, "step not executed");
            return Ok(StepOutcome::Skipped { reason });
        };

        self.execute_claimed(step).await
    }

    /// Run a step this worker already holds in `executing`
    #[instrument(skip(self, step), fields(step_id = %step.id, run_id = %step.run_id, node_id = %step.node_id, branch = %step.branch, attempt = step.attempt))]
    pub async fn execute_claimed(&self, step: StepInstance) -> Result<StepOutcome, ExecutorError> {
        let run = self.store.get_run(step.run_id).await?;
        if run.status.is_terminal() {
            self.store.cancel_step(step.id, self.timers.now()).await?;
            debug!(status = %run.status, "run is terminal, step cancelled");
            return Ok(StepOutcome::Cancelled);
        }

        let def = match self.store.get_definition(run.definition_id).await {
            Ok(def) => def,
            Err(StoreError::DefinitionNotFound(id)) => {
                let failure = StepFailure::new(
                    FailureKind::Internal,
                    format!("definition {id} no longer exists"),
                );
                return self.fail(None, &step, failure).await;
            }
            Err(e) => return Err(e.into()),
        };

        let Some(node) = def.node(&step.node_id) else {
            let failure = StepFailure::new(
                FailureKind::Internal,
                format!("node {} is not in definition version {}", step.node_id, def.version),
            );
            return self.fail(Some(&def), &step, failure).await;
        };

        let view = context_view(&run.context, &step.scope);

        match &node.kind {
            NodeKind::TriggerEvent | NodeKind::TriggerSchedule => {
                let failure =
                    StepFailure::new(FailureKind::Internal, "trigger nodes are not executable");
                self.fail(Some(&def), &step, failure).await
            }
            NodeKind::Action(config) => self.run_action(&def, &run, &step, config, &view).await,
            NodeKind::IfThen(config) => {
                let result = config.condition.evaluate(&view);
                let handle = if result { handles::TRUE } else { handles::FALSE };
                debug!(result, "condition evaluated");
                self.complete(&def, &step, json!({ "result": result }), handle)
                    .await
            }
            NodeKind::SplitAb(config) => {
                let handle = split_handle(run.id, config.split_percentage);
                let output = json!({ "branch": handle, "bucket": split_bucket(run.id) });
                self.complete(&def, &step, output, handle).await
            }
            NodeKind::Merge(_) => self.complete(&def, &step, json!({}), handles::OUT).await,
            NodeKind::LoopIterator(config) => self.run_loop(&def, &step, config, &view).await,
            NodeKind::WaitDelay(config) => self.run_delay(&def, &step, config).await,
        }
    }

    async fn run_action(
        &self,
        def: &WorkflowDefinition,
        run: &WorkflowRun,
        step: &StepInstance,
        config: &ActionConfig,
        view: &Map<String, Value>,
    ) -> Result<StepOutcome, ExecutorError> {
        let key = step.key();

        // A previous delivery already ran the behavior; reuse its output
        if let Some(output) = self.store.get_effect(&key).await? {
            debug!("behavior already succeeded, replaying recorded output");
            return self.complete(def, step, output, handles::OUT).await;
        }

        let Some(behavior) = self.behaviors.get(&config.behavior) else {
            let failure = StepFailure::new(
                FailureKind::Internal,
                format!("behavior {} is not registered", config.behavior),
            );
            return self.fail(Some(def), step, failure).await;
        };

        let idempotency_key = key.to_string();
        let cost = config.cost.unwrap_or_else(|| behavior.default_cost());
        match self.metering.charge(&run.org_id, cost, &idempotency_key).await {
            Ok(()) => {}
            Err(MeteringError::InsufficientCredit {
                org_id,
                balance,
                required,
            }) => {
                warn!(
                    alert = "budget_exceeded",
                    %org_id,
                    balance,
                    required,
                    "org out of credit, halting branch"
                );
                let failure = StepFailure::new(
                    FailureKind::BudgetExceeded,
                    format!("insufficient credit: balance {balance}, required {required}"),
                );
                return self.fail(Some(def), step, failure).await;
            }
            Err(MeteringError::Ledger(e)) => return Err(e.into()),
        }

        let policy = config
            .retry
            .clone()
            .unwrap_or_else(|| self.config.default_retry.clone());
        let timeout = config
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(self.config.default_timeout);

        let ctx = BehaviorContext {
            run_id: run.id,
            org_id: run.org_id.clone(),
            node_id: step.node_id.clone(),
            branch: step.branch.clone(),
            attempt: step.attempt,
            max_attempts: policy.max_attempts,
            idempotency_key,
            params: render_params(&config.params, view),
            context: view.clone(),
        };

        debug!(behavior = %config.behavior, cost, "invoking behavior");
        let (error, kind) = match tokio::time::timeout(timeout, behavior.invoke(&ctx)).await {
            Ok(Ok(output)) => {
                self.store
                    .record_effect(&key, &output, self.timers.now())
                    .await?;
                return self.complete(def, step, output, handles::OUT).await;
            }
            Ok(Err(error)) => (error, FailureKind::Handler),
            Err(_) => (
                BehaviorError::retryable(format!("timed out after {}ms", timeout.as_millis()))
                    .with_type("TIMEOUT"),
                FailureKind::Timeout,
            ),
        };

        if error.retryable
            && policy.should_retry(error.error_type.as_deref())
            && policy.has_attempts_remaining(step.attempt)
        {
            let attempt = step.attempt + 1;
            let due_at = policy.next_attempt_at(attempt, self.timers.now());
            warn!(
                behavior = %config.behavior,
                error = %error,
                next_attempt = attempt,
                %due_at,
                "behavior failed, retrying"
            );
            self.store
                .retry_step(step.id, due_at, &error.to_string(), self.timers.now())
                .await?;
            return Ok(StepOutcome::Retrying { attempt, due_at });
        }

        error!(behavior = %config.behavior, error = %error, "behavior failed permanently");
        self.fail(Some(def), step, StepFailure::new(kind, error.to_string()))
            .await
    }

    async fn run_loop(
        &self,
        def: &WorkflowDefinition,
        step: &StepInstance,
        config: &LoopConfig,
        view: &Map<String, Value>,
    ) -> Result<StepOutcome, ExecutorError> {
        let items = match resolve_path(view, &config.array_path) {
            Some(Value::Array(items)) => items.clone(),
            Some(other) => {
                let failure = StepFailure::new(
                    FailureKind::Handler,
                    format!("{} is not an array: {other}", config.array_path),
                );
                return self.fail(Some(def), step, failure).await;
            }
            None => {
                let failure = StepFailure::new(
                    FailureKind::Handler,
                    format!("{} does not resolve", config.array_path),
                );
                return self.fail(Some(def), step, failure).await;
            }
        };

        let total = u32::try_from(items.len()).unwrap_or(u32::MAX);
        let output = json!({ "total": total, "spawned": total.min(config.max_iterations) });
        let scope = successor_scope(step, &output);
        let cursor = LoopCursor::open(
            step.run_id,
            step.node_id.clone(),
            step.branch.clone(),
            total,
            config.max_iterations,
            scope.clone(),
            self.timers.now(),
        );
        if total > config.max_iterations {
            info!(total, limit = config.max_iterations, "loop truncated at iteration limit");
        }

        let mut routes = loop_item_routes(
            def,
            &step.node_id,
            &step.branch,
            &step.scope,
            &items,
            cursor.index,
        );
        if cursor.is_closed() {
            routes.extend(routes_for(
                def,
                &step.node_id,
                handles::COMPLETED,
                &step.branch,
                &scope,
            ));
        }

        let spawned = cursor.index;
        let completion = StepCompletion {
            output,
            routes,
            open_loop: Some(cursor),
        };
        let outcome = self
            .store
            .complete_step(step.id, completion, self.timers.now())
            .await?;
        let CompletionOutcome::Completed(applied) = outcome else {
            return Ok(StepOutcome::Skipped {
                reason: SkipReason::AlreadyFinished,
            });
        };

        // Items whose each_item handle has no successors drain immediately
        for index in 0..spawned {
            self.settle(def, step.run_id, step.branch.child(&step.node_id, index))
                .await?;
        }
        self.settle(def, step.run_id, step.branch.clone()).await?;

        Ok(StepOutcome::Completed {
            enqueued: applied.enqueued,
        })
    }

    async fn run_delay(
        &self,
        def: &WorkflowDefinition,
        step: &StepInstance,
        config: &DelayConfig,
    ) -> Result<StepOutcome, ExecutorError> {
        let now = self.timers.now();
        let wake_at = match step.wake_at {
            Some(wake_at) => wake_at,
            None => {
                let delay = chrono::Duration::milliseconds(
                    i64::try_from(config.duration_ms).unwrap_or(i64::MAX),
                );
                let wake_at = now.checked_add_signed(delay).unwrap_or(now);
                self.timers.schedule_wake(step.id, wake_at).await?;
                debug!(%wake_at, "delay armed");
                return Ok(StepOutcome::Waiting { wake_at });
            }
        };

        if now < wake_at {
            // Released early (clock skew between sweeper and worker)
            self.timers.schedule_wake(step.id, wake_at).await?;
            return Ok(StepOutcome::Waiting { wake_at });
        }

        self.complete(def, step, json!({ "waited_until": wake_at }), handles::OUT)
            .await
    }

    /// Record a successful step and route through `handle`
    async fn complete(
        &self,
        def: &WorkflowDefinition,
        step: &StepInstance,
        output: Value,
        handle: &str,
    ) -> Result<StepOutcome, ExecutorError> {
        let scope = successor_scope(step, &output);
        let routes = routes_for(def, &step.node_id, handle, &step.branch, &scope);
        let completion = StepCompletion {
            output,
            routes,
            open_loop: None,
        };

        match self
            .store
            .complete_step(step.id, completion, self.timers.now())
            .await?
        {
            CompletionOutcome::Completed(applied) => {
                debug!(
                    handle,
                    enqueued = applied.enqueued.len(),
                    waiting = applied.waiting,
                    "step completed"
                );
                self.settle(def, step.run_id, step.branch.clone()).await?;
                Ok(StepOutcome::Completed {
                    enqueued: applied.enqueued,
                })
            }
            CompletionOutcome::AlreadyFinished => Ok(StepOutcome::Skipped {
                reason: SkipReason::AlreadyFinished,
            }),
        }
    }

    async fn fail(
        &self,
        def: Option<&WorkflowDefinition>,
        step: &StepInstance,
        failure: StepFailure,
    ) -> Result<StepOutcome, ExecutorError> {
        let kind = failure.kind;
        let recorded = self
            .store
            .fail_step(step.id, failure, self.timers.now())
            .await?;
        if !recorded {
            return Ok(StepOutcome::Skipped {
                reason: SkipReason::AlreadyFinished,
            });
        }

        warn!(?kind, "step failed, branch halted");
        match def {
            Some(def) => self.settle(def, step.run_id, step.branch.clone()).await?,
            None => self.finalize(step.run_id).await?,
        }
        Ok(StepOutcome::Failed { kind })
    }

    /// Close out drained loop items from `branch` upwards, then finalize
    /// the run if nothing is left
    ///
    /// A loop's `completed` routes fire once every spawned item branch has
    /// no active steps and no open nested loops. Exactly one caller wins
    /// the completion claim, so racing workers never route it twice.
    async fn settle(
        &self,
        def: &WorkflowDefinition,
        run_id: Uuid,
        mut branch: BranchPath,
    ) -> Result<(), ExecutorError> {
        while let Some(frame) = branch.innermost() {
            if self.store.count_active_work(run_id, &branch).await? > 0 {
                return Ok(());
            }

            let progress = self
                .store
                .finish_loop_item(
                    run_id,
                    &frame.loop_node,
                    &frame.parent,
                    frame.index,
                    self.timers.now(),
                )
                .await?;
            if !progress.claimed_completion {
                return Ok(());
            }

            self.close_loop(def, &progress.cursor).await?;
            branch = frame.parent;
        }

        self.finalize(run_id).await
    }

    /// Route a claimed loop's `completed` handle and close its cursor
    async fn close_loop(
        &self,
        def: &WorkflowDefinition,
        cursor: &LoopCursor,
    ) -> Result<(), ExecutorError> {
        let routes: Vec<Route> = routes_for(
            def,
            &cursor.node_id,
            handles::COMPLETED,
            &cursor.branch,
            &cursor.scope,
        );
        let applied = self
            .store
            .close_loop(
                cursor.run_id,
                &cursor.node_id,
                &cursor.branch,
                routes,
                self.timers.now(),
            )
            .await?;
        info!(
            run_id = %cursor.run_id,
            loop_node = %cursor.node_id,
            items = cursor.index,
            enqueued = applied.enqueued.len(),
            "loop completed"
        );
        Ok(())
    }

    /// Settle a run whose worker stopped after recording a step outcome
    /// but before settling it
    ///
    /// Drained item branches are marked finished, loops left in
    /// `completing` are closed, and the run is finalized if nothing is
    /// left. Safe to call while a live worker settles the same run.
    #[instrument(skip(self))]
    pub async fn resettle(&self, run_id: Uuid) -> Result<(), ExecutorError> {
        let run = self.store.get_run(run_id).await?;
        if run.status.is_terminal() {
            return Ok(());
        }
        let def = match self.store.get_definition(run.definition_id).await {
            Ok(def) => def,
            Err(StoreError::DefinitionNotFound(_)) => return self.finalize(run_id).await,
            Err(e) => return Err(e.into()),
        };

        let mut open: Vec<LoopCursor> = self
            .store
            .list_loop_cursors(run_id)
            .await?
            .into_iter()
            .filter(|c| !c.is_closed())
            .collect();
        // innermost first so a nested completion can drain its enclosing item
        open.sort_by_key(|c| std::cmp::Reverse(c.branch.depth()));

        for cursor in open {
            if cursor.state == LoopState::Completing {
                self.close_loop(&def, &cursor).await?;
                self.settle(&def, run_id, cursor.branch.clone()).await?;
                continue;
            }
            for index in (0..cursor.index).filter(|i| !cursor.finished.contains(i)) {
                self.settle(&def, run_id, cursor.item_branch(index)).await?;
            }
        }

        self.finalize(run_id).await
    }

    async fn finalize(&self, run_id: Uuid) -> Result<(), ExecutorError> {
        if let Some(status) = self
            .store
            .finalize_run_if_drained(run_id, self.timers.now())
            .await?
        {
            info!(%run_id, %status, "run finished");
        }
        Ok(())
    }
}
