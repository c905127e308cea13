//! Shared fixtures for engine integration tests

#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use chrono::{TimeZone, Utc};
use serde_json::{json, Value};
use uuid::Uuid;

use flowline_engine::prelude::*;
use flowline_engine::run::StepInstance;

pub const ORG: &str = "org-test";

/// Counts invocations of a behavior
#[derive(Clone, Default)]
pub struct Spy {
    calls: Arc<AtomicU32>,
}

impl Spy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Register `name` as a behavior that echoes its params
    pub fn register(&self, behaviors: &mut BehaviorRegistry, name: &str) {
        let calls = self.calls.clone();
        behaviors.register_fn(name, move |ctx| {
            let calls = calls.clone();
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                Ok(json!({ "call": n, "params": ctx.params }))
            }
        });
    }

    /// Register `name` as a behavior failing retryably for the first
    /// `failures` calls
    pub fn register_flaky(&self, behaviors: &mut BehaviorRegistry, name: &str, failures: u32) {
        let calls = self.calls.clone();
        behaviors.register_fn(name, move |_ctx| {
            let calls = calls.clone();
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n <= failures {
                    Err(BehaviorError::retryable(format!("attempt {n} failed")))
                } else {
                    Ok(json!({ "call": n }))
                }
            }
        });
    }
}

pub struct TestEngine {
    pub engine: Engine,
    pub store: Arc<InMemoryWorkflowStore>,
    pub clock: Arc<ManualClock>,
    pub ledger: Arc<InMemoryCreditLedger>,
}

impl TestEngine {
    /// Engine over a fresh store with a manual clock and `credits` per org
    pub fn new(behaviors: BehaviorRegistry, credits: u64) -> Self {
        let store = Arc::new(InMemoryWorkflowStore::new());
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap(),
        ));
        let ledger = Arc::new(InMemoryCreditLedger::with_default_balance(credits));
        Self::on(store, clock, ledger, behaviors)
    }

    /// Engine over existing state, as after a process restart
    pub fn on(
        store: Arc<InMemoryWorkflowStore>,
        clock: Arc<ManualClock>,
        ledger: Arc<InMemoryCreditLedger>,
        behaviors: BehaviorRegistry,
    ) -> Self {
        let engine = Engine::builder(store.clone())
            .behaviors(behaviors)
            .clock(clock.clone())
            .ledger(ledger.clone())
            .executor_config(ExecutorConfig::default().with_worker_id("test-worker"))
            .build();
        Self {
            engine,
            store,
            clock,
            ledger,
        }
    }

    /// Create, save and activate a definition
    pub async fn activate(
        &self,
        nodes: Vec<Node>,
        edges: Vec<Edge>,
        triggers: Vec<TriggerSpec>,
    ) -> WorkflowDefinition {
        let definitions = self.engine.definitions();
        let def = definitions
            .create(NewDefinition {
                org_id: ORG.into(),
                name: "test workflow".into(),
            })
            .await
            .unwrap();
        definitions
            .save(
                def.id,
                DefinitionGraph {
                    nodes,
                    edges,
                    triggers,
                },
            )
            .await
            .unwrap();
        definitions
            .set_status(def.id, DefinitionStatus::Active)
            .await
            .unwrap()
    }

    /// Dispatch an event and return the single run it created
    pub async fn start(&self, event_kind: &str, payload: Value) -> Uuid {
        let outcome = self
            .engine
            .dispatch(&TriggerEvent::new(event_kind, payload))
            .await
            .unwrap();
        assert_eq!(outcome.runs.len(), 1, "expected exactly one matching definition");
        outcome.runs[0].run_id
    }

    pub async fn run(&self, run_id: Uuid) -> WorkflowRun {
        self.store.get_run(run_id).await.unwrap()
    }

    pub async fn steps_for(&self, run_id: Uuid, node_id: &str) -> Vec<StepInstance> {
        self.store
            .list_steps(run_id)
            .await
            .unwrap()
            .into_iter()
            .filter(|s| s.node_id == node_id)
            .collect()
    }

    pub async fn step_for(&self, run_id: Uuid, node_id: &str) -> StepInstance {
        let mut steps = self.steps_for(run_id, node_id).await;
        assert_eq!(steps.len(), 1, "expected one `{node_id}` step");
        steps.remove(0)
    }
}
