//! # Flowline Engine
//!
//! Durable execution for visual-builder workflow graphs.
//!
//! ## Features
//!
//! - **Idempotent dispatch**: one run per matching definition and event key
//! - **Durable steps**: every step outcome and its successors commit together
//! - **Fan-out and fan-in**: conditional, A/B split, merge and loop nodes
//! - **Database timers**: delays, retry backoff and cron triggers survive restarts
//! - **Credit metering**: actions are charged once per step identity
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌───────────────────────────────────────┐
//! │ RunDispatcher│──▶│            WorkflowStore              │
//! │ (events,cron)│   │ (PostgreSQL: runs, steps, merges,     │
//! └──────────────┘   │  loop cursors, effects, schedules)    │
//!                    └───────────────────────────────────────┘
//!                          ▲                     ▲
//!                          │                     │
//! ┌────────────────────────┴──────┐   ┌──────────┴──────────┐
//! │          WorkerPool           │   │       Sweeper        │
//! │ StepExecutor + Coordinator    │   │ timers, cron, stale, │
//! │ MeteringGate, BehaviorRegistry│   │ retention            │
//! └───────────────────────────────┘   └─────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use flowline_engine::prelude::*;
//!
//! let mut behaviors = BehaviorRegistry::new();
//! behaviors.register_fn("send_email", |ctx| async move {
//!     let to = ctx.param_str("to").unwrap_or_default().to_string();
//!     Ok(json!({ "sent_to": to }))
//! });
//!
//! let engine = Engine::builder(Arc::new(InMemoryWorkflowStore::new()))
//!     .behaviors(behaviors)
//!     .build();
//!
//! let def = engine.definitions().create(NewDefinition { org_id, name }).await?;
//! engine.definitions().save(def.id, graph).await?;
//! engine.definitions().set_status(def.id, DefinitionStatus::Active).await?;
//!
//! engine.dispatch(&TriggerEvent::new("form_submitted", payload)).await?;
//! engine.run_until_idle().await?;
//! ```

pub mod behavior;
pub mod context;
pub mod definition;
pub mod engine;
pub mod metering;
pub mod persistence;
pub mod records;
pub mod reliability;
pub mod run;
pub mod timer;
pub mod worker;

/// Prelude for common imports
pub mod prelude {
    pub use crate::behavior::{Behavior, BehaviorContext, BehaviorError, BehaviorRegistry};
    pub use crate::definition::{
        Condition, DefinitionGraph, DefinitionStatus, Edge, MergeStrategy, NewDefinition, Node,
        NodeKind, TriggerSpec, WorkflowDefinition,
    };
    pub use crate::engine::{
        Engine, EngineBuilder, EngineError, ExecutorConfig, RunReport, StepOutcome, TriggerEvent,
    };
    pub use crate::metering::{CreditLedger, InMemoryCreditLedger, PostgresCreditLedger};
    pub use crate::persistence::{
        InMemoryWorkflowStore, PostgresWorkflowStore, StoreError, WorkflowStore,
    };
    pub use crate::reliability::RetryPolicy;
    pub use crate::run::{BranchPath, RunStatus, StepState, WorkflowRun};
    pub use crate::timer::{Clock, ManualClock, SystemClock};
    pub use crate::worker::{Sweeper, SweeperConfig, WorkerPool, WorkerPoolConfig};
}

// Re-export key types at crate root
pub use behavior::{Behavior, BehaviorContext, BehaviorError, BehaviorRegistry};
pub use definition::{DefinitionStatus, WorkflowDefinition};
pub use engine::{Engine, EngineBuilder, EngineError, ExecutorConfig, TriggerEvent};
pub use metering::{CreditLedger, InMemoryCreditLedger, PostgresCreditLedger};
pub use persistence::{InMemoryWorkflowStore, PostgresWorkflowStore, StoreError, WorkflowStore};
pub use reliability::RetryPolicy;
pub use run::{RunStatus, WorkflowRun};
pub use worker::{Sweeper, SweeperConfig, WorkerPool, WorkerPoolConfig, WorkerPoolError};
