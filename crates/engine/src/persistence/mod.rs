//! Persistence layer for workflow execution
//!
//! This module provides:
//! - [`WorkflowStore`] trait for definitions, runs, steps and timers
//! - [`InMemoryWorkflowStore`] for testing and dev mode
//! - [`PostgresWorkflowStore`] for production

mod memory;
mod postgres;
mod store;

pub use memory::InMemoryWorkflowStore;
pub use postgres::PostgresWorkflowStore;
pub use store::{
    CompletionOutcome, CreateRunOutcome, DefinitionFilter, PurgeReport, StepCompletion,
    StoreError, WorkflowStore,
};

/// Apply the embedded schema migrations
pub async fn migrate(pool: &sqlx::PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}
