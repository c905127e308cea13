//! PostgreSQL implementation of WorkflowStore
//!
//! Production persistence using PostgreSQL with:
//! - One transaction per state transition (step outcome + context + routes)
//! - Step claiming with SKIP LOCKED
//! - Unique (run_id, node_id, branch) keys for idempotent enqueueing

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, PgPool, Row};
use tracing::{debug, error, instrument};
use uuid::Uuid;

use super::store::*;
use crate::definition::WorkflowDefinition;
use crate::run::{
    AppliedRoutes, BranchPath, LoopCursor, LoopProgress, LoopState, MergeArrival, MergeDecision,
    MergeWaitSet, NewStep, Route, RunStatus, StepFailure, StepInstance, StepKey, WorkflowRun,
};
use crate::timer::ScheduleTrigger;

const DEFINITION_COLUMNS: &str =
    "id, org_id, name, version, status, nodes, edges, triggers, created_at, updated_at";

const RUN_COLUMNS: &str = "id, definition_id, org_id, trigger_node_id, event_kind, \
     idempotency_key, status, context, created_at, updated_at, finished_at, purged_at";

const STEP_COLUMNS: &str = "id, run_id, node_id, branch, attempt, state, due_at, wake_at, \
     scope, output, failure, last_error, claimed_by, claimed_at, created_at, updated_at";

const MERGE_COLUMNS: &str = "run_id, node_id, branch, inputs, arrived, fired, updated_at";

const CURSOR_COLUMNS: &str = "run_id, node_id, branch, total, spawned, max_iterations, \
     finished, state, scope, updated_at";

/// Matches `branch` against the path bound at `$2` (the branch itself or
/// any branch nested inside it)
const BRANCH_SCOPE: &str =
    "($2 = '' OR branch = $2 OR left(branch, length($2) + 1) = $2 || '/')";

/// PostgreSQL implementation of WorkflowStore
///
/// # Example
///
/// ```ignore
/// use flowline_engine::PostgresWorkflowStore;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://localhost/flowline").await?;
/// flowline_engine::persistence::migrate(&pool).await?;
/// let store = PostgresWorkflowStore::new(pool);
/// ```
#[derive(Clone)]
pub struct PostgresWorkflowStore {
    pool: PgPool,
}

impl PostgresWorkflowStore {
    /// Create a new PostgreSQL store with the given connection pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn database(err: sqlx::Error) -> StoreError {
    StoreError::Database(err.to_string())
}

// =============================================================================
// Row mapping
// =============================================================================

fn definition_from_row(row: &PgRow) -> Result<WorkflowDefinition, StoreError> {
    let status: String = row.get("status");
    Ok(WorkflowDefinition {
        id: row.get("id"),
        org_id: row.get("org_id"),
        name: row.get("name"),
        version: row.get::<i32, _>("version") as u32,
        status: status.parse().map_err(StoreError::Serialization)?,
        nodes: serde_json::from_value(row.get("nodes"))?,
        edges: serde_json::from_value(row.get("edges"))?,
        triggers: serde_json::from_value(row.get("triggers"))?,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn run_from_row(row: &PgRow) -> Result<WorkflowRun, StoreError> {
    let status: String = row.get("status");
    Ok(WorkflowRun {
        id: row.get("id"),
        definition_id: row.get("definition_id"),
        org_id: row.get("org_id"),
        trigger_node_id: row.get("trigger_node_id"),
        event_kind: row.get("event_kind"),
        idempotency_key: row.get("idempotency_key"),
        status: status.parse().map_err(StoreError::Serialization)?,
        context: json_object(row.get("context"))?,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        finished_at: row.get("finished_at"),
        purged_at: row.get("purged_at"),
    })
}

fn step_from_row(row: &PgRow) -> Result<StepInstance, StoreError> {
    let state: String = row.get("state");
    let failure: Option<Value> = row.get("failure");
    Ok(StepInstance {
        id: row.get("id"),
        run_id: row.get("run_id"),
        node_id: row.get("node_id"),
        branch: BranchPath::from_raw(row.get::<String, _>("branch")),
        attempt: row.get::<i32, _>("attempt") as u32,
        state: state.parse().map_err(StoreError::Serialization)?,
        due_at: row.get("due_at"),
        wake_at: row.get("wake_at"),
        scope: json_object(row.get("scope"))?,
        output: row.get("output"),
        failure: failure.map(serde_json::from_value).transpose()?,
        last_error: row.get("last_error"),
        claimed_by: row.get("claimed_by"),
        claimed_at: row.get("claimed_at"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn merge_from_row(row: &PgRow) -> Result<MergeWaitSet, StoreError> {
    let arrived: BTreeSet<String> = serde_json::from_value(row.get("arrived"))?;
    Ok(MergeWaitSet {
        run_id: row.get("run_id"),
        node_id: row.get("node_id"),
        branch: BranchPath::from_raw(row.get::<String, _>("branch")),
        inputs: serde_json::from_value(row.get("inputs"))?,
        arrived,
        fired: row.get("fired"),
        updated_at: row.get("updated_at"),
    })
}

fn cursor_from_row(row: &PgRow) -> Result<LoopCursor, StoreError> {
    let state: String = row.get("state");
    Ok(LoopCursor {
        run_id: row.get("run_id"),
        node_id: row.get("node_id"),
        branch: BranchPath::from_raw(row.get::<String, _>("branch")),
        total: row.get::<i32, _>("total") as u32,
        index: row.get::<i32, _>("spawned") as u32,
        max_iterations: row.get::<i32, _>("max_iterations") as u32,
        finished: serde_json::from_value(row.get("finished"))?,
        state: LoopState::parse(&state)
            .ok_or_else(|| StoreError::Serialization(format!("unknown loop state: {state}")))?,
        scope: json_object(row.get("scope"))?,
        updated_at: row.get("updated_at"),
    })
}

fn schedule_from_row(row: &PgRow) -> ScheduleTrigger {
    ScheduleTrigger {
        definition_id: row.get("definition_id"),
        node_id: row.get("node_id"),
        cron: row.get("cron"),
        next_fire_at: row.get("next_fire_at"),
        last_fired_at: row.get("last_fired_at"),
    }
}

fn json_object(value: Value) -> Result<Map<String, Value>, StoreError> {
    match value {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(Map::new()),
        other => Err(StoreError::Serialization(format!(
            "expected JSON object, got {other}"
        ))),
    }
}

// =============================================================================
// Transaction helpers
// =============================================================================

async fn insert_step(
    conn: &mut PgConnection,
    run_id: Uuid,
    new: NewStep,
    now: DateTime<Utc>,
) -> Result<Option<Uuid>, StoreError> {
    let row = sqlx::query(
        r#"
        INSERT INTO flowline_steps (id, run_id, node_id, branch, attempt, state, scope, created_at, updated_at)
        VALUES ($1, $2, $3, $4, 1, 'pending', $5, $6, $6)
        ON CONFLICT (run_id, node_id, branch) DO NOTHING
        RETURNING id
        "#,
    )
    .bind(Uuid::now_v7())
    .bind(run_id)
    .bind(&new.node_id)
    .bind(new.branch.as_str())
    .bind(Value::Object(new.scope))
    .bind(now)
    .fetch_optional(&mut *conn)
    .await
    .map_err(database)?;

    Ok(row.map(|r| r.get("id")))
}

async fn record_merge_arrival(
    conn: &mut PgConnection,
    run_id: Uuid,
    arrival: &MergeArrival,
    now: DateTime<Utc>,
) -> Result<MergeDecision, StoreError> {
    let (node_id, branch) = (&arrival.step.node_id, &arrival.step.branch);
    sqlx::query(
        r#"
        INSERT INTO flowline_merge_wait_sets (run_id, node_id, branch, inputs, updated_at)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (run_id, node_id, branch) DO NOTHING
        "#,
    )
    .bind(run_id)
    .bind(node_id)
    .bind(branch.as_str())
    .bind(serde_json::to_value(&arrival.inputs)?)
    .bind(now)
    .execute(&mut *conn)
    .await
    .map_err(database)?;

    let sql = format!(
        "SELECT {MERGE_COLUMNS} FROM flowline_merge_wait_sets \
         WHERE run_id = $1 AND node_id = $2 AND branch = $3 FOR UPDATE"
    );
    let row = sqlx::query(&sql)
        .bind(run_id)
        .bind(node_id)
        .bind(branch.as_str())
        .fetch_one(&mut *conn)
        .await
        .map_err(database)?;

    let mut set = merge_from_row(&row)?;
    let decision = set.record(&arrival.handle, arrival.strategy, now);
    if decision != MergeDecision::Drop {
        sqlx::query(
            r#"
            UPDATE flowline_merge_wait_sets
            SET arrived = $4, fired = $5, updated_at = $6
            WHERE run_id = $1 AND node_id = $2 AND branch = $3
            "#,
        )
        .bind(run_id)
        .bind(node_id)
        .bind(branch.as_str())
        .bind(serde_json::to_value(&set.arrived)?)
        .bind(set.fired)
        .bind(now)
        .execute(&mut *conn)
        .await
        .map_err(database)?;
    }
    Ok(decision)
}

async fn apply_routes(
    conn: &mut PgConnection,
    run_id: Uuid,
    routes: Vec<Route>,
    now: DateTime<Utc>,
) -> Result<AppliedRoutes, StoreError> {
    let mut applied = AppliedRoutes::default();
    for route in routes {
        let to_insert = match route {
            Route::Step(new) => Some(new),
            Route::Merge(arrival) => {
                match record_merge_arrival(conn, run_id, &arrival, now).await? {
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
            match insert_step(conn, run_id, new, now).await? {
                Some(id) => applied.enqueued.push(id),
                None => applied.deduplicated += 1,
            }
        }
    }
    Ok(applied)
}

/// Running while any step is ready or executing, waiting while only timers
/// remain. Terminal runs are left alone.
async fn refresh_run_status(
    conn: &mut PgConnection,
    run_id: Uuid,
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        UPDATE flowline_runs r
        SET status = s.next, updated_at = $2
        FROM (
            SELECT CASE
                WHEN bool_or(state IN ('pending', 'executing')) THEN 'running'
                WHEN bool_or(state = 'scheduled') THEN 'waiting'
            END AS next
            FROM flowline_steps
            WHERE run_id = $1
        ) s
        WHERE r.id = $1
          AND s.next IS NOT NULL
          AND r.status IN ('running', 'waiting')
          AND r.status <> s.next
        "#,
    )
    .bind(run_id)
    .bind(now)
    .execute(&mut *conn)
    .await
    .map_err(database)?;
    Ok(())
}

async fn lock_run_status(conn: &mut PgConnection, run_id: Uuid) -> Result<RunStatus, StoreError> {
    let row = sqlx::query("SELECT status FROM flowline_runs WHERE id = $1 FOR UPDATE")
        .bind(run_id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(database)?
        .ok_or(StoreError::RunNotFound(run_id))?;
    let status: String = row.get("status");
    status.parse().map_err(StoreError::Serialization)
}

async fn active_work(
    conn: &mut PgConnection,
    run_id: Uuid,
    branch: &BranchPath,
) -> Result<usize, StoreError> {
    let sql = format!(
        r#"
        SELECT
            (SELECT COUNT(*) FROM flowline_steps
             WHERE run_id = $1 AND state IN ('pending', 'scheduled', 'executing') AND {BRANCH_SCOPE})
          + (SELECT COUNT(*) FROM flowline_loop_cursors
             WHERE run_id = $1 AND state <> 'closed' AND {BRANCH_SCOPE}) AS active
        "#
    );
    let row = sqlx::query(&sql)
        .bind(run_id)
        .bind(branch.as_str())
        .fetch_one(&mut *conn)
        .await
        .map_err(database)?;
    Ok(row.get::<i64, _>("active") as usize)
}

/// Lock a step row for update
async fn lock_step(conn: &mut PgConnection, step_id: Uuid) -> Result<StepInstance, StoreError> {
    let sql = format!("SELECT {STEP_COLUMNS} FROM flowline_steps WHERE id = $1 FOR UPDATE");
    let row = sqlx::query(&sql)
        .bind(step_id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(database)?
        .ok_or(StoreError::StepNotFound(step_id))?;
    step_from_row(&row)
}

async fn lock_cursor(
    conn: &mut PgConnection,
    run_id: Uuid,
    loop_node: &str,
    branch: &BranchPath,
) -> Result<LoopCursor, StoreError> {
    let sql = format!(
        "SELECT {CURSOR_COLUMNS} FROM flowline_loop_cursors \
         WHERE run_id = $1 AND node_id = $2 AND branch = $3 FOR UPDATE"
    );
    let row = sqlx::query(&sql)
        .bind(run_id)
        .bind(loop_node)
        .bind(branch.as_str())
        .fetch_optional(&mut *conn)
        .await
        .map_err(database)?
        .ok_or_else(|| StoreError::LoopNotFound {
            run_id,
            node_id: loop_node.to_string(),
            branch: branch.clone(),
        })?;
    cursor_from_row(&row)
}

async fn save_cursor(conn: &mut PgConnection, cursor: &LoopCursor) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        UPDATE flowline_loop_cursors
        SET finished = $4, state = $5, updated_at = $6
        WHERE run_id = $1 AND node_id = $2 AND branch = $3
        "#,
    )
    .bind(cursor.run_id)
    .bind(&cursor.node_id)
    .bind(cursor.branch.as_str())
    .bind(serde_json::to_value(&cursor.finished)?)
    .bind(cursor.state.as_str())
    .bind(cursor.updated_at)
    .execute(&mut *conn)
    .await
    .map_err(database)?;
    Ok(())
}

#[async_trait]
impl WorkflowStore for PostgresWorkflowStore {
    // =========================================================================
    // Definitions
    // =========================================================================

    #[instrument(skip(self, def), fields(definition_id = %def.id))]
    async fn insert_definition(&self, def: &WorkflowDefinition) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO flowline_definitions (id, org_id, name, version, status, nodes, edges, triggers, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(def.id)
        .bind(&def.org_id)
        .bind(&def.name)
        .bind(def.version as i32)
        .bind(def.status.as_str())
        .bind(serde_json::to_value(&def.nodes)?)
        .bind(serde_json::to_value(&def.edges)?)
        .bind(serde_json::to_value(&def.triggers)?)
        .bind(def.created_at)
        .bind(def.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to insert definition: {}", e);
            database(e)
        })?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Conflict(format!("definition {} exists", def.id)));
        }
        Ok(())
    }

    #[instrument(skip(self, def), fields(definition_id = %def.id))]
    async fn update_definition(&self, def: &WorkflowDefinition) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE flowline_definitions
            SET name = $2, version = $3, status = $4, nodes = $5, edges = $6, triggers = $7, updated_at = $8
            WHERE id = $1
            "#,
        )
        .bind(def.id)
        .bind(&def.name)
        .bind(def.version as i32)
        .bind(def.status.as_str())
        .bind(serde_json::to_value(&def.nodes)?)
        .bind(serde_json::to_value(&def.edges)?)
        .bind(serde_json::to_value(&def.triggers)?)
        .bind(def.updated_at)
        .execute(&self.pool)
        .await
        .map_err(database)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::DefinitionNotFound(def.id));
        }
        Ok(())
    }

    async fn get_definition(&self, id: Uuid) -> Result<WorkflowDefinition, StoreError> {
        let sql = format!("SELECT {DEFINITION_COLUMNS} FROM flowline_definitions WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(database)?
            .ok_or(StoreError::DefinitionNotFound(id))?;
        definition_from_row(&row)
    }

    async fn list_definitions(
        &self,
        filter: &DefinitionFilter,
    ) -> Result<Vec<WorkflowDefinition>, StoreError> {
        let sql = format!(
            "SELECT {DEFINITION_COLUMNS} FROM flowline_definitions \
             WHERE ($1::text IS NULL OR org_id = $1) AND ($2::text IS NULL OR status = $2) \
             ORDER BY id"
        );
        let rows = sqlx::query(&sql)
            .bind(filter.org_id.as_deref())
            .bind(filter.status.map(|s| s.as_str()))
            .fetch_all(&self.pool)
            .await
            .map_err(database)?;
        rows.iter().map(definition_from_row).collect()
    }

    async fn active_definitions_for_event(
        &self,
        event_kind: &str,
    ) -> Result<Vec<WorkflowDefinition>, StoreError> {
        let sql = format!(
            "SELECT {DEFINITION_COLUMNS} FROM flowline_definitions \
             WHERE status = 'active' \
               AND triggers @> jsonb_build_array(jsonb_build_object('type', 'event', 'event_kind', $1::text)) \
             ORDER BY id"
        );
        let rows = sqlx::query(&sql)
            .bind(event_kind)
            .fetch_all(&self.pool)
            .await
            .map_err(database)?;
        rows.iter().map(definition_from_row).collect()
    }

    // =========================================================================
    // Runs
    // =========================================================================

    #[instrument(skip(self, run, routes), fields(run_id = %run.id))]
    async fn create_run(
        &self,
        run: &WorkflowRun,
        routes: Vec<Route>,
    ) -> Result<CreateRunOutcome, StoreError> {
        let mut tx = self.pool.begin().await.map_err(database)?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO flowline_runs (
                id, definition_id, org_id, trigger_node_id, event_kind, idempotency_key,
                status, context, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $9)
            ON CONFLICT (definition_id, idempotency_key) WHERE idempotency_key IS NOT NULL DO NOTHING
            RETURNING id
            "#,
        )
        .bind(run.id)
        .bind(run.definition_id)
        .bind(&run.org_id)
        .bind(&run.trigger_node_id)
        .bind(&run.event_kind)
        .bind(&run.idempotency_key)
        .bind(run.status.as_str())
        .bind(Value::Object(run.context.clone()))
        .bind(run.created_at)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| {
            error!("Failed to create run: {}", e);
            database(e)
        })?;

        if inserted.is_none() {
            let row = sqlx::query(
                "SELECT id FROM flowline_runs WHERE definition_id = $1 AND idempotency_key = $2",
            )
            .bind(run.definition_id)
            .bind(&run.idempotency_key)
            .fetch_one(&mut *tx)
            .await
            .map_err(database)?;
            tx.rollback().await.map_err(database)?;
            return Ok(CreateRunOutcome::Duplicate {
                run_id: row.get("id"),
            });
        }

        let applied = apply_routes(&mut *tx, run.id, routes, run.created_at).await?;
        refresh_run_status(&mut *tx, run.id, run.created_at).await?;

        let sql = format!("SELECT {RUN_COLUMNS} FROM flowline_runs WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(run.id)
            .fetch_one(&mut *tx)
            .await
            .map_err(database)?;
        let created = run_from_row(&row)?;

        tx.commit().await.map_err(database)?;
        debug!(run_id = %run.id, enqueued = applied.enqueued.len(), "created run");
        Ok(CreateRunOutcome::Created {
            run: created,
            applied,
        })
    }

    async fn get_run(&self, run_id: Uuid) -> Result<WorkflowRun, StoreError> {
        let sql = format!("SELECT {RUN_COLUMNS} FROM flowline_runs WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(database)?
            .ok_or(StoreError::RunNotFound(run_id))?;
        run_from_row(&row)
    }

    #[instrument(skip(self))]
    async fn cancel_run(&self, run_id: Uuid, now: DateTime<Utc>) -> Result<WorkflowRun, StoreError> {
        let mut tx = self.pool.begin().await.map_err(database)?;

        let status = lock_run_status(&mut *tx, run_id).await?;
        if !status.is_terminal() {
            sqlx::query(
                r#"
                UPDATE flowline_runs
                SET status = 'cancelled', finished_at = $2, updated_at = $2
                WHERE id = $1
                "#,
            )
            .bind(run_id)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(database)?;

            sqlx::query(
                r#"
                UPDATE flowline_steps
                SET state = 'cancelled', updated_at = $2
                WHERE run_id = $1 AND state IN ('pending', 'scheduled')
                "#,
            )
            .bind(run_id)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(database)?;
        }

        let sql = format!("SELECT {RUN_COLUMNS} FROM flowline_runs WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(run_id)
            .fetch_one(&mut *tx)
            .await
            .map_err(database)?;
        let run = run_from_row(&row)?;

        tx.commit().await.map_err(database)?;
        Ok(run)
    }

    async fn finalize_run_if_drained(
        &self,
        run_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<RunStatus>, StoreError> {
        let mut tx = self.pool.begin().await.map_err(database)?;

        let status = lock_run_status(&mut *tx, run_id).await?;
        if status.is_terminal() || active_work(&mut *tx, run_id, &BranchPath::root()).await? > 0 {
            return Ok(None);
        }

        let sql = format!(
            "SELECT {MERGE_COLUMNS} FROM flowline_merge_wait_sets WHERE run_id = $1 AND NOT fired"
        );
        let stalled = sqlx::query(&sql)
            .bind(run_id)
            .fetch_all(&mut *tx)
            .await
            .map_err(database)?;
        for row in &stalled {
            let set = merge_from_row(row)?;
            let failure = set.incomplete_failure();
            sqlx::query(
                r#"
                INSERT INTO flowline_steps
                    (id, run_id, node_id, branch, attempt, state, failure, last_error, created_at, updated_at)
                VALUES ($1, $2, $3, $4, 1, 'failed', $5, $6, $7, $7)
                ON CONFLICT (run_id, node_id, branch) DO NOTHING
                "#,
            )
            .bind(Uuid::now_v7())
            .bind(run_id)
            .bind(&set.node_id)
            .bind(set.branch.as_str())
            .bind(serde_json::to_value(&failure)?)
            .bind(&failure.message)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(database)?;
        }

        let row = sqlx::query(
            "SELECT EXISTS (SELECT 1 FROM flowline_steps WHERE run_id = $1 AND state = 'failed') AS failed",
        )
        .bind(run_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(database)?;
        let final_status = if row.get::<bool, _>("failed") {
            RunStatus::Failed
        } else {
            RunStatus::Completed
        };

        sqlx::query(
            "UPDATE flowline_runs SET status = $2, finished_at = $3, updated_at = $3 WHERE id = $1",
        )
        .bind(run_id)
        .bind(final_status.as_str())
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(database)?;

        tx.commit().await.map_err(database)?;
        Ok(Some(final_status))
    }

    async fn list_unsettled(&self, limit: usize) -> Result<Vec<Uuid>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT r.id FROM flowline_runs r
            WHERE r.status IN ('running', 'waiting')
              AND (
                NOT EXISTS (
                    SELECT 1 FROM flowline_steps s
                    WHERE s.run_id = r.id AND s.state IN ('pending', 'scheduled', 'executing')
                )
                OR EXISTS (
                    SELECT 1 FROM flowline_loop_cursors c
                    WHERE c.run_id = r.id AND c.state = 'completing'
                )
              )
            ORDER BY r.id
            LIMIT $1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(database)?;
        Ok(rows.iter().map(|r| r.get("id")).collect())
    }

    // =========================================================================
    // Steps
    // =========================================================================

    async fn get_step(&self, step_id: Uuid) -> Result<StepInstance, StoreError> {
        let sql = format!("SELECT {STEP_COLUMNS} FROM flowline_steps WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(step_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(database)?
            .ok_or(StoreError::StepNotFound(step_id))?;
        step_from_row(&row)
    }

    async fn find_step(&self, key: &StepKey) -> Result<Option<StepInstance>, StoreError> {
        let sql = format!(
            "SELECT {STEP_COLUMNS} FROM flowline_steps WHERE run_id = $1 AND node_id = $2 AND branch = $3"
        );
        let row = sqlx::query(&sql)
            .bind(key.run_id)
            .bind(&key.node_id)
            .bind(key.branch.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(database)?;
        row.as_ref().map(step_from_row).transpose()
    }

    async fn list_steps(&self, run_id: Uuid) -> Result<Vec<StepInstance>, StoreError> {
        let sql = format!(
            "SELECT {STEP_COLUMNS} FROM flowline_steps WHERE run_id = $1 ORDER BY created_at, id"
        );
        let rows = sqlx::query(&sql)
            .bind(run_id)
            .fetch_all(&self.pool)
            .await
            .map_err(database)?;
        rows.iter().map(step_from_row).collect()
    }

    #[instrument(skip(self))]
    async fn claim_steps(
        &self,
        worker_id: &str,
        max: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<StepInstance>, StoreError> {
        // SKIP LOCKED lets concurrent workers claim disjoint batches
        let sql = format!(
            r#"
            WITH claimable AS (
                SELECT id
                FROM flowline_steps
                WHERE state = 'pending'
                ORDER BY created_at, id
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE flowline_steps s
            SET state = 'executing',
                claimed_by = $2,
                claimed_at = $3,
                updated_at = $3
            FROM claimable c
            WHERE s.id = c.id
            RETURNING {}
            "#,
            STEP_COLUMNS
                .split(", ")
                .map(|c| format!("s.{c}"))
                .collect::<Vec<_>>()
                .join(", ")
        );
        let rows = sqlx::query(&sql)
            .bind(max as i64)
            .bind(worker_id)
            .bind(now)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to claim steps: {}", e);
                database(e)
            })?;

        let claimed = rows.iter().map(step_from_row).collect::<Result<Vec<_>, _>>()?;
        if !claimed.is_empty() {
            debug!(worker_id, count = claimed.len(), "claimed steps");
        }
        Ok(claimed)
    }

    async fn begin_step(
        &self,
        step_id: Uuid,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<StepInstance>, StoreError> {
        let sql = format!(
            r#"
            UPDATE flowline_steps
            SET state = 'executing', claimed_by = $2, claimed_at = $3, updated_at = $3
            WHERE id = $1 AND state = 'pending'
            RETURNING {STEP_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(step_id)
            .bind(worker_id)
            .bind(now)
            .fetch_optional(&self.pool)
            .await
            .map_err(database)?;

        match row {
            Some(row) => step_from_row(&row).map(Some),
            None => {
                // distinguish "not claimable" from "does not exist"
                self.get_step(step_id).await?;
                Ok(None)
            }
        }
    }

    #[instrument(skip(self, completion))]
    async fn complete_step(
        &self,
        step_id: Uuid,
        completion: StepCompletion,
        now: DateTime<Utc>,
    ) -> Result<CompletionOutcome, StoreError> {
        let mut tx = self.pool.begin().await.map_err(database)?;

        let step = lock_step(&mut *tx, step_id).await?;
        if step.state.is_terminal() {
            return Ok(CompletionOutcome::AlreadyFinished);
        }
        let run_status = lock_run_status(&mut *tx, step.run_id).await?;

        sqlx::query(
            r#"
            UPDATE flowline_steps
            SET state = 'done', output = $2, due_at = NULL, updated_at = $3
            WHERE id = $1
            "#,
        )
        .bind(step_id)
        .bind(&completion.output)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(database)?;

        if step.branch.is_root() {
            sqlx::query(
                r#"
                UPDATE flowline_runs
                SET context = context || jsonb_build_object($2::text, $3::jsonb), updated_at = $4
                WHERE id = $1 AND NOT (context ? $2)
                "#,
            )
            .bind(step.run_id)
            .bind(&step.node_id)
            .bind(&completion.output)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(database)?;
        }

        if let Some(cursor) = &completion.open_loop {
            sqlx::query(
                r#"
                INSERT INTO flowline_loop_cursors (
                    run_id, node_id, branch, total, spawned, max_iterations, finished, state, scope, updated_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                ON CONFLICT (run_id, node_id, branch) DO NOTHING
                "#,
            )
            .bind(cursor.run_id)
            .bind(&cursor.node_id)
            .bind(cursor.branch.as_str())
            .bind(cursor.total as i32)
            .bind(cursor.index as i32)
            .bind(cursor.max_iterations as i32)
            .bind(serde_json::to_value(&cursor.finished)?)
            .bind(cursor.state.as_str())
            .bind(Value::Object(cursor.scope.clone()))
            .bind(cursor.updated_at)
            .execute(&mut *tx)
            .await
            .map_err(database)?;
        }

        // an in-flight step of a cancelled run may finish but routes nowhere
        let applied = if run_status.is_terminal() {
            AppliedRoutes::default()
        } else {
            apply_routes(&mut *tx, step.run_id, completion.routes, now).await?
        };
        refresh_run_status(&mut *tx, step.run_id, now).await?;

        tx.commit().await.map_err(database)?;
        debug!(%step_id, node_id = %step.node_id, enqueued = applied.enqueued.len(), "completed step");
        Ok(CompletionOutcome::Completed(applied))
    }

    async fn fail_step(
        &self,
        step_id: Uuid,
        failure: StepFailure,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await.map_err(database)?;

        let step = lock_step(&mut *tx, step_id).await?;
        if step.state.is_terminal() {
            return Ok(false);
        }

        sqlx::query(
            r#"
            UPDATE flowline_steps
            SET state = 'failed', failure = $2, last_error = $3, due_at = NULL, updated_at = $4
            WHERE id = $1
            "#,
        )
        .bind(step_id)
        .bind(serde_json::to_value(&failure)?)
        .bind(&failure.message)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(database)?;
        refresh_run_status(&mut *tx, step.run_id, now).await?;

        tx.commit().await.map_err(database)?;
        Ok(true)
    }

    async fn retry_step(
        &self,
        step_id: Uuid,
        due_at: DateTime<Utc>,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(database)?;

        let step = lock_step(&mut *tx, step_id).await?;
        if step.state.is_terminal() {
            return Ok(());
        }

        sqlx::query(
            r#"
            UPDATE flowline_steps
            SET state = 'scheduled', attempt = attempt + 1, due_at = $2, last_error = $3,
                claimed_by = NULL, claimed_at = NULL, updated_at = $4
            WHERE id = $1
            "#,
        )
        .bind(step_id)
        .bind(due_at)
        .bind(error)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(database)?;
        refresh_run_status(&mut *tx, step.run_id, now).await?;

        tx.commit().await.map_err(database)?;
        Ok(())
    }

    async fn schedule_wake(
        &self,
        step_id: Uuid,
        wake_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(database)?;

        let step = lock_step(&mut *tx, step_id).await?;
        if step.state.is_terminal() {
            return Ok(());
        }

        sqlx::query(
            r#"
            UPDATE flowline_steps
            SET state = 'scheduled', due_at = $2, wake_at = $2,
                claimed_by = NULL, claimed_at = NULL, updated_at = $3
            WHERE id = $1
            "#,
        )
        .bind(step_id)
        .bind(wake_at)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(database)?;
        refresh_run_status(&mut *tx, step.run_id, now).await?;

        tx.commit().await.map_err(database)?;
        Ok(())
    }

    async fn cancel_step(&self, step_id: Uuid, now: DateTime<Utc>) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE flowline_steps
            SET state = 'cancelled', updated_at = $2
            WHERE id = $1 AND state IN ('pending', 'scheduled', 'executing')
            "#,
        )
        .bind(step_id)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(database)?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn release_due_steps(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Uuid>, StoreError> {
        let mut tx = self.pool.begin().await.map_err(database)?;

        let rows = sqlx::query(
            r#"
            WITH due AS (
                SELECT id
                FROM flowline_steps
                WHERE state = 'scheduled' AND due_at <= $1
                ORDER BY due_at
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE flowline_steps s
            SET state = 'pending', due_at = NULL, updated_at = $1
            FROM due d
            WHERE s.id = d.id
            RETURNING s.id, s.run_id
            "#,
        )
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&mut *tx)
        .await
        .map_err(database)?;

        let mut released = Vec::with_capacity(rows.len());
        let mut runs = BTreeSet::new();
        for row in &rows {
            released.push(row.get::<Uuid, _>("id"));
            runs.insert(row.get::<Uuid, _>("run_id"));
        }
        for run_id in runs {
            refresh_run_status(&mut *tx, run_id, now).await?;
        }

        tx.commit().await.map_err(database)?;
        if !released.is_empty() {
            debug!(count = released.len(), "released due steps");
        }
        Ok(released)
    }

    async fn reclaim_stale_steps(
        &self,
        claimed_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<Uuid>, StoreError> {
        let rows = sqlx::query(
            r#"
            UPDATE flowline_steps
            SET state = 'pending', claimed_by = NULL, claimed_at = NULL, updated_at = $2
            WHERE state = 'executing' AND claimed_at < $1
            RETURNING id
            "#,
        )
        .bind(claimed_before)
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(database)?;
        Ok(rows.iter().map(|r| r.get("id")).collect())
    }

    async fn count_active_work(
        &self,
        run_id: Uuid,
        branch: &BranchPath,
    ) -> Result<usize, StoreError> {
        let mut conn = self.pool.acquire().await.map_err(database)?;
        active_work(&mut *conn, run_id, branch).await
    }

    // =========================================================================
    // Merges and loops
    // =========================================================================

    async fn list_merge_wait_sets(&self, run_id: Uuid) -> Result<Vec<MergeWaitSet>, StoreError> {
        let sql = format!(
            "SELECT {MERGE_COLUMNS} FROM flowline_merge_wait_sets WHERE run_id = $1 ORDER BY node_id, branch"
        );
        let rows = sqlx::query(&sql)
            .bind(run_id)
            .fetch_all(&self.pool)
            .await
            .map_err(database)?;
        rows.iter().map(merge_from_row).collect()
    }

    async fn list_loop_cursors(&self, run_id: Uuid) -> Result<Vec<LoopCursor>, StoreError> {
        let sql = format!(
            "SELECT {CURSOR_COLUMNS} FROM flowline_loop_cursors WHERE run_id = $1 ORDER BY node_id, branch"
        );
        let rows = sqlx::query(&sql)
            .bind(run_id)
            .fetch_all(&self.pool)
            .await
            .map_err(database)?;
        rows.iter().map(cursor_from_row).collect()
    }

    async fn finish_loop_item(
        &self,
        run_id: Uuid,
        loop_node: &str,
        branch: &BranchPath,
        index: u32,
        now: DateTime<Utc>,
    ) -> Result<LoopProgress, StoreError> {
        let mut tx = self.pool.begin().await.map_err(database)?;

        let mut cursor = lock_cursor(&mut *tx, run_id, loop_node, branch).await?;
        let claimed_completion = cursor.finish_item(index, now);
        save_cursor(&mut *tx, &cursor).await?;

        tx.commit().await.map_err(database)?;
        Ok(LoopProgress {
            cursor,
            claimed_completion,
        })
    }

    #[instrument(skip(self, routes))]
    async fn close_loop(
        &self,
        run_id: Uuid,
        loop_node: &str,
        branch: &BranchPath,
        routes: Vec<Route>,
        now: DateTime<Utc>,
    ) -> Result<AppliedRoutes, StoreError> {
        let mut tx = self.pool.begin().await.map_err(database)?;

        let mut cursor = lock_cursor(&mut *tx, run_id, loop_node, branch).await?;
        if cursor.is_closed() {
            return Ok(AppliedRoutes::default());
        }
        cursor.state = LoopState::Closed;
        cursor.updated_at = now;
        save_cursor(&mut *tx, &cursor).await?;

        let run_status = lock_run_status(&mut *tx, run_id).await?;
        let applied = if run_status.is_terminal() {
            AppliedRoutes::default()
        } else {
            apply_routes(&mut *tx, run_id, routes, now).await?
        };
        refresh_run_status(&mut *tx, run_id, now).await?;

        tx.commit().await.map_err(database)?;
        Ok(applied)
    }

    // =========================================================================
    // Effect dedup records
    // =========================================================================

    async fn get_effect(&self, key: &StepKey) -> Result<Option<Value>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT output FROM flowline_step_effects
            WHERE run_id = $1 AND node_id = $2 AND branch = $3
            "#,
        )
        .bind(key.run_id)
        .bind(&key.node_id)
        .bind(key.branch.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(database)?;
        Ok(row.map(|r| r.get("output")))
    }

    async fn record_effect(
        &self,
        key: &StepKey,
        output: &Value,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO flowline_step_effects (run_id, node_id, branch, output, created_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (run_id, node_id, branch) DO NOTHING
            "#,
        )
        .bind(key.run_id)
        .bind(&key.node_id)
        .bind(key.branch.as_str())
        .bind(output)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(database)?;
        Ok(())
    }

    // =========================================================================
    // Schedule triggers
    // =========================================================================

    async fn replace_schedules(
        &self,
        definition_id: Uuid,
        schedules: Vec<ScheduleTrigger>,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(database)?;

        sqlx::query("DELETE FROM flowline_schedule_triggers WHERE definition_id = $1")
            .bind(definition_id)
            .execute(&mut *tx)
            .await
            .map_err(database)?;

        for schedule in &schedules {
            sqlx::query(
                r#"
                INSERT INTO flowline_schedule_triggers (definition_id, node_id, cron, next_fire_at, last_fired_at)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(definition_id)
            .bind(&schedule.node_id)
            .bind(&schedule.cron)
            .bind(schedule.next_fire_at)
            .bind(schedule.last_fired_at)
            .execute(&mut *tx)
            .await
            .map_err(database)?;
        }

        tx.commit().await.map_err(database)?;
        Ok(())
    }

    async fn list_schedules(&self, definition_id: Uuid) -> Result<Vec<ScheduleTrigger>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT definition_id, node_id, cron, next_fire_at, last_fired_at
            FROM flowline_schedule_triggers
            WHERE definition_id = $1
            ORDER BY node_id
            "#,
        )
        .bind(definition_id)
        .fetch_all(&self.pool)
        .await
        .map_err(database)?;
        Ok(rows.iter().map(schedule_from_row).collect())
    }

    async fn due_schedules(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ScheduleTrigger>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT definition_id, node_id, cron, next_fire_at, last_fired_at
            FROM flowline_schedule_triggers
            WHERE next_fire_at <= $1
            ORDER BY next_fire_at
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(database)?;
        Ok(rows.iter().map(schedule_from_row).collect())
    }

    async fn advance_schedule(
        &self,
        definition_id: Uuid,
        node_id: &str,
        expected_fire_at: DateTime<Utc>,
        next_fire_at: Option<DateTime<Utc>>,
    ) -> Result<bool, StoreError> {
        let result = match next_fire_at {
            Some(next) => {
                sqlx::query(
                    r#"
                    UPDATE flowline_schedule_triggers
                    SET next_fire_at = $4, last_fired_at = $3
                    WHERE definition_id = $1 AND node_id = $2 AND next_fire_at = $3
                    "#,
                )
                .bind(definition_id)
                .bind(node_id)
                .bind(expected_fire_at)
                .bind(next)
                .execute(&self.pool)
                .await
            }
            None => {
                sqlx::query(
                    r#"
                    DELETE FROM flowline_schedule_triggers
                    WHERE definition_id = $1 AND node_id = $2 AND next_fire_at = $3
                    "#,
                )
                .bind(definition_id)
                .bind(node_id)
                .bind(expected_fire_at)
                .execute(&self.pool)
                .await
            }
        }
        .map_err(database)?;

        Ok(result.rows_affected() == 1)
    }

    // =========================================================================
    // Retention
    // =========================================================================

    #[instrument(skip(self))]
    async fn purge_finished_runs(
        &self,
        finished_before: DateTime<Utc>,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<PurgeReport, StoreError> {
        let mut tx = self.pool.begin().await.map_err(database)?;

        let rows = sqlx::query(
            r#"
            SELECT id FROM flowline_runs
            WHERE status IN ('completed', 'failed', 'cancelled')
              AND purged_at IS NULL
              AND finished_at < $1
            ORDER BY id
            LIMIT $2
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(finished_before)
        .bind(limit as i64)
        .fetch_all(&mut *tx)
        .await
        .map_err(database)?;
        let run_ids: Vec<Uuid> = rows.iter().map(|r| r.get("id")).collect();

        if run_ids.is_empty() {
            return Ok(PurgeReport::default());
        }

        let mut report = PurgeReport {
            runs: run_ids.len(),
            steps: 0,
        };
        for table in [
            "flowline_merge_wait_sets",
            "flowline_loop_cursors",
            "flowline_step_effects",
        ] {
            sqlx::query(&format!("DELETE FROM {table} WHERE run_id = ANY($1)"))
                .bind(&run_ids)
                .execute(&mut *tx)
                .await
                .map_err(database)?;
        }
        let deleted = sqlx::query("DELETE FROM flowline_steps WHERE run_id = ANY($1)")
            .bind(&run_ids)
            .execute(&mut *tx)
            .await
            .map_err(database)?;
        report.steps = deleted.rows_affected() as usize;

        sqlx::query("UPDATE flowline_runs SET purged_at = $2 WHERE id = ANY($1)")
            .bind(&run_ids)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(database)?;

        tx.commit().await.map_err(database)?;
        debug!(runs = report.runs, steps = report.steps, "purged finished runs");
        Ok(report)
    }
}
