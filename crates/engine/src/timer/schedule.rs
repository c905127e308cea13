//! Cron schedules for `trigger_schedule` nodes
//!
//! Accepts standard 5-field Unix cron expressions (minute, hour,
//! day-of-month, month, day-of-week) and the 6-field form with seconds
//! used by the `cron` crate. All schedules are evaluated in UTC.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use cron::Schedule;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Invalid cron expression
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid cron expression '{expr}': {reason}")]
pub struct ScheduleError {
    pub expr: String,
    pub reason: String,
}

/// Prepend a seconds field to 5-field expressions
fn normalize_cron_expr(cron_expr: &str) -> String {
    let fields: Vec<&str> = cron_expr.split_whitespace().collect();
    if fields.len() == 5 {
        format!("0 {}", fields.join(" "))
    } else {
        fields.join(" ")
    }
}

/// Parse a cron expression
pub fn parse_schedule(cron_expr: &str) -> Result<Schedule, ScheduleError> {
    Schedule::from_str(&normalize_cron_expr(cron_expr)).map_err(|e| ScheduleError {
        expr: cron_expr.to_string(),
        reason: e.to_string(),
    })
}

/// First fire time strictly after `after`
pub fn next_fire_after(cron_expr: &str, after: DateTime<Utc>) -> Result<Option<DateTime<Utc>>, ScheduleError> {
    Ok(parse_schedule(cron_expr)?.after(&after).next())
}

/// Persisted recurring timer for one schedule trigger of an active definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleTrigger {
    pub definition_id: Uuid,
    pub node_id: String,
    pub cron: String,
    pub next_fire_at: DateTime<Utc>,
    pub last_fired_at: Option<DateTime<Utc>>,
}

impl ScheduleTrigger {
    /// Idempotency key for the dispatch of the fire at `fire_at`
    pub fn fire_key(&self, fire_at: DateTime<Utc>) -> String {
        format!(
            "schedule:{}:{}:{}",
            self.definition_id,
            self.node_id,
            fire_at.timestamp()
        )
    }
}
