//! Behavior execution context

use serde_json::{Map, Value};
use uuid::Uuid;

use crate::context::resolve_path;
use crate::run::BranchPath;

/// Context provided to behaviors during execution
#[derive(Debug, Clone)]
pub struct BehaviorContext {
    pub run_id: Uuid,
    pub org_id: String,
    pub node_id: String,
    pub branch: BranchPath,

    /// Current attempt number (1-based)
    pub attempt: u32,

    /// Maximum attempts allowed
    pub max_attempts: u32,

    /// Stable across retries and redeliveries of the same step
    pub idempotency_key: String,

    /// Params with templates already resolved
    pub params: Value,

    /// Run context overlaid with the branch scope
    pub context: Map<String, Value>,
}

impl BehaviorContext {
    /// Look up a value in the context by dotted path
    pub fn value(&self, path: &str) -> Option<&Value> {
        resolve_path(&self.context, path)
    }

    pub fn param(&self, name: &str) -> Option<&Value> {
        self.params.get(name)
    }

    pub fn param_str(&self, name: &str) -> Option<&str> {
        self.param(name).and_then(Value::as_str)
    }

    /// Whether a failure now exhausts the retry budget
    pub fn is_last_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}
