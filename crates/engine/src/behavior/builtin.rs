//! Built-in behaviors

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::info;

use super::{Behavior, BehaviorContext, BehaviorError, BehaviorRegistry};
use crate::records::{RecordError, RecordStore};

/// Emit a tracing event and pass the params through as output
pub struct LogBehavior;

#[async_trait]
impl Behavior for LogBehavior {
    fn default_cost(&self) -> u64 {
        0
    }

    async fn invoke(&self, ctx: &BehaviorContext) -> Result<Value, BehaviorError> {
        info!(
            run_id = %ctx.run_id,
            node_id = %ctx.node_id,
            branch = %ctx.branch,
            params = %ctx.params,
            "workflow log"
        );
        Ok(ctx.params.clone())
    }
}

/// Upsert a record by a key field
///
/// Params: `collection`, `key` (field name), `data` (object).
pub struct UpsertRecordBehavior {
    records: Arc<dyn RecordStore>,
}

impl UpsertRecordBehavior {
    pub fn new(records: Arc<dyn RecordStore>) -> Self {
        Self { records }
    }
}

#[async_trait]
impl Behavior for UpsertRecordBehavior {
    async fn invoke(&self, ctx: &BehaviorContext) -> Result<Value, BehaviorError> {
        let invalid = |msg: &str| BehaviorError::non_retryable(msg).with_type("INVALID_PARAMS");

        let collection = ctx
            .param_str("collection")
            .ok_or_else(|| invalid("missing `collection`"))?;
        let key = ctx.param_str("key").ok_or_else(|| invalid("missing `key`"))?;
        let data = ctx
            .param("data")
            .cloned()
            .ok_or_else(|| invalid("missing `data`"))?;

        match self
            .records
            .upsert_by_key(&ctx.org_id, collection, key, data)
            .await
        {
            Ok(upserted) => Ok(json!({
                "record_id": upserted.record.id,
                "created": upserted.created,
                "record": upserted.record.data,
            })),
            Err(e @ (RecordError::NotAnObject | RecordError::MissingKey(_))) => {
                Err(invalid(&e.to_string()))
            }
            Err(e) => Err(BehaviorError::retryable(e.to_string())),
        }
    }
}

/// Register `log` and `upsert_record`
pub fn register_builtins(registry: &mut BehaviorRegistry, records: Arc<dyn RecordStore>) {
    registry
        .register("log", LogBehavior)
        .register("upsert_record", UpsertRecordBehavior::new(records));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::InMemoryRecordStore;
    use crate::run::BranchPath;
    use uuid::Uuid;

    fn ctx(params: Value) -> BehaviorContext {
        BehaviorContext {
            run_id: Uuid::now_v7(),
            org_id: "org".into(),
            node_id: "create_contact".into(),
            branch: BranchPath::root(),
            attempt: 1,
            max_attempts: 3,
            idempotency_key: "k".into(),
            params,
            context: Default::default(),
        }
    }

    #[tokio::test]
    async fn test_upsert_record() {
        let records = Arc::new(InMemoryRecordStore::new());
        let behavior = UpsertRecordBehavior::new(records.clone());

        let params = json!({
            "collection": "contacts",
            "key": "email",
            "data": {"email": "ada@example.com"}
        });
        let first = behavior.invoke(&ctx(params.clone())).await.unwrap();
        let second = behavior.invoke(&ctx(params)).await.unwrap();

        assert_eq!(first["created"], json!(true));
        assert_eq!(second["created"], json!(false));
        assert_eq!(first["record_id"], second["record_id"]);
        assert_eq!(records.len(), 1);
    }

    #[tokio::test]
    async fn test_upsert_record_bad_params_not_retryable() {
        let behavior = UpsertRecordBehavior::new(Arc::new(InMemoryRecordStore::new()));
        let err = behavior
            .invoke(&ctx(json!({"collection": "contacts"})))
            .await
            .unwrap_err();
        assert!(!err.retryable);
        assert_eq!(err.error_type.as_deref(), Some("INVALID_PARAMS"));
    }

    #[test_log::test(tokio::test)]
    async fn test_log_passes_params_through() {
        let output = LogBehavior.invoke(&ctx(json!({"msg": "hi"}))).await.unwrap();
        assert_eq!(output, json!({"msg": "hi"}));
        assert_eq!(LogBehavior.default_cost(), 0);
    }

    #[test]
    fn test_register_builtins() {
        let mut registry = BehaviorRegistry::new();
        register_builtins(&mut registry, Arc::new(InMemoryRecordStore::new()));
        assert_eq!(registry.names(), vec!["log", "upsert_record"]);
    }
}
