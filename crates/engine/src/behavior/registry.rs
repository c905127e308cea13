//! Behavior registry
//!
//! Maps behavior names to handlers. Definitions may only reference names
//! registered here; the check runs when a definition is saved.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use super::{Behavior, BehaviorContext, BehaviorError};

type BoxedHandler = Arc<
    dyn Fn(BehaviorContext) -> Pin<Box<dyn Future<Output = Result<Value, BehaviorError>> + Send>>
        + Send
        + Sync,
>;

/// Adapter so plain async closures can be registered as behaviors
struct FnBehavior {
    handler: BoxedHandler,
    cost: u64,
}

#[async_trait]
impl Behavior for FnBehavior {
    fn default_cost(&self) -> u64 {
        self.cost
    }

    async fn invoke(&self, ctx: &BehaviorContext) -> Result<Value, BehaviorError> {
        (self.handler)(ctx.clone()).await
    }
}

/// Registry of behaviors by name
#[derive(Clone, Default)]
pub struct BehaviorRegistry {
    behaviors: HashMap<String, Arc<dyn Behavior>>,
}

impl BehaviorRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a behavior, replacing any previous one with the same name
    pub fn register(&mut self, name: impl Into<String>, behavior: impl Behavior) -> &mut Self {
        self.behaviors.insert(name.into(), Arc::new(behavior));
        self
    }

    /// Register an async closure with the default cost of 1
    pub fn register_fn<F, Fut>(&mut self, name: impl Into<String>, handler: F) -> &mut Self
    where
        F: Fn(BehaviorContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, BehaviorError>> + Send + 'static,
    {
        self.register_fn_with_cost(name, 1, handler)
    }

    /// Register an async closure with an explicit default cost
    pub fn register_fn_with_cost<F, Fut>(
        &mut self,
        name: impl Into<String>,
        cost: u64,
        handler: F,
    ) -> &mut Self
    where
        F: Fn(BehaviorContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, BehaviorError>> + Send + 'static,
    {
        let handler: BoxedHandler = Arc::new(move |ctx| Box::pin(handler(ctx)));
        self.behaviors
            .insert(name.into(), Arc::new(FnBehavior { handler, cost }));
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Behavior>> {
        self.behaviors.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.behaviors.contains_key(name)
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.behaviors.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.behaviors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.behaviors.is_empty()
    }
}

impl fmt::Debug for BehaviorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BehaviorRegistry")
            .field("behaviors", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::BranchPath;
    use serde_json::json;
    use uuid::Uuid;

    struct Echo;

    #[async_trait]
    impl Behavior for Echo {
        fn default_cost(&self) -> u64 {
            3
        }

        async fn invoke(&self, ctx: &BehaviorContext) -> Result<Value, BehaviorError> {
            Ok(ctx.params.clone())
        }
    }

    fn ctx() -> BehaviorContext {
        BehaviorContext {
            run_id: Uuid::now_v7(),
            org_id: "org".into(),
            node_id: "n".into(),
            branch: BranchPath::root(),
            attempt: 1,
            max_attempts: 1,
            idempotency_key: "k".into(),
            params: json!({"x": 1}),
            context: Default::default(),
        }
    }

    #[tokio::test]
    async fn test_register_and_invoke() {
        let mut registry = BehaviorRegistry::new();
        registry
            .register("echo", Echo)
            .register_fn("fail", |_ctx| async {
                Err(BehaviorError::non_retryable("nope"))
            });

        assert_eq!(registry.names(), vec!["echo", "fail"]);
        assert_eq!(registry.len(), 2);

        let echo = registry.get("echo").unwrap();
        assert_eq!(echo.default_cost(), 3);
        assert_eq!(echo.invoke(&ctx()).await.unwrap(), json!({"x": 1}));

        let fail = registry.get("fail").unwrap();
        assert_eq!(fail.default_cost(), 1);
        assert!(!fail.invoke(&ctx()).await.unwrap_err().retryable);

        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn test_cost_override_for_closures() {
        let mut registry = BehaviorRegistry::new();
        registry.register_fn_with_cost("free", 0, |_ctx| async { Ok(Value::Null) });
        assert_eq!(registry.get("free").unwrap().default_cost(), 0);
    }
}
