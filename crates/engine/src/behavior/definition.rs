//! Behavior trait definition

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::BehaviorContext;

/// Error returned by a behavior handler
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BehaviorError {
    /// Error message
    pub message: String,

    /// Error type/code, matched against a retry policy's non-retryable list
    pub error_type: Option<String>,

    /// Whether this error is retryable
    ///
    /// Non-retryable errors fail the step without further attempts.
    pub retryable: bool,

    /// Additional error details (for debugging)
    pub details: Option<Value>,
}

impl BehaviorError {
    /// Create a new retryable error
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_type: None,
            retryable: true,
            details: None,
        }
    }

    /// Create a non-retryable error
    pub fn non_retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_type: None,
            retryable: false,
            details: None,
        }
    }

    /// Set the error type
    pub fn with_type(mut self, error_type: impl Into<String>) -> Self {
        self.error_type = Some(error_type.into());
        self
    }

    /// Add error details
    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl std::fmt::Display for BehaviorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.error_type {
            Some(t) => write!(f, "[{}] {}", t, self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for BehaviorError {}

impl From<anyhow::Error> for BehaviorError {
    fn from(err: anyhow::Error) -> Self {
        Self::retryable(err.to_string())
    }
}

/// A named side effect an action node can invoke
///
/// Behaviors receive the rendered params and a read-only view of the run
/// context. Side effects should be keyed on `ctx.idempotency_key` so a
/// redelivered step does not repeat them.
///
/// # Example
///
/// ```ignore
/// use flowline_engine::prelude::*;
///
/// struct SendEmail { mailer: Mailer }
///
/// #[async_trait]
/// impl Behavior for SendEmail {
///     async fn invoke(&self, ctx: &BehaviorContext) -> Result<Value, BehaviorError> {
///         let to = ctx.param_str("to").ok_or_else(|| BehaviorError::non_retryable("missing `to`"))?;
///         let id = self.mailer.send(to, &ctx.idempotency_key).await?;
///         Ok(json!({ "message_id": id }))
///     }
/// }
/// ```
#[async_trait]
pub trait Behavior: Send + Sync + 'static {
    /// Credits charged per execution unless the node overrides it
    fn default_cost(&self) -> u64 {
        1
    }

    /// Perform the side effect
    ///
    /// Return `BehaviorError::retryable()` for transient failures and
    /// `BehaviorError::non_retryable()` for permanent ones.
    async fn invoke(&self, ctx: &BehaviorContext) -> Result<Value, BehaviorError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_behavior_error_retryable() {
        let error = BehaviorError::retryable("timeout");
        assert!(error.retryable);
        assert_eq!(error.to_string(), "timeout");
    }

    #[test]
    fn test_behavior_error_non_retryable_with_type() {
        let error = BehaviorError::non_retryable("bad address").with_type("INVALID_INPUT");
        assert!(!error.retryable);
        assert_eq!(error.error_type.as_deref(), Some("INVALID_INPUT"));
        assert_eq!(error.to_string(), "[INVALID_INPUT] bad address");
    }

    #[test]
    fn test_from_anyhow_is_retryable() {
        let error: BehaviorError = anyhow::anyhow!("connection reset").into();
        assert!(error.retryable);
    }
}
