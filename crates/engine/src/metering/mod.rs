//! Per-org credit metering
//!
//! The executor charges an org through the [`MeteringGate`] right before an
//! action's behavior runs. Debits are idempotent per key, so a retried or
//! redelivered step never pays twice.

mod memory;
mod postgres;

pub use memory::InMemoryCreditLedger;
pub use postgres::PostgresCreditLedger;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Ledger backend errors
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("invalid amount: {0}")]
    InvalidAmount(u64),

    #[error("database error: {0}")]
    Database(String),
}

/// Result of a debit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DebitOutcome {
    Debited { remaining: u64 },
    /// A debit with this key was already applied
    AlreadyCharged,
    /// Nothing was debited
    Insufficient { balance: u64 },
}

/// Credit balances keyed by org id, with atomic debit
#[async_trait]
pub trait CreditLedger: Send + Sync + 'static {
    /// Debit `amount` unless the balance is lower or `key` was already used
    async fn debit(&self, org_id: &str, amount: u64, key: &str) -> Result<DebitOutcome, LedgerError>;

    /// Add credit and return the new balance
    async fn credit(&self, org_id: &str, amount: u64) -> Result<u64, LedgerError>;

    async fn balance(&self, org_id: &str) -> Result<u64, LedgerError>;
}

/// Rejected charges
#[derive(Debug, thiserror::Error)]
pub enum MeteringError {
    #[error("insufficient credit for org {org_id}: balance {balance}, required {required}")]
    InsufficientCredit {
        org_id: String,
        balance: u64,
        required: u64,
    },

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// The only path from the executor to the ledger
#[derive(Clone)]
pub struct MeteringGate {
    ledger: Arc<dyn CreditLedger>,
}

impl MeteringGate {
    pub fn new(ledger: Arc<dyn CreditLedger>) -> Self {
        Self { ledger }
    }

    pub fn ledger(&self) -> &Arc<dyn CreditLedger> {
        &self.ledger
    }

    /// Charge `amount` to `org_id` once per `key`
    pub async fn charge(&self, org_id: &str, amount: u64, key: &str) -> Result<(), MeteringError> {
        if amount == 0 {
            return Ok(());
        }
        match self.ledger.debit(org_id, amount, key).await? {
            DebitOutcome::Debited { remaining } => {
                debug!(org_id, amount, remaining, key, "charged credits");
                Ok(())
            }
            DebitOutcome::AlreadyCharged => {
                debug!(org_id, key, "charge already applied");
                Ok(())
            }
            DebitOutcome::Insufficient { balance } => {
                warn!(org_id, balance, required = amount, "insufficient credit");
                Err(MeteringError::InsufficientCredit {
                    org_id: org_id.to_string(),
                    balance,
                    required: amount,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_charge_is_idempotent_per_key() {
        let ledger = Arc::new(InMemoryCreditLedger::new());
        ledger.credit("org-1", 5).await.unwrap();
        let gate = MeteringGate::new(ledger.clone());

        gate.charge("org-1", 2, "step-a").await.unwrap();
        gate.charge("org-1", 2, "step-a").await.unwrap();
        assert_eq!(ledger.balance("org-1").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_insufficient_credit_debits_nothing() {
        let ledger = Arc::new(InMemoryCreditLedger::new());
        ledger.credit("org-1", 1).await.unwrap();
        let gate = MeteringGate::new(ledger.clone());

        let err = gate.charge("org-1", 2, "step-a").await.unwrap_err();
        assert!(matches!(
            err,
            MeteringError::InsufficientCredit { balance: 1, required: 2, .. }
        ));
        assert_eq!(ledger.balance("org-1").await.unwrap(), 1);

        // the key stays unused, so a later charge after a top-up succeeds
        ledger.credit("org-1", 1).await.unwrap();
        gate.charge("org-1", 2, "step-a").await.unwrap();
        assert_eq!(ledger.balance("org-1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_free_charge_skips_ledger() {
        let gate = MeteringGate::new(Arc::new(InMemoryCreditLedger::new()));
        gate.charge("broke-org", 0, "step-a").await.unwrap();
    }
}
