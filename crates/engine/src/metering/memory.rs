//! In-memory credit ledger

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{CreditLedger, DebitOutcome, LedgerError};

#[derive(Default)]
struct Accounts {
    balances: HashMap<String, u64>,
    debits: HashSet<(String, String)>,
}

/// In-memory ledger for tests and dev mode
///
/// Orgs without an account start at `default_balance`.
#[derive(Default)]
pub struct InMemoryCreditLedger {
    accounts: Mutex<Accounts>,
    default_balance: u64,
}

impl InMemoryCreditLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed every unknown org with `balance` credits
    pub fn with_default_balance(balance: u64) -> Self {
        Self {
            accounts: Mutex::default(),
            default_balance: balance,
        }
    }
}

#[async_trait]
impl CreditLedger for InMemoryCreditLedger {
    async fn debit(&self, org_id: &str, amount: u64, key: &str) -> Result<DebitOutcome, LedgerError> {
        let mut accounts = self.accounts.lock();
        let debit_key = (org_id.to_string(), key.to_string());
        if accounts.debits.contains(&debit_key) {
            return Ok(DebitOutcome::AlreadyCharged);
        }

        let default_balance = self.default_balance;
        let balance = accounts
            .balances
            .entry(org_id.to_string())
            .or_insert(default_balance);
        if *balance < amount {
            return Ok(DebitOutcome::Insufficient { balance: *balance });
        }
        *balance -= amount;
        let remaining = *balance;
        accounts.debits.insert(debit_key);
        Ok(DebitOutcome::Debited { remaining })
    }

    async fn credit(&self, org_id: &str, amount: u64) -> Result<u64, LedgerError> {
        let mut accounts = self.accounts.lock();
        let default_balance = self.default_balance;
        let balance = accounts
            .balances
            .entry(org_id.to_string())
            .or_insert(default_balance);
        *balance = balance
            .checked_add(amount)
            .ok_or(LedgerError::InvalidAmount(amount))?;
        Ok(*balance)
    }

    async fn balance(&self, org_id: &str) -> Result<u64, LedgerError> {
        Ok(self
            .accounts
            .lock()
            .balances
            .get(org_id)
            .copied()
            .unwrap_or(self.default_balance))
    }
}
