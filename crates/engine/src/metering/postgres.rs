//! PostgreSQL credit ledger

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use tracing::error;

use super::{CreditLedger, DebitOutcome, LedgerError};

fn database(err: sqlx::Error) -> LedgerError {
    LedgerError::Database(err.to_string())
}

fn to_db_amount(amount: u64) -> Result<i64, LedgerError> {
    i64::try_from(amount).map_err(|_| LedgerError::InvalidAmount(amount))
}

/// Ledger backed by `flowline_credit_balances` and `flowline_credit_debits`
///
/// A debit inserts its key and decrements the balance in one transaction;
/// the `balance >= amount` guard on the update keeps the balance from going
/// negative under concurrent charges.
#[derive(Clone)]
pub struct PostgresCreditLedger {
    pool: PgPool,
}

impl PostgresCreditLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CreditLedger for PostgresCreditLedger {
    async fn debit(&self, org_id: &str, amount: u64, key: &str) -> Result<DebitOutcome, LedgerError> {
        let db_amount = to_db_amount(amount)?;
        let mut tx = self.pool.begin().await.map_err(database)?;

        let recorded = sqlx::query(
            r#"
            INSERT INTO flowline_credit_debits (org_id, idempotency_key, amount)
            VALUES ($1, $2, $3)
            ON CONFLICT (org_id, idempotency_key) DO NOTHING
            RETURNING org_id
            "#,
        )
        .bind(org_id)
        .bind(key)
        .bind(db_amount)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| {
            error!("Failed to record debit: {}", e);
            database(e)
        })?;

        if recorded.is_none() {
            return Ok(DebitOutcome::AlreadyCharged);
        }

        let updated = sqlx::query(
            r#"
            UPDATE flowline_credit_balances
            SET balance = balance - $2, updated_at = NOW()
            WHERE org_id = $1 AND balance >= $2
            RETURNING balance
            "#,
        )
        .bind(org_id)
        .bind(db_amount)
        .fetch_optional(&mut *tx)
        .await
        .map_err(database)?;

        match updated {
            Some(row) => {
                tx.commit().await.map_err(database)?;
                Ok(DebitOutcome::Debited {
                    remaining: row.get::<i64, _>("balance") as u64,
                })
            }
            None => {
                tx.rollback().await.map_err(database)?;
                Ok(DebitOutcome::Insufficient {
                    balance: self.balance(org_id).await?,
                })
            }
        }
    }

    async fn credit(&self, org_id: &str, amount: u64) -> Result<u64, LedgerError> {
        let row = sqlx::query(
            r#"
            INSERT INTO flowline_credit_balances (org_id, balance, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (org_id) DO UPDATE
            SET balance = flowline_credit_balances.balance + EXCLUDED.balance, updated_at = NOW()
            RETURNING balance
            "#,
        )
        .bind(org_id)
        .bind(to_db_amount(amount)?)
        .fetch_one(&self.pool)
        .await
        .map_err(database)?;

        Ok(row.get::<i64, _>("balance") as u64)
    }

    async fn balance(&self, org_id: &str) -> Result<u64, LedgerError> {
        let row = sqlx::query("SELECT balance FROM flowline_credit_balances WHERE org_id = $1")
            .bind(org_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(database)?;

        Ok(row.map_or(0, |r| r.get::<i64, _>("balance") as u64))
    }
}
