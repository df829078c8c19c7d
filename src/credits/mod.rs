//! Credit ledger
//!
//! Provides:
//! - Balance lookup, grant, deduct and refund
//! - A transaction row for every balance movement
//!
//! Deductions are a single conditional UPDATE, so two concurrent requests
//! can never both spend the last credits. Callers deduct before issuing any
//! billed provider call.

use serde::Serialize;
use sqlx::SqlitePool;
use thiserror::Error;
use tracing::debug;

/// Ledger errors
#[derive(Debug, Error)]
pub enum CreditError {
    #[error("insufficient credits: need {required}, have {balance}")]
    Insufficient { balance: i64, required: i64 },

    #[error("credit amount must be positive")]
    InvalidAmount,

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Transaction record for auditing
#[derive(Debug, Clone, Serialize)]
pub struct CreditTransaction {
    pub id: String,
    pub account_id: String,
    /// Positive = credit, negative = debit
    pub amount: i64,
    pub reason: String,
    pub created_at: String,
}

/// Proof of a completed deduction, used to refund it
#[derive(Debug, Clone)]
pub struct Deduction {
    pub account_id: String,
    pub amount: i64,
    pub transaction_id: String,
}

/// Credit ledger backed by SQLite
#[derive(Debug, Clone)]
pub struct CreditLedger {
    pool: SqlitePool,
}

impl CreditLedger {
    /// Create a new ledger
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Get balance for an account (0 if it never held credits)
    pub async fn get_balance(&self, account_id: &str) -> Result<i64, CreditError> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT balance FROM credits WHERE account_id = ?")
            .bind(account_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|(b,)| b).unwrap_or(0))
    }

    /// Deduct credits, failing without side effects if the balance is short
    pub async fn deduct(
        &self,
        account_id: &str,
        amount: i64,
        reason: &str,
    ) -> Result<Deduction, CreditError> {
        if amount <= 0 {
            return Err(CreditError::InvalidAmount);
        }

        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            "UPDATE credits SET balance = balance - ? WHERE account_id = ? AND balance >= ?",
        )
        .bind(amount)
        .bind(account_id)
        .bind(amount)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            let balance = self.get_balance(account_id).await?;
            debug!(
                "Insufficient credits: {} has {} but needs {}",
                account_id, balance, amount
            );
            return Err(CreditError::Insufficient {
                balance,
                required: amount,
            });
        }

        let transaction_id = Self::log_transaction(&mut tx, account_id, -amount, reason).await?;
        tx.commit().await?;

        debug!("Deducted {} credits from {} ({})", amount, account_id, reason);
        Ok(Deduction {
            account_id: account_id.to_string(),
            amount,
            transaction_id,
        })
    }

    /// Grant credits to an account
    pub async fn grant(&self, account_id: &str, amount: i64, reason: &str) -> Result<i64, CreditError> {
        if amount <= 0 {
            return Err(CreditError::InvalidAmount);
        }

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO credits (account_id, balance)
            VALUES (?, ?)
            ON CONFLICT(account_id) DO UPDATE SET balance = balance + excluded.balance
            "#,
        )
        .bind(account_id)
        .bind(amount)
        .execute(&mut *tx)
        .await?;

        Self::log_transaction(&mut tx, account_id, amount, reason).await?;

        let (balance,): (i64,) = sqlx::query_as("SELECT balance FROM credits WHERE account_id = ?")
            .bind(account_id)
            .fetch_one(&mut *tx)
            .await?;

        tx.commit().await?;

        debug!("Granted {} credits to {} ({})", amount, account_id, reason);
        Ok(balance)
    }

    /// Return a deduction to its account
    pub async fn refund(&self, deduction: &Deduction, reason: &str) -> Result<i64, CreditError> {
        self.grant(
            &deduction.account_id,
            deduction.amount,
            &format!("refund {}: {}", deduction.transaction_id, reason),
        )
        .await
    }

    /// Most recent transactions first
    pub async fn history(
        &self,
        account_id: &str,
        limit: i64,
    ) -> Result<Vec<CreditTransaction>, CreditError> {
        let rows: Vec<(String, String, i64, String, String)> = sqlx::query_as(
            r#"
            SELECT id, account_id, amount, reason, created_at
            FROM credit_transactions
            WHERE account_id = ?
            ORDER BY created_at DESC, rowid DESC
            LIMIT ?
            "#,
        )
        .bind(account_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(id, account_id, amount, reason, created_at)| CreditTransaction {
                id,
                account_id,
                amount,
                reason,
                created_at,
            })
            .collect())
    }

    async fn log_transaction(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        account_id: &str,
        amount: i64,
        reason: &str,
    ) -> Result<String, sqlx::Error> {
        let id = uuid::Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO credit_transactions (id, account_id, amount, reason, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(account_id)
        .bind(amount)
        .bind(reason)
        .bind(chrono::Utc::now().to_rfc3339())
        .execute(&mut **tx)
        .await?;
        Ok(id)
    }
}
