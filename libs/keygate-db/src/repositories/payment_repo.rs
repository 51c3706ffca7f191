use anyhow::{Context, Result};
use sqlx::{Sqlite, SqlitePool, Transaction};

use crate::models::{Payment, PaymentPurpose, PaymentStatus};

#[derive(Debug, Clone)]
pub struct PaymentRepository {
    pool: SqlitePool,
}

impl PaymentRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Idempotent on `external_id`: a concurrent identical request
    /// (same gateway idempotency key, so same external id) inserts
    /// nothing and gets the existing row back.
    pub async fn create(
        &self,
        user_id: i64,
        external_id: &str,
        amount_minor: i64,
        currency: &str,
        description: &str,
        purpose: &PaymentPurpose,
    ) -> Result<Payment> {
        let purpose_json = serde_json::to_string(purpose)?;
        let inserted = sqlx::query_as::<_, Payment>(
            "INSERT INTO payments (user_id, external_id, amount_minor, currency, status, description, purpose)
             VALUES (?, ?, ?, ?, 'pending', ?, ?)
             ON CONFLICT(external_id) DO NOTHING
             RETURNING *",
        )
        .bind(user_id)
        .bind(external_id)
        .bind(amount_minor)
        .bind(currency)
        .bind(description)
        .bind(purpose_json)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to insert pending payment")?;

        match inserted {
            Some(payment) => Ok(payment),
            None => self
                .get_by_external_id(external_id)
                .await?
                .context("Payment missing after conflicting insert"),
        }
    }

    /// Number of payments ever requested by a user. Folded into the
    /// gateway idempotency key so a double tap before the first row
    /// lands reuses the same key, while a later repeat purchase gets a
    /// fresh one.
    pub async fn count_by_user(&self, user_id: i64) -> Result<i64> {
        sqlx::query_scalar("SELECT COUNT(*) FROM payments WHERE user_id = ?")
            .bind(user_id)
            .fetch_one(&self.pool)
            .await
            .context("Failed to count payments")
    }

    pub async fn get_by_external_id(&self, external_id: &str) -> Result<Option<Payment>> {
        sqlx::query_as::<_, Payment>("SELECT * FROM payments WHERE external_id = ?")
            .bind(external_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch payment by external id")
    }

    /// Conditional terminal write. Returns the number of rows claimed:
    /// 0 means another delivery of the same notification already moved
    /// the payment to a terminal status, and the caller must not apply
    /// any side effects for it.
    pub async fn mark_terminal_tx(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        payment_id: i64,
        status: PaymentStatus,
    ) -> Result<u64> {
        debug_assert!(status.is_terminal());
        let result = sqlx::query(
            "UPDATE payments SET status = ?, updated_at = CURRENT_TIMESTAMP
             WHERE id = ? AND status IN ('pending', 'waiting_capture')",
        )
        .bind(status)
        .bind(payment_id)
        .execute(&mut **tx)
        .await
        .context("Failed to mark payment terminal")?;
        Ok(result.rows_affected())
    }
}
