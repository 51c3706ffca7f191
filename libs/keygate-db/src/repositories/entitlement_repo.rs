use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{Sqlite, SqlitePool, Transaction};

use crate::models::Entitlement;

#[derive(Debug, Clone)]
pub struct EntitlementRepository {
    pool: SqlitePool,
}

impl EntitlementRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn get_by_id(&self, id: i64) -> Result<Option<Entitlement>> {
        sqlx::query_as::<_, Entitlement>("SELECT * FROM entitlements WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch entitlement by id")
    }

    pub async fn list_active_by_user(&self, user_id: i64) -> Result<Vec<Entitlement>> {
        sqlx::query_as::<_, Entitlement>(
            "SELECT * FROM entitlements WHERE user_id = ? AND is_active = 1 ORDER BY expires_at DESC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list active entitlements")
    }

    pub async fn count_by_user(&self, user_id: i64) -> Result<i64> {
        sqlx::query_scalar("SELECT COUNT(*) FROM entitlements WHERE user_id = ?")
            .bind(user_id)
            .fetch_one(&self.pool)
            .await
            .context("Failed to count entitlements")
    }

    /// Trial eligibility is consumed permanently: any trial row counts,
    /// active or not.
    pub async fn user_has_trial(&self, user_id: i64) -> Result<bool> {
        sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM entitlements WHERE user_id = ? AND is_trial = 1)",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await
        .context("Failed to check trial eligibility")
    }

    pub async fn list_expired(&self, now: DateTime<Utc>) -> Result<Vec<Entitlement>> {
        sqlx::query_as::<_, Entitlement>(
            "SELECT * FROM entitlements WHERE is_active = 1 AND expires_at <= ?",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list expired entitlements")
    }

    pub async fn insert(
        &self,
        user_id: i64,
        payment_id: Option<i64>,
        external_account_id: &str,
        access_url: &str,
        label: &str,
        is_trial: bool,
        expires_at: DateTime<Utc>,
    ) -> Result<Entitlement> {
        sqlx::query_as::<_, Entitlement>(
            "INSERT INTO entitlements
                 (user_id, payment_id, external_account_id, access_url, label, is_trial, is_active, expires_at)
             VALUES (?, ?, ?, ?, ?, ?, 1, ?)
             RETURNING *",
        )
        .bind(user_id)
        .bind(payment_id)
        .bind(external_account_id)
        .bind(access_url)
        .bind(label)
        .bind(is_trial)
        .bind(expires_at)
        .fetch_one(&self.pool)
        .await
        .context("Failed to insert entitlement")
    }

    pub async fn insert_tx(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        user_id: i64,
        payment_id: Option<i64>,
        external_account_id: &str,
        access_url: &str,
        label: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<Entitlement> {
        sqlx::query_as::<_, Entitlement>(
            "INSERT INTO entitlements
                 (user_id, payment_id, external_account_id, access_url, label, is_trial, is_active, expires_at)
             VALUES (?, ?, ?, ?, ?, 0, 1, ?)
             RETURNING *",
        )
        .bind(user_id)
        .bind(payment_id)
        .bind(external_account_id)
        .bind(access_url)
        .bind(label)
        .bind(expires_at)
        .fetch_one(&mut **tx)
        .await
        .context("Failed to insert entitlement")
    }

    pub async fn extend_tx(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        id: i64,
        new_expires_at: DateTime<Utc>,
        access_url: &str,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE entitlements SET expires_at = ?, access_url = ?, is_active = 1 WHERE id = ?",
        )
        .bind(new_expires_at)
        .bind(access_url)
        .bind(id)
        .execute(&mut **tx)
        .await
        .context("Failed to extend entitlement")?;
        Ok(())
    }

    /// Pull backend state into the local row (out-of-band extension
    /// discovered by the sweeper).
    pub async fn sync_from_backend_tx(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        id: i64,
        expires_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query("UPDATE entitlements SET expires_at = ?, is_active = 1 WHERE id = ?")
            .bind(expires_at)
            .bind(id)
            .execute(&mut **tx)
            .await
            .context("Failed to sync entitlement from backend")?;
        Ok(())
    }

    /// Puts a row back after a failed backend teardown so the next
    /// sweep retries it.
    pub async fn reactivate(&self, id: i64) -> Result<()> {
        sqlx::query("UPDATE entitlements SET is_active = 1 WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("Failed to reactivate entitlement")?;
        Ok(())
    }

    /// Deactivate only if `expires_at` is still what the caller observed
    /// when it selected the row; a concurrent extension wins the race and
    /// the row stays active.
    pub async fn deactivate_guarded_tx(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        id: i64,
        observed_expires_at: DateTime<Utc>,
    ) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE entitlements SET is_active = 0 WHERE id = ? AND expires_at = ?",
        )
        .bind(id)
        .bind(observed_expires_at)
        .execute(&mut **tx)
        .await
        .context("Failed to deactivate entitlement")?;
        Ok(result.rows_affected())
    }
}
