use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::{error, info, warn};

use keygate_db::models::Entitlement;
use keygate_db::repositories::EntitlementRepository;

use crate::clients::{AccountStatus, VpnClient};

/// Periodic expiry sweep. Each tick selects entitlements whose local
/// expiry has passed and reconciles them against the live backend:
/// an account extended out of band keeps its access and the local row
/// is refreshed instead, everything else is torn down and deactivated.
pub struct SweeperService {
    pool: SqlitePool,
    entitlements: EntitlementRepository,
    vpn: Arc<dyn VpnClient>,
    interval_secs: u64,
}

enum SweepOutcome {
    Deactivated,
    Refreshed,
    Skipped,
}

impl SweeperService {
    pub fn new(pool: SqlitePool, vpn: Arc<dyn VpnClient>, interval_secs: u64) -> Self {
        Self {
            entitlements: EntitlementRepository::new(pool.clone()),
            pool,
            vpn,
            interval_secs,
        }
    }

    pub async fn run(&self) {
        info!("Expiry sweeper started ({}s interval)", self.interval_secs);
        let mut interval = tokio::time::interval(Duration::from_secs(self.interval_secs));
        loop {
            interval.tick().await;
            if let Err(e) = self.sweep_once().await {
                error!("Expiry sweep failed: {:#}", e);
            }
        }
    }

    /// One full pass. A per-item failure skips that row only, it stays
    /// active and is retried on the next tick.
    pub async fn sweep_once(&self) -> Result<()> {
        let now = Utc::now();
        let expired = self.entitlements.list_expired(now).await?;
        if expired.is_empty() {
            return Ok(());
        }
        info!("Sweeping {} expired entitlement(s)", expired.len());

        let mut deactivated = 0u64;
        let mut refreshed = 0u64;
        for entitlement in &expired {
            match self.sweep_one(entitlement, now).await {
                Ok(SweepOutcome::Deactivated) => deactivated += 1,
                Ok(SweepOutcome::Refreshed) => refreshed += 1,
                Ok(SweepOutcome::Skipped) => {}
                Err(e) => warn!("Skipping entitlement {}: {:#}", entitlement.id, e),
            }
        }

        info!(
            "Sweep done: {} deactivated, {} refreshed from backend",
            deactivated, refreshed
        );
        Ok(())
    }

    async fn sweep_one(
        &self,
        entitlement: &Entitlement,
        now: DateTime<Utc>,
    ) -> Result<SweepOutcome> {
        let state = self
            .vpn
            .get_account(&entitlement.external_account_id)
            .await
            .map_err(|e| {
                anyhow!(
                    "backend lookup for {} failed: {}",
                    entitlement.external_account_id,
                    e
                )
            })?;

        // A backend-tracked expiry in the future means the account was
        // extended behind our back; adopt it instead of revoking access.
        if state.status != AccountStatus::NotFound {
            if let Some(backend_expiry) = state.expires_at {
                if backend_expiry > now {
                    info!(
                        "Entitlement {} was extended on the backend until {}, syncing",
                        entitlement.id, backend_expiry
                    );
                    let mut tx = self.pool.begin().await.context("Failed to begin sweep transaction")?;
                    self.entitlements
                        .sync_from_backend_tx(&mut tx, entitlement.id, backend_expiry)
                        .await?;
                    tx.commit().await.context("Failed to commit sync")?;
                    return Ok(SweepOutcome::Refreshed);
                }
            }
        }

        // Claim the row before the account is touched. A payment that
        // extended the row since it was selected changed `expires_at`,
        // loses nothing: the claim misses and the account survives.
        let mut tx = self.pool.begin().await.context("Failed to begin sweep transaction")?;
        let claimed = self
            .entitlements
            .deactivate_guarded_tx(&mut tx, entitlement.id, entitlement.expires_at)
            .await?;
        tx.commit().await.context("Failed to commit claim")?;
        if claimed == 0 {
            info!("Entitlement {} was extended mid-sweep, left active", entitlement.id);
            return Ok(SweepOutcome::Skipped);
        }

        if state.status == AccountStatus::NotFound {
            // Already gone from the backend; nothing to delete.
            return Ok(SweepOutcome::Deactivated);
        }

        if let Err(e) = self.vpn.delete_account(&entitlement.external_account_id).await {
            // Put the row back so the next tick retries the teardown.
            self.entitlements.reactivate(entitlement.id).await?;
            return Err(anyhow!(
                "failed to delete account {}: {}",
                entitlement.external_account_id,
                e
            ));
        }
        Ok(SweepOutcome::Deactivated)
    }
}
