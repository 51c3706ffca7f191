use std::sync::Arc;

use anyhow::{anyhow, Context};
use chrono::{DateTime, Duration, Utc};
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use tracing::{error, info, warn};
use uuid::Uuid;

use keygate_db::models::{Entitlement, Payment, PaymentPurpose, PaymentStatus, User};
use keygate_db::repositories::{EntitlementRepository, PaymentRepository, UserRepository};

use crate::bot::utils::{escape_md, escape_md_code};
use crate::bot_manager::Notifier;
use crate::clients::{
    AccountSpec, AccountStatus, GatewayNotification, IntentRequest, PaymentGateway, VpnClient,
    EVENT_PAYMENT_CANCELED, EVENT_PAYMENT_SUCCEEDED,
};
use crate::settings::Settings;
use crate::services::ReconcileError;

/// Calendar days granted per plan. The year plan is a full 365 days,
/// not twelve 30-day months.
pub fn months_to_days(months: i32) -> i64 {
    match months {
        12 => 365,
        m => m as i64 * 30,
    }
}

/// Turns gateway notifications into entitlement state. All decisions go
/// through the local database: the payment row is the single source of
/// truth for whether a notification has been applied, and the terminal
/// transition is claimed with a conditional update inside the same
/// transaction that writes the entitlement. A replayed delivery either
/// stops at the early status check or loses that claim and rolls back.
pub struct ReconciliationService {
    pool: SqlitePool,
    users: UserRepository,
    payments: PaymentRepository,
    entitlements: EntitlementRepository,
    vpn: Arc<dyn VpnClient>,
    gateway: Arc<dyn PaymentGateway>,
    notifier: Arc<dyn Notifier>,
    settings: Arc<Settings>,
}

impl ReconciliationService {
    pub fn new(
        pool: SqlitePool,
        vpn: Arc<dyn VpnClient>,
        gateway: Arc<dyn PaymentGateway>,
        notifier: Arc<dyn Notifier>,
        settings: Arc<Settings>,
    ) -> Self {
        Self {
            users: UserRepository::new(pool.clone()),
            payments: PaymentRepository::new(pool.clone()),
            entitlements: EntitlementRepository::new(pool.clone()),
            pool,
            vpn,
            gateway,
            notifier,
            settings,
        }
    }

    pub async fn register_user(
        &self,
        tg_id: i64,
        username: Option<&str>,
        first_name: Option<&str>,
        last_name: Option<&str>,
    ) -> anyhow::Result<User> {
        self.users
            .upsert_from_telegram(tg_id, username, first_name, last_name)
            .await
    }

    pub async fn list_active_entitlements(&self, tg_id: i64) -> anyhow::Result<Vec<Entitlement>> {
        match self.users.get_by_tg_id(tg_id).await? {
            Some(user) => self.entitlements.list_active_by_user(user.id).await,
            None => Ok(Vec::new()),
        }
    }

    /// Provisions a trial account directly, no payment involved. Trial
    /// eligibility is consumed forever on first grant; the partial
    /// unique index on trial rows backstops a racing second request.
    pub async fn request_trial(&self, tg_id: i64) -> Result<Entitlement, ReconcileError> {
        let user = self
            .users
            .get_by_tg_id(tg_id)
            .await?
            .ok_or_else(|| anyhow!("user {} is not registered", tg_id))?;

        if self.entitlements.user_has_trial(user.id).await? {
            return Err(ReconcileError::TrialAlreadyUsed);
        }

        let expires_at = Utc::now() + Duration::days(self.settings.trial_days);
        let label = format!("tg_user_{}_trial_{}", tg_id, short_suffix());
        let spec = AccountSpec {
            label: label.clone(),
            expires_at,
            traffic_limit_bytes: self.settings.trial_limit_bytes(),
        };
        let account = self.vpn.create_account(&spec).await?;

        let inserted = self
            .entitlements
            .insert(
                user.id,
                None,
                &account.external_id,
                &account.access_url,
                &label,
                true,
                expires_at,
            )
            .await;
        match inserted {
            Ok(entitlement) => {
                info!(
                    "Granted trial entitlement {} to user {} until {}",
                    entitlement.id, tg_id, expires_at
                );
                Ok(entitlement)
            }
            Err(e) => {
                // Lost a race on the one-trial index; the provisioned
                // account has no owner and must go.
                if let Err(del) = self.vpn.delete_account(&account.external_id).await {
                    warn!(
                        "Failed to clean up orphan trial account {}: {}",
                        account.external_id, del
                    );
                }
                Err(e.into())
            }
        }
    }

    /// Creates a payment intent at the gateway and records it locally
    /// as pending. Fulfilment happens later, driven by the webhook.
    /// Returns the confirmation URL the user must be redirected to.
    pub async fn request_payment(
        &self,
        tg_id: i64,
        months: i32,
        extend_target: Option<i64>,
    ) -> Result<String, ReconcileError> {
        let user = self
            .users
            .get_by_tg_id(tg_id)
            .await?
            .ok_or_else(|| anyhow!("user {} is not registered", tg_id))?;

        let days = months_to_days(months);
        let purpose = match extend_target {
            Some(entitlement_id) => {
                let entitlement = self
                    .entitlements
                    .get_by_id(entitlement_id)
                    .await?
                    .ok_or_else(|| anyhow!("entitlement {} not found", entitlement_id))?;
                if entitlement.user_id != user.id {
                    return Err(ReconcileError::OwnershipMismatch {
                        entitlement_id,
                        user_id: user.id,
                    });
                }
                PaymentPurpose::Extend { entitlement_id, months, days }
            }
            None => PaymentPurpose::Create { months, days },
        };

        let amount_minor = self.settings.base_price_minor * months as i64;
        let description = if months == 1 {
            "VPN access, 1 month".to_string()
        } else {
            format!("VPN access, {} months", months)
        };
        let seq = self.payments.count_by_user(user.id).await?;
        let intent = self
            .gateway
            .create_intent(&IntentRequest {
                amount_minor,
                currency: self.settings.currency.clone(),
                description: description.clone(),
                idempotency_key: idempotency_key(tg_id, &purpose, seq),
                return_url: self.settings.return_url.clone(),
            })
            .await?;

        // A double tap reuses the idempotency key, so the gateway hands
        // back the same payment; the insert is a no-op on the second
        // arrival.
        self.payments
            .create(
                user.id,
                &intent.external_id,
                amount_minor,
                &self.settings.currency,
                &description,
                &purpose,
            )
            .await?;

        info!(
            "Payment {} requested by user {} ({})",
            intent.external_id, tg_id, description
        );
        Ok(intent.redirect_url)
    }

    /// Webhook entry point. `Ok` acknowledges the delivery (including
    /// drops and replays); `Err` asks the provider to redeliver.
    pub async fn on_payment_notification(
        &self,
        notification: &GatewayNotification,
    ) -> Result<(), ReconcileError> {
        let Some(payment) = self
            .payments
            .get_by_external_id(&notification.object.id)
            .await?
        else {
            warn!(
                "Notification for unknown payment {}, acknowledging",
                notification.object.id
            );
            return Ok(());
        };

        if payment.status.is_terminal() {
            info!(
                "Payment {} is already {}, ignoring replayed notification",
                payment.external_id,
                payment.status.as_str()
            );
            return Ok(());
        }

        match notification.event.as_str() {
            EVENT_PAYMENT_SUCCEEDED => {
                if let Some(status) = notification.object.status.as_deref() {
                    if status != "succeeded" {
                        warn!(
                            "Event {} for payment {} carries object status {}, ignoring",
                            notification.event, payment.external_id, status
                        );
                        return Ok(());
                    }
                }
                self.apply_succeeded(&payment).await
            }
            EVENT_PAYMENT_CANCELED => self.apply_canceled(&payment).await,
            other => {
                info!("Ignoring gateway event {}", other);
                Ok(())
            }
        }
    }

    async fn apply_succeeded(&self, payment: &Payment) -> Result<(), ReconcileError> {
        let purpose = match payment.decode_purpose() {
            Ok(p) => p,
            Err(e) => {
                // Redelivery cannot fix a corrupt purpose; leave the
                // payment pending for the operator.
                error!(
                    "Payment {} has undecodable purpose {:?}: {}",
                    payment.external_id, payment.purpose, e
                );
                return Ok(());
            }
        };
        match purpose {
            PaymentPurpose::Create { days, .. } => self.fulfil_create(payment, days).await,
            PaymentPurpose::Extend { entitlement_id, days, .. } => {
                self.fulfil_extend(payment, entitlement_id, days).await
            }
        }
    }

    async fn fulfil_create(&self, payment: &Payment, days: i64) -> Result<(), ReconcileError> {
        let user = self
            .users
            .get_by_id(payment.user_id)
            .await?
            .ok_or_else(|| anyhow!("payment {} references missing user", payment.external_id))?;

        let expires_at = Utc::now() + Duration::days(days);
        let label = format!("tg_user_{}_paid_{}", user.tg_id, short_suffix());
        let spec = AccountSpec {
            label: label.clone(),
            expires_at,
            traffic_limit_bytes: self.settings.default_limit_bytes(),
        };
        let account = match self.vpn.create_account(&spec).await {
            Ok(a) => a,
            Err(e) if e.is_retryable() => return Err(e.into()),
            Err(e) => {
                error!(
                    "Provisioning for payment {} failed permanently: {}",
                    payment.external_id, e
                );
                self.notify_failure(user.tg_id).await;
                return Ok(());
            }
        };

        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;
        let claimed = self
            .payments
            .mark_terminal_tx(&mut tx, payment.id, PaymentStatus::Succeeded)
            .await?;
        if claimed == 0 {
            tx.rollback().await.context("Failed to roll back")?;
            info!(
                "Payment {} was settled by a concurrent delivery",
                payment.external_id
            );
            if let Err(e) = self.vpn.delete_account(&account.external_id).await {
                warn!(
                    "Failed to clean up duplicate account {}: {}",
                    account.external_id, e
                );
            }
            return Ok(());
        }
        let entitlement = self
            .entitlements
            .insert_tx(
                &mut tx,
                user.id,
                Some(payment.id),
                &account.external_id,
                &account.access_url,
                &label,
                expires_at,
            )
            .await?;
        tx.commit().await.with_context(|| {
            format!(
                "Failed to commit entitlement for payment {} (account {} provisioned)",
                payment.external_id, account.external_id
            )
        })?;

        info!(
            "Payment {} fulfilled: entitlement {} for user {} until {}",
            payment.external_id, entitlement.id, user.tg_id, expires_at
        );
        self.notify_access(
            user.tg_id,
            "✅ Payment received\\! Your VPN key is ready\\.",
            &entitlement.access_url,
            entitlement.expires_at,
        )
        .await;
        Ok(())
    }

    async fn fulfil_extend(
        &self,
        payment: &Payment,
        entitlement_id: i64,
        days: i64,
    ) -> Result<(), ReconcileError> {
        let user = self
            .users
            .get_by_id(payment.user_id)
            .await?
            .ok_or_else(|| anyhow!("payment {} references missing user", payment.external_id))?;
        let Some(entitlement) = self.entitlements.get_by_id(entitlement_id).await? else {
            error!(
                "Payment {} targets missing entitlement {}",
                payment.external_id, entitlement_id
            );
            self.notify_failure(user.tg_id).await;
            return Ok(());
        };
        if entitlement.user_id != payment.user_id {
            return Err(ReconcileError::OwnershipMismatch {
                entitlement_id,
                user_id: payment.user_id,
            });
        }

        // The backend may have been extended out of band; its expiry
        // wins over the local record when it tracks one.
        let state = self.vpn.get_account(&entitlement.external_account_id).await?;
        if state.status == AccountStatus::NotFound {
            error!(
                "Payment {} extends entitlement {} but account {} is gone from the backend",
                payment.external_id, entitlement.id, entitlement.external_account_id
            );
            self.notify_failure(user.tg_id).await;
            return Ok(());
        }
        let base = state.expires_at.unwrap_or(entitlement.expires_at);
        let new_expires_at = base.max(Utc::now()) + Duration::days(days);

        // Absolute expiry makes this write idempotent: a concurrent
        // delivery computes the same timestamp from the same base.
        let access_url = match self
            .vpn
            .extend_account(
                &entitlement.external_account_id,
                new_expires_at,
                self.settings.default_limit_bytes(),
            )
            .await
        {
            Ok(url) => url,
            Err(e) if e.is_retryable() => return Err(e.into()),
            Err(e) => {
                error!(
                    "Extension for payment {} failed permanently: {}",
                    payment.external_id, e
                );
                self.notify_failure(user.tg_id).await;
                return Ok(());
            }
        };
        let access_url = if access_url.is_empty() {
            entitlement.access_url.clone()
        } else {
            access_url
        };

        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;
        let claimed = self
            .payments
            .mark_terminal_tx(&mut tx, payment.id, PaymentStatus::Succeeded)
            .await?;
        if claimed == 0 {
            tx.rollback().await.context("Failed to roll back")?;
            info!(
                "Payment {} was settled by a concurrent delivery",
                payment.external_id
            );
            return Ok(());
        }
        self.entitlements
            .extend_tx(&mut tx, entitlement.id, new_expires_at, &access_url)
            .await?;
        tx.commit().await.with_context(|| {
            format!("Failed to commit extension for payment {}", payment.external_id)
        })?;

        info!(
            "Payment {} fulfilled: entitlement {} extended to {}",
            payment.external_id, entitlement.id, new_expires_at
        );
        self.notify_access(
            user.tg_id,
            "✅ Payment received\\! Your subscription was extended\\.",
            &access_url,
            new_expires_at,
        )
        .await;
        Ok(())
    }

    async fn apply_canceled(&self, payment: &Payment) -> Result<(), ReconcileError> {
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;
        let claimed = self
            .payments
            .mark_terminal_tx(&mut tx, payment.id, PaymentStatus::Canceled)
            .await?;
        tx.commit().await.context("Failed to commit cancellation")?;
        if claimed == 0 {
            info!(
                "Payment {} was settled by a concurrent delivery",
                payment.external_id
            );
            return Ok(());
        }

        info!("Payment {} canceled", payment.external_id);
        if let Some(user) = self.users.get_by_id(payment.user_id).await? {
            let text = "❌ Payment was canceled\\. No money was taken\\.";
            if let Err(e) = self.notifier.send_message(user.tg_id, text).await {
                warn!("Failed to notify user {}: {}", user.tg_id, e);
            }
        }
        Ok(())
    }

    async fn notify_access(
        &self,
        tg_id: i64,
        header: &str,
        access_url: &str,
        expires_at: DateTime<Utc>,
    ) {
        let text = format!(
            "{}\n\n🔑 Your access key:\n`{}`\n\n📅 Valid until: {}",
            header,
            escape_md_code(access_url),
            escape_md(&expires_at.format("%Y-%m-%d %H:%M UTC").to_string()),
        );
        if let Err(e) = self.notifier.send_message(tg_id, &text).await {
            warn!("Failed to notify user {}: {}", tg_id, e);
        }
    }

    async fn notify_failure(&self, tg_id: i64) {
        let text = "⚠️ We received your payment but could not set up access automatically\\. \
                    Please contact support\\.";
        if let Err(e) = self.notifier.send_message(tg_id, text).await {
            warn!("Failed to notify user {}: {}", tg_id, e);
        }
    }
}

fn short_suffix() -> String {
    let s = Uuid::new_v4().simple().to_string();
    s[..8].to_string()
}

fn idempotency_key(tg_id: i64, purpose: &PaymentPurpose, seq: i64) -> String {
    let material = match purpose {
        PaymentPurpose::Create { days, .. } => {
            format!("{}:create:new:{}:{}", tg_id, days, seq)
        }
        PaymentPurpose::Extend { entitlement_id, days, .. } => {
            format!("{}:extend:{}:{}:{}", tg_id, entitlement_id, days, seq)
        }
    };
    hex::encode(Sha256::digest(material.as_bytes()))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::clients::NotificationObject;
    use crate::services::test_support::{
        test_pool, test_settings, FailMode, FakeAccount, FakeGateway, FakeVpn, RecordingNotifier,
    };

    struct Harness {
        pool: SqlitePool,
        vpn: Arc<FakeVpn>,
        gateway: Arc<FakeGateway>,
        notifier: Arc<RecordingNotifier>,
        engine: ReconciliationService,
    }

    async fn harness() -> Harness {
        let pool = test_pool().await;
        let vpn = FakeVpn::new();
        let gateway = FakeGateway::new();
        let notifier = RecordingNotifier::new();
        let engine = ReconciliationService::new(
            pool.clone(),
            vpn.clone(),
            gateway.clone(),
            notifier.clone(),
            Arc::new(test_settings()),
        );
        Harness { pool, vpn, gateway, notifier, engine }
    }

    fn note(event: &str, id: &str, status: Option<&str>) -> GatewayNotification {
        GatewayNotification {
            event: event.to_string(),
            object: NotificationObject {
                id: id.to_string(),
                status: status.map(str::to_string),
            },
        }
    }

    fn close_to(a: DateTime<Utc>, b: DateTime<Utc>) -> bool {
        (a - b).num_seconds().abs() < 5
    }

    #[tokio::test]
    async fn trial_is_granted_once() {
        let h = harness().await;
        h.engine.register_user(100, Some("alice"), None, None).await.unwrap();

        let trial = h.engine.request_trial(100).await.unwrap();
        assert!(trial.is_trial);
        assert!(trial.is_active);
        assert!(close_to(trial.expires_at, Utc::now() + Duration::days(3)));
        assert_eq!(h.vpn.create_calls.load(Ordering::SeqCst), 1);

        let second = h.engine.request_trial(100).await;
        assert!(matches!(second, Err(ReconcileError::TrialAlreadyUsed)));
        assert_eq!(h.vpn.create_calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.engine.list_active_entitlements(100).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn payment_request_records_pending_payment() {
        let h = harness().await;
        h.engine.register_user(100, None, None, None).await.unwrap();

        let redirect = h.engine.request_payment(100, 1, None).await.unwrap();
        assert_eq!(redirect, "https://pay.test/confirm");

        let payments = PaymentRepository::new(h.pool.clone());
        let payment = payments.get_by_external_id("pay-0").await.unwrap().unwrap();
        assert_eq!(payment.status, PaymentStatus::Pending);
        assert_eq!(payment.amount_minor, 16000);
        assert_eq!(
            payment.decode_purpose().unwrap(),
            PaymentPurpose::Create { months: 1, days: 30 }
        );

        let requests = h.gateway.requests.lock().await;
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].idempotency_key.len(), 64);
        assert_eq!(requests[0].return_url, "https://t.me/testbot");
    }

    #[tokio::test]
    async fn succeeded_payment_provisions_entitlement() {
        let h = harness().await;
        h.engine.register_user(100, None, None, None).await.unwrap();
        h.engine.request_payment(100, 6, None).await.unwrap();

        h.engine
            .on_payment_notification(&note(EVENT_PAYMENT_SUCCEEDED, "pay-0", Some("succeeded")))
            .await
            .unwrap();

        let payments = PaymentRepository::new(h.pool.clone());
        let payment = payments.get_by_external_id("pay-0").await.unwrap().unwrap();
        assert_eq!(payment.status, PaymentStatus::Succeeded);

        let active = h.engine.list_active_entitlements(100).await.unwrap();
        assert_eq!(active.len(), 1);
        assert!(!active[0].is_trial);
        assert!(close_to(active[0].expires_at, Utc::now() + Duration::days(180)));

        let messages = h.notifier.messages.lock().await;
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].0, 100);
        assert!(messages[0].1.contains(&active[0].access_url));
    }

    #[tokio::test]
    async fn year_plan_grants_a_full_year() {
        let h = harness().await;
        h.engine.register_user(100, None, None, None).await.unwrap();
        h.engine.request_payment(100, 12, None).await.unwrap();

        let payments = PaymentRepository::new(h.pool.clone());
        let payment = payments.get_by_external_id("pay-0").await.unwrap().unwrap();
        assert_eq!(
            payment.decode_purpose().unwrap(),
            PaymentPurpose::Create { months: 12, days: 365 }
        );

        h.engine
            .on_payment_notification(&note(EVENT_PAYMENT_SUCCEEDED, "pay-0", Some("succeeded")))
            .await
            .unwrap();
        let active = h.engine.list_active_entitlements(100).await.unwrap();
        assert_eq!(active.len(), 1);
        assert!(close_to(active[0].expires_at, Utc::now() + Duration::days(365)));
    }

    #[tokio::test]
    async fn concurrent_identical_inserts_share_one_payment_row() {
        let h = harness().await;
        let user = h.engine.register_user(100, None, None, None).await.unwrap();

        // Two requests that raced past the gateway with the same
        // idempotency key carry the same external id.
        let payments = PaymentRepository::new(h.pool.clone());
        let purpose = PaymentPurpose::Create { months: 1, days: 30 };
        let first = payments
            .create(user.id, "pay-same", 16000, "RUB", "VPN access, 1 month", &purpose)
            .await
            .unwrap();
        let second = payments
            .create(user.id, "pay-same", 16000, "RUB", "VPN access, 1 month", &purpose)
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(payments.count_by_user(user.id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn replayed_success_grants_exactly_once() {
        let h = harness().await;
        h.engine.register_user(100, None, None, None).await.unwrap();
        h.engine.request_payment(100, 1, None).await.unwrap();

        let n = note(EVENT_PAYMENT_SUCCEEDED, "pay-0", Some("succeeded"));
        h.engine.on_payment_notification(&n).await.unwrap();
        h.engine.on_payment_notification(&n).await.unwrap();
        h.engine.on_payment_notification(&n).await.unwrap();

        assert_eq!(h.vpn.create_calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.engine.list_active_entitlements(100).await.unwrap().len(), 1);
        assert_eq!(h.notifier.messages.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn trial_then_paid_yields_two_entitlements() {
        let h = harness().await;
        h.engine.register_user(100, None, None, None).await.unwrap();
        h.engine.request_trial(100).await.unwrap();
        h.engine.request_payment(100, 1, None).await.unwrap();

        h.engine
            .on_payment_notification(&note(EVENT_PAYMENT_SUCCEEDED, "pay-0", Some("succeeded")))
            .await
            .unwrap();

        let active = h.engine.list_active_entitlements(100).await.unwrap();
        assert_eq!(active.len(), 2);
        assert_eq!(active.iter().filter(|e| e.is_trial).count(), 1);
    }

    #[tokio::test]
    async fn extension_adds_days_on_top_of_backend_expiry() {
        let h = harness().await;
        let user = h.engine.register_user(100, None, None, None).await.unwrap();

        let entitlements = EntitlementRepository::new(h.pool.clone());
        let backend_expiry = Utc::now() + Duration::days(10);
        h.vpn
            .seed(
                "acc-seeded",
                FakeAccount {
                    access_url: "ss://fake/acc-seeded".to_string(),
                    expires_at: Some(backend_expiry),
                    status: AccountStatus::Active,
                },
            )
            .await;
        let entitlement = entitlements
            .insert(user.id, None, "acc-seeded", "ss://fake/acc-seeded", "key", false, backend_expiry)
            .await
            .unwrap();

        h.engine.request_payment(100, 1, Some(entitlement.id)).await.unwrap();
        h.engine
            .on_payment_notification(&note(EVENT_PAYMENT_SUCCEEDED, "pay-0", Some("succeeded")))
            .await
            .unwrap();

        let reloaded = entitlements.get_by_id(entitlement.id).await.unwrap().unwrap();
        assert!(close_to(reloaded.expires_at, backend_expiry + Duration::days(30)));
        assert_eq!(h.vpn.extend_calls.lock().await.len(), 1);
        assert_eq!(h.vpn.create_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn expired_entitlement_extends_from_now() {
        let h = harness().await;
        let user = h.engine.register_user(100, None, None, None).await.unwrap();

        let entitlements = EntitlementRepository::new(h.pool.clone());
        let past = Utc::now() - Duration::days(5);
        h.vpn
            .seed(
                "acc-old",
                FakeAccount {
                    access_url: "ss://fake/acc-old".to_string(),
                    expires_at: Some(past),
                    status: AccountStatus::Expired,
                },
            )
            .await;
        let entitlement = entitlements
            .insert(user.id, None, "acc-old", "ss://fake/acc-old", "key", false, past)
            .await
            .unwrap();

        h.engine.request_payment(100, 1, Some(entitlement.id)).await.unwrap();
        h.engine
            .on_payment_notification(&note(EVENT_PAYMENT_SUCCEEDED, "pay-0", Some("succeeded")))
            .await
            .unwrap();

        let reloaded = entitlements.get_by_id(entitlement.id).await.unwrap().unwrap();
        assert!(close_to(reloaded.expires_at, Utc::now() + Duration::days(30)));
        assert!(reloaded.is_active);
    }

    #[tokio::test]
    async fn unknown_payment_notification_is_acknowledged() {
        let h = harness().await;
        let result = h
            .engine
            .on_payment_notification(&note(EVENT_PAYMENT_SUCCEEDED, "pay-unknown", Some("succeeded")))
            .await;
        assert!(result.is_ok());
        assert_eq!(h.vpn.create_calls.load(Ordering::SeqCst), 0);
        assert!(h.notifier.messages.lock().await.is_empty());
    }

    #[tokio::test]
    async fn canceled_payment_never_provisions() {
        let h = harness().await;
        h.engine.register_user(100, None, None, None).await.unwrap();
        h.engine.request_payment(100, 1, None).await.unwrap();

        h.engine
            .on_payment_notification(&note(EVENT_PAYMENT_CANCELED, "pay-0", Some("canceled")))
            .await
            .unwrap();

        let payments = PaymentRepository::new(h.pool.clone());
        let payment = payments.get_by_external_id("pay-0").await.unwrap().unwrap();
        assert_eq!(payment.status, PaymentStatus::Canceled);
        assert_eq!(h.vpn.create_calls.load(Ordering::SeqCst), 0);

        // A success arriving after cancellation is a replay of a settled
        // payment and must not grant anything.
        h.engine
            .on_payment_notification(&note(EVENT_PAYMENT_SUCCEEDED, "pay-0", Some("succeeded")))
            .await
            .unwrap();
        assert!(h.engine.list_active_entitlements(100).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn success_event_with_mismatched_status_is_ignored() {
        let h = harness().await;
        h.engine.register_user(100, None, None, None).await.unwrap();
        h.engine.request_payment(100, 1, None).await.unwrap();

        h.engine
            .on_payment_notification(&note(EVENT_PAYMENT_SUCCEEDED, "pay-0", Some("canceled")))
            .await
            .unwrap();

        let payments = PaymentRepository::new(h.pool.clone());
        let payment = payments.get_by_external_id("pay-0").await.unwrap().unwrap();
        assert_eq!(payment.status, PaymentStatus::Pending);
        assert_eq!(h.vpn.create_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn mismatched_owner_blocks_fulfilment() {
        let h = harness().await;
        let alice = h.engine.register_user(100, None, None, None).await.unwrap();
        let bob = h.engine.register_user(200, None, None, None).await.unwrap();

        let entitlements = EntitlementRepository::new(h.pool.clone());
        let expires = Utc::now() + Duration::days(10);
        let owned_by_alice = entitlements
            .insert(alice.id, None, "acc-a", "ss://fake/acc-a", "key", false, expires)
            .await
            .unwrap();

        // Crafted payment by bob targeting alice's entitlement; the
        // request path would have rejected it, the fulfilment path must
        // hold the same line.
        let payments = PaymentRepository::new(h.pool.clone());
        payments
            .create(
                bob.id,
                "pay-evil",
                16000,
                "RUB",
                "VPN access, 1 month",
                &PaymentPurpose::Extend {
                    entitlement_id: owned_by_alice.id,
                    months: 1,
                    days: 30,
                },
            )
            .await
            .unwrap();

        let result = h
            .engine
            .on_payment_notification(&note(EVENT_PAYMENT_SUCCEEDED, "pay-evil", Some("succeeded")))
            .await;
        assert!(matches!(result, Err(ReconcileError::OwnershipMismatch { .. })));

        let payment = payments.get_by_external_id("pay-evil").await.unwrap().unwrap();
        assert_eq!(payment.status, PaymentStatus::Pending);
        assert!(h.vpn.extend_calls.lock().await.is_empty());
    }

    #[tokio::test]
    async fn transient_backend_failure_leaves_payment_retryable() {
        let h = harness().await;
        h.engine.register_user(100, None, None, None).await.unwrap();
        h.engine.request_payment(100, 1, None).await.unwrap();

        h.vpn.set_fail_create(FailMode::Transient).await;
        let n = note(EVENT_PAYMENT_SUCCEEDED, "pay-0", Some("succeeded"));
        let result = h.engine.on_payment_notification(&n).await;
        assert!(matches!(result, Err(ReconcileError::Vpn(_))));

        let payments = PaymentRepository::new(h.pool.clone());
        let payment = payments.get_by_external_id("pay-0").await.unwrap().unwrap();
        assert_eq!(payment.status, PaymentStatus::Pending);
        assert!(h.engine.list_active_entitlements(100).await.unwrap().is_empty());

        // Redelivery after the backend recovers completes the grant.
        h.vpn.set_fail_create(FailMode::None).await;
        h.engine.on_payment_notification(&n).await.unwrap();
        assert_eq!(h.engine.list_active_entitlements(100).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn permanent_backend_failure_acks_and_alerts() {
        let h = harness().await;
        h.engine.register_user(100, None, None, None).await.unwrap();
        h.engine.request_payment(100, 1, None).await.unwrap();

        h.vpn.set_fail_create(FailMode::Permanent).await;
        h.engine
            .on_payment_notification(&note(EVENT_PAYMENT_SUCCEEDED, "pay-0", Some("succeeded")))
            .await
            .unwrap();

        let payments = PaymentRepository::new(h.pool.clone());
        let payment = payments.get_by_external_id("pay-0").await.unwrap().unwrap();
        assert_eq!(payment.status, PaymentStatus::Pending);
        assert!(h.engine.list_active_entitlements(100).await.unwrap().is_empty());

        let messages = h.notifier.messages.lock().await;
        assert_eq!(messages.len(), 1);
        assert!(messages[0].1.contains("contact support"));
    }

    #[test]
    fn plan_durations_match_offered_periods() {
        assert_eq!(months_to_days(1), 30);
        assert_eq!(months_to_days(6), 180);
        assert_eq!(months_to_days(12), 365);
    }

    #[tokio::test]
    async fn idempotency_key_is_stable_per_purchase_attempt() {
        let purpose = PaymentPurpose::Create { months: 1, days: 30 };
        let a = idempotency_key(100, &purpose, 0);
        let b = idempotency_key(100, &purpose, 0);
        assert_eq!(a, b);
        assert_ne!(a, idempotency_key(100, &purpose, 1));
        assert_ne!(
            a,
            idempotency_key(100, &PaymentPurpose::Extend { entitlement_id: 1, months: 1, days: 30 }, 0)
        );
    }
}
