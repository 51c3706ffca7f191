use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use thiserror::Error;

pub mod marzban;
pub mod outline;
pub mod yookassa;

pub use marzban::MarzbanClient;
pub use outline::OutlineClient;
pub use yookassa::YooKassaGateway;

/// Bound applied to every control-plane and gateway call.
pub const HTTP_TIMEOUT_SECS: u64 = 20;

pub const EVENT_PAYMENT_SUCCEEDED: &str = "payment.succeeded";
pub const EVENT_PAYMENT_CANCELED: &str = "payment.canceled";

#[derive(Debug, Error)]
pub enum VpnError {
    #[error("account not found on backend")]
    NotFound,
    #[error("backend authentication failed")]
    Auth,
    #[error("transient backend failure: {0}")]
    Transient(String),
    #[error("permanent backend failure: {0}")]
    Permanent(String),
}

impl VpnError {
    /// Timeouts and connection errors are retryable; they never mean
    /// the account is absent.
    pub fn from_reqwest(e: reqwest::Error) -> Self {
        VpnError::Transient(e.to_string())
    }

    pub fn from_status(status: reqwest::StatusCode, body: String) -> Self {
        match status.as_u16() {
            401 | 403 => VpnError::Auth,
            404 => VpnError::NotFound,
            s if status.is_server_error() => VpnError::Transient(format!("HTTP {}: {}", s, body)),
            s => VpnError::Permanent(format!("HTTP {}: {}", s, body)),
        }
    }

    /// Retryable failures leave local state untouched and rely on the
    /// provider's at-least-once redelivery (or the next sweep tick).
    pub fn is_retryable(&self) -> bool {
        matches!(self, VpnError::Transient(_) | VpnError::Auth)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountStatus {
    Active,
    Disabled,
    Expired,
    Limited,
    NotFound,
}

/// Desired shape of a new VPN account.
#[derive(Debug, Clone)]
pub struct AccountSpec {
    pub label: String,
    pub expires_at: DateTime<Utc>,
    pub traffic_limit_bytes: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct ProvisionedAccount {
    pub external_id: String,
    pub access_url: String,
}

/// Live backend state for one account. Backends that do not track a
/// field (Outline has no server-side expiry) report `None`.
#[derive(Debug, Clone)]
pub struct AccountState {
    pub status: AccountStatus,
    pub expires_at: Option<DateTime<Utc>>,
    pub traffic_used: Option<u64>,
    pub traffic_limit: Option<u64>,
    pub access_url: Option<String>,
}

impl AccountState {
    pub fn not_found() -> Self {
        Self {
            status: AccountStatus::NotFound,
            expires_at: None,
            traffic_used: None,
            traffic_limit: None,
            access_url: None,
        }
    }
}

/// Superset contract over the VPN control plane. The reconciliation
/// engine never calls `create_account` twice for the same logical
/// entitlement (local state is checked first), and `delete_account`
/// on an absent account is success.
#[async_trait]
pub trait VpnClient: Send + Sync {
    async fn create_account(&self, spec: &AccountSpec) -> Result<ProvisionedAccount, VpnError>;

    async fn get_account(&self, external_id: &str) -> Result<AccountState, VpnError>;

    /// Pushes expiry forward, preserving backend-side connection
    /// configuration that is not explicitly overridden. Returns the
    /// (possibly regenerated) access descriptor.
    async fn extend_account(
        &self,
        external_id: &str,
        new_expires_at: DateTime<Utc>,
        traffic_limit_bytes: Option<u64>,
    ) -> Result<String, VpnError>;

    async fn delete_account(&self, external_id: &str) -> Result<(), VpnError>;
}

#[derive(Debug, Clone)]
pub struct IntentRequest {
    pub amount_minor: i64,
    pub currency: String,
    pub description: String,
    /// Derived deterministically from (user, action, target, duration)
    /// so duplicate taps reuse the same key and cannot double-charge.
    pub idempotency_key: String,
    pub return_url: String,
}

#[derive(Debug, Clone)]
pub struct PaymentIntent {
    pub external_id: String,
    pub redirect_url: String,
    pub status: String,
}

/// Payment-provider contract. Intent creation failures surface to the
/// caller; retry policy belongs to the bot layer, not this client.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_intent(&self, req: &IntentRequest) -> anyhow::Result<PaymentIntent>;
}

/// Inbound webhook payload. Unknown events are accepted and ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayNotification {
    pub event: String,
    pub object: NotificationObject,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NotificationObject {
    pub id: String,
    pub status: Option<String>,
}
