use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use tokio::sync::Mutex;

use crate::bot_manager::Notifier;
use crate::clients::{
    AccountSpec, AccountState, AccountStatus, IntentRequest, PaymentGateway, PaymentIntent,
    ProvisionedAccount, VpnClient, VpnError,
};
use crate::settings::{Settings, VpnBackend};

pub async fn test_pool() -> SqlitePool {
    // A single connection keeps every query on the same in-memory database.
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("in-memory pool");
    keygate_db::MIGRATOR.run(&pool).await.expect("migrations");
    pool
}

pub fn test_settings() -> Settings {
    Settings {
        bot_token: "test-token".to_string(),
        vpn_backend: VpnBackend::Outline,
        outline_api_url: String::new(),
        outline_cert_sha256: String::new(),
        marzban_base_url: String::new(),
        marzban_username: String::new(),
        marzban_password: String::new(),
        yookassa_shop_id: String::new(),
        yookassa_secret_key: String::new(),
        return_url: "https://t.me/testbot".to_string(),
        base_price_minor: 16000,
        currency: "RUB".to_string(),
        trial_days: 3,
        trial_traffic_limit_gb: 5,
        default_traffic_limit_gb: 0,
        sweep_interval_secs: 120,
        webhook_bind: "127.0.0.1:0".to_string(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailMode {
    None,
    Transient,
    Permanent,
}

impl FailMode {
    fn to_error(self) -> Option<VpnError> {
        match self {
            FailMode::None => None,
            FailMode::Transient => Some(VpnError::Transient("backend unreachable".to_string())),
            FailMode::Permanent => Some(VpnError::Permanent("HTTP 400: bad request".to_string())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FakeAccount {
    pub access_url: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub status: AccountStatus,
}

/// In-memory stand-in for a VPN control plane. Records every mutating
/// call so tests can assert on exactly-once provisioning.
pub struct FakeVpn {
    pub accounts: Mutex<HashMap<String, FakeAccount>>,
    pub create_calls: AtomicUsize,
    pub extend_calls: Mutex<Vec<(String, DateTime<Utc>)>>,
    pub delete_calls: Mutex<Vec<String>>,
    pub fail_create: Mutex<FailMode>,
    pub fail_get: Mutex<FailMode>,
    pub fail_delete: Mutex<FailMode>,
    seq: AtomicUsize,
}

impl FakeVpn {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            accounts: Mutex::new(HashMap::new()),
            create_calls: AtomicUsize::new(0),
            extend_calls: Mutex::new(Vec::new()),
            delete_calls: Mutex::new(Vec::new()),
            fail_create: Mutex::new(FailMode::None),
            fail_get: Mutex::new(FailMode::None),
            fail_delete: Mutex::new(FailMode::None),
            seq: AtomicUsize::new(0),
        })
    }

    pub async fn seed(&self, external_id: &str, account: FakeAccount) {
        self.accounts
            .lock()
            .await
            .insert(external_id.to_string(), account);
    }

    pub async fn set_fail_create(&self, mode: FailMode) {
        *self.fail_create.lock().await = mode;
    }

    pub async fn set_fail_get(&self, mode: FailMode) {
        *self.fail_get.lock().await = mode;
    }

    pub async fn set_fail_delete(&self, mode: FailMode) {
        *self.fail_delete.lock().await = mode;
    }
}

#[async_trait]
impl VpnClient for FakeVpn {
    async fn create_account(&self, spec: &AccountSpec) -> Result<ProvisionedAccount, VpnError> {
        if let Some(err) = self.fail_create.lock().await.to_error() {
            return Err(err);
        }
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        let n = self.seq.fetch_add(1, Ordering::SeqCst);
        let external_id = format!("acc-{}", n);
        let access_url = format!("ss://fake/{}", external_id);
        self.accounts.lock().await.insert(
            external_id.clone(),
            FakeAccount {
                access_url: access_url.clone(),
                expires_at: Some(spec.expires_at),
                status: AccountStatus::Active,
            },
        );
        Ok(ProvisionedAccount { external_id, access_url })
    }

    async fn get_account(&self, external_id: &str) -> Result<AccountState, VpnError> {
        if let Some(err) = self.fail_get.lock().await.to_error() {
            return Err(err);
        }
        match self.accounts.lock().await.get(external_id) {
            Some(a) => Ok(AccountState {
                status: a.status,
                expires_at: a.expires_at,
                traffic_used: None,
                traffic_limit: None,
                access_url: Some(a.access_url.clone()),
            }),
            None => Ok(AccountState::not_found()),
        }
    }

    async fn extend_account(
        &self,
        external_id: &str,
        new_expires_at: DateTime<Utc>,
        _traffic_limit_bytes: Option<u64>,
    ) -> Result<String, VpnError> {
        let mut accounts = self.accounts.lock().await;
        let account = accounts.get_mut(external_id).ok_or(VpnError::NotFound)?;
        account.expires_at = Some(new_expires_at);
        let access_url = account.access_url.clone();
        drop(accounts);
        self.extend_calls
            .lock()
            .await
            .push((external_id.to_string(), new_expires_at));
        Ok(access_url)
    }

    async fn delete_account(&self, external_id: &str) -> Result<(), VpnError> {
        if let Some(err) = self.fail_delete.lock().await.to_error() {
            return Err(err);
        }
        self.accounts.lock().await.remove(external_id);
        self.delete_calls.lock().await.push(external_id.to_string());
        Ok(())
    }
}

/// Gateway double returning sequential external ids and recording
/// intent requests, idempotency keys included.
pub struct FakeGateway {
    pub requests: Mutex<Vec<IntentRequest>>,
    seq: AtomicUsize,
}

impl FakeGateway {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            requests: Mutex::new(Vec::new()),
            seq: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl PaymentGateway for FakeGateway {
    async fn create_intent(&self, req: &IntentRequest) -> anyhow::Result<PaymentIntent> {
        self.requests.lock().await.push(req.clone());
        let n = self.seq.fetch_add(1, Ordering::SeqCst);
        Ok(PaymentIntent {
            external_id: format!("pay-{}", n),
            redirect_url: "https://pay.test/confirm".to_string(),
            status: "pending".to_string(),
        })
    }
}

pub struct RecordingNotifier {
    pub messages: Mutex<Vec<(i64, String)>>,
}

impl RecordingNotifier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { messages: Mutex::new(Vec::new()) })
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send_message(&self, tg_id: i64, text: &str) -> anyhow::Result<()> {
        self.messages.lock().await.push((tg_id, text.to_string()));
        Ok(())
    }
}
