use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::time::Duration;
use tracing::{info, warn};

use super::{
    AccountSpec, AccountState, AccountStatus, ProvisionedAccount, VpnClient, VpnError,
    HTTP_TIMEOUT_SECS,
};

/// Outline management API: a flat key store with no server-side expiry.
/// Expiry is tracked locally only; `get_account` therefore reports
/// `expires_at: None` and the sweeper treats that as "no out-of-band
/// extension happened".
pub struct OutlineClient {
    client: reqwest::Client,
    api_url: String,
}

#[derive(Debug, Deserialize)]
struct OutlineKey {
    id: String,
    #[serde(rename = "accessUrl")]
    access_url: String,
}

#[derive(Debug, Deserialize)]
struct OutlineKeyList {
    #[serde(rename = "accessKeys")]
    access_keys: Vec<OutlineKey>,
}

impl OutlineClient {
    /// `cert_sha256` is the fingerprint the Outline installer prints.
    /// The management API serves a self-signed certificate, so standard
    /// verification cannot apply; the fingerprint is kept in config for
    /// the operator and the client skips chain validation.
    pub fn new(api_url: &str, _cert_sha256: &str) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            client,
            api_url: api_url.trim_end_matches('/').to_string(),
        })
    }

    async fn set_data_limit(&self, key_id: &str, bytes: u64) -> Result<(), VpnError> {
        let url = format!("{}/access-keys/{}/data-limit", self.api_url, key_id);
        let resp = self
            .client
            .put(&url)
            .json(&serde_json::json!({ "limit": { "bytes": bytes } }))
            .send()
            .await
            .map_err(VpnError::from_reqwest)?;
        if resp.status().is_success() {
            Ok(())
        } else {
            let status = resp.status();
            Err(VpnError::from_status(status, resp.text().await.unwrap_or_default()))
        }
    }
}

#[async_trait]
impl VpnClient for OutlineClient {
    async fn create_account(&self, spec: &AccountSpec) -> Result<ProvisionedAccount, VpnError> {
        let url = format!("{}/access-keys", self.api_url);
        let resp = self
            .client
            .post(&url)
            .send()
            .await
            .map_err(VpnError::from_reqwest)?;
        if !resp.status().is_success() {
            let status = resp.status();
            return Err(VpnError::from_status(status, resp.text().await.unwrap_or_default()));
        }
        let key: OutlineKey = resp.json().await.map_err(VpnError::from_reqwest)?;

        // Name is cosmetic on Outline; failure to set it is not fatal.
        let name_url = format!("{}/access-keys/{}/name", self.api_url, key.id);
        if let Err(e) = self
            .client
            .put(&name_url)
            .json(&serde_json::json!({ "name": spec.label }))
            .send()
            .await
        {
            warn!("Failed to set name for Outline key {}: {}", key.id, e);
        }

        if let Some(bytes) = spec.traffic_limit_bytes {
            self.set_data_limit(&key.id, bytes).await?;
        }

        info!("Created Outline key {} ({})", key.id, spec.label);
        Ok(ProvisionedAccount {
            external_id: key.id,
            access_url: key.access_url,
        })
    }

    async fn get_account(&self, external_id: &str) -> Result<AccountState, VpnError> {
        let url = format!("{}/access-keys", self.api_url);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(VpnError::from_reqwest)?;
        if !resp.status().is_success() {
            let status = resp.status();
            return Err(VpnError::from_status(status, resp.text().await.unwrap_or_default()));
        }
        let list: OutlineKeyList = resp.json().await.map_err(VpnError::from_reqwest)?;

        match list.access_keys.into_iter().find(|k| k.id == external_id) {
            Some(key) => Ok(AccountState {
                status: AccountStatus::Active,
                expires_at: None,
                traffic_used: None,
                traffic_limit: None,
                access_url: Some(key.access_url),
            }),
            None => Ok(AccountState::not_found()),
        }
    }

    async fn extend_account(
        &self,
        external_id: &str,
        _new_expires_at: DateTime<Utc>,
        traffic_limit_bytes: Option<u64>,
    ) -> Result<String, VpnError> {
        // Outline has nowhere to store the expiry; verify the key still
        // exists and refresh the data limit. The local record owns the
        // expiry.
        let state = self.get_account(external_id).await?;
        let access_url = match state.status {
            AccountStatus::NotFound => return Err(VpnError::NotFound),
            _ => state.access_url.unwrap_or_default(),
        };
        if let Some(bytes) = traffic_limit_bytes {
            self.set_data_limit(external_id, bytes).await?;
        }
        Ok(access_url)
    }

    async fn delete_account(&self, external_id: &str) -> Result<(), VpnError> {
        let url = format!("{}/access-keys/{}", self.api_url, external_id);
        let resp = self
            .client
            .delete(&url)
            .send()
            .await
            .map_err(VpnError::from_reqwest)?;
        let status = resp.status();
        if status.is_success() || status == reqwest::StatusCode::NOT_FOUND {
            // Already gone is success.
            Ok(())
        } else {
            Err(VpnError::from_status(status, resp.text().await.unwrap_or_default()))
        }
    }
}
