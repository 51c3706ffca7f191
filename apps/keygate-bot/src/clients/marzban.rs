use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::{
    AccountSpec, AccountState, AccountStatus, ProvisionedAccount, VpnClient, VpnError,
    HTTP_TIMEOUT_SECS,
};

/// Marzban panel client. Accounts are panel users keyed by username,
/// with server-side expiry and traffic limits.
///
/// The admin token is cached behind a mutex, fetched lazily and
/// refreshed exactly once when a call comes back 401. No module-level
/// singletons, no background renewal.
pub struct MarzbanClient {
    client: reqwest::Client,
    base_url: String,
    username: String,
    password: String,
    token: Mutex<Option<String>>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct MarzbanUser {
    username: String,
    status: String,
    expire: Option<i64>,
    used_traffic: Option<u64>,
    data_limit: Option<u64>,
    subscription_url: Option<String>,
}

impl MarzbanClient {
    pub fn new(base_url: &str, username: &str, password: &str) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            username: username.to_string(),
            password: password.to_string(),
            token: Mutex::new(None),
        })
    }

    async fn access_token(&self, force_refresh: bool) -> Result<String, VpnError> {
        let mut guard = self.token.lock().await;
        if !force_refresh {
            if let Some(token) = guard.as_ref() {
                return Ok(token.clone());
            }
        }

        let url = format!("{}/api/admin/token", self.base_url);
        let resp = self
            .client
            .post(&url)
            .form(&[
                ("grant_type", "password"),
                ("username", self.username.as_str()),
                ("password", self.password.as_str()),
            ])
            .send()
            .await
            .map_err(VpnError::from_reqwest)?;
        if !resp.status().is_success() {
            let status = resp.status();
            return Err(VpnError::from_status(status, resp.text().await.unwrap_or_default()));
        }
        let token: TokenResponse = resp.json().await.map_err(VpnError::from_reqwest)?;
        *guard = Some(token.access_token.clone());
        info!("Obtained Marzban admin token");
        Ok(token.access_token)
    }

    /// Sends an authenticated request, retrying once with a fresh token
    /// if the cached one has expired.
    async fn send_authed(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<reqwest::Response, VpnError> {
        let mut force = false;
        for attempt in 0..2 {
            let token = self.access_token(force).await?;
            let url = format!("{}{}", self.base_url, path);
            let mut req = self.client.request(method.clone(), &url).bearer_auth(&token);
            if let Some(json) = body {
                req = req.json(json);
            }
            let resp = req.send().await.map_err(VpnError::from_reqwest)?;

            if resp.status() == reqwest::StatusCode::UNAUTHORIZED && attempt == 0 {
                warn!("Marzban token rejected, forcing refresh");
                let mut guard = self.token.lock().await;
                *guard = None;
                drop(guard);
                force = true;
                continue;
            }
            return Ok(resp);
        }
        Err(VpnError::Auth)
    }

    fn user_to_state(&self, user: MarzbanUser) -> AccountState {
        let status = match user.status.as_str() {
            "active" | "on_hold" => AccountStatus::Active,
            "disabled" => AccountStatus::Disabled,
            "expired" => AccountStatus::Expired,
            "limited" => AccountStatus::Limited,
            _ => AccountStatus::Disabled,
        };
        AccountState {
            status,
            expires_at: user.expire.and_then(|ts| Utc.timestamp_opt(ts, 0).single()),
            traffic_used: user.used_traffic,
            traffic_limit: user.data_limit,
            access_url: user.subscription_url.map(|u| self.absolute_url(u)),
        }
    }

    fn absolute_url(&self, url: String) -> String {
        if url.starts_with("http") {
            url
        } else {
            format!("{}{}", self.base_url, url)
        }
    }
}

#[async_trait]
impl VpnClient for MarzbanClient {
    async fn create_account(&self, spec: &AccountSpec) -> Result<ProvisionedAccount, VpnError> {
        let body = serde_json::json!({
            "username": spec.label,
            "proxies": { "vless": {} },
            "expire": spec.expires_at.timestamp(),
            "data_limit": spec.traffic_limit_bytes.unwrap_or(0),
            "data_limit_reset_strategy": "no_reset",
            "status": "active",
        });
        let resp = self
            .send_authed(reqwest::Method::POST, "/api/user", Some(&body))
            .await?;
        if !resp.status().is_success() {
            let status = resp.status();
            return Err(VpnError::from_status(status, resp.text().await.unwrap_or_default()));
        }
        let user: MarzbanUser = resp.json().await.map_err(VpnError::from_reqwest)?;
        let access_url = user
            .subscription_url
            .clone()
            .map(|u| self.absolute_url(u))
            .unwrap_or_default();

        info!("Created Marzban user {}", user.username);
        Ok(ProvisionedAccount {
            external_id: user.username,
            access_url,
        })
    }

    async fn get_account(&self, external_id: &str) -> Result<AccountState, VpnError> {
        let path = format!("/api/user/{}", external_id);
        let resp = self.send_authed(reqwest::Method::GET, &path, None).await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(AccountState::not_found());
        }
        if !resp.status().is_success() {
            let status = resp.status();
            return Err(VpnError::from_status(status, resp.text().await.unwrap_or_default()));
        }
        let user: MarzbanUser = resp.json().await.map_err(VpnError::from_reqwest)?;
        Ok(self.user_to_state(user))
    }

    async fn extend_account(
        &self,
        external_id: &str,
        new_expires_at: DateTime<Utc>,
        traffic_limit_bytes: Option<u64>,
    ) -> Result<String, VpnError> {
        // PUT only overrides the fields we send; proxies and inbound
        // assignments configured on the panel are preserved.
        let body = serde_json::json!({
            "expire": new_expires_at.timestamp(),
            "data_limit": traffic_limit_bytes.unwrap_or(0),
            "status": "active",
        });
        let path = format!("/api/user/{}", external_id);
        let resp = self
            .send_authed(reqwest::Method::PUT, &path, Some(&body))
            .await?;
        if !resp.status().is_success() {
            let status = resp.status();
            return Err(VpnError::from_status(status, resp.text().await.unwrap_or_default()));
        }
        let user: MarzbanUser = resp.json().await.map_err(VpnError::from_reqwest)?;
        Ok(user
            .subscription_url
            .map(|u| self.absolute_url(u))
            .unwrap_or_default())
    }

    async fn delete_account(&self, external_id: &str) -> Result<(), VpnError> {
        let path = format!("/api/user/{}", external_id);
        let resp = self
            .send_authed(reqwest::Method::DELETE, &path, None)
            .await?;
        let status = resp.status();
        if status.is_success() || status == reqwest::StatusCode::NOT_FOUND {
            Ok(())
        } else {
            Err(VpnError::from_status(status, resp.text().await.unwrap_or_default()))
        }
    }
}
