use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::info;

use super::{IntentRequest, PaymentGateway, PaymentIntent, HTTP_TIMEOUT_SECS};

const API_URL: &str = "https://api.yookassa.ru/v3";

/// YooKassa payment gateway. One call per intent, no internal retry;
/// deduplication is carried by the caller-supplied `Idempotence-Key`.
pub struct YooKassaGateway {
    client: reqwest::Client,
    shop_id: String,
    secret_key: String,
}

#[derive(Debug, Deserialize)]
struct CreatePaymentResponse {
    id: String,
    status: String,
    confirmation: Option<Confirmation>,
}

#[derive(Debug, Deserialize)]
struct Confirmation {
    confirmation_url: Option<String>,
}

impl YooKassaGateway {
    pub fn new(shop_id: &str, secret_key: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            client,
            shop_id: shop_id.to_string(),
            secret_key: secret_key.to_string(),
        })
    }
}

#[async_trait]
impl PaymentGateway for YooKassaGateway {
    async fn create_intent(&self, req: &IntentRequest) -> Result<PaymentIntent> {
        let body = serde_json::json!({
            "amount": {
                "value": format!("{:.2}", req.amount_minor as f64 / 100.0),
                "currency": req.currency,
            },
            "capture": true,
            "confirmation": {
                "type": "redirect",
                "return_url": req.return_url,
            },
            "description": req.description,
        });

        let resp = self
            .client
            .post(format!("{}/payments", API_URL))
            .basic_auth(&self.shop_id, Some(&self.secret_key))
            .header("Idempotence-Key", &req.idempotency_key)
            .json(&body)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(anyhow!("YooKassa payment creation failed ({}): {}", status, text));
        }

        let payment: CreatePaymentResponse = resp.json().await?;
        let redirect_url = payment
            .confirmation
            .and_then(|c| c.confirmation_url)
            .ok_or_else(|| anyhow!("YooKassa response missing confirmation_url"))?;

        info!("Created YooKassa payment {} ({})", payment.id, payment.status);
        Ok(PaymentIntent {
            external_id: payment.id,
            redirect_url,
            status: payment.status,
        })
    }
}
