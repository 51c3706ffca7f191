use anyhow::{Context, Result};
use std::env;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VpnBackend {
    Outline,
    Marzban,
}

/// Runtime configuration, read once from the environment at startup.
#[derive(Debug, Clone)]
pub struct Settings {
    pub bot_token: String,

    pub vpn_backend: VpnBackend,
    pub outline_api_url: String,
    pub outline_cert_sha256: String,
    pub marzban_base_url: String,
    pub marzban_username: String,
    pub marzban_password: String,

    pub yookassa_shop_id: String,
    pub yookassa_secret_key: String,
    pub return_url: String,

    /// Price per month, in minor currency units (kopecks).
    pub base_price_minor: i64,
    pub currency: String,

    pub trial_days: i64,
    pub trial_traffic_limit_gb: u64,
    pub default_traffic_limit_gb: u64,

    pub sweep_interval_secs: u64,
    pub webhook_bind: String,
}

fn var_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key).ok().and_then(|s| s.parse().ok()).unwrap_or(default)
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        let bot_token = env::var("BOT_TOKEN").context("BOT_TOKEN must be set in .env")?;

        let vpn_backend = match var_or("VPN_BACKEND", "outline").to_lowercase().as_str() {
            "outline" => VpnBackend::Outline,
            "marzban" => VpnBackend::Marzban,
            other => return Err(anyhow::anyhow!("Unknown VPN_BACKEND: {}", other)),
        };

        let base_price: f64 = var_or("BASE_PRICE_PER_MONTH", "160.00")
            .parse()
            .context("BASE_PRICE_PER_MONTH must be a decimal amount")?;

        Ok(Self {
            bot_token,
            vpn_backend,
            outline_api_url: var_or("OUTLINE_API_URL", ""),
            outline_cert_sha256: var_or("OUTLINE_CERT_SHA256", ""),
            marzban_base_url: var_or("MARZBAN_BASE_URL", ""),
            marzban_username: var_or("MARZBAN_USERNAME", ""),
            marzban_password: var_or("MARZBAN_PASSWORD", ""),
            yookassa_shop_id: var_or("YOOKASSA_SHOP_ID", ""),
            yookassa_secret_key: var_or("YOOKASSA_SECRET_KEY", ""),
            return_url: var_or("YOOKASSA_RETURN_URL", "https://t.me"),
            base_price_minor: (base_price * 100.0).round() as i64,
            currency: var_or("CURRENCY", "RUB"),
            trial_days: parse_or("TRIAL_DURATION_DAYS", 3),
            trial_traffic_limit_gb: parse_or("TRIAL_TRAFFIC_LIMIT_GB", 5),
            default_traffic_limit_gb: parse_or("DEFAULT_TRAFFIC_LIMIT_GB", 0),
            sweep_interval_secs: parse_or("SWEEP_INTERVAL_SECS", 120),
            webhook_bind: var_or("WEBHOOK_BIND", "0.0.0.0:5001"),
        })
    }

    /// 0 GB means unlimited.
    pub fn trial_limit_bytes(&self) -> Option<u64> {
        gb_to_bytes(self.trial_traffic_limit_gb)
    }

    pub fn default_limit_bytes(&self) -> Option<u64> {
        gb_to_bytes(self.default_traffic_limit_gb)
    }
}

fn gb_to_bytes(gb: u64) -> Option<u64> {
    if gb == 0 {
        None
    } else {
        Some(gb * 1024 * 1024 * 1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_gb_means_unlimited() {
        assert_eq!(gb_to_bytes(0), None);
        assert_eq!(gb_to_bytes(1), Some(1073741824));
    }
}
