use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct User {
    pub id: i64,
    pub tg_id: i64,
    pub username: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    WaitingCapture,
    Succeeded,
    Canceled,
}

impl PaymentStatus {
    /// Terminal statuses are never mutated again; replayed notifications
    /// for a terminal payment are dropped.
    pub fn is_terminal(&self) -> bool {
        matches!(self, PaymentStatus::Succeeded | PaymentStatus::Canceled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::WaitingCapture => "waiting_capture",
            PaymentStatus::Succeeded => "succeeded",
            PaymentStatus::Canceled => "canceled",
        }
    }
}

/// What a payment buys. Stored as tagged JSON in `payments.purpose`
/// instead of a loose key/value map, so a missing field is a decode
/// error rather than a silent default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum PaymentPurpose {
    Create { months: i32, days: i64 },
    Extend { entitlement_id: i64, months: i32, days: i64 },
}

impl PaymentPurpose {
    pub fn days(&self) -> i64 {
        match self {
            PaymentPurpose::Create { days, .. } => *days,
            PaymentPurpose::Extend { days, .. } => *days,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Payment {
    pub id: i64,
    pub user_id: i64,
    pub external_id: String,
    pub amount_minor: i64,
    pub currency: String,
    pub status: PaymentStatus,
    pub description: Option<String>,
    pub purpose: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Payment {
    pub fn decode_purpose(&self) -> Result<PaymentPurpose, serde_json::Error> {
        serde_json::from_str(&self.purpose)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Entitlement {
    pub id: i64,
    pub user_id: i64,
    pub payment_id: Option<i64>,
    pub external_account_id: String,
    pub access_url: String,
    pub label: Option<String>,
    pub is_trial: bool,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn purpose_round_trips_as_tagged_json() {
        let p = PaymentPurpose::Extend { entitlement_id: 7, months: 1, days: 30 };
        let json = serde_json::to_string(&p).unwrap();
        assert!(json.contains("\"action\":\"extend\""));
        assert!(json.contains("\"entitlement_id\":7"));
        let back: PaymentPurpose = serde_json::from_str(&json).unwrap();
        assert_eq!(back, p);
    }

    #[test]
    fn purpose_without_action_tag_is_rejected() {
        let err = serde_json::from_str::<PaymentPurpose>(r#"{"months":1,"days":30}"#);
        assert!(err.is_err());
    }

    #[test]
    fn terminal_statuses() {
        assert!(PaymentStatus::Succeeded.is_terminal());
        assert!(PaymentStatus::Canceled.is_terminal());
        assert!(!PaymentStatus::Pending.is_terminal());
        assert!(!PaymentStatus::WaitingCapture.is_terminal());
    }
}
