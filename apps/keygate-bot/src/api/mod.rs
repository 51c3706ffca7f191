use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use tracing::{error, warn};

use crate::clients::GatewayNotification;
use crate::AppState;

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/yookassa/webhook", post(yookassa_webhook))
        .with_state(state)
}

/// 200 acknowledges the delivery, anything else makes the gateway
/// redeliver. Malformed payloads get 400 so they are not retried
/// forever.
async fn yookassa_webhook(
    State(state): State<AppState>,
    payload: Result<Json<GatewayNotification>, JsonRejection>,
) -> StatusCode {
    let Json(notification) = match payload {
        Ok(p) => p,
        Err(e) => {
            warn!("Rejected malformed webhook payload: {}", e);
            return StatusCode::BAD_REQUEST;
        }
    };

    match state.engine.on_payment_notification(&notification).await {
        Ok(()) => StatusCode::OK,
        Err(e) => {
            error!(
                "Webhook for payment {} failed, asking for redelivery: {}",
                notification.object.id, e
            );
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::clients::GatewayNotification;

    #[test]
    fn notification_payload_decodes_with_extra_fields() {
        let raw = r#"{
            "type": "notification",
            "event": "payment.succeeded",
            "object": {
                "id": "2d6b1f0a-000f-5000-9000-1b5c3a8c9f2d",
                "status": "succeeded",
                "paid": true,
                "amount": {"value": "160.00", "currency": "RUB"}
            }
        }"#;
        let n: GatewayNotification = serde_json::from_str(raw).unwrap();
        assert_eq!(n.event, "payment.succeeded");
        assert_eq!(n.object.id, "2d6b1f0a-000f-5000-9000-1b5c3a8c9f2d");
        assert_eq!(n.object.status.as_deref(), Some("succeeded"));
    }

    #[test]
    fn notification_without_object_status_still_decodes() {
        let raw = r#"{"event": "payment.canceled", "object": {"id": "abc"}}"#;
        let n: GatewayNotification = serde_json::from_str(raw).unwrap();
        assert!(n.object.status.is_none());
    }
}
