//! Medusa webhook routes

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use coursebridge_enrollment::{parse_order_paid, IntakeOutcome};
use serde_json::{json, Value};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

use crate::error::{ApiError, ApiResult};
use crate::security::{verify_signature, SIGNATURE_HEADER};
use crate::state::AppState;

pub const WEBHOOK_ID_HEADER: &str = "x-webhook-id";

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

/// POST /webhooks/medusa/order-paid
///
/// Duplicates and already-provisioned customers are acknowledged with 200 so
/// Medusa stops redelivering.
pub async fn order_paid(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<IntakeOutcome>> {
    let Some(signature) = header(&headers, SIGNATURE_HEADER) else {
        tracing::warn!("Webhook rejected: missing signature header");
        return Err(ApiError::Unauthorized);
    };
    if !verify_signature(state.webhook_secret(), &body, signature) {
        tracing::warn!(body_len = body.len(), "Webhook rejected: signature mismatch");
        return Err(ApiError::Unauthorized);
    }

    let payload: Value = serde_json::from_slice(&body)
        .map_err(|e| ApiError::BadRequest(format!("body is not valid JSON: {e}")))?;

    let order = parse_order_paid(&payload, header(&headers, WEBHOOK_ID_HEADER)).inspect_err(|e| {
        tracing::warn!(error = %e, "Webhook payload failed validation");
    })?;

    let outcome = state.intake.handle_order_paid(&order, &payload).await?;

    match &outcome {
        IntakeOutcome::Queued { job_id, .. } => tracing::info!(
            order_id = %order.order_id,
            webhook_id = %order.webhook_id,
            job_id = %job_id,
            "Order queued for enrollment"
        ),
        IntakeOutcome::Duplicate { reason, .. } => tracing::info!(
            order_id = %order.order_id,
            webhook_id = %order.webhook_id,
            reason,
            "Webhook acknowledged as duplicate"
        ),
        IntakeOutcome::Linked { moodle_user_id, .. } => tracing::info!(
            order_id = %order.order_id,
            moodle_user_id = ?moodle_user_id,
            "Order linked to existing Moodle user"
        ),
    }

    Ok(Json(outcome))
}

/// GET /webhooks/medusa/health
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let timestamp = OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_default();

    match state.intake.queue().counts().await {
        Ok(queue) => (
            StatusCode::OK,
            Json(json!({
                "status": "ok",
                "service": "medusa-webhook",
                "timestamp": timestamp,
                "queue": queue
            })),
        ),
        Err(e) => {
            tracing::error!(error = %e, "Health check could not read the job queue");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "degraded",
                    "service": "medusa-webhook",
                    "timestamp": timestamp
                })),
            )
        }
    }
}
