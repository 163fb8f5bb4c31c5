//! Payment processor webhook endpoint

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use iva_billing::{IngestOutcome, SIGNATURE_HEADER};
use serde_json::json;

use crate::state::AppState;

/// Handle a webhook delivery
///
/// The body is taken as raw bytes because the signature covers them exactly.
/// Everything except authenticity failures and transient store errors is
/// acknowledged so the processor stops redelivering.
pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|h| h.to_str().ok());

    match state.webhooks.ingest(&body, signature).await {
        Ok(outcome) => {
            let outcome_name = match &outcome {
                IngestOutcome::Applied { .. } => "applied",
                IngestOutcome::Duplicate => "duplicate",
                IngestOutcome::Ignored => "ignored",
                IngestOutcome::Unresolved => "unresolved",
                IngestOutcome::Skipped(_) => "skipped",
            };
            tracing::debug!(outcome = outcome_name, "Webhook acknowledged");
            (StatusCode::OK, Json(json!({ "received": true }))).into_response()
        }
        Err(e) if e.is_rejection() => (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "error": {
                    "code": "webhook_rejected",
                    "message": e.to_string(),
                }
            })),
        )
            .into_response(),
        Err(e) if e.is_transient() => {
            tracing::error!(error = %e, "Webhook processing failed, processor will redeliver");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({
                    "error": {
                        "code": "webhook_retry",
                        "message": "temporary failure, retry later",
                    }
                })),
            )
                .into_response()
        }
        Err(e) => {
            // Redelivery would fail the same way
            tracing::error!(error = %e, "Webhook handler error, acknowledging");
            (StatusCode::OK, Json(json!({ "received": true }))).into_response()
        }
    }
}
