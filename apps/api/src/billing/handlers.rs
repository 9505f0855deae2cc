use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::audit::{AuditEvent, AuditEventType, RequestContext};
use crate::billing::checkout::{FinalizeOutcome, PendingReason};
use crate::billing::webhook::{verify_signature, StripeEvent, WebhookProcessor};
use crate::errors::AppError;
use crate::models::tenant::TenantSummary;
use crate::models::user::UserSummary;
use crate::state::AppState;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalizeRequest {
    pub session_id: Option<String>,
}

#[derive(Deserialize)]
pub struct FinalizeQuery {
    pub session_id: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalizeResponse {
    pub ok: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending: Option<PendingReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant: Option<TenantSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<UserSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub activation_email_sent: Option<bool>,
}

impl FinalizeResponse {
    pub fn from_outcome(outcome: FinalizeOutcome) -> (StatusCode, Self) {
        match outcome {
            FinalizeOutcome::AlreadyProcessed => (
                StatusCode::OK,
                FinalizeResponse {
                    ok: true,
                    message: "Checkout already processed".to_string(),
                    pending: None,
                    tenant: None,
                    user: None,
                    activation_email_sent: None,
                },
            ),
            FinalizeOutcome::Pending { reason } => (
                StatusCode::ACCEPTED,
                FinalizeResponse {
                    ok: true,
                    message: reason.message().to_string(),
                    pending: Some(reason),
                    tenant: None,
                    user: None,
                    activation_email_sent: None,
                },
            ),
            FinalizeOutcome::Completed {
                tenant,
                user,
                activation_email_sent,
            } => (
                StatusCode::OK,
                FinalizeResponse {
                    ok: true,
                    message: "Checkout finalized. Check your email to activate your account"
                        .to_string(),
                    pending: None,
                    tenant: Some(tenant),
                    user: Some(user),
                    activation_email_sent: Some(activation_email_sent),
                },
            ),
        }
    }
}

/// POST /api/checkout/finalize
pub async fn handle_finalize(
    State(state): State<AppState>,
    ctx: RequestContext,
    Query(query): Query<FinalizeQuery>,
    body: Option<Json<FinalizeRequest>>,
) -> Result<(StatusCode, Json<FinalizeResponse>), AppError> {
    let session_id = body
        .and_then(|Json(b)| b.session_id)
        .or(query.session_id)
        .ok_or_else(|| AppError::Validation("sessionId is required".to_string()))?;

    let finalizer = state.finalizer(state.audit.with_context(ctx));
    let outcome = finalizer.finalize(&session_id).await?;
    let (status, response) = FinalizeResponse::from_outcome(outcome);
    Ok((status, Json(response)))
}

/// POST /api/webhooks/stripe
pub async fn handle_stripe_webhook(
    State(state): State<AppState>,
    ctx: RequestContext,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, AppError> {
    let audit = state.audit.with_context(ctx);

    let signature = headers
        .get("stripe-signature")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| AppError::Validation("Missing Stripe-Signature header".to_string()))?;

    if let Err(e) = verify_signature(
        &body,
        signature,
        &state.config.stripe_webhook_secret,
        Utc::now().timestamp(),
    ) {
        audit
            .log(
                AuditEvent::new(AuditEventType::SuspiciousActivity)
                    .resource("stripe-webhook")
                    .failed(e.to_string()),
            )
            .await;
        return Err(AppError::Validation(e.to_string()));
    }

    let event: StripeEvent = serde_json::from_slice(&body)
        .map_err(|e| AppError::Validation(format!("Invalid event payload: {e}")))?;

    let finalizer = state.finalizer(audit.clone());
    let processor = WebhookProcessor {
        repos: &state.repos,
        finalizer: &finalizer,
        audit: &audit,
    };
    let outcome = processor.process(&event).await?;

    Ok(Json(json!({
        "received": true,
        "outcome": format!("{outcome:?}").to_lowercase(),
    })))
}
