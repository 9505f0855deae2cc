use axum::{
    extract::{Query, State},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::audit::RequestContext;
use crate::auth::activation::{ActivateRequest, ActivationResult, ResendRequest, TokenPreview};
use crate::auth::password::{validate_password_security, PasswordEvaluation, UserInfo};
use crate::errors::AppError;
use crate::state::AppState;

#[derive(Deserialize)]
pub struct TokenQuery {
    pub token: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PasswordStrengthRequest {
    pub password: String,
    pub email: Option<String>,
    pub name: Option<String>,
    pub company_name: Option<String>,
}

/// GET /api/auth/activate?token=
pub async fn handle_preview_activation(
    State(state): State<AppState>,
    ctx: RequestContext,
    Query(query): Query<TokenQuery>,
) -> Result<Json<TokenPreview>, AppError> {
    let audit = state.audit.with_context(ctx);
    state.rate_limiter.enforce("activate", &audit).await?;

    let token = query
        .token
        .filter(|t| !t.trim().is_empty())
        .ok_or_else(|| AppError::Validation("token is required".to_string()))?;

    let preview = state.activation(audit).preview(&token).await?;
    Ok(Json(preview))
}

/// POST /api/auth/activate
pub async fn handle_activate(
    State(state): State<AppState>,
    ctx: RequestContext,
    Json(req): Json<ActivateRequest>,
) -> Result<Json<ActivationResult>, AppError> {
    let audit = state.audit.with_context(ctx);
    state.rate_limiter.enforce("activate", &audit).await?;

    let result = state.activation(audit).activate(&req).await?;
    Ok(Json(result))
}

/// POST /api/auth/resend-activation
/// Always answers 200 so the endpoint reveals nothing about which accounts exist.
pub async fn handle_resend_activation(
    State(state): State<AppState>,
    ctx: RequestContext,
    Json(req): Json<ResendRequest>,
) -> Result<Json<Value>, AppError> {
    let audit = state.audit.with_context(ctx);
    state.rate_limiter.enforce("resend-activation", &audit).await?;

    state.activation(audit).resend(&req).await?;
    Ok(Json(json!({
        "ok": true,
        "message": "If an inactive account exists for this email, a new activation link has been sent"
    })))
}

/// POST /api/auth/password-strength
pub async fn handle_password_strength(
    Json(req): Json<PasswordStrengthRequest>,
) -> Json<PasswordEvaluation> {
    let info = UserInfo {
        email: req.email.as_deref(),
        name: req.name.as_deref(),
        company_name: req.company_name.as_deref(),
    };
    Json(validate_password_security(&req.password, Some(info)))
}
