use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};

use crate::audit::RequestContext;
use crate::errors::AppError;
use crate::models::user::{normalize_email, NewUser, Role, UserSummary};
use crate::recruiting::clean_optional;
use crate::state::AppState;
use crate::tenancy::{authorize, AuthenticatedUser, Capability};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InviteRequest {
    pub email: String,
    pub name: Option<String>,
    pub role: Option<Role>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InviteResponse {
    pub user: UserSummary,
    pub activation_email_sent: bool,
}

impl InviteRequest {
    fn into_new_user(self, tenant_id: uuid::Uuid) -> Result<NewUser, AppError> {
        let email = normalize_email(&self.email);
        if !email.contains('@') || email.starts_with('@') || email.ends_with('@') {
            return Err(AppError::Validation("A valid email is required".to_string()));
        }
        Ok(NewUser {
            email,
            name: clean_optional(self.name),
            role: self.role.unwrap_or(Role::User),
            tenant_id,
        })
    }
}

/// GET /api/tenants/:slug/users
pub async fn handle_list(
    State(state): State<AppState>,
    caller: AuthenticatedUser,
    Path(slug): Path<String>,
) -> Result<Json<Vec<UserSummary>>, AppError> {
    let access = authorize(&state, &caller, &slug, Capability::Read).await?;
    let users = state.repos.users.list_by_tenant(access.tenant.id).await?;
    Ok(Json(users.iter().map(UserSummary::from).collect()))
}

/// POST /api/tenants/:slug/users
///
/// Creates an inactive member and mails an activation link. The member sets their own
/// password through the regular activation flow.
pub async fn handle_invite(
    State(state): State<AppState>,
    ctx: RequestContext,
    caller: AuthenticatedUser,
    Path(slug): Path<String>,
    Json(req): Json<InviteRequest>,
) -> Result<(StatusCode, Json<InviteResponse>), AppError> {
    let access = authorize(&state, &caller, &slug, Capability::ManageUsers).await?;
    let invite = req.into_new_user(access.tenant.id)?;

    let workflow = state.activation(state.audit.with_context(ctx));
    let (user, sent) = workflow
        .invite(&access.tenant, &invite, access.user.id)
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(InviteResponse {
            user: UserSummary::from(&user),
            activation_email_sent: sent,
        }),
    ))
}
