pub mod extract;
pub mod permissions;

use axum::{
    extract::{Path, State},
    Json,
};
use tracing::warn;

use crate::errors::AppError;
use crate::state::AppState;

pub use extract::AuthenticatedUser;
pub use permissions::{check_tenant_permission, AccessSummary, Capability, TenantAccess};

/// Resolves the caller's membership in `slug` and checks one capability.
pub async fn authorize(
    state: &AppState,
    caller: &AuthenticatedUser,
    slug: &str,
    capability: Capability,
) -> Result<TenantAccess, AppError> {
    let access = check_tenant_permission(&state.repos, &caller.email, slug, None)
        .await
        .map_err(|e| {
            warn!(tenant = slug, email = %caller.email, "Tenant access denied: {e}");
            AppError::from(e)
        })?;
    access.require(capability)?;
    Ok(access)
}

/// GET /api/tenants/:slug/access
pub async fn handle_access(
    State(state): State<AppState>,
    caller: AuthenticatedUser,
    Path(slug): Path<String>,
) -> Result<Json<AccessSummary>, AppError> {
    let access = authorize(&state, &caller, &slug, Capability::Read).await?;
    Ok(Json(access.summary()))
}
