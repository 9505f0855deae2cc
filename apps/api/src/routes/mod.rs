pub mod health;

use axum::{
    routing::{get, patch, post},
    Router,
};

use crate::auth::handlers as auth;
use crate::billing::handlers as billing;
use crate::matching::handlers as matching;
use crate::recruiting::{candidates, jobs, positions, settings, users};
use crate::state::AppState;
use crate::tenancy;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_handler))
        // Billing
        .route("/api/checkout/finalize", post(billing::handle_finalize))
        .route("/api/webhooks/stripe", post(billing::handle_stripe_webhook))
        // Activation
        .route(
            "/api/auth/activate",
            get(auth::handle_preview_activation).post(auth::handle_activate),
        )
        .route(
            "/api/auth/resend-activation",
            post(auth::handle_resend_activation),
        )
        .route(
            "/api/auth/password-strength",
            post(auth::handle_password_strength),
        )
        // Tenant-scoped
        .route("/api/tenants/:slug/access", get(tenancy::handle_access))
        .route(
            "/api/tenants/:slug/positions",
            get(positions::handle_list).post(positions::handle_create),
        )
        .route(
            "/api/tenants/:slug/positions/:id",
            get(positions::handle_get)
                .put(positions::handle_update)
                .delete(positions::handle_delete),
        )
        .route(
            "/api/tenants/:slug/jobs",
            get(jobs::handle_list).post(jobs::handle_create),
        )
        .route(
            "/api/tenants/:slug/jobs/:id",
            get(jobs::handle_get)
                .put(jobs::handle_update)
                .delete(jobs::handle_delete),
        )
        .route(
            "/api/tenants/:slug/candidates",
            get(candidates::handle_list).post(candidates::handle_create),
        )
        .route(
            "/api/tenants/:slug/candidates/:id",
            get(candidates::handle_get)
                .put(candidates::handle_update)
                .delete(candidates::handle_delete),
        )
        .route(
            "/api/tenants/:slug/users",
            get(users::handle_list).post(users::handle_invite),
        )
        .route(
            "/api/tenants/:slug/settings",
            patch(settings::handle_update),
        )
        .route(
            "/api/tenants/:slug/matching",
            post(matching::handle_match),
        )
        .with_state(state)
}
