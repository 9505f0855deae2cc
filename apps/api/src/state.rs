use std::sync::Arc;

use sqlx::PgPool;

use crate::audit::AuditLogger;
use crate::auth::activation::ActivationWorkflow;
use crate::auth::identity::IdentityProvider;
use crate::billing::checkout::CheckoutFinalizer;
use crate::billing::stripe::PaymentProvider;
use crate::config::Config;
use crate::llm_client::LlmClient;
use crate::matching::scoring::MatchScorer;
use crate::notify::{EmailNotifier, LinkSettings};
use crate::ratelimit::RateLimiter;
use crate::store::Repositories;

/// Shared application state injected into all route handlers via Axum extractors.
#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub repos: Repositories,
    /// Request-independent logger; handlers scope it with `with_context`.
    pub audit: AuditLogger,
    pub payments: Arc<dyn PaymentProvider>,
    pub identity: Arc<dyn IdentityProvider>,
    pub notifier: Arc<dyn EmailNotifier>,
    pub llm: LlmClient,
    pub scorer: Arc<dyn MatchScorer>,
    pub rate_limiter: RateLimiter,
    pub config: Config,
}

impl AppState {
    pub fn links(&self) -> LinkSettings {
        LinkSettings {
            token_ttl_hours: self.config.activation_token_ttl_hours,
            app_base_url: self.config.app_base_url.clone(),
        }
    }

    pub fn finalizer(&self, audit: AuditLogger) -> CheckoutFinalizer {
        CheckoutFinalizer::new(
            self.repos.clone(),
            self.payments.clone(),
            self.notifier.clone(),
            audit,
            self.links(),
        )
    }

    pub fn activation(&self, audit: AuditLogger) -> ActivationWorkflow {
        ActivationWorkflow::new(
            self.repos.clone(),
            self.identity.clone(),
            self.notifier.clone(),
            audit,
            self.links(),
        )
    }
}
