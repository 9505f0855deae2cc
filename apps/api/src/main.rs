mod audit;
mod auth;
mod billing;
mod config;
mod db;
mod errors;
mod llm_client;
mod matching;
mod models;
mod notify;
mod ratelimit;
mod recruiting;
mod routes;
mod state;
mod store;
mod tenancy;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::audit::AuditLogger;
use crate::auth::identity::SupabaseIdentity;
use crate::billing::stripe::StripeClient;
use crate::config::Config;
use crate::db::create_pool;
use crate::llm_client::LlmClient;
use crate::matching::scoring::KeywordMatchScorer;
use crate::notify::{EmailNotifier, LogNotifier, ResendNotifier};
use crate::ratelimit::RateLimiter;
use crate::routes::build_router;
use crate::state::AppState;
use crate::store::Repositories;

#[tokio::main]
async fn main() -> Result<()> {
    // Fails fast on missing required env vars
    let config = Config::from_env()?;

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!(
                "{}={},audit=info",
                env!("CARGO_PKG_NAME").replace('-', "_"),
                &config.rust_log
            ))
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting TalentDesk API v{}", env!("CARGO_PKG_VERSION"));

    let db = create_pool(&config.database_url).await?;
    let repos = Repositories::postgres(db.clone());
    let audit = AuditLogger::new(repos.audit.clone());

    let redis = redis::Client::open(config.redis_url.clone())?;
    let rate_limiter = RateLimiter::connect(
        &redis,
        config.rate_limit_max_attempts,
        config.rate_limit_window_secs,
    )
    .await
    .context("Failed to connect to Redis")?;
    info!(
        "Rate limiter: {} attempts per {}s",
        config.rate_limit_max_attempts, config.rate_limit_window_secs
    );

    let payments = Arc::new(StripeClient::new(config.stripe_secret_key.clone())?);
    let identity = Arc::new(SupabaseIdentity::new(
        config.supabase_url.clone(),
        config.supabase_service_role_key.clone(),
    )?);

    let notifier: Arc<dyn EmailNotifier> = match &config.resend_api_key {
        Some(key) => Arc::new(ResendNotifier::new(key.clone(), config.email_from.clone())?),
        None => {
            warn!("RESEND_API_KEY not set, activation emails will only be logged");
            Arc::new(LogNotifier)
        }
    };

    let llm = LlmClient::new(config.openai_api_key.clone())?;
    info!("LLM client initialized (model: {})", llm_client::MODEL);

    let state = AppState {
        db,
        repos,
        audit,
        payments,
        identity,
        notifier,
        llm,
        scorer: Arc::new(KeywordMatchScorer),
        rate_limiter,
        config: config.clone(),
    };

    let app = build_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive()); // TODO: restrict origins to APP_BASE_URL once the web app is deployed

    let addr: SocketAddr = format!("0.0.0.0:{}", config.port).parse()?;
    info!("Listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
