use anyhow::{Context, Result};

/// Application configuration loaded from environment variables.
/// Startup fails if required variables are missing.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub redis_url: String,
    pub stripe_secret_key: String,
    pub stripe_webhook_secret: String,
    pub supabase_url: String,
    pub supabase_service_role_key: String,
    pub openai_api_key: String,
    /// Unset means emails are written to the log instead of sent.
    pub resend_api_key: Option<String>,
    pub email_from: String,
    pub app_base_url: String,
    pub activation_token_ttl_hours: i64,
    pub rate_limit_max_attempts: u32,
    pub rate_limit_window_secs: u64,
    pub port: u16,
    pub rust_log: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok(); // load .env if present; ignore if missing

        Ok(Config {
            database_url: require_env("DATABASE_URL")?,
            redis_url: require_env("REDIS_URL")?,
            stripe_secret_key: require_env("STRIPE_SECRET_KEY")?,
            stripe_webhook_secret: require_env("STRIPE_WEBHOOK_SECRET")?,
            supabase_url: require_env("SUPABASE_URL")?,
            supabase_service_role_key: require_env("SUPABASE_SERVICE_ROLE_KEY")?,
            openai_api_key: require_env("OPENAI_API_KEY")?,
            resend_api_key: std::env::var("RESEND_API_KEY").ok().filter(|k| !k.is_empty()),
            email_from: env_or("EMAIL_FROM", "TalentDesk <onboarding@talentdesk.app>"),
            app_base_url: env_or("APP_BASE_URL", "http://localhost:3000")
                .trim_end_matches('/')
                .to_string(),
            activation_token_ttl_hours: parse_env("ACTIVATION_TOKEN_TTL_HOURS", 48)?,
            rate_limit_max_attempts: parse_env("RATE_LIMIT_MAX_ATTEMPTS", 10)?,
            rate_limit_window_secs: parse_env("RATE_LIMIT_WINDOW_SECS", 900)?,
            port: parse_env("PORT", 8080)?,
            rust_log: env_or("RUST_LOG", "info"),
        })
    }
}

fn require_env(key: &str) -> Result<String> {
    std::env::var(key).with_context(|| format!("Required environment variable '{key}' is not set"))
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_env<T>(key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .with_context(|| format!("{key} must be a valid number")),
        Err(_) => Ok(default),
    }
}
