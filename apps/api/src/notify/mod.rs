//! Outbound email. `ResendNotifier` when an API key is configured, otherwise
//! `LogNotifier`, which writes the message to the log (local development).

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

const RESEND_API_URL: &str = "https://api.resend.com/emails";

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Email provider error (status {status}): {message}")]
    Api { status: u16, message: String },
}

/// Where activation links point and how long they live.
#[derive(Debug, Clone)]
pub struct LinkSettings {
    pub token_ttl_hours: i64,
    pub app_base_url: String,
}

impl LinkSettings {
    pub fn activation_url(&self, raw_token: &str) -> String {
        format!("{}/activate?token={raw_token}", self.app_base_url)
    }
}

#[derive(Debug, Clone)]
pub struct ActivationEmail<'a> {
    pub to: &'a str,
    pub tenant_name: &'a str,
    pub activation_url: &'a str,
    pub expires_in_hours: i64,
}

impl ActivationEmail<'_> {
    pub fn subject(&self) -> String {
        format!("Activate your {} account", self.tenant_name)
    }

    pub fn html(&self) -> String {
        format!(
            "<p>Welcome to {tenant}!</p>\
             <p>Your workspace is ready. Set your password to activate your account:</p>\
             <p><a href=\"{url}\">Activate account</a></p>\
             <p>This link expires in {hours} hours and can be used once.</p>",
            tenant = self.tenant_name,
            url = self.activation_url,
            hours = self.expires_in_hours,
        )
    }
}

#[async_trait]
pub trait EmailNotifier: Send + Sync {
    async fn send_activation(&self, email: &ActivationEmail<'_>) -> Result<(), NotifyError>;
}

#[derive(Clone)]
pub struct ResendNotifier {
    client: Client,
    api_key: String,
    from: String,
}

#[derive(Serialize)]
struct ResendRequest<'a> {
    from: &'a str,
    to: [&'a str; 1],
    subject: String,
    html: String,
}

impl ResendNotifier {
    pub fn new(api_key: String, from: String) -> reqwest::Result<Self> {
        Ok(Self {
            client: Client::builder()
                .timeout(std::time::Duration::from_secs(15))
                .build()?,
            api_key,
            from,
        })
    }
}

#[async_trait]
impl EmailNotifier for ResendNotifier {
    async fn send_activation(&self, email: &ActivationEmail<'_>) -> Result<(), NotifyError> {
        let body = ResendRequest {
            from: &self.from,
            to: [email.to],
            subject: email.subject(),
            html: email.html(),
        };

        let response = self
            .client
            .post(RESEND_API_URL)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            warn!("Email provider returned {status}: {message}");
            return Err(NotifyError::Api {
                status: status.as_u16(),
                message,
            });
        }
        Ok(())
    }
}

pub struct LogNotifier;

#[async_trait]
impl EmailNotifier for LogNotifier {
    async fn send_activation(&self, email: &ActivationEmail<'_>) -> Result<(), NotifyError> {
        info!(
            to = email.to,
            subject = %email.subject(),
            "Email delivery disabled, activation link: {}",
            email.activation_url
        );
        Ok(())
    }
}
