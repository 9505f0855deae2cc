//! Minimal Stripe REST client. Only the reads the onboarding flow needs.

use std::collections::HashMap;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

use crate::errors::AppError;

const STRIPE_API_URL: &str = "https://api.stripe.com/v1";

#[derive(Debug, Error)]
pub enum PaymentError {
    #[error("Checkout session '{0}' not found")]
    SessionNotFound(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Stripe API error (status {status}): {message}")]
    Api { status: u16, message: String },
}

impl From<PaymentError> for AppError {
    fn from(err: PaymentError) -> Self {
        match err {
            PaymentError::SessionNotFound(_) => AppError::NotFound(err.to_string()),
            other => AppError::Payment(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CustomerDetails {
    pub email: Option<String>,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CheckoutSession {
    pub id: String,
    pub status: Option<String>,
    pub payment_status: Option<String>,
    pub customer: Option<String>,
    pub subscription: Option<String>,
    pub customer_email: Option<String>,
    pub customer_details: Option<CustomerDetails>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl CheckoutSession {
    pub fn is_paid(&self) -> bool {
        matches!(
            self.payment_status.as_deref(),
            Some("paid") | Some("no_payment_required")
        ) || self.status.as_deref() == Some("complete")
    }

    /// True when the checkout started a trial without charging.
    pub fn is_trial(&self) -> bool {
        self.payment_status.as_deref() == Some("no_payment_required")
    }

    /// Metadata lookup accepting both `camelCase` and `snake_case` keys.
    pub fn metadata_value(&self, camel: &str) -> Option<&str> {
        self.metadata
            .get(camel)
            .or_else(|| self.metadata.get(&to_snake_case(camel)))
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }
}

fn to_snake_case(key: &str) -> String {
    let mut out = String::with_capacity(key.len() + 4);
    for c in key.chars() {
        if c.is_ascii_uppercase() {
            out.push('_');
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

#[derive(Debug, Clone, Deserialize)]
pub struct Customer {
    pub id: String,
    pub email: Option<String>,
    pub name: Option<String>,
    #[serde(default)]
    pub deleted: bool,
}

#[async_trait]
pub trait PaymentProvider: Send + Sync {
    async fn retrieve_checkout_session(&self, id: &str) -> Result<CheckoutSession, PaymentError>;
    /// `None` for unknown or deleted customers.
    async fn retrieve_customer(&self, id: &str) -> Result<Option<Customer>, PaymentError>;
}

#[derive(Debug, Deserialize)]
struct StripeErrorEnvelope {
    error: StripeErrorBody,
}

#[derive(Debug, Deserialize)]
struct StripeErrorBody {
    message: String,
}

#[derive(Clone)]
pub struct StripeClient {
    client: Client,
    secret_key: String,
}

impl StripeClient {
    pub fn new(secret_key: String) -> reqwest::Result<Self> {
        Ok(Self {
            client: Client::builder()
                .timeout(std::time::Duration::from_secs(20))
                .build()?,
            secret_key,
        })
    }

    async fn get(&self, path: &str) -> Result<Option<reqwest::Response>, PaymentError> {
        let response = self
            .client
            .get(format!("{STRIPE_API_URL}{path}"))
            .bearer_auth(&self.secret_key)
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<StripeErrorEnvelope>(&body)
                .map(|e| e.error.message)
                .unwrap_or(body);
            warn!("Stripe API returned {status}: {message}");
            return Err(PaymentError::Api {
                status: status.as_u16(),
                message,
            });
        }
        Ok(Some(response))
    }
}

#[async_trait]
impl PaymentProvider for StripeClient {
    async fn retrieve_checkout_session(&self, id: &str) -> Result<CheckoutSession, PaymentError> {
        match self.get(&format!("/checkout/sessions/{id}")).await? {
            Some(response) => Ok(response.json().await?),
            None => Err(PaymentError::SessionNotFound(id.to_string())),
        }
    }

    async fn retrieve_customer(&self, id: &str) -> Result<Option<Customer>, PaymentError> {
        match self.get(&format!("/customers/{id}")).await? {
            Some(response) => {
                let customer: Customer = response.json().await?;
                Ok((!customer.deleted).then_some(customer))
            }
            None => Ok(None),
        }
    }
}
