//! Client for the hosted identity provider (Supabase GoTrue admin API).
//!
//! Passwords live only there. This service keeps the provider's user id as
//! `users.external_id` and resolves bearer tokens back to an email.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("An account with this email already exists")]
    AlreadyExists,

    #[error("Invalid or expired session")]
    InvalidSession,

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Identity provider error (status {status}): {message}")]
    Api { status: u16, message: String },
}

/// Identity as reported by the provider.
#[derive(Debug, Clone, Deserialize)]
pub struct IdentityUser {
    pub id: String,
    pub email: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewIdentity<'a> {
    pub email: &'a str,
    pub password: &'a str,
    pub tenant_id: uuid::Uuid,
    pub role: &'a str,
}

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Creates a confirmed identity and returns the provider's user id.
    async fn create_user(&self, identity: &NewIdentity<'_>) -> Result<String, IdentityError>;

    /// Resolves a bearer access token to the identity that owns it.
    async fn get_user(&self, access_token: &str) -> Result<IdentityUser, IdentityError>;

    /// Looks up an existing identity by email and returns its provider user id.
    async fn find_by_email(&self, email: &str) -> Result<Option<String>, IdentityError>;
}

#[derive(Clone)]
pub struct SupabaseIdentity {
    client: Client,
    base_url: String,
    service_key: String,
}

/// Page size when scanning the admin user list.
const LIST_PAGE_SIZE: usize = 200;
const MAX_LIST_PAGES: usize = 50;

#[derive(Deserialize)]
struct UserList {
    #[serde(default)]
    users: Vec<IdentityUser>,
}

#[derive(Serialize)]
struct CreateUserRequest<'a> {
    email: &'a str,
    password: &'a str,
    email_confirm: bool,
    user_metadata: Value,
}

impl SupabaseIdentity {
    pub fn new(base_url: String, service_key: String) -> reqwest::Result<Self> {
        Ok(Self {
            client: Client::builder()
                .timeout(std::time::Duration::from_secs(15))
                .build()?,
            base_url: base_url.trim_end_matches('/').to_string(),
            service_key,
        })
    }
}

#[async_trait]
impl IdentityProvider for SupabaseIdentity {
    async fn create_user(&self, identity: &NewIdentity<'_>) -> Result<String, IdentityError> {
        let body = CreateUserRequest {
            email: identity.email,
            password: identity.password,
            email_confirm: true,
            user_metadata: json!({
                "tenant_id": identity.tenant_id,
                "role": identity.role,
            }),
        };

        let response = self
            .client
            .post(format!("{}/auth/v1/admin/users", self.base_url))
            .header("apikey", &self.service_key)
            .bearer_auth(&self.service_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            let user: IdentityUser = response.json().await?;
            return Ok(user.id);
        }

        let message = response.text().await.unwrap_or_default();
        let duplicate = matches!(status, StatusCode::UNPROCESSABLE_ENTITY | StatusCode::CONFLICT)
            && message.to_lowercase().contains("already");
        if duplicate {
            return Err(IdentityError::AlreadyExists);
        }

        warn!("Identity provider rejected user creation ({status}): {message}");
        Err(IdentityError::Api {
            status: status.as_u16(),
            message,
        })
    }

    async fn get_user(&self, access_token: &str) -> Result<IdentityUser, IdentityError> {
        let response = self
            .client
            .get(format!("{}/auth/v1/user", self.base_url))
            .header("apikey", &self.service_key)
            .bearer_auth(access_token)
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(IdentityError::InvalidSession);
        }
        if !status.is_success() {
            return Err(IdentityError::Api {
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }

        Ok(response.json().await?)
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<String>, IdentityError> {
        for page in 1..=MAX_LIST_PAGES {
            let response = self
                .client
                .get(format!("{}/auth/v1/admin/users", self.base_url))
                .header("apikey", &self.service_key)
                .bearer_auth(&self.service_key)
                .query(&[("page", page), ("per_page", LIST_PAGE_SIZE)])
                .send()
                .await?;

            let status = response.status();
            if !status.is_success() {
                return Err(IdentityError::Api {
                    status: status.as_u16(),
                    message: response.text().await.unwrap_or_default(),
                });
            }

            let list: UserList = response.json().await?;
            let found = list.users.iter().find(|u| {
                u.email
                    .as_deref()
                    .is_some_and(|e| e.eq_ignore_ascii_case(email))
            });
            if let Some(user) = found {
                return Ok(Some(user.id.clone()));
            }
            if list.users.len() < LIST_PAGE_SIZE {
                break;
            }
        }
        Ok(None)
    }
}
