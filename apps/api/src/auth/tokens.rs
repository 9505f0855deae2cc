//! Activation token lifecycle: mint → consumed, or mint → expired.
//!
//! The raw secret leaves this module exactly once, as the return value of
//! `create_activation_token`. Only its SHA-256 hash is stored. Expiry is checked at
//! validation time; nothing sweeps tokens in the background.

use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{Duration, Utc};
use rand::RngCore;
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

use crate::audit::{AuditEvent, AuditEventType, AuditLogger, Severity};
use crate::models::activation_token::{ActivationToken, NewActivationToken};
use crate::store::{ActivationTokenRepository, StoreError, TOKEN_HASH_KEY};

pub const DEFAULT_EXPIRY_HOURS: i64 = 48;
const SECRET_BYTES: usize = 32;

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("Invalid activation token")]
    NotFound,

    #[error("Activation token has expired")]
    Expired,

    #[error("Activation token has already been used")]
    AlreadyUsed,

    /// The generated hash collided with an existing row. Recoverable: look up the
    /// latest unused token for the identity instead.
    #[error("Activation token hash collision")]
    DuplicateTokenHash,

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl TokenError {
    /// True for the outcomes a caller may show to the end user.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            TokenError::NotFound | TokenError::Expired | TokenError::AlreadyUsed
        )
    }
}

/// Identity bound to a token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenData {
    pub email: String,
    pub user_id: Uuid,
    pub tenant_id: Uuid,
}

impl From<&ActivationToken> for TokenData {
    fn from(token: &ActivationToken) -> Self {
        Self {
            email: token.email.clone(),
            user_id: token.user_id,
            tenant_id: token.tenant_id,
        }
    }
}

/// Serializable validation outcome, `{isValid, data?, error?}`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenValidation {
    pub is_valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<TokenData>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<&Result<TokenData, TokenError>> for TokenValidation {
    fn from(result: &Result<TokenData, TokenError>) -> Self {
        match result {
            Ok(data) => Self {
                is_valid: true,
                data: Some(data.clone()),
                error: None,
            },
            Err(e) if e.is_rejection() => Self {
                is_valid: false,
                data: None,
                error: Some(e.to_string()),
            },
            Err(_) => Self {
                is_valid: false,
                data: None,
                error: Some("Unable to validate activation token".to_string()),
            },
        }
    }
}

/// Parameters for minting a token.
#[derive(Debug, Clone)]
pub struct MintRequest<'a> {
    pub email: &'a str,
    pub user_id: Uuid,
    pub tenant_id: Uuid,
    pub expires_in_hours: i64,
    pub created_from_ip: Option<&'a str>,
}

pub struct ActivationTokenService {
    repo: Arc<dyn ActivationTokenRepository>,
    audit: AuditLogger,
    secret_source: fn() -> String,
}

impl ActivationTokenService {
    pub fn new(repo: Arc<dyn ActivationTokenRepository>, audit: AuditLogger) -> Self {
        Self {
            repo,
            audit,
            secret_source: generate_secret,
        }
    }

    #[cfg(test)]
    pub fn with_secret_source(mut self, source: fn() -> String) -> Self {
        self.secret_source = source;
        self
    }

    /// Invalidates the user's outstanding tokens, then mints a new one and returns the
    /// raw secret.
    pub async fn create_activation_token(&self, req: MintRequest<'_>) -> Result<String, TokenError> {
        let invalidated = self.repo.invalidate_unused_for_user(req.user_id).await?;
        if invalidated > 0 {
            self.audit
                .log(
                    AuditEvent::new(AuditEventType::TokenInvalidated)
                        .user(req.user_id)
                        .tenant(req.tenant_id)
                        .detail("count", invalidated),
                )
                .await;
        }

        let secret = (self.secret_source)();
        let expires_at = Utc::now() + Duration::hours(req.expires_in_hours.max(1));

        let new_token = NewActivationToken {
            user_id: req.user_id,
            tenant_id: req.tenant_id,
            email: req.email.to_string(),
            token_hash: hash_token(&secret),
            expires_at,
            created_from_ip: req.created_from_ip.map(String::from),
        };

        match self.repo.insert(&new_token).await {
            Ok(token) => {
                self.audit
                    .log(
                        AuditEvent::new(AuditEventType::TokenGenerated)
                            .user(req.user_id)
                            .tenant(req.tenant_id)
                            .email(req.email)
                            .resource(token.id.to_string())
                            .detail("expires_at", expires_at.to_rfc3339()),
                    )
                    .await;
                Ok(secret)
            }
            Err(e) if e.is_unique_violation_of(TOKEN_HASH_KEY) => {
                self.audit
                    .log(
                        AuditEvent::new(AuditEventType::TokenGenerated)
                            .severity(Severity::Medium)
                            .user(req.user_id)
                            .tenant(req.tenant_id)
                            .failed("token hash collision"),
                    )
                    .await;
                Err(TokenError::DuplicateTokenHash)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Most recent unused token of the identity, for recovery after a collision.
    pub async fn latest_unused_token(
        &self,
        user_id: Uuid,
        tenant_id: Uuid,
    ) -> Result<Option<ActivationToken>, TokenError> {
        Ok(self.repo.latest_unused_for(user_id, tenant_id).await?)
    }

    /// Checks a token without consuming it.
    pub async fn inspect_token(&self, token: &str) -> Result<TokenData, TokenError> {
        let stored = self.lookup(token).await?;
        Ok(TokenData::from(&stored))
    }

    /// Validates the token and atomically marks it used. Of two concurrent callers
    /// presenting the same token, exactly one succeeds.
    pub async fn validate_and_use_activation_token(
        &self,
        token: &str,
        used_from_ip: Option<&str>,
    ) -> Result<TokenData, TokenError> {
        let stored = self.lookup(token).await?;

        if !self.repo.mark_used(stored.id, used_from_ip).await? {
            self.log_rejection(&stored, AuditEventType::InvalidTokenAttempt, "token already used (concurrent)")
                .await;
            return Err(TokenError::AlreadyUsed);
        }

        self.audit
            .log(
                AuditEvent::new(AuditEventType::TokenUsed)
                    .user(stored.user_id)
                    .tenant(stored.tenant_id)
                    .email(stored.email.clone())
                    .resource(stored.id.to_string()),
            )
            .await;

        Ok(TokenData::from(&stored))
    }

    async fn lookup(&self, token: &str) -> Result<ActivationToken, TokenError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(TokenError::NotFound);
        }

        let Some(stored) = self.repo.find_by_hash(&hash_token(token)).await? else {
            self.audit
                .log(AuditEvent::new(AuditEventType::InvalidTokenAttempt).failed("unknown token"))
                .await;
            return Err(TokenError::NotFound);
        };

        if stored.used {
            self.log_rejection(&stored, AuditEventType::InvalidTokenAttempt, "token already used")
                .await;
            return Err(TokenError::AlreadyUsed);
        }

        if stored.is_expired_at(Utc::now()) {
            self.log_rejection(&stored, AuditEventType::TokenExpired, "token expired")
                .await;
            return Err(TokenError::Expired);
        }

        self.audit
            .log(
                AuditEvent::new(AuditEventType::TokenValidated)
                    .user(stored.user_id)
                    .tenant(stored.tenant_id)
                    .resource(stored.id.to_string()),
            )
            .await;

        Ok(stored)
    }

    async fn log_rejection(&self, stored: &ActivationToken, event_type: AuditEventType, reason: &str) {
        self.audit
            .log(
                AuditEvent::new(event_type)
                    .user(stored.user_id)
                    .tenant(stored.tenant_id)
                    .resource(stored.id.to_string())
                    .failed(reason),
            )
            .await;
    }
}

/// 32 random bytes, base64url without padding.
pub fn generate_secret() -> String {
    let mut bytes = [0u8; SECRET_BYTES];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Hex-encoded SHA-256 of the raw secret; the value stored as `token_hash`.
pub fn hash_token(raw: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(raw.as_bytes());
    hex::encode(hasher.finalize())
}
