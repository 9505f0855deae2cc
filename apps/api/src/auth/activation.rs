//! Account activation: token pre-check, password setup, identity creation, and
//! re-sending activation links.
//!
//! The token is consumed only after the password has passed every check, so a rejected
//! password leaves the link usable.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::audit::{AuditEvent, AuditEventType, AuditLogger};
use crate::auth::identity::{IdentityError, IdentityProvider, NewIdentity};
use crate::auth::password::{validate_password_security, UserInfo};
use crate::auth::tokens::{ActivationTokenService, MintRequest, TokenData, TokenError};
use crate::errors::AppError;
use crate::models::tenant::{Tenant, TenantSummary};
use crate::models::user::{normalize_email, NewUser, User, UserSummary};
use crate::notify::{ActivationEmail, EmailNotifier, LinkSettings};
use crate::store::Repositories;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivateRequest {
    pub token: String,
    pub password: String,
    pub confirm_password: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResendRequest {
    pub email: String,
    pub tenant_slug: String,
}

/// Non-consuming view of a token for the activation page.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenPreview {
    pub is_valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant: Option<TenantSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TokenPreview {
    fn invalid(error: impl Into<String>) -> Self {
        Self {
            is_valid: false,
            email: None,
            tenant: None,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ActivationResult {
    pub user: UserSummary,
    pub tenant: TenantSummary,
}

pub struct ActivationWorkflow {
    repos: Repositories,
    identity: Arc<dyn IdentityProvider>,
    notifier: Arc<dyn EmailNotifier>,
    tokens: ActivationTokenService,
    audit: AuditLogger,
    links: LinkSettings,
}

impl ActivationWorkflow {
    pub fn new(
        repos: Repositories,
        identity: Arc<dyn IdentityProvider>,
        notifier: Arc<dyn EmailNotifier>,
        audit: AuditLogger,
        links: LinkSettings,
    ) -> Self {
        let tokens = ActivationTokenService::new(repos.tokens.clone(), audit.clone());
        Self {
            repos,
            identity,
            notifier,
            tokens,
            audit,
            links,
        }
    }

    pub async fn preview(&self, token: &str) -> Result<TokenPreview, AppError> {
        let data = match self.tokens.inspect_token(token).await {
            Ok(data) => data,
            Err(e) if e.is_rejection() => return Ok(TokenPreview::invalid(e.to_string())),
            Err(e) => return Err(e.into()),
        };

        let (user, tenant) = self.load_identity(&data).await?;
        if user.is_active {
            return Ok(TokenPreview::invalid("Account is already active"));
        }

        Ok(TokenPreview {
            is_valid: true,
            email: Some(data.email),
            tenant: Some(TenantSummary::from(&tenant)),
            error: None,
        })
    }

    pub async fn activate(&self, req: &ActivateRequest) -> Result<ActivationResult, AppError> {
        let started = Instant::now();
        self.audit
            .log(AuditEvent::new(AuditEventType::AccountActivationStarted))
            .await;

        if req.token.trim().is_empty() {
            return Err(self.fail(None, "Activation token is required").await);
        }
        if req.password != req.confirm_password {
            return Err(self.fail(None, "Passwords do not match").await);
        }

        let data = match self.tokens.inspect_token(&req.token).await {
            Ok(data) => data,
            Err(e) if e.is_rejection() => return Err(self.fail(None, &e.to_string()).await),
            Err(e) => return Err(e.into()),
        };

        let (user, tenant) = self.load_identity(&data).await?;
        if user.is_active {
            return Err(AppError::Conflict("Account is already active".to_string()));
        }

        let evaluation = validate_password_security(
            &req.password,
            Some(UserInfo {
                email: Some(&user.email),
                name: user.name.as_deref(),
                company_name: Some(&tenant.name),
            }),
        );

        if !evaluation.is_valid {
            self.audit
                .log(
                    AuditEvent::new(AuditEventType::PasswordValidationFailed)
                        .user(user.id)
                        .tenant(tenant.id)
                        .detail("score", evaluation.score)
                        .failed(evaluation.errors.join("; ")),
                )
                .await;
            return Err(AppError::UnprocessableEntity(format!(
                "Password does not meet security requirements: {}",
                evaluation.errors.join("; ")
            )));
        }

        if !evaluation.warnings.is_empty() {
            self.audit
                .log(
                    AuditEvent::new(AuditEventType::PasswordWarning)
                        .user(user.id)
                        .tenant(tenant.id)
                        .detail("warnings", evaluation.warnings.clone()),
                )
                .await;
        }

        // Single-use consumption; a concurrent activation loses here.
        let ip = self.audit.context().ip.clone();
        if let Err(e) = self
            .tokens
            .validate_and_use_activation_token(&req.token, ip.as_deref())
            .await
        {
            if e.is_rejection() {
                return Err(self.fail(Some(&user), &e.to_string()).await);
            }
            return Err(e.into());
        }

        let external_id = match self.provision_identity(&user, &tenant, &req.password).await {
            Ok(id) => id,
            Err(e) => {
                // The token is spent; hand the user a fresh link.
                self.fail(Some(&user), &e.to_string()).await;
                if let Err(reissue_err) = self.reissue(&user, &tenant).await {
                    warn!(user_id = %user.id, "Could not reissue activation link: {reissue_err}");
                }
                return Err(e.into());
            }
        };

        let user = self
            .repos
            .users
            .activate(user.id, &external_id, Utc::now())
            .await?;

        self.audit
            .log(
                AuditEvent::new(AuditEventType::PasswordCreated)
                    .user(user.id)
                    .tenant(tenant.id)
                    .detail("score", evaluation.score),
            )
            .await;
        self.audit
            .log(
                AuditEvent::new(AuditEventType::AccountActivationCompleted)
                    .user(user.id)
                    .tenant(tenant.id)
                    .email(user.email.clone())
                    .elapsed_since(started),
            )
            .await;

        info!(user_id = %user.id, tenant = %tenant.slug, "Account activated");
        Ok(ActivationResult {
            user: UserSummary::from(&user),
            tenant: TenantSummary::from(&tenant),
        })
    }

    /// Creates the provider identity, or links the one that already holds this email
    /// (a member of several tenants signs in with one identity).
    async fn provision_identity(
        &self,
        user: &User,
        tenant: &Tenant,
        password: &str,
    ) -> Result<String, IdentityError> {
        let created = self
            .identity
            .create_user(&NewIdentity {
                email: &user.email,
                password,
                tenant_id: tenant.id,
                role: user.role.as_str(),
            })
            .await;

        match created {
            Err(IdentityError::AlreadyExists) => {
                let existing = self
                    .identity
                    .find_by_email(&user.email)
                    .await?
                    .ok_or(IdentityError::AlreadyExists)?;
                info!(user_id = %user.id, tenant = %tenant.slug, "Linking existing identity");
                Ok(existing)
            }
            other => other,
        }
    }

    /// Re-mints and re-sends for an inactive user. Unknown emails and active users are
    /// silently ignored so the endpoint cannot be used to enumerate accounts.
    pub async fn resend(&self, req: &ResendRequest) -> Result<(), AppError> {
        let email = normalize_email(&req.email);
        let Some(tenant) = self
            .repos
            .tenants
            .find_by_slug(req.tenant_slug.trim())
            .await?
        else {
            return Ok(());
        };
        let Some(user) = self
            .repos
            .users
            .find_by_email_and_tenant(&email, tenant.id)
            .await?
        else {
            return Ok(());
        };
        if user.is_active {
            return Ok(());
        }

        if let Err(e) = self.reissue(&user, &tenant).await {
            warn!(user_id = %user.id, "Activation resend failed: {e}");
        }
        Ok(())
    }

    /// Adds an inactive member to `tenant` and mails them an activation link.
    /// Re-inviting a pending member refreshes their link; an active member is a conflict.
    pub async fn invite(
        &self,
        tenant: &Tenant,
        invite: &NewUser,
        invited_by: Uuid,
    ) -> Result<(User, bool), AppError> {
        if let Some(existing) = self
            .repos
            .users
            .find_by_email_and_tenant(&invite.email, tenant.id)
            .await?
        {
            if existing.is_active {
                return Err(AppError::Conflict(format!(
                    "{} is already a member of this workspace",
                    existing.email
                )));
            }
        }

        let user = self.repos.users.upsert_pending(invite).await?;
        self.audit
            .log(
                AuditEvent::new(AuditEventType::UserCreated)
                    .user(user.id)
                    .tenant(tenant.id)
                    .email(user.email.clone())
                    .detail("role", user.role.as_str())
                    .detail("invited_by", invited_by.to_string()),
            )
            .await;

        let sent = self.reissue(&user, tenant).await?;
        info!(user_id = %user.id, tenant = %tenant.slug, sent, "Member invited");
        Ok((user, sent))
    }

    async fn reissue(&self, user: &User, tenant: &Tenant) -> Result<bool, AppError> {
        let raw = match self
            .tokens
            .create_activation_token(MintRequest {
                email: &user.email,
                user_id: user.id,
                tenant_id: tenant.id,
                expires_in_hours: self.links.token_ttl_hours,
                created_from_ip: self.audit.context().ip.as_deref(),
            })
            .await
        {
            Ok(raw) => raw,
            Err(TokenError::DuplicateTokenHash) => return Ok(false),
            Err(e) => return Err(e.into()),
        };

        let url = self.links.activation_url(&raw);
        let email = ActivationEmail {
            to: &user.email,
            tenant_name: &tenant.name,
            activation_url: &url,
            expires_in_hours: self.links.token_ttl_hours,
        };

        match self.notifier.send_activation(&email).await {
            Ok(()) => {
                self.audit
                    .log(
                        AuditEvent::new(AuditEventType::EmailSent)
                            .user(user.id)
                            .tenant(tenant.id)
                            .detail("template", "activation_resend"),
                    )
                    .await;
                Ok(true)
            }
            Err(e) => {
                self.audit
                    .log(
                        AuditEvent::new(AuditEventType::EmailFailed)
                            .user(user.id)
                            .tenant(tenant.id)
                            .failed(e.to_string()),
                    )
                    .await;
                Err(AppError::Internal(anyhow::anyhow!(
                    "activation email could not be sent: {e}"
                )))
            }
        }
    }

    async fn load_identity(&self, data: &TokenData) -> Result<(User, Tenant), AppError> {
        let user = self
            .repos
            .users
            .find_by_id(data.user_id)
            .await?
            .ok_or_else(|| AppError::NotFound("User not found".to_string()))?;
        let tenant = self
            .repos
            .tenants
            .find_by_id(data.tenant_id)
            .await?
            .ok_or_else(|| AppError::NotFound("Tenant not found".to_string()))?;

        if user.tenant_id != tenant.id || normalize_email(&user.email) != normalize_email(&data.email)
        {
            self.audit
                .log(
                    AuditEvent::new(AuditEventType::SuspiciousActivity)
                        .user(user.id)
                        .tenant(tenant.id)
                        .failed("activation token does not match its user"),
                )
                .await;
            return Err(AppError::Validation("Invalid activation token".to_string()));
        }
        Ok((user, tenant))
    }

    async fn fail(&self, user: Option<&User>, reason: &str) -> AppError {
        let mut event = AuditEvent::new(AuditEventType::AccountActivationFailed).failed(reason);
        if let Some(user) = user {
            event = event.user(user.id).tenant(user.tenant_id);
        }
        self.audit.log(event).await;
        AppError::Validation(reason.to_string())
    }
}
