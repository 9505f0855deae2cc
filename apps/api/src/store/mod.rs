//! Persistence seams for the onboarding and activation workflows.
//!
//! Every workflow talks to these traits, never to `PgPool` directly, so the same code
//! runs against Postgres in production and against `memory::MemoryStore` in tests.
//! Concurrency is optimistic: callers rely on unique constraints and conditional
//! updates, and a violated constraint comes back as `StoreError::UniqueViolation`.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::models::activation_token::{ActivationToken, NewActivationToken};
use crate::models::tenant::{BillingUpdate, NewTenant, Tenant};
use crate::models::user::{NewUser, User};

#[cfg(test)]
pub mod memory;
pub mod postgres;

pub const TENANT_SLUG_KEY: &str = "tenants_slug_key";
pub const TENANT_CUSTOMER_KEY: &str = "tenants_stripe_customer_id_key";
pub const TENANT_SUBSCRIPTION_KEY: &str = "tenants_stripe_subscription_id_key";
pub const TOKEN_HASH_KEY: &str = "activation_tokens_token_hash_key";

#[derive(Debug, Error)]
pub enum StoreError {
    /// Carries the name of the violated constraint.
    #[error("unique constraint violated: {0}")]
    UniqueViolation(String),

    #[error("row not found")]
    NotFound,

    #[error("database error: {0}")]
    Database(sqlx::Error),
}

impl StoreError {
    pub fn is_unique_violation_of(&self, constraint: &str) -> bool {
        matches!(self, StoreError::UniqueViolation(c) if c == constraint)
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => StoreError::NotFound,
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                StoreError::UniqueViolation(db.constraint().unwrap_or_default().to_string())
            }
            _ => StoreError::Database(err),
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait TenantRepository: Send + Sync {
    async fn find_by_id(&self, id: Uuid) -> StoreResult<Option<Tenant>>;
    async fn find_by_slug(&self, slug: &str) -> StoreResult<Option<Tenant>>;
    async fn find_by_customer_id(&self, customer_id: &str) -> StoreResult<Option<Tenant>>;
    async fn find_by_subscription_id(&self, subscription_id: &str)
        -> StoreResult<Option<Tenant>>;
    async fn insert(&self, tenant: &NewTenant) -> StoreResult<Tenant>;
    async fn update_billing(&self, id: Uuid, update: &BillingUpdate) -> StoreResult<Tenant>;
    async fn update_settings(
        &self,
        id: Uuid,
        name: Option<&str>,
        settings: Option<&Value>,
    ) -> StoreResult<Tenant>;
}

#[async_trait]
pub trait UserRepository: Send + Sync {
    async fn find_by_id(&self, id: Uuid) -> StoreResult<Option<User>>;
    async fn find_by_email_and_tenant(
        &self,
        email: &str,
        tenant_id: Uuid,
    ) -> StoreResult<Option<User>>;
    async fn list_by_tenant(&self, tenant_id: Uuid) -> StoreResult<Vec<User>>;
    /// Inserts an inactive user or refreshes the name of the existing
    /// `(email, tenant_id)` row. Never touches `is_active` or `role` of an existing row.
    async fn upsert_pending(&self, user: &NewUser) -> StoreResult<User>;
    async fn activate(
        &self,
        id: Uuid,
        external_id: &str,
        activated_at: DateTime<Utc>,
    ) -> StoreResult<User>;
}

#[async_trait]
pub trait ActivationTokenRepository: Send + Sync {
    /// Marks every unused token of the user as used. Returns how many were invalidated.
    async fn invalidate_unused_for_user(&self, user_id: Uuid) -> StoreResult<u64>;
    async fn insert(&self, token: &NewActivationToken) -> StoreResult<ActivationToken>;
    async fn find_by_hash(&self, token_hash: &str) -> StoreResult<Option<ActivationToken>>;
    async fn latest_unused_for(
        &self,
        user_id: Uuid,
        tenant_id: Uuid,
    ) -> StoreResult<Option<ActivationToken>>;
    /// Conditional `used = false → true` transition. Returns `false` when another
    /// caller already consumed the token.
    async fn mark_used(&self, id: Uuid, used_from_ip: Option<&str>) -> StoreResult<bool>;
}

/// Append-only idempotency markers keyed by an arbitrary string id.
#[async_trait]
pub trait EventMarkerRepository: Send + Sync {
    async fn exists(&self, id: &str) -> StoreResult<bool>;
    /// Insert-if-absent. Returns `true` when this call created the marker.
    async fn record(&self, id: &str, event_type: &str) -> StoreResult<bool>;
    /// Removes a claim marker whose side effect did not happen.
    async fn release(&self, id: &str) -> StoreResult<()>;
}

#[derive(Debug, Clone)]
pub struct AuditRecord {
    pub id: Uuid,
    pub event_type: String,
    pub severity: String,
    pub success: bool,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait AuditRepository: Send + Sync {
    async fn insert(&self, record: &AuditRecord) -> StoreResult<()>;
}

/// Bundle of repository handles carried in `AppState`.
#[derive(Clone)]
pub struct Repositories {
    pub tenants: Arc<dyn TenantRepository>,
    pub users: Arc<dyn UserRepository>,
    pub tokens: Arc<dyn ActivationTokenRepository>,
    pub markers: Arc<dyn EventMarkerRepository>,
    pub audit: Arc<dyn AuditRepository>,
}

impl Repositories {
    pub fn postgres(pool: sqlx::PgPool) -> Self {
        Self::from_store(Arc::new(postgres::PgStore::new(pool)))
    }

    pub fn from_store<S>(store: Arc<S>) -> Self
    where
        S: TenantRepository
            + UserRepository
            + ActivationTokenRepository
            + EventMarkerRepository
            + AuditRepository
            + 'static,
    {
        Self {
            tenants: store.clone(),
            users: store.clone(),
            tokens: store.clone(),
            markers: store.clone(),
            audit: store,
        }
    }
}
