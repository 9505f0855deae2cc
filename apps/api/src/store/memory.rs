//! In-memory store for tests. Emulates the unique constraints and conditional
//! updates of the Postgres schema so workflow races behave the same way.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use uuid::Uuid;

use super::{
    ActivationTokenRepository, AuditRecord, AuditRepository, EventMarkerRepository,
    StoreError, StoreResult, TenantRepository, UserRepository, TENANT_CUSTOMER_KEY,
    TENANT_SLUG_KEY, TENANT_SUBSCRIPTION_KEY, TOKEN_HASH_KEY,
};
use crate::models::activation_token::{ActivationToken, NewActivationToken};
use crate::models::tenant::{BillingUpdate, NewTenant, Tenant};
use crate::models::user::{NewUser, User};

#[derive(Default)]
struct Tables {
    tenants: Vec<Tenant>,
    users: Vec<User>,
    tokens: Vec<ActivationToken>,
    markers: HashMap<String, String>,
    audit: Vec<AuditRecord>,
}

#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<R>(&self, f: impl FnOnce(&mut Tables) -> R) -> R {
        let mut tables = self.tables.lock().expect("memory store lock poisoned");
        f(&mut tables)
    }

    pub fn tenants(&self) -> Vec<Tenant> {
        self.with(|t| t.tenants.clone())
    }

    pub fn users(&self) -> Vec<User> {
        self.with(|t| t.users.clone())
    }

    pub fn tokens(&self) -> Vec<ActivationToken> {
        self.with(|t| t.tokens.clone())
    }

    pub fn audit_types(&self) -> Vec<String> {
        self.with(|t| t.audit.iter().map(|r| r.event_type.clone()).collect())
    }

    pub fn has_marker(&self, id: &str) -> bool {
        self.with(|t| t.markers.contains_key(id))
    }

    /// Seeds a tenant directly, bypassing the workflow.
    pub fn seed_tenant(&self, slug: &str, customer_id: Option<&str>) -> Tenant {
        let now = Utc::now();
        let tenant = Tenant {
            id: Uuid::new_v4(),
            name: slug.to_string(),
            slug: slug.to_string(),
            domain: None,
            plan: Default::default(),
            status: Default::default(),
            stripe_customer_id: customer_id.map(String::from),
            stripe_subscription_id: None,
            settings: json!({}),
            created_at: now,
            updated_at: now,
        };
        self.with(|t| t.tenants.push(tenant.clone()));
        tenant
    }

    /// Forces the expiry of a stored token, for expiry tests.
    pub fn expire_token(&self, token_hash: &str, expires_at: DateTime<Utc>) {
        self.with(|t| {
            if let Some(token) = t.tokens.iter_mut().find(|tk| tk.token_hash == token_hash) {
                token.expires_at = expires_at;
            }
        });
    }
}

/// Yields once per call so concurrent workflows interleave between store round trips.
async fn interleave() {
    tokio::task::yield_now().await;
}

fn check_tenant_uniques(tenants: &[Tenant], skip: Option<Uuid>, candidate: &Tenant) -> StoreResult<()> {
    for existing in tenants.iter().filter(|t| Some(t.id) != skip) {
        if existing.slug == candidate.slug {
            return Err(StoreError::UniqueViolation(TENANT_SLUG_KEY.to_string()));
        }
        if candidate.stripe_customer_id.is_some()
            && existing.stripe_customer_id == candidate.stripe_customer_id
        {
            return Err(StoreError::UniqueViolation(TENANT_CUSTOMER_KEY.to_string()));
        }
        if candidate.stripe_subscription_id.is_some()
            && existing.stripe_subscription_id == candidate.stripe_subscription_id
        {
            return Err(StoreError::UniqueViolation(
                TENANT_SUBSCRIPTION_KEY.to_string(),
            ));
        }
    }
    Ok(())
}

#[async_trait]
impl TenantRepository for MemoryStore {
    async fn find_by_id(&self, id: Uuid) -> StoreResult<Option<Tenant>> {
        interleave().await;
        Ok(self.with(|t| t.tenants.iter().find(|x| x.id == id).cloned()))
    }

    async fn find_by_slug(&self, slug: &str) -> StoreResult<Option<Tenant>> {
        interleave().await;
        Ok(self.with(|t| t.tenants.iter().find(|x| x.slug == slug).cloned()))
    }

    async fn find_by_customer_id(&self, customer_id: &str) -> StoreResult<Option<Tenant>> {
        interleave().await;
        Ok(self.with(|t| {
            t.tenants
                .iter()
                .find(|x| x.stripe_customer_id.as_deref() == Some(customer_id))
                .cloned()
        }))
    }

    async fn find_by_subscription_id(
        &self,
        subscription_id: &str,
    ) -> StoreResult<Option<Tenant>> {
        interleave().await;
        Ok(self.with(|t| {
            t.tenants
                .iter()
                .find(|x| x.stripe_subscription_id.as_deref() == Some(subscription_id))
                .cloned()
        }))
    }

    async fn insert(&self, new: &NewTenant) -> StoreResult<Tenant> {
        interleave().await;
        let now = Utc::now();
        let tenant = Tenant {
            id: Uuid::new_v4(),
            name: new.name.clone(),
            slug: new.slug.clone(),
            domain: None,
            plan: new.plan,
            status: new.status,
            stripe_customer_id: new.stripe_customer_id.clone(),
            stripe_subscription_id: new.stripe_subscription_id.clone(),
            settings: json!({}),
            created_at: now,
            updated_at: now,
        };
        self.with(|t| {
            check_tenant_uniques(&t.tenants, None, &tenant)?;
            t.tenants.push(tenant.clone());
            Ok(tenant)
        })
    }

    async fn update_billing(&self, id: Uuid, update: &BillingUpdate) -> StoreResult<Tenant> {
        interleave().await;
        self.with(|t| {
            let idx = t
                .tenants
                .iter()
                .position(|x| x.id == id)
                .ok_or(StoreError::NotFound)?;
            let mut updated = t.tenants[idx].clone();
            if let Some(plan) = update.plan {
                updated.plan = plan;
            }
            if let Some(status) = update.status {
                updated.status = status;
            }
            if update.stripe_customer_id.is_some() {
                updated.stripe_customer_id = update.stripe_customer_id.clone();
            }
            if update.stripe_subscription_id.is_some() {
                updated.stripe_subscription_id = update.stripe_subscription_id.clone();
            }
            updated.updated_at = Utc::now();
            check_tenant_uniques(&t.tenants, Some(id), &updated)?;
            t.tenants[idx] = updated.clone();
            Ok(updated)
        })
    }

    async fn update_settings(
        &self,
        id: Uuid,
        name: Option<&str>,
        settings: Option<&Value>,
    ) -> StoreResult<Tenant> {
        interleave().await;
        self.with(|t| {
            let tenant = t
                .tenants
                .iter_mut()
                .find(|x| x.id == id)
                .ok_or(StoreError::NotFound)?;
            if let Some(name) = name {
                tenant.name = name.to_string();
            }
            if let Some(settings) = settings {
                tenant.settings = settings.clone();
            }
            tenant.updated_at = Utc::now();
            Ok(tenant.clone())
        })
    }
}

#[async_trait]
impl UserRepository for MemoryStore {
    async fn find_by_id(&self, id: Uuid) -> StoreResult<Option<User>> {
        interleave().await;
        Ok(self.with(|t| t.users.iter().find(|u| u.id == id).cloned()))
    }

    async fn find_by_email_and_tenant(
        &self,
        email: &str,
        tenant_id: Uuid,
    ) -> StoreResult<Option<User>> {
        interleave().await;
        Ok(self.with(|t| {
            t.users
                .iter()
                .find(|u| u.email == email && u.tenant_id == tenant_id)
                .cloned()
        }))
    }

    async fn list_by_tenant(&self, tenant_id: Uuid) -> StoreResult<Vec<User>> {
        interleave().await;
        Ok(self.with(|t| {
            t.users
                .iter()
                .filter(|u| u.tenant_id == tenant_id)
                .cloned()
                .collect()
        }))
    }

    async fn upsert_pending(&self, new: &NewUser) -> StoreResult<User> {
        interleave().await;
        Ok(self.with(|t| {
            if let Some(existing) = t
                .users
                .iter_mut()
                .find(|u| u.email == new.email && u.tenant_id == new.tenant_id)
            {
                if new.name.is_some() {
                    existing.name = new.name.clone();
                }
                existing.updated_at = Utc::now();
                return existing.clone();
            }
            let now = Utc::now();
            let user = User {
                id: Uuid::new_v4(),
                email: new.email.clone(),
                name: new.name.clone(),
                role: new.role,
                tenant_id: new.tenant_id,
                is_active: false,
                activated_at: None,
                external_id: None,
                created_at: now,
                updated_at: now,
            };
            t.users.push(user.clone());
            user
        }))
    }

    async fn activate(
        &self,
        id: Uuid,
        external_id: &str,
        activated_at: DateTime<Utc>,
    ) -> StoreResult<User> {
        interleave().await;
        self.with(|t| {
            let user = t
                .users
                .iter_mut()
                .find(|u| u.id == id)
                .ok_or(StoreError::NotFound)?;
            user.is_active = true;
            user.activated_at = Some(activated_at);
            user.external_id = Some(external_id.to_string());
            Ok(user.clone())
        })
    }
}

#[async_trait]
impl ActivationTokenRepository for MemoryStore {
    async fn invalidate_unused_for_user(&self, user_id: Uuid) -> StoreResult<u64> {
        interleave().await;
        Ok(self.with(|t| {
            let mut count = 0;
            for token in t.tokens.iter_mut().filter(|tk| tk.user_id == user_id && !tk.used) {
                token.used = true;
                token.used_at = Some(Utc::now());
                count += 1;
            }
            count
        }))
    }

    async fn insert(&self, new: &NewActivationToken) -> StoreResult<ActivationToken> {
        interleave().await;
        self.with(|t| {
            if t.tokens.iter().any(|tk| tk.token_hash == new.token_hash) {
                return Err(StoreError::UniqueViolation(TOKEN_HASH_KEY.to_string()));
            }
            let token = ActivationToken {
                id: Uuid::new_v4(),
                user_id: new.user_id,
                tenant_id: new.tenant_id,
                email: new.email.clone(),
                token_hash: new.token_hash.clone(),
                expires_at: new.expires_at,
                used: false,
                used_at: None,
                used_from_ip: None,
                created_at: Utc::now(),
                created_from_ip: new.created_from_ip.clone(),
            };
            t.tokens.push(token.clone());
            Ok(token)
        })
    }

    async fn find_by_hash(&self, token_hash: &str) -> StoreResult<Option<ActivationToken>> {
        interleave().await;
        Ok(self.with(|t| t.tokens.iter().find(|tk| tk.token_hash == token_hash).cloned()))
    }

    async fn latest_unused_for(
        &self,
        user_id: Uuid,
        tenant_id: Uuid,
    ) -> StoreResult<Option<ActivationToken>> {
        interleave().await;
        Ok(self.with(|t| {
            t.tokens
                .iter()
                .filter(|tk| tk.user_id == user_id && tk.tenant_id == tenant_id && !tk.used)
                .max_by_key(|tk| tk.created_at)
                .cloned()
        }))
    }

    async fn mark_used(&self, id: Uuid, used_from_ip: Option<&str>) -> StoreResult<bool> {
        interleave().await;
        Ok(self.with(|t| match t.tokens.iter_mut().find(|tk| tk.id == id && !tk.used) {
            Some(token) => {
                token.used = true;
                token.used_at = Some(Utc::now());
                token.used_from_ip = used_from_ip.map(String::from);
                true
            }
            None => false,
        }))
    }
}

#[async_trait]
impl EventMarkerRepository for MemoryStore {
    async fn exists(&self, id: &str) -> StoreResult<bool> {
        interleave().await;
        Ok(self.has_marker(id))
    }

    async fn record(&self, id: &str, event_type: &str) -> StoreResult<bool> {
        interleave().await;
        Ok(self.with(|t| {
            if t.markers.contains_key(id) {
                false
            } else {
                t.markers.insert(id.to_string(), event_type.to_string());
                true
            }
        }))
    }

    async fn release(&self, id: &str) -> StoreResult<()> {
        interleave().await;
        self.with(|t| t.markers.remove(id));
        Ok(())
    }
}

#[async_trait]
impl AuditRepository for MemoryStore {
    async fn insert(&self, record: &AuditRecord) -> StoreResult<()> {
        interleave().await;
        self.with(|t| t.audit.push(record.clone()));
        Ok(())
    }
}
