use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use super::{
    ActivationTokenRepository, AuditRecord, AuditRepository, EventMarkerRepository,
    StoreResult, TenantRepository, UserRepository,
};
use crate::models::activation_token::{ActivationToken, NewActivationToken};
use crate::models::tenant::{BillingUpdate, NewTenant, Tenant};
use crate::models::user::{NewUser, User};

/// Postgres-backed implementation of every repository trait.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TenantRepository for PgStore {
    async fn find_by_id(&self, id: Uuid) -> StoreResult<Option<Tenant>> {
        Ok(
            sqlx::query_as::<_, Tenant>("SELECT * FROM tenants WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    async fn find_by_slug(&self, slug: &str) -> StoreResult<Option<Tenant>> {
        Ok(
            sqlx::query_as::<_, Tenant>("SELECT * FROM tenants WHERE slug = $1")
                .bind(slug)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    async fn find_by_customer_id(&self, customer_id: &str) -> StoreResult<Option<Tenant>> {
        Ok(
            sqlx::query_as::<_, Tenant>("SELECT * FROM tenants WHERE stripe_customer_id = $1")
                .bind(customer_id)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    async fn find_by_subscription_id(
        &self,
        subscription_id: &str,
    ) -> StoreResult<Option<Tenant>> {
        Ok(sqlx::query_as::<_, Tenant>(
            "SELECT * FROM tenants WHERE stripe_subscription_id = $1",
        )
        .bind(subscription_id)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn insert(&self, tenant: &NewTenant) -> StoreResult<Tenant> {
        Ok(sqlx::query_as::<_, Tenant>(
            r#"
            INSERT INTO tenants
                (id, name, slug, plan, status, stripe_customer_id, stripe_subscription_id, settings)
            VALUES ($1, $2, $3, $4, $5, $6, $7, '{}'::jsonb)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&tenant.name)
        .bind(&tenant.slug)
        .bind(tenant.plan.as_str())
        .bind(tenant.status.as_str())
        .bind(&tenant.stripe_customer_id)
        .bind(&tenant.stripe_subscription_id)
        .fetch_one(&self.pool)
        .await?)
    }

    async fn update_billing(&self, id: Uuid, update: &BillingUpdate) -> StoreResult<Tenant> {
        Ok(sqlx::query_as::<_, Tenant>(
            r#"
            UPDATE tenants SET
                plan = COALESCE($2, plan),
                status = COALESCE($3, status),
                stripe_customer_id = COALESCE($4, stripe_customer_id),
                stripe_subscription_id = COALESCE($5, stripe_subscription_id),
                updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(update.plan.map(|p| p.as_str()))
        .bind(update.status.map(|s| s.as_str()))
        .bind(&update.stripe_customer_id)
        .bind(&update.stripe_subscription_id)
        .fetch_one(&self.pool)
        .await?)
    }

    async fn update_settings(
        &self,
        id: Uuid,
        name: Option<&str>,
        settings: Option<&Value>,
    ) -> StoreResult<Tenant> {
        Ok(sqlx::query_as::<_, Tenant>(
            r#"
            UPDATE tenants SET
                name = COALESCE($2, name),
                settings = COALESCE($3, settings),
                updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(name)
        .bind(settings)
        .fetch_one(&self.pool)
        .await?)
    }
}

#[async_trait]
impl UserRepository for PgStore {
    async fn find_by_id(&self, id: Uuid) -> StoreResult<Option<User>> {
        Ok(sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn find_by_email_and_tenant(
        &self,
        email: &str,
        tenant_id: Uuid,
    ) -> StoreResult<Option<User>> {
        Ok(
            sqlx::query_as::<_, User>("SELECT * FROM users WHERE email = $1 AND tenant_id = $2")
                .bind(email)
                .bind(tenant_id)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    async fn list_by_tenant(&self, tenant_id: Uuid) -> StoreResult<Vec<User>> {
        Ok(sqlx::query_as::<_, User>(
            "SELECT * FROM users WHERE tenant_id = $1 ORDER BY created_at ASC",
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn upsert_pending(&self, user: &NewUser) -> StoreResult<User> {
        Ok(sqlx::query_as::<_, User>(
            r#"
            INSERT INTO users (id, email, name, role, tenant_id, is_active)
            VALUES ($1, $2, $3, $4, $5, FALSE)
            ON CONFLICT (email, tenant_id) DO UPDATE SET
                name = COALESCE(EXCLUDED.name, users.name),
                updated_at = NOW()
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&user.email)
        .bind(&user.name)
        .bind(user.role.as_str())
        .bind(user.tenant_id)
        .fetch_one(&self.pool)
        .await?)
    }

    async fn activate(
        &self,
        id: Uuid,
        external_id: &str,
        activated_at: DateTime<Utc>,
    ) -> StoreResult<User> {
        Ok(sqlx::query_as::<_, User>(
            r#"
            UPDATE users SET
                is_active = TRUE,
                activated_at = $2,
                external_id = $3,
                updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(activated_at)
        .bind(external_id)
        .fetch_one(&self.pool)
        .await?)
    }
}

#[async_trait]
impl ActivationTokenRepository for PgStore {
    async fn invalidate_unused_for_user(&self, user_id: Uuid) -> StoreResult<u64> {
        let result = sqlx::query(
            "UPDATE activation_tokens SET used = TRUE, used_at = NOW() WHERE user_id = $1 AND used = FALSE",
        )
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn insert(&self, token: &NewActivationToken) -> StoreResult<ActivationToken> {
        Ok(sqlx::query_as::<_, ActivationToken>(
            r#"
            INSERT INTO activation_tokens
                (id, user_id, tenant_id, email, token_hash, expires_at, created_from_ip)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(token.user_id)
        .bind(token.tenant_id)
        .bind(&token.email)
        .bind(&token.token_hash)
        .bind(token.expires_at)
        .bind(&token.created_from_ip)
        .fetch_one(&self.pool)
        .await?)
    }

    async fn find_by_hash(&self, token_hash: &str) -> StoreResult<Option<ActivationToken>> {
        Ok(sqlx::query_as::<_, ActivationToken>(
            "SELECT * FROM activation_tokens WHERE token_hash = $1",
        )
        .bind(token_hash)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn latest_unused_for(
        &self,
        user_id: Uuid,
        tenant_id: Uuid,
    ) -> StoreResult<Option<ActivationToken>> {
        Ok(sqlx::query_as::<_, ActivationToken>(
            r#"
            SELECT * FROM activation_tokens
            WHERE user_id = $1 AND tenant_id = $2 AND used = FALSE
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(user_id)
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn mark_used(&self, id: Uuid, used_from_ip: Option<&str>) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE activation_tokens
            SET used = TRUE, used_at = NOW(), used_from_ip = $2
            WHERE id = $1 AND used = FALSE
            "#,
        )
        .bind(id)
        .bind(used_from_ip)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}

#[async_trait]
impl EventMarkerRepository for PgStore {
    async fn exists(&self, id: &str) -> StoreResult<bool> {
        Ok(
            sqlx::query_scalar::<_, bool>("SELECT EXISTS(SELECT 1 FROM webhook_events WHERE id = $1)")
                .bind(id)
                .fetch_one(&self.pool)
                .await?,
        )
    }

    async fn record(&self, id: &str, event_type: &str) -> StoreResult<bool> {
        let result = sqlx::query(
            "INSERT INTO webhook_events (id, event_type) VALUES ($1, $2) ON CONFLICT (id) DO NOTHING",
        )
        .bind(id)
        .bind(event_type)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn release(&self, id: &str) -> StoreResult<()> {
        sqlx::query("DELETE FROM webhook_events WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl AuditRepository for PgStore {
    async fn insert(&self, record: &AuditRecord) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO audit_events (id, event_type, severity, success, created_at) VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(record.id)
        .bind(&record.event_type)
        .bind(&record.severity)
        .bind(record.success)
        .bind(record.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
