use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Stored activation token. Only the hash of the secret is ever persisted.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ActivationToken {
    pub id: Uuid,
    pub user_id: Uuid,
    pub tenant_id: Uuid,
    pub email: String,
    pub token_hash: String,
    pub expires_at: DateTime<Utc>,
    pub used: bool,
    pub used_at: Option<DateTime<Utc>>,
    pub used_from_ip: Option<String>,
    pub created_at: DateTime<Utc>,
    pub created_from_ip: Option<String>,
}

impl ActivationToken {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

#[derive(Debug, Clone)]
pub struct NewActivationToken {
    pub user_id: Uuid,
    pub tenant_id: Uuid,
    pub email: String,
    pub token_hash: String,
    pub expires_at: DateTime<Utc>,
    pub created_from_ip: Option<String>,
}
