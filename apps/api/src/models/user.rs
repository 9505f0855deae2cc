use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use super::UnknownVariant;

/// Role of a user inside one tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    Admin,
    User,
    Viewer,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "ADMIN",
            Role::User => "USER",
            Role::Viewer => "VIEWER",
        }
    }

    /// Strict numeric hierarchy used for minimum-role checks.
    pub fn level(&self) -> u8 {
        match self {
            Role::Admin => 3,
            Role::User => 2,
            Role::Viewer => 1,
        }
    }

    pub fn satisfies(&self, required: Role) -> bool {
        self.level() >= required.level()
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ADMIN" => Ok(Role::Admin),
            "USER" => Ok(Role::User),
            "VIEWER" => Ok(Role::Viewer),
            _ => Err(UnknownVariant {
                kind: "role",
                value: s.to_string(),
            }),
        }
    }
}

impl TryFrom<String> for Role {
    type Error = UnknownVariant;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub name: Option<String>,
    #[sqlx(try_from = "String")]
    pub role: Role,
    pub tenant_id: Uuid,
    pub is_active: bool,
    pub activated_at: Option<DateTime<Utc>>,
    /// Identity-provider user id, set on activation.
    pub external_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A user row to create inactive, or to refresh if `(email, tenant_id)` already exists.
#[derive(Debug, Clone)]
pub struct NewUser {
    pub email: String,
    pub name: Option<String>,
    pub role: Role,
    pub tenant_id: Uuid,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSummary {
    pub id: Uuid,
    pub email: String,
    pub name: Option<String>,
    pub role: Role,
    pub tenant_id: Uuid,
    pub is_active: bool,
    pub activated_at: Option<DateTime<Utc>>,
}

impl From<&User> for UserSummary {
    fn from(user: &User) -> Self {
        Self {
            id: user.id,
            email: user.email.clone(),
            name: user.name.clone(),
            role: user.role,
            tenant_id: user.tenant_id,
            is_active: user.is_active,
            activated_at: user.activated_at,
        }
    }
}

/// Emails are compared case-insensitively everywhere, so they are stored normalized.
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}
