//! Role → capability mapping and the per-request tenant access check.

use serde::Serialize;
use thiserror::Error;

use crate::errors::AppError;
use crate::models::tenant::{Tenant, TenantSummary};
use crate::models::user::{normalize_email, Role, User};
use crate::store::{Repositories, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Capabilities {
    pub can_read: bool,
    pub can_write: bool,
    pub can_delete: bool,
    pub can_manage_users: bool,
    pub can_manage_settings: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    Read,
    Write,
    Delete,
    ManageUsers,
    ManageSettings,
}

impl Capabilities {
    pub fn for_role(role: Role) -> Self {
        match role {
            Role::Admin => Self {
                can_read: true,
                can_write: true,
                can_delete: true,
                can_manage_users: true,
                can_manage_settings: true,
            },
            Role::User => Self {
                can_read: true,
                can_write: true,
                can_delete: false,
                can_manage_users: false,
                can_manage_settings: false,
            },
            Role::Viewer => Self {
                can_read: true,
                can_write: false,
                can_delete: false,
                can_manage_users: false,
                can_manage_settings: false,
            },
        }
    }

    pub fn allows(&self, capability: Capability) -> bool {
        match capability {
            Capability::Read => self.can_read,
            Capability::Write => self.can_write,
            Capability::Delete => self.can_delete,
            Capability::ManageUsers => self.can_manage_users,
            Capability::ManageSettings => self.can_manage_settings,
        }
    }
}

#[derive(Debug, Error)]
pub enum TenantAccessError {
    #[error("Tenant '{0}' not found")]
    TenantNotFound(String),

    #[error("User does not belong to this tenant")]
    UserNotInTenant,

    #[error("User account is not active")]
    UserInactive,

    #[error("Requires {required} role, user has {actual}")]
    InsufficientRole { required: Role, actual: Role },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<TenantAccessError> for AppError {
    fn from(err: TenantAccessError) -> Self {
        match err {
            TenantAccessError::TenantNotFound(_) => AppError::NotFound(err.to_string()),
            TenantAccessError::Store(e) => e.into(),
            other => AppError::Forbidden(other.to_string()),
        }
    }
}

/// A resolved membership: the tenant, the caller's row in it, and what it may do.
#[derive(Debug, Clone)]
pub struct TenantAccess {
    pub tenant: Tenant,
    pub user: User,
    pub role: Role,
    pub permissions: Capabilities,
}

impl TenantAccess {
    pub fn require(&self, capability: Capability) -> Result<(), AppError> {
        if self.permissions.allows(capability) {
            Ok(())
        } else {
            Err(AppError::Forbidden(format!(
                "Role {} may not perform this action",
                self.role
            )))
        }
    }

    pub fn summary(&self) -> AccessSummary {
        AccessSummary {
            tenant: TenantSummary::from(&self.tenant),
            role: self.role,
            permissions: self.permissions,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessSummary {
    pub tenant: TenantSummary,
    pub role: Role,
    pub permissions: Capabilities,
}

pub async fn check_tenant_permission(
    repos: &Repositories,
    email: &str,
    tenant_slug: &str,
    required_role: Option<Role>,
) -> Result<TenantAccess, TenantAccessError> {
    let tenant = repos
        .tenants
        .find_by_slug(tenant_slug)
        .await?
        .ok_or_else(|| TenantAccessError::TenantNotFound(tenant_slug.to_string()))?;

    let user = repos
        .users
        .find_by_email_and_tenant(&normalize_email(email), tenant.id)
        .await?
        .ok_or(TenantAccessError::UserNotInTenant)?;

    if !user.is_active {
        return Err(TenantAccessError::UserInactive);
    }

    if let Some(required) = required_role {
        if !user.role.satisfies(required) {
            return Err(TenantAccessError::InsufficientRole {
                required,
                actual: user.role,
            });
        }
    }

    let role = user.role;
    Ok(TenantAccess {
        tenant,
        user,
        role,
        permissions: Capabilities::for_role(role),
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Utc;

    use super::*;
    use crate::models::user::NewUser;
    use crate::store::memory::MemoryStore;
    use crate::store::UserRepository;

    async fn member(store: &MemoryStore, tenant: &Tenant, email: &str, role: Role, active: bool) {
        let user = store
            .upsert_pending(&NewUser {
                email: email.to_string(),
                name: None,
                role,
                tenant_id: tenant.id,
            })
            .await
            .unwrap();
        if active {
            store.activate(user.id, "ext", Utc::now()).await.unwrap();
        }
    }

    async fn setup() -> (Arc<MemoryStore>, Repositories) {
        let store = Arc::new(MemoryStore::new());
        let tenant = store.seed_tenant("acme", None);
        member(&store, &tenant, "admin@acme.test", Role::Admin, true).await;
        member(&store, &tenant, "user@acme.test", Role::User, true).await;
        member(&store, &tenant, "viewer@acme.test", Role::Viewer, true).await;
        member(&store, &tenant, "pending@acme.test", Role::Admin, false).await;
        store.seed_tenant("globex", None);
        let repos = Repositories::from_store(store.clone());
        (store, repos)
    }

    #[test]
    fn test_capabilities_are_nested_by_role() {
        let admin = Capabilities::for_role(Role::Admin);
        let user = Capabilities::for_role(Role::User);
        let viewer = Capabilities::for_role(Role::Viewer);
        for cap in [
            Capability::Read,
            Capability::Write,
            Capability::Delete,
            Capability::ManageUsers,
            Capability::ManageSettings,
        ] {
            if viewer.allows(cap) {
                assert!(user.allows(cap));
            }
            if user.allows(cap) {
                assert!(admin.allows(cap));
            }
            assert!(admin.allows(cap));
        }
        assert!(!user.allows(Capability::Delete));
        assert!(!viewer.allows(Capability::Write));
    }

    #[tokio::test]
    async fn test_viewer_rejected_for_higher_roles() {
        let (_store, repos) = setup().await;
        for required in [Role::User, Role::Admin] {
            let result =
                check_tenant_permission(&repos, "viewer@acme.test", "acme", Some(required)).await;
            assert!(matches!(
                result,
                Err(TenantAccessError::InsufficientRole { actual: Role::Viewer, .. })
            ));
        }
    }

    #[tokio::test]
    async fn test_admin_granted_everything() {
        let (_store, repos) = setup().await;
        for required in [Role::Viewer, Role::User, Role::Admin] {
            let access = check_tenant_permission(&repos, "ADMIN@acme.test", "acme", Some(required))
                .await
                .unwrap();
            assert_eq!(access.role, Role::Admin);
            assert!(access.require(Capability::ManageSettings).is_ok());
        }
    }

    #[tokio::test]
    async fn test_distinct_lookup_failures() {
        let (_store, repos) = setup().await;
        assert!(matches!(
            check_tenant_permission(&repos, "admin@acme.test", "nope", None).await,
            Err(TenantAccessError::TenantNotFound(_))
        ));
        assert!(matches!(
            check_tenant_permission(&repos, "admin@acme.test", "globex", None).await,
            Err(TenantAccessError::UserNotInTenant)
        ));
        assert!(matches!(
            check_tenant_permission(&repos, "pending@acme.test", "acme", None).await,
            Err(TenantAccessError::UserInactive)
        ));
    }

    #[tokio::test]
    async fn test_user_cannot_delete() {
        let (_store, repos) = setup().await;
        let access = check_tenant_permission(&repos, "user@acme.test", "acme", None)
            .await
            .unwrap();
        assert!(access.require(Capability::Write).is_ok());
        assert!(matches!(
            access.require(Capability::Delete),
            Err(AppError::Forbidden(_))
        ));
    }

    #[test]
    fn test_access_errors_map_to_statuses() {
        let err: AppError = TenantAccessError::TenantNotFound("x".into()).into();
        assert!(matches!(err, AppError::NotFound(_)));
        let err: AppError = TenantAccessError::UserInactive.into();
        assert!(matches!(err, AppError::Forbidden(_)));
    }
}
