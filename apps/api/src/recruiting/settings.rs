use axum::{
    extract::{Path, State},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::errors::AppError;
use crate::models::tenant::TenantSummary;
use crate::state::AppState;
use crate::tenancy::{authorize, AuthenticatedUser, Capability};

const MAX_NAME_LEN: usize = 120;

#[derive(Debug, Deserialize)]
pub struct SettingsPatch {
    pub name: Option<String>,
    pub settings: Option<Value>,
}

#[derive(Debug, Serialize)]
pub struct SettingsResponse {
    pub tenant: TenantSummary,
    pub settings: Value,
}

impl SettingsPatch {
    /// The settings blob replaces the stored one wholesale and must be a JSON object.
    fn validate(&mut self) -> Result<(), AppError> {
        if let Some(name) = self.name.as_mut() {
            *name = name.trim().to_string();
            if name.is_empty() || name.chars().count() > MAX_NAME_LEN {
                return Err(AppError::Validation(format!(
                    "name must be 1-{MAX_NAME_LEN} characters"
                )));
            }
        }
        if matches!(&self.settings, Some(v) if !v.is_object()) {
            return Err(AppError::Validation(
                "settings must be a JSON object".to_string(),
            ));
        }
        if self.name.is_none() && self.settings.is_none() {
            return Err(AppError::Validation("Nothing to update".to_string()));
        }
        Ok(())
    }
}

/// PATCH /api/tenants/:slug/settings
pub async fn handle_update(
    State(state): State<AppState>,
    caller: AuthenticatedUser,
    Path(slug): Path<String>,
    Json(mut patch): Json<SettingsPatch>,
) -> Result<Json<SettingsResponse>, AppError> {
    let access = authorize(&state, &caller, &slug, Capability::ManageSettings).await?;
    patch.validate()?;

    let tenant = state
        .repos
        .tenants
        .update_settings(access.tenant.id, patch.name.as_deref(), patch.settings.as_ref())
        .await?;
    info!(tenant = %tenant.slug, by = %access.user.id, "Tenant settings updated");

    Ok(Json(SettingsResponse {
        tenant: TenantSummary::from(&tenant),
        settings: tenant.settings,
    }))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_patch_trims_name() {
        let mut patch = SettingsPatch {
            name: Some("  Acme Recruiting ".to_string()),
            settings: None,
        };
        patch.validate().unwrap();
        assert_eq!(patch.name.as_deref(), Some("Acme Recruiting"));
    }

    #[test]
    fn test_patch_rejects_non_object_settings() {
        let mut patch = SettingsPatch {
            name: None,
            settings: Some(json!(["a", "b"])),
        };
        assert!(patch.validate().is_err());
    }

    #[test]
    fn test_patch_rejects_empty_update() {
        let mut patch = SettingsPatch {
            name: None,
            settings: None,
        };
        assert!(patch.validate().is_err());
        let mut blank = SettingsPatch {
            name: Some("   ".to_string()),
            settings: Some(json!({})),
        };
        assert!(blank.validate().is_err());
    }
}
