//! Tenant-scoped recruiting data: positions, job postings, candidates, members and
//! workspace settings. Every query is filtered by the caller's resolved tenant.

pub mod candidates;
pub mod jobs;
pub mod positions;
pub mod settings;
pub mod users;

use crate::errors::AppError;

pub(crate) fn require_text(field: &str, value: &str) -> Result<String, AppError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(AppError::Validation(format!("{field} is required")));
    }
    Ok(trimmed.to_string())
}

pub(crate) fn clean_optional(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Trims skills and drops blanks and case-insensitive duplicates, keeping first spelling.
pub(crate) fn normalize_skills(skills: &[String]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    skills
        .iter()
        .map(|s| s.trim())
        .filter(|s| !s.is_empty() && seen.insert(s.to_lowercase()))
        .map(str::to_string)
        .collect()
}

pub(crate) fn validate_status(status: Option<&str>, allowed: &[&str]) -> Result<(), AppError> {
    match status {
        Some(s) if !allowed.contains(&s) => Err(AppError::Validation(format!(
            "status must be one of: {}",
            allowed.join(", ")
        ))),
        _ => Ok(()),
    }
}
