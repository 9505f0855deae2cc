use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use uuid::Uuid;

use crate::errors::AppError;
use crate::models::recruiting::{Candidate, CandidateInput};
use crate::models::user::normalize_email;
use crate::recruiting::{clean_optional, normalize_skills, require_text, validate_status};
use crate::state::AppState;
use crate::tenancy::{authorize, AuthenticatedUser, Capability};

const STATUSES: &[&str] = &["new", "screening", "interviewing", "offered", "hired", "rejected"];

#[derive(Debug, Default, Deserialize)]
pub struct CandidateFilter {
    pub status: Option<String>,
}

fn validate(input: &mut CandidateInput) -> Result<(), AppError> {
    input.first_name = require_text("firstName", &input.first_name)?;
    input.last_name = require_text("lastName", &input.last_name)?;

    let email = normalize_email(&input.email);
    match email.split_once('@') {
        Some((local, domain)) if !local.is_empty() && domain.contains('.') => {}
        _ => return Err(AppError::Validation("A valid email is required".to_string())),
    }
    input.email = email;

    input.phone = clean_optional(input.phone.take());
    input.skills = normalize_skills(&input.skills);
    if input.experience_years.is_some_and(|y| y < 0) {
        return Err(AppError::Validation(
            "experienceYears must not be negative".to_string(),
        ));
    }
    validate_status(input.status.as_deref(), STATUSES)
}

/// GET /api/tenants/:slug/candidates?status=
pub async fn handle_list(
    State(state): State<AppState>,
    caller: AuthenticatedUser,
    Path(slug): Path<String>,
    Query(filter): Query<CandidateFilter>,
) -> Result<Json<Vec<Candidate>>, AppError> {
    let access = authorize(&state, &caller, &slug, Capability::Read).await?;
    let rows: Vec<Candidate> = sqlx::query_as(
        r#"
        SELECT * FROM candidates
        WHERE tenant_id = $1 AND ($2::TEXT IS NULL OR status = $2)
        ORDER BY created_at DESC
        "#,
    )
    .bind(access.tenant.id)
    .bind(&filter.status)
    .fetch_all(&state.db)
    .await?;
    Ok(Json(rows))
}

/// POST /api/tenants/:slug/candidates
pub async fn handle_create(
    State(state): State<AppState>,
    caller: AuthenticatedUser,
    Path(slug): Path<String>,
    Json(mut input): Json<CandidateInput>,
) -> Result<(StatusCode, Json<Candidate>), AppError> {
    let access = authorize(&state, &caller, &slug, Capability::Write).await?;
    validate(&mut input)?;

    // Duplicate emails within a tenant surface as 409 via the unique constraint.
    let row: Candidate = sqlx::query_as(
        r#"
        INSERT INTO candidates
            (id, tenant_id, first_name, last_name, email, phone, skills,
             experience_years, resume_text, status, notes)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, COALESCE($10, 'new'), $11)
        RETURNING *
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(access.tenant.id)
    .bind(&input.first_name)
    .bind(&input.last_name)
    .bind(&input.email)
    .bind(&input.phone)
    .bind(&input.skills)
    .bind(input.experience_years)
    .bind(&input.resume_text)
    .bind(&input.status)
    .bind(&input.notes)
    .fetch_one(&state.db)
    .await?;

    Ok((StatusCode::CREATED, Json(row)))
}

/// GET /api/tenants/:slug/candidates/:id
pub async fn handle_get(
    State(state): State<AppState>,
    caller: AuthenticatedUser,
    Path((slug, id)): Path<(String, Uuid)>,
) -> Result<Json<Candidate>, AppError> {
    let access = authorize(&state, &caller, &slug, Capability::Read).await?;
    find(&state, access.tenant.id, id)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("Candidate {id} not found")))
}

/// PUT /api/tenants/:slug/candidates/:id
pub async fn handle_update(
    State(state): State<AppState>,
    caller: AuthenticatedUser,
    Path((slug, id)): Path<(String, Uuid)>,
    Json(mut input): Json<CandidateInput>,
) -> Result<Json<Candidate>, AppError> {
    let access = authorize(&state, &caller, &slug, Capability::Write).await?;
    validate(&mut input)?;

    let row: Option<Candidate> = sqlx::query_as(
        r#"
        UPDATE candidates
        SET first_name = $3, last_name = $4, email = $5, phone = $6, skills = $7,
            experience_years = $8, resume_text = $9, status = COALESCE($10, status),
            notes = $11, updated_at = NOW()
        WHERE id = $1 AND tenant_id = $2
        RETURNING *
        "#,
    )
    .bind(id)
    .bind(access.tenant.id)
    .bind(&input.first_name)
    .bind(&input.last_name)
    .bind(&input.email)
    .bind(&input.phone)
    .bind(&input.skills)
    .bind(input.experience_years)
    .bind(&input.resume_text)
    .bind(&input.status)
    .bind(&input.notes)
    .fetch_optional(&state.db)
    .await?;

    row.map(Json)
        .ok_or_else(|| AppError::NotFound(format!("Candidate {id} not found")))
}

/// DELETE /api/tenants/:slug/candidates/:id
pub async fn handle_delete(
    State(state): State<AppState>,
    caller: AuthenticatedUser,
    Path((slug, id)): Path<(String, Uuid)>,
) -> Result<StatusCode, AppError> {
    let access = authorize(&state, &caller, &slug, Capability::Delete).await?;
    let result = sqlx::query("DELETE FROM candidates WHERE id = $1 AND tenant_id = $2")
        .bind(id)
        .bind(access.tenant.id)
        .execute(&state.db)
        .await?;

    if result.rows_affected() == 0 {
        return Err(AppError::NotFound(format!("Candidate {id} not found")));
    }
    Ok(StatusCode::NO_CONTENT)
}

pub async fn find(state: &AppState, tenant_id: Uuid, id: Uuid) -> Result<Option<Candidate>, AppError> {
    Ok(
        sqlx::query_as("SELECT * FROM candidates WHERE id = $1 AND tenant_id = $2")
            .bind(id)
            .bind(tenant_id)
            .fetch_optional(&state.db)
            .await?,
    )
}
