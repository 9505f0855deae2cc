use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use uuid::Uuid;

use crate::errors::AppError;
use crate::models::recruiting::{Job, JobInput};
use crate::recruiting::{clean_optional, positions, require_text, validate_status};
use crate::state::AppState;
use crate::tenancy::{authorize, AuthenticatedUser, Capability};

const STATUSES: &[&str] = &["draft", "published", "closed"];
const EMPLOYMENT_TYPES: &[&str] = &["full_time", "part_time", "contract", "internship"];

fn validate(input: &mut JobInput) -> Result<(), AppError> {
    input.title = require_text("title", &input.title)?;
    input.location = clean_optional(input.location.take());
    input.employment_type = clean_optional(input.employment_type.take());

    if let Some(kind) = input.employment_type.as_deref() {
        if !EMPLOYMENT_TYPES.contains(&kind) {
            return Err(AppError::Validation(format!(
                "employmentType must be one of: {}",
                EMPLOYMENT_TYPES.join(", ")
            )));
        }
    }

    if input.salary_min.is_some_and(|v| v < 0) || input.salary_max.is_some_and(|v| v < 0) {
        return Err(AppError::Validation("Salary must not be negative".to_string()));
    }
    if let (Some(min), Some(max)) = (input.salary_min, input.salary_max) {
        if min > max {
            return Err(AppError::Validation(
                "salaryMin must not exceed salaryMax".to_string(),
            ));
        }
    }

    validate_status(input.status.as_deref(), STATUSES)
}

/// A linked position must belong to the same tenant.
async fn check_position(state: &AppState, tenant_id: Uuid, input: &JobInput) -> Result<(), AppError> {
    if let Some(position_id) = input.position_id {
        if positions::find(state, tenant_id, position_id).await?.is_none() {
            return Err(AppError::Validation(format!(
                "Position {position_id} does not exist"
            )));
        }
    }
    Ok(())
}

/// GET /api/tenants/:slug/jobs
pub async fn handle_list(
    State(state): State<AppState>,
    caller: AuthenticatedUser,
    Path(slug): Path<String>,
) -> Result<Json<Vec<Job>>, AppError> {
    let access = authorize(&state, &caller, &slug, Capability::Read).await?;
    let rows: Vec<Job> =
        sqlx::query_as("SELECT * FROM jobs WHERE tenant_id = $1 ORDER BY created_at DESC")
            .bind(access.tenant.id)
            .fetch_all(&state.db)
            .await?;
    Ok(Json(rows))
}

/// POST /api/tenants/:slug/jobs
pub async fn handle_create(
    State(state): State<AppState>,
    caller: AuthenticatedUser,
    Path(slug): Path<String>,
    Json(mut input): Json<JobInput>,
) -> Result<(StatusCode, Json<Job>), AppError> {
    let access = authorize(&state, &caller, &slug, Capability::Write).await?;
    validate(&mut input)?;
    check_position(&state, access.tenant.id, &input).await?;

    let row: Job = sqlx::query_as(
        r#"
        INSERT INTO jobs
            (id, tenant_id, position_id, title, description, location, employment_type,
             salary_min, salary_max, status)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, COALESCE($10, 'draft'))
        RETURNING *
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(access.tenant.id)
    .bind(input.position_id)
    .bind(&input.title)
    .bind(&input.description)
    .bind(&input.location)
    .bind(&input.employment_type)
    .bind(input.salary_min)
    .bind(input.salary_max)
    .bind(&input.status)
    .fetch_one(&state.db)
    .await?;

    Ok((StatusCode::CREATED, Json(row)))
}

/// GET /api/tenants/:slug/jobs/:id
pub async fn handle_get(
    State(state): State<AppState>,
    caller: AuthenticatedUser,
    Path((slug, id)): Path<(String, Uuid)>,
) -> Result<Json<Job>, AppError> {
    let access = authorize(&state, &caller, &slug, Capability::Read).await?;
    let row: Option<Job> = sqlx::query_as("SELECT * FROM jobs WHERE id = $1 AND tenant_id = $2")
        .bind(id)
        .bind(access.tenant.id)
        .fetch_optional(&state.db)
        .await?;
    row.map(Json)
        .ok_or_else(|| AppError::NotFound(format!("Job {id} not found")))
}

/// PUT /api/tenants/:slug/jobs/:id
pub async fn handle_update(
    State(state): State<AppState>,
    caller: AuthenticatedUser,
    Path((slug, id)): Path<(String, Uuid)>,
    Json(mut input): Json<JobInput>,
) -> Result<Json<Job>, AppError> {
    let access = authorize(&state, &caller, &slug, Capability::Write).await?;
    validate(&mut input)?;
    check_position(&state, access.tenant.id, &input).await?;

    let row: Option<Job> = sqlx::query_as(
        r#"
        UPDATE jobs
        SET position_id = $3, title = $4, description = $5, location = $6,
            employment_type = $7, salary_min = $8, salary_max = $9,
            status = COALESCE($10, status), updated_at = NOW()
        WHERE id = $1 AND tenant_id = $2
        RETURNING *
        "#,
    )
    .bind(id)
    .bind(access.tenant.id)
    .bind(input.position_id)
    .bind(&input.title)
    .bind(&input.description)
    .bind(&input.location)
    .bind(&input.employment_type)
    .bind(input.salary_min)
    .bind(input.salary_max)
    .bind(&input.status)
    .fetch_optional(&state.db)
    .await?;

    row.map(Json)
        .ok_or_else(|| AppError::NotFound(format!("Job {id} not found")))
}

/// DELETE /api/tenants/:slug/jobs/:id
pub async fn handle_delete(
    State(state): State<AppState>,
    caller: AuthenticatedUser,
    Path((slug, id)): Path<(String, Uuid)>,
) -> Result<StatusCode, AppError> {
    let access = authorize(&state, &caller, &slug, Capability::Delete).await?;
    let result = sqlx::query("DELETE FROM jobs WHERE id = $1 AND tenant_id = $2")
        .bind(id)
        .bind(access.tenant.id)
        .execute(&state.db)
        .await?;

    if result.rows_affected() == 0 {
        return Err(AppError::NotFound(format!("Job {id} not found")));
    }
    Ok(StatusCode::NO_CONTENT)
}
