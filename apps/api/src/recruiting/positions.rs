use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use uuid::Uuid;

use crate::errors::AppError;
use crate::models::recruiting::{Position, PositionInput};
use crate::recruiting::{clean_optional, normalize_skills, require_text, validate_status};
use crate::state::AppState;
use crate::tenancy::{authorize, AuthenticatedUser, Capability};

const STATUSES: &[&str] = &["open", "on_hold", "closed"];

fn validate(input: &mut PositionInput) -> Result<(), AppError> {
    input.title = require_text("title", &input.title)?;
    input.department = clean_optional(input.department.take());
    input.required_skills = normalize_skills(&input.required_skills);
    if matches!(input.min_experience_years, Some(y) if y < 0) {
        return Err(AppError::Validation(
            "minExperienceYears must not be negative".to_string(),
        ));
    }
    validate_status(input.status.as_deref(), STATUSES)
}

/// GET /api/tenants/:slug/positions
pub async fn handle_list(
    State(state): State<AppState>,
    caller: AuthenticatedUser,
    Path(slug): Path<String>,
) -> Result<Json<Vec<Position>>, AppError> {
    let access = authorize(&state, &caller, &slug, Capability::Read).await?;
    let rows: Vec<Position> = sqlx::query_as(
        "SELECT * FROM positions WHERE tenant_id = $1 ORDER BY created_at DESC",
    )
    .bind(access.tenant.id)
    .fetch_all(&state.db)
    .await?;
    Ok(Json(rows))
}

/// POST /api/tenants/:slug/positions
pub async fn handle_create(
    State(state): State<AppState>,
    caller: AuthenticatedUser,
    Path(slug): Path<String>,
    Json(mut input): Json<PositionInput>,
) -> Result<(StatusCode, Json<Position>), AppError> {
    let access = authorize(&state, &caller, &slug, Capability::Write).await?;
    validate(&mut input)?;

    let row: Position = sqlx::query_as(
        r#"
        INSERT INTO positions
            (id, tenant_id, title, department, description, required_skills,
             min_experience_years, status)
        VALUES ($1, $2, $3, $4, $5, $6, $7, COALESCE($8, 'open'))
        RETURNING *
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(access.tenant.id)
    .bind(&input.title)
    .bind(&input.department)
    .bind(&input.description)
    .bind(&input.required_skills)
    .bind(input.min_experience_years)
    .bind(&input.status)
    .fetch_one(&state.db)
    .await?;

    Ok((StatusCode::CREATED, Json(row)))
}

/// GET /api/tenants/:slug/positions/:id
pub async fn handle_get(
    State(state): State<AppState>,
    caller: AuthenticatedUser,
    Path((slug, id)): Path<(String, Uuid)>,
) -> Result<Json<Position>, AppError> {
    let access = authorize(&state, &caller, &slug, Capability::Read).await?;
    find(&state, access.tenant.id, id)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("Position {id} not found")))
}

/// PUT /api/tenants/:slug/positions/:id
pub async fn handle_update(
    State(state): State<AppState>,
    caller: AuthenticatedUser,
    Path((slug, id)): Path<(String, Uuid)>,
    Json(mut input): Json<PositionInput>,
) -> Result<Json<Position>, AppError> {
    let access = authorize(&state, &caller, &slug, Capability::Write).await?;
    validate(&mut input)?;

    let row: Option<Position> = sqlx::query_as(
        r#"
        UPDATE positions
        SET title = $3, department = $4, description = $5, required_skills = $6,
            min_experience_years = $7, status = COALESCE($8, status), updated_at = NOW()
        WHERE id = $1 AND tenant_id = $2
        RETURNING *
        "#,
    )
    .bind(id)
    .bind(access.tenant.id)
    .bind(&input.title)
    .bind(&input.department)
    .bind(&input.description)
    .bind(&input.required_skills)
    .bind(input.min_experience_years)
    .bind(&input.status)
    .fetch_optional(&state.db)
    .await?;

    row.map(Json)
        .ok_or_else(|| AppError::NotFound(format!("Position {id} not found")))
}

/// DELETE /api/tenants/:slug/positions/:id
pub async fn handle_delete(
    State(state): State<AppState>,
    caller: AuthenticatedUser,
    Path((slug, id)): Path<(String, Uuid)>,
) -> Result<StatusCode, AppError> {
    let access = authorize(&state, &caller, &slug, Capability::Delete).await?;
    let result = sqlx::query("DELETE FROM positions WHERE id = $1 AND tenant_id = $2")
        .bind(id)
        .bind(access.tenant.id)
        .execute(&state.db)
        .await?;

    if result.rows_affected() == 0 {
        return Err(AppError::NotFound(format!("Position {id} not found")));
    }
    Ok(StatusCode::NO_CONTENT)
}

pub async fn find(state: &AppState, tenant_id: Uuid, id: Uuid) -> Result<Option<Position>, AppError> {
    Ok(
        sqlx::query_as("SELECT * FROM positions WHERE id = $1 AND tenant_id = $2")
            .bind(id)
            .bind(tenant_id)
            .fetch_optional(&state.db)
            .await?,
    )
}
