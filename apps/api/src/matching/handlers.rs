use axum::{
    extract::{Path, State},
    Json,
};
use serde::Deserialize;
use tracing::info;
use uuid::Uuid;

use crate::errors::AppError;
use crate::matching::{analyze, MatchResult};
use crate::recruiting::{candidates, positions};
use crate::state::AppState;
use crate::tenancy::{authorize, AuthenticatedUser, Capability};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchRequest {
    pub candidate_id: Uuid,
    pub position_id: Uuid,
}

/// POST /api/tenants/:slug/matching
///
/// Both records must belong to the caller's tenant.
pub async fn handle_match(
    State(state): State<AppState>,
    caller: AuthenticatedUser,
    Path(slug): Path<String>,
    Json(req): Json<MatchRequest>,
) -> Result<Json<MatchResult>, AppError> {
    let access = authorize(&state, &caller, &slug, Capability::Read).await?;
    let tenant_id = access.tenant.id;

    let candidate = candidates::find(&state, tenant_id, req.candidate_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Candidate {} not found", req.candidate_id)))?;
    let position = positions::find(&state, tenant_id, req.position_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Position {} not found", req.position_id)))?;

    let report = state.scorer.score(&candidate, &position).await?;
    let ai_analysis = analyze(&state.llm, &candidate, &position, &report).await;

    info!(
        tenant = %slug,
        candidate_id = %candidate.id,
        position_id = %position.id,
        score = report.overall_score,
        ai = ai_analysis.is_some(),
        "Match computed"
    );

    Ok(Json(MatchResult {
        candidate_id: candidate.id,
        position_id: position.id,
        report,
        ai_analysis,
    }))
}
