//! Candidate matching: a deterministic score from the configured `MatchScorer`, enriched
//! with an LLM narrative when the model is reachable.

pub mod handlers;
pub mod prompts;
pub mod scoring;

use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::llm_client::LlmClient;
use crate::models::recruiting::{Candidate, Position};
use scoring::MatchReport;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchAnalysis {
    pub summary: String,
    #[serde(default)]
    pub strengths: Vec<String>,
    #[serde(default)]
    pub concerns: Vec<String>,
    #[serde(default)]
    pub interview_questions: Vec<String>,
    pub suggested_score: Option<u32>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchResult {
    pub candidate_id: Uuid,
    pub position_id: Uuid,
    pub report: MatchReport,
    /// `None` when the LLM call failed; the keyword report still stands.
    pub ai_analysis: Option<MatchAnalysis>,
}

/// Asks the LLM for a narrative assessment. Failures are logged and yield `None`.
pub async fn analyze(
    llm: &LlmClient,
    candidate: &Candidate,
    position: &Position,
    report: &MatchReport,
) -> Option<MatchAnalysis> {
    let prompt = prompts::build_match_prompt(candidate, position, report);
    match llm
        .call_json::<MatchAnalysis>(&prompt, prompts::MATCH_ANALYSIS_SYSTEM)
        .await
    {
        Ok(mut analysis) => {
            analysis.suggested_score = analysis.suggested_score.map(|s| s.min(100));
            Some(analysis)
        }
        Err(e) => {
            warn!(
                candidate_id = %candidate.id,
                position_id = %position.id,
                "Match analysis unavailable: {e}"
            );
            None
        }
    }
}
