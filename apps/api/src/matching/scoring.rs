//! Candidate ↔ position scoring behind a swappable trait.
//!
//! `AppState` holds an `Arc<dyn MatchScorer>`; the default `KeywordMatchScorer` is pure,
//! deterministic and needs no network.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::AppError;
use crate::models::recruiting::{Candidate, Position};

const EXACT_SKILL: f32 = 1.0;
const RESUME_MENTION: f32 = 0.6;
const STRONG_THRESHOLD: f32 = 0.8;
const PARTIAL_THRESHOLD: f32 = 0.4;
const SKILL_WEIGHT: f32 = 0.7;
const EXPERIENCE_WEIGHT: f32 = 0.3;
/// Experience factor when the position asks for years but the candidate gave none.
const UNKNOWN_EXPERIENCE: f32 = 0.5;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SkillMatch {
    pub skill: String,
    /// Where the evidence was found: "skills" or "resume".
    pub evidence: String,
    pub strength: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchReport {
    pub overall_score: u32,
    pub skill_score: Option<u32>,
    pub experience_score: u32,
    pub strong_matches: Vec<SkillMatch>,
    pub partial_matches: Vec<SkillMatch>,
    pub gaps: Vec<String>,
    pub recommendation: String,
    pub scorer_backend: String,
}

#[async_trait]
pub trait MatchScorer: Send + Sync {
    async fn score(&self, candidate: &Candidate, position: &Position) -> Result<MatchReport, AppError>;
}

/// Keyword scorer:
/// 1. each required skill listed by the candidate → 1.0, mentioned in the resume → 0.6
/// 2. experience factor = years / required years, capped at 1.0
/// 3. overall = 70 % skills + 30 % experience (experience only when no skills are required)
pub struct KeywordMatchScorer;

#[async_trait]
impl MatchScorer for KeywordMatchScorer {
    async fn score(&self, candidate: &Candidate, position: &Position) -> Result<MatchReport, AppError> {
        Ok(compute_keyword_match(candidate, position))
    }
}

fn compute_keyword_match(candidate: &Candidate, position: &Position) -> MatchReport {
    let skills: Vec<String> = candidate.skills.iter().map(|s| s.to_lowercase()).collect();
    let resume = candidate
        .resume_text
        .as_deref()
        .map(str::to_lowercase)
        .unwrap_or_default();

    let mut strong_matches = Vec::new();
    let mut partial_matches = Vec::new();
    let mut gaps = Vec::new();
    let mut total = 0.0_f32;

    for required in &position.required_skills {
        let needle = required.trim().to_lowercase();
        if needle.is_empty() {
            continue;
        }

        let (strength, evidence) = if skills.iter().any(|s| *s == needle) {
            (EXACT_SKILL, "skills")
        } else if !resume.is_empty() && resume.contains(&needle) {
            (RESUME_MENTION, "resume")
        } else {
            (0.0, "")
        };
        total += strength;

        let m = SkillMatch {
            skill: required.clone(),
            evidence: evidence.to_string(),
            strength,
        };
        if strength >= STRONG_THRESHOLD {
            strong_matches.push(m);
        } else if strength >= PARTIAL_THRESHOLD {
            partial_matches.push(m);
        } else {
            gaps.push(required.clone());
        }
    }

    let considered = strong_matches.len() + partial_matches.len() + gaps.len();
    let skill_factor = (considered > 0).then(|| total / considered as f32);
    let experience_factor = experience_factor(candidate.experience_years, position.min_experience_years);

    let overall = match skill_factor {
        Some(skill) => skill * SKILL_WEIGHT + experience_factor * EXPERIENCE_WEIGHT,
        None => experience_factor,
    };
    let overall_score = to_percent(overall);

    MatchReport {
        overall_score,
        skill_score: skill_factor.map(to_percent),
        experience_score: to_percent(experience_factor),
        recommendation: build_recommendation(overall_score, &gaps),
        strong_matches,
        partial_matches,
        gaps,
        scorer_backend: "keyword".to_string(),
    }
}

fn experience_factor(years: Option<i32>, required: Option<i32>) -> f32 {
    match (years, required) {
        (_, None) => 1.0,
        (_, Some(req)) if req <= 0 => 1.0,
        (None, Some(_)) => UNKNOWN_EXPERIENCE,
        (Some(have), Some(req)) => (have.max(0) as f32 / req as f32).min(1.0),
    }
}

fn to_percent(factor: f32) -> u32 {
    (factor.clamp(0.0, 1.0) * 100.0).round() as u32
}

fn build_recommendation(score: u32, gaps: &[String]) -> String {
    let top_gaps: Vec<&str> = gaps.iter().take(3).map(String::as_str).collect();

    if score >= 80 {
        "Strong match. The candidate covers the key requirements.".to_string()
    } else if top_gaps.is_empty() {
        format!("Partial match ({score}/100). Requirements are covered but experience is short.")
    } else if score >= 60 {
        format!(
            "Moderate match ({score}/100). Probe during interview: {}.",
            top_gaps.join(", ")
        )
    } else {
        format!(
            "Weak match ({score}/100). Missing: {}.",
            top_gaps.join(", ")
        )
    }
}
