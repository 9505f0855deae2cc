use crate::matching::scoring::MatchReport;
use crate::models::recruiting::{Candidate, Position};

/// Resume text beyond this many characters is cut before prompting.
const MAX_RESUME_CHARS: usize = 6000;

pub const MATCH_ANALYSIS_SYSTEM: &str = "You are an experienced technical recruiter. \
    You assess how well a candidate fits an open position using only the facts provided. \
    Do NOT invent employers, degrees, or skills that are not in the input. \
    You MUST respond with valid JSON only.";

const MATCH_ANALYSIS_TEMPLATE: &str = r#"Assess the candidate below for the position below.

A keyword screen has already been run; use it as a starting point, not as the verdict.

POSITION
Title: {title}
Department: {department}
Required skills: {required_skills}
Minimum experience (years): {min_years}
Description:
{description}

CANDIDATE
Name: {name}
Listed skills: {skills}
Experience (years): {years}
Resume:
{resume}

KEYWORD SCREEN
Score: {score}/100
Matched: {matched}
Missing: {missing}

Return a JSON object with this EXACT schema:
{
  "summary": "two or three sentences",
  "strengths": ["..."],
  "concerns": ["..."],
  "interviewQuestions": ["..."],
  "suggestedScore": 0
}
suggestedScore is your own 0-100 estimate."#;

fn or_none(value: Option<&str>) -> &str {
    value.map(str::trim).filter(|v| !v.is_empty()).unwrap_or("(none)")
}

fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

pub fn build_match_prompt(candidate: &Candidate, position: &Position, report: &MatchReport) -> String {
    let matched = report
        .strong_matches
        .iter()
        .chain(&report.partial_matches)
        .map(|m| m.skill.as_str())
        .collect::<Vec<_>>()
        .join(", ");
    let missing = report.gaps.join(", ");
    let resume = candidate
        .resume_text
        .as_deref()
        .map(|r| truncate_chars(r, MAX_RESUME_CHARS));

    MATCH_ANALYSIS_TEMPLATE
        .replace("{title}", &position.title)
        .replace("{department}", or_none(position.department.as_deref()))
        .replace("{required_skills}", &position.required_skills.join(", "))
        .replace(
            "{min_years}",
            &position
                .min_experience_years
                .map_or_else(|| "not specified".to_string(), |y| y.to_string()),
        )
        .replace("{description}", or_none(position.description.as_deref()))
        .replace(
            "{name}",
            &format!("{} {}", candidate.first_name, candidate.last_name),
        )
        .replace("{skills}", &candidate.skills.join(", "))
        .replace(
            "{years}",
            &candidate
                .experience_years
                .map_or_else(|| "unknown".to_string(), |y| y.to_string()),
        )
        .replace("{resume}", or_none(resume))
        .replace("{score}", &report.overall_score.to_string())
        .replace("{matched}", or_none(Some(matched.as_str())))
        .replace("{missing}", or_none(Some(missing.as_str())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("abc", 10), "abc");
    }

    #[test]
    fn test_or_none_handles_blank() {
        assert_eq!(or_none(Some("  ")), "(none)");
        assert_eq!(or_none(None), "(none)");
        assert_eq!(or_none(Some("Platform")), "Platform");
    }
}
