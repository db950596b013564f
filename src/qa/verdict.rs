//! Parsing of QA-agent responses into tier verdicts.

use serde::Deserialize;

use crate::models::qa::{FailureCategory, TierVerdict};
use crate::qa::structural::extract_json;

#[derive(Deserialize)]
struct AgentVerdict {
    pass: bool,
    #[serde(default)]
    issues: Vec<String>,
    #[serde(default)]
    confidence: Option<f64>,
}

fn category_for(issue: &str) -> FailureCategory {
    match issue {
        "prohibited_phrase" => FailureCategory::ProhibitedPhrase,
        "meta_descriptive" => FailureCategory::MetaDescriptive,
        "tone_violation" | "tone" => FailureCategory::ToneViolation,
        "low_confidence" => FailureCategory::LowConfidence,
        _ => FailureCategory::ToneViolation,
    }
}

/// Interpret an agent response. A response that cannot be parsed counts
/// as a failing attempt with the `agent_error` category rather than a
/// silent pass. When `confidence_threshold` is given (tier 3), a passing
/// verdict below the threshold is demoted to a low-confidence failure.
pub fn parse_agent_verdict(response: &str, confidence_threshold: Option<f64>) -> TierVerdict {
    let parsed = extract_json(response)
        .and_then(|value| serde_json::from_value::<AgentVerdict>(value).ok());
    let Some(verdict) = parsed else {
        return TierVerdict::fail(
            vec![FailureCategory::AgentError],
            vec![format!(
                "agent response was not a verdict: {}",
                response.chars().take(120).collect::<String>()
            )],
        );
    };

    let confidence = verdict.confidence.unwrap_or(if verdict.pass { 1.0 } else { 0.0 });
    if let Some(threshold) = confidence_threshold {
        if verdict.pass && confidence < threshold {
            return TierVerdict {
                passed: false,
                confidence,
                categories: vec![FailureCategory::LowConfidence],
                notes: vec![format!("confidence {confidence:.2} below {threshold:.2}")],
            };
        }
    }

    if verdict.pass {
        TierVerdict::pass(confidence)
    } else {
        let mut categories: Vec<FailureCategory> =
            verdict.issues.iter().map(|i| category_for(i)).collect();
        categories.dedup();
        if categories.is_empty() {
            categories.push(FailureCategory::ToneViolation);
        }
        TierVerdict {
            passed: false,
            confidence,
            categories,
            notes: verdict.issues,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passing_verdict_is_parsed() {
        let verdict = parse_agent_verdict(r#"{"pass": true, "confidence": 0.93}"#, None);
        assert!(verdict.passed);
        assert!((verdict.confidence - 0.93).abs() < 1e-9);
    }

    #[test]
    fn failing_verdict_maps_issue_categories() {
        let verdict = parse_agent_verdict(
            r#"{"pass": false, "issues": ["meta_descriptive", "tone_violation"]}"#,
            None,
        );
        assert!(!verdict.passed);
        assert_eq!(
            verdict.categories,
            vec![
                FailureCategory::MetaDescriptive,
                FailureCategory::ToneViolation
            ]
        );
    }

    #[test]
    fn low_confidence_pass_fails_under_threshold() {
        let verdict =
            parse_agent_verdict(r#"{"pass": true, "confidence": 0.6}"#, Some(0.8));
        assert!(!verdict.passed);
        assert_eq!(verdict.categories, vec![FailureCategory::LowConfidence]);
        assert!((verdict.confidence - 0.6).abs() < 1e-9);
    }

    #[test]
    fn confident_pass_clears_threshold() {
        let verdict =
            parse_agent_verdict(r#"{"pass": true, "confidence": 0.85}"#, Some(0.8));
        assert!(verdict.passed);
    }

    #[test]
    fn garbage_response_is_an_agent_error() {
        let verdict = parse_agent_verdict("I think it looks fine!", None);
        assert!(!verdict.passed);
        assert_eq!(verdict.categories, vec![FailureCategory::AgentError]);
    }
}
