use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use crate::core::domain::{AiEvaluation, UNKNOWN_COMPLEXITY};

static FENCED_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```(?:json)?\s*(.*?)\s*```").expect("valid fence regex")
});
static TRAILING_COMMA: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r",(\s*[}\]])").expect("valid trailing comma regex"));

/// Turns raw review-model output into an `AiEvaluation`. Never fails: an
/// empty or unparseable payload yields neutral scores of 8 when every test
/// passed and 5 otherwise.
pub fn parse_evaluation_response(text: &str, passed: usize, total: usize) -> AiEvaluation {
    let text = text.trim();
    if text.is_empty() {
        tracing::warn!("Evaluation response is empty, using fallback scores");
        return fallback(passed, total);
    }

    let payload = extract_json(text);
    match serde_json::from_str::<Value>(&payload) {
        Ok(Value::Object(fields)) => from_fields(&fields),
        Ok(other) => {
            tracing::warn!("Evaluation response is not an object: {}", other);
            fallback(passed, total)
        }
        Err(err) => {
            tracing::warn!("Evaluation response is not valid JSON: {}", err);
            fallback(passed, total)
        }
    }
}

fn extract_json(text: &str) -> String {
    let text = FENCED_BLOCK
        .captures(text)
        .and_then(|c| c.get(1))
        .map_or(text, |m| m.as_str());

    match (text.find('{'), text.rfind('}')) {
        (Some(start), Some(end)) if end > start => TRAILING_COMMA
            .replace_all(&text[start..=end], "$1")
            .into_owned(),
        _ => text.to_string(),
    }
}

fn from_fields(fields: &serde_json::Map<String, Value>) -> AiEvaluation {
    let number = |keys: &[&str]| {
        keys.iter()
            .filter_map(|key| fields.get(*key))
            .find_map(|value| match value {
                Value::Number(n) => n.as_f64(),
                Value::String(s) => s.trim().parse().ok(),
                _ => None,
            })
            .unwrap_or(5.0)
    };
    let label = |key: &str| {
        fields
            .get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(UNKNOWN_COMPLEXITY)
            .to_string()
    };

    AiEvaluation {
        quality: number(&["code_quality_score", "quality"]),
        clarity: number(&["logical_clarity_score", "clarity"]),
        time_complexity: label("time_complexity"),
        space_complexity: label("space_complexity"),
        suggestions: fields
            .get("suggestions")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default(),
        justification: fields
            .get("justification")
            .and_then(Value::as_str)
            .map(str::to_string),
    }
}

fn fallback(passed: usize, total: usize) -> AiEvaluation {
    let score = if total > 0 && passed == total { 8.0 } else { 5.0 };
    AiEvaluation {
        quality: score,
        clarity: score,
        time_complexity: UNKNOWN_COMPLEXITY.to_string(),
        space_complexity: UNKNOWN_COMPLEXITY.to_string(),
        suggestions: Vec::new(),
        justification: Some(
            "The evaluation could not be read. Default scores were assigned from the test results."
                .to_string(),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_json() {
        let eval = parse_evaluation_response(
            r#"{"code_quality_score": 8, "logical_clarity_score": 6.5,
                "time_complexity": "O(n)", "space_complexity": "O(1)",
                "overall_score": 7, "suggestions": ["use a set"], "justification": "ok"}"#,
            3,
            4,
        );

        assert_eq!(eval.quality, 8.0);
        assert_eq!(eval.clarity, 6.5);
        assert_eq!(eval.time_complexity, "O(n)");
        assert_eq!(eval.suggestions, vec!["use a set".to_string()]);
        assert_eq!(eval.justification.as_deref(), Some("ok"));
    }

    #[test]
    fn test_fenced_json_with_trailing_commas() {
        let text = "Here is my review:\n```json\n{\n  \"code_quality_score\": 9,\n  \"logical_clarity_score\": \"7\",\n  \"suggestions\": [\"a\", \"b\",],\n}\n```\nThanks!";
        let eval = parse_evaluation_response(text, 1, 1);

        assert_eq!(eval.quality, 9.0);
        assert_eq!(eval.clarity, 7.0);
        assert_eq!(eval.suggestions.len(), 2);
        assert_eq!(eval.time_complexity, UNKNOWN_COMPLEXITY);
        assert_eq!(eval.space_complexity, UNKNOWN_COMPLEXITY);
    }

    #[test]
    fn test_missing_scores_default_to_five() {
        let eval = parse_evaluation_response(r#"{"time_complexity": "O(n²)"}"#, 4, 4);
        assert_eq!(eval.quality, 5.0);
        assert_eq!(eval.clarity, 5.0);
        assert_eq!(eval.time_complexity, "O(n²)");
    }

    #[test]
    fn test_fallback_depends_on_test_results() {
        let all_passed = parse_evaluation_response("", 5, 5);
        assert_eq!((all_passed.quality, all_passed.clarity), (8.0, 8.0));

        let some_failed = parse_evaluation_response("I cannot review this.", 2, 5);
        assert_eq!((some_failed.quality, some_failed.clarity), (5.0, 5.0));
        assert_eq!(some_failed.time_complexity, UNKNOWN_COMPLEXITY);

        let truncated = parse_evaluation_response(r#"{"code_quality_score": 9, "sugg"#, 5, 5);
        assert_eq!(truncated.quality, 8.0);

        let nothing_ran = parse_evaluation_response("", 0, 0);
        assert_eq!((nothing_ran.quality, nothing_ran.clarity), (5.0, 5.0));
    }
}
