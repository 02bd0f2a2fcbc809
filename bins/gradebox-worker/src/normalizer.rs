/// Result Normalizer - turns harness stdout into a GradingVerdict
///
/// **Expected harness output:**
/// a single JSON object `{"score": n, "total": n, "output": "...", "errors": [...]}`
///
/// **Properties:**
/// - Never fails: empty or malformed output degrades to a zero verdict
///   whose errors explain what went wrong and carry the harness stderr
/// - Deterministic: the same (stdout, stderr) always yields the same verdict
/// - `score > total` is accepted as reported
use gradebox_common::types::GradingVerdict;
use serde_json::{Map, Value};

pub const NO_OUTPUT_ERROR: &str = "Test runner produced no output";
pub const HARNESS_TIMEOUT_ERROR: &str = "Timed out while running tests.";

/// Verdict used when the harness phase hit its timeout
pub fn timed_out() -> GradingVerdict {
    GradingVerdict::zero("", vec![HARNESS_TIMEOUT_ERROR.to_string()])
}

pub fn normalize(stdout: &str, stderr: &str) -> GradingVerdict {
    let stdout = stdout.trim();
    let stderr = stderr.trim();

    if stdout.is_empty() {
        return GradingVerdict::zero("", vec![NO_OUTPUT_ERROR.to_string(), stderr.to_string()]);
    }

    match parse(stdout) {
        Ok(verdict) => verdict,
        Err(reason) => GradingVerdict::zero(
            stdout,
            vec![format!("Failed to parse test JSON: {}", reason), stderr.to_string()],
        ),
    }
}

fn parse(stdout: &str) -> Result<GradingVerdict, String> {
    let value: Value = serde_json::from_str(stdout).map_err(|e| e.to_string())?;
    let fields = match value {
        Value::Object(fields) => fields,
        other => return Err(format!("expected a JSON object, got {}", kind(&other))),
    };

    let score = number_field(&fields, "score")?;
    let total = number_field(&fields, "total")?.max(0.0);

    let output = match fields.get("output") {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.trim().to_string(),
        Some(other) => other.to_string().trim().to_string(),
    };

    let errors = match fields.get("errors") {
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| match item {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect(),
        _ => Vec::new(),
    };

    Ok(GradingVerdict {
        score,
        total,
        output,
        errors,
    })
}

/// Numbers and numeric strings are accepted; absent or null reads as 0
fn number_field(fields: &Map<String, Value>, name: &str) -> Result<f64, String> {
    match fields.get(name) {
        None | Some(Value::Null) => Ok(0.0),
        Some(Value::Number(n)) => n
            .as_f64()
            .ok_or_else(|| format!("'{}' is not representable as a number", name)),
        Some(Value::String(s)) => s
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
            .ok_or_else(|| format!("'{}' is not a number: {:?}", name, s)),
        Some(other) => Err(format!("'{}' must be a number, got {}", name, kind(other))),
    }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_well_formed_verdict() {
        let verdict = normalize(r#"{"score":8,"total":10,"output":"ok","errors":[]}"#, "");
        assert_eq!(verdict.score, 8.0);
        assert_eq!(verdict.total, 10.0);
        assert_eq!(verdict.output, "ok");
        assert!(verdict.errors.is_empty());
    }

    #[test]
    fn test_empty_stdout() {
        let verdict = normalize("  \n", "Traceback: boom\n");
        assert_eq!(verdict, GradingVerdict::zero(
            "",
            vec![NO_OUTPUT_ERROR.to_string(), "Traceback: boom".to_string()],
        ));
    }

    #[test]
    fn test_unparseable_stdout_keeps_raw_output() {
        let verdict = normalize("all tests passed!\n", "warning");
        assert_eq!(verdict.score, 0.0);
        assert_eq!(verdict.total, 0.0);
        assert_eq!(verdict.output, "all tests passed!");
        assert_eq!(verdict.errors.len(), 2);
        assert!(verdict.errors[0].starts_with("Failed to parse test JSON:"));
        assert_eq!(verdict.errors[1], "warning");
    }

    #[test]
    fn test_non_object_json_is_a_parse_failure() {
        let verdict = normalize("[1, 2, 3]", "");
        assert!(verdict.errors[0].contains("expected a JSON object"));
    }

    #[test]
    fn test_missing_fields_default() {
        let verdict = normalize("{}", "");
        assert_eq!(verdict, GradingVerdict::zero("", vec![]));
    }

    #[test]
    fn test_numeric_strings_and_odd_fields() {
        let verdict = normalize(
            r#"{"score":"3.5","total":"7","output":42,"errors":"not a list"}"#,
            "",
        );
        assert_eq!(verdict.score, 3.5);
        assert_eq!(verdict.total, 7.0);
        assert_eq!(verdict.output, "42");
        assert!(verdict.errors.is_empty());
    }

    #[test]
    fn test_non_numeric_score_is_a_parse_failure() {
        let verdict = normalize(r#"{"score":"lots","total":10}"#, "");
        assert_eq!(verdict.total, 0.0);
        assert!(verdict.errors[0].contains("'score' is not a number"));
    }

    #[test]
    fn test_score_above_total_is_kept() {
        let verdict = normalize(r#"{"score":12,"total":10}"#, "");
        assert_eq!(verdict.score, 12.0);
        assert_eq!(verdict.total, 10.0);
    }

    #[test]
    fn test_negative_total_clamps_to_zero() {
        let verdict = normalize(r#"{"score":1,"total":-5}"#, "");
        assert_eq!(verdict.total, 0.0);
    }

    #[test]
    fn test_error_items_are_stringified() {
        let verdict = normalize(r#"{"score":0,"total":1,"errors":["bad", 3, {"k":1}]}"#, "");
        assert_eq!(verdict.errors, vec!["bad", "3", r#"{"k":1}"#]);
    }

    #[test]
    fn test_normalize_is_deterministic() {
        let inputs = [
            ("", "err"),
            ("garbage", "err"),
            (r#"{"score":1,"total":2,"output":" x ","errors":["e"]}"#, ""),
        ];
        for (stdout, stderr) in inputs {
            assert_eq!(normalize(stdout, stderr), normalize(stdout, stderr));
        }
    }
}
