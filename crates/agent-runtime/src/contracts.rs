//! Typed Agent Output contracts and their
//! fail-closed JSON parsers.
//!
//! Every agent (planner, coder, fixer, reviewer) returns JSON, possibly
//! wrapped in prose or a fenced code block. The Orchestrator must parse
//! that text into one of these structs before making routing decisions;
//! a response that fails to parse or violates its minimum contract is
//! rejected (fail-closed) via [`SchemaError`], which the caller treats as
//! schema-invalid: one immediate re-prompt, then model-fatal on a
//! second consecutive failure.

use coordination::{Complexity, Effort, Verdict};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    #[error("no JSON object found in response")]
    NoJsonBlock,
    #[error("response did not match the expected schema: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("schema-valid but contract violation: {0}")]
    Invalid(String),
}

/// Planner output: `{definitionOfDone[], planSteps[], targetFiles[], estimatedComplexity, estimatedEffort}`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PlannerOutput {
    pub definition_of_done: Vec<String>,
    pub plan_steps: Vec<String>,
    pub target_files: Vec<String>,
    pub estimated_complexity: Complexity,
    pub estimated_effort: Effort,
}

/// Coder output: `{diff, commitMessage, filesModified[]}`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CoderOutput {
    pub diff: String,
    pub commit_message: String,
    pub files_modified: Vec<String>,
}

/// Fixer output: `{diff, commitMessage, filesModified[], fixDescription}`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FixerOutput {
    pub diff: String,
    pub commit_message: String,
    pub files_modified: Vec<String>,
    pub fix_description: String,
}

/// Reviewer output: `{verdict, comments[]}`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ReviewerOutput {
    pub verdict: Verdict,
    pub comments: Vec<String>,
}

impl ReviewerOutput {
    pub fn approved(&self) -> bool {
        matches!(self.verdict, Verdict::Approve)
    }
}

/// Parse a planner response. Rejects an empty `plan_steps` or `target_files`
/// list — Breakdown and the Coder stage both require at least one of each.
pub fn parse_planner_output(raw: &str) -> Result<PlannerOutput, SchemaError> {
    let json_str = extract_json_block(raw).ok_or(SchemaError::NoJsonBlock)?;
    let output: PlannerOutput = serde_json::from_str(json_str)?;
    if output.plan_steps.is_empty() {
        return Err(SchemaError::Invalid("plan has no steps".into()));
    }
    if output.target_files.is_empty() {
        return Err(SchemaError::Invalid("plan has no target files".into()));
    }
    Ok(output)
}

/// Parse a coder response. Rejects an empty diff.
pub fn parse_coder_output(raw: &str) -> Result<CoderOutput, SchemaError> {
    let json_str = extract_json_block(raw).ok_or(SchemaError::NoJsonBlock)?;
    let output: CoderOutput = serde_json::from_str(json_str)?;
    if output.diff.trim().is_empty() {
        return Err(SchemaError::Invalid("empty diff".into()));
    }
    Ok(output)
}

/// Parse a fixer response. Rejects an empty diff.
pub fn parse_fixer_output(raw: &str) -> Result<FixerOutput, SchemaError> {
    let json_str = extract_json_block(raw).ok_or(SchemaError::NoJsonBlock)?;
    let output: FixerOutput = serde_json::from_str(json_str)?;
    if output.diff.trim().is_empty() {
        return Err(SchemaError::Invalid("empty diff".into()));
    }
    Ok(output)
}

/// Parse a reviewer response. `request_changes`/`needs_discussion` without
/// any comments is rejected — the caller needs *something* actionable to
/// feed back to the Fixer.
pub fn parse_reviewer_output(raw: &str) -> Result<ReviewerOutput, SchemaError> {
    let json_str = extract_json_block(raw).ok_or(SchemaError::NoJsonBlock)?;
    let output: ReviewerOutput = serde_json::from_str(json_str)?;
    if !output.approved() && output.comments.is_empty() {
        return Err(SchemaError::Invalid(
            "non-approving verdict without comments".into(),
        ));
    }
    Ok(output)
}

/// Extracts a JSON object from a response that may contain surrounding
/// prose — a ```json fenced block takes priority, otherwise the first `{`
/// to the last `}`.
fn extract_json_block(text: &str) -> Option<&str> {
    if let Some(start) = text.find("```json") {
        let json_start = start + 7;
        if let Some(end) = text[json_start..].find("```") {
            return Some(text[json_start..json_start + end].trim());
        }
    }
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_planner_output() {
        let raw = r#"{
            "definitionOfDone": ["exports sum", "sum(2,3)=5"],
            "planSteps": ["add sum() to src/math.ts"],
            "targetFiles": ["src/math.ts"],
            "estimatedComplexity": "xs",
            "estimatedEffort": "low"
        }"#;
        let out = parse_planner_output(raw).unwrap();
        assert_eq!(out.target_files, vec!["src/math.ts"]);
        assert_eq!(out.estimated_complexity, Complexity::Xs);
    }

    #[test]
    fn rejects_planner_output_with_no_steps() {
        let raw = r#"{
            "definitionOfDone": [],
            "planSteps": [],
            "targetFiles": ["src/math.ts"],
            "estimatedComplexity": "xs",
            "estimatedEffort": "low"
        }"#;
        assert!(matches!(
            parse_planner_output(raw),
            Err(SchemaError::Invalid(_))
        ));
    }

    #[test]
    fn parses_planner_output_from_fenced_block() {
        let raw = "Here is the plan:\n```json\n{\"definitionOfDone\":[\"d\"],\"planSteps\":[\"s\"],\"targetFiles\":[\"a.rs\"],\"estimatedComplexity\":\"s\",\"estimatedEffort\":\"medium\"}\n```\nDone.";
        let out = parse_planner_output(raw).unwrap();
        assert_eq!(out.estimated_complexity, Complexity::S);
    }

    #[test]
    fn rejects_malformed_planner_json() {
        assert!(matches!(
            parse_planner_output("not json at all"),
            Err(SchemaError::NoJsonBlock)
        ));
    }

    #[test]
    fn parses_coder_output() {
        let raw = r#"{"diff": "--- a/f\n+++ b/f\n", "commitMessage": "fix", "filesModified": ["f"]}"#;
        let out = parse_coder_output(raw).unwrap();
        assert_eq!(out.files_modified, vec!["f"]);
    }

    #[test]
    fn rejects_coder_output_with_empty_diff() {
        let raw = r#"{"diff": "", "commitMessage": "fix", "filesModified": []}"#;
        assert!(matches!(
            parse_coder_output(raw),
            Err(SchemaError::Invalid(_))
        ));
    }

    #[test]
    fn parses_fixer_output() {
        let raw = r#"{"diff": "diff", "commitMessage": "fix", "filesModified": ["f"], "fixDescription": "added clone()"}"#;
        let out = parse_fixer_output(raw).unwrap();
        assert_eq!(out.fix_description, "added clone()");
    }

    #[test]
    fn parses_reviewer_approve() {
        let raw = r#"{"verdict": "approve", "comments": []}"#;
        let out = parse_reviewer_output(raw).unwrap();
        assert!(out.approved());
    }

    #[test]
    fn parses_reviewer_request_changes_with_comments() {
        let raw = r#"{"verdict": "request_changes", "comments": ["missing error handling"]}"#;
        let out = parse_reviewer_output(raw).unwrap();
        assert!(!out.approved());
    }

    #[test]
    fn rejects_reviewer_request_changes_without_comments() {
        let raw = r#"{"verdict": "request_changes", "comments": []}"#;
        assert!(matches!(
            parse_reviewer_output(raw),
            Err(SchemaError::Invalid(_))
        ));
    }

    #[test]
    fn extract_json_block_prefers_fenced() {
        let text = "prefix ```json\n{\"a\":1}\n``` suffix {\"b\":2}";
        assert_eq!(extract_json_block(text), Some("{\"a\":1}"));
    }
}
