//! Cargo check/test wrapper with JSON output parsing.
//!
//! Runs cargo commands and captures structured output so the Testing stage
//! can extract pass/fail and the Fixer can work from structured diagnostics
//! instead of raw stderr.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::process::Command;

pub struct Compiler {
    working_dir: std::path::PathBuf,
}

impl Compiler {
    pub fn new(working_dir: impl AsRef<Path>) -> Self {
        Self {
            working_dir: working_dir.as_ref().to_path_buf(),
        }
    }

    pub fn check(&self) -> CompileResult {
        self.run_cargo(&["check", "--message-format=json"])
    }

    pub fn build(&self) -> CompileResult {
        self.run_cargo(&["build", "--message-format=json"])
    }

    pub fn test(&self) -> CompileResult {
        self.run_cargo(&["test", "--message-format=json"])
    }

    fn run_cargo(&self, args: &[&str]) -> CompileResult {
        let output = Command::new("cargo")
            .args(args)
            .current_dir(&self.working_dir)
            .output();

        match output {
            Ok(output) => {
                let stdout = String::from_utf8_lossy(&output.stdout).to_string();
                let stderr = String::from_utf8_lossy(&output.stderr).to_string();
                let messages = self.parse_json_messages(&stdout);

                CompileResult {
                    success: output.status.success(),
                    exit_code: output.status.code(),
                    messages,
                    raw_stdout: stdout,
                    raw_stderr: stderr,
                }
            }
            Err(e) => CompileResult {
                success: false,
                exit_code: None,
                messages: vec![],
                raw_stdout: String::new(),
                raw_stderr: format!("failed to run cargo: {e}"),
            },
        }
    }

    fn parse_json_messages(&self, output: &str) -> Vec<CargoMessage> {
        output
            .lines()
            .filter_map(|line| serde_json::from_str::<CargoMessage>(line).ok())
            .collect()
    }
}

/// Result of a cargo invocation.
#[derive(Debug, Clone)]
pub struct CompileResult {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub messages: Vec<CargoMessage>,
    pub raw_stdout: String,
    pub raw_stderr: String,
}

impl CompileResult {
    pub fn errors(&self) -> Vec<&CargoMessage> {
        self.messages.iter().filter(|m| m.is_error()).collect()
    }

    pub fn error_count(&self) -> usize {
        self.messages.iter().filter(|m| m.is_error()).count()
    }

    /// Formats errors for the Fixer agent's input.
    pub fn format_for_fixer(&self) -> String {
        let errors: Vec<String> = self
            .errors()
            .iter()
            .filter_map(|m| m.format_diagnostic())
            .collect();

        if errors.is_empty() {
            if self.success {
                "tests passed, no errors".to_string()
            } else {
                format!("build failed with no structured diagnostics:\n{}", self.raw_stderr)
            }
        } else {
            format!(
                "{} error(s):\n\n{}",
                errors.len(),
                errors.join("\n\n---\n\n")
            )
        }
    }
}

/// Cargo's `--message-format=json` line shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "reason")]
#[allow(clippy::large_enum_variant)]
pub enum CargoMessage {
    #[serde(rename = "compiler-message")]
    CompilerMessage {
        message: DiagnosticMessage,
        target: Option<Target>,
    },
    #[serde(rename = "compiler-artifact")]
    CompilerArtifact { target: Target },
    #[serde(rename = "build-script-executed")]
    BuildScriptExecuted { package_id: String },
    #[serde(rename = "build-finished")]
    BuildFinished { success: bool },
    #[serde(other)]
    Other,
}

impl CargoMessage {
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            CargoMessage::CompilerMessage { message, .. } if message.level == "error"
        )
    }

    pub fn as_diagnostic(&self) -> Option<&DiagnosticMessage> {
        match self {
            CargoMessage::CompilerMessage { message, .. } => Some(message),
            _ => None,
        }
    }

    pub fn format_diagnostic(&self) -> Option<String> {
        self.as_diagnostic().map(DiagnosticMessage::format)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosticMessage {
    pub message: String,
    pub code: Option<ErrorCode>,
    pub level: String,
    #[serde(default)]
    pub spans: Vec<Span>,
    #[serde(default)]
    pub children: Vec<DiagnosticMessage>,
    pub rendered: Option<String>,
}

impl DiagnosticMessage {
    pub fn format(&self) -> String {
        if let Some(rendered) = &self.rendered {
            return rendered.clone();
        }

        let mut result = format!("[{}]", self.level.to_uppercase());
        if let Some(code) = &self.code {
            result.push_str(&format!(" {}", code.code));
        }
        result.push_str(&format!(": {}", self.message));

        if let Some(span) = self.spans.iter().find(|s| s.is_primary) {
            result.push_str(&format!(
                "\n  --> {}:{}:{}",
                span.file_name, span.line_start, span.column_start
            ));
            if let Some(text) = span.text.first() {
                result.push_str(&format!("\n  |\n  | {}", text.text));
            }
        }

        for child in &self.children {
            if child.level == "help" || child.level == "suggestion" {
                result.push_str(&format!("\n  = {}: {}", child.level, child.message));
            }
        }

        result
    }

    pub fn error_code(&self) -> Option<&str> {
        self.code.as_ref().map(|c| c.code.as_str())
    }

    pub fn primary_span(&self) -> Option<&Span> {
        self.spans.iter().find(|s| s.is_primary)
    }

    pub fn suggested_replacement(&self) -> Option<&str> {
        for span in &self.spans {
            if let Some(replacement) = &span.suggested_replacement {
                return Some(replacement);
            }
        }
        for child in &self.children {
            if let Some(replacement) = child.suggested_replacement() {
                return Some(replacement);
            }
        }
        None
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorCode {
    pub code: String,
    pub explanation: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Span {
    pub file_name: String,
    pub byte_start: usize,
    pub byte_end: usize,
    pub line_start: usize,
    pub line_end: usize,
    pub column_start: usize,
    pub column_end: usize,
    #[serde(default)]
    pub is_primary: bool,
    #[serde(default)]
    pub text: Vec<SpanText>,
    pub label: Option<String>,
    pub suggested_replacement: Option<String>,
    pub suggestion_applicability: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpanText {
    pub text: String,
    pub highlight_start: usize,
    pub highlight_end: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Target {
    pub name: String,
    #[serde(default)]
    pub kind: Vec<String>,
    pub src_path: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_compiler_message() {
        let json = r#"{
            "reason": "compiler-message",
            "message": {
                "message": "mismatched types",
                "code": {"code": "E0308", "explanation": null},
                "level": "error",
                "spans": [{
                    "file_name": "src/main.rs",
                    "byte_start": 100,
                    "byte_end": 110,
                    "line_start": 5,
                    "line_end": 5,
                    "column_start": 10,
                    "column_end": 20,
                    "is_primary": true,
                    "text": [{"text": "let x: i32 = \"hello\";", "highlight_start": 10, "highlight_end": 17}],
                    "label": "expected `i32`, found `&str`",
                    "suggested_replacement": null,
                    "suggestion_applicability": null
                }],
                "children": [],
                "rendered": "error[E0308]: mismatched types\n --> src/main.rs:5:10"
            },
            "target": {"name": "test", "kind": ["lib"], "src_path": "src/lib.rs"}
        }"#;

        let msg: CargoMessage = serde_json::from_str(json).unwrap();
        assert!(msg.is_error());
        let diag = msg.as_diagnostic().unwrap();
        assert_eq!(diag.error_code(), Some("E0308"));
    }

    #[test]
    fn compile_result_format_reports_success() {
        let result = CompileResult {
            success: true,
            exit_code: Some(0),
            messages: vec![],
            raw_stdout: String::new(),
            raw_stderr: String::new(),
        };
        assert!(result.format_for_fixer().contains("passed"));
    }
}
