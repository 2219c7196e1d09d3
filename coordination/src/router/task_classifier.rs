//! Task classification and effort estimation.
//!
//! `EffortEstimator` scores a task description into a complexity/effort
//! pair; Breakdown uses it to populate `Task::estimated_complexity` and
//! `Task::estimated_effort`, which in turn select a `Position::Coder`
//! variant for the Model Router.

use crate::feedback::error_parser::{ErrorCategory, ErrorSummary, ParsedError};
use crate::state::Effort;
use serde::{Deserialize, Serialize};

/// Types of tasks that can be routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    CodeGeneration,
    ErrorFix,
    Refactor,
    Explain,
    Review,
    Architecture,
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CodeGeneration => write!(f, "code_generation"),
            Self::ErrorFix => write!(f, "error_fix"),
            Self::Refactor => write!(f, "refactor"),
            Self::Explain => write!(f, "explain"),
            Self::Review => write!(f, "review"),
            Self::Architecture => write!(f, "architecture"),
        }
    }
}

/// Task classification result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskClassification {
    pub task_type: TaskType,
    /// Complexity score (1-5).
    pub complexity: u8,
    pub keywords: Vec<String>,
    pub error_categories: Vec<ErrorCategory>,
    pub recommended_effort: Effort,
}

/// Stateless description scorer — deterministic given the same text.
pub struct EffortEstimator;

impl EffortEstimator {
    pub fn new() -> Self {
        Self
    }

    /// Estimate effort from error context (used when re-routing a Fixer
    /// attempt after a failed test run).
    pub fn effort_for_errors(&self, errors: &[ParsedError]) -> Effort {
        if errors.is_empty() {
            return Effort::Low;
        }
        let summary = crate::feedback::error_parser::RustcErrorParser::summarize(errors);
        self.effort_from_summary(&summary)
    }

    pub fn effort_from_summary(&self, summary: &ErrorSummary) -> Effort {
        if summary.total >= 5
            || summary.has_lifetime_errors
            || summary.has_async_errors
            || summary.by_category.contains_key(&ErrorCategory::TraitBound)
            || summary.max_complexity >= 3
        {
            Effort::High
        } else if summary.has_borrow_errors || summary.total >= 2 {
            Effort::Medium
        } else {
            Effort::Low
        }
    }

    fn estimate_complexity(&self, description: &str) -> u8 {
        let desc_lower = description.to_lowercase();
        let mut complexity = 1u8;

        let complex_keywords = [
            "lifetime", "borrow", "async", "await", "trait", "generic", "macro", "unsafe",
            "concurrency", "parallel", "lock", "mutex", "arc", "pin", "future",
        ];
        for keyword in complex_keywords {
            if desc_lower.contains(keyword) {
                complexity = complexity.saturating_add(1);
            }
        }
        if description.len() > 500 {
            complexity = complexity.saturating_add(1);
        }
        complexity.min(5)
    }

    /// Classify a task from its description.
    pub fn classify_task(&self, description: &str) -> TaskClassification {
        let desc_lower = description.to_lowercase();

        let task_type = if desc_lower.contains("fix")
            || desc_lower.contains("error")
            || desc_lower.contains("compile")
        {
            TaskType::ErrorFix
        } else if desc_lower.contains("refactor") || desc_lower.contains("clean up") {
            TaskType::Refactor
        } else if desc_lower.contains("explain") || desc_lower.contains("what does") {
            TaskType::Explain
        } else if desc_lower.contains("review") || desc_lower.contains("check") {
            TaskType::Review
        } else if desc_lower.contains("design")
            || desc_lower.contains("architect")
            || desc_lower.contains("structure")
        {
            TaskType::Architecture
        } else {
            TaskType::CodeGeneration
        };

        let complexity = self.estimate_complexity(description);

        let recommended_effort = match task_type {
            TaskType::Architecture | TaskType::Explain | TaskType::Review => Effort::High,
            _ if complexity >= 4 => Effort::High,
            _ if complexity >= 2 => Effort::Medium,
            _ => Effort::Low,
        };

        TaskClassification {
            task_type,
            complexity,
            keywords: self.extract_keywords(&desc_lower),
            error_categories: vec![],
            recommended_effort,
        }
    }

    fn extract_keywords(&self, description: &str) -> Vec<String> {
        let keywords = [
            "lifetime", "borrow", "async", "await", "trait", "generic", "macro", "unsafe", "error",
            "type", "struct", "enum", "impl", "fn", "mut", "ref",
        ];
        keywords
            .iter()
            .filter(|k| description.contains(*k))
            .map(|k| k.to_string())
            .collect()
    }
}

impl Default for EffortEstimator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn complexity_estimation_bounds() {
        let est = EffortEstimator::new();
        assert!(est.estimate_complexity("add two numbers") <= 2);
        assert!(est.estimate_complexity("implement async trait with lifetime bounds") >= 3);
    }

    #[test]
    fn task_classification_detects_type() {
        let est = EffortEstimator::new();
        let fix_task = est.classify_task("fix the compilation error");
        assert_eq!(fix_task.task_type, TaskType::ErrorFix);

        let arch_task = est.classify_task("design the system architecture");
        assert_eq!(arch_task.task_type, TaskType::Architecture);
        assert_eq!(arch_task.recommended_effort, Effort::High);
    }

    #[test]
    fn review_and_explain_route_high_effort() {
        let est = EffortEstimator::new();
        let explain = est.classify_task("explain the borrow checker behavior");
        assert_eq!(explain.recommended_effort, Effort::High);

        let review = est.classify_task("review this module for issues");
        assert_eq!(review.recommended_effort, Effort::High);
    }

    #[test]
    fn stateless_estimator_is_deterministic() {
        let est = EffortEstimator::new();
        let first = est.classify_task("simple function");
        let second = est.classify_task("simple function");
        assert_eq!(first.recommended_effort, second.recommended_effort);
    }
}
