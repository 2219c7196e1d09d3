//! Core diff types for the Diff Engine.

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum DiffError {
    #[error("diff is invalid: {0}")]
    Invalid(String),
    #[error("hunk could not be aligned to base content: {0}")]
    AlignmentFailed(String),
}

pub type DiffResult<T> = Result<T, DiffError>;

/// A single line within a hunk body, marker already stripped from the text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiffLine {
    Context(String),
    Added(String),
    Removed(String),
}

impl DiffLine {
    pub fn text(&self) -> &str {
        match self {
            DiffLine::Context(s) | DiffLine::Added(s) | DiffLine::Removed(s) => s,
        }
    }

    pub fn marker(&self) -> char {
        match self {
            DiffLine::Context(_) => ' ',
            DiffLine::Added(_) => '+',
            DiffLine::Removed(_) => '-',
        }
    }
}

/// One `@@ -a,b +c,d @@` hunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hunk {
    pub old_start: usize,
    pub old_count: usize,
    pub new_start: usize,
    pub new_count: usize,
    pub lines: Vec<DiffLine>,
}

impl Hunk {
    /// Non-addition lines with the marker stripped — the text the aligner
    /// searches the base content for.
    pub fn context_lines(&self) -> Vec<&str> {
        self.lines
            .iter()
            .filter(|l| matches!(l, DiffLine::Context(_) | DiffLine::Removed(_)))
            .map(DiffLine::text)
            .collect()
    }

    /// Non-deletion lines, in original order — the block that replaces the
    /// matched context span when the hunk is applied.
    pub fn added_lines(&self) -> Vec<&str> {
        self.lines
            .iter()
            .filter(|l| matches!(l, DiffLine::Context(_) | DiffLine::Added(_)))
            .map(DiffLine::text)
            .collect()
    }

    pub fn is_pure_insertion(&self) -> bool {
        !self.lines.iter().any(|l| matches!(l, DiffLine::Removed(_)))
    }

    /// Recomputes `old_count`/`new_count` from the actual line markers — the
    /// source LLM's header counts are often wrong ( tolerance rule).
    pub fn recount(&mut self) {
        self.old_count = self
            .lines
            .iter()
            .filter(|l| matches!(l, DiffLine::Context(_) | DiffLine::Removed(_)))
            .count();
        self.new_count = self
            .lines
            .iter()
            .filter(|l| matches!(l, DiffLine::Context(_) | DiffLine::Added(_)))
            .count();
    }
}

/// One file's set of hunks within a unified diff. `path` is the file's
/// canonical path (after `a/`/`b/`/leading-`/` stripping); empty only for a
/// deletion's post-image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDiff {
    pub path: String,
    pub is_new_file: bool,
    pub is_deletion: bool,
    pub hunks: Vec<Hunk>,
}

/// A parsed unified diff: one or more file sections.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnifiedDiff {
    pub files: Vec<FileDiff>,
}
