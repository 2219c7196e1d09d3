//! The Diff Engine: parsing, alignment, application, conflict
//! detection and combining for LLM-produced unified diffs.

pub mod align;
pub mod apply;
pub mod conflict;
pub mod parser;
pub mod types;

pub use align::{align_hunk, normalize_ws, Alignment, MatchKind};
pub use apply::apply_file_diff;
pub use conflict::{combine, detect_conflicts, Conflict, ConflictResolution, SubtaskDiff};
pub use parser::{parse_unified_diff, serialize_file_diff, serialize_unified_diff};
pub use types::{DiffError, DiffLine, DiffResult, FileDiff, Hunk, UnifiedDiff};

use similar::TextDiff;

/// Regenerates unified-diff text straight from old/new content, bypassing
/// whatever hand-written hunk headers an LLM produced. Used to re-derive a
/// clean diff after application, and to exercise parse/apply round-trips.
pub fn regenerate_diff_text(old: &str, new: &str, path: &str) -> String {
    TextDiff::from_lines(old, new)
        .unified_diff()
        .context_radius(3)
        .header(&format!("a/{path}"), &format!("b/{path}"))
        .to_string()
}
