//! Conflict detection and combining for diffs produced by sibling subtasks,
//! used by the Aggregator.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::parser::serialize_unified_diff;
use super::types::{DiffError, DiffResult, FileDiff, Hunk, UnifiedDiff};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConflictResolution {
    KeepFirst,
    KeepSecond,
    ManualRequired,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conflict {
    pub file: String,
    pub subtask1: String,
    pub subtask2: String,
    pub resolution: ConflictResolution,
}

/// One subtask's diff, keyed for conflict attribution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubtaskDiff {
    pub subtask_id: String,
    pub diff: UnifiedDiff,
}

fn ranges_overlap(a: &Hunk, b: &Hunk) -> bool {
    let a_end = a.old_start + a.old_count;
    let b_end = b.old_start + b.old_count;
    a.old_start < b_end && b.old_start < a_end
}

/// Flags pairs of hunks from *different* subtasks touching overlapping
/// old-file line ranges in the same file. Resolution defaults to
/// `ManualRequired` unless `strategies` names an override for that file.
pub fn detect_conflicts(
    diffs: &[SubtaskDiff],
    strategies: &HashMap<String, ConflictResolution>,
) -> Vec<Conflict> {
    let mut by_file: HashMap<&str, Vec<(&str, &Hunk)>> = HashMap::new();
    for sd in diffs {
        for file in &sd.diff.files {
            for hunk in &file.hunks {
                by_file
                    .entry(file.path.as_str())
                    .or_default()
                    .push((sd.subtask_id.as_str(), hunk));
            }
        }
    }

    let mut conflicts = Vec::new();
    for (path, hunks) in by_file {
        for i in 0..hunks.len() {
            for j in (i + 1)..hunks.len() {
                let (sub_a, hunk_a) = hunks[i];
                let (sub_b, hunk_b) = hunks[j];
                if sub_a == sub_b {
                    continue;
                }
                if ranges_overlap(hunk_a, hunk_b) {
                    let resolution = strategies
                        .get(path)
                        .copied()
                        .unwrap_or(ConflictResolution::ManualRequired);
                    conflicts.push(Conflict {
                        file: path.to_string(),
                        subtask1: sub_a.to_string(),
                        subtask2: sub_b.to_string(),
                        resolution,
                    });
                }
            }
        }
    }
    conflicts
}

/// Concatenates every hunk touching `file_path` across `diffs`, in subtask
/// order, then re-sorts by `old_start` and renumbers `new_start` via a
/// running cumulative line-count offset.
fn combine_file(file_path: &str, diffs: &[SubtaskDiff]) -> DiffResult<FileDiff> {
    let mut hunks: Vec<Hunk> = Vec::new();
    let mut is_new_file = false;
    let mut is_deletion = false;
    for sd in diffs {
        for file in &sd.diff.files {
            if file.path == file_path {
                is_new_file |= file.is_new_file;
                is_deletion |= file.is_deletion;
                hunks.extend(file.hunks.iter().cloned());
            }
        }
    }
    if hunks.is_empty() {
        return Err(DiffError::Invalid(format!(
            "no hunks found for file {file_path} during combine"
        )));
    }

    hunks.sort_by_key(|h| h.old_start);

    let mut cumulative_offset: i64 = 0;
    for hunk in &mut hunks {
        let new_start = hunk.old_start as i64 + cumulative_offset;
        hunk.new_start = new_start.max(0) as usize;
        cumulative_offset += hunk.new_count as i64 - hunk.old_count as i64;
    }

    Ok(FileDiff {
        path: file_path.to_string(),
        is_new_file,
        is_deletion,
        hunks,
    })
}

/// Combines sibling subtask diffs into one. Fails if any unresolved
/// `ManualRequired` conflict exists among `diffs` under `strategies`.
pub fn combine(
    diffs: &[SubtaskDiff],
    strategies: &HashMap<String, ConflictResolution>,
) -> DiffResult<UnifiedDiff> {
    let conflicts = detect_conflicts(diffs, strategies);
    if let Some(c) = conflicts
        .iter()
        .find(|c| c.resolution == ConflictResolution::ManualRequired)
    {
        return Err(DiffError::Invalid(format!(
            "unresolved conflict in {} between {} and {}",
            c.file, c.subtask1, c.subtask2
        )));
    }

    let mut order: Vec<String> = Vec::new();
    for sd in diffs {
        for file in &sd.diff.files {
            if !order.contains(&file.path) {
                order.push(file.path.clone());
            }
        }
    }

    let files = order
        .iter()
        .map(|path| combine_file(path, diffs))
        .collect::<DiffResult<Vec<_>>>()?;

    let combined = UnifiedDiff { files };
    validate(&combined)?;
    Ok(combined)
}

/// Every file section needs a path and at least one hunk.
pub fn validate(diff: &UnifiedDiff) -> DiffResult<()> {
    for file in &diff.files {
        if file.path.is_empty() && !file.is_deletion {
            return Err(DiffError::Invalid("file section has an empty path".into()));
        }
        if file.hunks.is_empty() {
            return Err(DiffError::Invalid(format!(
                "file section {} has no hunks",
                file.path
            )));
        }
    }
    Ok(())
}

/// Renders a combined diff back to unified-diff text, for persistence.
pub fn render(diff: &UnifiedDiff) -> String {
    serialize_unified_diff(diff)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::parser::parse_unified_diff;

    fn subtask(id: &str, text: &str) -> SubtaskDiff {
        SubtaskDiff {
            subtask_id: id.to_string(),
            diff: parse_unified_diff(text).unwrap(),
        }
    }

    #[test]
    fn no_conflict_when_files_are_disjoint() {
        let a = subtask("s1", "--- a/x.ts\n+++ b/x.ts\n@@ -1,1 +1,2 @@\n ctx\n+added\n");
        let b = subtask("s2", "--- a/y.ts\n+++ b/y.ts\n@@ -1,1 +1,2 @@\n ctx\n+added\n");
        let conflicts = detect_conflicts(&[a, b], &HashMap::new());
        assert!(conflicts.is_empty());
    }

    #[test]
    fn detects_overlapping_ranges_in_same_file() {
        let a = subtask("s1", "--- a/x.ts\n+++ b/x.ts\n@@ -1,3 +1,3 @@\n a\n-b\n+B\n c\n");
        let b = subtask("s2", "--- a/x.ts\n+++ b/x.ts\n@@ -2,1 +2,1 @@\n-b\n+BB\n");
        let conflicts = detect_conflicts(&[a, b], &HashMap::new());
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].resolution, ConflictResolution::ManualRequired);
    }

    #[test]
    fn combine_succeeds_for_disjoint_files() {
        let a = subtask("s1", "--- a/x.ts\n+++ b/x.ts\n@@ -1,1 +1,2 @@\n ctx\n+added1\n");
        let b = subtask("s2", "--- a/y.ts\n+++ b/y.ts\n@@ -1,1 +1,2 @@\n ctx\n+added2\n");
        let combined = combine(&[a, b], &HashMap::new()).unwrap();
        assert_eq!(combined.files.len(), 2);
    }

    #[test]
    fn combine_fails_on_unresolved_conflict() {
        let a = subtask("s1", "--- a/x.ts\n+++ b/x.ts\n@@ -1,2 +1,2 @@\n-a\n+A\n b\n");
        let b = subtask("s2", "--- a/x.ts\n+++ b/x.ts\n@@ -1,1 +1,1 @@\n-a\n+AA\n");
        assert!(combine(&[a, b], &HashMap::new()).is_err());
    }

    #[test]
    fn combine_respects_override_strategy() {
        let a = subtask("s1", "--- a/x.ts\n+++ b/x.ts\n@@ -1,2 +1,2 @@\n-a\n+A\n b\n");
        let b = subtask("s2", "--- a/x.ts\n+++ b/x.ts\n@@ -1,1 +1,1 @@\n-a\n+AA\n");
        let mut strategies = HashMap::new();
        strategies.insert("x.ts".to_string(), ConflictResolution::KeepFirst);
        assert!(combine(&[a, b], &strategies).is_ok());
    }
}
