//! Aggregator: collects completed child-subtask diffs into one diff
//! for the parent task. Mechanical — all conflict logic lives in the Diff
//! Engine; this module only sequences calls into it and persists the
//! result.

use crate::diff::{combine, detect_conflicts, parse_unified_diff, serialize_unified_diff, Conflict, ConflictResolution, SubtaskDiff};
use crate::state::store::{StateStore, StoreResult};
use crate::state::types::SubtaskId;
use std::collections::HashMap;

#[derive(Debug, thiserror::Error)]
pub enum AggregationError {
    #[error("no completed child diffs to aggregate")]
    NothingToAggregate,
    #[error("diff parse error in child {subtask_id}: {source}")]
    ParseError {
        subtask_id: SubtaskId,
        #[source]
        source: crate::diff::DiffError,
    },
    #[error("combine failed: {0}")]
    CombineFailed(crate::diff::DiffError),
    #[error("store error: {0}")]
    Store(#[from] crate::state::store::StoreError),
}

#[derive(Debug, Clone)]
pub struct AggregationOutcome {
    pub diff_text: String,
    pub files_touched: usize,
    pub insertions: usize,
    pub deletions: usize,
}

#[derive(Debug, Clone)]
pub struct AggregationConflict {
    pub conflicts: Vec<Conflict>,
}

fn diff_stats(text: &str) -> Result<(usize, usize, usize), AggregationError> {
    let parsed = parse_unified_diff(text).map_err(AggregationError::CombineFailed)?;
    let files = parsed.files.len();
    let mut insertions = 0;
    let mut deletions = 0;
    for file in &parsed.files {
        for hunk in &file.hunks {
            insertions += hunk
                .lines
                .iter()
                .filter(|l| matches!(l, crate::diff::DiffLine::Added(_)))
                .count();
            deletions += hunk
                .lines
                .iter()
                .filter(|l| matches!(l, crate::diff::DiffLine::Removed(_)))
                .count();
        }
    }
    Ok((files, insertions, deletions))
}

/// Aggregates a parent task's completed child diffs: 0 diffs is an empty
/// success, 1 diff passes through untouched, N>1 combines via the Diff
/// Engine's conflict detection. On success the combined diff is persisted
/// into the parent's `OrchestrationState.aggregated_diff` and
/// `Task.current_diff`.
pub fn aggregate_child_diffs(
    store: &StateStore,
    parent_task_id: &str,
) -> Result<Result<AggregationOutcome, AggregationConflict>, AggregationError> {
    let children = store.completed_child_diffs(parent_task_id)?;

    if children.is_empty() {
        return Err(AggregationError::NothingToAggregate);
    }

    if children.len() == 1 {
        let (_, text) = &children[0];
        let (files, insertions, deletions) = diff_stats(text)?;
        persist(store, parent_task_id, text)?;
        return Ok(Ok(AggregationOutcome {
            diff_text: text.clone(),
            files_touched: files,
            insertions,
            deletions,
        }));
    }

    let parent = store.child_tasks_of(parent_task_id)?;
    let subtask_ids: HashMap<usize, String> = parent
        .iter()
        .filter_map(|t| t.subtask_index.map(|idx| (idx, t.id.clone())))
        .collect();

    let mut subtask_diffs = Vec::with_capacity(children.len());
    for (idx, text) in &children {
        let diff = parse_unified_diff(text).map_err(|source| AggregationError::ParseError {
            subtask_id: subtask_ids.get(idx).cloned().unwrap_or_default(),
            source,
        })?;
        subtask_diffs.push(SubtaskDiff {
            subtask_id: subtask_ids.get(idx).cloned().unwrap_or_else(|| idx.to_string()),
            diff,
        });
    }

    let strategies: HashMap<String, ConflictResolution> = HashMap::new();
    let conflicts = detect_conflicts(&subtask_diffs, &strategies);
    if conflicts
        .iter()
        .any(|c| c.resolution == ConflictResolution::ManualRequired)
    {
        return Ok(Err(AggregationConflict { conflicts }));
    }

    let combined = combine(&subtask_diffs, &strategies).map_err(AggregationError::CombineFailed)?;
    let text = serialize_unified_diff(&combined);
    let (files, insertions, deletions) = diff_stats(&text)?;
    persist(store, parent_task_id, &text)?;
    Ok(Ok(AggregationOutcome {
        diff_text: text,
        files_touched: files,
        insertions,
        deletions,
    }))
}

fn persist(store: &StateStore, parent_task_id: &str, diff_text: &str) -> StoreResult<()> {
    store.mutate_session(parent_task_id, |session| {
        if let Some(orch) = session.orchestration.as_mut() {
            orch.aggregated_diff = Some(diff_text.to_string());
        }
        Ok(())
    })?;
    let mut parent = store.require_task(parent_task_id)?;
    parent.current_diff = Some(diff_text.to_string());
    store.put_task(&parent)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::types::{IssueRef, RepoCoordinate, SessionMemory, Task};

    fn temp_store() -> (tempfile::TempDir, StateStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open(dir.path()).unwrap();
        (dir, store)
    }

    fn make_parent(store: &StateStore, id: &str) {
        let task = Task::new(
            id.to_string(),
            RepoCoordinate::parse("acme/widgets").unwrap(),
            IssueRef {
                number: 1,
                title: "t".into(),
                body: "b".into(),
            },
            3,
        );
        store.put_task(&task).unwrap();
        store.put_session(&SessionMemory::new(id.to_string())).unwrap();
        store
            .mutate_session(id, |session| {
                session.orchestration = Some(Default::default());
                Ok(())
            })
            .unwrap();
    }

    fn make_child(store: &StateStore, id: &str, parent: &str, idx: usize, diff: &str) {
        let mut task = Task::child(
            id.to_string(),
            RepoCoordinate::parse("acme/widgets").unwrap(),
            IssueRef {
                number: 1,
                title: "t".into(),
                body: "b".into(),
            },
            parent.to_string(),
            idx,
            3,
        );
        task.status = crate::state::types::Status::Completed;
        task.current_diff = Some(diff.to_string());
        store.put_task(&task).unwrap();
    }

    #[test]
    fn single_child_diff_passes_through() {
        let (_dir, store) = temp_store();
        make_parent(&store, "p1");
        make_child(&store, "c1", "p1", 0, "--- a/f\n+++ b/f\n@@ -1,1 +1,2 @@\n ctx\n+added\n");

        let outcome = aggregate_child_diffs(&store, "p1").unwrap().unwrap();
        assert_eq!(outcome.files_touched, 1);
        assert_eq!(outcome.insertions, 1);

        let parent = store.require_task("p1").unwrap();
        assert!(parent.current_diff.is_some());
    }

    #[test]
    fn disjoint_children_combine_without_conflict() {
        let (_dir, store) = temp_store();
        make_parent(&store, "p2");
        make_child(&store, "c1", "p2", 0, "--- a/x.ts\n+++ b/x.ts\n@@ -1,1 +1,2 @@\n ctx\n+added1\n");
        make_child(&store, "c2", "p2", 1, "--- a/y.ts\n+++ b/y.ts\n@@ -1,1 +1,2 @@\n ctx\n+added2\n");

        let outcome = aggregate_child_diffs(&store, "p2").unwrap().unwrap();
        assert_eq!(outcome.files_touched, 2);
    }

    #[test]
    fn overlapping_children_surface_manual_conflict() {
        let (_dir, store) = temp_store();
        make_parent(&store, "p3");
        make_child(&store, "c1", "p3", 0, "--- a/x.ts\n+++ b/x.ts\n@@ -1,2 +1,2 @@\n-a\n+A\n b\n");
        make_child(&store, "c2", "p3", 1, "--- a/x.ts\n+++ b/x.ts\n@@ -1,1 +1,1 @@\n-a\n+AA\n");

        let result = aggregate_child_diffs(&store, "p3").unwrap();
        assert!(result.is_err());
    }

    #[test]
    fn no_completed_children_is_an_error() {
        let (_dir, store) = temp_store();
        make_parent(&store, "p4");
        assert!(matches!(
            aggregate_child_diffs(&store, "p4"),
            Err(AggregationError::NothingToAggregate)
        ));
    }
}
