//! Breakdown: splits a Planner's target-file list into an acyclic
//! graph of XS/S subtasks cheap enough for the Coder to finish in one shot.

use std::collections::HashMap;

use crate::scheduler::validate_no_cycles;
use crate::state::types::{Complexity, SubtaskDefinition};

#[derive(Debug, thiserror::Error)]
pub enum BreakdownError {
    #[error("breakdown produced a candidate exceeding S complexity ({lines} estimated lines, file {path})")]
    TooLarge { path: String, lines: u32 },
    #[error("breakdown produced duplicate subtask id {0}")]
    DuplicateId(String),
    #[error("breakdown dependency graph: {0}")]
    Scheduler(#[from] crate::scheduler::SchedulerError),
    #[error("breakdown input has no files")]
    Empty,
}

/// A target file with its estimated size, as supplied by the Planner stage
/// or a repo-content hook.
#[derive(Debug, Clone)]
pub struct CandidateFile {
    pub path: String,
    pub estimated_lines: u32,
}

#[derive(Debug, Clone)]
pub struct BreakdownInput {
    pub task_title: String,
    pub files: Vec<CandidateFile>,
}

/// Merge cap: single-file groups sharing a directory are combined as long
/// as the running total stays at or under this many lines.
const DIRECTORY_MERGE_CAP: u32 = 100;
/// XS/S boundary: at or under this many lines the subtask is XS, otherwise S.
const XS_THRESHOLD: u32 = 50;

struct Group {
    files: Vec<CandidateFile>,
}

impl Group {
    fn total_lines(&self) -> u32 {
        self.files.iter().map(|f| f.estimated_lines).sum()
    }

    fn directory(&self) -> &str {
        directory_of(&self.files[0].path)
    }
}

fn directory_of(path: &str) -> &str {
    path.rfind('/').map(|i| &path[..i]).unwrap_or("")
}

fn file_stem(path: &str) -> &str {
    let base = path.rsplit('/').next().unwrap_or(path);
    base.split('.').next().unwrap_or(base)
}

fn is_test_sibling(candidate: &str, source: &str) -> bool {
    let Some(candidate_base) = candidate.strip_suffix(".test.ts").or_else(|| candidate.strip_suffix(".spec.ts")) else {
        return false;
    };
    let Some(source_base) = source.strip_suffix(".ts") else {
        return false;
    };
    candidate_base == source_base
}

/// Groups `.ts` source files with their test sibling (`foo.ts` +
/// `foo.test.ts`/`foo.spec.ts`) into one unit; everything else starts as its
/// own single-file group.
fn group_file_test_pairs(files: &[CandidateFile]) -> Vec<Group> {
    let mut consumed = vec![false; files.len()];
    let mut groups = Vec::new();

    for i in 0..files.len() {
        if consumed[i] {
            continue;
        }
        let mut members = vec![files[i].clone()];
        consumed[i] = true;
        for j in 0..files.len() {
            if consumed[j] {
                continue;
            }
            if is_test_sibling(&files[j].path, &files[i].path)
                || is_test_sibling(&files[i].path, &files[j].path)
            {
                members.push(files[j].clone());
                consumed[j] = true;
            }
        }
        groups.push(Group { files: members });
    }
    groups
}

/// Merges remaining single-file groups that share a directory, as long as
/// the cumulative line count stays under [`DIRECTORY_MERGE_CAP`].
fn merge_by_directory(groups: Vec<Group>) -> Vec<Group> {
    let mut merged: Vec<Group> = Vec::new();
    for group in groups {
        if group.files.len() > 1 {
            merged.push(group);
            continue;
        }
        let dir = group.directory().to_string();
        let lines = group.total_lines();
        if let Some(existing) = merged
            .iter_mut()
            .find(|g| g.files.len() == 1 && g.directory() == dir && g.total_lines() + lines <= DIRECTORY_MERGE_CAP)
        {
            existing.files.extend(group.files);
        } else {
            merged.push(group);
        }
    }
    merged
}

fn derive_title(group: &Group) -> String {
    let primary = &group.files[0].path;
    format!("Implement {}", file_stem(primary))
}

fn derive_description(group: &Group) -> String {
    let paths: Vec<&str> = group.files.iter().map(|f| f.path.as_str()).collect();
    format!("Implements changes in {}", paths.join(", "))
}

fn derive_acceptance_criteria(group: &Group) -> Vec<String> {
    let mut criteria = Vec::new();
    for file in &group.files {
        if file.path.ends_with(".test.ts") || file.path.ends_with(".spec.ts") {
            criteria.push(format!("passes {}", file.path));
        }
    }
    if criteria.is_empty() {
        criteria.push("compiles".to_string());
        criteria.push("properly typed".to_string());
    }
    criteria
}

/// A group depends on another group if it sits in the same directory as a
/// group anchored on `types.ts`/`index.ts` and isn't that group itself —
/// the shape of an import-driven dependency without parsing real imports.
fn derive_dependencies(groups: &[(String, Group)]) -> HashMap<String, Vec<String>> {
    let mut anchors: HashMap<&str, &str> = HashMap::new();
    for (id, group) in groups {
        let stem = file_stem(&group.files[0].path);
        if stem == "types" || stem == "index" {
            anchors.insert(group.directory(), id.as_str());
        }
    }

    let mut deps: HashMap<String, Vec<String>> = HashMap::new();
    for (id, group) in groups {
        let mut group_deps = Vec::new();
        if let Some(anchor_id) = anchors.get(group.directory()) {
            if *anchor_id != id {
                group_deps.push(anchor_id.to_string());
            }
        }
        deps.insert(id.clone(), group_deps);
    }
    deps
}

/// Splits `input.files` into a dependency-annotated set of XS/S subtasks.
pub fn breakdown_plan(input: &BreakdownInput) -> Result<Vec<SubtaskDefinition>, BreakdownError> {
    if input.files.is_empty() {
        return Err(BreakdownError::Empty);
    }

    let paired = group_file_test_pairs(&input.files);
    let merged = merge_by_directory(paired);

    let mut named: Vec<(String, Group)> = Vec::new();
    let mut seen_ids = std::collections::HashSet::new();
    for (index, group) in merged.into_iter().enumerate() {
        let id = format!("subtask-{index}");
        if !seen_ids.insert(id.clone()) {
            return Err(BreakdownError::DuplicateId(id));
        }
        named.push((id, group));
    }

    let dependencies = derive_dependencies(&named);

    let mut defs = Vec::with_capacity(named.len());
    for (id, group) in &named {
        let lines = group.total_lines();
        let complexity = if lines <= XS_THRESHOLD {
            Complexity::Xs
        } else if lines <= DIRECTORY_MERGE_CAP {
            Complexity::S
        } else {
            return Err(BreakdownError::TooLarge {
                path: group.files[0].path.clone(),
                lines,
            });
        };

        defs.push(SubtaskDefinition {
            id: id.clone(),
            title: derive_title(group),
            description: derive_description(group),
            target_files: group.files.iter().map(|f| f.path.clone()).collect(),
            dependencies: dependencies.get(id).cloned().unwrap_or_default(),
            acceptance_criteria: derive_acceptance_criteria(group),
            estimated_complexity: complexity,
            estimated_lines: lines,
        });
    }

    validate_no_cycles(&defs)?;
    Ok(defs)
}
