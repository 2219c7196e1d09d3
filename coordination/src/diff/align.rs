//! Hunk alignment: locating where a hunk's context applies against base
//! content that may have drifted from what the diff was generated against.
//!
//! Ladder: trust the header's `old_start - 1`; failing an exact match there,
//! search ±10 lines for one; failing that, accept a match on the first
//! context line alone. If none of those succeed the hunk is rejected rather
//! than applied at a guessed position.

use super::types::{DiffError, DiffResult, Hunk};

const SEARCH_RADIUS: i64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    Hinted,
    Nearby,
    FirstLineOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Alignment {
    pub position: usize,
    pub kind: MatchKind,
}

/// Collapses runs of whitespace to a single space and trims both ends, so
/// reindented or retrailed lines still compare equal.
pub fn normalize_ws(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn lines_equal(a: &str, b: &str) -> bool {
    a == b || normalize_ws(a) == normalize_ws(b)
}

fn matches_at(base_lines: &[&str], pos: usize, context: &[&str]) -> bool {
    if pos + context.len() > base_lines.len() {
        return false;
    }
    base_lines[pos..pos + context.len()]
        .iter()
        .zip(context)
        .all(|(a, b)| lines_equal(a, b))
}

/// Finds where `hunk`'s context span sits within `base_lines`.
pub fn align_hunk(base_lines: &[&str], hunk: &Hunk) -> DiffResult<Alignment> {
    let context = hunk.context_lines();
    if context.is_empty() {
        // Pure insertion with no anchor: trust the header position outright.
        let pos = hunk.old_start.saturating_sub(1).min(base_lines.len());
        return Ok(Alignment {
            position: pos,
            kind: MatchKind::Hinted,
        });
    }

    let hinted = hunk.old_start.saturating_sub(1);
    if matches_at(base_lines, hinted, &context) {
        return Ok(Alignment {
            position: hinted,
            kind: MatchKind::Hinted,
        });
    }

    let base_len = base_lines.len() as i64;
    for offset in 1..=SEARCH_RADIUS {
        for candidate in [hinted as i64 - offset, hinted as i64 + offset] {
            if candidate < 0 || candidate > base_len {
                continue;
            }
            let candidate = candidate as usize;
            if matches_at(base_lines, candidate, &context) {
                return Ok(Alignment {
                    position: candidate,
                    kind: MatchKind::Nearby,
                });
            }
        }
    }

    let first = context[0];
    if let Some(pos) = base_lines.iter().position(|line| lines_equal(line, first)) {
        return Ok(Alignment {
            position: pos,
            kind: MatchKind::FirstLineOnly,
        });
    }

    Err(DiffError::AlignmentFailed(format!(
        "could not locate context for hunk at old_start={} (first context line: {:?})",
        hunk.old_start, first
    )))
}
