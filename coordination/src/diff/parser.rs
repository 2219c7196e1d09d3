//! Tolerant unified-diff parser and serializer.
//!
//! Tolerance rules, since LLM-generated diffs routinely get the bookkeeping
//! wrong even when the hunk content itself is usable: a file boundary
//! (`--- `/`+++ ` pair) with no preceding `diff --git` line still starts a
//! new file section; `@@ -a,b +c,d @@` counts are discarded and recomputed
//! from the actual `+`/`-`/context lines via [`Hunk::recount`]; `a/`, `b/`
//! and a leading `/` are stripped from paths.

use super::types::{DiffError, DiffLine, DiffResult, FileDiff, Hunk, UnifiedDiff};

fn strip_prefix(path: &str) -> String {
    let p = path.trim();
    let p = p.strip_prefix("a/").or_else(|| p.strip_prefix("b/")).unwrap_or(p);
    p.strip_prefix('/').unwrap_or(p).to_string()
}

struct PendingFile {
    path: String,
    is_new_file: bool,
    is_deletion: bool,
    hunks: Vec<Hunk>,
}

/// Parses unified diff text into file sections and hunks.
pub fn parse_unified_diff(text: &str) -> DiffResult<UnifiedDiff> {
    let mut files = Vec::new();
    let mut current: Option<PendingFile> = None;
    let mut current_hunk: Option<Hunk> = None;

    let lines: Vec<&str> = text.lines().collect();
    let mut i = 0;
    while i < lines.len() {
        let line = lines[i];

        if line.starts_with("diff --git ") {
            flush_hunk(&mut current, &mut current_hunk);
            flush_file(&mut files, &mut current);
            i += 1;
            continue;
        }

        if line.starts_with("index ")
            || line.starts_with("new file mode")
            || line.starts_with("deleted file mode")
        {
            i += 1;
            continue;
        }

        if let Some(old_raw) = line.strip_prefix("--- ") {
            flush_hunk(&mut current, &mut current_hunk);
            flush_file(&mut files, &mut current);

            let old_token = old_raw.trim();
            let is_new_file = old_token == "/dev/null";
            let old_path = if is_new_file { String::new() } else { strip_prefix(old_token) };

            i += 1;
            let new_line = lines.get(i).copied().unwrap_or("");
            let new_raw = new_line.strip_prefix("+++ ").ok_or_else(|| {
                DiffError::Invalid(format!("expected '+++' line after '--- {old_raw}'"))
            })?;
            let new_token = new_raw.trim();
            let is_deletion = new_token == "/dev/null";
            let new_path = if is_deletion { String::new() } else { strip_prefix(new_token) };

            let path = if is_deletion { old_path } else { new_path };
            current = Some(PendingFile {
                path,
                is_new_file,
                is_deletion,
                hunks: Vec::new(),
            });
            i += 1;
            continue;
        }

        if let Some(header) = line.strip_prefix("@@ ") {
            flush_hunk(&mut current, &mut current_hunk);
            let (old_start, new_start) = parse_hunk_header(header)?;
            current_hunk = Some(Hunk {
                old_start,
                old_count: 0,
                new_start,
                new_count: 0,
                lines: Vec::new(),
            });
            i += 1;
            continue;
        }

        if let Some(hunk) = current_hunk.as_mut() {
            if let Some(rest) = line.strip_prefix('+') {
                hunk.lines.push(DiffLine::Added(rest.to_string()));
            } else if let Some(rest) = line.strip_prefix('-') {
                hunk.lines.push(DiffLine::Removed(rest.to_string()));
            } else if let Some(rest) = line.strip_prefix(' ') {
                hunk.lines.push(DiffLine::Context(rest.to_string()));
            } else {
                // Unlabeled line inside a hunk body: treat as context rather
                // than rejecting the whole diff over a dropped leading space.
                hunk.lines.push(DiffLine::Context(line.to_string()));
            }
            i += 1;
            continue;
        }

        // Stray prose outside any file/hunk section is ignored.
        i += 1;
    }

    flush_hunk(&mut current, &mut current_hunk);
    flush_file(&mut files, &mut current);

    if files.is_empty() {
        return Err(DiffError::Invalid("no file sections found in diff".into()));
    }

    Ok(UnifiedDiff { files })
}

fn flush_hunk(current: &mut Option<PendingFile>, current_hunk: &mut Option<Hunk>) {
    if let Some(mut hunk) = current_hunk.take() {
        hunk.recount();
        if let Some(file) = current.as_mut() {
            file.hunks.push(hunk);
        }
    }
}

fn flush_file(files: &mut Vec<FileDiff>, current: &mut Option<PendingFile>) {
    if let Some(pending) = current.take() {
        files.push(FileDiff {
            path: pending.path,
            is_new_file: pending.is_new_file,
            is_deletion: pending.is_deletion,
            hunks: pending.hunks,
        });
    }
}

/// Parses `-a,b +c,d` out of a `@@ ... @@` header. The counts themselves are
/// discarded by the caller (recomputed via [`Hunk::recount`]).
fn parse_hunk_header(header: &str) -> DiffResult<(usize, usize)> {
    let body = header.split("@@").next().unwrap_or(header).trim();
    let mut parts = body.split_whitespace();
    let old = parts
        .next()
        .ok_or_else(|| DiffError::Invalid("empty hunk header".into()))?;
    let new = parts
        .next()
        .ok_or_else(|| DiffError::Invalid("hunk header missing new range".into()))?;
    let old_start = parse_range_start(old, '-')?;
    let new_start = parse_range_start(new, '+')?;
    Ok((old_start, new_start))
}

fn parse_range_start(token: &str, marker: char) -> DiffResult<usize> {
    let rest = token
        .strip_prefix(marker)
        .ok_or_else(|| DiffError::Invalid(format!("hunk range {token:?} missing '{marker}' marker")))?;
    let start_token = rest.splitn(2, ',').next().unwrap_or("0");
    start_token
        .parse()
        .map_err(|_| DiffError::Invalid(format!("bad hunk start in {token:?}")))
}

/// Serializes one file section back to unified-diff text with headers
/// recomputed from the hunks' own state.
pub fn serialize_file_diff(file: &FileDiff) -> String {
    let mut out = String::new();
    let old_label = if file.is_new_file {
        "/dev/null".to_string()
    } else {
        format!("a/{}", file.path)
    };
    let new_label = if file.is_deletion {
        "/dev/null".to_string()
    } else {
        format!("b/{}", file.path)
    };
    out.push_str(&format!("diff --git a/{0} b/{0}\n", file.path));
    if file.is_new_file {
        out.push_str("new file mode 100644\n");
    }
    if file.is_deletion {
        out.push_str("deleted file mode 100644\n");
    }
    out.push_str(&format!("--- {old_label}\n"));
    out.push_str(&format!("+++ {new_label}\n"));
    for hunk in &file.hunks {
        out.push_str(&format!(
            "@@ -{},{} +{},{} @@\n",
            hunk.old_start, hunk.old_count, hunk.new_start, hunk.new_count
        ));
        for line in &hunk.lines {
            out.push(line.marker());
            out.push_str(line.text());
            out.push('\n');
        }
    }
    out
}

pub fn serialize_unified_diff(diff: &UnifiedDiff) -> String {
    diff.files.iter().map(serialize_file_diff).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "diff --git a/src/math.ts b/src/math.ts\n\
--- a/src/math.ts\n\
+++ b/src/math.ts\n\
@@ -1,2 +1,5 @@\n\
 export const zero = 0;\n\
+export function sum(a: number, b: number): number {\n\
+  return a + b;\n\
+}\n";

    #[test]
    fn parses_a_single_hunk_addition() {
        let diff = parse_unified_diff(SAMPLE).unwrap();
        assert_eq!(diff.files.len(), 1);
        let file = &diff.files[0];
        assert_eq!(file.path, "src/math.ts");
        assert!(!file.is_new_file);
        assert!(!file.is_deletion);
        assert_eq!(file.hunks.len(), 1);
        assert_eq!(file.hunks[0].new_count, 4);
    }

    #[test]
    fn recomputes_bogus_header_counts() {
        let text = "--- a/f\n+++ b/f\n@@ -1,99 +1,99 @@\n context\n+added\n";
        let diff = parse_unified_diff(text).unwrap();
        let hunk = &diff.files[0].hunks[0];
        assert_eq!(hunk.old_count, 1);
        assert_eq!(hunk.new_count, 2);
    }

    #[test]
    fn tolerates_missing_diff_git_header() {
        let text = "--- a/f\n+++ b/f\n@@ -1,1 +1,1 @@\n-old\n+new\n";
        let diff = parse_unified_diff(text).unwrap();
        assert_eq!(diff.files.len(), 1);
        assert_eq!(diff.files[0].path, "f");
    }

    #[test]
    fn recognizes_new_file_and_deletion() {
        let new_file = "--- /dev/null\n+++ b/new.rs\n@@ -0,0 +1,1 @@\n+fn x() {}\n";
        let diff = parse_unified_diff(new_file).unwrap();
        assert!(diff.files[0].is_new_file);

        let deletion = "--- a/old.rs\n+++ /dev/null\n@@ -1,1 +0,0 @@\n-fn x() {}\n";
        let diff = parse_unified_diff(deletion).unwrap();
        assert!(diff.files[0].is_deletion);
        assert_eq!(diff.files[0].path, "old.rs");
    }

    #[test]
    fn rejects_diff_with_no_file_sections() {
        assert!(parse_unified_diff("just some prose\nno headers here\n").is_err());
    }

    #[test]
    fn serialize_round_trips_header_shape() {
        let diff = parse_unified_diff(SAMPLE).unwrap();
        let text = serialize_file_diff(&diff.files[0]);
        assert!(text.contains("--- a/src/math.ts"));
        assert!(text.contains("+++ b/src/math.ts"));
        assert!(text.contains("@@ -1,2 +1,5 @@"));
    }
}
