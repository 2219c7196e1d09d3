//! Hunk application to base file content.

use super::align::align_hunk;
use super::types::{DiffResult, FileDiff};

/// Applies `file`'s hunks to `base`. Returns `None` for a deletion (no
/// post-image content); for a new file, materializes content straight from
/// the added lines.
pub fn apply_file_diff(base: &str, file: &FileDiff) -> DiffResult<Option<String>> {
    if file.is_deletion {
        return Ok(None);
    }
    if file.is_new_file {
        return Ok(Some(materialize_new_file(file)));
    }

    let newline = if base.ends_with('\n') || base.is_empty() {
        "\n"
    } else {
        ""
    };
    let mut lines: Vec<String> = base.lines().map(str::to_string).collect();

    let mut hunks: Vec<&super::types::Hunk> = file.hunks.iter().collect();
    hunks.sort_by(|a, b| b.old_start.cmp(&a.old_start));

    for hunk in hunks {
        let base_refs: Vec<&str> = lines.iter().map(String::as_str).collect();
        let alignment = align_hunk(&base_refs, hunk)?;
        let context_len = hunk.context_lines().len();
        let replacement: Vec<String> = hunk.added_lines().into_iter().map(str::to_string).collect();
        let end = (alignment.position + context_len).min(lines.len());
        lines.splice(alignment.position..end, replacement);
    }

    let mut out = lines.join("\n");
    out.push_str(newline);
    Ok(Some(out))
}

fn is_diff_syntax_line(line: &str) -> bool {
    line.starts_with("diff --git")
        || line.starts_with("--- ")
        || line.starts_with("+++ ")
        || line.starts_with("@@")
        || line.starts_with("index ")
        || line.starts_with("new file mode")
}

fn materialize_new_file(file: &FileDiff) -> String {
    let mut out = String::new();
    for hunk in &file.hunks {
        for line in hunk.added_lines() {
            if is_diff_syntax_line(line) {
                continue;
            }
            out.push_str(line);
            out.push('\n');
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::parser::parse_unified_diff;

    #[test]
    fn applies_a_pure_addition_hunk() {
        let base = "export const zero = 0;\n";
        let text = "--- a/f.ts\n+++ b/f.ts\n@@ -1,1 +1,3 @@\n export const zero = 0;\n+export function one() { return 1; }\n";
        let diff = parse_unified_diff(text).unwrap();
        let result = apply_file_diff(base, &diff.files[0]).unwrap().unwrap();
        assert!(result.contains("export function one()"));
        assert!(result.contains("export const zero = 0;"));
    }

    #[test]
    fn applies_a_hunk_with_removal() {
        let base = "line one\nline two\nline three\n";
        let text = "--- a/f\n+++ b/f\n@@ -2,1 +2,1 @@\n-line two\n+line TWO\n";
        let diff = parse_unified_diff(text).unwrap();
        let result = apply_file_diff(base, &diff.files[0]).unwrap().unwrap();
        assert_eq!(result, "line one\nline TWO\nline three\n");
    }

    #[test]
    fn applies_multiple_hunks_in_descending_order() {
        let base = "a\nb\nc\nd\ne\n";
        let text = "--- a/f\n+++ b/f\n\
@@ -1,1 +1,1 @@\n-a\n+A\n\
@@ -4,1 +4,1 @@\n-d\n+D\n";
        let diff = parse_unified_diff(text).unwrap();
        let result = apply_file_diff(base, &diff.files[0]).unwrap().unwrap();
        assert_eq!(result, "A\nb\nc\nD\ne\n");
    }

    #[test]
    fn new_file_strips_embedded_diff_syntax() {
        let text = "--- /dev/null\n+++ b/new.rs\n@@ -0,0 +1,2 @@\n+fn main() {}\n+// done\n";
        let diff = parse_unified_diff(text).unwrap();
        let result = apply_file_diff("", &diff.files[0]).unwrap().unwrap();
        assert_eq!(result, "fn main() {}\n// done\n");
    }

    #[test]
    fn deletion_returns_none() {
        let text = "--- a/old.rs\n+++ /dev/null\n@@ -1,1 +0,0 @@\n-fn x() {}\n";
        let diff = parse_unified_diff(text).unwrap();
        assert!(apply_file_diff("fn x() {}\n", &diff.files[0]).unwrap().is_none());
    }

    #[test]
    fn aligns_through_drifted_context() {
        let base = "preamble\nline one\nline two\nline three\n";
        // old_start says line 1 ("line one" in the original base), but an
        // extra "preamble" line was inserted upstream, shifting everything.
        let text = "--- a/f\n+++ b/f\n@@ -1,1 +1,1 @@\n-line two\n+line TWO\n";
        let diff = parse_unified_diff(text).unwrap();
        let result = apply_file_diff(base, &diff.files[0]).unwrap().unwrap();
        assert!(result.contains("line TWO"));
    }
}
