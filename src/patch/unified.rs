//! Unified-diff parsing and hunk application.
//!
//! Accepts standard `diff --git a/<p> b/<p>` blobs with `@@` hunks,
//! tolerating a missing trailing newline, multiple files in one blob, and
//! locally-generated multi-file diffs joined with a blank line. Hunks are
//! validated against current file content at apply time; a context mismatch
//! is a structured rejection, never a crash.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

use super::{EditPlan, FileOperation, PatchError, PatchFormat};

/// One `@@` hunk. Line numbers are 1-based, counts follow the diff header.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hunk {
    pub old_start: usize,
    pub old_count: usize,
    pub new_start: usize,
    pub new_count: usize,
    pub lines: Vec<HunkLine>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "tag", content = "text", rename_all = "snake_case")]
pub enum HunkLine {
    Context(String),
    Add(String),
    Remove(String),
}

/// A hunk failed to match current file content.
#[derive(Debug, Clone, PartialEq)]
pub struct HunkMismatch {
    pub hunk_index: usize,
    pub line: usize,
    pub detail: String,
}

fn header_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^diff --git a/(.+) b/(.+)$").expect("static regex"))
}

fn hunk_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^@@ -(\d+)(?:,(\d+))? \+(\d+)(?:,(\d+))? @@").expect("static regex")
    })
}

/// Parse a unified diff blob into an `EditPlan`.
pub fn parse(text: &str) -> Result<EditPlan, PatchError> {
    let mut operations = Vec::new();

    let mut current_path: Option<String> = None;
    let mut is_new_file = false;
    let mut is_deleted_file = false;
    let mut hunks: Vec<Hunk> = Vec::new();
    let mut current_hunk: Option<Hunk> = None;

    let mut flush_file = |path: Option<String>,
                          new_file: bool,
                          deleted: bool,
                          mut hunks: Vec<Hunk>,
                          pending: Option<Hunk>|
     -> Result<(), PatchError> {
        let Some(path) = path else { return Ok(()) };
        if let Some(h) = pending {
            hunks.push(h);
        }
        if deleted {
            operations.push(FileOperation::Delete { path });
        } else if new_file {
            // A brand-new file's hunks are pure additions; collapse them
            // into the created content.
            let mut content = String::new();
            for hunk in &hunks {
                for line in &hunk.lines {
                    if let HunkLine::Add(text) = line {
                        content.push_str(text);
                        content.push('\n');
                    }
                }
            }
            operations.push(FileOperation::Create { path, content });
        } else {
            if hunks.is_empty() {
                return Err(PatchError::Unparseable {
                    detail: format!("diff for {} has no hunks", path),
                });
            }
            operations.push(FileOperation::ModifyByDiff { path, hunks });
        }
        Ok(())
    };

    for raw_line in text.lines() {
        if let Some(caps) = header_re().captures(raw_line) {
            flush_file(
                current_path.take(),
                is_new_file,
                is_deleted_file,
                std::mem::take(&mut hunks),
                current_hunk.take(),
            )?;
            // The b-side is the post-image path.
            current_path = Some(caps[2].to_string());
            is_new_file = false;
            is_deleted_file = false;
            continue;
        }

        if current_path.is_none() {
            // Prose before the first header is tolerated.
            continue;
        }

        if raw_line.starts_with("new file mode") || raw_line == "--- /dev/null" {
            is_new_file = true;
            continue;
        }
        if raw_line.starts_with("deleted file mode") || raw_line == "+++ /dev/null" {
            is_deleted_file = true;
            continue;
        }
        if raw_line.starts_with("index ")
            || raw_line.starts_with("--- ")
            || raw_line.starts_with("+++ ")
            || raw_line.starts_with("similarity index")
            || raw_line.starts_with("rename ")
        {
            continue;
        }
        if raw_line == "\\ No newline at end of file" {
            continue;
        }

        if let Some(caps) = hunk_re().captures(raw_line) {
            if let Some(h) = current_hunk.take() {
                hunks.push(h);
            }
            current_hunk = Some(Hunk {
                old_start: caps[1].parse().unwrap_or(0),
                old_count: caps.get(2).map_or(1, |m| m.as_str().parse().unwrap_or(1)),
                new_start: caps[3].parse().unwrap_or(0),
                new_count: caps.get(4).map_or(1, |m| m.as_str().parse().unwrap_or(1)),
                lines: Vec::new(),
            });
            continue;
        }

        if let Some(hunk) = current_hunk.as_mut() {
            if let Some(rest) = raw_line.strip_prefix('+') {
                hunk.lines.push(HunkLine::Add(rest.to_string()));
            } else if let Some(rest) = raw_line.strip_prefix('-') {
                hunk.lines.push(HunkLine::Remove(rest.to_string()));
            } else if let Some(rest) = raw_line.strip_prefix(' ') {
                hunk.lines.push(HunkLine::Context(rest.to_string()));
            } else if raw_line.is_empty() {
                // Blank joins between multi-file diffs end the hunk body.
                if let Some(h) = current_hunk.take() {
                    hunks.push(h);
                }
            }
        }
    }

    flush_file(
        current_path.take(),
        is_new_file,
        is_deleted_file,
        std::mem::take(&mut hunks),
        current_hunk.take(),
    )?;

    if operations.is_empty() {
        return Err(PatchError::Unparseable {
            detail: "diff header present but no file operations parsed".to_string(),
        });
    }

    Ok(EditPlan::new(operations, PatchFormat::UnifiedDiff))
}

/// Apply hunks to `original`, validating context lines. The original's
/// trailing-newline presence is preserved.
pub fn apply_hunks(original: &str, hunks: &[Hunk]) -> Result<String, HunkMismatch> {
    let had_trailing_newline = original.ends_with('\n');
    let old_lines: Vec<&str> = original.lines().collect();
    let mut out: Vec<String> = Vec::with_capacity(old_lines.len());
    let mut cursor = 0usize; // 0-based index into old_lines

    for (hunk_index, hunk) in hunks.iter().enumerate() {
        let target = hunk.old_start.saturating_sub(1);
        if target < cursor {
            return Err(HunkMismatch {
                hunk_index,
                line: hunk.old_start,
                detail: "hunks overlap or are out of order".to_string(),
            });
        }
        if target > old_lines.len() {
            return Err(HunkMismatch {
                hunk_index,
                line: hunk.old_start,
                detail: format!(
                    "hunk starts at line {} but file has {} lines",
                    hunk.old_start,
                    old_lines.len()
                ),
            });
        }
        // Copy unchanged region before the hunk.
        out.extend(old_lines[cursor..target].iter().map(|s| s.to_string()));
        cursor = target;

        for line in &hunk.lines {
            match line {
                HunkLine::Context(expected) => {
                    match old_lines.get(cursor) {
                        Some(actual) if *actual == expected => {
                            out.push(expected.clone());
                            cursor += 1;
                        }
                        other => {
                            return Err(HunkMismatch {
                                hunk_index,
                                line: cursor + 1,
                                detail: format!(
                                    "context mismatch: expected {:?}, found {:?}",
                                    expected,
                                    other.copied().unwrap_or("<eof>")
                                ),
                            });
                        }
                    }
                }
                HunkLine::Remove(expected) => match old_lines.get(cursor) {
                    Some(actual) if *actual == expected => {
                        cursor += 1;
                    }
                    other => {
                        return Err(HunkMismatch {
                            hunk_index,
                            line: cursor + 1,
                            detail: format!(
                                "removal mismatch: expected {:?}, found {:?}",
                                expected,
                                other.copied().unwrap_or("<eof>")
                            ),
                        });
                    }
                },
                HunkLine::Add(text) => {
                    out.push(text.clone());
                }
            }
        }
    }

    out.extend(old_lines[cursor..].iter().map(|s| s.to_string()));

    let mut result = out.join("\n");
    if had_trailing_newline && !result.is_empty() {
        result.push('\n');
    }
    Ok(result)
}

/// Render operations back into unified-diff text. Span edits are not
/// representable as diffs and are omitted.
pub fn render(plan: &EditPlan) -> String {
    let mut out = String::new();
    for op in &plan.operations {
        match op {
            FileOperation::ModifyByDiff { path, hunks } => {
                out.push_str(&format!(
                    "diff --git a/{p} b/{p}\n--- a/{p}\n+++ b/{p}\n",
                    p = path
                ));
                for hunk in hunks {
                    out.push_str(&format!(
                        "@@ -{},{} +{},{} @@\n",
                        hunk.old_start, hunk.old_count, hunk.new_start, hunk.new_count
                    ));
                    for line in &hunk.lines {
                        match line {
                            HunkLine::Context(text) => out.push_str(&format!(" {}\n", text)),
                            HunkLine::Add(text) => out.push_str(&format!("+{}\n", text)),
                            HunkLine::Remove(text) => out.push_str(&format!("-{}\n", text)),
                        }
                    }
                }
            }
            FileOperation::Create { path, content } => {
                out.push_str(&format!(
                    "diff --git a/{p} b/{p}\nnew file mode 100644\n--- /dev/null\n+++ b/{p}\n",
                    p = path
                ));
                let lines: Vec<&str> = content.lines().collect();
                out.push_str(&format!("@@ -0,0 +1,{} @@\n", lines.len()));
                for line in lines {
                    out.push_str(&format!("+{}\n", line));
                }
            }
            FileOperation::Delete { path } => {
                out.push_str(&format!(
                    "diff --git a/{p} b/{p}\ndeleted file mode 100644\n--- a/{p}\n+++ /dev/null\n",
                    p = path
                ));
            }
            FileOperation::ModifyByReplaceAll { .. } | FileOperation::ReplaceSpans { .. } => {}
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIMPLE: &str = "diff --git a/src/a.py b/src/a.py\n\
--- a/src/a.py\n\
+++ b/src/a.py\n\
@@ -1,3 +1,3 @@\n \
keep\n\
-old\n\
+new\n \
tail\n";

    #[test]
    fn test_parse_single_file_modify() {
        let plan = parse(SIMPLE).unwrap();
        assert_eq!(plan.operations.len(), 1);
        match &plan.operations[0] {
            FileOperation::ModifyByDiff { path, hunks } => {
                assert_eq!(path, "src/a.py");
                assert_eq!(hunks.len(), 1);
                assert_eq!(hunks[0].lines.len(), 4);
            }
            other => panic!("Expected ModifyByDiff, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_new_file() {
        let text = "diff --git a/src/new.py b/src/new.py\n\
new file mode 100644\n\
--- /dev/null\n\
+++ b/src/new.py\n\
@@ -0,0 +1,2 @@\n\
+line one\n\
+line two\n";
        let plan = parse(text).unwrap();
        match &plan.operations[0] {
            FileOperation::Create { path, content } => {
                assert_eq!(path, "src/new.py");
                assert_eq!(content, "line one\nline two\n");
            }
            other => panic!("Expected Create, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_deleted_file() {
        let text = "diff --git a/src/gone.py b/src/gone.py\n\
deleted file mode 100644\n\
--- a/src/gone.py\n\
+++ /dev/null\n\
@@ -1,1 +0,0 @@\n\
-goodbye\n";
        let plan = parse(text).unwrap();
        assert_eq!(
            plan.operations[0],
            FileOperation::Delete {
                path: "src/gone.py".to_string()
            }
        );
    }

    #[test]
    fn test_parse_multi_file_joined_with_blank_line() {
        let text = format!(
            "{}\ndiff --git a/src/b.py b/src/b.py\n--- a/src/b.py\n+++ b/src/b.py\n@@ -1,1 +1,1 @@\n-x\n+y\n",
            SIMPLE
        );
        let plan = parse(&text).unwrap();
        assert_eq!(plan.operations.len(), 2);
        assert_eq!(plan.operations[1].path(), "src/b.py");
    }

    #[test]
    fn test_parse_tolerates_missing_trailing_newline() {
        let text = SIMPLE.trim_end();
        let plan = parse(text).unwrap();
        assert_eq!(plan.operations.len(), 1);
    }

    #[test]
    fn test_apply_hunks_happy_path() {
        let plan = parse(SIMPLE).unwrap();
        let FileOperation::ModifyByDiff { hunks, .. } = &plan.operations[0] else {
            panic!("wrong op");
        };
        let result = apply_hunks("keep\nold\ntail\n", hunks).unwrap();
        assert_eq!(result, "keep\nnew\ntail\n");
    }

    #[test]
    fn test_apply_hunks_context_mismatch() {
        let plan = parse(SIMPLE).unwrap();
        let FileOperation::ModifyByDiff { hunks, .. } = &plan.operations[0] else {
            panic!("wrong op");
        };
        let err = apply_hunks("keep\nsomething else\ntail\n", hunks).unwrap_err();
        assert_eq!(err.hunk_index, 0);
        assert!(err.detail.contains("mismatch"));
    }

    #[test]
    fn test_apply_hunks_preserves_no_trailing_newline() {
        let plan = parse(SIMPLE).unwrap();
        let FileOperation::ModifyByDiff { hunks, .. } = &plan.operations[0] else {
            panic!("wrong op");
        };
        let result = apply_hunks("keep\nold\ntail", hunks).unwrap();
        assert_eq!(result, "keep\nnew\ntail");
    }

    #[test]
    fn test_round_trip_after_normalization() {
        let text = format!(
            "{}diff --git a/src/new.py b/src/new.py\nnew file mode 100644\n--- /dev/null\n+++ b/src/new.py\n@@ -0,0 +1,1 @@\n+fresh\n\
diff --git a/src/gone.py b/src/gone.py\ndeleted file mode 100644\n--- a/src/gone.py\n+++ /dev/null\n",
            SIMPLE
        );
        let plan = parse(&text).unwrap();
        let rendered = render(&plan);
        let reparsed = parse(&rendered).unwrap();
        assert_eq!(plan.operations, reparsed.operations);
    }

    #[test]
    fn test_apply_hunks_beyond_eof() {
        let hunks = vec![Hunk {
            old_start: 10,
            old_count: 1,
            new_start: 10,
            new_count: 1,
            lines: vec![HunkLine::Remove("x".into()), HunkLine::Add("y".into())],
        }];
        assert!(apply_hunks("one\ntwo\n", &hunks).is_err());
    }
}
