//! Patch formats and the normalized edit plan.
//!
//! The builder may produce any of three formats: a unified diff, a
//! full-file replacement set (`{"files": [...]}`), or an NDJSON stream of
//! structured edit operations. All parse into a single internal
//! representation, the `EditPlan`, which the governed apply path consumes.
//!
//! The parsers are tolerant: truncated NDJSON keeps its valid prefix,
//! malformed JSON goes through a bounded repair pass, and oversized
//! full-file payloads are auto-converted to the structured form. Every
//! repair is recorded for audit; repairs only drop or close, never invent.

pub mod fullfile;
pub mod ndjson;
pub mod repair;
pub mod unified;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::util::{extract_json_object, line_count};

/// Marker emitted in place of a real diff header when changes were applied
/// from an NDJSON stream. The applier must never feed such a blob to the
/// unified-diff parser.
pub const SYNTHETIC_NDJSON_HEADER: &str = "NDJSON Operations Applied";

/// Full-file mode is preferred up to this many lines (Bucket A).
pub const BUCKET_A_MAX_LINES: usize = 500;
/// Unified-diff mode is preferred up to this many lines (Bucket B);
/// beyond it (Bucket C) NDJSON structured edits are required.
pub const BUCKET_B_MAX_LINES: usize = 1000;

/// File size bucket driving the preferred patch mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SizeBucket {
    A,
    B,
    C,
}

pub fn bucket_for(lines: usize) -> SizeBucket {
    if lines <= BUCKET_A_MAX_LINES {
        SizeBucket::A
    } else if lines <= BUCKET_B_MAX_LINES {
        SizeBucket::B
    } else {
        SizeBucket::C
    }
}

/// Wire format a builder output arrived in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatchFormat {
    UnifiedDiff,
    FullFile,
    Ndjson,
}

/// One text span replacement inside a file. An empty `old_text` means
/// "append `new_text` at end of file".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpanEdit {
    pub old_text: String,
    pub new_text: String,
}

/// A normalized file operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FileOperation {
    Create {
        path: String,
        content: String,
    },
    ModifyByDiff {
        path: String,
        hunks: Vec<unified::Hunk>,
    },
    ModifyByReplaceAll {
        path: String,
        content: String,
    },
    ReplaceSpans {
        path: String,
        spans: Vec<SpanEdit>,
    },
    Delete {
        path: String,
    },
}

impl FileOperation {
    pub fn path(&self) -> &str {
        match self {
            Self::Create { path, .. }
            | Self::ModifyByDiff { path, .. }
            | Self::ModifyByReplaceAll { path, .. }
            | Self::ReplaceSpans { path, .. }
            | Self::Delete { path } => path,
        }
    }

    pub fn set_path(&mut self, new_path: String) {
        match self {
            Self::Create { path, .. }
            | Self::ModifyByDiff { path, .. }
            | Self::ModifyByReplaceAll { path, .. }
            | Self::ReplaceSpans { path, .. }
            | Self::Delete { path } => *path = new_path,
        }
    }

    pub fn is_delete(&self) -> bool {
        matches!(self, Self::Delete { .. })
    }

    pub fn is_create(&self) -> bool {
        matches!(self, Self::Create { .. })
    }
}

/// An operation the tolerant parser dropped, recorded for audit and hints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkippedOperation {
    pub line: usize,
    pub reason: String,
}

/// The normalized, ordered sequence of file operations plus parse audit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EditPlan {
    pub operations: Vec<FileOperation>,
    /// Non-fatal drops from the tolerant parsers.
    #[serde(default)]
    pub skipped: Vec<SkippedOperation>,
    /// Repairs applied to the raw output before parsing succeeded.
    #[serde(default)]
    pub repairs: Vec<String>,
    pub source_format: PatchFormat,
    /// Set when the payload arrived in one format and was auto-converted.
    #[serde(default)]
    pub converted_from: Option<PatchFormat>,
}

impl EditPlan {
    pub fn new(operations: Vec<FileOperation>, source_format: PatchFormat) -> Self {
        Self {
            operations,
            skipped: Vec::new(),
            repairs: Vec::new(),
            source_format,
            converted_from: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Distinct paths the plan touches, in first-seen order.
    pub fn touched_paths(&self) -> Vec<String> {
        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::new();
        for op in &self.operations {
            if seen.insert(op.path().to_string()) {
                out.push(op.path().to_string());
            }
        }
        out
    }

    /// Serialize to the NDJSON structured-edit form. Diff operations are
    /// not representable as NDJSON and are skipped with a record.
    pub fn to_ndjson(&self) -> String {
        ndjson::render(self)
    }
}

/// Parse failure after every tolerant path was exhausted.
#[derive(Debug, Error)]
pub enum PatchError {
    #[error("Builder output is empty")]
    EmptyOutput,

    #[error("Builder output is not a recognizable patch: {detail}")]
    Unparseable { detail: String },
}

/// Parse a builder output into an `EditPlan`, auto-detecting the format.
///
/// `force_structured` is set by the executor for phases that declare
/// Bucket-C files: full-file payloads are then converted to the NDJSON
/// form before applying.
pub fn parse_builder_output(text: &str, force_structured: bool) -> Result<EditPlan, PatchError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(PatchError::EmptyOutput);
    }

    // Synthetic headers record already-applied NDJSON changes; the payload
    // after the marker is an op stream, never a real diff.
    if trimmed.contains(SYNTHETIC_NDJSON_HEADER) {
        let body = trimmed
            .split_once(SYNTHETIC_NDJSON_HEADER)
            .map(|(_, rest)| rest)
            .unwrap_or(trimmed);
        return Ok(ndjson::parse(body));
    }

    if trimmed.contains("diff --git ") {
        return unified::parse(trimmed);
    }

    // Full-file JSON, possibly wrapped in prose.
    if let Some(json) = extract_json_object(trimmed) {
        if let Ok(ops) = fullfile::parse(&json) {
            return Ok(finish_fullfile(ops, force_structured, Vec::new()));
        }
    }

    // NDJSON op stream.
    let ndjson_plan = ndjson::parse(trimmed);
    if !ndjson_plan.operations.is_empty() {
        return Ok(ndjson_plan);
    }

    // Last resort: bounded JSON repair, then the full-file parser again.
    if let Some(outcome) = repair::repair_json(trimmed) {
        if let Ok(ops) = fullfile::parse(&outcome.repaired) {
            return Ok(finish_fullfile(ops, force_structured, outcome.repairs));
        }
    }

    Err(PatchError::Unparseable {
        detail: format!(
            "no diff header, no files payload, no NDJSON ops in {} bytes",
            trimmed.len()
        ),
    })
}

fn finish_fullfile(
    ops: Vec<FileOperation>,
    force_structured: bool,
    repairs: Vec<String>,
) -> EditPlan {
    let oversized = ops.iter().any(|op| match op {
        FileOperation::Create { content, .. } | FileOperation::ModifyByReplaceAll { content, .. } => {
            bucket_for(line_count(content)) == SizeBucket::C
        }
        _ => false,
    });

    let mut plan = EditPlan::new(ops, PatchFormat::FullFile);
    plan.repairs = repairs;
    if force_structured || oversized {
        plan.converted_from = Some(PatchFormat::FullFile);
        plan.source_format = PatchFormat::Ndjson;
    }
    plan
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_boundaries() {
        assert_eq!(bucket_for(0), SizeBucket::A);
        assert_eq!(bucket_for(500), SizeBucket::A);
        assert_eq!(bucket_for(501), SizeBucket::B);
        assert_eq!(bucket_for(1000), SizeBucket::B);
        assert_eq!(bucket_for(1001), SizeBucket::C);
    }

    #[test]
    fn test_detects_unified_diff() {
        let text = "diff --git a/src/a.py b/src/a.py\n--- a/src/a.py\n+++ b/src/a.py\n@@ -1,1 +1,1 @@\n-old\n+new\n";
        let plan = parse_builder_output(text, false).unwrap();
        assert_eq!(plan.source_format, PatchFormat::UnifiedDiff);
        assert_eq!(plan.operations.len(), 1);
    }

    #[test]
    fn test_detects_fullfile_wrapped_in_prose() {
        let text = r#"Here you go: {"files": [{"path": "src/a.py", "content": "print(1)\n"}]} done"#;
        let plan = parse_builder_output(text, false).unwrap();
        assert_eq!(plan.source_format, PatchFormat::FullFile);
        assert_eq!(plan.touched_paths(), vec!["src/a.py"]);
    }

    #[test]
    fn test_fullfile_forced_to_structured() {
        let text = r#"{"files": [{"path": "src/a.py", "content": "x = 1\n"}]}"#;
        let plan = parse_builder_output(text, true).unwrap();
        assert_eq!(plan.source_format, PatchFormat::Ndjson);
        assert_eq!(plan.converted_from, Some(PatchFormat::FullFile));
    }

    #[test]
    fn test_bucket_c_fullfile_auto_converts() {
        let big = "line\n".repeat(1500);
        let payload = serde_json::json!({"files": [{"path": "src/big.py", "content": big}]});
        let plan = parse_builder_output(&payload.to_string(), false).unwrap();
        assert_eq!(plan.source_format, PatchFormat::Ndjson);
        assert_eq!(plan.converted_from, Some(PatchFormat::FullFile));
    }

    #[test]
    fn test_detects_ndjson() {
        let text = "{\"op\": \"create\", \"file_path\": \"a.py\", \"content\": \"x\"}\n{\"op\": \"delete\", \"file_path\": \"b.py\"}\n";
        let plan = parse_builder_output(text, false).unwrap();
        assert_eq!(plan.source_format, PatchFormat::Ndjson);
        assert_eq!(plan.operations.len(), 2);
    }

    #[test]
    fn test_synthetic_header_skips_diff_parsing() {
        let text = format!(
            "{}\n{{\"op\": \"create\", \"file_path\": \"a.py\", \"content\": \"x\"}}\n",
            SYNTHETIC_NDJSON_HEADER
        );
        let plan = parse_builder_output(&text, false).unwrap();
        assert_eq!(plan.source_format, PatchFormat::Ndjson);
        assert_eq!(plan.operations.len(), 1);
    }

    #[test]
    fn test_repair_path_recovers_truncated_fullfile() {
        // Truncated mid-string: the repair pass closes it.
        let text = r#"{"files": [{"path": "src/a.py", "content": "x = 1"#;
        let plan = parse_builder_output(text, false).unwrap();
        assert!(!plan.repairs.is_empty());
        assert_eq!(plan.touched_paths(), vec!["src/a.py"]);
    }

    #[test]
    fn test_empty_output_rejected() {
        assert!(matches!(
            parse_builder_output("   \n", false),
            Err(PatchError::EmptyOutput)
        ));
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(matches!(
            parse_builder_output("I could not produce a patch, sorry.", false),
            Err(PatchError::Unparseable { .. })
        ));
    }
}
