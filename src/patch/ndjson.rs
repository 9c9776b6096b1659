//! NDJSON structured edits: one JSON operation object per line.
//!
//! The parser is truncation-tolerant: a parse error at line *n* preserves
//! every operation before it and records the drop as a `SkippedOperation`.
//! A `replace_all` with an empty `old_text` and no content is a logged
//! no-op, not a hard error.

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::{EditPlan, FileOperation, PatchFormat, SkippedOperation, SpanEdit};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawOp {
    op: String,
    file_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    old_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    new_text: Option<String>,
    /// Anchor text for `insert`: the new content lands immediately after it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    after: Option<String>,
}

/// Parse an NDJSON op stream. Never fails: invalid lines become skips.
pub fn parse(text: &str) -> EditPlan {
    let mut operations = Vec::new();
    let mut skipped = Vec::new();

    let lines: Vec<(usize, &str)> = text
        .lines()
        .enumerate()
        .map(|(i, l)| (i + 1, l.trim()))
        .filter(|(_, l)| !l.is_empty())
        .collect();

    for (pos, (line_no, line)) in lines.iter().enumerate() {
        let raw: RawOp = match serde_json::from_str(line) {
            Ok(raw) => raw,
            Err(e) => {
                skipped.push(SkippedOperation {
                    line: *line_no,
                    reason: format!("parse error: {}", e),
                });
                // Operations after a torn line are unusable: the stream was
                // likely truncated mid-write. Record the drop and stop.
                if pos + 1 < lines.len() {
                    skipped.push(SkippedOperation {
                        line: lines[pos + 1].0,
                        reason: format!(
                            "{} trailing line(s) dropped after parse error",
                            lines.len() - pos - 1
                        ),
                    });
                }
                break;
            }
        };

        match raw.op.as_str() {
            "create" => match raw.content {
                Some(content) => operations.push(FileOperation::Create {
                    path: raw.file_path,
                    content,
                }),
                None => skipped.push(SkippedOperation {
                    line: *line_no,
                    reason: "create without content".to_string(),
                }),
            },
            "replace_all" => match raw.content {
                Some(content) => operations.push(FileOperation::ModifyByReplaceAll {
                    path: raw.file_path,
                    content,
                }),
                None => {
                    if raw.old_text.as_deref() == Some("") {
                        warn!(file = %raw.file_path, "replace_all with empty old_text: no-op");
                    } else {
                        skipped.push(SkippedOperation {
                            line: *line_no,
                            reason: "replace_all without content".to_string(),
                        });
                    }
                }
            },
            "replace_span" => match (raw.old_text, raw.new_text) {
                (Some(old_text), Some(new_text)) => operations.push(FileOperation::ReplaceSpans {
                    path: raw.file_path,
                    spans: vec![SpanEdit { old_text, new_text }],
                }),
                _ => skipped.push(SkippedOperation {
                    line: *line_no,
                    reason: "replace_span requires old_text and new_text".to_string(),
                }),
            },
            "insert" => match raw.content {
                Some(content) => {
                    // Anchored insert becomes a span replacement; with no
                    // anchor the span's empty old_text means append-at-end.
                    let span = match raw.after {
                        Some(after) if !after.is_empty() => SpanEdit {
                            new_text: format!("{}{}", after, content),
                            old_text: after,
                        },
                        _ => SpanEdit {
                            old_text: String::new(),
                            new_text: content,
                        },
                    };
                    operations.push(FileOperation::ReplaceSpans {
                        path: raw.file_path,
                        spans: vec![span],
                    });
                }
                None => skipped.push(SkippedOperation {
                    line: *line_no,
                    reason: "insert without content".to_string(),
                }),
            },
            "delete" => operations.push(FileOperation::Delete {
                path: raw.file_path,
            }),
            other => skipped.push(SkippedOperation {
                line: *line_no,
                reason: format!("unknown op '{}'", other),
            }),
        }
    }

    let mut plan = EditPlan::new(operations, PatchFormat::Ndjson);
    plan.skipped = skipped;
    plan
}

/// Render a plan as an NDJSON stream. Diff operations cannot be expressed
/// as structured edits and are omitted.
pub fn render(plan: &EditPlan) -> String {
    let mut out = String::new();
    for op in &plan.operations {
        let raw = match op {
            FileOperation::Create { path, content } => RawOp {
                op: "create".to_string(),
                file_path: path.clone(),
                content: Some(content.clone()),
                old_text: None,
                new_text: None,
                after: None,
            },
            FileOperation::ModifyByReplaceAll { path, content } => RawOp {
                op: "replace_all".to_string(),
                file_path: path.clone(),
                content: Some(content.clone()),
                old_text: None,
                new_text: None,
                after: None,
            },
            FileOperation::ReplaceSpans { path, spans } => {
                for span in spans {
                    let raw = RawOp {
                        op: "replace_span".to_string(),
                        file_path: path.clone(),
                        content: None,
                        old_text: Some(span.old_text.clone()),
                        new_text: Some(span.new_text.clone()),
                        after: None,
                    };
                    if let Ok(line) = serde_json::to_string(&raw) {
                        out.push_str(&line);
                        out.push('\n');
                    }
                }
                continue;
            }
            FileOperation::Delete { path } => RawOp {
                op: "delete".to_string(),
                file_path: path.clone(),
                content: None,
                old_text: None,
                new_text: None,
                after: None,
            },
            FileOperation::ModifyByDiff { .. } => continue,
        };
        if let Ok(line) = serde_json::to_string(&raw) {
            out.push_str(&line);
            out.push('\n');
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_all_op_kinds() {
        let text = concat!(
            "{\"op\":\"create\",\"file_path\":\"a.py\",\"content\":\"x\\n\"}\n",
            "{\"op\":\"replace_all\",\"file_path\":\"b.py\",\"content\":\"y\\n\"}\n",
            "{\"op\":\"replace_span\",\"file_path\":\"c.py\",\"old_text\":\"foo\",\"new_text\":\"bar\"}\n",
            "{\"op\":\"insert\",\"file_path\":\"d.py\",\"content\":\"z\\n\"}\n",
            "{\"op\":\"delete\",\"file_path\":\"e.py\"}\n",
        );
        let plan = parse(text);
        assert_eq!(plan.operations.len(), 5);
        assert!(plan.skipped.is_empty());
    }

    #[test]
    fn test_truncated_stream_keeps_prefix() {
        let text = concat!(
            "{\"op\":\"create\",\"file_path\":\"a.py\",\"content\":\"x\"}\n",
            "{\"op\":\"create\",\"file_path\":\"b.py\",\"cont",
        );
        let plan = parse(text);
        assert_eq!(plan.operations.len(), 1);
        assert_eq!(plan.operations[0].path(), "a.py");
        assert_eq!(plan.skipped.len(), 1);
        assert!(plan.skipped[0].reason.contains("parse error"));
    }

    #[test]
    fn test_torn_line_drops_trailing_ops() {
        let text = concat!(
            "{\"op\":\"create\",\"file_path\":\"a.py\",\"content\":\"x\"}\n",
            "{broken\n",
            "{\"op\":\"delete\",\"file_path\":\"c.py\"}\n",
        );
        let plan = parse(text);
        assert_eq!(plan.operations.len(), 1);
        assert_eq!(plan.skipped.len(), 2);
        assert!(plan.skipped[1].reason.contains("trailing"));
    }

    #[test]
    fn test_replace_all_empty_old_text_is_noop() {
        let text = "{\"op\":\"replace_all\",\"file_path\":\"a.py\",\"old_text\":\"\"}\n";
        let plan = parse(text);
        assert!(plan.operations.is_empty());
        assert!(plan.skipped.is_empty());
    }

    #[test]
    fn test_unknown_op_is_skipped_not_fatal() {
        let text = concat!(
            "{\"op\":\"rotate\",\"file_path\":\"a.py\"}\n",
            "{\"op\":\"delete\",\"file_path\":\"b.py\"}\n",
        );
        let plan = parse(text);
        assert_eq!(plan.operations.len(), 1);
        assert_eq!(plan.skipped.len(), 1);
        assert!(plan.skipped[0].reason.contains("rotate"));
    }

    #[test]
    fn test_anchored_insert_becomes_span() {
        let text =
            "{\"op\":\"insert\",\"file_path\":\"a.py\",\"content\":\"new\",\"after\":\"anchor\"}\n";
        let plan = parse(text);
        match &plan.operations[0] {
            FileOperation::ReplaceSpans { spans, .. } => {
                assert_eq!(spans[0].old_text, "anchor");
                assert_eq!(spans[0].new_text, "anchornew");
            }
            other => panic!("Expected ReplaceSpans, got {:?}", other),
        }
    }

    #[test]
    fn test_round_trip_after_normalization() {
        let text = concat!(
            "{\"op\":\"create\",\"file_path\":\"a.py\",\"content\":\"x\\n\"}\n",
            "{\"op\":\"replace_span\",\"file_path\":\"c.py\",\"old_text\":\"foo\",\"new_text\":\"bar\"}\n",
            "{\"op\":\"delete\",\"file_path\":\"e.py\"}\n",
        );
        let plan = parse(text);
        let rendered = render(&plan);
        let reparsed = parse(&rendered);
        assert_eq!(plan.operations, reparsed.operations);
    }
}
