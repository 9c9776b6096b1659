//! Hint packets: structured feedback from failed attempts, appended to the
//! next builder prompt. Hints accumulate across retries within an epoch
//! and are cleared by a replan.

use serde::{Deserialize, Serialize};

use crate::apply::ValidationError;
use crate::apply::paths::normalize_path;

/// A wrong → correct path transformation for a missed deliverable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliverableHint {
    /// The off-target path a previous attempt wrote, when one matches.
    pub wrong: Option<String>,
    pub correct: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HintPacket {
    pub missing_deliverables: Vec<DeliverableHint>,
    /// Common path prefix of the required deliverables, as a reminder.
    pub deliverable_prefix: Option<String>,
    pub scope_violations: Vec<String>,
    pub truncated: bool,
    pub notes: Vec<String>,
}

impl HintPacket {
    pub fn is_empty(&self) -> bool {
        self.missing_deliverables.is_empty()
            && self.scope_violations.is_empty()
            && !self.truncated
            && self.notes.is_empty()
    }

    /// Build hints from a governance rejection, pairing each missing
    /// deliverable with the touched path that looks like its off-by-a-prefix
    /// counterpart.
    pub fn from_validation(
        error: &ValidationError,
        touched_paths: &[String],
        deliverables: &[String],
    ) -> Self {
        let mut packet = HintPacket {
            deliverable_prefix: common_prefix(deliverables),
            ..Default::default()
        };

        match error {
            ValidationError::DeliverablesShort { missing } => {
                for correct in missing {
                    let base = basename(correct);
                    let wrong = touched_paths
                        .iter()
                        .find(|t| basename(t) == base && normalize_path(t) != normalize_path(correct))
                        .cloned();
                    packet.missing_deliverables.push(DeliverableHint {
                        wrong,
                        correct: correct.clone(),
                    });
                }
            }
            ValidationError::OutsideScope {
                path,
                nearest_scope,
            } => {
                let nearest = nearest_scope
                    .as_deref()
                    .map(|s| format!(" (nearest scope prefix: {})", s))
                    .unwrap_or_default();
                packet
                    .scope_violations
                    .push(format!("{} is outside the allowed scope{}", path, nearest));
            }
            ValidationError::ProtectedPath { path, pattern } => {
                packet
                    .scope_violations
                    .push(format!("{} is protected ({})", path, pattern));
            }
            other => {
                packet.notes.push(other.to_string());
            }
        }
        packet
    }

    pub fn note_truncation(&mut self) {
        self.truncated = true;
    }

    pub fn merge(&mut self, other: HintPacket) {
        for hint in other.missing_deliverables {
            if !self.missing_deliverables.contains(&hint) {
                self.missing_deliverables.push(hint);
            }
        }
        for violation in other.scope_violations {
            if !self.scope_violations.contains(&violation) {
                self.scope_violations.push(violation);
            }
        }
        for note in other.notes {
            if !self.notes.contains(&note) {
                self.notes.push(note);
            }
        }
        self.truncated |= other.truncated;
        if self.deliverable_prefix.is_none() {
            self.deliverable_prefix = other.deliverable_prefix;
        }
    }

    /// Render for the builder prompt.
    pub fn render(&self) -> String {
        if self.is_empty() {
            return String::new();
        }
        let mut out = String::from("## Corrections from previous attempts\n\n");

        if !self.missing_deliverables.is_empty() {
            out.push_str("Required files you have not produced yet:\n");
            for hint in &self.missing_deliverables {
                match &hint.wrong {
                    Some(wrong) => out.push_str(&format!(
                        "- you wrote {} but the required path is {}\n",
                        wrong, hint.correct
                    )),
                    None => out.push_str(&format!("- {}\n", hint.correct)),
                }
            }
        }
        if let Some(prefix) = &self.deliverable_prefix {
            out.push_str(&format!(
                "All deliverables live under the prefix: {}\n",
                prefix
            ));
        }
        if !self.scope_violations.is_empty() {
            out.push_str("Paths you must not touch again:\n");
            for violation in &self.scope_violations {
                out.push_str(&format!("- {}\n", violation));
            }
        }
        if self.truncated {
            out.push_str(
                "Your previous output was truncated. Emit complete files and nothing else.\n",
            );
        }
        for note in &self.notes {
            out.push_str(&format!("- {}\n", note));
        }
        out
    }
}

fn basename(path: &str) -> String {
    let normalized = normalize_path(path);
    normalized
        .rsplit('/')
        .next()
        .unwrap_or(&normalized)
        .to_string()
}

/// Longest common directory prefix of a set of paths.
pub fn common_prefix(paths: &[String]) -> Option<String> {
    if paths.len() < 2 {
        return None;
    }
    let normalized: Vec<Vec<String>> = paths
        .iter()
        .map(|p| normalize_path(p).split('/').map(|s| s.to_string()).collect())
        .collect();

    let first = &normalized[0];
    let mut shared = Vec::new();
    // The final component is a file name; only directories can be shared.
    for (i, component) in first.iter().enumerate().take(first.len().saturating_sub(1)) {
        if normalized
            .iter()
            .all(|p| i + 1 < p.len() && &p[i] == component)
        {
            shared.push(component.clone());
        } else {
            break;
        }
    }

    if shared.is_empty() {
        None
    } else {
        Some(shared.join("/"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deliverable_hint_pairs_wrong_with_correct() {
        let err = ValidationError::DeliverablesShort {
            missing: vec!["src/research/gatherers/github_gatherer.py".to_string()],
        };
        let touched = vec!["src/github_gatherer.py".to_string()];
        let packet = HintPacket::from_validation(&err, &touched, &[]);

        assert_eq!(packet.missing_deliverables.len(), 1);
        let hint = &packet.missing_deliverables[0];
        assert_eq!(hint.wrong.as_deref(), Some("src/github_gatherer.py"));
        assert_eq!(hint.correct, "src/research/gatherers/github_gatherer.py");

        let rendered = packet.render();
        assert!(rendered.contains("src/github_gatherer.py"));
        assert!(rendered.contains("src/research/gatherers/github_gatherer.py"));
    }

    #[test]
    fn test_scope_violation_hint() {
        let err = ValidationError::OutsideScope {
            path: "lib/helpers.py".to_string(),
            nearest_scope: Some("src/lib".to_string()),
        };
        let packet = HintPacket::from_validation(&err, &[], &[]);
        assert_eq!(packet.scope_violations.len(), 1);
        assert!(packet.scope_violations[0].contains("src/lib"));
    }

    #[test]
    fn test_merge_dedups_and_accumulates() {
        let err = ValidationError::DeliverablesShort {
            missing: vec!["src/a.py".to_string()],
        };
        let mut packet = HintPacket::from_validation(&err, &[], &[]);
        let again = HintPacket::from_validation(&err, &[], &[]);
        packet.merge(again);
        assert_eq!(packet.missing_deliverables.len(), 1);

        let mut other = HintPacket::default();
        other.note_truncation();
        packet.merge(other);
        assert!(packet.truncated);
    }

    #[test]
    fn test_common_prefix() {
        let paths = vec![
            "src/api/routes.py".to_string(),
            "src/api/models.py".to_string(),
        ];
        assert_eq!(common_prefix(&paths), Some("src/api".to_string()));

        let mixed = vec!["src/a.py".to_string(), "docs/b.md".to_string()];
        assert_eq!(common_prefix(&mixed), None);

        let single = vec!["src/a.py".to_string()];
        assert_eq!(common_prefix(&single), None);
    }

    #[test]
    fn test_empty_packet_renders_nothing() {
        assert_eq!(HintPacket::default().render(), "");
    }
}
