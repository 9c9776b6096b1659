//! Size-bound guards, the new-file truncation heuristic, and the
//! cumulative deliverables check.

use std::path::Path;

use super::paths::normalize_path;
use crate::util::line_count;

/// A modification shrinking a file by more than this fraction requires the
/// phase's `allow_mass_deletion` opt-in.
pub const SHRINK_LIMIT: f64 = -0.60;
/// A modification growing a file by more than this fraction requires the
/// phase's `allow_mass_addition` opt-in.
pub const GROWTH_LIMIT: f64 = 2.00;

/// Line-count delta ratio for a modification. Zero-line originals are not
/// guarded (there is nothing meaningful to compare against).
pub fn size_delta_ratio(old_lines: usize, new_lines: usize) -> Option<f64> {
    if old_lines == 0 {
        return None;
    }
    Some((new_lines as f64 - old_lines as f64) / old_lines as f64)
}

/// Bounded lexical truncation heuristic for newly created files only.
/// Returns the reason when the content looks cut off mid-write.
pub fn looks_truncated(content: &str) -> Option<String> {
    if content.is_empty() {
        return None;
    }

    // Unterminated double-quoted string on the final non-empty line.
    if let Some(last) = content.lines().rev().find(|l| !l.trim().is_empty()) {
        let mut quotes = 0usize;
        let mut escaped = false;
        for ch in last.chars() {
            if escaped {
                escaped = false;
                continue;
            }
            match ch {
                '\\' => escaped = true,
                '"' => quotes += 1,
                _ => {}
            }
        }
        if quotes % 2 == 1 {
            return Some("unterminated string on final line".to_string());
        }
    }

    // Net-open brackets with the content ending mid-expression.
    if !content.ends_with('\n') {
        let mut depth: i64 = 0;
        let mut in_string = false;
        let mut escaped = false;
        for ch in content.chars() {
            if escaped {
                escaped = false;
                continue;
            }
            match ch {
                '\\' if in_string => escaped = true,
                '"' => in_string = !in_string,
                '{' | '[' | '(' if !in_string => depth += 1,
                '}' | ']' | ')' if !in_string => depth -= 1,
                _ => {}
            }
        }
        let last_char = content.trim_end_matches([' ', '\t']).chars().last();
        if depth > 0 && matches!(last_char, Some('{' | '[' | '(' | ',' | ':')) {
            return Some("unbalanced brackets at end of file".to_string());
        }

        // YAML document header opened but the document ends mid-stream.
        if content.starts_with("---\n") && !content[4..].contains("\n---") {
            return Some("unclosed YAML document header".to_string());
        }
    }

    None
}

/// Compute which required deliverable patterns are not satisfied by the
/// plan's touched paths or by files already present on disk. Disk presence
/// makes the check cumulative across attempts within the same epoch.
pub fn missing_deliverables(
    deliverables: &[String],
    touched_paths: &[String],
    workspace_root: &Path,
) -> Vec<String> {
    let touched: Vec<String> = touched_paths.iter().map(|p| normalize_path(p)).collect();

    deliverables
        .iter()
        .filter(|required| {
            let pattern = normalize_path(required);
            !deliverable_satisfied(&pattern, &touched, workspace_root)
        })
        .cloned()
        .collect()
}

fn deliverable_satisfied(pattern: &str, touched: &[String], workspace_root: &Path) -> bool {
    let is_glob = pattern.contains(['*', '?', '[']);

    if is_glob {
        let Ok(compiled) = glob::Pattern::new(pattern) else {
            return false;
        };
        if touched.iter().any(|t| compiled.matches(t)) {
            return true;
        }
        walkdir::WalkDir::new(workspace_root)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .any(|e| {
                e.path()
                    .strip_prefix(workspace_root)
                    .ok()
                    .map(|rel| compiled.matches(&normalize_path(&rel.to_string_lossy())))
                    .unwrap_or(false)
            })
    } else {
        touched.iter().any(|t| t == pattern) || workspace_root.join(pattern).is_file()
    }
}

/// Percentage form of a delta ratio, for error messages.
pub fn delta_pct(ratio: f64) -> i64 {
    (ratio * 100.0).round() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_size_delta_ratio() {
        assert_eq!(size_delta_ratio(0, 100), None);
        assert!((size_delta_ratio(100, 30).unwrap() - (-0.7)).abs() < 1e-9);
        assert!((size_delta_ratio(100, 350).unwrap() - 2.5).abs() < 1e-9);
    }

    #[test]
    fn test_truncation_unterminated_string() {
        let content = "x = \"hello\ny = 1\nz = \"oops";
        assert!(looks_truncated(content).is_some());
    }

    #[test]
    fn test_truncation_unbalanced_brackets() {
        let content = "def f():\n    return {\n        \"a\": [1, 2,";
        let reason = looks_truncated(content).unwrap();
        assert!(reason.contains("brackets"));
    }

    #[test]
    fn test_truncation_yaml_header() {
        let content = "---\nname: thing\non:";
        assert!(looks_truncated(content).is_some());
    }

    #[test]
    fn test_complete_file_passes() {
        let content = "def f():\n    return {\"a\": [1, 2]}\n";
        assert_eq!(looks_truncated(content), None);
    }

    #[test]
    fn test_balanced_yaml_doc_passes() {
        let content = "---\nname: thing\n---\nbody\n";
        assert_eq!(looks_truncated(content), None);
    }

    #[test]
    fn test_missing_deliverables_exact_path() {
        let dir = tempdir().unwrap();
        let deliverables = vec!["src/research/gatherers/github_gatherer.py".to_string()];

        let missing = missing_deliverables(
            &deliverables,
            &["src/github_gatherer.py".to_string()],
            dir.path(),
        );
        assert_eq!(missing, deliverables);

        let missing = missing_deliverables(
            &deliverables,
            &["src/research/gatherers/github_gatherer.py".to_string()],
            dir.path(),
        );
        assert!(missing.is_empty());
    }

    #[test]
    fn test_deliverables_cumulative_via_disk() {
        let dir = tempdir().unwrap();
        let nested = dir.path().join("src/research/gatherers");
        fs::create_dir_all(&nested).unwrap();
        fs::write(nested.join("github_gatherer.py"), "x = 1\n").unwrap();

        // A prior attempt already produced the file; this attempt touches
        // nothing relevant but the requirement is still satisfied.
        let deliverables = vec!["src/research/gatherers/github_gatherer.py".to_string()];
        let missing = missing_deliverables(&deliverables, &[], dir.path());
        assert!(missing.is_empty());
    }

    #[test]
    fn test_deliverables_glob_pattern() {
        let dir = tempdir().unwrap();
        let deliverables = vec!["src/api/*.py".to_string()];

        let missing =
            missing_deliverables(&deliverables, &["src/api/routes.py".to_string()], dir.path());
        assert!(missing.is_empty());

        let missing = missing_deliverables(&deliverables, &["src/api.py".to_string()], dir.path());
        assert_eq!(missing.len(), 1);
    }
}
