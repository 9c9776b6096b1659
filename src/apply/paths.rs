//! Path normalization and scope/protection matching.
//!
//! Every comparison in the governed apply path goes through
//! `normalize_path`; raw path strings are never compared directly anywhere
//! else. Comparisons use POSIX form.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

use crate::run::RunType;

/// Normalize a repository-relative path for comparison:
/// trim whitespace, `\` → `/`, strip a drive-letter prefix, strip leading
/// `./` and `/`, collapse repeated separators, drop interior `/./` and any
/// trailing separator.
pub fn normalize_path(raw: &str) -> String {
    let mut s = raw.trim().replace('\\', "/");

    let bytes = s.as_bytes();
    if bytes.len() >= 2 && bytes[1] == b':' && bytes[0].is_ascii_alphabetic() {
        s = s[2..].to_string();
    }

    loop {
        if let Some(rest) = s.strip_prefix("./") {
            s = rest.to_string();
        } else if let Some(rest) = s.strip_prefix('/') {
            s = rest.to_string();
        } else {
            break;
        }
    }

    while s.contains("//") {
        s = s.replace("//", "/");
    }
    while s.contains("/./") {
        s = s.replace("/./", "/");
    }
    while s.ends_with('/') {
        s.truncate(s.len() - 1);
    }

    s
}

/// Whether `path` sits under `prefix`, both already normalized. Matching is
/// component-aware: `src/foo` contains `src/foo/bar.py` but not
/// `src/foobar.py`.
pub fn is_within_prefix(path: &str, prefix: &str) -> bool {
    let path = normalize_path(path);
    let prefix = normalize_path(prefix);
    if prefix.is_empty() {
        return true;
    }
    path == prefix || path.starts_with(&format!("{}/", prefix))
}

/// Whether `path` is inside any scope prefix.
pub fn in_scope(path: &str, scope_paths: &[String]) -> bool {
    scope_paths.iter().any(|p| is_within_prefix(path, p))
}

/// The scope prefix sharing the longest common path with `path`, used to
/// synthesize `wrong → correct` hints for off-scope writes.
pub fn nearest_scope_prefix(path: &str, scope_paths: &[String]) -> Option<String> {
    let path = normalize_path(path);
    scope_paths
        .iter()
        .map(|p| (p, common_components(&path, &normalize_path(p))))
        .max_by_key(|(_, shared)| *shared)
        .map(|(p, _)| p.clone())
}

fn common_components(a: &str, b: &str) -> usize {
    a.split('/')
        .zip(b.split('/'))
        .take_while(|(x, y)| x == y)
        .count()
}

/// Runtime-read protected path patterns. Violations require an approval
/// token; in `project_build` runs the orchestrator's own source, tests,
/// docs, and config trees are protected as well.
#[derive(Debug, Clone)]
pub struct ProtectedPaths {
    patterns: Vec<glob::Pattern>,
}

const BASE_PROTECTED: &[&str] = &[
    ".git/**",
    ".github/**",
    "config/models.yaml",
    "config/baseline_policy.yaml",
    "config/protection_and_retention_policy.yaml",
];

const PROJECT_BUILD_PROTECTED: &[&str] = &[
    "src/autopack/**",
    "tests/**",
    "docs/**",
    "config/**",
];

#[derive(Debug, Deserialize)]
struct PolicyFile {
    #[serde(default)]
    protected: Vec<String>,
}

impl ProtectedPaths {
    pub fn for_run(run_type: RunType) -> Self {
        let mut patterns: Vec<&str> = BASE_PROTECTED.to_vec();
        if run_type == RunType::ProjectBuild {
            patterns.extend(PROJECT_BUILD_PROTECTED);
        }
        Self {
            patterns: patterns
                .iter()
                .filter_map(|p| glob::Pattern::new(p).ok())
                .collect(),
        }
    }

    /// Load extra patterns from a YAML policy file, layered on top of the
    /// built-in list for the run type.
    pub fn from_policy_file(path: &Path, run_type: RunType) -> Result<Self> {
        let mut this = Self::for_run(run_type);
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read protection policy: {}", path.display()))?;
        let policy: PolicyFile = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse protection policy: {}", path.display()))?;
        for raw in policy.protected {
            let pattern = glob::Pattern::new(&raw)
                .with_context(|| format!("Invalid protection pattern: {}", raw))?;
            this.patterns.push(pattern);
        }
        Ok(this)
    }

    /// The first pattern protecting `path`, if any.
    pub fn matched(&self, path: &str) -> Option<String> {
        let normalized = normalize_path(path);
        self.patterns
            .iter()
            .find(|p| p.matches(&normalized))
            .map(|p| p.as_str().to_string())
    }
}
