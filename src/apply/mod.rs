//! Governed apply path: the sole writer to the workspace during execution.
//!
//! `GovernedApply::apply` runs the full validation sequence over a
//! normalized `EditPlan`: scope enforcement, protected-path checks,
//! create-existing conversion, size-bound guards, the truncation heuristic
//! for new files, and the cumulative deliverables check. It then commits the
//! plan atomically through a staging overlay with a rollback manifest.
//!
//! Governance rejections are `ValidationError` values carrying enough
//! detail to synthesize the next attempt's hints. They never crash the
//! executor; IO failures are reported separately as internal errors.

pub mod guards;
pub mod paths;
pub mod staging;

use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

use crate::patch::{EditPlan, FileOperation, SpanEdit};
use crate::phase::PhaseScope;
use crate::run::RunType;
use guards::{GROWTH_LIMIT, SHRINK_LIMIT};
use paths::{ProtectedPaths, in_scope, nearest_scope_prefix, normalize_path};
use staging::{BackupManifest, Stage};

/// A governance rejection. Each variant carries what hint generation needs.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("Path {path} is outside every scope prefix")]
    OutsideScope {
        path: String,
        nearest_scope: Option<String>,
    },

    #[error("Path {path} is protected by pattern {pattern}")]
    ProtectedPath { path: String, pattern: String },

    #[error("Modification shrinks {path} by {delta_pct}% without allow_mass_deletion")]
    SuspiciousShrinkage { path: String, delta_pct: i64 },

    #[error("Modification grows {path} by {delta_pct}% without allow_mass_addition")]
    SuspiciousGrowth { path: String, delta_pct: i64 },

    #[error("New file {path} looks truncated: {reason}")]
    TruncatedNewFile { path: String, reason: String },

    #[error("Required deliverables missing: {missing:?}")]
    DeliverablesShort { missing: Vec<String> },

    #[error("Hunk {hunk_index} does not match {path}: {detail}")]
    PatchHunkMismatch {
        path: String,
        hunk_index: usize,
        detail: String,
    },

    #[error("Span not found in {path}: {span:?}")]
    SpanNotFound { path: String, span: String },

    #[error("Edit plan contains no operations")]
    EmptyPlan,
}

/// Apply failure: either a governance rejection or an internal fault.
#[derive(Debug, Error)]
pub enum ApplyError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Apply failed internally: {0}")]
    Internal(#[from] anyhow::Error),
}

/// Everything the applier needs to judge one plan.
pub struct ApplyRequest<'a> {
    pub plan: &'a EditPlan,
    pub scope: &'a PhaseScope,
    pub deliverables: &'a [String],
    pub run_type: RunType,
    pub allow_mass_deletion: bool,
    pub allow_mass_addition: bool,
    /// Approval token permitting protected-path writes for this request.
    pub approval_token: Option<&'a str>,
}

/// Outcome of a committed apply.
#[derive(Debug, Clone)]
pub struct ApplyResult {
    pub touched_paths: Vec<String>,
    /// SHA-256 over the materialized change set.
    pub patch_hash: String,
    /// CREATE operations converted to whole-file replaces because the
    /// target already existed.
    pub converted_creates: Vec<String>,
    /// Path of the rollback manifest written for this apply.
    pub backup_manifest: PathBuf,
}

pub struct GovernedApply {
    workspace_root: PathBuf,
    /// Off-workspace directory for staging overlays and backup manifests.
    staging_root: PathBuf,
    protected: ProtectedPaths,
}

impl GovernedApply {
    pub fn new(workspace_root: &Path, staging_root: &Path, protected: ProtectedPaths) -> Self {
        Self {
            workspace_root: workspace_root.to_path_buf(),
            staging_root: staging_root.to_path_buf(),
            protected,
        }
    }

    /// Validate and atomically apply an edit plan.
    pub fn apply(&self, req: &ApplyRequest<'_>) -> Result<ApplyResult, ApplyError> {
        if req.plan.is_empty() {
            return Err(ValidationError::EmptyPlan.into());
        }

        // Normalize every target path once; all later checks compare the
        // normalized form.
        let mut ops: Vec<FileOperation> = req.plan.operations.clone();
        for op in &mut ops {
            let normalized = normalize_path(op.path());
            op.set_path(normalized);
        }

        // Scope enforcement.
        for op in &ops {
            if !in_scope(op.path(), &req.scope.paths) {
                return Err(ValidationError::OutsideScope {
                    path: op.path().to_string(),
                    nearest_scope: nearest_scope_prefix(op.path(), &req.scope.paths),
                }
                .into());
            }
        }

        // Protected-path check; an approval token exempts the request.
        if req.approval_token.is_none() {
            for op in &ops {
                if let Some(pattern) = self.protected.matched(op.path()) {
                    return Err(ValidationError::ProtectedPath {
                        path: op.path().to_string(),
                        pattern,
                    }
                    .into());
                }
            }
        }

        // Create-existing conversion: never fail a patch because the
        // builder used CREATE on a file that is already on disk.
        let mut converted_creates = Vec::new();
        for op in &mut ops {
            if op.is_create() && self.workspace_root.join(op.path()).exists() {
                let FileOperation::Create { path, content } = op.clone() else {
                    unreachable!()
                };
                debug!(path = %path, "converting CREATE of existing file to replace-all");
                converted_creates.push(path.clone());
                *op = FileOperation::ModifyByReplaceAll { path, content };
            }
        }

        // Materialize final contents, validating hunks and spans against
        // what is on disk right now.
        let materialized = self.materialize(&ops)?;

        // Size-bound guards on modifications; truncation heuristic on new
        // files only.
        for change in &materialized {
            match change {
                Materialized::Write {
                    path,
                    old_lines: Some(old_lines),
                    content,
                    ..
                } => {
                    if let Some(ratio) =
                        guards::size_delta_ratio(*old_lines, crate::util::line_count(content))
                    {
                        if ratio < SHRINK_LIMIT && !req.allow_mass_deletion {
                            return Err(ValidationError::SuspiciousShrinkage {
                                path: path.clone(),
                                delta_pct: guards::delta_pct(ratio),
                            }
                            .into());
                        }
                        if ratio > GROWTH_LIMIT && !req.allow_mass_addition {
                            return Err(ValidationError::SuspiciousGrowth {
                                path: path.clone(),
                                delta_pct: guards::delta_pct(ratio),
                            }
                            .into());
                        }
                    }
                }
                Materialized::Write {
                    path,
                    old_lines: None,
                    content,
                    ..
                } => {
                    if let Some(reason) = guards::looks_truncated(content) {
                        return Err(ValidationError::TruncatedNewFile {
                            path: path.clone(),
                            reason,
                        }
                        .into());
                    }
                }
                Materialized::Delete { .. } => {}
            }
        }

        // Deliverables: cumulative across attempts via disk union.
        let touched: Vec<String> = materialized.iter().map(|m| m.path().to_string()).collect();
        let missing = guards::missing_deliverables(req.deliverables, &touched, &self.workspace_root);
        if !missing.is_empty() {
            return Err(ValidationError::DeliverablesShort { missing }.into());
        }

        // Commit through the staging overlay.
        let patch_hash = hash_change_set(&materialized);
        let mut stage = Stage::new(&self.workspace_root, &self.staging_root)
            .map_err(ApplyError::Internal)?;
        for change in &materialized {
            match change {
                Materialized::Write { path, content, .. } => {
                    stage.stage_write(path, content.clone())
                }
                Materialized::Delete { path } => stage.stage_delete(path),
            }
        }
        let manifest_path = self
            .staging_root
            .join(format!("apply-{}.manifest.json", &patch_hash[..16]));
        stage.commit(&manifest_path).map_err(ApplyError::Internal)?;

        info!(
            files = touched.len(),
            patch_hash = %&patch_hash[..16],
            "apply committed"
        );

        Ok(ApplyResult {
            touched_paths: touched,
            patch_hash,
            converted_creates,
            backup_manifest: manifest_path,
        })
    }

    /// Roll the workspace back to the state recorded by a prior apply.
    pub fn rollback(&self, manifest_path: &Path) -> Result<(), ApplyError> {
        let manifest = BackupManifest::load(manifest_path).map_err(ApplyError::Internal)?;
        staging::restore_from_manifest(&self.workspace_root, &manifest)
            .map_err(ApplyError::Internal)?;
        info!(manifest = %manifest_path.display(), "workspace rolled back");
        Ok(())
    }

    fn materialize(&self, ops: &[FileOperation]) -> Result<Vec<Materialized>, ApplyError> {
        // Later operations see earlier ones' output for the same file.
        let mut pending: HashMap<String, Option<String>> = HashMap::new();
        let mut order: Vec<String> = Vec::new();

        for op in ops {
            let path = op.path().to_string();
            if !pending.contains_key(&path) {
                order.push(path.clone());
            }

            let current: Option<(String, bool)> = match pending.get(&path) {
                Some(Some(content)) => Some((content.clone(), false)),
                Some(None) => None,
                None => {
                    let disk = self.workspace_root.join(&path);
                    if disk.is_file() {
                        let content = std::fs::read_to_string(&disk).map_err(|e| {
                            ApplyError::Internal(anyhow::anyhow!(
                                "failed to read {}: {}",
                                path,
                                e
                            ))
                        })?;
                        Some((content, true))
                    } else {
                        None
                    }
                }
            };

            let next: Option<String> = match op {
                FileOperation::Create { content, .. } => Some(content.clone()),
                FileOperation::ModifyByReplaceAll { content, .. } => Some(content.clone()),
                FileOperation::Delete { .. } => None,
                FileOperation::ModifyByDiff { hunks, .. } => {
                    let (base, _) = current.clone().unwrap_or_default();
                    match crate::patch::unified::apply_hunks(&base, hunks) {
                        Ok(content) => Some(content),
                        Err(mismatch) => {
                            return Err(ValidationError::PatchHunkMismatch {
                                path,
                                hunk_index: mismatch.hunk_index,
                                detail: mismatch.detail,
                            }
                            .into());
                        }
                    }
                }
                FileOperation::ReplaceSpans { spans, .. } => {
                    let (mut base, _) = current.clone().unwrap_or_default();
                    for span in spans {
                        base = apply_span(&base, span).ok_or_else(|| {
                            ValidationError::SpanNotFound {
                                path: path.clone(),
                                span: preview(&span.old_text),
                            }
                        })?;
                    }
                    Some(base)
                }
            };

            pending.insert(path, next);
        }

        let mut out = Vec::new();
        for path in order {
            let disk = self.workspace_root.join(&path);
            let old_lines = if disk.is_file() {
                std::fs::read_to_string(&disk)
                    .ok()
                    .map(|c| crate::util::line_count(&c))
            } else {
                None
            };
            match pending.remove(&path).flatten() {
                Some(content) => out.push(Materialized::Write {
                    path,
                    content,
                    old_lines,
                }),
                None => out.push(Materialized::Delete { path }),
            }
        }
        Ok(out)
    }
}

/// A materialized change: the final content (or deletion) for one path.
#[derive(Debug, Clone)]
enum Materialized {
    Write {
        path: String,
        content: String,
        /// Line count of the on-disk original; `None` for new files.
        old_lines: Option<usize>,
    },
    Delete {
        path: String,
    },
}

impl Materialized {
    fn path(&self) -> &str {
        match self {
            Self::Write { path, .. } | Self::Delete { path } => path,
        }
    }
}

fn apply_span(base: &str, span: &SpanEdit) -> Option<String> {
    if span.old_text.is_empty() {
        // Empty old_text is append-at-end.
        let mut out = base.to_string();
        out.push_str(&span.new_text);
        return Some(out);
    }
    base.find(&span.old_text)
        .map(|idx| format!("{}{}{}", &base[..idx], span.new_text, &base[idx + span.old_text.len()..]))
}

fn preview(text: &str) -> String {
    let mut p: String = text.chars().take(60).collect();
    if text.chars().count() > 60 {
        p.push('…');
    }
    p
}

fn hash_change_set(changes: &[Materialized]) -> String {
    let mut hasher = Sha256::new();
    for change in changes {
        match change {
            Materialized::Write { path, content, .. } => {
                hasher.update(b"W");
                hasher.update(path.as_bytes());
                hasher.update(b"\x00");
                hasher.update(content.as_bytes());
                hasher.update(b"\x00");
            }
            Materialized::Delete { path } => {
                hasher.update(b"D");
                hasher.update(path.as_bytes());
                hasher.update(b"\x00");
            }
        }
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patch::{EditPlan, PatchFormat};
    use std::fs;
    use tempfile::tempdir;

    struct Fixture {
        ws: tempfile::TempDir,
        staging: tempfile::TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                ws: tempdir().unwrap(),
                staging: tempdir().unwrap(),
            }
        }

        fn applier(&self, run_type: RunType) -> GovernedApply {
            GovernedApply::new(
                self.ws.path(),
                self.staging.path(),
                ProtectedPaths::for_run(run_type),
            )
        }

        fn write(&self, rel: &str, content: &str) {
            let path = self.ws.path().join(rel);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, content).unwrap();
        }
    }

    fn scope(paths: &[&str]) -> PhaseScope {
        PhaseScope {
            paths: paths.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    fn request<'a>(plan: &'a EditPlan, scope: &'a PhaseScope) -> ApplyRequest<'a> {
        ApplyRequest {
            plan,
            scope,
            deliverables: &[],
            run_type: RunType::AutopackMaintenance,
            allow_mass_deletion: false,
            allow_mass_addition: false,
            approval_token: None,
        }
    }

    fn plan(ops: Vec<FileOperation>) -> EditPlan {
        EditPlan::new(ops, PatchFormat::Ndjson)
    }

    #[test]
    fn test_apply_create_in_scope() {
        let fx = Fixture::new();
        let applier = fx.applier(RunType::AutopackMaintenance);
        let sc = scope(&["src"]);
        let p = plan(vec![FileOperation::Create {
            path: "src/a.py".into(),
            content: "x = 1\n".into(),
        }]);

        let result = applier.apply(&request(&p, &sc)).unwrap();
        assert_eq!(result.touched_paths, vec!["src/a.py"]);
        assert_eq!(
            fs::read_to_string(fx.ws.path().join("src/a.py")).unwrap(),
            "x = 1\n"
        );
    }

    #[test]
    fn test_outside_scope_rejected_with_nearest_hint() {
        let fx = Fixture::new();
        let applier = fx.applier(RunType::AutopackMaintenance);
        let sc = scope(&["src/research/gatherers"]);
        let p = plan(vec![FileOperation::Create {
            path: "src/github_gatherer.py".into(),
            content: "x\n".into(),
        }]);

        let err = applier.apply(&request(&p, &sc)).unwrap_err();
        match err {
            ApplyError::Validation(ValidationError::OutsideScope { path, nearest_scope }) => {
                assert_eq!(path, "src/github_gatherer.py");
                assert_eq!(nearest_scope.as_deref(), Some("src/research/gatherers"));
            }
            other => panic!("Expected OutsideScope, got {:?}", other),
        }
    }

    #[test]
    fn test_native_separator_path_is_in_scope() {
        let fx = Fixture::new();
        let applier = fx.applier(RunType::AutopackMaintenance);
        let sc = scope(&["src/foo"]);
        let p = plan(vec![FileOperation::Create {
            path: ".\\src\\foo\\bar.py".into(),
            content: "ok\n".into(),
        }]);

        let result = applier.apply(&request(&p, &sc)).unwrap();
        assert_eq!(result.touched_paths, vec!["src/foo/bar.py"]);
    }

    #[test]
    fn test_protected_path_rejected_without_token() {
        let fx = Fixture::new();
        let applier = fx.applier(RunType::ProjectBuild);
        let sc = scope(&["config"]);
        let p = plan(vec![FileOperation::Create {
            path: "config/models.yaml".into(),
            content: "models: []\n".into(),
        }]);

        let err = applier.apply(&request(&p, &sc)).unwrap_err();
        assert!(matches!(
            err,
            ApplyError::Validation(ValidationError::ProtectedPath { .. })
        ));

        // An approval token exempts the request.
        let mut req = request(&p, &sc);
        req.approval_token = Some("appr-1");
        assert!(applier.apply(&req).is_ok());
    }

    #[test]
    fn test_create_existing_converts_to_replace() {
        let fx = Fixture::new();
        fx.write("src/a.py", "old\n");
        let applier = fx.applier(RunType::AutopackMaintenance);
        let sc = scope(&["src"]);
        let p = plan(vec![FileOperation::Create {
            path: "src/a.py".into(),
            content: "new\n".into(),
        }]);

        let result = applier.apply(&request(&p, &sc)).unwrap();
        assert_eq!(result.converted_creates, vec!["src/a.py"]);
        assert_eq!(
            fs::read_to_string(fx.ws.path().join("src/a.py")).unwrap(),
            "new\n"
        );
    }

    #[test]
    fn test_suspicious_shrinkage_requires_opt_in() {
        let fx = Fixture::new();
        let original: String = (0..100).map(|i| format!("line {}\n", i)).collect();
        fx.write("src/a.py", &original);
        let applier = fx.applier(RunType::AutopackMaintenance);
        let sc = scope(&["src"]);
        let p = plan(vec![FileOperation::ModifyByReplaceAll {
            path: "src/a.py".into(),
            content: "tiny\n".into(),
        }]);

        let err = applier.apply(&request(&p, &sc)).unwrap_err();
        assert!(matches!(
            err,
            ApplyError::Validation(ValidationError::SuspiciousShrinkage { .. })
        ));

        let mut req = request(&p, &sc);
        req.allow_mass_deletion = true;
        assert!(applier.apply(&req).is_ok());
    }

    #[test]
    fn test_suspicious_growth_requires_opt_in() {
        let fx = Fixture::new();
        fx.write("src/a.py", "one\ntwo\n");
        let applier = fx.applier(RunType::AutopackMaintenance);
        let sc = scope(&["src"]);
        let big: String = (0..50).map(|i| format!("line {}\n", i)).collect();
        let p = plan(vec![FileOperation::ModifyByReplaceAll {
            path: "src/a.py".into(),
            content: big,
        }]);

        let err = applier.apply(&request(&p, &sc)).unwrap_err();
        assert!(matches!(
            err,
            ApplyError::Validation(ValidationError::SuspiciousGrowth { .. })
        ));
    }

    #[test]
    fn test_truncated_new_file_rejected() {
        let fx = Fixture::new();
        let applier = fx.applier(RunType::AutopackMaintenance);
        let sc = scope(&["src"]);
        let p = plan(vec![FileOperation::Create {
            path: "src/a.py".into(),
            content: "def f():\n    return {\"a\": [1,".into(),
        }]);

        let err = applier.apply(&request(&p, &sc)).unwrap_err();
        assert!(matches!(
            err,
            ApplyError::Validation(ValidationError::TruncatedNewFile { .. })
        ));
    }

    #[test]
    fn test_deliverables_short_lists_missing() {
        let fx = Fixture::new();
        let applier = fx.applier(RunType::AutopackMaintenance);
        let sc = scope(&["src"]);
        let p = plan(vec![FileOperation::Create {
            path: "src/github_gatherer.py".into(),
            content: "x = 1\n".into(),
        }]);
        let deliverables = vec!["src/research/gatherers/github_gatherer.py".to_string()];

        let mut req = request(&p, &sc);
        req.deliverables = &deliverables;

        let err = applier.apply(&req).unwrap_err();
        match err {
            ApplyError::Validation(ValidationError::DeliverablesShort { missing }) => {
                assert_eq!(missing, deliverables);
            }
            other => panic!("Expected DeliverablesShort, got {:?}", other),
        }
        // Nothing was committed.
        assert!(!fx.ws.path().join("src/github_gatherer.py").exists());
    }

    #[test]
    fn test_hunk_mismatch_is_validation_error() {
        let fx = Fixture::new();
        fx.write("src/a.py", "different\ncontent\n");
        let applier = fx.applier(RunType::AutopackMaintenance);
        let sc = scope(&["src"]);

        let diff = "diff --git a/src/a.py b/src/a.py\n--- a/src/a.py\n+++ b/src/a.py\n@@ -1,1 +1,1 @@\n-expected\n+replacement\n";
        let p = crate::patch::unified::parse(diff).unwrap();

        let err = applier.apply(&request(&p, &sc)).unwrap_err();
        assert!(matches!(
            err,
            ApplyError::Validation(ValidationError::PatchHunkMismatch { .. })
        ));
    }

    #[test]
    fn test_rollback_restores_workspace() {
        let fx = Fixture::new();
        fx.write("src/a.py", "original\n");
        let applier = fx.applier(RunType::AutopackMaintenance);
        let sc = scope(&["src"]);
        let p = plan(vec![FileOperation::ModifyByReplaceAll {
            path: "src/a.py".into(),
            content: "patched\n".into(),
        }]);

        let result = applier.apply(&request(&p, &sc)).unwrap();
        assert_eq!(
            fs::read_to_string(fx.ws.path().join("src/a.py")).unwrap(),
            "patched\n"
        );

        applier.rollback(&result.backup_manifest).unwrap();
        assert_eq!(
            fs::read_to_string(fx.ws.path().join("src/a.py")).unwrap(),
            "original\n"
        );
    }

    #[test]
    fn test_span_edit_and_delete() {
        let fx = Fixture::new();
        fx.write("src/a.py", "alpha beta gamma\n");
        fx.write("src/b.py", "bye\n");
        let applier = fx.applier(RunType::AutopackMaintenance);
        let sc = scope(&["src"]);
        let p = plan(vec![
            FileOperation::ReplaceSpans {
                path: "src/a.py".into(),
                spans: vec![SpanEdit {
                    old_text: "beta".into(),
                    new_text: "BETA".into(),
                }],
            },
            FileOperation::Delete {
                path: "src/b.py".into(),
            },
        ]);

        applier.apply(&request(&p, &sc)).unwrap();
        assert_eq!(
            fs::read_to_string(fx.ws.path().join("src/a.py")).unwrap(),
            "alpha BETA gamma\n"
        );
        assert!(!fx.ws.path().join("src/b.py").exists());
    }

    #[test]
    fn test_patch_hash_is_stable() {
        let changes = vec![Materialized::Write {
            path: "a.py".into(),
            content: "x\n".into(),
            old_lines: None,
        }];
        assert_eq!(hash_change_set(&changes), hash_change_set(&changes));
    }
}
