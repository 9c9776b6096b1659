//! CI invocation and result-schema parsing.
//!
//! The executor runs the phase's test command, keeps a plain text log for
//! humans, and reads a machine-readable JSON report (pytest-report shaped)
//! for the baseline-delta computation. The command learns where to put the
//! report from the `AUTOPACK_CI_REPORT` environment variable.
//!
//! A non-empty collectors array with any failed outcome is a blocking
//! failure regardless of test results: collection errors are
//! baseline-independent and human approval never overrides them.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

use crate::errors::CiError;

/// Environment variable telling the test command where to write its JSON
/// report.
pub const CI_REPORT_ENV: &str = "AUTOPACK_CI_REPORT";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CiSummary {
    #[serde(default)]
    pub total: u64,
    #[serde(default)]
    pub passed: u64,
    #[serde(default)]
    pub failed: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestCase {
    pub nodeid: String,
    pub outcome: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Collector {
    pub nodeid: String,
    pub outcome: String,
    #[serde(default)]
    pub longrepr: Option<String>,
}

/// The machine-readable CI report.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CiReport {
    #[serde(default)]
    pub exitcode: i32,
    #[serde(default)]
    pub summary: CiSummary,
    #[serde(default)]
    pub tests: Vec<TestCase>,
    #[serde(default)]
    pub collectors: Vec<Collector>,
}

impl CiReport {
    pub fn parse(json: &str) -> Result<Self, CiError> {
        serde_json::from_str(json).map_err(|e| CiError::ReportUnparseable {
            detail: e.to_string(),
        })
    }

    /// A failed collector blocks phase completion regardless of `tests`.
    pub fn has_collection_failure(&self) -> bool {
        self.collectors.iter().any(|c| c.outcome == "failed")
    }

    pub fn failed_tests(&self) -> Vec<&str> {
        self.tests
            .iter()
            .filter(|t| t.outcome == "failed")
            .map(|t| t.nodeid.as_str())
            .collect()
    }

    pub fn passed(&self) -> bool {
        self.exitcode == 0 && !self.has_collection_failure()
    }
}

/// Known failing tests before the phase's patch was applied. Regressions
/// are failures outside this set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CiBaseline {
    pub failing: BTreeSet<String>,
}

impl CiBaseline {
    pub fn from_report(report: &CiReport) -> Self {
        Self {
            failing: report
                .failed_tests()
                .into_iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }

    /// Failures in `report` not already failing at baseline.
    pub fn regressions<'a>(&self, report: &'a CiReport) -> Vec<&'a str> {
        report
            .failed_tests()
            .into_iter()
            .filter(|nodeid| !self.failing.contains(*nodeid))
            .collect()
    }
}

/// Outcome of one CI pass.
#[derive(Debug, Clone, PartialEq)]
pub enum CiOutcome {
    Passed(CiReport),
    /// New failures relative to baseline.
    Regression {
        report: CiReport,
        new_failures: Vec<String>,
    },
    /// Failed collectors or an unusable report: a blocking failure.
    CollectionError(CiReport),
}

pub struct CiRunner {
    workspace_root: PathBuf,
    timeout: Duration,
}

impl CiRunner {
    pub fn new(workspace_root: &Path, timeout: Duration) -> Self {
        Self {
            workspace_root: workspace_root.to_path_buf(),
            timeout,
        }
    }

    /// Run `test_cmd`, writing the text log to `log_path` and expecting
    /// the JSON report at `report_path`.
    pub async fn run(
        &self,
        test_cmd: &str,
        report_path: &Path,
        log_path: &Path,
        baseline: Option<&CiBaseline>,
    ) -> Result<CiOutcome, CiError> {
        let mut command = tokio::process::Command::new("sh");
        command
            .arg("-c")
            .arg(test_cmd)
            .current_dir(&self.workspace_root)
            .env(CI_REPORT_ENV, report_path)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());

        info!(cmd = %test_cmd, "running test command");

        let output = tokio::time::timeout(self.timeout, async {
            command.output().await.map_err(|e| CiError::SpawnFailed {
                cmd: test_cmd.to_string(),
                source: e,
            })
        })
        .await
        .map_err(|_| CiError::Timeout {
            seconds: self.timeout.as_secs(),
        })??;

        // The plain text log is always retained for human review.
        let mut log = Vec::with_capacity(output.stdout.len() + output.stderr.len() + 1);
        log.extend_from_slice(&output.stdout);
        if !output.stderr.is_empty() {
            log.push(b'\n');
            log.extend_from_slice(&output.stderr);
        }
        if let Some(parent) = log_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        if let Err(e) = std::fs::write(log_path, &log) {
            warn!(path = %log_path.display(), error = %e, "failed to write CI log");
        }

        if !report_path.exists() {
            return Err(CiError::ReportMissing {
                path: report_path.to_path_buf(),
            });
        }
        let json = std::fs::read_to_string(report_path).map_err(|e| {
            CiError::ReportUnparseable {
                detail: format!("cannot read report: {}", e),
            }
        })?;
        let report = CiReport::parse(&json)?;

        Ok(Self::classify(report, baseline))
    }

    /// Classify a parsed report against an optional baseline.
    pub fn classify(report: CiReport, baseline: Option<&CiBaseline>) -> CiOutcome {
        if report.has_collection_failure() {
            return CiOutcome::CollectionError(report);
        }
        if report.exitcode == 0 {
            return CiOutcome::Passed(report);
        }

        let new_failures: Vec<String> = match baseline {
            Some(baseline) => baseline
                .regressions(&report)
                .into_iter()
                .map(|s| s.to_string())
                .collect(),
            None => report
                .failed_tests()
                .into_iter()
                .map(|s| s.to_string())
                .collect(),
        };

        if new_failures.is_empty() {
            // Every failure was already failing at baseline.
            CiOutcome::Passed(report)
        } else {
            CiOutcome::Regression {
                report,
                new_failures,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn report(exitcode: i32, tests: &[(&str, &str)], collectors: &[(&str, &str)]) -> CiReport {
        CiReport {
            exitcode,
            summary: CiSummary {
                total: tests.len() as u64,
                passed: tests.iter().filter(|(_, o)| *o == "passed").count() as u64,
                failed: tests.iter().filter(|(_, o)| *o == "failed").count() as u64,
            },
            tests: tests
                .iter()
                .map(|(id, o)| TestCase {
                    nodeid: id.to_string(),
                    outcome: o.to_string(),
                })
                .collect(),
            collectors: collectors
                .iter()
                .map(|(id, o)| Collector {
                    nodeid: id.to_string(),
                    outcome: o.to_string(),
                    longrepr: None,
                })
                .collect(),
        }
    }

    #[test]
    fn test_parse_minimal_report() {
        let json = r#"{
            "exitcode": 1,
            "summary": {"total": 2},
            "tests": [
                {"nodeid": "test_a", "outcome": "passed"},
                {"nodeid": "test_b", "outcome": "failed"}
            ],
            "collectors": []
        }"#;
        let report = CiReport::parse(json).unwrap();
        assert_eq!(report.summary.total, 2);
        assert_eq!(report.failed_tests(), vec!["test_b"]);
        assert!(!report.has_collection_failure());
    }

    #[test]
    fn test_failed_collector_blocks_even_with_empty_tests() {
        // pytest exit 2, zero tests collected, one failed collector: must
        // block even under human-approval override.
        let r = report(2, &[], &[("tests/test_x.py", "failed")]);
        assert!(r.has_collection_failure());
        assert!(!r.passed());
        assert!(matches!(
            CiRunner::classify(r, None),
            CiOutcome::CollectionError(_)
        ));
    }

    #[test]
    fn test_baseline_masks_preexisting_failures() {
        let before = report(1, &[("test_old", "failed")], &[]);
        let baseline = CiBaseline::from_report(&before);

        let after = report(1, &[("test_old", "failed")], &[]);
        assert!(matches!(
            CiRunner::classify(after, Some(&baseline)),
            CiOutcome::Passed(_)
        ));

        let regressed = report(1, &[("test_old", "failed"), ("test_new", "failed")], &[]);
        match CiRunner::classify(regressed, Some(&baseline)) {
            CiOutcome::Regression { new_failures, .. } => {
                assert_eq!(new_failures, vec!["test_new"]);
            }
            other => panic!("Expected Regression, got {:?}", other),
        }
    }

    #[test]
    fn test_no_baseline_treats_all_failures_as_regressions() {
        let r = report(1, &[("test_a", "failed")], &[]);
        assert!(matches!(
            CiRunner::classify(r, None),
            CiOutcome::Regression { .. }
        ));
    }

    #[tokio::test]
    async fn test_run_reads_report_and_writes_log() {
        let ws = tempdir().unwrap();
        let report_path = ws.path().join("ci/report.json");
        let log_path = ws.path().join("ci/run.log");
        std::fs::create_dir_all(ws.path().join("ci")).unwrap();

        let runner = CiRunner::new(ws.path(), Duration::from_secs(30));
        let cmd = format!(
            "echo running tests; printf '{}' > \"${}\"",
            r#"{"exitcode": 0, "summary": {"total": 1}, "tests": [{"nodeid": "t", "outcome": "passed"}], "collectors": []}"#,
            CI_REPORT_ENV
        );

        let outcome = runner
            .run(&cmd, &report_path, &log_path, None)
            .await
            .unwrap();
        assert!(matches!(outcome, CiOutcome::Passed(_)));
        let log = std::fs::read_to_string(&log_path).unwrap();
        assert!(log.contains("running tests"));
    }

    #[tokio::test]
    async fn test_run_missing_report_is_collect_error() {
        let ws = tempdir().unwrap();
        let runner = CiRunner::new(ws.path(), Duration::from_secs(30));

        let err = runner
            .run(
                "true",
                &ws.path().join("missing.json"),
                &ws.path().join("run.log"),
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CiError::ReportMissing { .. }));
    }
}
