//! File-based human approval channel.
//!
//! The executor writes an approval request under the run's
//! `handoff/approvals/` directory and polls it until a responder flips the
//! status to APPROVED or DENIED with an approver identity and timestamp.
//! Timing out leaves the request pending; the phase stays blocked rather
//! than being converted to a failure.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::artifacts::atomic_write_json;

/// Default wait before giving up on a response: 24 hours.
pub const DEFAULT_APPROVAL_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Denied,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub approval_id: String,
    pub run_id: String,
    pub phase_id: String,
    pub reason: String,
    pub status: ApprovalStatus,
    pub requested_at: DateTime<Utc>,
    #[serde(default)]
    pub approver_id: Option<String>,
    #[serde(default)]
    pub resolved_at: Option<DateTime<Utc>>,
}

impl ApprovalRequest {
    pub fn is_resolved(&self) -> bool {
        self.status != ApprovalStatus::Pending
    }
}

pub struct ApprovalChannel {
    dir: PathBuf,
}

impl ApprovalChannel {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
        }
    }

    fn request_path(&self, approval_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", approval_id))
    }

    /// Write a new pending request and return it.
    pub fn request(&self, run_id: &str, phase_id: &str, reason: &str) -> Result<ApprovalRequest> {
        let request = ApprovalRequest {
            approval_id: uuid::Uuid::new_v4().to_string(),
            run_id: run_id.to_string(),
            phase_id: phase_id.to_string(),
            reason: reason.to_string(),
            status: ApprovalStatus::Pending,
            requested_at: Utc::now(),
            approver_id: None,
            resolved_at: None,
        };
        atomic_write_json(&self.request_path(&request.approval_id), &request)?;
        info!(approval_id = %request.approval_id, phase_id, "approval requested");
        Ok(request)
    }

    pub fn poll(&self, approval_id: &str) -> Result<Option<ApprovalRequest>> {
        let path = self.request_path(approval_id);
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read approval request: {}", path.display()))?;
        let request: ApprovalRequest =
            serde_json::from_str(&content).context("Failed to parse approval request")?;
        Ok(Some(request))
    }

    /// Block until the request resolves or `timeout` elapses. A timeout
    /// returns the still-pending request unchanged.
    pub async fn wait(
        &self,
        approval_id: &str,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<ApprovalRequest> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let request = self
                .poll(approval_id)?
                .with_context(|| format!("Approval request {} vanished", approval_id))?;
            if request.is_resolved() {
                return Ok(request);
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(request);
            }
            tokio::time::sleep(poll_interval).await;
        }
    }

    /// Record a human response.
    pub fn respond(&self, approval_id: &str, approve: bool, approver_id: &str) -> Result<()> {
        let mut request = self
            .poll(approval_id)?
            .with_context(|| format!("No approval request with id {}", approval_id))?;
        request.status = if approve {
            ApprovalStatus::Approved
        } else {
            ApprovalStatus::Denied
        };
        request.approver_id = Some(approver_id.to_string());
        request.resolved_at = Some(Utc::now());
        atomic_write_json(&self.request_path(approval_id), &request)?;
        info!(approval_id, approver_id, approve, "approval resolved");
        Ok(())
    }

    /// All requests still pending a response.
    pub fn pending(&self) -> Result<Vec<ApprovalRequest>> {
        let mut out = Vec::new();
        if !self.dir.exists() {
            return Ok(out);
        }
        for entry in std::fs::read_dir(&self.dir).context("Failed to list approvals")? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Ok(content) = std::fs::read_to_string(&path) {
                if let Ok(request) = serde_json::from_str::<ApprovalRequest>(&content) {
                    if !request.is_resolved() {
                        out.push(request);
                    }
                }
            }
        }
        out.sort_by(|a, b| a.requested_at.cmp(&b.requested_at));
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_request_and_poll() {
        let dir = tempdir().unwrap();
        let channel = ApprovalChannel::new(dir.path());

        let request = channel.request("r1", "p1", "protected path write").unwrap();
        let polled = channel.poll(&request.approval_id).unwrap().unwrap();
        assert_eq!(polled.status, ApprovalStatus::Pending);
        assert_eq!(polled.phase_id, "p1");
    }

    #[test]
    fn test_respond_records_approver_and_timestamp() {
        let dir = tempdir().unwrap();
        let channel = ApprovalChannel::new(dir.path());
        let request = channel.request("r1", "p1", "reason").unwrap();

        channel.respond(&request.approval_id, true, "alice").unwrap();
        let resolved = channel.poll(&request.approval_id).unwrap().unwrap();
        assert_eq!(resolved.status, ApprovalStatus::Approved);
        assert_eq!(resolved.approver_id.as_deref(), Some("alice"));
        assert!(resolved.resolved_at.is_some());
    }

    #[test]
    fn test_pending_lists_only_unresolved() {
        let dir = tempdir().unwrap();
        let channel = ApprovalChannel::new(dir.path());
        let first = channel.request("r1", "p1", "a").unwrap();
        let _second = channel.request("r1", "p2", "b").unwrap();

        channel.respond(&first.approval_id, false, "bob").unwrap();
        let pending = channel.pending().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].phase_id, "p2");
    }

    #[tokio::test]
    async fn test_wait_times_out_pending() {
        let dir = tempdir().unwrap();
        let channel = ApprovalChannel::new(dir.path());
        let request = channel.request("r1", "p1", "reason").unwrap();

        let result = channel
            .wait(
                &request.approval_id,
                Duration::from_millis(50),
                Duration::from_millis(10),
            )
            .await
            .unwrap();
        // Timeout never converts the request to a failure.
        assert_eq!(result.status, ApprovalStatus::Pending);
    }

    #[tokio::test]
    async fn test_wait_sees_resolution() {
        let dir = tempdir().unwrap();
        let channel = ApprovalChannel::new(dir.path());
        let request = channel.request("r1", "p1", "reason").unwrap();
        channel.respond(&request.approval_id, true, "alice").unwrap();

        let result = channel
            .wait(
                &request.approval_id,
                Duration::from_secs(5),
                Duration::from_millis(10),
            )
            .await
            .unwrap();
        assert_eq!(result.status, ApprovalStatus::Approved);
    }
}
