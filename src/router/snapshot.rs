//! Routing snapshot: the per-run, immutable mapping from model lanes to
//! concrete provider models.
//!
//! Built once at run start from the configured catalog, filtered by the
//! run's safety profile, and persisted under the run-local layout so the
//! same `(lane, escalation_level)` resolves to the same model across
//! process restarts.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::errors::RouterError;
use crate::run::SafetyProfile;

/// A model lane. Complexity maps low/medium/high onto these; the names
/// follow the provider's haiku/sonnet/opus tiers.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Lane {
    Low,
    Medium,
    High,
}

impl Lane {
    /// The next lane up; `High` is the ceiling.
    pub fn escalated(self) -> Lane {
        match self {
            Lane::Low => Lane::Medium,
            Lane::Medium | Lane::High => Lane::High,
        }
    }
}

impl std::fmt::Display for Lane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Lane::Low => "low",
            Lane::Medium => "medium",
            Lane::High => "high",
        };
        write!(f, "{}", s)
    }
}

/// One candidate model in the configured catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSpec {
    pub model_id: String,
    /// Which lane the catalog assigns this model to.
    pub lane: Lane,
    pub safety_compatible: bool,
    pub input_cost_per_m: f64,
    pub output_cost_per_m: f64,
    pub context_window: u64,
    pub max_output: u64,
}

/// The configured catalog of candidate models.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelCatalog {
    pub models: Vec<ModelSpec>,
}

impl ModelCatalog {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read model catalog: {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse model catalog: {}", path.display()))
    }

    /// Built-in fallback used when no catalog source is available.
    pub fn default_catalog() -> Self {
        let spec = |model_id: &str, lane, input, output, ctx: u64, max_out: u64| ModelSpec {
            model_id: model_id.to_string(),
            lane,
            safety_compatible: true,
            input_cost_per_m: input,
            output_cost_per_m: output,
            context_window: ctx,
            max_output: max_out,
        };
        Self {
            models: vec![
                spec("haiku-lane-default", Lane::Low, 0.80, 4.00, 200_000, 8_192),
                spec("sonnet-lane-default", Lane::Medium, 3.00, 15.00, 200_000, 16_384),
                spec("opus-lane-default", Lane::High, 15.00, 75.00, 200_000, 32_768),
            ],
        }
    }
}

/// Per-run snapshot: lane → selected model. Read-only once persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingSnapshot {
    pub created_at: DateTime<Utc>,
    pub safety_profile: SafetyProfile,
    pub lanes: BTreeMap<Lane, ModelSpec>,
}

impl RoutingSnapshot {
    /// Select one model per lane from the catalog.
    ///
    /// Filter by safety compatibility under the profile, then stable-sort
    /// by `(input_cost + output_cost) asc, context_window desc, max_output
    /// desc, model_id asc` and pick the first.
    pub fn build(catalog: &ModelCatalog, profile: SafetyProfile) -> Result<Self, RouterError> {
        let mut lanes = BTreeMap::new();
        for lane in [Lane::Low, Lane::Medium, Lane::High] {
            let mut candidates: Vec<&ModelSpec> = catalog
                .models
                .iter()
                .filter(|m| m.lane == lane)
                .filter(|m| profile == SafetyProfile::Relaxed || m.safety_compatible)
                .collect();

            candidates.sort_by(|a, b| {
                let cost_a = a.input_cost_per_m + a.output_cost_per_m;
                let cost_b = b.input_cost_per_m + b.output_cost_per_m;
                cost_a
                    .total_cmp(&cost_b)
                    .then(b.context_window.cmp(&a.context_window))
                    .then(b.max_output.cmp(&a.max_output))
                    .then(a.model_id.cmp(&b.model_id))
            });

            let selected = candidates.first().ok_or_else(|| RouterError::LaneEmpty {
                lane: lane.to_string(),
                profile: profile.to_string(),
            })?;
            lanes.insert(lane, (*selected).clone());
        }

        Ok(Self {
            created_at: Utc::now(),
            safety_profile: profile,
            lanes,
        })
    }

    /// Build from the default catalog; infallible by construction.
    pub fn default_snapshot(profile: SafetyProfile) -> Self {
        Self::build(&ModelCatalog::default_catalog(), profile)
            .expect("default catalog covers every lane")
    }

    pub fn model_for(&self, lane: Lane) -> &ModelSpec {
        self.lanes
            .get(&lane)
            .unwrap_or_else(|| panic!("snapshot missing lane {}", lane))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self).context("Failed to serialize snapshot")?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write routing snapshot: {}", path.display()))?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, RouterError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| RouterError::SnapshotUnreadable {
                path: path.to_path_buf(),
                detail: e.to_string(),
            })?;
        let snapshot: Self =
            serde_json::from_str(&content).map_err(|e| RouterError::SnapshotUnreadable {
                path: path.to_path_buf(),
                detail: e.to_string(),
            })?;
        for lane in [Lane::Low, Lane::Medium, Lane::High] {
            if !snapshot.lanes.contains_key(&lane) {
                return Err(RouterError::SnapshotUnreadable {
                    path: path.to_path_buf(),
                    detail: format!("snapshot missing lane {}", lane),
                });
            }
        }
        Ok(snapshot)
    }

    /// Load the persisted snapshot, or build and persist one.
    pub fn load_or_build(
        path: &Path,
        catalog: Option<&ModelCatalog>,
        profile: SafetyProfile,
    ) -> Result<Self> {
        if path.exists() {
            return Ok(Self::load(path)?);
        }
        let snapshot = match catalog {
            Some(catalog) => Self::build(catalog, profile)?,
            None => Self::default_snapshot(profile),
        };
        snapshot.save(path)?;
        Ok(snapshot)
    }
}
