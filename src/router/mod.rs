//! Model routing: deterministic per-attempt model selection.
//!
//! The router holds the run's immutable `RoutingSnapshot` and a per-run
//! override map keyed `{task_category}:{complexity}`. The same
//! `(lane, escalation_level)` always resolves to the same model, across
//! process restarts.

pub mod snapshot;

use std::collections::HashMap;

use crate::phase::{Complexity, TaskCategory};
pub use snapshot::{Lane, ModelCatalog, ModelSpec, RoutingSnapshot};

pub struct ModelRouter {
    snapshot: RoutingSnapshot,
    /// `{task_category}:{complexity}` → model_id, consulted before the
    /// snapshot (e.g. to pin auditor vs builder models independently).
    overrides: HashMap<String, String>,
}

impl ModelRouter {
    pub fn new(snapshot: RoutingSnapshot) -> Self {
        Self {
            snapshot,
            overrides: HashMap::new(),
        }
    }

    pub fn with_overrides(mut self, overrides: HashMap<String, String>) -> Self {
        self.overrides = overrides;
        self
    }

    pub fn set_override(&mut self, task_category: TaskCategory, complexity: Complexity, model_id: &str) {
        self.overrides
            .insert(override_key(task_category, complexity), model_id.to_string());
    }

    /// Lane for a complexity band, bumped by at most one escalation.
    pub fn lane_for(complexity: Complexity, escalation_level: u32) -> Lane {
        let base = match complexity {
            Complexity::Low => Lane::Low,
            Complexity::Medium => Lane::Medium,
            Complexity::High => Lane::High,
        };
        if escalation_level > 0 {
            base.escalated()
        } else {
            base
        }
    }

    /// Resolve the concrete model for an attempt.
    pub fn resolve(
        &self,
        task_category: TaskCategory,
        complexity: Complexity,
        escalation_level: u32,
    ) -> &str {
        if escalation_level == 0 {
            if let Some(model_id) = self.overrides.get(&override_key(task_category, complexity)) {
                return model_id;
            }
        }
        let lane = Self::lane_for(complexity, escalation_level);
        &self.snapshot.model_for(lane).model_id
    }

    /// Full spec for an attempt (output caps feed the token-escalation
    /// branch).
    pub fn resolve_spec(
        &self,
        task_category: TaskCategory,
        complexity: Complexity,
        escalation_level: u32,
    ) -> &ModelSpec {
        let model_id = self
            .resolve(task_category, complexity, escalation_level)
            .to_string();
        // Overrides must still point at a cataloged lane model; fall back
        // to the lane spec when they do not.
        self.snapshot
            .lanes
            .values()
            .find(|m| m.model_id == model_id)
            .unwrap_or_else(|| {
                self.snapshot
                    .model_for(Self::lane_for(complexity, escalation_level))
            })
    }

    pub fn snapshot(&self) -> &RoutingSnapshot {
        &self.snapshot
    }
}

fn override_key(task_category: TaskCategory, complexity: Complexity) -> String {
    format!("{}:{}", task_category, complexity)
}
