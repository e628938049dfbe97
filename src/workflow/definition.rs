//! Static workflow definitions.
//!
//! A definition declares the phases and steps a topic goes through. It is
//! read from JSON or YAML and validated before any document is built
//! from it.

use std::collections::HashSet;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::documents::{Phase, PhaseStatus, Step, WorkflowDocument};
use super::error::{WorkflowError, WorkflowResult};
use crate::core::DependencyGraph;

/// Top-level definition file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Free-form version marker
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<Value>,

    /// The workflow layout
    pub workflow: WorkflowLayout,
}

/// Ordered phases of a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowLayout {
    pub phases: Vec<PhaseDefinition>,
}

/// A declared phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseDefinition {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// 1-based position; defaults to the phase's position in the file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order: Option<u32>,
    #[serde(default, alias = "depends_on", skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub steps: Vec<StepDefinition>,
}

/// A declared step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepDefinition {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, alias = "depends_on", skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    #[serde(default, alias = "completion_criteria", skip_serializing_if = "Vec::is_empty")]
    pub completion_criteria: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotent: Option<bool>,
}

impl WorkflowDefinition {
    /// Load and validate a definition. `.yaml`/`.yml` files are read as
    /// YAML, everything else as JSON.
    pub fn load(path: &Path) -> WorkflowResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                WorkflowError::NotFound { kind: "Workflow definition", id: path.display().to_string() }
            } else {
                WorkflowError::Io(e)
            }
        })?;

        let is_yaml = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("yaml") || ext.eq_ignore_ascii_case("yml"));

        if is_yaml {
            Self::from_yaml_str(&content)
        } else {
            Self::from_json_str(&content)
        }
    }

    /// Parse and validate a JSON definition.
    pub fn from_json_str(content: &str) -> WorkflowResult<Self> {
        let definition: Self = serde_json::from_str(content)
            .map_err(|e| WorkflowError::InvalidDefinition(e.to_string()))?;
        definition.finish()
    }

    /// Parse and validate a YAML definition.
    pub fn from_yaml_str(content: &str) -> WorkflowResult<Self> {
        let definition: Self = serde_yaml::from_str(content)
            .map_err(|e| WorkflowError::InvalidDefinition(e.to_string()))?;
        definition.finish()
    }

    /// Fill in missing phase orders, then validate.
    fn finish(mut self) -> WorkflowResult<Self> {
        for (position, phase) in (1u32..).zip(self.workflow.phases.iter_mut()) {
            phase.order.get_or_insert(position);
        }
        self.validate()?;
        Ok(self)
    }

    /// Check structural rules: non-empty phases and steps, unique ids,
    /// contiguous unique `order` values from 1, known dependencies, and no
    /// dependency cycles.
    pub fn validate(&self) -> WorkflowResult<()> {
        let invalid = |msg: String| Err(WorkflowError::InvalidDefinition(msg));
        let phases = &self.workflow.phases;

        if phases.is_empty() {
            return invalid("workflow has no phases".to_string());
        }

        let mut phase_ids = HashSet::new();
        let mut step_ids = HashSet::new();
        for phase in phases {
            if !phase_ids.insert(phase.id.as_str()) {
                return invalid(format!("duplicate phase id '{}'", phase.id));
            }
            if phase.steps.is_empty() {
                return invalid(format!("phase '{}' has no steps", phase.id));
            }
            for step in &phase.steps {
                if !step_ids.insert(step.id.as_str()) {
                    return invalid(format!("duplicate step id '{}'", step.id));
                }
            }
        }

        let mut orders: Vec<u32> = phases.iter().map(PhaseDefinition::order).collect();
        orders.sort_unstable();
        for (expected, actual) in (1u32..).zip(&orders) {
            if *actual != expected {
                return invalid(format!(
                    "phase order values must be unique and contiguous from 1, got {orders:?}"
                ));
            }
        }

        for phase in phases {
            for dep in &phase.depends_on {
                if dep == &phase.id || !phase_ids.contains(dep.as_str()) {
                    return invalid(format!("phase '{}' depends on unknown phase '{dep}'", phase.id));
                }
            }
            for step in &phase.steps {
                if let Some(dep) = step.depends_on.iter().find(|d| !step_ids.contains(d.as_str())) {
                    return invalid(format!("step '{}' depends on unknown step '{dep}'", step.id));
                }
            }
        }

        self.dependency_graph()
            .validate()
            .map_err(|e| WorkflowError::InvalidDefinition(e.to_string()))
    }

    /// Phases sorted by declared order.
    pub fn phases(&self) -> Vec<&PhaseDefinition> {
        let mut phases: Vec<&PhaseDefinition> = self.workflow.phases.iter().collect();
        phases.sort_by_key(|p| p.order());
        phases
    }

    /// Locate a step and its phase.
    pub fn find_step(&self, step_id: &str) -> Option<(&PhaseDefinition, &StepDefinition)> {
        self.workflow
            .phases
            .iter()
            .find_map(|phase| phase.steps.iter().find(|s| s.id == step_id).map(|s| (phase, s)))
    }

    /// Total number of steps.
    pub fn total_steps(&self) -> usize {
        self.workflow.phases.iter().map(|p| p.steps.len()).sum()
    }

    /// Step-level dependency graph.
    ///
    /// Besides explicit step dependencies, every step of a phase depends on
    /// every step of each phase that phase depends on.
    pub fn dependency_graph(&self) -> DependencyGraph {
        let mut graph = DependencyGraph::new();

        for phase in self.phases() {
            for step in &phase.steps {
                graph.add_node(step.id.as_str());
                for dep in &step.depends_on {
                    graph.add_edge(step.id.as_str(), dep.as_str());
                }
                for phase_dep in &phase.depends_on {
                    let Some(upstream) = self.workflow.phases.iter().find(|p| &p.id == phase_dep) else {
                        continue;
                    };
                    for upstream_step in &upstream.steps {
                        graph.add_edge(step.id.as_str(), upstream_step.id.as_str());
                    }
                }
            }
        }

        graph
    }

    /// Build a fresh document: the first phase is in progress, every step
    /// is pending, and the current step is the first step of the first
    /// phase.
    pub fn instantiate(&self, now: DateTime<Utc>) -> WorkflowDocument {
        let phases: Vec<Phase> = self
            .phases()
            .into_iter()
            .enumerate()
            .map(|(idx, def)| {
                let first = idx == 0;
                Phase {
                    id: def.id.clone(),
                    name: def.name.clone(),
                    order: def.order(),
                    status: if first { PhaseStatus::InProgress } else { PhaseStatus::Pending },
                    started_at: first.then_some(now),
                    completed_at: None,
                    depends_on: def.depends_on.clone(),
                    steps: def.steps.iter().map(StepDefinition::instantiate).collect(),
                }
            })
            .collect();

        let current_phase = phases.first().map(|p| p.id.clone());
        let current_step = phases.first().and_then(|p| p.steps.first()).map(|s| s.id.clone());

        WorkflowDocument { current_phase, current_step, phases, audit_log: Vec::new(), extra: Map::new() }
    }
}

impl PhaseDefinition {
    /// Declared order, 0 if none was given.
    pub fn order(&self) -> u32 {
        self.order.unwrap_or_default()
    }
}

impl StepDefinition {
    fn instantiate(&self) -> Step {
        Step {
            name: self.name.clone(),
            depends_on: self.depends_on.clone(),
            completion_criteria: self.completion_criteria.clone(),
            idempotent: self.idempotent,
            ..Step::new(self.id.clone())
        }
    }
}
