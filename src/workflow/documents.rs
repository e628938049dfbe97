//! Workflow document structures.
//!
//! A [`WorkflowDocument`] is persisted as one JSON file per topic. Field
//! names are camelCase on disk; fields written by other tools are kept in
//! [`WorkflowDocument::extra`] so they survive a load/save cycle.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Step status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl Default for StepStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Phase status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Pending,
    InProgress,
    Completed,
}

impl Default for PhaseStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl fmt::Display for PhaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
        };
        f.write_str(s)
    }
}

/// A single unit of workflow progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    /// Step identifier, unique across the workflow
    pub id: String,

    /// Display name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Current status
    #[serde(default)]
    pub status: StepStatus,

    /// When the step was started
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,

    /// When the step completed or failed
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,

    /// Result payload
    #[serde(default)]
    pub result: Option<Map<String, Value>>,

    /// Steps that must be completed first
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,

    /// Criteria the result must satisfy
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub completion_criteria: Vec<String>,

    /// Whether re-running the step is safe
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotent: Option<bool>,
}

impl Step {
    /// Create a pending step.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            status: StepStatus::Pending,
            started_at: None,
            completed_at: None,
            result: None,
            depends_on: Vec::new(),
            completion_criteria: Vec::new(),
            idempotent: None,
        }
    }

    /// Seconds since `started_at`, if the step was started.
    pub fn elapsed_seconds(&self, now: DateTime<Utc>) -> Option<f64> {
        self.started_at.map(|started| {
            let millis = (now - started).num_milliseconds().max(0);
            millis as f64 / 1000.0
        })
    }
}

/// An ordered group of steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Phase {
    /// Phase identifier
    pub id: String,

    /// Display name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Declared order, starting at 1
    pub order: u32,

    /// Current status
    #[serde(default)]
    pub status: PhaseStatus,

    /// When the phase started
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,

    /// When the last step of the phase completed
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,

    /// Phases that must be completed first
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,

    /// Steps in this phase
    #[serde(default)]
    pub steps: Vec<Step>,
}

impl Phase {
    /// Whether every step is completed.
    pub fn all_steps_completed(&self) -> bool {
        self.steps.iter().all(|s| s.status == StepStatus::Completed)
    }

    /// Number of completed steps.
    pub fn completed_steps(&self) -> usize {
        self.steps.iter().filter(|s| s.status == StepStatus::Completed).count()
    }
}

/// Audit entry severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditLevel {
    Info,
    Warning,
    Error,
}

impl fmt::Display for AuditLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// Audited state-machine action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Started,
    Completed,
    Failed,
    RolledBack,
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Started => "started",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::RolledBack => "rolled_back",
        };
        f.write_str(s)
    }
}

/// One append-only audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub level: AuditLevel,
    pub phase_id: String,
    pub step_id: String,
    pub action: AuditAction,
    #[serde(default)]
    pub details: Map<String, Value>,
    #[serde(default)]
    pub duration_seconds: Option<f64>,
}

/// Snapshot of a step taken before a risky operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepBackup {
    pub step_id: String,
    pub phase_id: String,
    pub previous_state: Step,
    pub timestamp: DateTime<Utc>,
}

/// Per-phase completion counts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseProgress {
    pub phase_id: String,
    pub status: PhaseStatus,
    pub completed: usize,
    pub total: usize,
}

impl PhaseProgress {
    /// Completion percentage, rounded down.
    pub fn percent(&self) -> usize {
        if self.total == 0 {
            0
        } else {
            self.completed * 100 / self.total
        }
    }
}

/// The persisted state of one topic's workflow.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDocument {
    /// Phase currently being worked on
    #[serde(default)]
    pub current_phase: Option<String>,

    /// Next step to work on; `None` once everything is completed
    #[serde(default)]
    pub current_step: Option<String>,

    /// Phases in declared order
    #[serde(default)]
    pub phases: Vec<Phase>,

    /// Append-only audit trail
    #[serde(default)]
    pub audit_log: Vec<AuditEntry>,

    /// Fields owned by other tools
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl WorkflowDocument {
    /// Locate a step and its phase.
    pub fn find_step(&self, step_id: &str) -> Option<(&Phase, &Step)> {
        self.phases
            .iter()
            .find_map(|phase| phase.steps.iter().find(|s| s.id == step_id).map(|step| (phase, step)))
    }

    /// Indices `(phase, step)` of a step.
    pub fn step_position(&self, step_id: &str) -> Option<(usize, usize)> {
        self.phases.iter().enumerate().find_map(|(pi, phase)| {
            phase.steps.iter().position(|s| s.id == step_id).map(|si| (pi, si))
        })
    }

    /// Look up a phase by id.
    pub fn phase(&self, phase_id: &str) -> Option<&Phase> {
        self.phases.iter().find(|p| p.id == phase_id)
    }

    /// Index of the phase with the given declared order.
    pub fn phase_index_by_order(&self, order: u32) -> Option<usize> {
        self.phases.iter().position(|p| p.order == order)
    }

    /// First pending step inside the first phase that is not completed.
    pub fn next_pending_step(&self) -> Option<&str> {
        self.phases
            .iter()
            .filter(|phase| phase.status != PhaseStatus::Completed)
            .find_map(|phase| phase.steps.iter().find(|s| s.status == StepStatus::Pending))
            .map(|step| step.id.as_str())
    }

    /// Total number of steps across all phases.
    pub fn total_steps(&self) -> usize {
        self.phases.iter().map(|p| p.steps.len()).sum()
    }

    /// Whether every phase is completed.
    pub fn is_complete(&self) -> bool {
        !self.phases.is_empty() && self.phases.iter().all(|p| p.status == PhaseStatus::Completed)
    }

    /// Completed/total step counts per phase.
    pub fn progress(&self) -> Vec<PhaseProgress> {
        self.phases
            .iter()
            .map(|phase| PhaseProgress {
                phase_id: phase.id.clone(),
                status: phase.status,
                completed: phase.completed_steps(),
                total: phase.steps.len(),
            })
            .collect()
    }

    /// The last `limit` audit entries in append order, or all of them.
    pub fn recent_audit(&self, limit: Option<usize>) -> &[AuditEntry] {
        match limit {
            Some(n) if n < self.audit_log.len() => &self.audit_log[self.audit_log.len() - n..],
            _ => &self.audit_log,
        }
    }
}
