//! The workflow state machine.
//!
//! Steps move `pending -> in_progress -> completed | failed`. Every
//! operation loads the topic's document under the store's lock, mutates it
//! in memory, and writes it back once together with its audit entry.
//! Events are emitted after the write succeeds.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use super::criteria::CriteriaEvaluator;
use super::definition::WorkflowDefinition;
use super::documents::{
    AuditAction, AuditEntry, AuditLevel, PhaseProgress, PhaseStatus, Step, StepBackup, StepStatus,
    WorkflowDocument,
};
use super::error::{WorkflowError, WorkflowResult};
use super::store::{StateStore, Update};
use crate::core::{PerformanceMonitor, WorkflowCache};
use crate::events::{Event, EventBus};

/// Substrings marking a step id as read-only, and therefore safe to re-run.
const IDEMPOTENT_PATTERNS: &[&str] = &[
    "parse",
    "extract",
    "analyze",
    "scan",
    "validate",
    "generate-summary",
    "generate-list",
    "generate-report",
];

/// Operation name under which `complete` timings are recorded.
pub const COMPLETE_OPERATION: &str = "complete_step";

/// Result of a dependency check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyCheck {
    pub valid: bool,
    pub reason: String,
}

impl DependencyCheck {
    fn satisfied() -> Self {
        Self { valid: true, reason: "All dependencies satisfied".to_string() }
    }

    fn blocked(reason: String) -> Self {
        Self { valid: false, reason }
    }
}

/// Outcome of [`WorkflowManager::complete`].
#[must_use]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StepCompletion {
    /// The step was marked completed.
    Completed {
        phase_completed: bool,
        workflow_completed: bool,
        next_step: Option<String>,
    },
    /// Criteria failed; the document was not touched.
    Rejected { failed_criteria: Vec<String> },
}

impl StepCompletion {
    /// Whether the step was marked completed.
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }
}

/// Summary of a topic's progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowStatus {
    pub topic: String,
    pub current_phase: Option<String>,
    pub current_step: Option<String>,
    pub complete: bool,
    pub completed_steps: usize,
    pub total_steps: usize,
    pub phases: Vec<PhaseProgress>,
}

/// Events collected while mutating, emitted once the write succeeded.
struct Transition<T> {
    value: T,
    events: Vec<Event>,
}

/// Drives topic workflows stored under a topics directory.
#[derive(Debug)]
pub struct WorkflowManager {
    topics_dir: PathBuf,
    document_name: String,
    definition: Option<WorkflowDefinition>,
    store: StateStore,
    bus: Arc<EventBus>,
    monitor: Arc<PerformanceMonitor>,
}

impl WorkflowManager {
    /// Create a manager storing `<topics_dir>/<topic>/topic.json`.
    pub fn new(topics_dir: impl Into<PathBuf>, bus: Arc<EventBus>, monitor: Arc<PerformanceMonitor>) -> Self {
        Self {
            topics_dir: topics_dir.into(),
            document_name: "topic.json".to_string(),
            definition: None,
            store: StateStore::new(Arc::clone(&monitor)),
            bus,
            monitor,
        }
    }

    /// Use this definition for `initialize` and as a fallback for step metadata.
    #[must_use]
    pub fn with_definition(mut self, definition: WorkflowDefinition) -> Self {
        self.definition = Some(definition);
        self
    }

    /// Override the document file name.
    #[must_use]
    pub fn with_document_name(mut self, name: impl Into<String>) -> Self {
        self.document_name = name.into();
        self
    }

    /// Serve reads from `cache`.
    #[must_use]
    pub fn with_cache(mut self, cache: Arc<WorkflowCache>) -> Self {
        self.store = std::mem::take(&mut self.store).with_cache(cache);
        self
    }

    /// The loaded definition, if any.
    pub fn definition(&self) -> Option<&WorkflowDefinition> {
        self.definition.as_ref()
    }

    /// The underlying store.
    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// The bus events are emitted on.
    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Where a topic's document lives.
    pub fn document_path(&self, topic: &str) -> PathBuf {
        self.topics_dir.join(topic).join(&self.document_name)
    }

    fn existing_document(&self, topic: &str) -> WorkflowResult<PathBuf> {
        let path = self.document_path(topic);
        if path.is_file() {
            Ok(path)
        } else {
            Err(WorkflowError::topic_not_found(topic))
        }
    }

    /// Load a topic's document.
    pub fn load(&self, topic: &str) -> WorkflowResult<WorkflowDocument> {
        let path = self.existing_document(topic)?;
        self.store.load(&path)
    }

    /// Build the document for `topic` from the definition.
    ///
    /// An existing document has its workflow fields replaced; fields owned
    /// by other tools are kept.
    pub fn initialize(&self, topic: &str) -> WorkflowResult<WorkflowDocument> {
        let definition = self
            .definition
            .as_ref()
            .ok_or_else(|| WorkflowError::InvalidDefinition("no workflow definition loaded".to_string()))?;

        let fresh = definition.instantiate(Utc::now());
        let path = self.document_path(topic);

        let doc = if path.is_file() {
            self.store.update(&path, |existing| {
                let extra = std::mem::take(&mut existing.extra);
                *existing = WorkflowDocument { extra, ..fresh.clone() };
                Ok(Update::Save(existing.clone()))
            })?
        } else {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            self.store.save(&path, &fresh)?;
            fresh
        };

        tracing::info!(topic, steps = doc.total_steps(), "Workflow initialized");

        self.bus.emit(Event::workflow_initialized(topic));
        self.bus.emit(Event::workflow_started(topic, doc.total_steps()));
        if let Some(first) = doc.phases.first() {
            self.bus.emit(Event::phase_started(topic, &first.id));
        }

        Ok(doc)
    }

    /// Mark a pending step as in progress.
    ///
    /// Starting a step that is already in progress is a no-op. Completed and
    /// failed steps cannot be started; roll them back first. Dependencies
    /// are not checked here; see [`Self::validate_dependencies`].
    pub fn start(&self, topic: &str, step_id: &str) -> WorkflowResult<Step> {
        let path = self.existing_document(topic)?;

        let transition = self.store.update(&path, |doc| {
            let (pi, si) = doc.step_position(step_id).ok_or_else(|| WorkflowError::step_not_found(step_id))?;

            let status = doc.phases[pi].steps[si].status;
            match status {
                StepStatus::Pending => {}
                StepStatus::InProgress => {
                    tracing::debug!(topic, step = step_id, "Step already in progress");
                    let step = doc.phases[pi].steps[si].clone();
                    return Ok(Update::Discard(Transition { value: step, events: Vec::new() }));
                }
                StepStatus::Completed | StepStatus::Failed => {
                    return Err(WorkflowError::InvalidTransition { step_id: step_id.to_string(), status });
                }
            }

            let now = Utc::now();
            let mut events = Vec::new();
            let phase = &mut doc.phases[pi];
            if phase.status == PhaseStatus::Pending {
                phase.status = PhaseStatus::InProgress;
                phase.started_at = Some(now);
                events.push(Event::phase_started(topic, &phase.id));
            }

            let step = &mut phase.steps[si];
            step.status = StepStatus::InProgress;
            step.started_at = Some(now);
            let step = step.clone();
            let phase_id = phase.id.clone();

            push_audit(doc, now, AuditLevel::Info, &phase_id, step_id, AuditAction::Started, Map::new(), None);
            events.push(Event::step_started(topic, &phase_id, step_id));

            Ok(Update::Save(Transition { value: step, events }))
        })?;

        self.emit_all(transition.events);
        Ok(transition.value)
    }

    /// Check that every step and phase dependency of `step_id` is completed.
    pub fn validate_dependencies(&self, topic: &str, step_id: &str) -> WorkflowResult<DependencyCheck> {
        let doc = self.load(topic)?;
        let (phase, step) = doc.find_step(step_id).ok_or_else(|| WorkflowError::step_not_found(step_id))?;

        let step_deps = if step.depends_on.is_empty() {
            self.declared_step_deps(step_id)
        } else {
            step.depends_on.clone()
        };

        for dep in &step_deps {
            let done = doc.find_step(dep).is_some_and(|(_, s)| s.status == StepStatus::Completed);
            if !done {
                return Ok(DependencyCheck::blocked(format!("Dependency {dep} not complete")));
            }
        }

        for dep in &phase.depends_on {
            let done = doc.phase(dep).is_some_and(|p| p.status == PhaseStatus::Completed);
            if !done {
                return Ok(DependencyCheck::blocked(format!("Phase dependency {dep} not complete")));
            }
        }

        Ok(DependencyCheck::satisfied())
    }

    fn declared_step_deps(&self, step_id: &str) -> Vec<String> {
        self.definition
            .as_ref()
            .and_then(|d| d.find_step(step_id))
            .map(|(_, s)| s.depends_on.clone())
            .unwrap_or_default()
    }

    /// Mark a step completed with `result`, if its criteria pass.
    ///
    /// Rejected completions leave the document byte-for-byte unchanged.
    pub fn complete(
        &self,
        topic: &str,
        step_id: &str,
        result: Map<String, Value>,
    ) -> WorkflowResult<StepCompletion> {
        let start = Instant::now();
        let path = self.existing_document(topic)?;

        let transition = self.store.update(&path, |doc| {
            let (pi, si) = doc.step_position(step_id).ok_or_else(|| WorkflowError::step_not_found(step_id))?;

            let criteria = self.criteria_for(&doc.phases[pi].steps[si]);
            let outcome = CriteriaEvaluator::evaluate_all(&criteria, &result);
            if !outcome.all_passed {
                tracing::info!(topic, step = step_id, failed = ?outcome.failed_criteria, "Completion criteria not met");
                let rejected = StepCompletion::Rejected { failed_criteria: outcome.failed_criteria };
                return Ok(Update::Discard(Transition { value: rejected, events: Vec::new() }));
            }

            let now = Utc::now();
            let step = &mut doc.phases[pi].steps[si];
            step.status = StepStatus::Completed;
            step.completed_at = Some(now);
            step.result = Some(result.clone());
            let duration = step.elapsed_seconds(now);

            let phase_id = doc.phases[pi].id.clone();
            let mut events = vec![Event::step_completed(topic, &phase_id, step_id, &result)];

            let phase_completed =
                doc.phases[pi].status != PhaseStatus::Completed && doc.phases[pi].all_steps_completed();
            let mut workflow_completed = false;

            if phase_completed {
                let phase = &mut doc.phases[pi];
                phase.status = PhaseStatus::Completed;
                phase.completed_at = Some(now);
                let next_order = phase.order + 1;
                events.push(Event::phase_completed(topic, &phase_id));

                match doc.phase_index_by_order(next_order) {
                    Some(next) => {
                        let next_phase = &mut doc.phases[next];
                        doc.current_phase = Some(next_phase.id.clone());
                        if next_phase.status == PhaseStatus::Pending {
                            next_phase.status = PhaseStatus::InProgress;
                            next_phase.started_at = Some(now);
                            events.push(Event::phase_started(topic, &next_phase.id));
                        }
                    }
                    None => {
                        workflow_completed = doc.is_complete();
                        if workflow_completed {
                            events.push(Event::workflow_completed(topic));
                        }
                    }
                }
            }

            doc.current_step = doc.next_pending_step().map(str::to_string);
            let next_step = doc.current_step.clone();

            push_audit(doc, now, AuditLevel::Info, &phase_id, step_id, AuditAction::Completed, result.clone(), duration);

            let completed = StepCompletion::Completed { phase_completed, workflow_completed, next_step };
            Ok(Update::Save(Transition { value: completed, events }))
        })?;

        if transition.value.is_completed() {
            self.monitor.record_operation(COMPLETE_OPERATION, start.elapsed());
        }
        self.emit_all(transition.events);
        Ok(transition.value)
    }

    fn criteria_for(&self, step: &Step) -> Vec<String> {
        if !step.completion_criteria.is_empty() {
            return step.completion_criteria.clone();
        }
        self.definition
            .as_ref()
            .and_then(|d| d.find_step(&step.id))
            .map(|(_, s)| s.completion_criteria.clone())
            .unwrap_or_default()
    }

    /// Mark a step failed with `error`. Nothing is rolled back.
    pub fn fail(&self, topic: &str, step_id: &str, error: &str) -> WorkflowResult<()> {
        let path = self.existing_document(topic)?;

        let transition = self.store.update(&path, |doc| {
            let (pi, si) = doc.step_position(step_id).ok_or_else(|| WorkflowError::step_not_found(step_id))?;

            let now = Utc::now();
            let mut details = Map::new();
            details.insert("error".to_string(), Value::String(error.to_string()));

            let step = &mut doc.phases[pi].steps[si];
            step.status = StepStatus::Failed;
            step.completed_at = Some(now);
            step.result = Some(details.clone());
            let duration = step.elapsed_seconds(now);
            let phase_id = doc.phases[pi].id.clone();

            if doc.current_step.as_deref() == Some(step_id) {
                doc.current_step = doc.next_pending_step().map(str::to_string);
            }

            push_audit(doc, now, AuditLevel::Error, &phase_id, step_id, AuditAction::Failed, details, duration);

            let events = vec![Event::step_failed(topic, &phase_id, step_id, error)];
            Ok(Update::Save(Transition { value: (), events }))
        })?;

        tracing::warn!(topic, step = step_id, error, "Step failed");
        self.emit_all(transition.events);
        Ok(())
    }

    /// Snapshot a step for a later [`Self::rollback`]. `None` if the step
    /// does not exist.
    pub fn backup(&self, topic: &str, step_id: &str) -> WorkflowResult<Option<StepBackup>> {
        let doc = self.load(topic)?;
        Ok(doc.find_step(step_id).map(|(phase, step)| StepBackup {
            step_id: step.id.clone(),
            phase_id: phase.id.clone(),
            previous_state: step.clone(),
            timestamp: Utc::now(),
        }))
    }

    /// Restore a step from `backup`. Returns false, without touching the
    /// document, when there is no usable backup.
    pub fn rollback(&self, topic: &str, step_id: &str, backup: Option<&StepBackup>) -> WorkflowResult<bool> {
        let Some(backup) = backup else {
            tracing::warn!(topic, step = step_id, "No backup state, cannot roll back");
            return Ok(false);
        };
        if backup.step_id != step_id {
            tracing::warn!(topic, step = step_id, backup_step = %backup.step_id, "Backup belongs to another step");
            return Ok(false);
        }

        let path = self.existing_document(topic)?;
        self.store.update(&path, |doc| {
            let phase = doc
                .phases
                .iter_mut()
                .find(|p| p.id == backup.phase_id)
                .ok_or_else(|| WorkflowError::phase_not_found(&backup.phase_id))?;
            let step = phase
                .steps
                .iter_mut()
                .find(|s| s.id == backup.step_id)
                .ok_or_else(|| WorkflowError::step_not_found(&backup.step_id))?;

            *step = backup.previous_state.clone();

            let reopened = phase.status == PhaseStatus::Completed && !phase.all_steps_completed();
            if reopened {
                phase.status = PhaseStatus::InProgress;
                phase.completed_at = None;
                rewind_to_open_phase(doc);
            } else {
                repair_current_step(doc);
            }

            let details = rollback_details(backup.timestamp);
            push_audit(
                doc,
                Utc::now(),
                AuditLevel::Warning,
                &backup.phase_id,
                step_id,
                AuditAction::RolledBack,
                details,
                None,
            );
            Ok(Update::Save(()))
        })?;

        tracing::warn!(topic, step = step_id, "Step rolled back");
        Ok(true)
    }

    /// Whether re-running a step is safe.
    ///
    /// An explicit `idempotent` flag wins; otherwise step ids naming a
    /// read-only operation are treated as idempotent.
    pub fn is_step_idempotent(&self, topic: &str, step_id: &str) -> WorkflowResult<bool> {
        let doc = self.load(topic)?;
        let (_, step) = doc.find_step(step_id).ok_or_else(|| WorkflowError::step_not_found(step_id))?;

        let declared = step.idempotent.or_else(|| {
            self.definition.as_ref().and_then(|d| d.find_step(step_id)).and_then(|(_, s)| s.idempotent)
        });
        Ok(declared.unwrap_or_else(|| is_read_only_step(step_id)))
    }

    /// First pending step of the first unfinished phase.
    pub fn next_pending_step(&self, topic: &str) -> WorkflowResult<Option<String>> {
        Ok(self.load(topic)?.next_pending_step().map(str::to_string))
    }

    /// The most recent `limit` audit entries in append order, or all.
    pub fn audit_log(&self, topic: &str, limit: Option<usize>) -> WorkflowResult<Vec<AuditEntry>> {
        Ok(self.load(topic)?.recent_audit(limit).to_vec())
    }

    /// Progress summary for a topic.
    pub fn status(&self, topic: &str) -> WorkflowResult<WorkflowStatus> {
        let doc = self.load(topic)?;
        let phases = doc.progress();
        Ok(WorkflowStatus {
            topic: topic.to_string(),
            current_phase: doc.current_phase.clone(),
            current_step: doc.current_step.clone(),
            complete: doc.is_complete(),
            completed_steps: phases.iter().map(|p| p.completed).sum(),
            total_steps: doc.total_steps(),
            phases,
        })
    }

    fn emit_all(&self, events: Vec<Event>) {
        for event in events {
            self.bus.emit(event);
        }
    }
}

/// Name-based idempotency fallback.
pub fn is_read_only_step(step_id: &str) -> bool {
    IDEMPOTENT_PATTERNS.iter().any(|pattern| step_id.contains(pattern))
}

#[allow(clippy::too_many_arguments)]
fn push_audit(
    doc: &mut WorkflowDocument,
    timestamp: DateTime<Utc>,
    level: AuditLevel,
    phase_id: &str,
    step_id: &str,
    action: AuditAction,
    details: Map<String, Value>,
    duration_seconds: Option<f64>,
) {
    doc.audit_log.push(AuditEntry {
        timestamp,
        level,
        phase_id: phase_id.to_string(),
        step_id: step_id.to_string(),
        action,
        details,
        duration_seconds,
    });
}

fn rollback_details(backup_timestamp: DateTime<Utc>) -> Map<String, Value> {
    match json!({ "reason": "step_failure", "backupTimestamp": backup_timestamp.to_rfc3339() }) {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

/// Point `current_step` at a live step again after a restore.
fn repair_current_step(doc: &mut WorkflowDocument) {
    let live = doc
        .current_step
        .as_deref()
        .and_then(|id| doc.find_step(id))
        .is_some_and(|(_, s)| matches!(s.status, StepStatus::Pending | StepStatus::InProgress));
    if !live {
        doc.current_step = doc.next_pending_step().map(str::to_string);
    }
}

/// Move both pointers back to the earliest unfinished phase once a
/// completed phase has been reopened. Later phases with no work started
/// return to pending.
fn rewind_to_open_phase(doc: &mut WorkflowDocument) {
    let Some(open_order) =
        doc.phases.iter().filter(|p| p.status != PhaseStatus::Completed).map(|p| p.order).min()
    else {
        return;
    };

    for phase in doc.phases.iter_mut().filter(|p| p.order > open_order) {
        let untouched = phase.steps.iter().all(|s| s.status == StepStatus::Pending);
        if phase.status == PhaseStatus::InProgress && untouched {
            phase.status = PhaseStatus::Pending;
            phase.started_at = None;
        }
    }

    doc.current_phase = doc.phases.iter().find(|p| p.order == open_order).map(|p| p.id.clone());
    doc.current_step = doc.next_pending_step().map(str::to_string);
}

/// Parse a step result given as a JSON object.
pub fn parse_result(raw: &str) -> WorkflowResult<Map<String, Value>> {
    match serde_json::from_str::<Value>(raw)? {
        Value::Object(map) => Ok(map),
        other => Err(WorkflowError::InvalidDefinition(format!(
            "step result must be a JSON object, got {}",
            json_kind(&other)
        ))),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
