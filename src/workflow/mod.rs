//! Topic workflow state machine.
//!
//! A topic's progress lives in one JSON document that is only ever changed
//! through [`WorkflowManager`].
//!
//! ## Pieces
//!
//! - [`WorkflowDefinition`] - static phases and steps, read from JSON or YAML
//! - [`WorkflowDocument`] - the persisted, typed state of one topic
//! - [`StateStore`] - locked, atomic reads and writes of documents
//! - [`CriteriaEvaluator`] - completion criteria such as `files > 0`
//! - [`WorkflowManager`] - start, complete, fail, backup and rollback

mod criteria;
mod definition;
mod documents;
mod error;
mod lock;
mod manager;
mod store;

pub use criteria::{CriteriaEvaluator, CriteriaOutcome, Criterion, Literal, Operator};
pub use definition::{PhaseDefinition, StepDefinition, WorkflowDefinition, WorkflowLayout};
pub use documents::{
    AuditAction, AuditEntry, AuditLevel, Phase, PhaseProgress, PhaseStatus, Step, StepBackup,
    StepStatus, WorkflowDocument,
};
pub use error::{WorkflowError, WorkflowResult};
pub use lock::{lock_path, FileLock};
pub use manager::{
    is_read_only_step, parse_result, DependencyCheck, StepCompletion, WorkflowManager,
    WorkflowStatus, COMPLETE_OPERATION,
};
pub use store::{InvalidationHook, StateStore, Update};
