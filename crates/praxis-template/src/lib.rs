//! Praxis Template
//!
//! This crate contains the authored workflow template types for Praxis.
//! A template is an ordered Stage → Step → Task hierarchy with per-node
//! automation metadata: an `auto_progress` flag, an optional progress
//! condition, and an ordered list of completion actions.
//!
//! Templates are edited as drafts and frozen at publish. Publishing
//! validates the tree (unique sibling order, unique node keys, condition
//! references scoped to the referencing node's own subtree) and bumps the
//! monotonic version. Prior published versions remain resolvable so that
//! assignments created from them can always trace their origin.

mod action;
mod condition;
mod error;
mod node;
mod store;
mod template;

pub use action::{ActionKind, ActionSpec, Recipient, RetryBackoff, RetryPolicy};
pub use condition::{Comparator, Condition, ConditionError, EvalContext};
pub use error::{TemplateError, ValidationError};
pub use node::{ChecklistTemplate, StageTemplate, StepTemplate, SubtaskTemplate, TaskTemplate};
pub use store::{MemoryTemplateStore, TemplateStore};
pub use template::{TemplateScope, WorkflowTemplate};
