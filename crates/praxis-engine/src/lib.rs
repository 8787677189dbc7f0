//! Praxis Engine
//!
//! The core of Praxis: instantiating published templates into per-client
//! assignment trees and driving those trees through the hierarchical state
//! machine as completion events arrive.
//!
//! The [`ProgressionEngine`] consumes completion events — a user or agent
//! finishing a task, checklist items being checked, subtasks completing —
//! evaluates completion rules and progress conditions (fail-closed),
//! advances the assignment's current pointer, and cascades completion
//! bottom-up through steps and stages. Every event commits through the
//! repository's optimistic-concurrency token: of two racing writers,
//! exactly one wins and the other sees `ConcurrencyConflict`.
//!
//! [`WorkflowService`] is the facade the rest of the application calls; it
//! unifies human events and asynchronous agent replies (routed by
//! correlation id) into the same `report_completion` entry point.

mod correlation;
mod error;
mod instantiate;
mod progression;
mod service;

pub use correlation::CorrelationRegistry;
pub use error::EngineError;
pub use instantiate::{InstantiateRequest, Instantiator};
pub use progression::{AgentResult, AssignmentSnapshot, CompletionEvidence, ProgressionEngine};
pub use service::WorkflowService;
