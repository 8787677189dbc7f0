//! Praxis Actions
//!
//! This crate dispatches the side effects configured on workflow nodes:
//! notifications, external agent invocations, endpoint calls, and
//! visibility changes. Dispatch is decoupled from the state transition that
//! triggered it — the transition commit is authoritative whether or not the
//! action succeeds.
//!
//! Each action runs on its own spawned task with a bounded retry policy
//! (exponential backoff, max attempts). Exhausted retries are recorded and
//! logged, never propagated back into the progression engine. A
//! cancellation-driven suppression set drops actions for nodes that were
//! cancelled before their actions got dispatched.

mod collaborators;
mod error;
mod executor;
mod render;

pub use collaborators::{
  AgentInvoker, CorrelationRegistrar, EndpointCaller, NoopCollaborators, Notifier,
};
pub use error::ActionError;
pub use executor::{ActionExecutor, FailedAction, NodeActions, SuppressionSet};
pub use render::render_value;
