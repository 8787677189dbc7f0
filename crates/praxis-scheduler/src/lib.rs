//! Praxis Scheduler
//!
//! Time-driven re-instantiation of templates and client followup
//! reminders. The [`RecurrenceScheduler`] polls for due
//! `RecurringSchedule` rows at a fixed interval, fires the instantiator
//! for each, and advances `next_run_at` from its *previous* value — never
//! from the wall clock — so consecutive runs never drift. If the scheduler
//! was offline past a due time, a schedule gets a single catch-up run and
//! then jumps straight to the next future slot.
//!
//! The poll loop runs as at most one logical instance: each tick must
//! acquire the [`LeaderLock`] before doing any work, which is the only
//! cross-instance shared resource in the subsystem.

mod leader;
mod recurrence;
mod scheduler;

pub use leader::{LeaderLock, LocalLeaderLock};
pub use recurrence::{advance, next_after_run};
pub use scheduler::{RecurrenceScheduler, SchedulerConfig};
