//! Scheduler leadership.
//!
//! Every poll tick must hold the leader lock for its duration. In a single
//! process [`LocalLeaderLock`] is enough; multi-replica deployments plug
//! in a distributed lock behind the same trait.

use std::sync::atomic::{AtomicBool, Ordering};

/// A lock held for the duration of one scheduler tick.
pub trait LeaderLock: Send + Sync {
  /// Try to become the leader for one tick. `false` means another replica
  /// holds the lock; the tick is skipped, which is not an error.
  fn try_acquire(&self) -> impl std::future::Future<Output = bool> + Send;

  /// Release after the tick.
  fn release(&self) -> impl std::future::Future<Output = ()> + Send;
}

/// Process-local leader lock.
#[derive(Debug, Default)]
pub struct LocalLeaderLock {
  held: AtomicBool,
}

impl LocalLeaderLock {
  pub fn new() -> Self {
    Self::default()
  }
}

impl LeaderLock for LocalLeaderLock {
  async fn try_acquire(&self) -> bool {
    self
      .held
      .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
      .is_ok()
  }

  async fn release(&self) {
    self.held.store(false, Ordering::Release);
  }
}
