use std::sync::{
  atomic::{AtomicU64, Ordering},
  Arc,
};

/// Process-level counters, read by the admin surface. Constructed once and
/// passed into the components that bump them.
#[derive(Debug, Default)]
pub struct FocusStats {
  pub conferences_created: AtomicU64,
  pub participants: AtomicU64,
  pub participants_moved: AtomicU64,
  pub bridges_failed: AtomicU64,
  pub bridges_removed: AtomicU64,
  pub jibri_failures: AtomicU64,
  /// Keepalive pings answered on the XMPP stream.
  pub pings_answered: AtomicU64,
}

impl FocusStats {
  pub fn new() -> Arc<FocusStats> {
    Arc::new(Default::default())
  }

  pub fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
  }

  pub fn bump_by(counter: &AtomicU64, n: u64) {
    counter.fetch_add(n, Ordering::Relaxed);
  }

  /// Decrements without wrapping, in case releases outnumber acquisitions.
  pub fn drop_one(counter: &AtomicU64) {
    let _ = counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |value| {
      value.checked_sub(1)
    });
  }

  pub fn read(counter: &AtomicU64) -> u64 {
    counter.load(Ordering::Relaxed)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn counters_accumulate() {
    let stats = FocusStats::new();
    FocusStats::bump(&stats.participants_moved);
    FocusStats::bump_by(&stats.participants_moved, 2);
    assert_eq!(FocusStats::read(&stats.participants_moved), 3);
  }

  #[test]
  fn gauge_never_goes_negative() {
    let stats = FocusStats::new();
    FocusStats::bump(&stats.participants);
    FocusStats::drop_one(&stats.participants);
    FocusStats::drop_one(&stats.participants);
    assert_eq!(FocusStats::read(&stats.participants), 0);
  }
}
