//! Cooperative signals exposed to a running work function.
//!
//! Neither signal interrupts anything. Work functions poll them at iteration
//! boundaries and decide how to stop.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

/// Externally requested cancellation of a task.
///
/// Clones share the same underlying state.
#[derive(Debug, Clone, Default)]
pub struct AbortSignal {
    token: CancellationToken,
}

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request an abort. Observed at the next poll boundary.
    pub fn abort(&self) {
        self.token.cancel();
    }

    pub fn is_aborted(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Awareness of the host's execution time limit.
pub trait TimeBudget: Send + Sync + fmt::Debug {
    /// Time left in the current execution window, `None` when unbounded.
    fn remaining(&self) -> Option<Duration>;

    /// True when the work function should checkpoint and return Continue.
    fn is_close_to_timeout(&self) -> bool;
}

/// Wall-clock deadline for one invocation.
#[derive(Debug, Clone)]
pub struct Deadline {
    started: Instant,
    budget: Option<Duration>,
    margin: Duration,
}

impl Deadline {
    /// Deadline `budget` from now, reported close to timeout once less than
    /// `margin` remains.
    pub fn new(budget: Duration, margin: Duration) -> Self {
        Self {
            started: Instant::now(),
            budget: Some(budget),
            margin,
        }
    }

    /// A deadline that never runs out.
    pub fn unbounded() -> Self {
        Self {
            started: Instant::now(),
            budget: None,
            margin: Duration::ZERO,
        }
    }
}

impl TimeBudget for Deadline {
    fn remaining(&self) -> Option<Duration> {
        self.budget
            .map(|budget| budget.saturating_sub(self.started.elapsed()))
    }

    fn is_close_to_timeout(&self) -> bool {
        self.remaining()
            .is_some_and(|remaining| remaining <= self.margin)
    }
}

/// Budget measured in timeout checks instead of time.
///
/// Reports close to timeout from the `checks + 1`-th call of
/// [`is_close_to_timeout`](TimeBudget::is_close_to_timeout) onwards, which
/// makes the amount of work per invocation deterministic.
#[derive(Debug)]
pub struct CountdownBudget {
    checks: u32,
    used: AtomicU32,
}

impl CountdownBudget {
    pub fn new(checks: u32) -> Self {
        Self {
            checks,
            used: AtomicU32::new(0),
        }
    }
}

impl TimeBudget for CountdownBudget {
    fn remaining(&self) -> Option<Duration> {
        None
    }

    fn is_close_to_timeout(&self) -> bool {
        self.used.fetch_add(1, Ordering::SeqCst) >= self.checks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_abort_signal_is_shared_between_clones() {
        let signal = AbortSignal::new();
        let observer = signal.clone();
        assert!(!observer.is_aborted());

        signal.abort();
        assert!(observer.is_aborted());
    }

    #[test]
    fn test_unbounded_deadline_never_times_out() {
        let deadline = Deadline::unbounded();
        assert!(deadline.remaining().is_none());
        assert!(!deadline.is_close_to_timeout());
    }

    #[test]
    fn test_deadline_inside_margin_is_close_to_timeout() {
        let deadline = Deadline::new(Duration::from_secs(5), Duration::from_secs(10));
        assert!(deadline.is_close_to_timeout());

        let deadline = Deadline::new(Duration::from_secs(600), Duration::from_secs(10));
        assert!(!deadline.is_close_to_timeout());
        assert!(deadline.remaining().unwrap() > Duration::from_secs(500));
    }

    #[test]
    fn test_countdown_budget() {
        let budget = CountdownBudget::new(2);
        assert!(!budget.is_close_to_timeout());
        assert!(!budget.is_close_to_timeout());
        assert!(budget.is_close_to_timeout());
        assert!(budget.is_close_to_timeout());
    }
}
