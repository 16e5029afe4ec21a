//! Dispatcher configuration.

use std::sync::Arc;
use std::time::Duration;

use crate::signal::{CountdownBudget, Deadline, TimeBudget};

/// How much work a single invocation may do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BudgetPolicy {
    /// Wall-clock window, close to timeout once `margin_secs` remain.
    Deadline { budget_secs: u64, margin_secs: u64 },

    /// A fixed number of timeout checks per invocation.
    Checks(u32),

    /// Never close to timeout.
    Unbounded,
}

impl BudgetPolicy {
    /// Fresh budget for one invocation.
    pub fn start(&self) -> Arc<dyn TimeBudget> {
        match *self {
            Self::Deadline {
                budget_secs,
                margin_secs,
            } => Arc::new(Deadline::new(
                Duration::from_secs(budget_secs),
                Duration::from_secs(margin_secs),
            )),
            Self::Checks(checks) => Arc::new(CountdownBudget::new(checks)),
            Self::Unbounded => Arc::new(Deadline::unbounded()),
        }
    }
}

/// Local dispatcher configuration.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Upper bound of invocations per task in `run_to_completion`.
    pub max_iterations: u32,

    /// Budget handed to each invocation.
    pub budget: BudgetPolicy,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            // 15 minute execution window, checkpoint with 3 minutes to spare.
            budget: BudgetPolicy::Deadline {
                budget_secs: 900,
                margin_secs: 180,
            },
        }
    }
}
