//! Bounded reconnect-and-retry policy for session jobs.
//!
//! Unlike a long-lived listener, a job submitter must not spin forever
//! against a dead server: a job that hits a transport failure gets a
//! fixed number of reconnect-and-retry rounds (one by default), each
//! after [`ReconnectConfig::delay`], and then fails back to its caller.

use std::time::Duration;

/// Tunable parameters for the per-job retry budget.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Pause before reconnecting after a transport failure.
    pub delay: Duration,
    /// Reconnect-and-retry rounds allowed per job.
    pub max_job_retries: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(1),
            max_job_retries: 1,
        }
    }
}

/// Retry bookkeeping for one job.
#[derive(Debug, Clone)]
pub struct RetryBudget {
    remaining: u32,
    used: u32,
}

impl RetryBudget {
    pub fn new(config: &ReconnectConfig) -> Self {
        Self {
            remaining: config.max_job_retries,
            used: 0,
        }
    }

    /// Consume one retry. Returns the 1-based retry number, or `None`
    /// when the budget is exhausted.
    pub fn take(&mut self) -> Option<u32> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        self.used += 1;
        Some(self.used)
    }

    pub fn used(&self) -> u32 {
        self.used
    }
}
