//! Retry/backoff policy for backend failures
//!
//! Kept separate from the state machine so the failure-count → delay mapping
//! and the restart/reinit decision can be tested on their own.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;

/// Multiplier applied per consecutive failure
const BACKOFF_FACTOR: f64 = 1.5;

/// Maps consecutive failures to a retry delay: `base * 1.5^(n-1)`, capped.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
    /// Soft restarts allowed before the backend instance is rebuilt
    pub max_soft_restarts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(1000),
            max: Duration::from_secs(10),
            max_soft_restarts: 3,
        }
    }
}

impl BackoffPolicy {
    /// Delay before retrying after the `attempts`-th consecutive failure (1-based).
    pub fn delay(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(64) as i32;
        let millis = self.base.as_millis() as f64 * BACKOFF_FACTOR.powi(exponent);
        let capped = millis.min(self.max.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }
}

/// Counters feeding the backoff policy.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct AttemptStats {
    /// Consecutive failures since the last successful transcript
    pub attempts: u32,
    pub successes: u32,
    pub last_accuracy: Option<f32>,
}

impl AttemptStats {
    pub fn record_failure(&mut self) -> u32 {
        self.attempts = self.attempts.saturating_add(1);
        self.attempts
    }

    pub fn record_success(&mut self, accuracy: f32) {
        self.attempts = 0;
        self.successes = self.successes.saturating_add(1);
        self.last_accuracy = Some(accuracy);
    }
}

/// What to do about a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartPlan {
    /// Terminal: report and stay down
    Surface,
    /// Stop and start the same backend instance after `delay`
    Restart { delay: Duration },
    /// Ask for microphone permission again after `delay`
    Reprompt { delay: Duration },
    /// Tear down the backend instance and build a fresh one after `delay`
    Reinitialize { delay: Duration },
}

impl RestartPlan {
    pub fn delay(&self) -> Option<Duration> {
        match self {
            RestartPlan::Surface => None,
            RestartPlan::Restart { delay }
            | RestartPlan::Reprompt { delay }
            | RestartPlan::Reinitialize { delay } => Some(*delay),
        }
    }
}

/// Tracks restart history between successful transcripts.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RetryTracker {
    soft_restarts: u32,
    last_kind: Option<ErrorKind>,
    reinit_count: u64,
}

impl RetryTracker {
    /// Decide how to recover from a failure of `kind`, given the consecutive
    /// failure count (already including this failure).
    pub fn plan(&mut self, kind: ErrorKind, attempts: u32, policy: &BackoffPolicy) -> RestartPlan {
        let previous = self.last_kind.replace(kind);

        if kind.is_terminal() {
            return RestartPlan::Surface;
        }

        let delay = match kind {
            ErrorKind::Aborted => Duration::ZERO,
            ErrorKind::DeviceBusy => policy.base.min(policy.max),
            _ => policy.delay(attempts),
        };

        if kind == ErrorKind::PermissionTimeout {
            return RestartPlan::Reprompt { delay };
        }

        let repeated_unknown =
            kind == ErrorKind::Unknown && previous == Some(ErrorKind::Unknown);

        if self.soft_restarts >= policy.max_soft_restarts || repeated_unknown {
            self.soft_restarts = 0;
            self.reinit_count += 1;
            log::warn!(
                "Backoff: {} after {} soft restarts, rebuilding backend (reinit #{})",
                kind,
                policy.max_soft_restarts,
                self.reinit_count
            );
            return RestartPlan::Reinitialize { delay };
        }

        self.soft_restarts += 1;
        RestartPlan::Restart { delay }
    }

    /// Called on a successful transcript.
    pub fn reset(&mut self) {
        self.soft_restarts = 0;
        self.last_kind = None;
    }

    pub fn reinit_count(&self) -> u64 {
        self.reinit_count
    }

    pub fn soft_restarts(&self) -> u32 {
        self.soft_restarts
    }
}
