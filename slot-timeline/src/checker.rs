//! Cooperative liveness and cancellation, polled at loop heads and before each commit.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use chrono::TimeDelta;
use parking_lot::Mutex;

use crate::{clock::Clock, error::Interrupt, range::Timestamp};

/// Liveness hooks a long-running unit of work reports into.
pub trait LivenessCheck: Send + Sync {
    /// Resets the liveness timeout.
    fn set_active(&self);
    /// Suspends the timeout around an operation known to block for long.
    fn pause_check(&self);
    fn resume_check(&self);
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NoopLiveness;

impl LivenessCheck for NoopLiveness {
    fn set_active(&self) {}
    fn pause_check(&self) {}
    fn resume_check(&self) {}
}

/// Per-worker heartbeat watched by the engine's health report.
#[derive(Debug)]
pub struct LivenessChecker {
    last_active: Mutex<Instant>,
    paused: AtomicBool,
}

impl LivenessChecker {
    pub fn new() -> Self {
        Self {
            last_active: Mutex::new(Instant::now()),
            paused: AtomicBool::new(false),
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Relaxed)
    }

    pub fn idle_for(&self) -> Duration {
        self.last_active.lock().elapsed()
    }

    /// A paused check is never stale.
    pub fn is_stale(&self, timeout: Duration) -> bool {
        !self.is_paused() && self.idle_for() > timeout
    }
}

impl Default for LivenessChecker {
    fn default() -> Self {
        Self::new()
    }
}

impl LivenessCheck for LivenessChecker {
    fn set_active(&self) {
        *self.last_active.lock() = Instant::now();
    }

    fn pause_check(&self) {
        self.paused.store(true, Ordering::Relaxed);
    }

    fn resume_check(&self) {
        self.set_active();
        self.paused.store(false, Ordering::Relaxed);
    }
}

#[derive(Clone, Debug, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }
}

/// Everything a reconciliation step polls: liveness, cancellation and its time budget.
pub struct StepContext<'a> {
    clock: &'a dyn Clock,
    liveness: &'a dyn LivenessCheck,
    cancel: &'a CancellationToken,
    deadline: Option<Timestamp>,
}

impl<'a> StepContext<'a> {
    pub fn new(
        clock: &'a dyn Clock,
        liveness: &'a dyn LivenessCheck,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            clock,
            liveness,
            cancel,
            deadline: None,
        }
    }

    /// Only set while a smaller step is still possible; otherwise the step may overrun.
    pub fn with_budget(mut self, started: Timestamp, budget: TimeDelta) -> Self {
        self.deadline = Some(started + budget);
        self
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock
    }

    pub fn liveness(&self) -> &dyn LivenessCheck {
        self.liveness
    }

    pub fn checkpoint(&self) -> Result<(), Interrupt> {
        self.liveness.set_active();
        if self.cancel.is_cancelled() {
            return Err(Interrupt::Cancelled);
        }
        self.check_deadline()
    }

    pub fn check_deadline(&self) -> Result<(), Interrupt> {
        match self.deadline {
            Some(deadline) if self.clock.now() > deadline => Err(Interrupt::StepTimeout),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::{TimeZone, Utc};

    #[test]
    fn checkpoint_reports_cancel_before_timeout() {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        let cancel = CancellationToken::new();
        let ctx = StepContext::new(&clock, &NoopLiveness, &cancel)
            .with_budget(clock.now(), TimeDelta::seconds(8));
        assert_eq!(ctx.checkpoint(), Ok(()));

        clock.advance(TimeDelta::seconds(9));
        assert_eq!(ctx.checkpoint(), Err(Interrupt::StepTimeout));

        cancel.cancel();
        assert_eq!(ctx.checkpoint(), Err(Interrupt::Cancelled));
    }

    #[test]
    fn unbudgeted_context_never_times_out() {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        let cancel = CancellationToken::new();
        let ctx = StepContext::new(&clock, &NoopLiveness, &cancel);
        clock.advance(TimeDelta::days(3));
        assert_eq!(ctx.checkpoint(), Ok(()));
    }

    #[test]
    fn paused_checker_is_never_stale() {
        let checker = LivenessChecker::new();
        checker.pause_check();
        assert!(!checker.is_stale(Duration::ZERO));
        checker.resume_check();
        assert!(!checker.is_paused());
    }
}
