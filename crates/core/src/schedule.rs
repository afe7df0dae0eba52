//! Cancellable delayed work and cooldown tracking.
//!
//! Both run on tokio's clock, so tests drive them with a paused runtime
//! instead of real sleeps.

use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// A callback scheduled to run once after a delay.
///
/// Dropping the task cancels it, so whoever owns the task owns the timer.
#[derive(Debug)]
pub struct ScheduledTask {
    handle: JoinHandle<()>,
    deadline: Instant,
}

impl ScheduledTask {
    pub fn after<F>(delay: Duration, callback: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self::after_async(delay, async move { callback() })
    }

    pub fn after_async<Fut>(delay: Duration, work: Fut) -> Self
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        let deadline = Instant::now() + delay;
        let handle = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            work.await;
        });
        Self { handle, deadline }
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub fn cancel(self) {
        // Drop does the work
    }
}

impl Drop for ScheduledTask {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Rejects attempts that come sooner than `period` after the last accepted one.
#[derive(Debug, Clone)]
pub struct Cooldown {
    period: Duration,
    last: Option<Instant>,
}

impl Cooldown {
    pub fn new(period: Duration) -> Self {
        Self { period, last: None }
    }

    pub fn is_ready(&self) -> bool {
        match self.last {
            Some(last) => last.elapsed() >= self.period,
            None => true,
        }
    }

    /// Records an attempt if the cooldown has elapsed.
    pub fn try_begin(&mut self) -> bool {
        if !self.is_ready() {
            return false;
        }
        self.last = Some(Instant::now());
        true
    }

    pub fn remaining(&self) -> Duration {
        match self.last {
            Some(last) => self.period.saturating_sub(last.elapsed()),
            None => Duration::ZERO,
        }
    }
}
