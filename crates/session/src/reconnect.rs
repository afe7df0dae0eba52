use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::debug;

use loralink_core::Cooldown;

use crate::config::ReconnectConfig;

/// A reconnect attempt in progress. Stale once a newer attempt starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attempt {
    generation: u64,
    silent: bool,
}

impl Attempt {
    pub fn is_silent(&self) -> bool {
        self.silent
    }
}

/// Decides when the last session may be restored.
///
/// Automatic attempts go through a cooldown and a one-shot latch; a failed
/// automatic attempt re-arms the latch. Manual attempts skip both and
/// supersede whatever automatic attempt is still running.
pub struct ReconnectionCoordinator {
    cooldown: Mutex<Cooldown>,
    latched: AtomicBool,
    in_flight: AtomicBool,
    restored: AtomicBool,
    generation: AtomicU64,
}

impl ReconnectionCoordinator {
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            cooldown: Mutex::new(Cooldown::new(config.cooldown)),
            latched: AtomicBool::new(false),
            in_flight: AtomicBool::new(false),
            restored: AtomicBool::new(false),
            generation: AtomicU64::new(0),
        }
    }

    pub fn try_begin_auto(&self) -> Option<Attempt> {
        if self.restored.load(Ordering::SeqCst) || self.in_flight.load(Ordering::SeqCst) {
            debug!("Auto reconnect skipped: already restored or in flight");
            return None;
        }
        if self.latched.load(Ordering::SeqCst) {
            debug!("Auto reconnect skipped: already attempted");
            return None;
        }
        if !self.cooldown.lock().try_begin() {
            debug!("Auto reconnect skipped: cooling down");
            return None;
        }
        self.latched.store(true, Ordering::SeqCst);
        Some(self.begin(true))
    }

    pub fn begin_manual(&self) -> Attempt {
        self.begin(false)
    }

    fn begin(&self, silent: bool) -> Attempt {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.in_flight.store(true, Ordering::SeqCst);
        Attempt { generation, silent }
    }

    pub fn is_current(&self, attempt: &Attempt) -> bool {
        self.generation.load(Ordering::SeqCst) == attempt.generation
    }

    /// Invalidates any running attempt, e.g. when the user picks a room.
    pub fn supersede(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.in_flight.store(false, Ordering::SeqCst);
    }

    /// Records how an attempt ended. Superseded attempts are ignored.
    pub fn finish(&self, attempt: Attempt, success: bool) {
        if !self.is_current(&attempt) {
            debug!("Reconnect attempt {} was superseded", attempt.generation);
            return;
        }
        self.in_flight.store(false, Ordering::SeqCst);
        if success {
            self.restored.store(true, Ordering::SeqCst);
        } else if attempt.silent {
            self.latched.store(false, Ordering::SeqCst);
        }
    }

    /// Forgets a restored session, e.g. after the user left the room.
    pub fn reset(&self) {
        self.restored.store(false, Ordering::SeqCst);
    }

    pub fn is_restored(&self) -> bool {
        self.restored.load(Ordering::SeqCst)
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn should_offer_manual(&self, has_last_room: bool) -> bool {
        has_last_room && !self.is_restored() && !self.is_in_flight()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn coordinator() -> ReconnectionCoordinator {
        ReconnectionCoordinator::new(ReconnectConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_attempt_is_latched() {
        let c = coordinator();
        let attempt = c.try_begin_auto().unwrap();
        assert!(attempt.is_silent());
        assert!(c.try_begin_auto().is_none());

        c.finish(attempt, true);
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(c.try_begin_auto().is_none());
        assert!(c.is_restored());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_attempt_rearms_after_cooldown() {
        let c = coordinator();
        let attempt = c.try_begin_auto().unwrap();
        c.finish(attempt, false);

        assert!(c.try_begin_auto().is_none());
        tokio::time::sleep(Duration::from_secs(9)).await;
        assert!(c.try_begin_auto().is_none());
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(c.try_begin_auto().is_some());
    }

    #[tokio::test]
    async fn test_manual_supersedes_silent() {
        let c = coordinator();
        let silent = c.try_begin_auto().unwrap();
        let manual = c.begin_manual();
        assert!(!c.is_current(&silent));

        c.finish(silent, false);
        assert!(c.is_in_flight());
        c.finish(manual, true);
        assert!(!c.is_in_flight());
        assert!(c.is_restored());
    }

    #[tokio::test]
    async fn test_offer_manual_reconnect() {
        let c = coordinator();
        assert!(!c.should_offer_manual(false));
        assert!(c.should_offer_manual(true));

        let attempt = c.try_begin_auto().unwrap();
        assert!(!c.should_offer_manual(true));
        c.finish(attempt, false);
        assert!(c.should_offer_manual(true));

        let attempt = c.begin_manual();
        c.finish(attempt, true);
        assert!(!c.should_offer_manual(true));
        c.reset();
        assert!(c.should_offer_manual(true));
    }
}
