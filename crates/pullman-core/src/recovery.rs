//! Failure recovery
//!
//! Two cooperating pieces: a retry policy that maps a failure class
//! and attempt count to an action, and a stall detector that watches
//! byte counters for flatlines. Both are pure state; the core applies
//! their verdicts.

use crate::error::FailureClass;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::debug;
use uuid::Uuid;

/// Longest backoff between automatic retries.
const MAX_BACKOFF: Duration = Duration::from_secs(300);

/// What the supervisor should do with a failed task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Re-queue after the given delay, counting one attempt
    RetryAfter(Duration),
    /// Discard partial data and restart from scratch, once
    RestartClean,
    /// Give up and leave the task Failed
    GiveUp,
    /// Pause/cancel unwinding, not a failure
    Ignore,
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay_secs: u32) -> Self {
        Self {
            max_retries,
            base_delay: Duration::from_secs(base_delay_secs as u64),
        }
    }

    /// Exponential backoff for the given zero-based attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.min(16));
        let delay = self
            .base_delay
            .saturating_mul(factor.min(u32::MAX as u64) as u32);
        delay.min(MAX_BACKOFF)
    }

    /// Decide what happens after a failure.
    ///
    /// `attempt` is the number of retries already consumed for this
    /// task; `checksum_restarted` records whether its single clean
    /// restart was already spent.
    pub fn decide(
        &self,
        class: FailureClass,
        attempt: u32,
        checksum_restarted: bool,
    ) -> RecoveryAction {
        match class {
            FailureClass::Control => RecoveryAction::Ignore,
            FailureClass::Fatal => RecoveryAction::GiveUp,
            FailureClass::ChecksumMismatch => {
                if checksum_restarted {
                    RecoveryAction::GiveUp
                } else {
                    RecoveryAction::RestartClean
                }
            }
            FailureClass::Transient => {
                if attempt >= self.max_retries {
                    RecoveryAction::GiveUp
                } else {
                    RecoveryAction::RetryAfter(self.delay_for(attempt))
                }
            }
        }
    }
}

/// Per-task stall bookkeeping.
#[derive(Debug)]
struct StallEntry {
    last_bytes: u64,
    last_movement: Instant,
    /// One automatic pause/resume heal per stall episode
    healed: bool,
}

/// What to do with a task whose byte counter flatlined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StallVerdict {
    /// First flatline: bounce the connections with a pause/resume
    Heal,
    /// Flatlined again after a heal: fail with stall-timeout
    Fail,
}

/// Watches task byte counters and flags zero-progress windows.
#[derive(Debug)]
pub struct StallDetector {
    window: Duration,
    entries: Mutex<HashMap<Uuid, StallEntry>>,
}

impl StallDetector {
    pub fn new(window_secs: u32) -> Self {
        Self {
            window: Duration::from_secs(window_secs as u64),
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn window_secs(&self) -> u32 {
        self.window.as_secs() as u32
    }

    /// Feed the latest byte counter for an active task.
    pub fn observe(&self, id: Uuid, downloaded: u64) {
        let mut entries = self.entries.lock();
        match entries.get_mut(&id) {
            Some(entry) => {
                if downloaded > entry.last_bytes {
                    entry.last_bytes = downloaded;
                    entry.last_movement = Instant::now();
                    // Movement after a heal closes the episode.
                    entry.healed = false;
                }
            }
            None => {
                entries.insert(
                    id,
                    StallEntry {
                        last_bytes: downloaded,
                        last_movement: Instant::now(),
                        healed: false,
                    },
                );
            }
        }
    }

    /// A task left the active set; stop watching it.
    pub fn forget(&self, id: Uuid) {
        self.entries.lock().remove(&id);
    }

    /// Return every task whose counter has not moved for a full
    /// window, with the action its episode calls for.
    pub fn sweep(&self) -> Vec<(Uuid, StallVerdict)> {
        let mut entries = self.entries.lock();
        let mut verdicts = Vec::new();

        for (id, entry) in entries.iter_mut() {
            if entry.last_movement.elapsed() < self.window {
                continue;
            }
            if entry.healed {
                debug!("Transfer {} stalled again after heal", id);
                verdicts.push((*id, StallVerdict::Fail));
            } else {
                debug!("Transfer {} stalled, attempting heal", id);
                entry.healed = true;
                entry.last_movement = Instant::now();
                verdicts.push((*id, StallVerdict::Heal));
            }
        }

        verdicts
    }

    #[cfg(test)]
    fn backdate(&self, id: Uuid, by: Duration) {
        if let Some(entry) = self.entries.lock().get_mut(&id) {
            entry.last_movement = Instant::now() - by;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy::new(10, 2);
        assert_eq!(policy.delay_for(0), Duration::from_secs(2));
        assert_eq!(policy.delay_for(1), Duration::from_secs(4));
        assert_eq!(policy.delay_for(2), Duration::from_secs(8));
        assert_eq!(policy.delay_for(12), MAX_BACKOFF);
    }

    #[test]
    fn transient_retries_until_budget_spent() {
        let policy = RetryPolicy::new(3, 2);
        assert!(matches!(
            policy.decide(FailureClass::Transient, 0, false),
            RecoveryAction::RetryAfter(_)
        ));
        assert!(matches!(
            policy.decide(FailureClass::Transient, 2, false),
            RecoveryAction::RetryAfter(_)
        ));
        assert_eq!(
            policy.decide(FailureClass::Transient, 3, false),
            RecoveryAction::GiveUp
        );
    }

    #[test]
    fn checksum_gets_exactly_one_restart() {
        let policy = RetryPolicy::new(5, 2);
        assert_eq!(
            policy.decide(FailureClass::ChecksumMismatch, 0, false),
            RecoveryAction::RestartClean
        );
        assert_eq!(
            policy.decide(FailureClass::ChecksumMismatch, 1, true),
            RecoveryAction::GiveUp
        );
    }

    #[test]
    fn fatal_and_control_take_no_retries() {
        let policy = RetryPolicy::new(5, 2);
        assert_eq!(
            policy.decide(FailureClass::Fatal, 0, false),
            RecoveryAction::GiveUp
        );
        assert_eq!(
            policy.decide(FailureClass::Control, 0, false),
            RecoveryAction::Ignore
        );
    }

    #[test]
    fn stall_heals_once_then_fails() {
        let detector = StallDetector::new(60);
        let id = Uuid::new_v4();
        detector.observe(id, 1000);

        // No movement for a full window -> heal
        detector.backdate(id, Duration::from_secs(61));
        let verdicts = detector.sweep();
        assert_eq!(verdicts, vec![(id, StallVerdict::Heal)]);

        // Still no movement -> fail
        detector.backdate(id, Duration::from_secs(61));
        let verdicts = detector.sweep();
        assert_eq!(verdicts, vec![(id, StallVerdict::Fail)]);
    }

    #[test]
    fn progress_resets_the_episode() {
        let detector = StallDetector::new(60);
        let id = Uuid::new_v4();
        detector.observe(id, 1000);

        detector.backdate(id, Duration::from_secs(61));
        assert_eq!(detector.sweep(), vec![(id, StallVerdict::Heal)]);

        // Bytes moved after the heal: episode over.
        detector.observe(id, 2000);
        detector.backdate(id, Duration::from_secs(61));
        assert_eq!(detector.sweep(), vec![(id, StallVerdict::Heal)]);
    }

    #[test]
    fn moving_tasks_are_never_flagged() {
        let detector = StallDetector::new(60);
        let id = Uuid::new_v4();
        detector.observe(id, 1000);
        detector.observe(id, 2000);
        assert!(detector.sweep().is_empty());
    }
}
