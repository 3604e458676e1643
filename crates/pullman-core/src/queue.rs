//! Admission queue
//!
//! Pure in-memory state: which tasks hold a transfer slot and which
//! are waiting for one. Promotion order is priority descending, then
//! submission time ascending. Lowering the cap never preempts running
//! tasks; the surplus drains as they finish.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use pullman_types::QueueInfo;
use std::collections::HashSet;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct PendingEntry {
    pub id: Uuid,
    pub priority: i32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug)]
struct AdmissionState {
    max_concurrent: usize,
    active: HashSet<Uuid>,
    pending: Vec<PendingEntry>,
}

/// Decides which queued tasks may run. The caller owns the side
/// effects: this type only moves ids between the pending and active
/// sets.
#[derive(Debug)]
pub struct AdmissionController {
    state: RwLock<AdmissionState>,
}

impl AdmissionController {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            state: RwLock::new(AdmissionState {
                max_concurrent: max_concurrent.max(1),
                active: HashSet::new(),
                pending: Vec::new(),
            }),
        }
    }

    /// Add a task to the waiting line. Duplicate ids are ignored.
    pub fn enqueue(&self, entry: PendingEntry) {
        let mut state = self.state.write();
        if state.active.contains(&entry.id) || state.pending.iter().any(|e| e.id == entry.id) {
            return;
        }
        debug!("Queued {} at priority {}", entry.id, entry.priority);
        state.pending.push(entry);
        sort_pending(&mut state.pending);
    }

    /// Pop every task that fits under the cap, marking them active.
    pub fn take_admissible(&self) -> Vec<Uuid> {
        let mut state = self.state.write();
        let mut admitted = Vec::new();
        while state.active.len() < state.max_concurrent && !state.pending.is_empty() {
            let entry = state.pending.remove(0);
            state.active.insert(entry.id);
            admitted.push(entry.id);
        }
        admitted
    }

    /// A task stopped holding its slot (completed, failed, paused or
    /// cancelled).
    pub fn release(&self, id: Uuid) {
        self.state.write().active.remove(&id);
    }

    /// Forget a task entirely, wherever it sits.
    pub fn forget(&self, id: Uuid) {
        let mut state = self.state.write();
        state.active.remove(&id);
        state.pending.retain(|e| e.id != id);
    }

    /// Raise or lower the cap. Never interrupts running tasks: when
    /// lowered below the active count, the surplus drains naturally.
    pub fn set_max_concurrent(&self, max: usize) {
        self.state.write().max_concurrent = max.max(1);
    }

    /// Reflect a priority change for a task still waiting.
    pub fn reprioritize(&self, id: Uuid, priority: i32) {
        let mut state = self.state.write();
        if let Some(entry) = state.pending.iter_mut().find(|e| e.id == id) {
            entry.priority = priority;
            sort_pending(&mut state.pending);
        }
    }

    pub fn is_active(&self, id: Uuid) -> bool {
        self.state.read().active.contains(&id)
    }

    pub fn snapshot(&self, aggregate_speed: u64) -> QueueInfo {
        let state = self.state.read();
        QueueInfo {
            active_count: state.active.len(),
            queued_count: state.pending.len(),
            max_concurrent: state.max_concurrent,
            aggregate_speed,
        }
    }
}

fn sort_pending(pending: &mut [PendingEntry]) {
    pending.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then(a.created_at.cmp(&b.created_at))
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(priority: i32) -> PendingEntry {
        PendingEntry {
            id: Uuid::new_v4(),
            priority,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn cap_is_never_exceeded() {
        let ctl = AdmissionController::new(2);
        for _ in 0..5 {
            ctl.enqueue(entry(0));
        }

        assert_eq!(ctl.take_admissible().len(), 2);
        assert!(ctl.take_admissible().is_empty());

        let info = ctl.snapshot(0);
        assert_eq!(info.active_count, 2);
        assert_eq!(info.queued_count, 3);
    }

    #[test]
    fn priority_beats_submission_order() {
        let ctl = AdmissionController::new(1);
        let low = entry(0);
        let high = entry(10);
        ctl.enqueue(low.clone());
        ctl.enqueue(high.clone());

        assert_eq!(ctl.take_admissible(), vec![high.id]);
        ctl.release(high.id);
        assert_eq!(ctl.take_admissible(), vec![low.id]);
    }

    #[test]
    fn equal_priority_is_fifo() {
        let ctl = AdmissionController::new(3);
        let mut first = entry(5);
        let mut second = entry(5);
        first.created_at = Utc::now() - chrono::Duration::seconds(10);
        second.created_at = Utc::now();
        ctl.enqueue(second.clone());
        ctl.enqueue(first.clone());

        assert_eq!(ctl.take_admissible(), vec![first.id, second.id]);
    }

    #[test]
    fn lowering_the_cap_never_preempts() {
        let ctl = AdmissionController::new(4);
        for _ in 0..4 {
            ctl.enqueue(entry(0));
        }
        assert_eq!(ctl.take_admissible().len(), 4);

        ctl.set_max_concurrent(2);
        assert_eq!(ctl.snapshot(0).active_count, 4);

        // New work waits until the surplus drains below the new cap.
        ctl.enqueue(entry(0));
        assert!(ctl.take_admissible().is_empty());

        let active_before = ctl.snapshot(0).active_count;
        assert_eq!(active_before, 4);
    }

    #[test]
    fn released_slots_go_to_the_next_in_line() {
        let ctl = AdmissionController::new(1);
        let a = entry(0);
        let b = entry(0);
        ctl.enqueue(a.clone());
        ctl.enqueue(b.clone());

        assert_eq!(ctl.take_admissible(), vec![a.id]);
        ctl.release(a.id);
        assert_eq!(ctl.take_admissible(), vec![b.id]);
    }

    #[test]
    fn forget_removes_from_both_sets() {
        let ctl = AdmissionController::new(1);
        let a = entry(0);
        let b = entry(0);
        ctl.enqueue(a.clone());
        ctl.enqueue(b.clone());
        ctl.take_admissible();

        ctl.forget(a.id);
        ctl.forget(b.id);
        let info = ctl.snapshot(0);
        assert_eq!(info.active_count, 0);
        assert_eq!(info.queued_count, 0);
    }

    #[test]
    fn duplicate_enqueue_is_ignored() {
        let ctl = AdmissionController::new(2);
        let a = entry(0);
        ctl.enqueue(a.clone());
        ctl.enqueue(a.clone());
        assert_eq!(ctl.take_admissible(), vec![a.id]);
        assert_eq!(ctl.snapshot(0).queued_count, 0);
    }
}
