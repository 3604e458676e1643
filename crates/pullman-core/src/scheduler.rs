//! Time-based download scheduler
//!
//! Holds the scheduled-entry table and runs a single loop that sleeps
//! until the earliest enabled fire time, fires the template through a
//! channel, and advances the recurrence. Entries missed while the
//! process was down fire once at startup, then their clock catches up
//! past the present.

use crate::engine::RecordStore;
use crate::error::PullmanError;
use chrono::{DateTime, Duration as ChronoDuration, Months, Utc};
use pullman_types::{DownloadRequest, RecurrenceRule, ScheduledEntry};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Upper bound on one sleep so clock jumps are noticed.
const MAX_SLEEP: Duration = Duration::from_secs(60);

/// A due entry, handed to the core for task creation.
#[derive(Debug, Clone)]
pub struct FiredEntry {
    pub entry_id: Uuid,
    pub template: DownloadRequest,
}

pub struct Scheduler {
    entries: Arc<RwLock<HashMap<Uuid, ScheduledEntry>>>,
    store: RecordStore,
    wake: Arc<Notify>,
    fired_tx: mpsc::UnboundedSender<FiredEntry>,
}

impl Scheduler {
    pub fn new(store: RecordStore) -> (Self, mpsc::UnboundedReceiver<FiredEntry>) {
        let (fired_tx, fired_rx) = mpsc::unbounded_channel();
        (
            Self {
                entries: Arc::new(RwLock::new(HashMap::new())),
                store,
                wake: Arc::new(Notify::new()),
                fired_tx,
            },
            fired_rx,
        )
    }

    /// Load persisted entries. Overdue ones fire once right away, then
    /// their next_fire advances past the present.
    pub async fn load(&self) -> Result<(), PullmanError> {
        let now = Utc::now();
        let mut entries = self.entries.write().await;

        for mut entry in self.store.load_scheduled().await? {
            if entry.enabled && entry.next_fire <= now {
                info!(
                    "Scheduled entry {} was due at {}, firing now",
                    entry.id, entry.next_fire
                );
                let _ = self.fired_tx.send(FiredEntry {
                    entry_id: entry.id,
                    template: entry.template.clone(),
                });
                entry.last_fired = Some(now);
                match advance_past(entry.next_fire, entry.recurrence, now) {
                    Some(next) => entry.next_fire = next,
                    None => entry.enabled = false,
                }
                self.store.upsert_scheduled(&entry).await?;
            }
            entries.insert(entry.id, entry);
        }

        info!("Scheduler loaded {} entries", entries.len());
        Ok(())
    }

    pub async fn add(&self, entry: ScheduledEntry) -> Result<(), PullmanError> {
        self.store.upsert_scheduled(&entry).await?;
        self.entries.write().await.insert(entry.id, entry);
        self.wake.notify_one();
        Ok(())
    }

    pub async fn update(&self, entry: ScheduledEntry) -> Result<(), PullmanError> {
        if !self.entries.read().await.contains_key(&entry.id) {
            return Err(PullmanError::NotFound(entry.id));
        }
        self.store.upsert_scheduled(&entry).await?;
        self.entries.write().await.insert(entry.id, entry);
        self.wake.notify_one();
        Ok(())
    }

    pub async fn remove(&self, id: Uuid) -> Result<(), PullmanError> {
        self.entries
            .write()
            .await
            .remove(&id)
            .ok_or(PullmanError::NotFound(id))?;
        self.store.delete_scheduled(id).await?;
        self.wake.notify_one();
        Ok(())
    }

    pub async fn set_enabled(&self, id: Uuid, enabled: bool) -> Result<(), PullmanError> {
        let mut entries = self.entries.write().await;
        let entry = entries.get_mut(&id).ok_or(PullmanError::NotFound(id))?;
        entry.enabled = enabled;

        // Re-enabling an entry whose time passed while disabled resets
        // it forward instead of firing a backlog.
        if enabled {
            let now = Utc::now();
            if entry.next_fire <= now {
                match advance_past(entry.next_fire, entry.recurrence, now) {
                    Some(next) => entry.next_fire = next,
                    None => entry.enabled = false,
                }
            }
        }

        self.store.upsert_scheduled(entry).await?;
        self.wake.notify_one();
        Ok(())
    }

    pub async fn list(&self) -> Vec<ScheduledEntry> {
        let mut all: Vec<ScheduledEntry> = self.entries.read().await.values().cloned().collect();
        all.sort_by_key(|e| e.next_fire);
        all
    }

    /// Run the fire loop until the entry table drops.
    pub async fn run(&self) {
        loop {
            let sleep = self.next_sleep().await;
            tokio::select! {
                _ = tokio::time::sleep(sleep) => {}
                _ = self.wake.notified() => continue,
            }
            if let Err(e) = self.fire_due().await {
                warn!("Scheduler fire pass failed: {}", e);
            }
        }
    }

    async fn next_sleep(&self) -> Duration {
        let entries = self.entries.read().await;
        let now = Utc::now();
        entries
            .values()
            .filter(|e| e.enabled)
            .map(|e| e.next_fire)
            .min()
            .map(|next| {
                if next <= now {
                    Duration::ZERO
                } else {
                    (next - now).to_std().unwrap_or(Duration::ZERO).min(MAX_SLEEP)
                }
            })
            .unwrap_or(MAX_SLEEP)
    }

    async fn fire_due(&self) -> Result<(), PullmanError> {
        let now = Utc::now();
        let mut entries = self.entries.write().await;

        for entry in entries.values_mut() {
            if !entry.enabled || entry.next_fire > now {
                continue;
            }

            debug!("Firing scheduled entry {}", entry.id);
            let _ = self.fired_tx.send(FiredEntry {
                entry_id: entry.id,
                template: entry.template.clone(),
            });
            entry.last_fired = Some(now);

            match advance_past(entry.next_fire, entry.recurrence, now) {
                Some(next) => entry.next_fire = next,
                None => entry.enabled = false,
            }

            self.store.upsert_scheduled(entry).await?;
        }

        Ok(())
    }
}

/// The occurrence directly after `after`, per the recurrence rule.
/// Month steps use calendar arithmetic, so Jan 31 clamps to Feb 28/29.
pub fn next_occurrence(rule: RecurrenceRule, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match rule {
        RecurrenceRule::None => None,
        RecurrenceRule::Hourly => Some(after + ChronoDuration::hours(1)),
        RecurrenceRule::Daily => Some(after + ChronoDuration::days(1)),
        RecurrenceRule::Weekly => Some(after + ChronoDuration::weeks(1)),
        RecurrenceRule::Monthly => after.checked_add_months(Months::new(1)),
        RecurrenceRule::Every(secs) => Some(after + ChronoDuration::seconds(secs.max(1) as i64)),
    }
}

/// Step the clock forward until it lands strictly after `now`. Missed
/// occurrences collapse; a fire never yields a past fire time.
pub fn advance_past(
    mut next: DateTime<Utc>,
    rule: RecurrenceRule,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    loop {
        next = next_occurrence(rule, next)?;
        if next > now {
            return Some(next);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn daily_advances_exactly_one_day() {
        let fire = Utc.with_ymd_and_hms(2026, 3, 10, 2, 0, 0).unwrap();
        let now = fire + ChronoDuration::seconds(1);
        let next = advance_past(fire, RecurrenceRule::Daily, now).unwrap();
        assert_eq!(next, fire + ChronoDuration::days(1));
        assert!(next > now);
    }

    #[test]
    fn missed_occurrences_collapse_to_one() {
        let fire = Utc.with_ymd_and_hms(2026, 3, 1, 2, 0, 0).unwrap();
        // Ten days offline: the clock lands on the next future slot,
        // not ten stacked fires.
        let now = Utc.with_ymd_and_hms(2026, 3, 11, 1, 0, 0).unwrap();
        let next = advance_past(fire, RecurrenceRule::Daily, now).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 3, 11, 2, 0, 0).unwrap());
    }

    #[test]
    fn monthly_clamps_short_months() {
        let fire = Utc.with_ymd_and_hms(2026, 1, 31, 12, 0, 0).unwrap();
        let next = next_occurrence(RecurrenceRule::Monthly, fire).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 2, 28, 12, 0, 0).unwrap());
    }

    #[test]
    fn one_shot_yields_nothing_after_fire() {
        let fire = Utc.with_ymd_and_hms(2026, 3, 10, 2, 0, 0).unwrap();
        assert!(next_occurrence(RecurrenceRule::None, fire).is_none());
        assert!(advance_past(fire, RecurrenceRule::None, Utc::now()).is_none());
    }

    #[test]
    fn fixed_interval_steps_by_seconds() {
        let fire = Utc.with_ymd_and_hms(2026, 3, 10, 2, 0, 0).unwrap();
        let next = next_occurrence(RecurrenceRule::Every(900), fire).unwrap();
        assert_eq!(next, fire + ChronoDuration::seconds(900));
    }

    #[tokio::test]
    async fn due_entry_fires_once_with_future_next_fire() {
        let dir = tempfile::tempdir().unwrap();
        let store = RecordStore::new(dir.path().join("sched.db")).await.unwrap();
        let (scheduler, mut fired_rx) = Scheduler::new(store.clone());

        let entry = ScheduledEntry::new(
            DownloadRequest::new("https://example.com/nightly.iso"),
            Utc::now() - ChronoDuration::seconds(5),
            RecurrenceRule::Daily,
        );
        let entry_id = entry.id;
        store.upsert_scheduled(&entry).await.unwrap();

        scheduler.load().await.unwrap();

        let fired = fired_rx.recv().await.unwrap();
        assert_eq!(fired.entry_id, entry_id);
        assert!(fired_rx.try_recv().is_err());

        let entries = scheduler.list().await;
        assert_eq!(entries.len(), 1);
        assert!(entries[0].next_fire > Utc::now());
        assert!(entries[0].last_fired.is_some());
    }

    #[tokio::test]
    async fn one_shot_disables_after_catch_up_fire() {
        let dir = tempfile::tempdir().unwrap();
        let store = RecordStore::new(dir.path().join("sched.db")).await.unwrap();
        let (scheduler, mut fired_rx) = Scheduler::new(store.clone());

        let entry = ScheduledEntry::new(
            DownloadRequest::new("https://example.com/once.zip"),
            Utc::now() - ChronoDuration::minutes(10),
            RecurrenceRule::None,
        );
        store.upsert_scheduled(&entry).await.unwrap();

        scheduler.load().await.unwrap();
        assert!(fired_rx.recv().await.is_some());

        let entries = scheduler.list().await;
        assert!(!entries[0].enabled);
    }
}
