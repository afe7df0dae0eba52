//! User-facing download progress, keyed by adapter name.
//!
//! Chunk-level `transfer:*` events are folded into one [`DownloadProgress`]
//! per adapter and re-published as `download:progress`. Completed entries
//! linger for [`DownloadConfig::completed_retention`] so a UI can show the
//! finished state, then disappear.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tracing::debug;

use loralink_core::{
    DownloadProgress, DownloadStatus, Event, EventBus, EventKind, ScheduledTask,
    SubscriptionHandle, TransferFailure, TransferProgress,
};

use crate::config::DownloadConfig;

struct Entry {
    topic: String,
    progress: DownloadProgress,
    prune: Option<ScheduledTask>,
}

struct TrackerInner {
    bus: EventBus,
    config: DownloadConfig,
    entries: Mutex<HashMap<String, Entry>>,
}

impl TrackerInner {
    /// Applies `update` to the entry downloading `topic` and publishes the result.
    fn update_by_topic<F>(&self, topic: &str, update: F) -> Option<DownloadProgress>
    where
        F: FnOnce(&mut DownloadProgress),
    {
        let snapshot = {
            let mut entries = self.entries.lock();
            let entry = entries
                .values_mut()
                .find(|entry| entry.topic == topic && !entry.progress.status.is_finished())?;
            update(&mut entry.progress);
            entry.progress.clone()
        };
        self.bus.publish(Event::DownloadProgress(snapshot.clone()));
        Some(snapshot)
    }

    fn prune(&self, name: &str, topic: &str) {
        let mut entries = self.entries.lock();
        let completed = entries.get(name).map_or(false, |entry| {
            entry.topic == topic && entry.progress.status == DownloadStatus::Completed
        });
        if completed {
            entries.remove(name);
            debug!("Pruned finished download {}", name);
        }
    }
}

#[derive(Clone)]
pub struct DownloadTracker {
    inner: Arc<TrackerInner>,
}

impl DownloadTracker {
    pub fn new(bus: EventBus, config: DownloadConfig) -> Self {
        Self {
            inner: Arc::new(TrackerInner {
                bus,
                config,
                entries: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Follows `transfer:progress` and `transfer:error` on the tracker's bus.
    pub fn attach(&self) -> Vec<SubscriptionHandle> {
        let bus = &self.inner.bus;
        let progress: Weak<TrackerInner> = Arc::downgrade(&self.inner);
        let errors = progress.clone();

        vec![
            bus.subscribe(EventKind::TransferProgress, move |event| {
                if let (Some(inner), Event::TransferProgress(p)) = (progress.upgrade(), event) {
                    apply_progress(&inner, p);
                }
                Ok(())
            }),
            bus.subscribe(EventKind::TransferError, move |event| {
                if let (
                    Some(inner),
                    Event::TransferError {
                        topic,
                        failure,
                        message,
                    },
                ) = (errors.upgrade(), event)
                {
                    apply_failure(&inner, topic, *failure, message);
                }
                Ok(())
            }),
        ]
    }

    /// Registers a new download, replacing any finished entry of the same name.
    pub fn start(&self, name: &str, topic: &str, total_bytes: u64) -> DownloadProgress {
        let progress = DownloadProgress::started(name, total_bytes);
        self.inner.entries.lock().insert(
            name.to_string(),
            Entry {
                topic: topic.to_string(),
                progress: progress.clone(),
                prune: None,
            },
        );
        self.inner
            .bus
            .publish(Event::DownloadProgress(progress.clone()));
        progress
    }

    /// Marks the download of `topic` as stored and schedules its removal.
    pub fn complete(&self, topic: &str) -> Option<DownloadProgress> {
        let done = self.inner.update_by_topic(topic, |p| {
            p.status = DownloadStatus::Completed;
            p.progress = 100.0;
            p.downloaded_bytes = p.total_bytes;
        })?;

        let weak = Arc::downgrade(&self.inner);
        let name = done.adapter_name.clone();
        let prune_topic = topic.to_string();
        let task = ScheduledTask::after(self.inner.config.completed_retention, move || {
            if let Some(inner) = weak.upgrade() {
                inner.prune(&name, &prune_topic);
            }
        });
        if let Some(entry) = self.inner.entries.lock().get_mut(&done.adapter_name) {
            entry.prune = Some(task);
        }
        Some(done)
    }

    /// Marks the download of `topic` as failed for a reason outside the transfer.
    pub fn fail(&self, topic: &str, message: &str) -> Option<DownloadProgress> {
        self.inner.update_by_topic(topic, |p| {
            p.status = DownloadStatus::Error;
            p.error = Some(message.to_string());
        })
    }

    pub fn get(&self, name: &str) -> Option<DownloadProgress> {
        self.inner
            .entries
            .lock()
            .get(name)
            .map(|entry| entry.progress.clone())
    }

    pub fn is_downloading(&self, name: &str) -> bool {
        self.get(name)
            .map_or(false, |p| p.status == DownloadStatus::Downloading)
    }

    pub fn list(&self) -> Vec<DownloadProgress> {
        let mut list: Vec<DownloadProgress> = self
            .inner
            .entries
            .lock()
            .values()
            .map(|entry| entry.progress.clone())
            .collect();
        list.sort_by(|a, b| a.adapter_name.cmp(&b.adapter_name));
        list
    }

    /// Drops a finished entry. In-flight downloads are kept.
    pub fn dismiss(&self, name: &str) -> bool {
        let mut entries = self.inner.entries.lock();
        match entries.get(name) {
            Some(entry) if entry.progress.status.is_finished() => {
                entries.remove(name);
                true
            }
            _ => false,
        }
    }
}

fn apply_progress(inner: &TrackerInner, progress: &TransferProgress) {
    inner.update_by_topic(&progress.topic, |p| {
        p.progress = progress.percent();
        p.downloaded_bytes = progress.received_bytes;
    });
}

fn apply_failure(inner: &TrackerInner, topic: &str, failure: TransferFailure, message: &str) {
    inner.update_by_topic(topic, |p| {
        p.status = match failure {
            TransferFailure::Cancelled => DownloadStatus::Cancelled,
            _ => DownloadStatus::Error,
        };
        p.error = Some(message.to_string());
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn tracker() -> (EventBus, DownloadTracker, Vec<SubscriptionHandle>) {
        let bus = EventBus::new();
        let tracker = DownloadTracker::new(bus.clone(), DownloadConfig::default());
        let handles = tracker.attach();
        (bus, tracker, handles)
    }

    fn transfer_progress(topic: &str, received: u32, total: u32) -> Event {
        Event::TransferProgress(TransferProgress {
            topic: topic.to_string(),
            received_chunks: received,
            total_chunks: total,
            received_bytes: u64::from(received) * 10,
        })
    }

    #[tokio::test]
    async fn test_progress_is_republished_per_adapter() {
        let (bus, tracker, _handles) = tracker();
        let mut downloads = bus.channel(&[EventKind::DownloadProgress]);

        tracker.start("gemma-lora-v1", "t1", 40);
        bus.publish(transfer_progress("t1", 1, 4));
        bus.publish(transfer_progress("other", 1, 2));

        let seen: Vec<DownloadProgress> = std::iter::from_fn(|| downloads.try_recv())
            .filter_map(|e| match e {
                Event::DownloadProgress(p) => Some(p),
                _ => None,
            })
            .collect();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[1].progress, 25.0);
        assert_eq!(seen[1].downloaded_bytes, 10);
        assert_eq!(seen[1].status, DownloadStatus::Downloading);
    }

    #[tokio::test]
    async fn test_transfer_errors_finish_the_entry() {
        let (bus, tracker, _handles) = tracker();
        tracker.start("a", "t1", 10);
        tracker.start("b", "t2", 10);

        bus.publish(Event::TransferError {
            topic: "t1".into(),
            failure: TransferFailure::ChunkValidation,
            message: "chunk 0 failed".into(),
        });
        bus.publish(Event::TransferError {
            topic: "t2".into(),
            failure: TransferFailure::Cancelled,
            message: "cancelled".into(),
        });

        let a = tracker.get("a").unwrap();
        assert_eq!(a.status, DownloadStatus::Error);
        assert_eq!(a.error.as_deref(), Some("chunk 0 failed"));
        assert_eq!(tracker.get("b").unwrap().status, DownloadStatus::Cancelled);

        // late progress for a finished download changes nothing
        bus.publish(transfer_progress("t1", 1, 1));
        assert_eq!(tracker.get("a").unwrap().progress, 0.0);
        assert!(tracker.dismiss("a"));
        assert!(tracker.get("a").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_completed_entries_are_pruned() {
        let (_bus, tracker, _handles) = tracker();
        tracker.start("gemma-lora-v1", "t1", 40);
        let done = tracker.complete("t1").unwrap();
        assert_eq!(done.status, DownloadStatus::Completed);
        assert_eq!(done.downloaded_bytes, 40);
        assert!(!tracker.dismiss("missing"));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(tracker.get("gemma-lora-v1").is_some());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(tracker.get("gemma-lora-v1").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_restarted_download_survives_old_prune() {
        let (_bus, tracker, _handles) = tracker();
        tracker.start("a", "t1", 10);
        tracker.complete("t1");
        tracker.start("a", "t2", 10);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(tracker.is_downloading("a"));
    }
}
