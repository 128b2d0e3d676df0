//! In-process pub-sub for per-task progress, keyed by task id.
//!
//! `tokio::sync::watch::channel` is a structural match for "replay the last
//! value on subscribe": a fresh `watch::Receiver` always observes the most
//! recently sent value before any further sends. Terminal values close the
//! per-key replay cache after a grace period so long-idle tasks don't leak.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use uuid::Uuid;

/// Grace period after a terminal value before the replay cache entry for a
/// task id is dropped.
const TERMINAL_GRACE: Duration = Duration::from_secs(60);

/// A single progress update for a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub task_id: Uuid,
    /// `-1..=100`; `-1` and `100` are terminal.
    pub progress: i32,
    pub message: Option<String>,
    pub emitted_at: DateTime<Utc>,
}

impl ProgressEvent {
    pub fn is_terminal(&self) -> bool {
        self.progress == 100 || self.progress == -1
    }
}

/// A subscription handle returned by [`ProgressBus::subscribe`].
pub struct ProgressSubscription {
    pub task_id: Uuid,
    receiver: watch::Receiver<ProgressEvent>,
}

impl ProgressSubscription {
    /// Await the next update (or the replayed last value, on first call).
    pub async fn recv(&mut self) -> Option<ProgressEvent> {
        if self.receiver.changed().await.is_err() {
            return None;
        }
        Some(self.receiver.borrow().clone())
    }

    /// The most recently published value without waiting.
    pub fn latest(&self) -> ProgressEvent {
        self.receiver.borrow().clone()
    }
}

struct Slot {
    sender: watch::Sender<ProgressEvent>,
}

/// Keyed publisher/observer registry for task progress.
#[derive(Default)]
pub struct ProgressBus {
    slots: Mutex<HashMap<Uuid, Slot>>,
}

impl ProgressBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a progress value for `task_id`, creating the slot if this is
    /// the first publish. Fire-and-forget: publishing never blocks on
    /// subscriber presence.
    pub fn publish(&self, task_id: Uuid, progress: i32, message: Option<String>) {
        let event = ProgressEvent {
            task_id,
            progress,
            message,
            emitted_at: Utc::now(),
        };

        let mut slots = self.slots.lock().unwrap();
        match slots.get(&task_id) {
            Some(slot) => {
                let _ = slot.sender.send(event.clone());
            }
            None => {
                let (sender, _receiver) = watch::channel(event.clone());
                slots.insert(task_id, Slot { sender });
            }
        }
        drop(slots);

        if event.is_terminal() {
            self.schedule_expiry(task_id);
        }
    }

    /// Subscribe to updates for `task_id`. The returned subscription
    /// immediately replays the last published value.
    pub fn subscribe(&self, task_id: Uuid) -> Option<ProgressSubscription> {
        let slots = self.slots.lock().unwrap();
        let slot = slots.get(&task_id)?;
        Some(ProgressSubscription {
            task_id,
            receiver: slot.sender.subscribe(),
        })
    }

    /// Drop the replay slot for `task_id` immediately (normally this
    /// happens automatically 60s after a terminal publish).
    pub fn unsubscribe(&self, task_id: Uuid) {
        self.slots.lock().unwrap().remove(&task_id);
    }

    fn schedule_expiry(&self, task_id: Uuid) {
        // ProgressBus is always held behind an Arc by callers; expiry is
        // scheduled by the caller via `schedule_expiry_arc` to avoid a
        // self-referential spawn here. See `PublishHandle`.
        let _ = task_id;
    }
}

/// An `Arc<ProgressBus>` wrapper that can schedule its own slot expiry.
///
/// Split from [`ProgressBus`] because spawning a cleanup task needs a
/// `'static` handle to the bus, which a bare `&self` method cannot provide.
#[derive(Clone)]
pub struct SharedProgressBus(std::sync::Arc<ProgressBus>);

impl SharedProgressBus {
    pub fn new() -> Self {
        Self(std::sync::Arc::new(ProgressBus::new()))
    }

    pub fn publish(&self, task_id: Uuid, progress: i32, message: Option<String>) {
        self.0.publish(task_id, progress, message);
        if progress == 100 || progress == -1 {
            let bus = std::sync::Arc::clone(&self.0);
            tokio::spawn(async move {
                tokio::time::sleep(TERMINAL_GRACE).await;
                bus.unsubscribe(task_id);
            });
        }
    }

    pub fn subscribe(&self, task_id: Uuid) -> Option<ProgressSubscription> {
        self.0.subscribe(task_id)
    }

    pub fn unsubscribe(&self, task_id: Uuid) {
        self.0.unsubscribe(task_id);
    }
}

impl Default for SharedProgressBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribe_replays_last_value() {
        let bus = ProgressBus::new();
        let task_id = Uuid::new_v4();
        bus.publish(task_id, 40, None);

        let mut sub = bus.subscribe(task_id).expect("slot should exist");
        assert_eq!(sub.latest().progress, 40);

        bus.publish(task_id, 80, None);
        let next = sub.recv().await.expect("should receive update");
        assert_eq!(next.progress, 80);
    }

    #[tokio::test]
    async fn progress_monotone_and_terminal_detected() {
        let bus = ProgressBus::new();
        let task_id = Uuid::new_v4();
        bus.publish(task_id, 0, None);
        bus.publish(task_id, 50, None);
        bus.publish(task_id, 100, None);

        let sub = bus.subscribe(task_id).unwrap();
        assert!(sub.latest().is_terminal());
    }

    #[test]
    fn subscribe_before_any_publish_returns_none() {
        let bus = ProgressBus::new();
        assert!(bus.subscribe(Uuid::new_v4()).is_none());
    }
}
