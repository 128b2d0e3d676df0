//! Map of task id → cancellation token + metadata.
//!
//! Uses `tokio_util::sync::CancellationToken`, threaded through the engine
//! and scheduler so a manual cancel or shutdown can interrupt a run between
//! phases.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Default grace period an entry survives past its terminal mark before
/// [`CancellationRegistry::cleanup`] purges it.
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(3_600);

/// Default interval between [`CancellationRegistry::spawn_cleanup`] sweeps.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(10 * 60);

struct Entry {
    token: CancellationToken,
    started_at: DateTime<Utc>,
    metadata: serde_json::Value,
    terminal_at: Option<DateTime<Utc>>,
}

/// Status snapshot for a single task id.
#[derive(Debug, Clone)]
pub struct CancellationStatus {
    pub exists: bool,
    pub running: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub metadata: serde_json::Value,
}

/// Registry of in-flight cancellation tokens, one per running task.
#[derive(Default)]
pub struct CancellationRegistry {
    entries: Mutex<HashMap<Uuid, Entry>>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent upsert: registering an already-registered task id
    /// replaces its token and metadata.
    pub fn register(&self, task_id: Uuid, token: CancellationToken, metadata: serde_json::Value) {
        let mut entries = self.entries.lock().unwrap();
        entries.insert(
            task_id,
            Entry {
                token,
                started_at: Utc::now(),
                metadata,
                terminal_at: None,
            },
        );
    }

    /// Cancel a single task's token. Returns `false` if the task is
    /// unknown or already terminal (cancel is a no-op once terminal).
    pub fn cancel(&self, task_id: Uuid) -> bool {
        let entries = self.entries.lock().unwrap();
        match entries.get(&task_id) {
            Some(entry) if entry.terminal_at.is_none() => {
                entry.token.cancel();
                true
            }
            _ => false,
        }
    }

    /// Cancel every non-terminal entry, returning the count cancelled.
    pub fn cancel_all(&self) -> usize {
        let entries = self.entries.lock().unwrap();
        let mut count = 0;
        for entry in entries.values() {
            if entry.terminal_at.is_none() {
                entry.token.cancel();
                count += 1;
            }
        }
        count
    }

    pub fn status(&self, task_id: Uuid) -> CancellationStatus {
        let entries = self.entries.lock().unwrap();
        match entries.get(&task_id) {
            Some(entry) => CancellationStatus {
                exists: true,
                running: entry.terminal_at.is_none(),
                started_at: Some(entry.started_at),
                metadata: entry.metadata.clone(),
            },
            None => CancellationStatus {
                exists: false,
                running: false,
                started_at: None,
                metadata: serde_json::Value::Null,
            },
        }
    }

    /// Mark a task terminal. No further `cancel` call will have effect.
    pub fn complete(&self, task_id: Uuid) {
        let mut entries = self.entries.lock().unwrap();
        if let Some(entry) = entries.get_mut(&task_id) {
            entry.terminal_at = Some(Utc::now());
        }
    }

    /// Purge entries that went terminal more than `max_age` ago. Returns
    /// the count purged.
    pub fn cleanup(&self, max_age: Duration) -> usize {
        let now = Utc::now();
        let mut entries = self.entries.lock().unwrap();
        let before = entries.len();
        entries.retain(|_, entry| match entry.terminal_at {
            Some(terminal_at) => {
                let age = now.signed_duration_since(terminal_at);
                age.to_std().map(|d| d < max_age).unwrap_or(true)
            }
            None => true,
        });
        before - entries.len()
    }

    /// Spawn a background loop that sweeps terminal entries older than
    /// `max_age` every `interval`. Returns the task handle so the caller
    /// can abort it on shutdown, mirroring `HealthMonitor::spawn`.
    pub fn spawn_cleanup(self: &Arc<Self>, interval: Duration, max_age: Duration) -> tokio::task::JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let purged = registry.cleanup(max_age);
                if purged > 0 {
                    tracing::debug!(purged, "cancellation registry sweep purged terminal entries");
                }
            }
        })
    }
}
