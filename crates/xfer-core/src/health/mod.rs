//! Periodic liveness probe for the repository and both SQL Server
//! connections, with threshold-triggered recovery and a cool-down to avoid
//! recovery storms.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::repository::TaskRepository;
use crate::supervisor::{ConnectionSupervisor, ServerKey};

const DATABASE_THRESHOLD: u32 = 3;
const CONNECTION_THRESHOLD: u32 = 5;
const COOLDOWN: Duration = Duration::from_secs(30 * 60);
const MAX_RECOVERY_ATTEMPTS: u32 = 3;

/// What kind of out-of-band error another component observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Database,
    Connection,
}

struct Counters {
    database: u32,
    connection: u32,
    recovery_attempts: u32,
    cooldown_until: Option<Instant>,
    manual_intervention_required: bool,
}

impl Default for Counters {
    fn default() -> Self {
        Self {
            database: 0,
            connection: 0,
            recovery_attempts: 0,
            cooldown_until: None,
            manual_intervention_required: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HealthConfig {
    pub probe_interval: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_secs(5 * 60),
        }
    }
}

/// Periodic probe driving database/connection recovery.
pub struct HealthMonitor {
    repo: Arc<dyn TaskRepository>,
    supervisor: Arc<ConnectionSupervisor>,
    config: HealthConfig,
    counters: Mutex<Counters>,
}

impl HealthMonitor {
    pub fn new(repo: Arc<dyn TaskRepository>, supervisor: Arc<ConnectionSupervisor>, config: HealthConfig) -> Arc<Self> {
        Arc::new(Self {
            repo,
            supervisor,
            config,
            counters: Mutex::new(Counters::default()),
        })
    }

    /// Spawn the periodic probe loop. Returns the task handle so the
    /// caller can abort it on shutdown.
    pub fn spawn(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(monitor.config.probe_interval).await;
                monitor.tick().await;
            }
        })
    }

    /// Let another component bump a counter out-of-band and fast-track the
    /// next probe.
    pub async fn register_error(&self, kind: ErrorKind, err: &str) {
        warn!(?kind, error = err, "out-of-band health error registered");
        {
            let mut counters = self.counters.lock().unwrap();
            match kind {
                ErrorKind::Database => counters.database += 1,
                ErrorKind::Connection => counters.connection += 1,
            }
        }
        self.tick().await;
    }

    async fn tick(&self) {
        if self.in_cooldown() {
            return;
        }

        let repo_ok = self.probe_repository().await;
        let a_ok = self.supervisor.diagnose(ServerKey::A).await.ok;
        let b_ok = self.supervisor.diagnose(ServerKey::B).await.ok;
        let connections_ok = a_ok && b_ok;

        let (database_count, connection_count) = {
            let mut counters = self.counters.lock().unwrap();
            if !repo_ok {
                counters.database += 1;
            }
            if !connections_ok {
                counters.connection += 1;
            }
            if repo_ok && connections_ok {
                counters.database = 0;
                counters.connection = 0;
            }
            (counters.database, counters.connection)
        };

        if database_count >= DATABASE_THRESHOLD {
            self.recover("database reachability", || async {
                info!("database recovery: repository connection will be re-opened on next use");
            })
            .await;
        }

        if connection_count >= CONNECTION_THRESHOLD {
            self.recover("connection reachability", || async {
                self.supervisor.close_all();
                tokio::time::sleep(Duration::from_secs(5)).await;
            })
            .await;
        }
    }

    fn in_cooldown(&self) -> bool {
        let counters = self.counters.lock().unwrap();
        if counters.manual_intervention_required {
            return true;
        }
        match counters.cooldown_until {
            Some(until) => Instant::now() < until,
            None => false,
        }
    }

    async fn recover<F, Fut>(&self, reason: &str, action: F)
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = ()>,
    {
        let attempts = {
            let mut counters = self.counters.lock().unwrap();
            counters.recovery_attempts += 1;
            if counters.recovery_attempts > MAX_RECOVERY_ATTEMPTS {
                counters.manual_intervention_required = true;
                error!(reason, "recovery attempts exhausted, manual intervention required");
                return;
            }
            counters.recovery_attempts
        };

        warn!(reason, attempt = attempts, "triggering recovery");
        action().await;

        let mut counters = self.counters.lock().unwrap();
        counters.database = 0;
        counters.connection = 0;
        counters.cooldown_until = Some(Instant::now() + COOLDOWN);
    }

    async fn probe_repository(&self) -> bool {
        // Any cheap, always-safe read doubles as a liveness probe.
        self.repo.get_active_auto_or_both().await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_default_to_zero() {
        let counters = Counters::default();
        assert_eq!(counters.database, 0);
        assert_eq!(counters.connection, 0);
        assert!(!counters.manual_intervention_required);
    }
}

