//! Pooled connections to servers A and B, with liveness probing and
//! exponential-backoff reconnect.
//!
//! Pool construction mirrors `xfer_db::pool::create_pool`'s shape; the
//! retry/backoff loop uses the same `tokio::time::sleep`-based wait pattern
//! used elsewhere in this crate to avoid busy-looping while waiting for a
//! connection to recover.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tracing::{info, warn};

use crate::gateway::{GatewayConnection, GatewayError};

/// Identifies which configured server a connection belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerKey {
    A,
    B,
}

impl std::fmt::Display for ServerKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerKey::A => write!(f, "A"),
            ServerKey::B => write!(f, "B"),
        }
    }
}

const MAX_ATTEMPTS: u32 = 3;
const PER_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(60);
const BACKOFF_BASE: Duration = Duration::from_secs(3);
const BACKOFF_CAP: Duration = Duration::from_secs(30);

/// Outcome of a diagnose call.
#[derive(Debug, Clone)]
pub struct Diagnosis {
    pub ok: bool,
    pub detail: String,
}

/// Counters tracked per server.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub acquired: u64,
    pub released: u64,
    pub reconnects: u64,
}

struct ServerState {
    config: tiberius::Config,
    idle: Vec<GatewayConnection>,
    stats: ServerStats,
}

/// Supplies validated connections to server A and server B.
pub struct ConnectionSupervisor {
    servers: Mutex<HashMap<ServerKey, ServerState>>,
}

impl ConnectionSupervisor {
    pub fn new(config_a: tiberius::Config, config_b: tiberius::Config) -> Self {
        let mut servers = HashMap::new();
        servers.insert(
            ServerKey::A,
            ServerState {
                config: config_a,
                idle: Vec::new(),
                stats: ServerStats::default(),
            },
        );
        servers.insert(
            ServerKey::B,
            ServerState {
                config: config_b,
                idle: Vec::new(),
                stats: ServerStats::default(),
            },
        );
        Self {
            servers: Mutex::new(servers),
        }
    }

    /// Acquire a validated connection to `server`, retrying per
    /// `robust_acquire`'s backoff policy.
    ///
    /// Every idle connection handed back out is re-probed with `SELECT 1`
    /// first; one that went stale while parked (server restart, TCP reset)
    /// is discarded rather than handed to the caller, and the next idle
    /// connection (or a fresh `robust_acquire`) is tried instead.
    pub async fn acquire(&self, server: ServerKey) -> Result<GatewayConnection, GatewayError> {
        while let Some(mut conn) = self.take_idle(server) {
            match conn.ping().await {
                Ok(()) => {
                    let mut servers = self.servers.lock().unwrap();
                    if let Some(state) = servers.get_mut(&server) {
                        state.stats.acquired += 1;
                    }
                    return Ok(conn);
                }
                Err(e) => {
                    warn!(server = %server, error = %e, "idle connection failed liveness probe, discarding");
                }
            }
        }
        self.robust_acquire(server).await
    }

    /// Return a connection to the idle pool for reuse.
    pub fn release(&self, server: ServerKey, conn: GatewayConnection) {
        let mut servers = self.servers.lock().unwrap();
        if let Some(state) = servers.get_mut(&server) {
            state.stats.released += 1;
            state.idle.push(conn);
        }
    }

    fn take_idle(&self, server: ServerKey) -> Option<GatewayConnection> {
        let mut servers = self.servers.lock().unwrap();
        let state = servers.get_mut(&server)?;
        state.idle.pop()
    }

    /// Up to 3 attempts, 60s per-attempt timeout, exponential backoff
    /// `3s * 1.5^(n-1)` capped at 30s, `SELECT 1` liveness probe.
    async fn robust_acquire(&self, server: ServerKey) -> Result<GatewayConnection, GatewayError> {
        let config = {
            let servers = self.servers.lock().unwrap();
            servers
                .get(&server)
                .expect("server key always present")
                .config
                .clone()
        };

        let mut last_err = None;
        for attempt in 1..=MAX_ATTEMPTS {
            let result = tokio::time::timeout(PER_ATTEMPT_TIMEOUT, GatewayConnection::connect(&config)).await;

            match result {
                Ok(Ok(mut conn)) => match conn.ping().await {
                    Ok(()) => {
                        let mut servers = self.servers.lock().unwrap();
                        if let Some(state) = servers.get_mut(&server) {
                            state.stats.acquired += 1;
                            if attempt > 1 {
                                state.stats.reconnects += 1;
                            }
                        }
                        return Ok(conn);
                    }
                    Err(e) => {
                        warn!(server = %server, attempt, error = %e, "liveness probe failed");
                        last_err = Some(e);
                    }
                },
                Ok(Err(e)) => {
                    if matches!(e, GatewayError::ConnectionFatal(_)) {
                        return Err(e);
                    }
                    warn!(server = %server, attempt, error = %e, "connect attempt failed");
                    last_err = Some(e);
                }
                Err(_elapsed) => {
                    warn!(server = %server, attempt, "connect attempt timed out");
                    last_err = Some(GatewayError::ConnectionTransient(
                        "connect attempt timed out".to_string(),
                    ));
                }
            }

            if attempt < MAX_ATTEMPTS {
                let backoff = backoff_for_attempt(attempt);
                tokio::time::sleep(backoff).await;
            }
        }

        Err(last_err.unwrap_or_else(|| {
            GatewayError::ConnectionTransient(format!("exhausted {MAX_ATTEMPTS} attempts"))
        }))
    }

    /// Probe `server` without consuming it from the idle pool.
    pub async fn diagnose(&self, server: ServerKey) -> Diagnosis {
        match self.acquire(server).await {
            Ok(conn) => {
                self.release(server, conn);
                Diagnosis {
                    ok: true,
                    detail: "ok".to_string(),
                }
            }
            Err(e) => Diagnosis {
                ok: false,
                detail: e.to_string(),
            },
        }
    }

    /// Drop every idle connection for both servers.
    pub fn close_all(&self) {
        let mut servers = self.servers.lock().unwrap();
        for state in servers.values_mut() {
            state.idle.clear();
        }
        info!("closed all idle connections");
    }

    pub fn stats(&self, server: ServerKey) -> ServerStats {
        self.servers
            .lock()
            .unwrap()
            .get(&server)
            .map(|s| s.stats.clone())
            .unwrap_or_default()
    }
}

fn backoff_for_attempt(attempt: u32) -> Duration {
    let exp = 1.5f64.powi((attempt - 1) as i32);
    let millis = (BACKOFF_BASE.as_millis() as f64 * exp) as u64;
    Duration::from_millis(millis).min(BACKOFF_CAP)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        assert_eq!(backoff_for_attempt(1), Duration::from_secs(3));
        assert_eq!(backoff_for_attempt(2), Duration::from_millis(4500));
        // attempt 5 would exceed the cap without clamping.
        assert_eq!(backoff_for_attempt(5), BACKOFF_CAP);
    }

    #[test]
    fn server_key_display() {
        assert_eq!(ServerKey::A.to_string(), "A");
        assert_eq!(ServerKey::B.to_string(), "B");
    }
}
