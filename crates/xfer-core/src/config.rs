//! Connection configuration for the two external SQL Server instances,
//! "A" (source) and "B" (destination).
//!
//! Shaped after `xfer_db::config::DbConfig`: env-var first, with a
//! sensible default host/port, and an explicit constructor for tests and
//! CLI flags.

use std::env;

/// How to reach and authenticate against one SQL Server instance.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: String,
    /// Accept the server's TLS certificate without validating it. SQL
    /// Server instances are frequently reached over a private network
    /// with a self-signed cert; this mirrors `tiberius`'s own
    /// `trust_cert` escape hatch rather than hand-rolling verification.
    pub trust_cert: bool,
}

impl ServerConfig {
    /// Read `{PREFIX}_HOST`, `{PREFIX}_PORT`, `{PREFIX}_DATABASE`,
    /// `{PREFIX}_USER`, `{PREFIX}_PASSWORD`, `{PREFIX}_TRUST_CERT` (`"1"`
    /// or `"true"`). `prefix` is typically `"XFER_SERVER_A"` or
    /// `"XFER_SERVER_B"`.
    pub fn from_env(prefix: &str) -> Self {
        let var = |suffix: &str| env::var(format!("{prefix}_{suffix}")).ok();

        Self {
            host: var("HOST").unwrap_or_else(|| "localhost".to_string()),
            port: var("PORT").and_then(|p| p.parse().ok()).unwrap_or(1433),
            database: var("DATABASE").unwrap_or_default(),
            user: var("USER").unwrap_or_default(),
            password: var("PASSWORD").unwrap_or_default(),
            trust_cert: var("TRUST_CERT").map(|v| v == "1" || v == "true").unwrap_or(false),
        }
    }

    /// Build a `tiberius::Config` ready for
    /// [`crate::supervisor::ConnectionSupervisor::new`].
    pub fn to_tiberius_config(&self) -> tiberius::Config {
        let mut config = tiberius::Config::new();
        config.host(&self.host);
        config.port(self.port);
        config.database(&self.database);
        config.authentication(tiberius::AuthMethod::sql_server(&self.user, &self.password));
        if self.trust_cert {
            config.trust_cert();
        }
        config
    }
}
