//! Configuration file management for the CLI.
//!
//! Provides a TOML-based config file at `~/.config/xfer/config.toml` and a
//! resolution chain: CLI flag > env var > config file > default.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use xfer_core::config::ServerConfig;
use xfer_db::config::DbConfig;

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
pub struct ConfigFile {
    pub database: DatabaseSection,
    #[serde(default)]
    pub server_a: ServerSection,
    #[serde(default)]
    pub server_b: ServerSection,
    #[serde(default)]
    pub scheduler: SchedulerSection,
    #[serde(default)]
    pub serve: ServeSection,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DatabaseSection {
    pub url: String,
}

#[derive(Debug, Serialize, Deserialize, Default)]
pub struct ServerSection {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub database: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub trust_cert: Option<bool>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SchedulerSection {
    pub enabled: bool,
    pub hour: String,
    pub timezone: String,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            enabled: false,
            hour: "02:00".to_string(),
            timezone: "UTC".to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ServeSection {
    pub bind: String,
    pub port: u16,
}

impl Default for ServeSection {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 8765,
        }
    }
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Return the xfer config directory.
///
/// Always uses XDG layout: `$XDG_CONFIG_HOME/xfer` or `~/.config/xfer`. We
/// intentionally ignore the platform-specific `dirs::config_dir()` (which
/// returns `~/Library/Application Support` on macOS).
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("xfer");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("xfer")
}

/// Return the path to the xfer config file.
pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

// -----------------------------------------------------------------------
// Read / write
// -----------------------------------------------------------------------

/// Load and parse the config file. Returns an error if it does not exist.
pub fn load_config() -> Result<ConfigFile> {
    let path = config_path();
    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    let config: ConfigFile = toml::from_str(&contents).context("failed to parse config file")?;
    Ok(config)
}

/// Serialize and write the config file, creating parent dirs as needed.
/// Sets file permissions to 0600 on Unix.
pub fn save_config(config: &ConfigFile) -> Result<()> {
    let path = config_path();
    let dir = config_dir();
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create config directory {}", dir.display()))?;

    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(&path, &contents)
        .with_context(|| format!("failed to write config file at {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(&path, perms)
            .with_context(|| format!("failed to set permissions on {}", path.display()))?;
    }

    Ok(())
}

// -----------------------------------------------------------------------
// Resolved config
// -----------------------------------------------------------------------

/// Fully resolved configuration, ready for use.
#[derive(Debug)]
pub struct XferConfig {
    pub db_config: DbConfig,
    pub server_a: ServerConfig,
    pub server_b: ServerConfig,
    pub scheduler_enabled: bool,
    pub scheduler_hour: String,
    pub scheduler_timezone: String,
    pub serve_bind: String,
    pub serve_port: u16,
}

fn merge_server(env_prefix: &str, file_section: Option<&ServerSection>) -> ServerConfig {
    let mut resolved = ServerConfig::from_env(env_prefix);
    let Some(section) = file_section else {
        return resolved;
    };

    // Config file values only apply where the environment left the
    // `from_env` default untouched; env vars still win over the file.
    if std::env::var(format!("{env_prefix}_HOST")).is_err() {
        if let Some(host) = &section.host {
            resolved.host = host.clone();
        }
    }
    if std::env::var(format!("{env_prefix}_PORT")).is_err() {
        if let Some(port) = section.port {
            resolved.port = port;
        }
    }
    if std::env::var(format!("{env_prefix}_DATABASE")).is_err() {
        if let Some(database) = &section.database {
            resolved.database = database.clone();
        }
    }
    if std::env::var(format!("{env_prefix}_USER")).is_err() {
        if let Some(user) = &section.user {
            resolved.user = user.clone();
        }
    }
    if std::env::var(format!("{env_prefix}_PASSWORD")).is_err() {
        if let Some(password) = &section.password {
            resolved.password = password.clone();
        }
    }
    if std::env::var(format!("{env_prefix}_TRUST_CERT")).is_err() {
        if let Some(trust_cert) = section.trust_cert {
            resolved.trust_cert = trust_cert;
        }
    }

    resolved
}

impl XferConfig {
    /// Resolve configuration using the chain: CLI flag > env var > config
    /// file > default.
    ///
    /// - DB URL: `cli_db_url` > `XFER_DATABASE_URL` env > `config_file.database.url` > `DbConfig::DEFAULT_URL`
    /// - Server A/B: `XFER_SERVER_{A,B}_*` env vars > matching config file section > built-in defaults
    /// - Scheduler/serve: config file sections > built-in defaults (no env override; these are operational knobs set once per deployment)
    pub fn resolve(cli_db_url: Option<&str>) -> Result<Self> {
        let file_config = load_config().ok();

        let db_url = if let Some(url) = cli_db_url {
            url.to_string()
        } else if let Ok(url) = std::env::var("XFER_DATABASE_URL") {
            url
        } else if let Some(ref cfg) = file_config {
            cfg.database.url.clone()
        } else {
            DbConfig::DEFAULT_URL.to_string()
        };
        let db_config = DbConfig::new(db_url);

        let server_a = merge_server("XFER_SERVER_A", file_config.as_ref().map(|c| &c.server_a));
        let server_b = merge_server("XFER_SERVER_B", file_config.as_ref().map(|c| &c.server_b));

        let (scheduler_enabled, scheduler_hour, scheduler_timezone) = match &file_config {
            Some(cfg) => (
                cfg.scheduler.enabled,
                cfg.scheduler.hour.clone(),
                cfg.scheduler.timezone.clone(),
            ),
            None => {
                let d = SchedulerSection::default();
                (d.enabled, d.hour, d.timezone)
            }
        };

        let (serve_bind, serve_port) = match &file_config {
            Some(cfg) => (cfg.serve.bind.clone(), cfg.serve.port),
            None => {
                let d = ServeSection::default();
                (d.bind, d.port)
            }
        };

        Ok(Self {
            db_config,
            server_a,
            server_b,
            scheduler_enabled,
            scheduler_hour,
            scheduler_timezone,
            serve_bind,
            serve_port,
        })
    }
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn lock_env() -> std::sync::MutexGuard<'static, ()> {
        crate::test_util::lock_env()
    }

    #[test]
    fn save_and_load_config_roundtrip() {
        let _lock = lock_env();
        let tmp = tempfile::TempDir::new().unwrap();
        let dir = tmp.path().join("xfer");
        let path = dir.join("config.toml");

        let original = ConfigFile {
            database: DatabaseSection {
                url: "postgresql://testhost:5432/testdb".to_string(),
            },
            server_a: ServerSection::default(),
            server_b: ServerSection::default(),
            scheduler: SchedulerSection::default(),
            serve: ServeSection::default(),
        };

        std::fs::create_dir_all(&dir).unwrap();
        let contents = toml::to_string_pretty(&original).unwrap();
        std::fs::write(&path, &contents).unwrap();

        let loaded_contents = std::fs::read_to_string(&path).unwrap();
        let loaded: ConfigFile = toml::from_str(&loaded_contents).unwrap();

        assert_eq!(loaded.database.url, original.database.url);
        assert_eq!(loaded.scheduler.hour, "02:00");
    }

    #[cfg(unix)]
    #[test]
    fn save_config_sets_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let _lock = lock_env();

        let tmp = tempfile::TempDir::new().unwrap();
        let file = tmp.path().join("test.toml");
        std::fs::write(&file, "test").unwrap();

        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(&file, perms).unwrap();

        let meta = std::fs::metadata(&file).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o600);
    }

    #[test]
    fn resolve_with_cli_flag_overrides_all() {
        let _lock = lock_env();

        unsafe { std::env::set_var("XFER_DATABASE_URL", "postgresql://env:5432/envdb") };

        let config = XferConfig::resolve(Some("postgresql://cli:5432/clidb")).unwrap();
        assert_eq!(config.db_config.database_url, "postgresql://cli:5432/clidb");

        unsafe { std::env::remove_var("XFER_DATABASE_URL") };
    }

    #[test]
    fn resolve_with_env_var_overrides_config_file() {
        let _lock = lock_env();

        unsafe { std::env::set_var("XFER_DATABASE_URL", "postgresql://env:5432/envdb") };

        let config = XferConfig::resolve(None).unwrap();
        assert_eq!(config.db_config.database_url, "postgresql://env:5432/envdb");

        unsafe { std::env::remove_var("XFER_DATABASE_URL") };
    }

    #[test]
    fn resolve_defaults_db_url_when_nothing_set() {
        let _lock = lock_env();

        unsafe { std::env::remove_var("XFER_DATABASE_URL") };

        let config = XferConfig::resolve(None).unwrap();
        assert_eq!(config.db_config.database_url, DbConfig::DEFAULT_URL);
    }

    #[test]
    fn resolve_defaults_scheduler_disabled() {
        let _lock = lock_env();
        let config = XferConfig::resolve(Some("postgresql://localhost:5432/xfer")).unwrap();
        assert!(!config.scheduler_enabled);
        assert_eq!(config.scheduler_hour, "02:00");
    }

    #[test]
    fn config_path_ends_with_expected_filename() {
        let path = config_path();
        assert!(
            path.ends_with("xfer/config.toml"),
            "unexpected config path: {}",
            path.display()
        );
    }
}
