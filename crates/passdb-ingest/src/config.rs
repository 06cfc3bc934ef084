//! Seeder configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::checkpoint::DEFAULT_DONE_LOG;
use crate::db::{
    DbConfig, DEFAULT_CONNECT_TIMEOUT_SECS, DEFAULT_MAX_CONNECTIONS, DEFAULT_MAX_LIFETIME_SECS,
};
use crate::dispatcher::{DispatcherConfig, DEFAULT_QUEUE_CAPACITY, DEFAULT_WORKERS};

/// Default durable error log path
pub const DEFAULT_ERROR_LOG: &str = "done.err";

/// Default fixture archive used when `TEST` is set
pub const DEFAULT_TEST_ARCHIVE: &str = "tests/fixtures/test_data.tar.gz";

/// Pushover application token and user key
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PushoverConfig {
    pub token: String,
    pub user: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedConfig {
    pub database_url: Option<String>,
    pub workers: usize,
    pub queue_capacity: usize,
    pub max_connections: u32,
    pub max_lifetime_secs: u64,
    pub connect_timeout_secs: u64,
    pub done_log: PathBuf,
    pub error_log: PathBuf,
    pub test_mode: bool,
    pub test_archive: PathBuf,
    pub pushover: Option<PushoverConfig>,
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

fn env_non_empty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|s| !s.trim().is_empty())
}

impl SeedConfig {
    /// Load configuration from `.env`, the environment and defaults
    ///
    /// Not validated: callers run [`SeedConfig::validate`] once logging is up
    /// so that its warnings reach the configured outputs.
    pub fn load() -> Self {
        dotenvy::dotenv().ok();
        Self::from_env()
    }

    /// Read the process environment without touching `.env`
    pub fn from_env() -> Self {
        let pushover = match (env_non_empty("PO_API"), env_non_empty("PO_USR")) {
            (Some(token), Some(user)) => Some(PushoverConfig { token, user }),
            _ => None,
        };

        Self {
            database_url: env_non_empty("DATABASE_URL").or_else(|| env_non_empty("PG_CONN")),
            workers: env_parse("SEED_WORKERS").unwrap_or(DEFAULT_WORKERS),
            queue_capacity: env_parse("SEED_QUEUE_CAPACITY").unwrap_or(DEFAULT_QUEUE_CAPACITY),
            max_connections: env_parse("DB_MAX_CONNECTIONS").unwrap_or(DEFAULT_MAX_CONNECTIONS),
            max_lifetime_secs: env_parse("DB_MAX_LIFETIME").unwrap_or(DEFAULT_MAX_LIFETIME_SECS),
            connect_timeout_secs: env_parse("DB_CONNECT_TIMEOUT")
                .unwrap_or(DEFAULT_CONNECT_TIMEOUT_SECS),
            done_log: env_non_empty("SEED_DONE_LOG")
                .unwrap_or_else(|| DEFAULT_DONE_LOG.to_string())
                .into(),
            error_log: env_non_empty("SEED_ERROR_LOG")
                .unwrap_or_else(|| DEFAULT_ERROR_LOG.to_string())
                .into(),
            test_mode: env_non_empty("TEST").is_some(),
            test_archive: env_non_empty("SEED_TEST_ARCHIVE")
                .unwrap_or_else(|| DEFAULT_TEST_ARCHIVE.to_string())
                .into(),
            pushover,
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.workers == 0 {
            anyhow::bail!("SEED_WORKERS must be greater than 0");
        }

        if self.queue_capacity == 0 {
            anyhow::bail!("SEED_QUEUE_CAPACITY must be greater than 0");
        }

        if self.max_connections == 0 {
            anyhow::bail!("DB_MAX_CONNECTIONS must be greater than 0");
        }

        if (self.max_connections as usize) < self.workers {
            tracing::warn!(
                max_connections = self.max_connections,
                workers = self.workers,
                "Pool is smaller than the worker ceiling; workers will wait on connections"
            );
        }

        if self.pushover.is_none() {
            tracing::debug!("PO_API/PO_USR not set, notifications go to the log");
        }

        Ok(())
    }

    pub fn dispatcher(&self) -> DispatcherConfig {
        DispatcherConfig {
            workers: self.workers,
            queue_capacity: self.queue_capacity,
        }
    }

    /// Pool settings; fails when no connection string is configured
    pub fn db_config(&self) -> anyhow::Result<DbConfig> {
        let url = self
            .database_url
            .clone()
            .ok_or_else(|| anyhow::anyhow!("DATABASE_URL (or PG_CONN) is not set"))?;

        Ok(DbConfig {
            url,
            max_connections: self.max_connections,
            connect_timeout_secs: self.connect_timeout_secs,
            max_lifetime_secs: Some(self.max_lifetime_secs),
        })
    }

    /// Archive to seed: the fixture in test mode, otherwise the given path
    pub fn archive_path(&self, given: Option<PathBuf>) -> anyhow::Result<PathBuf> {
        if self.test_mode {
            return Ok(self.test_archive.clone());
        }
        given.ok_or_else(|| anyhow::anyhow!("No archive given (set TEST to use the fixture)"))
    }
}

impl Default for SeedConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            workers: DEFAULT_WORKERS,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            max_lifetime_secs: DEFAULT_MAX_LIFETIME_SECS,
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            done_log: DEFAULT_DONE_LOG.into(),
            error_log: DEFAULT_ERROR_LOG.into(),
            test_mode: false,
            test_archive: DEFAULT_TEST_ARCHIVE.into(),
            pushover: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const VARS: &[&str] = &[
        "DATABASE_URL",
        "PG_CONN",
        "SEED_WORKERS",
        "SEED_QUEUE_CAPACITY",
        "DB_MAX_CONNECTIONS",
        "DB_MAX_LIFETIME",
        "DB_CONNECT_TIMEOUT",
        "SEED_DONE_LOG",
        "SEED_ERROR_LOG",
        "TEST",
        "SEED_TEST_ARCHIVE",
        "PO_API",
        "PO_USR",
    ];

    fn clear_env() {
        for var in VARS {
            std::env::remove_var(var);
        }
    }

    #[test]
    #[serial]
    fn test_defaults() {
        clear_env();
        let config = SeedConfig::from_env();

        assert_eq!(config.workers, 50);
        assert_eq!(config.queue_capacity, 50);
        assert_eq!(config.max_connections, 100);
        assert_eq!(config.done_log, PathBuf::from("done.log"));
        assert_eq!(config.error_log, PathBuf::from("done.err"));
        assert!(config.database_url.is_none());
        assert!(config.pushover.is_none());
        assert!(!config.test_mode);
        assert!(config.validate().is_ok());
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        clear_env();
        std::env::set_var("PG_CONN", "postgresql://localhost/passdb");
        std::env::set_var("SEED_WORKERS", "8");
        std::env::set_var("DB_MAX_CONNECTIONS", "16");
        std::env::set_var("PO_API", "token");
        std::env::set_var("PO_USR", "user");

        let config = SeedConfig::from_env();
        clear_env();

        assert_eq!(config.database_url.as_deref(), Some("postgresql://localhost/passdb"));
        assert_eq!(config.workers, 8);
        assert_eq!(config.db_config().unwrap().max_connections, 16);
        assert_eq!(
            config.pushover,
            Some(PushoverConfig {
                token: "token".into(),
                user: "user".into()
            })
        );
    }

    #[test]
    #[serial]
    fn test_database_url_wins_over_pg_conn() {
        clear_env();
        std::env::set_var("DATABASE_URL", "postgresql://primary/passdb");
        std::env::set_var("PG_CONN", "postgresql://legacy/passdb");

        let config = SeedConfig::from_env();
        clear_env();

        assert_eq!(config.database_url.as_deref(), Some("postgresql://primary/passdb"));
    }

    #[test]
    #[serial]
    fn test_test_mode_uses_fixture() {
        clear_env();
        std::env::set_var("TEST", "1");

        let config = SeedConfig::from_env();
        clear_env();

        assert!(config.test_mode);
        assert_eq!(
            config.archive_path(Some("other.tar.gz".into())).unwrap(),
            PathBuf::from(DEFAULT_TEST_ARCHIVE)
        );
    }

    #[test]
    fn test_archive_required_outside_test_mode() {
        let config = SeedConfig::default();
        assert!(config.archive_path(None).is_err());
        assert_eq!(
            config.archive_path(Some("dump.tar.gz".into())).unwrap(),
            PathBuf::from("dump.tar.gz")
        );
    }

    #[test]
    fn test_validation_rejects_zero_workers() {
        let config = SeedConfig {
            workers: 0,
            ..SeedConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_database_url() {
        assert!(SeedConfig::default().db_config().is_err());
    }
}
