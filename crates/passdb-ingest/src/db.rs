//! Database pool and migrations

use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use thiserror::Error;

/// Default maximum database connections in the pool
pub const DEFAULT_MAX_CONNECTIONS: u32 = 100;

/// Default connection lifetime in seconds
pub const DEFAULT_MAX_LIFETIME_SECS: u64 = 100;

/// Default pool acquire timeout in seconds
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database query failed: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("Database migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("Database configuration error: {0}. Check DATABASE_URL and connection settings.")]
    Config(String),
}

impl DbError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }
}

pub type DbResult<T> = Result<T, DbError>;

#[derive(Debug, Clone)]
pub struct DbConfig {
    pub url: String,
    pub max_connections: u32,
    pub connect_timeout_secs: u64,
    pub max_lifetime_secs: Option<u64>,
}

impl DbConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            max_lifetime_secs: Some(DEFAULT_MAX_LIFETIME_SECS),
        }
    }
}

pub async fn create_pool(config: &DbConfig) -> DbResult<PgPool> {
    if config.url.is_empty() {
        return Err(DbError::config("database URL is empty"));
    }

    // Idle connections are only retired by max_lifetime
    let mut options = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .idle_timeout(None)
        .acquire_timeout(Duration::from_secs(config.connect_timeout_secs));

    if let Some(max_lifetime) = config.max_lifetime_secs {
        options = options.max_lifetime(Duration::from_secs(max_lifetime));
    }

    let pool = options.connect(&config.url).await?;

    tracing::info!(
        max_connections = config.max_connections,
        max_lifetime_secs = config.max_lifetime_secs,
        "Database connection pool created"
    );

    Ok(pool)
}

pub async fn health_check(pool: &PgPool) -> DbResult<()> {
    sqlx::query("SELECT 1")
        .execute(pool)
        .await
        .map(|_| ())
        .map_err(DbError::from)
}

/// Apply pending schema migrations
pub async fn run_migrations(pool: &PgPool) -> DbResult<()> {
    sqlx::migrate!("../../migrations").run(pool).await?;
    tracing::info!("Database migrations completed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_pool_settings() {
        let config = DbConfig::new("postgresql://localhost/passdb");
        assert_eq!(config.max_connections, 100);
        assert_eq!(config.max_lifetime_secs, Some(100));
        assert_eq!(config.connect_timeout_secs, 30);
    }

    #[tokio::test]
    async fn test_empty_url_is_config_error() {
        let err = create_pool(&DbConfig::new("")).await.unwrap_err();
        assert!(matches!(err, DbError::Config(_)));
    }
}
