//! Credential stores
//!
//! A [`CredentialStore`] materializes one credential triple per call into
//! the normalized schema (three dimension tables plus the `records` fact
//! table). Every call is a single transaction and is idempotent: writing a
//! triple that already exists is reported as [`UpsertError::Conflict`],
//! which callers count as a duplicate rather than a failure.
//!
//! - [`postgres::PgCredentialStore`]: the production store
//! - [`memory::MemoryStore`]: in-process store for dry runs and tests

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use passdb_common::Credential;
use thiserror::Error;

pub use memory::MemoryStore;
pub use postgres::PgCredentialStore;

/// SQLSTATE codes the executor distinguishes
pub mod sqlstate {
    pub const UNIQUE_VIOLATION: &str = "23505";
    pub const CHARACTER_NOT_IN_REPERTOIRE: &str = "22021";
    pub const UNTRANSLATABLE_CHARACTER: &str = "22P05";
}

/// Classified outcome of a failed upsert
#[derive(Error, Debug)]
pub enum UpsertError {
    /// The fact row for this triple already exists
    #[error("Record already exists")]
    Conflict,

    /// A value was rejected by the store's character set
    #[error("Rejected by store encoding: {message}")]
    Encoding { message: String },

    #[error("Store error: {0}")]
    Store(#[source] sqlx::Error),

    #[error("Store error: {0}")]
    Other(String),
}

impl UpsertError {
    pub fn other(message: impl Into<String>) -> Self {
        Self::Other(message.into())
    }
}

impl From<sqlx::Error> for UpsertError {
    fn from(err: sqlx::Error) -> Self {
        let code = err
            .as_database_error()
            .and_then(|db| db.code())
            .map(|code| code.into_owned());

        match code.as_deref() {
            Some(sqlstate::UNIQUE_VIOLATION) => UpsertError::Conflict,
            Some(sqlstate::CHARACTER_NOT_IN_REPERTOIRE | sqlstate::UNTRANSLATABLE_CHARACTER) => {
                UpsertError::Encoding {
                    message: err
                        .as_database_error()
                        .map(|db| db.message().to_string())
                        .unwrap_or_else(|| err.to_string()),
                }
            },
            _ => UpsertError::Store(err),
        }
    }
}

/// Idempotent, transactional writer of credential triples
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Write one triple: find-or-create each dimension row, then the fact row
    ///
    /// Returns `Err(UpsertError::Conflict)` when the fact row already exists.
    /// On any error nothing from this call is persisted.
    async fn upsert(&self, credential: &Credential) -> Result<(), UpsertError>;

    /// Authoritative number of fact rows
    async fn record_count(&self) -> Result<i64, UpsertError>;

    /// Short label for logs
    fn name(&self) -> &str;
}
