//! PostgreSQL credential store

use async_trait::async_trait;
use passdb_common::Credential;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::instrument;

use super::{CredentialStore, UpsertError};

// Each dimension upsert touches the row even when it exists so that
// RETURNING yields the id in both cases. The value is rewritten to itself.
const UPSERT_USERNAME: &str = r#"
    INSERT INTO usernames (name) VALUES ($1)
    ON CONFLICT (name) DO UPDATE SET name = EXCLUDED.name
    RETURNING id
"#;

const UPSERT_DOMAIN: &str = r#"
    INSERT INTO domains (domain) VALUES ($1)
    ON CONFLICT (domain) DO UPDATE SET domain = EXCLUDED.domain
    RETURNING id
"#;

const UPSERT_PASSWORD: &str = r#"
    INSERT INTO passwords (password) VALUES ($1)
    ON CONFLICT (password) DO UPDATE SET password = EXCLUDED.password
    RETURNING id
"#;

const INSERT_RECORD: &str = r#"
    INSERT INTO records (username_id, domain_id, password_id)
    VALUES ($1, $2, $3)
    ON CONFLICT (password_id, domain_id, username_id) DO NOTHING
"#;

/// Credential store backed by a shared [`PgPool`]
///
/// The pool is injected; its size should be at least the dispatcher's worker
/// ceiling or workers will queue on connection acquisition.
#[derive(Clone)]
pub struct PgCredentialStore {
    pool: PgPool,
}

impl PgCredentialStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn upsert_dimension(
        tx: &mut Transaction<'_, Postgres>,
        query: &str,
        value: &str,
    ) -> Result<i64, UpsertError> {
        let id: i64 = sqlx::query_scalar(query)
            .bind(value)
            .fetch_one(&mut **tx)
            .await?;
        Ok(id)
    }
}

#[async_trait]
impl CredentialStore for PgCredentialStore {
    #[instrument(skip_all, level = "trace")]
    async fn upsert(&self, credential: &Credential) -> Result<(), UpsertError> {
        let mut tx = self.pool.begin().await?;

        // Fixed table order keeps concurrent transactions from deadlocking
        // on each other's dimension rows.
        let username_id = Self::upsert_dimension(&mut tx, UPSERT_USERNAME, &credential.username).await?;
        let domain_id = Self::upsert_dimension(&mut tx, UPSERT_DOMAIN, &credential.domain).await?;
        let password_id = Self::upsert_dimension(&mut tx, UPSERT_PASSWORD, &credential.password).await?;

        let inserted = sqlx::query(INSERT_RECORD)
            .bind(username_id)
            .bind(domain_id)
            .bind(password_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        if inserted == 0 {
            // Nothing new was written; discard the no-op dimension touches.
            tx.rollback().await?;
            return Err(UpsertError::Conflict);
        }

        tx.commit().await?;
        Ok(())
    }

    async fn record_count(&self) -> Result<i64, UpsertError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM records")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    fn name(&self) -> &str {
        "postgres"
    }
}
