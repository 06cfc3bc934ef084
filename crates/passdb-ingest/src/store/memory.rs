//! In-process credential store
//!
//! Enforces the same uniqueness rules as the SQL schema using hash maps
//! behind a mutex. Backs `passdb-seed --dry-run` and the pipeline tests.

use async_trait::async_trait;
use passdb_common::Credential;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Mutex;

use super::{CredentialStore, UpsertError};

#[derive(Debug, Default)]
struct Dimension {
    ids: HashMap<String, i64>,
}

impl Dimension {
    fn find_or_insert(&mut self, value: &str) -> i64 {
        let next = self.ids.len() as i64 + 1;
        *self.ids.entry(value.to_string()).or_insert(next)
    }

    fn values(&self) -> BTreeSet<String> {
        self.ids.keys().cloned().collect()
    }
}

#[derive(Debug, Default)]
struct Tables {
    usernames: Dimension,
    domains: Dimension,
    passwords: Dimension,
    records: HashSet<(i64, i64, i64)>,
}

/// Point-in-time copy of a [`MemoryStore`]'s tables
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemorySnapshot {
    pub usernames: BTreeSet<String>,
    pub domains: BTreeSet<String>,
    pub passwords: BTreeSet<String>,
    pub records: BTreeSet<Credential>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MemorySnapshot {
        let tables = self.lock();

        let name_of = |dim: &Dimension, id: i64| {
            dim.ids
                .iter()
                .find_map(|(value, v)| (*v == id).then(|| value.clone()))
                .unwrap_or_default()
        };

        MemorySnapshot {
            usernames: tables.usernames.values(),
            domains: tables.domains.values(),
            passwords: tables.passwords.values(),
            records: tables
                .records
                .iter()
                .map(|&(u, d, p)| Credential {
                    username: name_of(&tables.usernames, u),
                    domain: name_of(&tables.domains, d),
                    password: name_of(&tables.passwords, p),
                })
                .collect(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Tables> {
        // Every mutation is a single insert, so a poisoned lock still guards
        // consistent maps.
        self.tables.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn check_encoding(field: &str, value: &str) -> Result<(), UpsertError> {
    // PostgreSQL text columns cannot hold NUL
    if value.contains('\0') {
        return Err(UpsertError::Encoding {
            message: format!("invalid byte sequence for encoding \"UTF8\": 0x00 in {field}"),
        });
    }
    Ok(())
}

#[async_trait]
impl CredentialStore for MemoryStore {
    async fn upsert(&self, credential: &Credential) -> Result<(), UpsertError> {
        check_encoding("username", &credential.username)?;
        check_encoding("domain", &credential.domain)?;
        check_encoding("password", &credential.password)?;

        let mut tables = self.lock();
        let username_id = tables.usernames.find_or_insert(&credential.username);
        let domain_id = tables.domains.find_or_insert(&credential.domain);
        let password_id = tables.passwords.find_or_insert(&credential.password);

        if tables.records.insert((username_id, domain_id, password_id)) {
            Ok(())
        } else {
            Err(UpsertError::Conflict)
        }
    }

    async fn record_count(&self) -> Result<i64, UpsertError> {
        Ok(self.lock().records.len() as i64)
    }

    fn name(&self) -> &str {
        "memory"
    }
}
