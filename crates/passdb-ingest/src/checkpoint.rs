//! Durable record of fully ingested archive entries
//!
//! The log is a plain text file with one entry name per line. It is read
//! once when a run starts and only ever appended to afterwards. An entry is
//! appended after every line of it has been drained through the dispatcher,
//! so a crash mid-entry simply means the entry is replayed next time.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

/// Default checkpoint log file name
pub const DEFAULT_DONE_LOG: &str = "done.log";

#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("Failed to read checkpoint log {path}: {source}")]
    Load {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to append '{name}' to checkpoint log {path}: {source}")]
    Append {
        name: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Entry name cannot be checkpointed (contains a line break): {0:?}")]
    InvalidName(String),
}

/// Set of completed entry names backed by an append-only log
///
/// `mark_done` takes `&mut self`: the store has exactly one owner, the
/// archive walker, and is never shared with workers.
#[derive(Debug)]
pub struct CheckpointStore {
    path: PathBuf,
    done: HashSet<String>,
}

impl CheckpointStore {
    /// Load the log at `path`; a missing file is an empty checkpoint set
    pub async fn load(path: impl Into<PathBuf>) -> Result<Self, CheckpointError> {
        let path = path.into();

        let done = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => {
                let (done, complete_len) = parse_log(&contents);
                if complete_len < contents.len() {
                    warn!(
                        path = %path.display(),
                        "Checkpoint log ends with an unterminated line, truncating it"
                    );
                    truncate(&path, complete_len as u64)
                        .await
                        .map_err(|source| CheckpointError::Load {
                            path: path.clone(),
                            source,
                        })?;
                }
                done
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No checkpoint log yet, starting fresh");
                HashSet::new()
            },
            Err(source) => return Err(CheckpointError::Load { path, source }),
        };

        info!(
            path = %path.display(),
            completed = done.len(),
            "Loaded checkpoint log"
        );

        Ok(Self { path, done })
    }

    /// Number of entries recorded as done
    pub fn len(&self) -> usize {
        self.done.len()
    }

    pub fn is_empty(&self) -> bool {
        self.done.is_empty()
    }

    pub fn is_done(&self, name: &str) -> bool {
        self.done.contains(name)
    }

    /// Durably record `name` as done
    ///
    /// The name is flushed and synced to disk before it is added to the
    /// in-memory set; on failure the set is left untouched. Marking an entry
    /// that is already done is a no-op.
    pub async fn mark_done(&mut self, name: &str) -> Result<(), CheckpointError> {
        if self.done.contains(name) {
            return Ok(());
        }
        if name.contains(['\n', '\r']) {
            return Err(CheckpointError::InvalidName(name.to_string()));
        }

        self.append(name)
            .await
            .map_err(|source| CheckpointError::Append {
                name: name.to_string(),
                path: self.path.clone(),
                source,
            })?;

        self.done.insert(name.to_string());
        debug!(entry = name, "Checkpointed entry");
        Ok(())
    }

    async fn append(&self, name: &str) -> std::io::Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;

        let mut line = String::with_capacity(name.len() + 1);
        line.push_str(name);
        line.push('\n');

        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        file.sync_data().await
    }
}

/// Completed names in `contents` and the byte length they span
///
/// Names are written together with their trailing newline, so an
/// unterminated final line is a partial write and is not trusted.
fn parse_log(contents: &str) -> (HashSet<String>, usize) {
    let complete_len = contents.rfind('\n').map_or(0, |idx| idx + 1);

    let done = contents[..complete_len]
        .lines()
        .filter(|line| !line.is_empty())
        .map(str::to_owned)
        .collect();

    (done, complete_len)
}

async fn truncate(path: &Path, len: u64) -> std::io::Result<()> {
    let file = OpenOptions::new().write(true).open(path).await?;
    file.set_len(len).await?;
    file.sync_data().await
}
