//! Errors that stop a run

use thiserror::Error;

use crate::archive::ArchiveError;
use crate::checkpoint::CheckpointError;
use crate::dispatcher::DispatchError;
use crate::store::UpsertError;

/// Fatal ingestion errors
///
/// Per-line failures never show up here; they are classified and tallied by
/// the dispatcher.
#[derive(Error, Debug)]
pub enum IngestError {
    /// The archive cannot be opened or decompressed
    #[error("Structural error: {0}")]
    Structural(#[from] ArchiveError),

    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    /// The store could not report its record count
    #[error("Store error: {0}")]
    Store(#[from] UpsertError),

    #[error("Dispatcher error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Failed to write {path}: {source}")]
    Output {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Run cancelled")]
    Cancelled,
}

pub type IngestResult<T> = Result<T, IngestError>;
