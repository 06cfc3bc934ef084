//! passdb Ingest Library
//!
//! Bulk loader for credential dumps. An archive is read entry by entry;
//! every line is parsed into a (username, domain, password) triple and
//! written to a normalized store by a bounded pool of workers. Entries are
//! checkpointed once fully drained so an interrupted run resumes where it
//! left off.
//!
//! # Components
//!
//! - [`parser`]: line to credential triple
//! - [`checkpoint`]: append-only log of completed entries
//! - [`store`]: idempotent transactional upserts (PostgreSQL or in-memory)
//! - [`dispatcher`]: bounded worker pool with a drain barrier
//! - [`archive`]: streaming tar/gzip/text reader
//! - [`walker`]: drives a run over one archive
//! - [`splitter`]: writes dimension values to flat files
//!
//! # Example
//!
//! ```no_run
//! use passdb_ingest::checkpoint::CheckpointStore;
//! use passdb_ingest::notify::LogNotifier;
//! use passdb_ingest::store::MemoryStore;
//! use passdb_ingest::walker::ArchiveWalker;
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let checkpoints = CheckpointStore::load("done.log").await?;
//!     let mut walker = ArchiveWalker::new(
//!         Arc::new(MemoryStore::new()),
//!         checkpoints,
//!         Arc::new(LogNotifier),
//!         CancellationToken::new(),
//!     );
//!     let summary = walker.run("dump.tar.gz".as_ref()).await?;
//!     println!("{} new records", summary.net_new());
//!     Ok(())
//! }
//! ```

pub mod archive;
pub mod checkpoint;
pub mod config;
pub mod db;
pub mod dispatcher;
pub mod error;
pub mod notify;
pub mod parser;
pub mod splitter;
pub mod stats;
pub mod store;
pub mod walker;

pub use error::{IngestError, IngestResult};
pub use stats::{DrainReport, EntryStats, RunSummary};
