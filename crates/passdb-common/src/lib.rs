//! passdb Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared types and logging for the passdb workspace.
//!
//! # Overview
//!
//! - **Types**: the [`Credential`] triple every ingested line is reduced to
//! - **Logging**: `tracing` subscriber setup shared by every binary
//!
//! # Example
//!
//! ```no_run
//! use passdb_common::logging::{init_logging, LogConfig};
//! use passdb_common::Credential;
//!
//! fn main() -> anyhow::Result<()> {
//!     let _guard = init_logging(&LogConfig::from_env()?)?;
//!     let cred = Credential::new("alice", "example.com", "hunter2");
//!     tracing::info!(username = %cred.username, "parsed");
//!     Ok(())
//! }
//! ```

pub mod logging;
pub mod types;

// Re-export commonly used types
pub use types::{Credential, SENTINEL};
