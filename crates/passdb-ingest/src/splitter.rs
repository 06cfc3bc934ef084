//! Dimension splitter
//!
//! Writes the usernames, domains and passwords found in an archive to three
//! flat files instead of the database, for loading the dimension tables out
//! of band. Lines are matched with [`parse_strict`](crate::parser::parse_strict).

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::archive::{ArchiveEvent, ArchiveReader, EntryDecision, DEFAULT_EVENT_CAPACITY};
use crate::error::{IngestError, IngestResult};
use crate::parser::parse_strict;

pub const USERNAMES_FILE: &str = "usernames.txt";
pub const DOMAINS_FILE: &str = "domains.txt";
pub const PASSWORDS_FILE: &str = "passwords.txt";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SplitSummary {
    pub entries: u64,
    pub lines: u64,
    /// Lines that started with an email address
    pub matched: u64,
    pub unmatched: u64,
}

struct Output {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl Output {
    async fn open(dir: &Path, name: &str) -> IngestResult<Self> {
        let path = dir.join(name);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|source| IngestError::Output {
                path: path.clone(),
                source,
            })?;

        Ok(Self {
            path,
            writer: BufWriter::new(file),
        })
    }

    async fn write_line(&mut self, value: &str) -> IngestResult<()> {
        let result = async {
            self.writer.write_all(value.as_bytes()).await?;
            self.writer.write_all(b"\n").await
        }
        .await;

        result.map_err(|source| IngestError::Output {
            path: self.path.clone(),
            source,
        })
    }

    async fn finish(mut self) -> IngestResult<()> {
        self.writer
            .shutdown()
            .await
            .map_err(|source| IngestError::Output {
                path: self.path,
                source,
            })
    }
}

pub struct Splitter {
    out_dir: PathBuf,
    cancel: CancellationToken,
}

impl Splitter {
    pub fn new(out_dir: impl Into<PathBuf>, cancel: CancellationToken) -> Self {
        Self {
            out_dir: out_dir.into(),
            cancel,
        }
    }

    /// Append the dimensions of every regular entry of `archive`
    #[instrument(skip_all, fields(archive = %archive.display()))]
    pub async fn run(&self, archive: &Path) -> IngestResult<SplitSummary> {
        tokio::fs::create_dir_all(&self.out_dir)
            .await
            .map_err(|source| IngestError::Output {
                path: self.out_dir.clone(),
                source,
            })?;

        let mut usernames = Output::open(&self.out_dir, USERNAMES_FILE).await?;
        let mut domains = Output::open(&self.out_dir, DOMAINS_FILE).await?;
        let mut passwords = Output::open(&self.out_dir, PASSWORDS_FILE).await?;

        let mut reader = ArchiveReader::open(archive, DEFAULT_EVENT_CAPACITY);
        let mut summary = SplitSummary::default();

        info!(out_dir = %self.out_dir.display(), "Starting split");

        loop {
            let event = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    reader.close().await;
                    return Err(IngestError::Cancelled);
                },
                event = reader.next_event() => event,
            };

            match event {
                None => break,
                Some(ArchiveEvent::Entry { header, reply }) => {
                    let decision = if header.is_file() {
                        debug!(entry = %header.name, "Starting entry");
                        summary.entries += 1;
                        EntryDecision::Process
                    } else {
                        EntryDecision::Skip
                    };
                    let _ = reply.send(decision);
                },
                Some(ArchiveEvent::Line(line)) => {
                    summary.lines += 1;
                    let credential = parse_strict(&String::from_utf8_lossy(&line));
                    if credential.is_sentinel() {
                        summary.unmatched += 1;
                        continue;
                    }
                    summary.matched += 1;

                    usernames.write_line(&credential.username.to_lowercase()).await?;
                    domains.write_line(&credential.domain.to_lowercase()).await?;
                    passwords.write_line(&credential.password).await?;
                },
                Some(ArchiveEvent::EntryEnd) => {},
                Some(ArchiveEvent::Failed(e)) => {
                    reader.close().await;
                    return Err(e.into());
                },
            }
        }

        reader.close().await;
        usernames.finish().await?;
        domains.finish().await?;
        passwords.finish().await?;

        info!(
            entries = summary.entries,
            lines = summary.lines,
            matched = summary.matched,
            unmatched = summary.unmatched,
            "Split finished"
        );

        Ok(summary)
    }
}
