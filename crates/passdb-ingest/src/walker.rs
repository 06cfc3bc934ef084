//! Archive walker
//!
//! Drives one seeding run: entries are taken in archive order, entries
//! listed in the checkpoint log are skipped, and every other regular entry
//! is streamed through the dispatcher. An entry is checkpointed only after
//! the dispatcher has drained every one of its lines, and the next entry is
//! not started before that. Record counts taken around each entry give the
//! net number of new rows it contributed.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::archive::{
    ArchiveError, ArchiveEvent, ArchiveReader, EntryDecision, EntryHeader, DEFAULT_EVENT_CAPACITY,
};
use crate::checkpoint::CheckpointStore;
use crate::dispatcher::{DispatchError, Dispatcher, DispatcherConfig};
use crate::error::{IngestError, IngestResult};
use crate::notify::Notifier;
use crate::stats::{EntryStats, RunSummary};
use crate::store::CredentialStore;

/// Default time to wait for outstanding notifications at the end of a run
pub const DEFAULT_NOTIFY_FLUSH_SECS: u64 = 15;

#[derive(Debug, Clone, Copy)]
pub struct WalkerOptions {
    pub dispatcher: DispatcherConfig,
    /// Capacity of the channel between the archive reader and the walker
    pub event_capacity: usize,
    /// Upper bound on waiting for notifications before `run` returns
    pub notify_flush_timeout: Duration,
}

impl Default for WalkerOptions {
    fn default() -> Self {
        Self {
            dispatcher: DispatcherConfig::default(),
            event_capacity: DEFAULT_EVENT_CAPACITY,
            notify_flush_timeout: Duration::from_secs(DEFAULT_NOTIFY_FLUSH_SECS),
        }
    }
}

/// Background notification tasks for one run
struct Notifications {
    notifier: Arc<dyn Notifier>,
    tasks: JoinSet<()>,
}

impl Notifications {
    fn new(notifier: Arc<dyn Notifier>) -> Self {
        Self {
            notifier,
            tasks: JoinSet::new(),
        }
    }

    fn send(&mut self, message: String) {
        let notifier = self.notifier.clone();
        self.tasks.spawn(async move {
            if let Err(e) = notifier.notify(&message).await {
                warn!(error = %e, "ALRT unable to send notification");
            }
        });
    }

    /// Wait for outstanding notifications; whatever is left after `timeout`
    /// is aborted.
    async fn flush(mut self, timeout: Duration) {
        let all = async {
            while self.tasks.join_next().await.is_some() {}
        };
        if tokio::time::timeout(timeout, all).await.is_err() {
            warn!(
                outstanding = self.tasks.len(),
                "Timed out waiting for notifications"
            );
        }
    }
}

pub struct ArchiveWalker {
    store: Arc<dyn CredentialStore>,
    checkpoints: CheckpointStore,
    notifier: Arc<dyn Notifier>,
    options: WalkerOptions,
    cancel: CancellationToken,
}

impl ArchiveWalker {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        checkpoints: CheckpointStore,
        notifier: Arc<dyn Notifier>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            checkpoints,
            notifier,
            options: WalkerOptions::default(),
            cancel,
        }
    }

    pub fn with_options(mut self, options: WalkerOptions) -> Self {
        self.options = options;
        self
    }

    pub fn checkpoints(&self) -> &CheckpointStore {
        &self.checkpoints
    }

    /// Seed every pending entry of `archive`
    ///
    /// Returns `Ok` with `cancelled` set when the token fired; the entry in
    /// progress at that point is drained but not checkpointed.
    #[instrument(skip_all, fields(archive = %archive.display()))]
    pub async fn run(&mut self, archive: &Path) -> IngestResult<RunSummary> {
        let mut summary = RunSummary::new(archive.display().to_string());
        let mut notifications = Notifications::new(self.notifier.clone());

        info!(store = self.store.name(), "Starting archive");
        notifications.send(format!("Starting: {}", archive.display()));

        let dispatcher = Dispatcher::start(
            self.store.clone(),
            self.options.dispatcher,
            self.cancel.clone(),
        );
        let mut reader = ArchiveReader::open(archive, self.options.event_capacity);

        let walked = self
            .walk(&mut reader, &dispatcher, &mut summary, &mut notifications)
            .await;

        dispatcher.shutdown().await;
        reader.close().await;

        if let Err(e) = walked {
            error!(archive = %archive.display(), error = %e, "Run aborted");
            notifications.send(format!("Failed: {}\n{}", archive.display(), e));
            notifications.flush(self.options.notify_flush_timeout).await;
            return Err(e);
        }

        summary.complete();
        info!(
            entries = summary.entries.len(),
            resumed = summary.resumed_entries.len(),
            lines = summary.lines_submitted(),
            net_new = summary.net_new(),
            cancelled = summary.cancelled,
            duration_secs = summary.duration_secs,
            "Archive finished"
        );

        notifications.send(summary.message());
        notifications.flush(self.options.notify_flush_timeout).await;

        Ok(summary)
    }

    async fn walk(
        &mut self,
        reader: &mut ArchiveReader,
        dispatcher: &Dispatcher,
        summary: &mut RunSummary,
        notifications: &mut Notifications,
    ) -> IngestResult<()> {
        loop {
            let event = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    summary.cancelled = true;
                    break;
                },
                event = reader.next_event() => event,
            };

            let (header, reply) = match event {
                None => break,
                Some(ArchiveEvent::Entry { header, reply }) => (header, reply),
                Some(ArchiveEvent::Failed(e)) => return Err(e.into()),
                Some(ArchiveEvent::Line(_) | ArchiveEvent::EntryEnd) => {
                    return Err(unexpected("line outside of an entry"));
                },
            };

            if !header.is_file() {
                debug!(entry = %header.name, kind = ?header.kind, "Skipping non-regular entry");
                let _ = reply.send(EntryDecision::Skip);
                continue;
            }

            if self.checkpoints.is_done(&header.name) {
                info!(entry = %header.name, "Skipping: already processed");
                let _ = reply.send(EntryDecision::Skip);
                summary.resumed_entries.push(header.name);
                continue;
            }

            let records_before = self.store.record_count().await?;
            if reply.send(EntryDecision::Process).is_err() {
                return Err(unexpected("reader exited while waiting for a decision"));
            }

            let started = Instant::now();
            info!(entry = %header.name, size = header.size, "Starting entry");

            let submitted = self.feed_entry(reader, dispatcher, &header).await?;
            debug!(entry = %header.name, submitted, "Waiting for workers to drain");
            let outcomes = dispatcher.drain().await;

            if self.cancel.is_cancelled() {
                warn!(
                    entry = %header.name,
                    submitted,
                    completed = outcomes.total() - outcomes.cancelled,
                    "Run cancelled, entry drained but not checkpointed"
                );
                summary.interrupted = Some(outcomes);
                summary.cancelled = true;
                break;
            }

            let records_after = self.store.record_count().await?;
            self.checkpoints.mark_done(&header.name).await?;

            let stats = EntryStats::new(
                header.name,
                submitted,
                records_before,
                records_after,
                outcomes,
                started.elapsed().as_secs_f64(),
            );
            info!(
                entry = %stats.name,
                lines = stats.lines_submitted,
                net_new = stats.net_new,
                duplicates = stats.duplicates,
                skipped = stats.outcomes.skipped,
                encoding_rejects = stats.outcomes.encoding_rejects,
                failures = stats.outcomes.failures,
                total_records = stats.total_records,
                "Finished entry"
            );

            notifications.send(stats.message());
            summary.entries.push(stats);
        }

        Ok(())
    }

    /// Submit every line of the current entry; returns how many were queued
    ///
    /// Stops early without error when the run is cancelled.
    async fn feed_entry(
        &self,
        reader: &mut ArchiveReader,
        dispatcher: &Dispatcher,
        header: &EntryHeader,
    ) -> IngestResult<u64> {
        let mut submitted = 0u64;

        loop {
            let event = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(submitted),
                event = reader.next_event() => event,
            };

            match event {
                Some(ArchiveEvent::Line(line)) => match dispatcher.submit(line).await {
                    Ok(()) => submitted += 1,
                    Err(DispatchError::Cancelled) => return Ok(submitted),
                    Err(e) => return Err(e.into()),
                },
                Some(ArchiveEvent::EntryEnd) => return Ok(submitted),
                Some(ArchiveEvent::Failed(e)) => return Err(e.into()),
                Some(ArchiveEvent::Entry { .. }) => {
                    return Err(unexpected("entry started before the previous one ended"));
                },
                None => {
                    return Err(unexpected(&format!(
                        "archive ended inside entry '{}'",
                        header.name
                    )));
                },
            }
        }
    }
}

fn unexpected(what: &str) -> IngestError {
    IngestError::Structural(ArchiveError::Reader(what.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::test_support::write_tar_gz;
    use crate::notify::{LogNotifier, NotifyError};
    use crate::store::{MemoryStore, UpsertError};
    use async_trait::async_trait;
    use passdb_common::Credential;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Cancels the run once `limit` upserts have gone through
    struct CancellingStore {
        inner: MemoryStore,
        seen: AtomicUsize,
        limit: usize,
        cancel: CancellationToken,
    }

    #[async_trait]
    impl CredentialStore for CancellingStore {
        async fn upsert(&self, credential: &Credential) -> Result<(), UpsertError> {
            let result = self.inner.upsert(credential).await;
            if self.seen.fetch_add(1, Ordering::SeqCst) + 1 == self.limit {
                self.cancel.cancel();
            }
            result
        }

        async fn record_count(&self) -> Result<i64, UpsertError> {
            self.inner.record_count().await
        }

        fn name(&self) -> &str {
            "cancelling"
        }
    }

    #[derive(Default)]
    struct RecordingNotifier {
        messages: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn notify(&self, message: &str) -> Result<(), NotifyError> {
            self.messages.lock().unwrap().push(message.to_string());
            Ok(())
        }
    }

    fn options(workers: usize) -> WalkerOptions {
        WalkerOptions {
            dispatcher: DispatcherConfig {
                workers,
                queue_capacity: 4,
            },
            event_capacity: 8,
            notify_flush_timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn test_entry_stats_and_notifications() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("dump.tar.gz");
        write_tar_gz(
            &archive,
            &[("dump/a.txt", "a@b.com:p1\na@b.com:p1\nbad-line\nc@d.com;p2\n")],
        );

        let store = Arc::new(MemoryStore::new());
        let notifier = Arc::new(RecordingNotifier::default());
        let checkpoints = CheckpointStore::load(dir.path().join("done.log")).await.unwrap();

        let mut walker = ArchiveWalker::new(
            store.clone(),
            checkpoints,
            notifier.clone(),
            CancellationToken::new(),
        )
        .with_options(options(4));
        let summary = walker.run(&archive).await.unwrap();

        assert!(!summary.cancelled);
        assert_eq!(summary.entries.len(), 1);
        let entry = &summary.entries[0];
        assert_eq!(entry.name, "dump/a.txt");
        assert_eq!(entry.lines_submitted, 4);
        assert_eq!(entry.net_new, 2);
        assert_eq!(entry.duplicates, 2);
        assert_eq!(entry.outcomes.skipped, 1);
        assert!(walker.checkpoints().is_done("dump/a.txt"));

        let messages = notifier.messages.lock().unwrap().clone();
        assert_eq!(messages.len(), 3);
        assert!(messages.iter().any(|m| m.starts_with("Starting: ")));
        assert!(messages.iter().any(|m| m.starts_with("Finished processing: dump/a.txt")));
        assert!(messages.iter().any(|m| m.starts_with("Completed tar: ")));
    }

    #[tokio::test]
    async fn test_cancel_mid_entry_leaves_it_unchecked() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("dump.tar.gz");
        let lines: String = (0..50).map(|i| format!("user{i}@example.com:pw{i}\n")).collect();
        write_tar_gz(&archive, &[("a.txt", &lines), ("b.txt", "late@example.com:pw\n")]);

        let cancel = CancellationToken::new();
        let store = Arc::new(CancellingStore {
            inner: MemoryStore::new(),
            seen: AtomicUsize::new(0),
            limit: 5,
            cancel: cancel.clone(),
        });
        let log = dir.path().join("done.log");
        let checkpoints = CheckpointStore::load(&log).await.unwrap();

        let mut walker = ArchiveWalker::new(store.clone(), checkpoints, Arc::new(LogNotifier), cancel)
            .with_options(options(1));
        let summary = walker.run(&archive).await.unwrap();

        assert!(summary.cancelled);
        assert!(summary.entries.is_empty());
        assert!(summary.interrupted.is_some());
        assert!(!walker.checkpoints().is_done("a.txt"));
        assert_eq!(store.inner.record_count().await.unwrap(), 5);
        assert!(!store
            .inner
            .snapshot()
            .usernames
            .contains("late"));

        let reloaded = CheckpointStore::load(&log).await.unwrap();
        assert!(reloaded.is_empty());
    }

    #[tokio::test]
    async fn test_missing_archive_is_structural() {
        let dir = tempfile::tempdir().unwrap();
        let checkpoints = CheckpointStore::load(dir.path().join("done.log")).await.unwrap();

        let mut walker = ArchiveWalker::new(
            Arc::new(MemoryStore::new()),
            checkpoints,
            Arc::new(LogNotifier),
            CancellationToken::new(),
        )
        .with_options(options(2));
        let err = walker.run(&dir.path().join("nope.tar.gz")).await.unwrap_err();

        assert!(matches!(err, IngestError::Structural(ArchiveError::Open { .. })));
    }
}
