//! Bounded dispatcher for upsert work
//!
//! Lines are queued on a bounded channel and pulled off by a single pump
//! task, which holds a semaphore permit for every upsert it spawns. Queue
//! capacity bounds memory; the semaphore bounds how many transactions are
//! open against the store at once, independently of queue depth.
//!
//! Every submitted line is counted as pending until its worker finishes.
//! [`Dispatcher::drain`] waits for the pending count to reach zero, which is
//! the barrier the walker needs before it may checkpoint an entry.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::{mpsc, Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::parser;
use crate::stats::{DrainReport, LineOutcome};
use crate::store::{CredentialStore, UpsertError};

/// Default ceiling on concurrent upserts
pub const DEFAULT_WORKERS: usize = 50;

/// Default number of lines buffered ahead of the workers
pub const DEFAULT_QUEUE_CAPACITY: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatcherConfig {
    pub workers: usize,
    pub queue_capacity: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum DispatchError {
    #[error("Dispatcher is cancelled")]
    Cancelled,

    #[error("Dispatcher is shut down")]
    Closed,
}

#[derive(Default)]
struct Shared {
    pending: AtomicUsize,
    drained: Notify,
    report: Mutex<DrainReport>,
}

impl Shared {
    fn finish(&self, outcome: LineOutcome) {
        self.report
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .record(outcome);

        if self.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.drained.notify_waiters();
        }
    }

    fn take_report(&self) -> DrainReport {
        std::mem::take(&mut *self.report.lock().unwrap_or_else(|poisoned| poisoned.into_inner()))
    }
}

/// Resolves one pending line exactly once, including when the worker
/// panics or is aborted.
struct PendingLine {
    shared: Arc<Shared>,
    outcome: Option<LineOutcome>,
}

impl PendingLine {
    fn resolve(mut self, outcome: LineOutcome) {
        self.outcome = Some(outcome);
    }
}

impl Drop for PendingLine {
    fn drop(&mut self) {
        self.shared.finish(self.outcome.unwrap_or(LineOutcome::Failed));
    }
}

/// Fixed-size pool of upsert workers fed through a bounded queue
pub struct Dispatcher {
    sender: Option<mpsc::Sender<Vec<u8>>>,
    shared: Arc<Shared>,
    pump: Option<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl Dispatcher {
    /// Start the pump task; must be called from within a tokio runtime
    pub fn start(
        store: Arc<dyn CredentialStore>,
        config: DispatcherConfig,
        cancel: CancellationToken,
    ) -> Self {
        let workers = config.workers.max(1);
        let (sender, receiver) = mpsc::channel(config.queue_capacity.max(1));
        let shared = Arc::new(Shared::default());

        let pump = tokio::spawn(pump(
            receiver,
            Arc::new(Semaphore::new(workers)),
            store,
            shared.clone(),
            cancel.clone(),
        ));

        debug!(
            workers,
            queue_capacity = config.queue_capacity,
            "Dispatcher started"
        );

        Self {
            sender: Some(sender),
            shared,
            pump: Some(pump),
            cancel,
        }
    }

    /// Queue one raw line, waiting while the queue is full
    pub async fn submit(&self, line: Vec<u8>) -> Result<(), DispatchError> {
        if self.cancel.is_cancelled() {
            return Err(DispatchError::Cancelled);
        }
        let sender = self.sender.as_ref().ok_or(DispatchError::Closed)?;

        self.shared.pending.fetch_add(1, Ordering::AcqRel);

        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(DispatchError::Cancelled),
            sent = sender.send(line) => sent.map_err(|_| DispatchError::Closed),
        };

        if result.is_err() {
            // The line never reached the queue, so it has no outcome to tally
            if self.shared.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
                self.shared.drained.notify_waiters();
            }
        }
        result
    }

    /// Number of submitted lines that have not finished yet
    pub fn pending(&self) -> usize {
        self.shared.pending.load(Ordering::Acquire)
    }

    /// Wait until every submitted line has finished and return their tally
    ///
    /// The tally is reset, so consecutive drains report disjoint sets of
    /// lines.
    pub async fn drain(&self) -> DrainReport {
        loop {
            let drained = self.shared.drained.notified();
            if self.shared.pending.load(Ordering::Acquire) == 0 {
                break;
            }
            drained.await;
        }
        self.shared.take_report()
    }

    /// Close the queue and wait for the pump and every worker to exit
    pub async fn shutdown(mut self) -> DrainReport {
        self.sender.take();
        if let Some(pump) = self.pump.take() {
            if let Err(e) = pump.await {
                error!(error = %e, "Dispatcher pump task failed");
            }
        }
        self.shared.take_report()
    }
}

async fn pump(
    mut receiver: mpsc::Receiver<Vec<u8>>,
    semaphore: Arc<Semaphore>,
    store: Arc<dyn CredentialStore>,
    shared: Arc<Shared>,
    cancel: CancellationToken,
) {
    let mut workers = JoinSet::new();

    while let Some(line) = receiver.recv().await {
        let pending = PendingLine {
            shared: shared.clone(),
            outcome: None,
        };

        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            permit = semaphore.clone().acquire_owned() => permit.ok(),
        };
        let Some(permit) = permit else {
            pending.resolve(LineOutcome::Cancelled);
            continue;
        };

        while let Some(joined) = workers.try_join_next() {
            log_worker_exit(joined);
        }

        workers.spawn(run_worker(
            line,
            permit,
            pending,
            store.clone(),
            cancel.clone(),
        ));
    }

    while let Some(joined) = workers.join_next().await {
        log_worker_exit(joined);
    }
    debug!("Dispatcher pump stopped");
}

async fn run_worker(
    line: Vec<u8>,
    _permit: OwnedSemaphorePermit,
    pending: PendingLine,
    store: Arc<dyn CredentialStore>,
    cancel: CancellationToken,
) {
    let outcome = process_line(store.as_ref(), &line, &cancel).await;
    pending.resolve(outcome);
}

fn log_worker_exit(joined: Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        if e.is_panic() {
            error!(error = %e, "Upsert worker panicked");
        }
    }
}

/// Decode, parse and store one line, classifying every failure
pub async fn process_line(
    store: &dyn CredentialStore,
    line: &[u8],
    cancel: &CancellationToken,
) -> LineOutcome {
    let text = match std::str::from_utf8(line) {
        Ok(text) => text,
        Err(e) => {
            warn!(
                line = %String::from_utf8_lossy(line),
                error = %e,
                "ENC line is not valid UTF-8"
            );
            return LineOutcome::EncodingRejected;
        },
    };

    let Some(credential) = parser::parse_line(text) else {
        debug!(line = text, "No credential in line, skipping");
        return LineOutcome::Skipped;
    };

    if cancel.is_cancelled() {
        return LineOutcome::Cancelled;
    }

    match store.upsert(&credential).await {
        Ok(()) => LineOutcome::Inserted,
        Err(UpsertError::Conflict) => {
            debug!(line = text, "Record already exists");
            LineOutcome::Duplicate
        },
        Err(UpsertError::Encoding { message }) => {
            warn!(
                line = text,
                username = %credential.username,
                domain = %credential.domain,
                password = %credential.password,
                db_message = %message,
                "ENC store rejected line"
            );
            LineOutcome::EncodingRejected
        },
        Err(e) => {
            error!(line = text, store = store.name(), error = %e, "ERR failed to store line");
            LineOutcome::Failed
        },
    }
}
