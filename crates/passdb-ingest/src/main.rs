//! passdb-seed - Credential archive seeder

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use passdb_common::logging::{init_logging, LogConfig, LogLevel};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use passdb_ingest::checkpoint::CheckpointStore;
use passdb_ingest::config::SeedConfig;
use passdb_ingest::db;
use passdb_ingest::notify::{LogNotifier, Notifier, PushoverNotifier};
use passdb_ingest::splitter::Splitter;
use passdb_ingest::store::{CredentialStore, MemoryStore, PgCredentialStore};
use passdb_ingest::walker::{ArchiveWalker, WalkerOptions};
use passdb_ingest::IngestError;

/// Exit code reported when a run is interrupted by a signal
const EXIT_CANCELLED: u8 = 130;

#[derive(Parser, Debug)]
#[command(name = "passdb-seed")]
#[command(author, version, about = "Load credential dumps into passdb")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Seed the database from an archive
    Seed(SeedArgs),

    /// Write usernames, domains and passwords of an archive to flat files
    Split {
        /// Archive to read (ignored when TEST is set)
        archive: Option<PathBuf>,

        /// Output directory
        #[arg(short, long, default_value = ".")]
        out: PathBuf,
    },
}

#[derive(Args, Debug)]
struct SeedArgs {
    /// Archive to seed from (ignored when TEST is set)
    archive: Option<PathBuf>,

    /// Maximum concurrent upserts [default: SEED_WORKERS or 50]
    #[arg(short, long)]
    workers: Option<usize>,

    /// Lines buffered ahead of the workers [default: SEED_QUEUE_CAPACITY or 50]
    #[arg(long)]
    queue_capacity: Option<usize>,

    /// Checkpoint log [default: SEED_DONE_LOG or done.log]
    #[arg(long)]
    done_log: Option<PathBuf>,

    /// Use an in-memory store instead of the database
    #[arg(long)]
    dry_run: bool,

    /// Do not apply schema migrations at startup
    #[arg(long)]
    skip_migrations: bool,

    /// Print the run summary as JSON
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let config = SeedConfig::load();

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };

    let log_config = LogConfig::builder()
        .level(log_level)
        .log_file_prefix("passdb-seed")
        .filter_directives("sqlx=warn")
        .error_log(config.error_log.clone())
        .build()
        .merge_env()?;

    let _log_guard = init_logging(&log_config)?;
    if let Err(e) = config.validate() {
        error!(error = %e, "Invalid configuration");
        return Err(e);
    }

    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_signal(cancel.clone()));

    let result = match cli.command {
        Command::Seed(args) => seed(&config, args, cancel).await,
        Command::Split { archive, out } => split(&config, archive, out, cancel).await,
    };

    // Fatal errors go through tracing so the error log keeps them
    if let Err(ref e) = result {
        error!(error = %format!("{e:#}"), "Fatal error");
    }
    result
}

async fn seed(config: &SeedConfig, args: SeedArgs, cancel: CancellationToken) -> Result<ExitCode> {
    let archive = config.archive_path(args.archive)?;

    let store: Arc<dyn CredentialStore> = if args.dry_run {
        info!("Dry run, records are kept in memory");
        Arc::new(MemoryStore::new())
    } else {
        let pool = db::create_pool(&config.db_config()?).await?;
        db::health_check(&pool).await?;

        if args.skip_migrations {
            info!("Skipping database migrations");
        } else {
            db::run_migrations(&pool).await?;
        }

        Arc::new(PgCredentialStore::new(pool))
    };

    let notifier: Arc<dyn Notifier> = match &config.pushover {
        Some(pushover) => Arc::new(PushoverNotifier::new(&pushover.token, &pushover.user)?),
        None => Arc::new(LogNotifier),
    };

    let done_log = args.done_log.unwrap_or_else(|| config.done_log.clone());
    let checkpoints = CheckpointStore::load(done_log).await?;

    let mut dispatcher = config.dispatcher();
    if let Some(workers) = args.workers {
        dispatcher.workers = workers;
    }
    if let Some(queue_capacity) = args.queue_capacity {
        dispatcher.queue_capacity = queue_capacity;
    }
    let options = WalkerOptions {
        dispatcher,
        ..WalkerOptions::default()
    };

    let mut walker = ArchiveWalker::new(store, checkpoints, notifier, cancel).with_options(options);
    let summary = walker.run(&archive).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    }

    if summary.cancelled {
        warn!("Seeding interrupted; rerun to resume from the checkpoint log");
        return Ok(ExitCode::from(EXIT_CANCELLED));
    }

    info!("Seeding complete");
    Ok(ExitCode::SUCCESS)
}

async fn split(
    config: &SeedConfig,
    archive: Option<PathBuf>,
    out: PathBuf,
    cancel: CancellationToken,
) -> Result<ExitCode> {
    let archive = config.archive_path(archive)?;

    match Splitter::new(out, cancel).run(&archive).await {
        Ok(summary) => {
            println!(
                "Processed {} lines from {} entries ({} matched, {} unmatched)",
                summary.lines, summary.entries, summary.matched, summary.unmatched
            );
            Ok(ExitCode::SUCCESS)
        },
        Err(IngestError::Cancelled) => {
            warn!("Split interrupted");
            Ok(ExitCode::from(EXIT_CANCELLED))
        },
        Err(e) => Err(e.into()),
    }
}

/// Cancel `token` on Ctrl+C or SIGTERM
async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, finishing in-flight writes");
        },
        _ = terminate => {
            info!("Received terminate signal, finishing in-flight writes");
        },
    }

    token.cancel();
}
