//! Streaming archive reader
//!
//! Decompression and tar parsing are blocking, so the archive is read on a
//! `spawn_blocking` thread which reports what it finds over a bounded
//! channel. For every entry the reader sends the header and then waits for
//! the consumer to decide whether the entry's lines are wanted; a bounded
//! channel means a slow consumer stalls the reader instead of buffering the
//! archive in memory.
//!
//! # Supported Formats
//!
//! - **Tar.gz** (.tar.gz, .tgz): gzip + tar, one entry per archive member
//! - **Tar** (.tar)
//! - **Gzip** (.gz): a single compressed text file
//! - anything else is read as a single plain text file

use flate2::read::GzDecoder;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// Default capacity of the reader's event channel
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Longest line, terminator included, that is passed on; longer lines are
/// dropped with a warning
pub const MAX_LINE_BYTES: usize = 64 * 1024;

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("Failed to open archive {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read archive {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read entry '{entry}' of {path}: {source}")]
    Entry {
        path: PathBuf,
        entry: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Archive reader stopped unexpectedly: {0}")]
    Reader(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    TarGz,
    Tar,
    Gzip,
    Plain,
}

impl ArchiveFormat {
    /// Detect the format from the file name
    pub fn detect(path: &Path) -> Self {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_lowercase())
            .unwrap_or_default();

        if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            Self::TarGz
        } else if name.ends_with(".tar") {
            Self::Tar
        } else if name.ends_with(".gz") {
            Self::Gzip
        } else {
            Self::Plain
        }
    }

    pub fn is_tar(&self) -> bool {
        matches!(self, Self::TarGz | Self::Tar)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
    /// Links, devices, fifos and other non-regular members
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryHeader {
    pub name: String,
    pub kind: EntryKind,
    pub size: u64,
}

impl EntryHeader {
    pub fn is_file(&self) -> bool {
        self.kind == EntryKind::File
    }
}

/// Consumer's answer to an [`ArchiveEvent::Entry`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryDecision {
    Process,
    Skip,
}

#[derive(Debug)]
pub enum ArchiveEvent {
    /// Start of an entry; the reader waits for a decision on `reply`
    Entry {
        header: EntryHeader,
        reply: oneshot::Sender<EntryDecision>,
    },
    /// One line of the current entry without its terminator
    Line(Vec<u8>),
    /// All lines of the current entry have been sent
    EntryEnd,
    /// Reading stopped on an error; no further events follow
    Failed(ArchiveError),
}

/// Handle to an archive being read on a blocking thread
pub struct ArchiveReader {
    events: mpsc::Receiver<ArchiveEvent>,
    handle: JoinHandle<()>,
}

impl ArchiveReader {
    /// Start reading `path`; must be called from within a tokio runtime
    pub fn open(path: impl Into<PathBuf>, capacity: usize) -> Self {
        let path = path.into();
        let format = ArchiveFormat::detect(&path);
        let (tx, events) = mpsc::channel(capacity.max(1));

        debug!(path = %path.display(), ?format, "Opening archive");

        let handle = tokio::task::spawn_blocking(move || {
            match read_archive(&path, format, &tx) {
                Ok(()) | Err(Stop::Closed) => {},
                Err(Stop::Failed(e)) => {
                    // The consumer may already be gone; nothing left to tell
                    let _ = tx.blocking_send(ArchiveEvent::Failed(e));
                },
            }
        });

        Self { events, handle }
    }

    /// Next event, or `None` once the whole archive has been read
    pub async fn next_event(&mut self) -> Option<ArchiveEvent> {
        self.events.recv().await
    }

    /// Stop reading and wait for the reader thread to exit
    pub async fn close(self) {
        let Self { events, handle } = self;
        drop(events);
        if let Err(e) = handle.await {
            error!(error = %e, "Archive reader thread failed");
        }
    }
}

enum Stop {
    /// The consumer dropped the event channel or a decision
    Closed,
    Failed(ArchiveError),
}

fn send(tx: &mpsc::Sender<ArchiveEvent>, event: ArchiveEvent) -> Result<(), Stop> {
    tx.blocking_send(event).map_err(|_| Stop::Closed)
}

fn read_archive(
    path: &Path,
    format: ArchiveFormat,
    tx: &mpsc::Sender<ArchiveEvent>,
) -> Result<(), Stop> {
    let file = File::open(path).map_err(|source| {
        Stop::Failed(ArchiveError::Open {
            path: path.to_path_buf(),
            source,
        })
    })?;
    let size = file.metadata().map(|m| m.len()).unwrap_or_default();
    let reader = BufReader::new(file);

    match format {
        ArchiveFormat::TarGz => read_tar(path, tar::Archive::new(GzDecoder::new(reader)), tx),
        ArchiveFormat::Tar => read_tar(path, tar::Archive::new(reader), tx),
        ArchiveFormat::Gzip => {
            let header = single_entry_header(path, ".gz", 0);
            read_single(path, header, GzDecoder::new(reader), tx)
        },
        ArchiveFormat::Plain => {
            let header = single_entry_header(path, "", size);
            read_single(path, header, reader, tx)
        },
    }
}

fn single_entry_header(path: &Path, suffix: &str, size: u64) -> EntryHeader {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = if suffix.is_empty() {
        file_name
    } else {
        let keep = file_name.len().saturating_sub(suffix.len());
        file_name.get(..keep).unwrap_or(file_name.as_str()).to_string()
    };

    EntryHeader {
        name,
        kind: EntryKind::File,
        size,
    }
}

fn read_tar<R: Read>(
    path: &Path,
    mut archive: tar::Archive<R>,
    tx: &mpsc::Sender<ArchiveEvent>,
) -> Result<(), Stop> {
    let read_err = |source: std::io::Error| {
        Stop::Failed(ArchiveError::Read {
            path: path.to_path_buf(),
            source,
        })
    };

    for entry in archive.entries().map_err(read_err)? {
        let entry = entry.map_err(read_err)?;
        let header = tar_header(&entry).map_err(read_err)?;

        if decide(tx, header.clone())? == EntryDecision::Process {
            stream_lines(path, &header.name, entry, MAX_LINE_BYTES, tx)?;
        }
    }
    Ok(())
}

fn tar_header<R: Read>(entry: &tar::Entry<'_, R>) -> std::io::Result<EntryHeader> {
    let entry_type = entry.header().entry_type();
    let kind = if entry_type.is_file() {
        EntryKind::File
    } else if entry_type.is_dir() {
        EntryKind::Directory
    } else {
        EntryKind::Other
    };

    Ok(EntryHeader {
        name: entry.path()?.to_string_lossy().into_owned(),
        kind,
        size: entry.size(),
    })
}

fn read_single<R: Read>(
    path: &Path,
    header: EntryHeader,
    reader: R,
    tx: &mpsc::Sender<ArchiveEvent>,
) -> Result<(), Stop> {
    if decide(tx, header.clone())? == EntryDecision::Process {
        stream_lines(path, &header.name, reader, MAX_LINE_BYTES, tx)?;
    }
    Ok(())
}

fn decide(tx: &mpsc::Sender<ArchiveEvent>, header: EntryHeader) -> Result<EntryDecision, Stop> {
    let (reply, decision) = oneshot::channel();
    send(tx, ArchiveEvent::Entry { header, reply })?;
    decision.blocking_recv().map_err(|_| Stop::Closed)
}

fn stream_lines<R: Read>(
    path: &Path,
    entry: &str,
    reader: R,
    max_line: usize,
    tx: &mpsc::Sender<ArchiveEvent>,
) -> Result<(), Stop> {
    let entry_err = |source: std::io::Error| {
        Stop::Failed(ArchiveError::Entry {
            path: path.to_path_buf(),
            entry: entry.to_string(),
            source,
        })
    };

    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();

    loop {
        buf.clear();
        let read = reader
            .by_ref()
            .take(max_line as u64)
            .read_until(b'\n', &mut buf)
            .map_err(entry_err)?;
        if read == 0 {
            break;
        }

        if buf.len() == max_line && buf.last() != Some(&b'\n') {
            let rest = skip_line(&mut reader).map_err(entry_err)?;
            if buf.len() + rest > max_line {
                warn!(
                    entry,
                    bytes = buf.len() + rest,
                    prefix = %String::from_utf8_lossy(&buf[..buf.len().min(64)]),
                    "ENC line too long, dropped"
                );
                continue;
            }
        }

        send(tx, ArchiveEvent::Line(trim_line_ending(&buf).to_vec()))?;
    }

    send(tx, ArchiveEvent::EntryEnd)
}

/// Consume the remainder of the current line; returns the bytes consumed
fn skip_line<R: BufRead>(reader: &mut R) -> std::io::Result<usize> {
    let mut skipped = 0;
    loop {
        let (used, done) = {
            let available = reader.fill_buf()?;
            if available.is_empty() {
                return Ok(skipped);
            }
            match available.iter().position(|&b| b == b'\n') {
                Some(idx) => (idx + 1, true),
                None => (available.len(), false),
            }
        };
        reader.consume(used);
        skipped += used;
        if done {
            return Ok(skipped);
        }
    }
}

/// Strip one `\n` and then one `\r`
fn trim_line_ending(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}


#[cfg(test)]
mod tests {
    use super::test_support::write_tar_gz;
    use super::*;

    /// Read every event, processing all entries except those named in `skip`
    async fn collect(path: &Path, skip: &[&str]) -> Vec<String> {
        let mut reader = ArchiveReader::open(path, 4);
        let mut seen = Vec::new();

        while let Some(event) = reader.next_event().await {
            match event {
                ArchiveEvent::Entry { header, reply } => {
                    let decision = if header.is_file() && !skip.contains(&header.name.as_str()) {
                        EntryDecision::Process
                    } else {
                        EntryDecision::Skip
                    };
                    seen.push(format!("entry:{}:{:?}", header.name, decision));
                    reply.send(decision).unwrap();
                },
                ArchiveEvent::Line(line) => {
                    seen.push(format!("line:{}", String::from_utf8_lossy(&line)))
                },
                ArchiveEvent::EntryEnd => seen.push("end".to_string()),
                ArchiveEvent::Failed(e) => seen.push(format!("failed:{e}")),
            }
        }
        reader.close().await;
        seen
    }

    #[test]
    fn test_format_detection() {
        assert_eq!(ArchiveFormat::detect(Path::new("dump.tar.gz")), ArchiveFormat::TarGz);
        assert_eq!(ArchiveFormat::detect(Path::new("dump.TGZ")), ArchiveFormat::TarGz);
        assert_eq!(ArchiveFormat::detect(Path::new("dump.tar")), ArchiveFormat::Tar);
        assert_eq!(ArchiveFormat::detect(Path::new("combo.txt.gz")), ArchiveFormat::Gzip);
        assert_eq!(ArchiveFormat::detect(Path::new("combo.txt")), ArchiveFormat::Plain);
        assert!(ArchiveFormat::TarGz.is_tar());
        assert!(!ArchiveFormat::Gzip.is_tar());
    }

    /// Run `stream_lines` over `input` and collect the lines it emits
    fn stream(input: &[u8], max_line: usize) -> Vec<String> {
        let (tx, mut rx) = mpsc::channel(64);
        assert!(stream_lines(Path::new("dump.txt"), "dump.txt", input, max_line, &tx).is_ok());
        drop(tx);

        let mut lines = Vec::new();
        while let Ok(event) = rx.try_recv() {
            match event {
                ArchiveEvent::Line(line) => lines.push(String::from_utf8_lossy(&line).into_owned()),
                ArchiveEvent::EntryEnd => lines.push("end".to_string()),
                other => panic!("unexpected event: {other:?}"),
            }
        }
        lines
    }

    #[test]
    fn test_overlong_lines_are_dropped() {
        let input = b"a@b.com:p1\nx@y.com:0123456789abcdef\nc@d.com:p2\n";
        assert_eq!(stream(input, 12), vec!["a@b.com:p1", "c@d.com:p2", "end"]);
    }

    #[test]
    fn test_overlong_unterminated_tail_is_dropped() {
        let input = b"a@b.com:p1\nno newline in this very long tail";
        assert_eq!(stream(input, 12), vec!["a@b.com:p1", "end"]);
    }

    #[test]
    fn test_line_at_the_limit_is_kept() {
        // 11 bytes plus the terminator, and an unterminated 12-byte tail
        let input = b"a@b.com:p12\nc@d.com:p123";
        assert_eq!(stream(input, 12), vec!["a@b.com:p12", "c@d.com:p123", "end"]);
    }

    #[test]
    fn test_trim_line_ending() {
        assert_eq!(trim_line_ending(b"a@b:c\r\n"), b"a@b:c");
        assert_eq!(trim_line_ending(b"a@b:c\n"), b"a@b:c");
        assert_eq!(trim_line_ending(b"a@b:c"), b"a@b:c");
        assert_eq!(trim_line_ending(b"a@b:c\r\r\n"), b"a@b:c\r");
    }

    #[tokio::test]
    async fn test_tar_gz_entries_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dump.tar.gz");
        write_tar_gz(
            &path,
            &[("dump/a.txt", "a@b.com:p1\r\nc@d.com;p2\n"), ("dump/b.txt", "e@f.com:p3")],
        );

        let seen = collect(&path, &[]).await;
        assert_eq!(
            seen,
            vec![
                "entry:dump/a.txt:Process",
                "line:a@b.com:p1",
                "line:c@d.com;p2",
                "end",
                "entry:dump/b.txt:Process",
                "line:e@f.com:p3",
                "end",
            ]
        );
    }

    #[tokio::test]
    async fn test_skipped_entry_emits_no_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dump.tgz");
        write_tar_gz(&path, &[("a.txt", "x@y.com:1\n"), ("b.txt", "z@y.com:2\n")]);

        let seen = collect(&path, &["a.txt"]).await;
        assert_eq!(
            seen,
            vec!["entry:a.txt:Skip", "entry:b.txt:Process", "line:z@y.com:2", "end"]
        );
    }

    #[tokio::test]
    async fn test_plain_text_is_one_entry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("combo.txt");
        std::fs::write(&path, "a@b.com:p1\n\nc@d.com:p2\n").unwrap();

        let seen = collect(&path, &[]).await;
        assert_eq!(
            seen,
            vec!["entry:combo.txt:Process", "line:a@b.com:p1", "line:", "line:c@d.com:p2", "end"]
        );
    }

    #[tokio::test]
    async fn test_gzip_entry_named_without_suffix() {
        use flate2::write::GzEncoder;
        use std::io::Write;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("combo.txt.gz");
        let mut encoder = GzEncoder::new(
            std::fs::File::create(&path).unwrap(),
            flate2::Compression::default(),
        );
        encoder.write_all(b"a@b.com:p1\n").unwrap();
        encoder.finish().unwrap();

        let seen = collect(&path, &[]).await;
        assert_eq!(seen, vec!["entry:combo.txt:Process", "line:a@b.com:p1", "end"]);
    }

    #[tokio::test]
    async fn test_missing_archive_fails() {
        let dir = tempfile::tempdir().unwrap();
        let seen = collect(&dir.path().join("missing.tar.gz"), &[]).await;

        assert_eq!(seen.len(), 1);
        assert!(seen[0].starts_with("failed:Failed to open archive"));
    }

    #[tokio::test]
    async fn test_corrupt_gzip_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dump.tar.gz");
        std::fs::write(&path, b"definitely not gzip").unwrap();

        let seen = collect(&path, &[]).await;
        assert_eq!(seen.len(), 1);
        assert!(seen[0].starts_with("failed:"));
    }
}
