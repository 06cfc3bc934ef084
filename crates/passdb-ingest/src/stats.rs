//! Run and entry statistics

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How a single submitted line was resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineOutcome {
    /// A new fact row was written
    Inserted,
    /// The triple was already present
    Duplicate,
    /// No credential could be derived from the line
    Skipped,
    /// The line was not valid UTF-8 or the store rejected its characters
    EncodingRejected,
    /// Any other store failure
    Failed,
    /// Never executed because the run was cancelled
    Cancelled,
}

/// Tally of line outcomes between two drains of the dispatcher
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrainReport {
    pub inserted: u64,
    pub duplicates: u64,
    pub skipped: u64,
    pub encoding_rejects: u64,
    pub failures: u64,
    pub cancelled: u64,
}

impl DrainReport {
    pub fn record(&mut self, outcome: LineOutcome) {
        match outcome {
            LineOutcome::Inserted => self.inserted += 1,
            LineOutcome::Duplicate => self.duplicates += 1,
            LineOutcome::Skipped => self.skipped += 1,
            LineOutcome::EncodingRejected => self.encoding_rejects += 1,
            LineOutcome::Failed => self.failures += 1,
            LineOutcome::Cancelled => self.cancelled += 1,
        }
    }

    pub fn merge(&mut self, other: &DrainReport) {
        self.inserted += other.inserted;
        self.duplicates += other.duplicates;
        self.skipped += other.skipped;
        self.encoding_rejects += other.encoding_rejects;
        self.failures += other.failures;
        self.cancelled += other.cancelled;
    }

    /// Number of lines resolved, whatever the outcome
    pub fn total(&self) -> u64 {
        self.inserted
            + self.duplicates
            + self.skipped
            + self.encoding_rejects
            + self.failures
            + self.cancelled
    }
}

/// Statistics for one fully drained archive entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryStats {
    /// Entry name as recorded in the checkpoint log
    pub name: String,
    /// Lines read from the entry and handed to the dispatcher
    pub lines_submitted: u64,
    /// Growth of the fact table while the entry was processed
    pub net_new: i64,
    /// `lines_submitted - net_new`
    pub duplicates: i64,
    /// Fact rows in the store once the entry drained
    pub total_records: i64,
    pub outcomes: DrainReport,
    pub duration_secs: f64,
}

impl EntryStats {
    pub fn new(
        name: impl Into<String>,
        lines_submitted: u64,
        records_before: i64,
        records_after: i64,
        outcomes: DrainReport,
        duration_secs: f64,
    ) -> Self {
        let net_new = records_after - records_before;
        Self {
            name: name.into(),
            lines_submitted,
            net_new,
            duplicates: lines_submitted as i64 - net_new,
            total_records: records_after,
            outcomes,
            duration_secs,
        }
    }

    /// Notification text for a finished entry
    pub fn message(&self) -> String {
        format!(
            "Finished processing: {}\nProcessed: {}\nNew: {}\nTotal: {}",
            self.name, self.lines_submitted, self.net_new, self.total_records
        )
    }
}

/// Summary of one seeding run over an archive
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub archive: String,
    pub entries: Vec<EntryStats>,
    /// Entries skipped because the checkpoint log already lists them
    pub resumed_entries: Vec<String>,
    /// Lines handled for an entry that was interrupted and not checkpointed
    pub interrupted: Option<DrainReport>,
    pub cancelled: bool,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_secs: f64,
}

impl RunSummary {
    pub fn new(archive: impl Into<String>) -> Self {
        Self {
            archive: archive.into(),
            entries: Vec::new(),
            resumed_entries: Vec::new(),
            interrupted: None,
            cancelled: false,
            started_at: Utc::now(),
            completed_at: None,
            duration_secs: 0.0,
        }
    }

    /// Mark the run as completed
    pub fn complete(&mut self) {
        let end = Utc::now();
        self.completed_at = Some(end);
        self.duration_secs = (end - self.started_at).num_milliseconds() as f64 / 1000.0;
    }

    pub fn lines_submitted(&self) -> u64 {
        self.entries.iter().map(|e| e.lines_submitted).sum()
    }

    pub fn net_new(&self) -> i64 {
        self.entries.iter().map(|e| e.net_new).sum()
    }

    /// Outcome tally across every checkpointed entry
    pub fn outcomes(&self) -> DrainReport {
        let mut total = DrainReport::default();
        for entry in &self.entries {
            total.merge(&entry.outcomes);
        }
        total
    }

    /// Notification text for the end of the run
    pub fn message(&self) -> String {
        let status = if self.cancelled { "Cancelled" } else { "Completed" };
        format!(
            "{} tar: {}\nEntries: {} ({} already done)\nProcessed: {}\nNew: {}",
            status,
            self.archive,
            self.entries.len(),
            self.resumed_entries.len(),
            self.lines_submitted(),
            self.net_new()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drain_report_tally() {
        let mut report = DrainReport::default();
        report.record(LineOutcome::Inserted);
        report.record(LineOutcome::Inserted);
        report.record(LineOutcome::Duplicate);
        report.record(LineOutcome::Skipped);

        assert_eq!(report.inserted, 2);
        assert_eq!(report.duplicates, 1);
        assert_eq!(report.total(), 4);
    }

    #[test]
    fn test_entry_duplicates_from_record_delta() {
        let stats = EntryStats::new("a.txt", 10, 100, 107, DrainReport::default(), 1.5);
        assert_eq!(stats.net_new, 7);
        assert_eq!(stats.duplicates, 3);
        assert_eq!(stats.total_records, 107);
        assert!(stats.message().contains("Processed: 10"));
    }

    #[test]
    fn test_run_summary_totals() {
        let mut first = DrainReport::default();
        first.record(LineOutcome::Inserted);
        let mut second = DrainReport::default();
        second.record(LineOutcome::Failed);

        let mut summary = RunSummary::new("dump.tar.gz");
        summary.entries.push(EntryStats::new("a", 1, 0, 1, first, 0.1));
        summary.entries.push(EntryStats::new("b", 1, 1, 1, second, 0.1));
        summary.complete();

        assert_eq!(summary.lines_submitted(), 2);
        assert_eq!(summary.net_new(), 1);
        assert_eq!(summary.outcomes().failures, 1);
        assert!(summary.completed_at.is_some());
        assert!(summary.message().starts_with("Completed tar: dump.tar.gz"));
    }

    #[test]
    fn test_run_summary_serializes() {
        let summary = RunSummary::new("dump.tar.gz");
        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["archive"], "dump.tar.gz");
        assert_eq!(json["cancelled"], false);
    }
}
