//! Per-record progress for a worker pool run.
//!
//! Workers call [`ProgressReporter::record_done`] once per record they
//! finish, successful or not. The CLI draws an `indicatif` bar with running
//! stored/failed counts and prints every failed record above it.

use std::sync::atomic::{AtomicU64, Ordering};

use indicatif::{ProgressBar, ProgressStyle};

/// Observes records as the pool finishes them. Shared by every worker task.
pub trait ProgressReporter: Send + Sync {
    /// `records` jobs are queued.
    fn begin(&self, records: u64);

    /// One record finished; `failure` holds the error text if it was not stored.
    fn record_done(&self, label: &str, failure: Option<&str>);

    /// The pool has joined every worker.
    fn end(&self);
}

#[derive(Debug, Default)]
pub struct NoopReporter;

impl ProgressReporter for NoopReporter {
    fn begin(&self, _records: u64) {}
    fn record_done(&self, _label: &str, _failure: Option<&str>) {}
    fn end(&self) {}
}

const BAR_TEMPLATE: &str = "{spinner:.green} [{bar:30.cyan/blue}] {pos}/{len} records, {msg} ({eta})";

/// Progress bar with stored/failed tallies.
#[derive(Debug)]
pub struct IndicatifReporter {
    bar: ProgressBar,
    stored: AtomicU64,
    failed: AtomicU64,
}

impl Default for IndicatifReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl IndicatifReporter {
    pub fn new() -> Self {
        Self::with_bar(ProgressBar::new(0))
    }

    /// Tallies records but draws nothing (`--quiet`, `--json`).
    pub fn hidden() -> Self {
        Self::with_bar(ProgressBar::hidden())
    }

    fn with_bar(bar: ProgressBar) -> Self {
        Self {
            bar,
            stored: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    pub fn stored(&self) -> u64 {
        self.stored.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    fn tally(&self) -> String {
        format!("{} stored, {} failed", self.stored(), self.failed())
    }
}

impl ProgressReporter for IndicatifReporter {
    fn begin(&self, records: u64) {
        self.stored.store(0, Ordering::Relaxed);
        self.failed.store(0, Ordering::Relaxed);
        let style = ProgressStyle::with_template(BAR_TEMPLATE)
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> ");
        self.bar.set_style(style);
        self.bar.set_length(records);
        self.bar.reset();
        self.bar.set_message(self.tally());
    }

    fn record_done(&self, label: &str, failure: Option<&str>) {
        match failure {
            None => {
                self.stored.fetch_add(1, Ordering::Relaxed);
            }
            Some(reason) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                self.bar.println(format!("{label}: {reason}"));
            }
        }
        self.bar.set_message(self.tally());
        self.bar.inc(1);
    }

    fn end(&self) {
        self.bar.finish_and_clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tallies_stored_and_failed_records() {
        let reporter = IndicatifReporter::hidden();
        reporter.begin(3);
        reporter.record_done("a.json", None);
        reporter.record_done("b.json", Some("malformed record"));
        reporter.record_done("c.json", None);
        assert_eq!(reporter.stored(), 2);
        assert_eq!(reporter.failed(), 1);
        assert_eq!(reporter.tally(), "2 stored, 1 failed");
        reporter.end();
    }

    #[test]
    fn begin_resets_the_tallies() {
        let reporter = IndicatifReporter::hidden();
        reporter.begin(1);
        reporter.record_done("a.json", Some("database locked"));
        reporter.begin(5);
        assert_eq!((reporter.stored(), reporter.failed()), (0, 0));
    }
}
