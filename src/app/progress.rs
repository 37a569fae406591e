//! Progress bar for batch runs.

use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use storydredge_core::{BatchReport, IssueOutcome, ProgressObserver};

/// Drives an `indicatif` bar from engine progress events.
#[derive(Debug)]
pub(crate) struct BarObserver {
    bar: ProgressBar,
}

impl BarObserver {
    pub(crate) fn new() -> Self {
        let bar = ProgressBar::new(0);
        bar.set_style(
            ProgressStyle::with_template("{spinner} [{elapsed_precise}] {bar:30} {pos}/{len} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );
        bar.enable_steady_tick(Duration::from_millis(120));
        Self { bar }
    }
}

impl ProgressObserver for BarObserver {
    fn batch_started(&self, pending: usize, skipped: usize) {
        self.bar.set_length(u64::try_from(pending).unwrap_or(u64::MAX));
        if skipped > 0 {
            self.bar
                .println(format!("Skipping {skipped} already processed issue(s)"));
        }
    }

    fn issue_finished(&self, outcome: &IssueOutcome) {
        let mark = if outcome.is_success() { "done" } else { "failed" };
        self.bar.set_message(format!("{} {mark}", outcome.issue_id));
        self.bar.inc(1);
    }

    fn batch_finished(&self, _report: &BatchReport) {
        self.bar.finish_and_clear();
    }
}
