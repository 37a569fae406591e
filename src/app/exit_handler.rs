//! Exit code logic for the batch process.
//!
//! Single responsibility: map a batch report to the process exit outcome.

use storydredge_core::BatchReport;

use crate::ProcessExit;

/// Determines the process exit outcome from a finished batch.
///
/// An interrupted batch wins over counts; skipped issues count as success.
pub(crate) fn determine_exit_outcome(report: &BatchReport) -> ProcessExit {
    if report.interrupted {
        ProcessExit::Interrupted
    } else if report.failed == 0 {
        ProcessExit::Success
    } else if report.successful > 0 {
        ProcessExit::Partial
    } else {
        ProcessExit::Failure
    }
}
