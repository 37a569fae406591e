//! CLI entry point for storydredge.

use std::process::ExitCode;

use clap::Parser;
use tracing::{debug, error};

mod app;
mod cli;

use app::terminal;
use cli::Args;

/// How the process ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ProcessExit {
    /// Every issue succeeded or was skipped.
    Success,
    /// Some issues failed, some succeeded.
    Partial,
    /// Every processed issue failed, or the batch could not run.
    Failure,
    /// Stopped by Ctrl-C or the deadline before all issues started.
    Interrupted,
}

impl ProcessExit {
    fn code(self) -> u8 {
        match self {
            Self::Success => 0,
            Self::Partial => 1,
            Self::Failure => 2,
            Self::Interrupted => 130,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();

    terminal::init_tracing(terminal::default_log_level(args.quiet, args.verbose));
    debug!(?args, "CLI arguments parsed");

    match app::runtime::run(args).await {
        Ok(outcome) => ExitCode::from(outcome.code()),
        Err(e) => {
            error!(error = %e, "batch aborted");
            eprintln!("Error: {e:#}");
            ExitCode::from(ProcessExit::Failure.code())
        }
    }
}
