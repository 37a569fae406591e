//! CLI argument definitions using clap derive macros.
//!
//! Flags left unset fall back to the config file, then to built-in defaults;
//! see [`crate::app::config`].

use std::path::PathBuf;

use clap::Parser;
use url::Url;

/// Turn digitized newspaper issues into classified article records.
///
/// StoryDredge fetches each issue's OCR text from the archive, cleans it,
/// splits it into articles, classifies them with a local model and writes
/// one record per article. Progress is checkpointed so an interrupted batch
/// resumes where it stopped.
#[derive(Parser, Debug)]
#[command(name = "storydredge")]
#[command(author, version, about)]
pub struct Args {
    /// Archive identifiers of the issues to process
    #[arg(value_name = "ISSUE_ID")]
    pub issues: Vec<String>,

    /// File listing issues: a JSON array/object or one identifier per line
    #[arg(short = 'i', long, value_name = "FILE")]
    pub issues_file: Option<PathBuf>,

    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long)]
    pub quiet: bool,

    /// Parallel workers (1-64); 1 processes issues sequentially
    #[arg(short = 'w', long, value_parser = clap::value_parser!(u8).range(1..=64))]
    pub workers: Option<u8>,

    /// Process issues one at a time even when workers are configured
    #[arg(long)]
    pub sequential: bool,

    /// Directory for records, per-issue artifacts and the batch report
    #[arg(short = 'o', long, value_name = "DIR")]
    pub output_dir: Option<PathBuf>,

    /// Checkpoint file used to resume interrupted batches
    #[arg(long, value_name = "FILE")]
    pub checkpoint_file: Option<PathBuf>,

    /// Neither read nor write the checkpoint
    #[arg(long)]
    pub disable_checkpointing: bool,

    /// Completed issues between checkpoint saves in parallel mode (1-1000)
    #[arg(long, value_parser = clap::value_parser!(u16).range(1..=1000))]
    pub checkpoint_interval: Option<u16>,

    /// Maximum retries for transient failures (0-10)
    #[arg(short = 'r', long, value_parser = clap::value_parser!(u8).range(0..=10))]
    pub max_retries: Option<u8>,

    /// Directory for the classification cache and fetched OCR text
    #[arg(long, value_name = "DIR")]
    pub cache_dir: Option<PathBuf>,

    /// Disable the classification cache
    #[arg(long)]
    pub no_cache: bool,

    /// Remove expired cache entries before processing
    #[arg(long)]
    pub clean_cache: bool,

    /// Base URL of the newspaper archive
    #[arg(long, value_name = "URL")]
    pub archive_url: Option<Url>,

    /// Base URL of the Ollama server
    #[arg(long, value_name = "URL")]
    pub model_url: Option<Url>,

    /// Model used for classification
    #[arg(long)]
    pub model: Option<String>,

    /// Archive requests per minute (0 to disable, max 600)
    #[arg(short = 'l', long, value_parser = clap::value_parser!(u32).range(0..=600))]
    pub rate_limit: Option<u32>,

    /// Give up on a single issue after this many seconds
    #[arg(long, value_name = "SECS", value_parser = clap::value_parser!(u64).range(1..=86_400))]
    pub issue_timeout: Option<u64>,

    /// Stop starting new issues after this many seconds
    #[arg(long, value_name = "SECS", value_parser = clap::value_parser!(u64).range(1..))]
    pub deadline: Option<u64>,

    /// Config file (default: $XDG_CONFIG_HOME/storydredge/config.toml)
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,
}
