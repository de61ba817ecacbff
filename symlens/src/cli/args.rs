//! CLI argument definitions

use clap::Parser;
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "symlens",
    about = "Resolve raw profile addresses to function names, files and lines",
    after_help = "\
EXAMPLES:
    symlens profile.json                          Symbolicate in place
    symlens profile.json -o symbolicated.json     Write to a new file
    symlens profile.json --ignore-cache           Force fresh symbols"
)]
pub struct Args {
    /// Profile to symbolicate (JSON)
    #[arg(value_name = "PROFILE")]
    pub input: PathBuf,

    /// Output file (defaults to rewriting the input)
    #[arg(short, long, value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// Symbolication server endpoint
    #[arg(long, default_value = "https://symbolication.services.mozilla.com/symbolicate/v5")]
    pub server_url: String,

    /// Directory for cached symbol tables (defaults to a per-user cache dir)
    #[arg(long, value_name = "DIR")]
    pub cache_dir: Option<PathBuf>,

    /// Maximum number of cached symbol tables
    #[arg(long, default_value = "200")]
    pub cache_size: usize,

    /// Evict cache entries unused for this many days
    #[arg(long, default_value = "30", value_name = "DAYS")]
    pub cache_max_age_days: u64,

    /// Run without the on-disk cache entirely
    #[arg(long)]
    pub no_cache: bool,

    /// Keep the cache but skip reading it (results are still written back)
    #[arg(long, conflicts_with = "no_cache")]
    pub ignore_cache: bool,

    /// Suppress non-essential output
    #[arg(short, long)]
    pub quiet: bool,
}
