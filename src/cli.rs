//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::Parser;

/// Download media files and file them into a movie/TV library.
///
/// Sources are URLs or local paths. Each one is downloaded under the
/// configured concurrency and speed limits, classified through TMDB and moved
/// into the library. Files that cannot be classified confidently are listed
/// for manual resolution at the end of the run.
#[derive(Parser, Debug)]
#[command(name = "media-intake")]
#[command(author, version, about)]
pub struct Args {
    /// Sources to download (URLs or local paths). Read from stdin when omitted.
    pub sources: Vec<String>,

    /// Config file (default: $XDG_CONFIG_HOME/media-intake/config.json)
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Library base directory; files go under movies/, tv/ and unmatched/
    #[arg(short = 'o', long, value_name = "DIR")]
    pub library: Option<PathBuf>,

    /// Directory for partial files
    #[arg(long, value_name = "DIR")]
    pub temp_dir: Option<PathBuf>,

    /// Maximum concurrent downloads (1-100)
    #[arg(short = 'c', long, value_parser = clap::value_parser!(u8).range(1..=100))]
    pub concurrency: Option<u8>,

    /// Maximum retry attempts for transient failures (0-10)
    #[arg(short = 'r', long, value_parser = clap::value_parser!(u8).range(0..=10))]
    pub max_retries: Option<u8>,

    /// Aggregate speed limit in Mbps (0 for unlimited)
    #[arg(long, value_name = "MBPS")]
    pub max_speed: Option<f64>,

    /// Skip size verification of completed downloads
    #[arg(long)]
    pub no_verify: bool,

    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long)]
    pub quiet: bool,
}
