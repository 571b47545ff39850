//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::Parser;
use rangeload::units::parse_bytes;

/// Download one or more files over HTTP with pause/resume and a speed limit.
///
/// All URLs form one task: they are fetched in order into the output
/// directory. Ctrl-C stops the transfer cleanly; partial files are kept.
#[derive(Parser, Debug)]
#[command(name = "rangeload")]
#[command(author, version, about)]
pub struct Args {
    /// URLs to download, in order
    #[arg(required = true, value_name = "URL")]
    pub urls: Vec<String>,

    /// Directory to write files into [default: current directory]
    #[arg(short = 'o', long, value_name = "DIR")]
    pub output_dir: Option<PathBuf>,

    /// Speed limit in bytes per second, e.g. 65536, 512K or 2MB (0 for unlimited)
    #[arg(short = 'l', long, value_name = "RATE", value_parser = parse_bytes)]
    pub rate_limit: Option<u64>,

    /// Display name for the task [default: first file's name]
    #[arg(short = 'n', long)]
    pub name: Option<String>,

    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long)]
    pub quiet: bool,

    /// Print the final task state as JSON on stdout
    #[arg(long)]
    pub json: bool,
}
