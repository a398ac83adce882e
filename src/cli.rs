use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "deepharvest", about = "Resilient distributed web crawler")]
pub struct Cli {
    /// Path to config file (falls back to $DEEPHARVEST_CONFIG, then defaults)
    #[arg(short, long)]
    pub config: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Crawl starting from one or more seed URLs
    Crawl {
        /// Seed URLs (positional; config seed_urls used when empty)
        urls: Vec<String>,

        /// Maximum crawl depth
        #[arg(short, long)]
        depth: Option<u32>,

        /// Enable the headless-browser fallback for JS-heavy pages
        #[arg(long)]
        js: bool,

        /// Output directory for records, failures, and checkpoints
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Use the shared-store frontier instead of the in-process one
        #[arg(long)]
        distributed: bool,

        /// Shared store URL (distributed mode)
        #[arg(long)]
        redis_url: Option<String>,

        /// Number of concurrent workers
        #[arg(short, long)]
        workers: Option<usize>,
    },
    /// Resume a crawl from a checkpoint file
    Resume {
        /// Checkpoint written by a previous run
        #[arg(long)]
        state_file: PathBuf,

        /// Output directory (defaults next to the state file)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Collect a single page: fetch, extract, export
    Osint {
        /// Target URL
        url: String,

        /// Print the report to stdout as JSON
        #[arg(long)]
        json: bool,

        /// Also export the outbound link graph
        #[arg(long)]
        graph: bool,

        /// Capture a rendered screenshot (requires a local Chrome)
        #[arg(long)]
        screenshot: bool,

        /// Output directory
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}
