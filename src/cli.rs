//! Command-line surface.

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "deepharvest")]
#[command(about = "Resilient distributed web crawler")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Crawl one or more seed URLs
    Crawl {
        /// Seed URLs to start from
        #[arg(required = true)]
        urls: Vec<String>,

        /// Maximum crawl depth
        #[arg(short, long)]
        depth: Option<u32>,

        /// Enable the browser fallback for JS-rendered pages
        #[arg(long)]
        js: bool,

        /// Output directory for results and logs
        #[arg(short, long)]
        output: Option<String>,

        /// Configuration file (YAML); DEEPHARVEST_CONFIG is the fallback
        #[arg(short, long)]
        config: Option<String>,

        /// Run against a shared store instead of in-process state
        #[arg(long)]
        distributed: bool,

        /// Shared store URL for distributed mode
        #[arg(long)]
        redis_url: Option<String>,

        /// Concurrent workers
        #[arg(short, long)]
        workers: Option<usize>,
    },

    /// Resume a crawl from a checkpoint file
    Resume {
        /// Checkpoint file written by a previous run
        #[arg(long)]
        state_file: String,

        /// Configuration file (YAML); must be compatible with the checkpoint
        #[arg(short, long)]
        config: Option<String>,

        /// Output directory for results and logs
        #[arg(short, long)]
        output: Option<String>,
    },

    /// Collect OSINT for a single URL via the registered collaborator
    Osint {
        /// Target URL
        url: String,

        /// Emit the report as JSON
        #[arg(long)]
        json: bool,

        /// Include the link graph in the report
        #[arg(long)]
        graph: bool,

        /// Capture a screenshot
        #[arg(long)]
        screenshot: bool,

        /// Output directory
        #[arg(short, long)]
        output: Option<String>,
    },
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
