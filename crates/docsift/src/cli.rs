use std::path::PathBuf;

use clap::{ArgAction, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "docsift", about = "Incremental map/reduce document analysis")]
pub struct Cli {
    #[arg(long, global = true, action = ArgAction::SetTrue)]
    pub verbose: bool,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run one or more jobs; jobs share a worker pool.
    Run {
        #[arg(long = "config", required = true)]
        configs: Vec<PathBuf>,
        /// Reprocess every document regardless of the manifest.
        #[arg(long, default_value_t = false)]
        force: bool,
        /// Pool size; defaults to the largest `concurrency` among the jobs.
        #[arg(long)]
        jobs: Option<usize>,
    },
    /// Remove checkpoints so the next run calls the provider again.
    ClearCache {
        #[arg(long)]
        config: PathBuf,
        #[arg(long)]
        document: Option<String>,
        #[arg(long, default_value_t = false)]
        reduce: bool,
    },
}
