mod cli;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use docsift::{clear_cache, logging, provider_for, run_jobs, ClearTarget, JobConfig, LogSink};

use crate::cli::{Cli, Command};

fn main() -> Result<()> {
    let cli = Cli::parse();
    let verbose = if cli.verbose {
        true
    } else {
        logging::env_flag()
    };
    logging::init(verbose);
    match cli.command {
        Command::Run {
            configs,
            force,
            jobs,
        } => run(configs, force, jobs),
        Command::ClearCache {
            config,
            document,
            reduce,
        } => {
            let config = JobConfig::load(&config)?;
            let removed = clear_cache(&config, &ClearTarget { document, reduce })
                .with_context(|| format!("failed to clear cache for {}", config.name))?;
            println!("removed {removed} checkpoint file(s)");
            Ok(())
        }
    }
}

fn run(paths: Vec<PathBuf>, force: bool, workers: Option<usize>) -> Result<()> {
    let mut jobs = Vec::with_capacity(paths.len());
    for path in &paths {
        let mut config = JobConfig::load(path)?;
        config.force_rerun |= force;
        let provider = provider_for(&config)
            .with_context(|| format!("cannot set up provider for job {}", config.name))?;
        jobs.push((config, provider));
    }
    let workers = workers.unwrap_or_else(|| {
        jobs.iter()
            .map(|(config, _)| config.concurrency())
            .max()
            .unwrap_or(1)
    });
    let reports = run_jobs(jobs, workers, Arc::new(LogSink)).context("job setup failed")?;
    let mut failed = 0;
    let mut cancelled = false;
    for report in &reports {
        println!("{report}");
        for (key, message) in &report.failures {
            println!("  failed {key}: {message}");
        }
        failed += report.failed;
        cancelled |= report.cancelled;
    }
    if cancelled {
        return Err(anyhow!("run was cancelled"));
    }
    if failed > 0 {
        return Err(anyhow!("{failed} item(s) failed"));
    }
    Ok(())
}
