use std::fmt;
use std::path::PathBuf;

use serde::Serialize;

use crate::config::JobMode;

/// Outcome of one job. A job always ends with one of these, never with a
/// silent partial result.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct JobReport {
    pub job: String,
    pub mode: Option<JobMode>,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub failures: Vec<(String, String)>,
    pub cancelled: bool,
    pub chunks: usize,
    pub provider_calls: usize,
    pub cache_hits: usize,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub outputs: Vec<PathBuf>,
}

impl JobReport {
    pub fn new(job: impl Into<String>, mode: JobMode, total: usize) -> Self {
        Self {
            job: job.into(),
            mode: Some(mode),
            total,
            ..Self::default()
        }
    }

    pub fn cancelled_before_start(job: impl Into<String>) -> Self {
        Self {
            job: job.into(),
            cancelled: true,
            ..Self::default()
        }
    }

    pub fn record_failure(&mut self, key: impl Into<String>, message: impl Into<String>) {
        self.failed += 1;
        self.failures.push((key.into(), message.into()));
    }

    pub fn is_clean(&self) -> bool {
        self.failed == 0 && !self.cancelled
    }
}

impl fmt::Display for JobReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} succeeded, {} failed, {} skipped of {}",
            self.job, self.succeeded, self.failed, self.skipped, self.total
        )?;
        if self.cancelled {
            write!(f, " (cancelled)")?;
        }
        write!(
            f,
            "; {} provider calls, {} cache hits, {} prompt / {} completion tokens",
            self.provider_calls, self.cache_hits, self.prompt_tokens, self.completion_tokens
        )
    }
}
