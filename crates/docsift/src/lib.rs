pub mod analyze;
pub mod config;
pub mod coordinator;
pub mod document;
pub mod engine;
pub mod job;
pub mod logging;
pub mod output;
pub mod progress;
pub mod prompt;
pub mod reduce;
pub mod report;

pub use analyze::AnalysisWorker;
pub use config::{JobConfig, JobMode};
pub use coordinator::{JobContext, JobHandle, Worker, WorkerCoordinator};
pub use document::Document;
pub use job::{build_worker, clear_cache, provider_for, run_job, run_jobs, ClearTarget};
pub use progress::{ChannelSink, LogSink, NullSink, ProgressEvent, ProgressSink};
pub use reduce::CombineWorker;
pub use report::JobReport;
