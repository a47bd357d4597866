use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use docsift_core::{CheckpointStore, PipelineError, Provider, Result};
use docsift_llm::{LlmClient, ProviderKind};
use tracing::info;

use crate::analyze::AnalysisWorker;
use crate::config::{InputOrder, JobConfig, JobMode};
use crate::coordinator::{Worker, WorkerCoordinator};
use crate::document::{analysis_documents, InputResolver};
use crate::engine::Pipeline;
use crate::progress::ProgressSink;
use crate::reduce::CombineWorker;
use crate::report::JobReport;

/// Resolves the configured provider. Unknown ids and missing credentials are
/// configuration errors.
pub fn provider_for(config: &JobConfig) -> Result<Arc<dyn Provider>> {
    let kind: ProviderKind = config.provider.id.parse()?;
    Ok(Arc::new(LlmClient::from_env(kind)?))
}

/// Builds the worker for `config` with inputs resolved up front.
pub fn build_worker(config: &JobConfig, provider: Arc<dyn Provider>) -> Result<Arc<dyn Worker>> {
    let pipeline = Pipeline::from_config(config, provider)?;
    let state_dir = config.state_dir();
    let combined_output = config.output_dir.join(combined_output_name(config));
    // Analysis never reads its own output tree; a combine may read sibling
    // outputs but never its own result.
    let exclude = match config.mode {
        JobMode::Analyze => vec![config.output_dir.clone(), state_dir.clone()],
        JobMode::Combine => vec![combined_output.clone(), state_dir.clone()],
    };
    let resolver = InputResolver {
        base_dir: &config.base_dir,
        include: &config.include,
        state_dir: &state_dir,
        exclude: &exclude,
    };
    let worker: Arc<dyn Worker> = match config.mode {
        JobMode::Analyze => {
            let keyed = resolver.resolve(&config.inputs, InputOrder::Path)?;
            info!(job = %config.name, documents = keyed.len(), "inputs resolved");
            Arc::new(AnalysisWorker {
                name: config.name.clone(),
                pipeline,
                documents: analysis_documents(keyed, &config.output_dir),
                manifest_path: config.manifest_path(),
                force_rerun: config.force_rerun,
                mtime_tolerance: config.mtime_tolerance,
            })
        }
        JobMode::Combine => {
            let inputs = resolver.resolve(&config.inputs, config.combine.order)?;
            info!(job = %config.name, inputs = inputs.len(), "inputs resolved");
            Arc::new(CombineWorker {
                name: config.name.clone(),
                pipeline,
                inputs,
                output_path: combined_output,
                manifest_path: config.combine_manifest_path(),
                force_rerun: config.force_rerun,
                mtime_tolerance: config.mtime_tolerance,
            })
        }
    };
    Ok(worker)
}

pub fn combined_output_name(config: &JobConfig) -> String {
    config
        .combine
        .output_name
        .replace("{group}", &config.name)
        .replace("{date}", &Utc::now().format("%Y-%m-%d").to_string())
}

/// Runs jobs on one pool and waits for all of them. Setup errors are fatal
/// before anything is started.
pub fn run_jobs(
    jobs: Vec<(JobConfig, Arc<dyn Provider>)>,
    workers: usize,
    sink: Arc<dyn ProgressSink>,
) -> Result<Vec<JobReport>> {
    let mut names = HashSet::new();
    if let Some((config, _)) = jobs.iter().find(|(config, _)| !names.insert(config.name.as_str())) {
        return Err(PipelineError::Config(format!(
            "job name '{}' is used by more than one config",
            config.name
        )));
    }
    let built = jobs
        .iter()
        .map(|(config, provider)| Ok((config.name.clone(), build_worker(config, provider.clone())?)))
        .collect::<Result<Vec<_>>>()?;
    let coordinator = WorkerCoordinator::new(workers)?;
    let handles: Vec<_> = built
        .into_iter()
        .map(|(name, worker)| coordinator.start(name, worker, sink.clone()))
        .collect();
    Ok(handles
        .into_iter()
        .map(|handle| {
            let key = handle.key().to_string();
            handle
                .wait()
                .unwrap_or_else(|| JobReport::cancelled_before_start(key))
        })
        .collect())
}

pub fn run_job(
    config: &JobConfig,
    provider: Arc<dyn Provider>,
    sink: Arc<dyn ProgressSink>,
) -> Result<JobReport> {
    let mut reports = run_jobs(vec![(config.clone(), provider)], 1, sink)?;
    reports
        .pop()
        .ok_or_else(|| PipelineError::Config("job produced no report".into()))
}

/// What `clear_cache` should remove.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClearTarget {
    pub document: Option<String>,
    pub reduce: bool,
}

/// Removes checkpoints without touching manifests. Returns files removed.
pub fn clear_cache(config: &JobConfig, target: &ClearTarget) -> Result<usize> {
    if target.document.is_none() && !target.reduce {
        return Err(PipelineError::Config(
            "nothing to clear: name a document or the reduce stage".into(),
        ));
    }
    let store = CheckpointStore::new(config.checkpoint_dir());
    let mut removed = 0;
    if let Some(key) = &target.document {
        removed += store.clear_map_document(key)?;
        removed += store.clear_reduce_scope(key)?;
    }
    if target.reduce {
        removed += store.clear_reduce()?;
    }
    info!(job = %config.name, removed, "checkpoints cleared");
    Ok(removed)
}
