use std::fs;

use chrono::Utc;
use docsift_core::{mtime_seconds, ManifestEntry, ManifestStore, PipelineError, Result};
use tracing::{info, warn};

use crate::config::JobMode;
use crate::coordinator::{JobContext, Worker};
use crate::document::Document;
use crate::engine::{Analysis, Pipeline};
use crate::output::{write_output, Provenance};
use crate::report::JobReport;

enum DocumentOutcome {
    Skipped,
    Written(Analysis),
}

/// One output per input document. Documents run in order; a failing document
/// is reported and the next one still runs.
pub struct AnalysisWorker {
    pub name: String,
    pub pipeline: Pipeline,
    pub documents: Vec<Document>,
    pub manifest_path: std::path::PathBuf,
    pub force_rerun: bool,
    pub mtime_tolerance: f64,
}

impl AnalysisWorker {
    fn process(
        &self,
        doc: &Document,
        manifest: &mut ManifestStore,
        ctx: &JobContext,
    ) -> Result<DocumentOutcome> {
        let mtime = mtime_seconds(&doc.source_path)?;
        let output_exists = doc.output_path.is_file();
        if !self.force_rerun
            && !manifest.should_process(
                &doc.relative_key,
                mtime,
                &self.pipeline.prompt_hash,
                output_exists,
            )
        {
            return Ok(DocumentOutcome::Skipped);
        }
        ctx.cancel.check()?;
        let text = fs::read_to_string(&doc.source_path)
            .map_err(|e| PipelineError::io(&doc.source_path, e))?;
        let analysis = self.pipeline.engine(&ctx.cancel).analyze(
            &doc.relative_key,
            &doc.relative_key,
            &text,
        )?;
        let mut provenance = self
            .pipeline
            .provenance(&analysis, Provenance::stamp(Utc::now()));
        provenance.source = Some(doc.source_path.display().to_string());
        write_output(&doc.output_path, &provenance, &analysis.content)?;
        manifest.record(
            doc.relative_key.clone(),
            ManifestEntry::new(mtime, self.pipeline.prompt_hash.clone())
                .with_output(doc.output_path.clone()),
        );
        Ok(DocumentOutcome::Written(analysis))
    }
}

impl Worker for AnalysisWorker {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, ctx: &JobContext) -> JobReport {
        let total = self.documents.len();
        let mut report = JobReport::new(&self.name, JobMode::Analyze, total);
        let mut manifest = ManifestStore::load(&self.manifest_path, self.mtime_tolerance);
        info!(job = %self.name, documents = total, force = self.force_rerun, "analysis started");
        for (position, doc) in self.documents.iter().enumerate() {
            if ctx.cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            match self.process(doc, &mut manifest, ctx) {
                Ok(DocumentOutcome::Skipped) => {
                    report.skipped += 1;
                    ctx.sink.on_skipped(&doc.relative_key);
                }
                Ok(DocumentOutcome::Written(analysis)) => {
                    report.succeeded += 1;
                    report.chunks += analysis.chunks;
                    report.provider_calls += analysis.provider_calls;
                    report.cache_hits += analysis.cache_hits;
                    report.prompt_tokens += analysis.prompt_tokens;
                    report.completion_tokens += analysis.completion_tokens;
                    report.outputs.push(doc.output_path.clone());
                }
                Err(err) if err.is_cancelled() => {
                    info!(job = %self.name, key = %doc.relative_key, "cancelled");
                    report.cancelled = true;
                    break;
                }
                Err(err) => {
                    let message = err.to_string();
                    warn!(job = %self.name, key = %doc.relative_key, error = %message, "document failed");
                    ctx.sink.on_failed(&doc.relative_key, &message);
                    report.record_failure(doc.relative_key.clone(), message);
                }
            }
            ctx.sink.on_progress(position + 1, total, &doc.relative_key);
        }
        // Entries exist only for documents that were fully written, so the
        // manifest is saved even after a failure or cancellation.
        if let Err(err) = manifest.save() {
            warn!(job = %self.name, error = %err, "manifest save failed");
            report.record_failure(manifest.path().display().to_string(), err.to_string());
        }
        info!(job = %self.name, "{report}");
        report
    }
}
