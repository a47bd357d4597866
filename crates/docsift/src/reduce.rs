use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use docsift_core::{
    mtime_seconds, read_json_lenient, write_json_atomic, PipelineError, Result,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::JobMode;
use crate::coordinator::{JobContext, Worker};
use crate::engine::{Analysis, Pipeline};
use crate::output::{strip_front_matter, write_output, Provenance};
use crate::report::JobReport;

pub const COMBINE_MANIFEST_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CombineInput {
    pub path: PathBuf,
    pub mtime: f64,
}

/// Snapshot of the inputs behind a combined output. Lets a rerun decide
/// "nothing changed" from paths and mtimes alone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CombineManifest {
    pub version: u32,
    pub prompt_hash: String,
    pub output: PathBuf,
    pub inputs: Vec<CombineInput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ran_at: Option<DateTime<Utc>>,
}

impl CombineManifest {
    pub fn is_current(
        &self,
        inputs: &[CombineInput],
        prompt_hash: &str,
        output: &Path,
        tolerance: f64,
    ) -> bool {
        self.version == COMBINE_MANIFEST_VERSION
            && self.prompt_hash == prompt_hash
            && self.output == output
            && output.is_file()
            && self.inputs.len() == inputs.len()
            && self
                .inputs
                .iter()
                .zip(inputs)
                .all(|(old, new)| old.path == new.path && (old.mtime - new.mtime).abs() <= tolerance)
    }
}

/// Reduces every selected input into a single output.
pub struct CombineWorker {
    pub name: String,
    pub pipeline: Pipeline,
    /// `(relative_key, path)` in the configured order.
    pub inputs: Vec<(String, PathBuf)>,
    pub output_path: PathBuf,
    pub manifest_path: PathBuf,
    pub force_rerun: bool,
    pub mtime_tolerance: f64,
}

impl CombineWorker {
    /// `Ok(None)` when the previous output is still current.
    fn combine(&self, ctx: &JobContext) -> Result<Option<Analysis>> {
        if self.inputs.is_empty() {
            return Err(PipelineError::Config(format!(
                "combine job '{}' resolved no inputs",
                self.name
            )));
        }
        let snapshot = self
            .inputs
            .iter()
            .map(|(_, path)| {
                Ok(CombineInput {
                    path: path.clone(),
                    mtime: mtime_seconds(path)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        if !self.force_rerun {
            let previous = read_json_lenient::<CombineManifest>(&self.manifest_path);
            if previous.is_some_and(|prev| {
                prev.is_current(
                    &snapshot,
                    &self.pipeline.prompt_hash,
                    &self.output_path,
                    self.mtime_tolerance,
                )
            }) {
                return Ok(None);
            }
        }

        let mut text = String::new();
        for (key, path) in &self.inputs {
            ctx.cancel.check()?;
            let raw = fs::read_to_string(path).map_err(|e| PipelineError::io(path, e))?;
            text.push_str(&format!(
                "<<<SOURCE: {key}>>>\n{}\n<<<END SOURCE: {key}>>>\n\n",
                strip_front_matter(&raw).trim()
            ));
        }
        let scope = format!("combine:{}", self.name);
        let label = format!("group {} ({} sources)", self.name, self.inputs.len());
        let analysis = self
            .pipeline
            .engine(&ctx.cancel)
            .analyze(&scope, &label, &text)?;

        let now = Utc::now();
        let mut provenance = self.pipeline.provenance(&analysis, Provenance::stamp(now));
        provenance.sources = self.inputs.iter().map(|(key, _)| key.clone()).collect();
        write_output(&self.output_path, &provenance, &analysis.content)?;
        write_json_atomic(
            &self.manifest_path,
            &CombineManifest {
                version: COMBINE_MANIFEST_VERSION,
                prompt_hash: self.pipeline.prompt_hash.clone(),
                output: self.output_path.clone(),
                inputs: snapshot,
                ran_at: Some(now),
            },
        )?;
        Ok(Some(analysis))
    }
}

impl Worker for CombineWorker {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, ctx: &JobContext) -> JobReport {
        let mut report = JobReport::new(&self.name, JobMode::Combine, 1);
        info!(job = %self.name, inputs = self.inputs.len(), "combine started");
        if ctx.cancel.is_cancelled() {
            report.cancelled = true;
            return report;
        }
        match self.combine(ctx) {
            Ok(None) => {
                report.skipped = 1;
                ctx.sink.on_skipped(&self.name);
            }
            Ok(Some(analysis)) => {
                report.succeeded = 1;
                report.chunks = analysis.chunks;
                report.provider_calls = analysis.provider_calls;
                report.cache_hits = analysis.cache_hits;
                report.prompt_tokens = analysis.prompt_tokens;
                report.completion_tokens = analysis.completion_tokens;
                report.outputs.push(self.output_path.clone());
            }
            Err(err) if err.is_cancelled() => report.cancelled = true,
            Err(err) => {
                let message = err.to_string();
                warn!(job = %self.name, error = %message, "combine failed");
                ctx.sink.on_failed(&self.name, &message);
                report.record_failure(self.name.clone(), message);
            }
        }
        ctx.sink.on_progress(1, 1, &self.name);
        info!(job = %self.name, "{report}");
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest(inputs: Vec<CombineInput>, output: &Path) -> CombineManifest {
        CombineManifest {
            version: COMBINE_MANIFEST_VERSION,
            prompt_hash: "h".into(),
            output: output.to_path_buf(),
            inputs,
            ran_at: None,
        }
    }

    #[test]
    fn current_only_when_everything_matches() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("out.md");
        fs::write(&output, "x").unwrap();
        let inputs = vec![
            CombineInput {
                path: "a.md".into(),
                mtime: 10.0,
            },
            CombineInput {
                path: "b.md".into(),
                mtime: 20.0,
            },
        ];
        let saved = manifest(inputs.clone(), &output);
        assert!(saved.is_current(&inputs, "h", &output, 1e-6));
        assert!(!saved.is_current(&inputs, "other", &output, 1e-6));
        assert!(!saved.is_current(&inputs[..1], "h", &output, 1e-6));

        let mut touched = inputs.clone();
        touched[1].mtime = 21.0;
        assert!(!saved.is_current(&touched, "h", &output, 1e-6));

        let mut reordered = inputs.clone();
        reordered.swap(0, 1);
        assert!(!saved.is_current(&reordered, "h", &output, 1e-6));

        fs::remove_file(&output).unwrap();
        assert!(!saved.is_current(&inputs, "h", &output, 1e-6));
    }
}
