use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};

use docsift_core::{mtime_seconds, read_json_lenient, Manifest, PipelineError, Result};
use glob::Pattern;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::config::{combine_manifest_path_for, manifest_path_for, InputOrder, GROUP_PREFIX};
use crate::reduce::CombineManifest;

const OUTPUT_SUFFIX: &str = "analysis.md";

/// One input of a job. `relative_key` is its identity across runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    pub source_path: PathBuf,
    pub relative_key: String,
    pub output_path: PathBuf,
}

/// Expands job inputs into an ordered, de-duplicated file list.
pub struct InputResolver<'a> {
    pub base_dir: &'a Path,
    pub include: &'a [String],
    pub state_dir: &'a Path,
    /// Trees never walked into, such as the job's own output directory.
    pub exclude: &'a [PathBuf],
}

impl InputResolver<'_> {
    pub fn resolve(&self, inputs: &[String], order: InputOrder) -> Result<Vec<(String, PathBuf)>> {
        let patterns = self
            .include
            .iter()
            .map(|raw| {
                Pattern::new(raw)
                    .map_err(|e| PipelineError::Config(format!("include pattern '{raw}': {e}")))
            })
            .collect::<Result<Vec<_>>>()?;
        let excluded: Vec<PathBuf> = self.exclude.iter().map(|p| canonical(p)).collect();
        let mut seen = HashSet::new();
        let mut files = Vec::new();
        for input in inputs {
            for path in self.expand(input, &patterns, &excluded)? {
                if seen.insert(canonical(&path)) {
                    files.push(path);
                } else {
                    debug!(path = %path.display(), "duplicate input skipped");
                }
            }
        }
        let mut keyed: Vec<(String, PathBuf)> = files
            .into_iter()
            .map(|path| (relative_key(self.base_dir, &path), path))
            .collect();
        match order {
            InputOrder::Path => keyed.sort_by(|a, b| a.0.cmp(&b.0)),
            InputOrder::Mtime => {
                let mut stamped = keyed
                    .into_iter()
                    .map(|(key, path)| Ok((mtime_seconds(&path)?, key, path)))
                    .collect::<Result<Vec<_>>>()?;
                stamped.sort_by(|a, b| a.0.total_cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
                keyed = stamped.into_iter().map(|(_, key, path)| (key, path)).collect();
            }
        }
        Ok(keyed)
    }

    fn expand(&self, input: &str, patterns: &[Pattern], excluded: &[PathBuf]) -> Result<Vec<PathBuf>> {
        if let Some(group) = input.strip_prefix(GROUP_PREFIX) {
            return Ok(group_outputs(self.state_dir, group.trim()));
        }
        if input.contains(['*', '?', '[']) {
            let paths = glob::glob(input)
                .map_err(|e| PipelineError::Config(format!("input pattern '{input}': {e}")))?;
            return Ok(paths.flatten().filter(|p| p.is_file()).collect());
        }
        let path = PathBuf::from(input);
        if path.is_file() {
            return Ok(vec![path]);
        }
        if !path.is_dir() {
            return Err(PipelineError::io(
                &path,
                std::io::Error::new(std::io::ErrorKind::NotFound, "input does not exist"),
            ));
        }
        let files = WalkDir::new(&path)
            .follow_links(true)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| {
                let hidden = entry.depth() > 0
                    && entry.file_name().to_string_lossy().starts_with('.');
                !hidden && !excluded.iter().any(|ex| canonical(entry.path()) == *ex)
            })
            .filter_map(|entry| match entry {
                Ok(entry) => Some(entry),
                Err(err) => {
                    warn!(error = %err, "skipping unreadable entry");
                    None
                }
            })
            .filter(|entry| entry.file_type().is_file())
            .filter(|entry| {
                let name = entry.file_name().to_string_lossy();
                patterns.is_empty() || patterns.iter().any(|p| p.matches(&name))
            })
            .map(|entry| entry.into_path())
            .collect();
        Ok(files)
    }
}

/// Outputs recorded for a prior group: per-document outputs from its manifest,
/// or the single output of a combine group.
pub fn group_outputs(state_dir: &Path, group: &str) -> Vec<PathBuf> {
    let mut outputs: Vec<PathBuf> =
        read_json_lenient::<Manifest>(&manifest_path_for(state_dir, group))
            .map(|manifest| {
                manifest
                    .documents
                    .into_values()
                    .filter_map(|entry| entry.output)
                    .collect()
            })
            .unwrap_or_default();
    if let Some(combined) =
        read_json_lenient::<CombineManifest>(&combine_manifest_path_for(state_dir, group))
    {
        outputs.push(combined.output);
    }
    outputs.retain(|path| path.is_file());
    if outputs.is_empty() {
        warn!(group, "group reference resolved to no outputs");
    }
    outputs
}

/// Builds documents for the per-document analysis mode.
pub fn analysis_documents(keyed: Vec<(String, PathBuf)>, output_dir: &Path) -> Vec<Document> {
    keyed
        .into_iter()
        .map(|(relative_key, source_path)| Document {
            output_path: analysis_output_path(output_dir, &relative_key),
            source_path,
            relative_key,
        })
        .collect()
}

/// `notes/q3.md` becomes `<output_dir>/notes/q3.md.analysis.md`. The full
/// file name is kept so `q3.md` and `q3.txt` never share an output.
pub fn analysis_output_path(output_dir: &Path, relative_key: &str) -> PathBuf {
    let rel = Path::new(relative_key);
    let name = rel
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "document".to_string());
    let parent = rel.parent().unwrap_or_else(|| Path::new(""));
    output_dir.join(parent).join(format!("{name}.{OUTPUT_SUFFIX}"))
}

/// Key relative to the config directory, with `/` separators. Paths outside
/// it keep their full path minus the root so the key stays joinable.
pub fn relative_key(base: &Path, path: &Path) -> String {
    let base = canonical(base);
    let full = canonical(path);
    let rel = full.strip_prefix(&base).unwrap_or(&full);
    rel.components()
        .filter_map(|component| match component {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

fn canonical(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
}
