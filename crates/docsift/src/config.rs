use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use docsift_core::{PipelineError, TokenizerKind, DEFAULT_MTIME_TOLERANCE};
use serde::{Deserialize, Serialize};

pub const GROUP_PREFIX: &str = "group:";
const MAX_CONCURRENCY: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobMode {
    #[default]
    Analyze,
    Combine,
}

impl JobMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobMode::Analyze => "analyze",
            JobMode::Combine => "combine",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputOrder {
    #[default]
    Path,
    Mtime,
}

/// A prompt template given inline or as `{ file: path }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TemplateRef {
    Inline(String),
    File { file: PathBuf },
}

impl TemplateRef {
    pub fn reference(&self) -> String {
        match self {
            TemplateRef::Inline(_) => "inline".to_string(),
            TemplateRef::File { file } => file.display().to_string(),
        }
    }

    fn rebase(&mut self, base: &Path) {
        if let TemplateRef::File { file } = self {
            *file = rebase_path(base, file);
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PromptConfig {
    #[serde(default)]
    pub system: Option<TemplateRef>,
    #[serde(default)]
    pub user: Option<TemplateRef>,
    #[serde(default)]
    pub combine: Option<TemplateRef>,
    /// Extra placeholders; every entry is part of the prompt hash.
    #[serde(default)]
    pub extra: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default = "default_provider")]
    pub id: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            id: default_provider(),
            model: None,
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkingConfig {
    /// Overrides the provider/model context window table.
    #[serde(default)]
    pub context_window: Option<usize>,
    /// Fixes the per-chunk token budget instead of deriving it.
    #[serde(default)]
    pub max_chunk_tokens: Option<usize>,
    #[serde(default = "default_overlap")]
    pub overlap_tokens: usize,
    #[serde(default = "default_chars_per_token")]
    pub chars_per_token: usize,
    /// Defaults to `provider.max_tokens`.
    #[serde(default)]
    pub response_reserve_tokens: Option<usize>,
    #[serde(default)]
    pub tokenizer: TokenizerKind,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            context_window: None,
            max_chunk_tokens: None,
            overlap_tokens: default_overlap(),
            chars_per_token: default_chars_per_token(),
            response_reserve_tokens: None,
            tokenizer: TokenizerKind::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CombineConfig {
    #[serde(default)]
    pub order: InputOrder,
    #[serde(default = "default_output_name")]
    pub output_name: String,
    #[serde(default)]
    pub batch_size: Option<usize>,
}

impl Default for CombineConfig {
    fn default() -> Self {
        Self {
            order: InputOrder::default(),
            output_name: default_output_name(),
            batch_size: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    pub name: String,
    #[serde(default)]
    pub mode: JobMode,
    pub inputs: Vec<String>,
    #[serde(default = "default_include")]
    pub include: Vec<String>,
    pub output_dir: PathBuf,
    #[serde(default)]
    pub state_dir: Option<PathBuf>,
    #[serde(default)]
    pub prompt: PromptConfig,
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub combine: CombineConfig,
    #[serde(default)]
    pub force_rerun: bool,
    #[serde(default = "default_mtime_tolerance")]
    pub mtime_tolerance: f64,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Directory relative paths were resolved against.
    #[serde(skip)]
    pub base_dir: PathBuf,
}

impl JobConfig {
    /// Loads YAML or TOML by extension and resolves relative paths against
    /// the config file's directory.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let mut cfg = match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => Self::from_toml(&raw),
            _ => Self::from_yaml(&raw),
        }
        .with_context(|| format!("invalid job config {}", path.display()))?;
        let base = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let base = base.canonicalize().unwrap_or(base);
        cfg.rebase(&base);
        Ok(cfg)
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        let cfg: Self = serde_yaml::from_str(raw).context("failed to parse yaml")?;
        Ok(cfg)
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        let cfg: Self = toml::from_str(raw).context("failed to parse toml")?;
        Ok(cfg)
    }

    pub fn rebase(&mut self, base: &Path) {
        self.base_dir = base.to_path_buf();
        self.output_dir = rebase_path(base, &self.output_dir);
        if let Some(state) = &self.state_dir {
            self.state_dir = Some(rebase_path(base, state));
        }
        for input in &mut self.inputs {
            if !input.starts_with(GROUP_PREFIX) {
                *input = rebase_path(base, Path::new(input.as_str()))
                    .to_string_lossy()
                    .into_owned();
            }
        }
        for template in [
            &mut self.prompt.system,
            &mut self.prompt.user,
            &mut self.prompt.combine,
        ]
        .into_iter()
        .flatten()
        {
            template.rebase(base);
        }
    }

    pub fn state_dir(&self) -> PathBuf {
        self.state_dir
            .clone()
            .unwrap_or_else(|| self.output_dir.join(".docsift"))
    }

    pub fn manifest_path(&self) -> PathBuf {
        manifest_path_for(&self.state_dir(), &self.name)
    }

    pub fn combine_manifest_path(&self) -> PathBuf {
        combine_manifest_path_for(&self.state_dir(), &self.name)
    }

    /// Per-job checkpoint root. Jobs sharing a state dir never share cache
    /// entries, so alternating jobs do not evict each other.
    pub fn checkpoint_dir(&self) -> PathBuf {
        self.state_dir().join("checkpoints").join(&self.name)
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency.clamp(1, MAX_CONCURRENCY)
    }

    pub fn validate(&self) -> std::result::Result<(), PipelineError> {
        if self.name.trim().is_empty() {
            return Err(PipelineError::Config("job name must not be empty".into()));
        }
        if self.name.contains(['/', '\\']) || self.name == "." || self.name == ".." {
            return Err(PipelineError::Config(format!(
                "job name '{}' must be a plain file name",
                self.name
            )));
        }
        if self.inputs.is_empty() {
            return Err(PipelineError::Config(format!(
                "job '{}' declares no inputs",
                self.name
            )));
        }
        if self.chunking.chars_per_token == 0 {
            return Err(PipelineError::Config("chars_per_token must be positive".into()));
        }
        if self.mtime_tolerance.is_nan() || self.mtime_tolerance < 0.0 {
            return Err(PipelineError::Config("mtime_tolerance must be >= 0".into()));
        }
        Ok(())
    }
}

pub fn manifest_path_for(state_dir: &Path, group: &str) -> PathBuf {
    state_dir.join("manifests").join(format!("{group}.json"))
}

pub fn combine_manifest_path_for(state_dir: &Path, group: &str) -> PathBuf {
    state_dir.join("combine").join(format!("{group}.json"))
}

fn rebase_path(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

fn default_provider() -> String {
    "local".to_string()
}

fn default_temperature() -> f32 {
    0.2
}

fn default_max_tokens() -> u32 {
    2_048
}

fn default_overlap() -> usize {
    200
}

fn default_chars_per_token() -> usize {
    docsift_core::CHARS_PER_TOKEN
}

fn default_output_name() -> String {
    "{group}.combined.md".to_string()
}

fn default_include() -> Vec<String> {
    vec!["*.md".into(), "*.markdown".into(), "*.txt".into()]
}

fn default_mtime_tolerance() -> f64 {
    DEFAULT_MTIME_TOLERANCE
}

fn default_concurrency() -> usize {
    2
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn yaml_defaults_are_filled_in() {
        let cfg = JobConfig::from_yaml(
            r#"
name: reports
inputs: [docs]
output_dir: out
"#,
        )
        .unwrap();
        assert_eq!(cfg.mode, JobMode::Analyze);
        assert_eq!(cfg.provider.id, "local");
        assert_eq!(cfg.chunking.overlap_tokens, 200);
        assert_eq!(cfg.mtime_tolerance, DEFAULT_MTIME_TOLERANCE);
        assert_eq!(cfg.concurrency(), 2);
        assert_eq!(cfg.combine.output_name, "{group}.combined.md");
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn toml_templates_accept_inline_and_file_forms() {
        let cfg = JobConfig::from_toml(
            r#"
name = "digest"
mode = "combine"
inputs = ["group:reports", "notes/extra.md"]
output_dir = "out"
concurrency = 64

[prompt]
system = "You are terse."
user = { file = "prompts/user.md" }

[prompt.extra]
audience = "board"

[combine]
order = "mtime"
batch_size = 4
"#,
        )
        .unwrap();
        assert_eq!(cfg.mode, JobMode::Combine);
        assert_eq!(cfg.combine.order, InputOrder::Mtime);
        assert_eq!(cfg.concurrency(), 8);
        assert_eq!(
            cfg.prompt.system,
            Some(TemplateRef::Inline("You are terse.".into()))
        );
        assert!(matches!(cfg.prompt.user, Some(TemplateRef::File { .. })));
        assert_eq!(cfg.prompt.extra["audience"], "board");
    }

    #[test]
    fn load_rebases_relative_paths() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("job.yaml");
        fs::write(
            &path,
            "name: g\ninputs: [docs, 'group:other']\noutput_dir: out\nprompt:\n  user: { file: u.md }\n",
        )
        .unwrap();
        let cfg = JobConfig::load(&path).unwrap();
        let base = dir.path().canonicalize().unwrap();
        assert_eq!(cfg.output_dir, base.join("out"));
        assert_eq!(cfg.inputs[0], base.join("docs").to_string_lossy());
        assert_eq!(cfg.inputs[1], "group:other");
        assert_eq!(cfg.state_dir(), base.join("out/.docsift"));
        assert_eq!(cfg.checkpoint_dir(), base.join("out/.docsift/checkpoints/g"));
        assert_eq!(
            cfg.prompt.user,
            Some(TemplateRef::File {
                file: base.join("u.md")
            })
        );
    }

    #[test]
    fn validation_rejects_unusable_jobs() {
        let mut cfg = JobConfig::from_yaml("name: g\ninputs: []\noutput_dir: out\n").unwrap();
        assert!(matches!(cfg.validate(), Err(PipelineError::Config(_))));
        cfg.inputs.push("a.md".into());
        cfg.name = "a/b".into();
        assert!(cfg.validate().is_err());
        cfg.name = "..".into();
        assert!(cfg.validate().is_err());
    }
}
