use std::sync::Arc;

use docsift_core::{
    generate_checked, safe_budget, CancellationToken, CheckpointStore, ChunkConfig, Chunker,
    CombineSettings, HierarchicalCombiner, PipelineError, Provider, Result, TokenCounter,
};
use docsift_llm::{context_window_for, ProviderKind};
use tracing::{debug, info};

use crate::config::JobConfig;
use crate::output::Provenance;
use crate::prompt::{CombineTemplate, ModelSettings, PromptBundle};

const FALLBACK_CONTEXT_WINDOW: usize = 8_192;

/// Token limits derived once per job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub chunk_tokens: usize,
    pub overlap_tokens: usize,
    pub chars_per_token: usize,
    pub combine_tokens: usize,
    pub combine_batch: Option<usize>,
}

/// Everything a worker needs to turn text into one provider result.
pub struct Pipeline {
    pub provider: Arc<dyn Provider>,
    pub checkpoints: CheckpointStore,
    pub counter: TokenCounter,
    pub prompts: PromptBundle,
    pub model: ModelSettings,
    pub limits: Limits,
    pub prompt_hash: String,
}

impl Pipeline {
    pub fn from_config(config: &JobConfig, provider: Arc<dyn Provider>) -> Result<Self> {
        config.validate()?;
        let kind = config.provider.id.parse::<ProviderKind>().ok();
        let model = match (&config.provider.model, kind) {
            (Some(model), _) => model.clone(),
            (None, Some(kind)) => kind.default_model().to_string(),
            (None, None) => {
                return Err(PipelineError::Config(format!(
                    "provider '{}' needs an explicit model",
                    config.provider.id
                )))
            }
        };
        let model = ModelSettings {
            provider_id: config.provider.id.clone(),
            model,
            temperature: config.provider.temperature,
            max_tokens: config.provider.max_tokens,
        };
        let prompts = PromptBundle::load(&config.prompt)?;
        let counter = TokenCounter::new(config.chunking.tokenizer)?;
        let limits = derive_limits(config, kind, &model, &prompts, &counter);
        let prompt_hash = prompts
            .hasher()
            .field("mode", config.mode.as_str())
            .field("provider", model.provider_id.as_str())
            .field("model", model.model.as_str())
            .field("temperature", format!("{:.4}", model.temperature))
            .field("max_tokens", model.max_tokens.to_string())
            .field("chunk_tokens", limits.chunk_tokens.to_string())
            .field("overlap_tokens", limits.overlap_tokens.to_string())
            .field("chars_per_token", limits.chars_per_token.to_string())
            .field("combine_tokens", limits.combine_tokens.to_string())
            .field("combine_batch", format!("{:?}", limits.combine_batch))
            .field("tokenizer", counter.kind().as_str())
            .finish();
        debug!(job = %config.name, ?limits, prompt_hash = %prompt_hash, "pipeline ready");
        Ok(Self {
            provider,
            checkpoints: CheckpointStore::new(config.checkpoint_dir()),
            counter,
            prompts,
            model,
            limits,
            prompt_hash,
        })
    }

    pub fn engine<'a>(&'a self, cancel: &'a CancellationToken) -> Engine<'a> {
        Engine {
            pipeline: self,
            cancel,
        }
    }

    pub fn provenance(&self, analysis: &Analysis, generated_at: String) -> Provenance {
        Provenance {
            source: None,
            sources: Vec::new(),
            prompt_system: self.prompts.system_ref.clone(),
            prompt_user: self.prompts.user_ref.clone(),
            provider: self.model.provider_id.clone(),
            model: self.model.model.clone(),
            prompt_hash: self.prompt_hash.clone(),
            chunks: analysis.chunks,
            prompt_tokens: analysis.prompt_tokens,
            completion_tokens: analysis.completion_tokens,
            generated_at,
        }
    }
}

fn derive_limits(
    config: &JobConfig,
    kind: Option<ProviderKind>,
    model: &ModelSettings,
    prompts: &PromptBundle,
    counter: &TokenCounter,
) -> Limits {
    let window = config
        .chunking
        .context_window
        .or_else(|| kind.map(|kind| context_window_for(kind, &model.model)))
        .unwrap_or(FALLBACK_CONTEXT_WINDOW);
    let reserve = config
        .chunking
        .response_reserve_tokens
        .unwrap_or(model.max_tokens as usize);
    let system = counter.count(&prompts.system);
    let chunk_tokens = config
        .chunking
        .max_chunk_tokens
        .unwrap_or_else(|| safe_budget(window, system + counter.count(&prompts.user), reserve));
    let combine_tokens = safe_budget(window, system + counter.count(&prompts.combine), reserve);
    Limits {
        chunk_tokens,
        overlap_tokens: config.chunking.overlap_tokens,
        chars_per_token: config.chunking.chars_per_token,
        combine_tokens,
        combine_batch: config.combine.batch_size,
    }
}

/// Result of analyzing one text, directly or through chunks and combine.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Analysis {
    pub content: String,
    pub chunks: usize,
    pub combine_levels: usize,
    pub provider_calls: usize,
    pub cache_hits: usize,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

pub struct Engine<'a> {
    pipeline: &'a Pipeline,
    cancel: &'a CancellationToken,
}

impl Engine<'_> {
    /// Analyzes `text` under checkpoint scope `key`. Chunks run one after the
    /// other; the first failing chunk fails the whole text.
    pub fn analyze(&self, key: &str, source: &str, text: &str) -> Result<Analysis> {
        self.cancel.check()?;
        let pipeline = self.pipeline;
        let limits = pipeline.limits;
        let mut analysis = Analysis::default();
        if pipeline.counter.count(text) <= limits.chunk_tokens {
            analysis.chunks = 1;
            let prompt = pipeline.prompts.render_user(text, source, None);
            analysis.content = self.call_map(key, 0, prompt, &mut analysis)?;
            return Ok(analysis);
        }

        let chunker = Chunker::new(ChunkConfig {
            max_tokens: limits.chunk_tokens,
            overlap_tokens: limits.overlap_tokens,
            chars_per_token: limits.chars_per_token,
        });
        let chunks = chunker.chunk(text);
        analysis.chunks = chunks.len();
        info!(key, chunks = chunks.len(), budget = limits.chunk_tokens, "document chunked");
        let mut partials = Vec::with_capacity(chunks.len());
        for chunk in &chunks {
            self.cancel.check()?;
            let prompt = pipeline.prompts.render_user(&chunk.text, source, Some(chunk));
            partials.push(self.call_map(key, chunk.index, prompt, &mut analysis)?);
        }

        let combiner = HierarchicalCombiner::new(
            pipeline.provider.as_ref(),
            &pipeline.checkpoints,
            &pipeline.counter,
            self.cancel,
            CombineSettings {
                budget_tokens: limits.combine_tokens,
                batch_size: limits.combine_batch,
            },
        );
        let template = CombineTemplate {
            prompts: &pipeline.prompts,
            model: &pipeline.model,
            source,
        };
        let combined = combiner.combine(key, partials, &template)?;
        analysis.content = combined.content;
        analysis.combine_levels = combined.levels;
        analysis.provider_calls += combined.provider_calls;
        analysis.cache_hits += combined.cache_hits;
        analysis.prompt_tokens += combined.prompt_tokens;
        analysis.completion_tokens += combined.completion_tokens;
        Ok(analysis)
    }

    fn call_map(
        &self,
        key: &str,
        index: usize,
        prompt: String,
        analysis: &mut Analysis,
    ) -> Result<String> {
        let pipeline = self.pipeline;
        let request = pipeline.model.request(&pipeline.prompts.system, prompt);
        let checksum = request.input_checksum();
        if let Some(cached) = pipeline.checkpoints.probe_map_chunk(key, index, &checksum) {
            debug!(key, index, "chunk checkpoint hit");
            analysis.cache_hits += 1;
            return Ok(cached);
        }
        self.cancel.check()?;
        debug!(key, index, "chunk checkpoint miss, calling provider");
        let generation = generate_checked(pipeline.provider.as_ref(), &request)?;
        analysis.provider_calls += 1;
        analysis.prompt_tokens += u64::from(generation.prompt_tokens);
        analysis.completion_tokens += u64::from(generation.completion_tokens);
        pipeline
            .checkpoints
            .save_map_chunk(key, index, &generation.content, &checksum)?;
        self.cancel.check()?;
        Ok(generation.content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docsift_core::{GenerateRequest, Generation};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    struct Counting(AtomicUsize);

    impl Provider for Counting {
        fn id(&self) -> &str {
            "counting"
        }

        fn generate(&self, request: &GenerateRequest) -> Generation {
            let n = self.0.fetch_add(1, Ordering::SeqCst);
            Generation::ok(format!("out {n} ({} chars)", request.prompt.len())).with_usage(5, 1)
        }
    }

    fn config(dir: &std::path::Path) -> JobConfig {
        let mut config = JobConfig::from_yaml(&format!(
            "name: t\ninputs: [x]\noutput_dir: {}\nchunking:\n  max_chunk_tokens: 100\n  overlap_tokens: 0\n",
            dir.display()
        ))
        .unwrap();
        config.base_dir = dir.to_path_buf();
        config
    }

    #[test]
    fn short_text_is_one_checkpointed_call() {
        let dir = tempdir().unwrap();
        let provider = Arc::new(Counting(AtomicUsize::new(0)));
        let pipeline = Pipeline::from_config(&config(dir.path()), provider.clone()).unwrap();
        let cancel = CancellationToken::new();
        let first = pipeline.engine(&cancel).analyze("a.md", "a.md", "short").unwrap();
        assert_eq!(first.chunks, 1);
        assert_eq!(first.provider_calls, 1);
        let again = pipeline.engine(&cancel).analyze("a.md", "a.md", "short").unwrap();
        assert_eq!(again.cache_hits, 1);
        assert_eq!(again.content, first.content);
        assert_eq!(provider.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn long_text_maps_then_combines() {
        let dir = tempdir().unwrap();
        let provider = Arc::new(Counting(AtomicUsize::new(0)));
        let pipeline = Pipeline::from_config(&config(dir.path()), provider.clone()).unwrap();
        let cancel = CancellationToken::new();
        let text = "A sentence of filler text. ".repeat(60);
        let out = pipeline.engine(&cancel).analyze("b.md", "b.md", &text).unwrap();
        assert!(out.chunks >= 4);
        assert_eq!(out.provider_calls, out.chunks + 1);
        assert_eq!(out.combine_levels, 1);
        assert_eq!(out.prompt_tokens, 5 * out.provider_calls as u64);
    }

    #[test]
    fn prompt_hash_follows_model_and_limits() {
        let dir = tempdir().unwrap();
        let provider: Arc<dyn Provider> = Arc::new(Counting(AtomicUsize::new(0)));
        let base = config(dir.path());
        let a = Pipeline::from_config(&base, provider.clone()).unwrap().prompt_hash;
        let mut other_model = base.clone();
        other_model.provider.model = Some("bigger".into());
        let b = Pipeline::from_config(&other_model, provider.clone()).unwrap().prompt_hash;
        let mut other_chunks = base.clone();
        other_chunks.chunking.max_chunk_tokens = Some(50);
        let c = Pipeline::from_config(&other_chunks, provider.clone()).unwrap().prompt_hash;
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(a, Pipeline::from_config(&base, provider).unwrap().prompt_hash);
    }

    #[test]
    fn unknown_provider_without_model_is_a_config_error() {
        let dir = tempdir().unwrap();
        let mut cfg = config(dir.path());
        cfg.provider.id = "mystery".into();
        let provider: Arc<dyn Provider> = Arc::new(Counting(AtomicUsize::new(0)));
        assert!(matches!(
            Pipeline::from_config(&cfg, provider),
            Err(PipelineError::Config(_))
        ));
    }
}
