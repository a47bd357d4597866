use tracing::{debug, info, warn};

use crate::cancel::CancellationToken;
use crate::checkpoint::CheckpointStore;
use crate::error::{PipelineError, Result};
use crate::provider::{generate_checked, GenerateRequest, Provider};
use crate::tokens::TokenCounter;

/// Tokens reserved per part for the `### Part N` marker and blank lines.
const PART_OVERHEAD_TOKENS: usize = 8;
const MIN_BATCH: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CombineStep {
    pub level: usize,
    pub batch: usize,
    pub batches: usize,
    pub is_final: bool,
}

/// Renders the provider request for one combine unit.
pub trait CombinePrompt {
    fn render(&self, content: &str, step: &CombineStep) -> GenerateRequest;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CombineSettings {
    /// Token budget for the joined parts, excluding the combine template.
    pub budget_tokens: usize,
    /// Fixed batch size; derived from the budget when `None`.
    pub batch_size: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CombineOutcome {
    pub content: String,
    pub levels: usize,
    pub provider_calls: usize,
    pub cache_hits: usize,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    /// `[start, end)` ranges of each level's batches, in order.
    pub plan: Vec<Vec<(usize, usize)>>,
}

pub struct HierarchicalCombiner<'a> {
    provider: &'a dyn Provider,
    checkpoints: &'a CheckpointStore,
    counter: &'a TokenCounter,
    cancel: &'a CancellationToken,
    settings: CombineSettings,
}

impl<'a> HierarchicalCombiner<'a> {
    pub fn new(
        provider: &'a dyn Provider,
        checkpoints: &'a CheckpointStore,
        counter: &'a TokenCounter,
        cancel: &'a CancellationToken,
        settings: CombineSettings,
    ) -> Self {
        Self {
            provider,
            checkpoints,
            counter,
            cancel,
            settings,
        }
    }

    /// Reduces `parts` to one result, level by level, probing the checkpoint
    /// store under `scope` before every provider call.
    pub fn combine(
        &self,
        scope: &str,
        parts: Vec<String>,
        prompt: &dyn CombinePrompt,
    ) -> Result<CombineOutcome> {
        let mut outcome = CombineOutcome::default();
        if parts.is_empty() {
            return Err(PipelineError::Provider(
                "no partial results to combine".to_string(),
            ));
        }
        if parts.len() == 1 {
            outcome.content = parts.into_iter().next().unwrap_or_default();
            return Ok(outcome);
        }
        let mut current = parts;
        let mut level = 1usize;
        loop {
            self.cancel.check()?;
            let joined = join_parts(&current, 0);
            let batch_size = batch_size_for(
                &current,
                self.settings.budget_tokens,
                self.counter,
                self.settings.batch_size,
            );
            let fits = self.counter.count(&joined) <= self.settings.budget_tokens;
            if fits || batch_size >= current.len() {
                if !fits {
                    warn!(scope, level, parts = current.len(), "final combine exceeds budget");
                }
                let step = CombineStep {
                    level,
                    batch: 0,
                    batches: 1,
                    is_final: true,
                };
                let content = self.run_unit(scope, &joined, &step, prompt, &mut outcome)?;
                outcome.content = content;
                outcome.plan.push(vec![(0, current.len())]);
                outcome.levels = level;
                info!(
                    scope,
                    levels = level,
                    calls = outcome.provider_calls,
                    cache_hits = outcome.cache_hits,
                    "combine finished"
                );
                return Ok(outcome);
            }
            let ranges = partition(current.len(), batch_size);
            debug!(scope, level, batches = ranges.len(), batch_size, "combine level");
            let mut next = Vec::with_capacity(ranges.len());
            let mut failures = Vec::new();
            for (batch, &(start, end)) in ranges.iter().enumerate() {
                let step = CombineStep {
                    level,
                    batch,
                    batches: ranges.len(),
                    is_final: false,
                };
                let joined = join_parts(&current[start..end], start);
                match self.run_unit(scope, &joined, &step, prompt, &mut outcome) {
                    Ok(content) => next.push(content),
                    Err(PipelineError::Cancelled) => return Err(PipelineError::Cancelled),
                    Err(err) => {
                        warn!(scope, level, batch, error = %err, "combine batch failed");
                        failures.push(format!("batch {batch}: {err}"));
                    }
                }
            }
            if !failures.is_empty() {
                return Err(PipelineError::Provider(format!(
                    "{} of {} combine batches failed at level {level}: {}",
                    failures.len(),
                    ranges.len(),
                    failures.join("; ")
                )));
            }
            outcome.plan.push(ranges);
            current = next;
            level += 1;
        }
    }

    fn run_unit(
        &self,
        scope: &str,
        content: &str,
        step: &CombineStep,
        prompt: &dyn CombinePrompt,
        outcome: &mut CombineOutcome,
    ) -> Result<String> {
        self.cancel.check()?;
        let request = prompt.render(content, step);
        let checksum = request.input_checksum();
        if let Some(cached) =
            self.checkpoints
                .probe_reduce_batch(scope, step.level, step.batch, &checksum)
        {
            debug!(scope, level = step.level, batch = step.batch, "combine checkpoint hit");
            outcome.cache_hits += 1;
            return Ok(cached);
        }
        self.cancel.check()?;
        let generation = generate_checked(self.provider, &request)?;
        outcome.provider_calls += 1;
        outcome.prompt_tokens += u64::from(generation.prompt_tokens);
        outcome.completion_tokens += u64::from(generation.completion_tokens);
        self.checkpoints.save_reduce_batch(
            scope,
            step.level,
            step.batch,
            &generation.content,
            &checksum,
        )?;
        self.cancel.check()?;
        Ok(generation.content)
    }
}

/// Joins parts with numbered markers; `first_index` keeps numbering global
/// across batches of one level.
pub fn join_parts(parts: &[String], first_index: usize) -> String {
    parts
        .iter()
        .enumerate()
        .map(|(offset, part)| format!("### Part {}\n\n{}\n", first_index + offset + 1, part.trim()))
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn batch_size_for(
    parts: &[String],
    budget_tokens: usize,
    counter: &TokenCounter,
    fixed: Option<usize>,
) -> usize {
    if let Some(size) = fixed {
        return size.max(MIN_BATCH);
    }
    let largest = parts
        .iter()
        .map(|part| counter.count(part) + PART_OVERHEAD_TOKENS)
        .max()
        .unwrap_or(PART_OVERHEAD_TOKENS);
    (budget_tokens / largest.max(1)).max(MIN_BATCH)
}

pub fn partition(len: usize, batch_size: usize) -> Vec<(usize, usize)> {
    let size = batch_size.max(1);
    (0..len)
        .step_by(size)
        .map(|start| (start, (start + size).min(len)))
        .collect()
}
