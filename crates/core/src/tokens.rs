use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tiktoken_rs::CoreBPE;

use crate::error::{PipelineError, Result};

pub const CHARS_PER_TOKEN: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenizerKind {
    #[default]
    Heuristic,
    Cl100k,
    O200k,
}

impl TokenizerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenizerKind::Heuristic => "heuristic",
            TokenizerKind::Cl100k => "cl100k_base",
            TokenizerKind::O200k => "o200k_base",
        }
    }

    fn build(&self) -> Result<Option<CoreBPE>> {
        match self {
            TokenizerKind::Heuristic => Ok(None),
            TokenizerKind::Cl100k => tiktoken_rs::cl100k_base()
                .map(Some)
                .map_err(|e| PipelineError::Tokenizer(e.to_string())),
            TokenizerKind::O200k => tiktoken_rs::o200k_base()
                .map(Some)
                .map_err(|e| PipelineError::Tokenizer(e.to_string())),
        }
    }
}

/// Counts tokens either with a BPE table or with the `chars / 4` estimate.
#[derive(Clone)]
pub struct TokenCounter {
    kind: TokenizerKind,
    bpe: Option<Arc<CoreBPE>>,
}

impl TokenCounter {
    pub fn new(kind: TokenizerKind) -> Result<Self> {
        let bpe = kind.build()?.map(Arc::new);
        Ok(Self { kind, bpe })
    }

    pub fn heuristic() -> Self {
        Self {
            kind: TokenizerKind::Heuristic,
            bpe: None,
        }
    }

    pub fn kind(&self) -> TokenizerKind {
        self.kind
    }

    pub fn count(&self, text: &str) -> usize {
        match &self.bpe {
            Some(bpe) => bpe.encode_with_special_tokens(text).len(),
            None => estimate_tokens(text),
        }
    }
}

impl Default for TokenCounter {
    fn default() -> Self {
        Self::heuristic()
    }
}

impl std::fmt::Debug for TokenCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCounter")
            .field("kind", &self.kind)
            .finish()
    }
}

/// Rounds up so a budget computed from it never overshoots the provider limit.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(CHARS_PER_TOKEN)
}

/// Usable prompt budget once fixed prompt parts and the response reserve are
/// taken out of the context window. A 10% margin absorbs estimator error.
pub fn safe_budget(context_window: usize, fixed_tokens: usize, response_reserve: usize) -> usize {
    const MIN_BUDGET: usize = 256;
    let available = context_window
        .saturating_sub(fixed_tokens)
        .saturating_sub(response_reserve);
    (available / 10 * 9).max(MIN_BUDGET)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heuristic_rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abc"), 1);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
        assert_eq!(TokenCounter::heuristic().count(&"x".repeat(400)), 100);
    }

    #[test]
    fn safe_budget_leaves_margin() {
        assert_eq!(safe_budget(10_000, 1_000, 1_000), 7_200);
        assert_eq!(safe_budget(100, 500, 500), 256);
    }

    #[test]
    fn bpe_counter_reports_kind() {
        let counter = TokenCounter::new(TokenizerKind::Cl100k).unwrap();
        assert_eq!(counter.kind(), TokenizerKind::Cl100k);
        assert!(counter.count("hello world") >= 2);
    }
}
