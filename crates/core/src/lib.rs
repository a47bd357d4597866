mod cancel;
mod checkpoint;
mod checksum;
mod chunk;
mod combine;
mod error;
mod fsutil;
mod manifest;
mod provider;
mod tokens;

pub use cancel::CancellationToken;
pub use checkpoint::{CheckpointEntry, CheckpointStore};
pub use checksum::{sha256_hex, PromptHasher};
pub use chunk::{chunk_text, Chunk, ChunkConfig, Chunker};
pub use combine::{
    batch_size_for, join_parts, partition, CombineOutcome, CombinePrompt, CombineSettings,
    CombineStep, HierarchicalCombiner,
};
pub use error::{ErrorKind, PipelineError, Result};
pub use fsutil::{mtime_seconds, read_json_lenient, write_atomic, write_json_atomic};
pub use manifest::{
    should_process, Manifest, ManifestEntry, ManifestStore, DEFAULT_MTIME_TOLERANCE,
    MANIFEST_VERSION,
};
pub use provider::{generate_checked, GenerateRequest, Generation, Provider};
pub use tokens::{estimate_tokens, safe_budget, TokenCounter, TokenizerKind, CHARS_PER_TOKEN};
