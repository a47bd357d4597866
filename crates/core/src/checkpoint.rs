use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::checksum::sha256_hex;
use crate::error::{PipelineError, Result};
use crate::fsutil::{read_json_lenient, write_json_atomic};

const MAP_DIR: &str = "map";
const REDUCE_DIR: &str = "reduce";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointEntry {
    pub input_checksum: String,
    pub content: String,
    pub content_checksum: String,
}

impl CheckpointEntry {
    pub fn new(content: impl Into<String>, input_checksum: impl Into<String>) -> Self {
        let content = content.into();
        Self {
            content_checksum: sha256_hex(&content),
            input_checksum: input_checksum.into(),
            content,
        }
    }

    pub fn is_intact(&self) -> bool {
        sha256_hex(&self.content) == self.content_checksum
    }

    pub fn matches(&self, input_checksum: &str) -> bool {
        self.input_checksum == input_checksum && self.is_intact()
    }
}

/// File-per-result cache of provider calls.
///
/// Map results live at `map/<document>/chunk_NNNNN.json`, reduce results at
/// `reduce/<scope>/level_NN/batch_NNNNN.json`. Entries are only trusted when
/// their stored input checksum equals the checksum of the input about to be
/// sent, so a shifted chunk boundary never reuses stale output.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    root: PathBuf,
}

impl CheckpointStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn load_map_chunk(&self, doc_key: &str, index: usize) -> Option<CheckpointEntry> {
        read_json_lenient(&self.map_chunk_path(doc_key, index))
    }

    pub fn save_map_chunk(
        &self,
        doc_key: &str,
        index: usize,
        content: &str,
        input_checksum: &str,
    ) -> Result<CheckpointEntry> {
        let entry = CheckpointEntry::new(content, input_checksum);
        write_json_atomic(&self.map_chunk_path(doc_key, index), &entry)?;
        Ok(entry)
    }

    pub fn probe_map_chunk(
        &self,
        doc_key: &str,
        index: usize,
        input_checksum: &str,
    ) -> Option<String> {
        hit(self.load_map_chunk(doc_key, index), input_checksum)
    }

    pub fn load_reduce_batch(
        &self,
        scope: &str,
        level: usize,
        batch: usize,
    ) -> Option<CheckpointEntry> {
        read_json_lenient(&self.reduce_batch_path(scope, level, batch))
    }

    pub fn save_reduce_batch(
        &self,
        scope: &str,
        level: usize,
        batch: usize,
        content: &str,
        input_checksum: &str,
    ) -> Result<CheckpointEntry> {
        let entry = CheckpointEntry::new(content, input_checksum);
        write_json_atomic(&self.reduce_batch_path(scope, level, batch), &entry)?;
        Ok(entry)
    }

    pub fn probe_reduce_batch(
        &self,
        scope: &str,
        level: usize,
        batch: usize,
        input_checksum: &str,
    ) -> Option<String> {
        hit(self.load_reduce_batch(scope, level, batch), input_checksum)
    }

    /// Removes every map checkpoint of one document. Returns files removed.
    pub fn clear_map_document(&self, doc_key: &str) -> Result<usize> {
        remove_tree(&self.root.join(MAP_DIR).join(storage_key(doc_key)))
    }

    /// Removes every reduce checkpoint of one scope.
    pub fn clear_reduce_scope(&self, scope: &str) -> Result<usize> {
        remove_tree(&self.root.join(REDUCE_DIR).join(storage_key(scope)))
    }

    /// Removes the whole reduce stage across scopes.
    pub fn clear_reduce(&self) -> Result<usize> {
        remove_tree(&self.root.join(REDUCE_DIR))
    }

    fn map_chunk_path(&self, doc_key: &str, index: usize) -> PathBuf {
        self.root
            .join(MAP_DIR)
            .join(storage_key(doc_key))
            .join(format!("chunk_{index:05}.json"))
    }

    fn reduce_batch_path(&self, scope: &str, level: usize, batch: usize) -> PathBuf {
        self.root
            .join(REDUCE_DIR)
            .join(storage_key(scope))
            .join(format!("level_{level:02}"))
            .join(format!("batch_{batch:05}.json"))
    }
}

fn hit(entry: Option<CheckpointEntry>, input_checksum: &str) -> Option<String> {
    match entry {
        Some(entry) if entry.matches(input_checksum) => Some(entry.content),
        Some(_) => {
            debug!("checkpoint input changed, treating as miss");
            None
        }
        None => None,
    }
}

/// Flattens a relative key into one directory name. The digest suffix keeps
/// keys that sanitize to the same text apart.
fn storage_key(key: &str) -> String {
    let cleaned: String = key
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let trimmed: String = cleaned.trim_matches('.').chars().take(80).collect();
    format!("{}-{}", trimmed, &sha256_hex(key)[..12])
}

fn remove_tree(dir: &Path) -> Result<usize> {
    if !dir.exists() {
        return Ok(0);
    }
    let removed = count_files(dir);
    fs::remove_dir_all(dir).map_err(|e| PipelineError::io(dir, e))?;
    Ok(removed)
}

fn count_files(dir: &Path) -> usize {
    let Ok(entries) = fs::read_dir(dir) else {
        return 0;
    };
    entries
        .flatten()
        .map(|entry| {
            let path = entry.path();
            if path.is_dir() {
                count_files(&path)
            } else {
                1
            }
        })
        .sum()
}
