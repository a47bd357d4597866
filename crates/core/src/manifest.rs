use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::Result;
use crate::fsutil::{read_json_lenient, write_json_atomic};

pub const MANIFEST_VERSION: u32 = 1;
pub const DEFAULT_MTIME_TOLERANCE: f64 = 1e-6;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub source_mtime: f64,
    pub prompt_hash: String,
    pub ran_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<PathBuf>,
}

impl ManifestEntry {
    pub fn new(source_mtime: f64, prompt_hash: impl Into<String>) -> Self {
        Self {
            source_mtime,
            prompt_hash: prompt_hash.into(),
            ran_at: Utc::now(),
            output: None,
        }
    }

    pub fn with_output(mut self, output: impl Into<PathBuf>) -> Self {
        self.output = Some(output.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u32,
    #[serde(default)]
    pub documents: BTreeMap<String, ManifestEntry>,
}

impl Default for Manifest {
    fn default() -> Self {
        Self {
            version: MANIFEST_VERSION,
            documents: BTreeMap::new(),
        }
    }
}

/// Decides whether a document has to run again. `force_rerun` is the caller's
/// business and is not considered here.
pub fn should_process(
    entry: Option<&ManifestEntry>,
    current_mtime: f64,
    current_hash: &str,
    output_exists: bool,
    tolerance: f64,
) -> bool {
    if !output_exists {
        return true;
    }
    let Some(entry) = entry else {
        return true;
    };
    if entry.prompt_hash != current_hash {
        return true;
    }
    (entry.source_mtime - current_mtime).abs() > tolerance
}

/// One manifest file per job, loaded once and written once.
#[derive(Debug)]
pub struct ManifestStore {
    path: PathBuf,
    manifest: Manifest,
    tolerance: f64,
    dirty: bool,
}

impl ManifestStore {
    /// Never fails: a missing, corrupt or future-version file starts empty.
    pub fn load(path: impl Into<PathBuf>, tolerance: f64) -> Self {
        let path = path.into();
        let manifest = match read_json_lenient::<Manifest>(&path) {
            Some(manifest) if manifest.version == MANIFEST_VERSION => manifest,
            Some(manifest) => {
                warn!(
                    path = %path.display(),
                    version = manifest.version,
                    "unsupported manifest version, starting empty"
                );
                Manifest::default()
            }
            None => Manifest::default(),
        };
        debug!(path = %path.display(), entries = manifest.documents.len(), "manifest loaded");
        Self {
            path,
            manifest,
            tolerance,
            dirty: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn tolerance(&self) -> f64 {
        self.tolerance
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn get(&self, key: &str) -> Option<&ManifestEntry> {
        self.manifest.documents.get(key)
    }

    pub fn len(&self) -> usize {
        self.manifest.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.manifest.documents.is_empty()
    }

    pub fn should_process(
        &self,
        key: &str,
        current_mtime: f64,
        current_hash: &str,
        output_exists: bool,
    ) -> bool {
        should_process(
            self.get(key),
            current_mtime,
            current_hash,
            output_exists,
            self.tolerance,
        )
    }

    pub fn record(&mut self, key: impl Into<String>, entry: ManifestEntry) {
        self.manifest.documents.insert(key.into(), entry);
        self.dirty = true;
    }

    pub fn save(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        write_json_atomic(&self.path, &self.manifest)?;
        self.dirty = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn entry(mtime: f64, hash: &str) -> ManifestEntry {
        ManifestEntry::new(mtime, hash)
    }

    #[test]
    fn skip_requires_output_entry_hash_and_mtime() {
        let e = entry(100.0, "h1");
        let tol = DEFAULT_MTIME_TOLERANCE;
        assert!(!should_process(Some(&e), 100.0, "h1", true, tol));
        assert!(should_process(Some(&e), 100.0, "h1", false, tol));
        assert!(should_process(None, 100.0, "h1", true, tol));
        assert!(should_process(Some(&e), 100.0, "h2", true, tol));
        assert!(should_process(Some(&e), 100.5, "h1", true, tol));
        assert!(!should_process(Some(&e), 100.0000000001, "h1", true, tol));
    }

    #[test]
    fn tolerance_is_configurable() {
        let e = entry(100.0, "h");
        assert!(should_process(Some(&e), 101.0, "h", true, 1e-6));
        assert!(!should_process(Some(&e), 101.0, "h", true, 2.0));
    }

    #[test]
    fn store_roundtrips_through_disk() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("manifests/group.json");
        let mut store = ManifestStore::load(&path, DEFAULT_MTIME_TOLERANCE);
        assert!(store.is_empty());
        store.record("a.md", entry(12.5, "abc").with_output("out/a.md"));
        store.save().unwrap();

        let reloaded = ManifestStore::load(&path, DEFAULT_MTIME_TOLERANCE);
        assert_eq!(reloaded.len(), 1);
        let got = reloaded.get("a.md").unwrap();
        assert_eq!(got.prompt_hash, "abc");
        assert_eq!(got.output.as_deref(), Some(Path::new("out/a.md")));
        assert!(!reloaded.should_process("a.md", 12.5, "abc", true));

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["version"], 1);
        assert!(raw["documents"]["a.md"]["ran_at"].is_string());
    }

    #[test]
    fn malformed_or_foreign_files_load_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("m.json");
        std::fs::write(&path, "]]]").unwrap();
        assert!(ManifestStore::load(&path, DEFAULT_MTIME_TOLERANCE).is_empty());
        std::fs::write(&path, r#"{"version": 99, "documents": {}}"#).unwrap();
        assert!(ManifestStore::load(&path, DEFAULT_MTIME_TOLERANCE).is_empty());
    }

    #[test]
    fn save_without_changes_writes_nothing() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("m.json");
        let mut store = ManifestStore::load(&path, DEFAULT_MTIME_TOLERANCE);
        store.save().unwrap();
        assert!(!path.exists());
    }
}
