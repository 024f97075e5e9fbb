//! Artifact Store (C3): a content-addressed-by-name on-disk store with a
//! JSON manifest enabling cross-invocation handoff (spec.md §4.3, §6).

use crate::error::{Result, RunnerError};
use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

const MANIFEST_FILE_NAME: &str = ".manifest.json";
const MANIFEST_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    File,
    Directory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactEntry {
    pub name: String,
    #[serde(rename = "relativePath")]
    pub relative_path: String,
    #[serde(rename = "type")]
    pub kind: ArtifactKind,
    #[serde(rename = "sizeBytes")]
    pub size_bytes: u64,
    #[serde(rename = "createdAt")]
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub artifacts: HashMap<String, ArtifactEntry>,
    #[serde(rename = "rideName")]
    pub ride_name: Option<String>,
    pub timestamp: i64,
    pub version: u32,
}

/// Content-addressed-by-name on-disk store. All mutators hold the write
/// lock; `get`/`has`/`list` hold the read lock (spec.md §4.3 Concurrency).
pub struct ArtifactStore {
    root: PathBuf,
    index: RwLock<HashMap<String, ArtifactEntry>>,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            index: RwLock::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Store `source` under `name`. Directories are copied recursively.
    /// Replaces an existing entry for the same name atomically from the
    /// caller's perspective (remove + copy under the write lock).
    pub fn put(&self, name: &str, source: &Path) -> Result<()> {
        if name.trim().is_empty() {
            return Err(RunnerError::BlankArtifactName);
        }
        if !source.exists() {
            return Err(RunnerError::ArtifactSourceMissing(source.display().to_string()));
        }

        let mut index = self.index.write();
        std::fs::create_dir_all(&self.root)?;
        let dest = self.root.join(name);

        if dest.exists() {
            if dest.is_dir() {
                std::fs::remove_dir_all(&dest)?;
            } else {
                std::fs::remove_file(&dest)?;
            }
        }

        let kind = if source.is_dir() {
            copy_dir_recursive(source, &dest)?;
            ArtifactKind::Directory
        } else {
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(source, &dest)?;
            ArtifactKind::File
        };

        let size_bytes = directory_size(&dest)?;
        let entry = ArtifactEntry {
            name: name.to_string(),
            relative_path: name.to_string(),
            kind,
            size_bytes,
            created_at: Utc::now().timestamp_millis(),
        };
        index.insert(name.to_string(), entry);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<PathBuf> {
        let index = self.index.read();
        index.get(name).map(|_| self.root.join(name))
    }

    pub fn has(&self, name: &str) -> bool {
        self.index.read().contains_key(name)
    }

    pub fn list(&self) -> Vec<String> {
        self.index.read().keys().cloned().collect()
    }

    /// Idempotent: removing an absent name is not an error.
    pub fn remove(&self, name: &str) -> Result<()> {
        let mut index = self.index.write();
        if index.remove(name).is_some() {
            let path = self.root.join(name);
            if path.is_dir() {
                std::fs::remove_dir_all(&path)?;
            } else if path.exists() {
                std::fs::remove_file(&path)?;
            }
        }
        Ok(())
    }

    pub fn clear(&self) -> Result<()> {
        let mut index = self.index.write();
        for name in index.keys().cloned().collect::<Vec<_>>() {
            let path = self.root.join(&name);
            if path.is_dir() {
                std::fs::remove_dir_all(&path)?;
            } else if path.exists() {
                std::fs::remove_file(&path)?;
            }
        }
        index.clear();
        Ok(())
    }

    /// Serialize every current entry to `<root>/.manifest.json`, written
    /// atomically (write-to-temp-then-rename) under the write lock.
    pub fn save_manifest(&self, ride_name: Option<String>) -> Result<()> {
        let index = self.index.write();
        std::fs::create_dir_all(&self.root)?;

        let manifest = Manifest {
            artifacts: index.clone(),
            ride_name,
            timestamp: Utc::now().timestamp_millis(),
            version: MANIFEST_VERSION,
        };

        let manifest_path = self.root.join(MANIFEST_FILE_NAME);
        let tmp_path = self.root.join(format!("{MANIFEST_FILE_NAME}.tmp"));
        let json = serde_json::to_vec_pretty(&manifest)?;
        std::fs::write(&tmp_path, json)?;
        std::fs::rename(&tmp_path, &manifest_path)?;
        Ok(())
    }

    /// Rebuild the in-memory index from the manifest if present, reusing
    /// the files already on disk. Missing/unparseable manifest means "no
    /// prior artifacts" (returns 0), not an error (spec.md §6).
    pub fn restore_from_manifest(&self) -> Result<usize> {
        let manifest_path = self.root.join(MANIFEST_FILE_NAME);
        let bytes = match std::fs::read(&manifest_path) {
            Ok(bytes) => bytes,
            Err(_) => return Ok(0),
        };
        let manifest: Manifest = match serde_json::from_slice(&bytes) {
            Ok(m) => m,
            Err(_) => return Ok(0),
        };

        let mut index = self.index.write();
        let count = manifest.artifacts.len();
        *index = manifest.artifacts;
        Ok(count)
    }
}

fn copy_dir_recursive(source: &Path, dest: &Path) -> Result<()> {
    std::fs::create_dir_all(dest)?;
    for entry in std::fs::read_dir(source)? {
        let entry = entry?;
        let src_path = entry.path();
        let dest_path = dest.join(entry.file_name());
        if src_path.is_dir() {
            copy_dir_recursive(&src_path, &dest_path)?;
        } else {
            std::fs::copy(&src_path, &dest_path)?;
        }
    }
    Ok(())
}

fn directory_size(path: &Path) -> Result<u64> {
    if path.is_file() {
        return Ok(std::fs::metadata(path)?.len());
    }
    let mut total = 0u64;
    for entry in std::fs::read_dir(path)? {
        let entry = entry?;
        let p = entry.path();
        total += if p.is_dir() {
            directory_size(&p)?
        } else {
            std::fs::metadata(&p)?.len()
        };
    }
    Ok(total)
}


#[cfg(test)]
impl ArtifactStore {
    /// Drops the in-memory index without touching disk, simulating a fresh
    /// process picking the store back up from its manifest.
    fn clear_index_only_for_test(&self) {
        self.index.write().clear();
    }
}
