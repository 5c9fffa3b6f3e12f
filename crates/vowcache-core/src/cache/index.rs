use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Index file name inside the cache directory
pub const INDEX_FILE: &str = "index.json";

/// On-disk index format version
const INDEX_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheIndexEntry {
    pub source_key: String,
    pub cache_key: String,
    pub cached_at: DateTime<Utc>,
    pub size_bytes: Option<u64>,
}

impl CacheIndexEntry {
    pub fn new(source_key: String, cache_key: String, size_bytes: Option<u64>) -> Self {
        Self {
            source_key,
            cache_key,
            cached_at: Utc::now(),
            size_bytes,
        }
    }

    pub fn age_minutes(&self) -> i64 {
        (Utc::now() - self.cached_at).num_minutes()
    }

    pub fn age_display(&self) -> String {
        let minutes = self.age_minutes();
        if minutes < 1 {
            // Also covers clock skew
            "just now".to_string()
        } else if minutes < 60 {
            format!("{}m ago", minutes)
        } else if minutes < 1440 {
            format!("{}h ago", minutes / 60)
        } else {
            format!("{}d ago", minutes / 1440)
        }
    }

    pub fn is_older_than(&self, max_age: Duration) -> bool {
        Utc::now() - self.cached_at > max_age
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct IndexFile {
    version: u32,
    entries: BTreeMap<String, CacheIndexEntry>,
}

/// Persisted `source_key -> entry` map for the content cache.
#[derive(Debug, Default)]
pub struct CacheIndex {
    entries: BTreeMap<String, CacheIndexEntry>,
}

impl CacheIndex {
    /// Load the index from `dir`. A missing file is an empty index; an
    /// unreadable one is discarded (its files become orphans).
    pub fn load(dir: &Path) -> Self {
        let path = dir.join(INDEX_FILE);
        if !path.exists() {
            return Self::default();
        }

        let parsed = std::fs::read_to_string(&path)
            .map_err(|e| e.to_string())
            .and_then(|contents| {
                serde_json::from_str::<IndexFile>(&contents).map_err(|e| e.to_string())
            });

        match parsed {
            Ok(file) if file.version == INDEX_VERSION => {
                debug!(entries = file.entries.len(), "Cache index loaded");
                Self {
                    entries: file.entries,
                }
            }
            Ok(file) => {
                warn!(version = file.version, "Unknown cache index version, starting empty");
                Self::default()
            }
            Err(e) => {
                warn!(error = %e, "Failed to load cache index, starting empty");
                Self::default()
            }
        }
    }

    /// Write the index atomically (temp file + rename).
    pub fn save(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir).map_err(|e| Error::cache_storage(dir, e))?;

        let file = IndexFile {
            version: INDEX_VERSION,
            entries: self.entries.clone(),
        };
        let contents =
            serde_json::to_string_pretty(&file).map_err(|e| Error::cache_storage(dir, e))?;

        let path = dir.join(INDEX_FILE);
        let tmp = temp_path(dir, INDEX_FILE);
        std::fs::write(&tmp, contents).map_err(|e| Error::cache_storage(&tmp, e))?;
        std::fs::rename(&tmp, &path).map_err(|e| {
            let _ = std::fs::remove_file(&tmp);
            Error::cache_storage(&path, e)
        })?;
        Ok(())
    }

    pub fn get(&self, source_key: &str) -> Option<&CacheIndexEntry> {
        self.entries.get(source_key)
    }

    /// Insert or replace the entry for its source key.
    pub fn insert(&mut self, entry: CacheIndexEntry) -> Option<CacheIndexEntry> {
        self.entries.insert(entry.source_key.clone(), entry)
    }

    pub fn remove(&mut self, source_key: &str) -> Option<CacheIndexEntry> {
        self.entries.remove(source_key)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = &CacheIndexEntry> {
        self.entries.values()
    }

    /// True if some entry points at `cache_key`.
    pub fn references(&self, cache_key: &str) -> bool {
        self.entries.values().any(|e| e.cache_key == cache_key)
    }
}

/// Hidden sibling path used for atomic writes.
pub(crate) fn temp_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!(".{}.{:016x}{}", name, rand::random::<u64>(), TEMP_SUFFIX))
}

pub(crate) const TEMP_SUFFIX: &str = ".tmp";
