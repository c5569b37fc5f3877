//! Freshness cache: one pretty-printed JSON document per artifact.
//!
//! Reads never fail: a missing, unreadable or corrupt file is a miss. Writes go
//! to a sibling temp file that is renamed into place, so readers see either
//! the old document or the new one.

#![allow(missing_docs)]

use std::fs;
use std::io;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::core::errors::{MpError, Result};
use crate::source::resolver::SourceDescriptor;

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// File-backed JSON document of type `T`.
#[derive(Debug, Clone)]
pub struct JsonCache<T> {
    path: PathBuf,
    _doc: PhantomData<fn() -> T>,
}

impl<T> JsonCache<T>
where
    T: Serialize + DeserializeOwned,
{
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            _doc: PhantomData,
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The stored document, or `None` on any kind of miss.
    pub fn load(&self) -> Option<T> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(error) if error.kind() == io::ErrorKind::NotFound => return None,
            Err(error) => {
                eprintln!("[MP-CACHE] cannot read {}: {error}", self.path.display());
                return None;
            }
        };
        if raw.trim().is_empty() {
            return None;
        }
        match serde_json::from_str(&raw) {
            Ok(doc) => Some(doc),
            Err(error) => {
                eprintln!(
                    "[MP-CACHE] ignoring corrupt cache {}: {error}",
                    self.path.display()
                );
                None
            }
        }
    }

    /// Write the document atomically.
    pub fn store(&self, doc: &T) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|source| MpError::io(parent, source))?;
        }
        let data = serde_json::to_vec_pretty(doc)?;
        let tmp = self.tmp_path();
        fs::write(&tmp, data).map_err(|source| MpError::io(&tmp, source))?;
        fs::rename(&tmp, &self.path).map_err(|source| {
            let _ = fs::remove_file(&tmp);
            MpError::io(&self.path, source)
        })
    }

    /// `<file>.<pid>.<n>.tmp`, unique per writer so concurrent stores never
    /// share a temp file.
    fn tmp_path(&self) -> PathBuf {
        let n = TMP_COUNTER.fetch_add(1, Ordering::Relaxed);
        let mut name = self.path.as_os_str().to_owned();
        name.push(format!(".{}.{n}.tmp", std::process::id()));
        PathBuf::from(name)
    }
}

/// Contents of `index.json`.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct IndexMeta {
    /// Number of candidate log files found at the last scan.
    pub files: usize,
    /// Epoch seconds of that scan.
    pub updated: i64,
}

/// Contents of `agg.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AggregateStamp {
    pub updated_at: i64,
    pub window: String,
}

/// The three cache documents under one directory.
#[derive(Debug, Clone)]
pub struct CacheStore {
    dir: PathBuf,
}

impl CacheStore {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    #[must_use]
    pub fn logsource(&self) -> JsonCache<SourceDescriptor> {
        JsonCache::new(self.dir.join("logsource.json"))
    }

    #[must_use]
    pub fn index(&self) -> JsonCache<IndexMeta> {
        JsonCache::new(self.dir.join("index.json"))
    }

    #[must_use]
    pub fn aggregate(&self) -> JsonCache<AggregateStamp> {
        JsonCache::new(self.dir.join("agg.json"))
    }
}
