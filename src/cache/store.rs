//! Content Store - resolves a request key to readable content
//!
//! The daemon only needs open/size/positional-read semantics. Two backends:
//!
//! - [`FileStore`] - an index file mapping keys to files on local disk
//! - [`MemoryStore`] - in-memory `Bytes`, for tests and embedding

use std::collections::HashMap;
use std::fs::{self, File};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Keyed content lookup; safe to call from many workers at once.
pub trait ContentStore: Send + Sync {
    /// Resolve `key`; `Ok(None)` is a miss.
    fn resolve(&self, key: &str) -> Result<Option<Box<dyn ContentHandle>>>;

    /// Number of keys the store knows about.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// An opened piece of content, owned by a single worker.
pub trait ContentHandle: Send {
    /// Total size in bytes.
    fn size(&self) -> Result<u64>;

    /// Read up to `buf.len()` bytes starting at `offset`; 0 means end of content.
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize>;
}

// =============================================================================
// FileStore
// =============================================================================

/// Index-file backed store.
///
/// The index holds one `<key> <path>` pair per line; blank lines and lines
/// starting with `#` are ignored. Relative paths are resolved against the
/// directory containing the index.
#[derive(Debug, Default)]
pub struct FileStore {
    entries: HashMap<String, PathBuf>,
}

impl FileStore {
    /// Load an index file.
    pub fn open(index_path: impl AsRef<Path>) -> Result<Self> {
        let index_path = index_path.as_ref();
        let contents = fs::read_to_string(index_path).map_err(|e| {
            Error::Config(format!(
                "failed to read content index {}: {}",
                index_path.display(),
                e
            ))
        })?;
        let base = index_path.parent().unwrap_or_else(|| Path::new("."));

        let store = Self::parse(&contents, base)?;
        info!(
            index = %index_path.display(),
            entries = store.entries.len(),
            "Loaded content index"
        );
        Ok(store)
    }

    /// Parse index contents, resolving relative paths against `base`.
    pub fn parse(contents: &str, base: &Path) -> Result<Self> {
        let mut entries = HashMap::new();

        for (lineno, line) in contents.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let mut tokens = line.split_whitespace();
            let (Some(key), Some(path)) = (tokens.next(), tokens.next()) else {
                return Err(Error::Config(format!(
                    "content index line {}: expected '<key> <path>'",
                    lineno + 1
                )));
            };

            let path = Path::new(path);
            let path = if path.is_absolute() {
                path.to_path_buf()
            } else {
                base.join(path)
            };
            entries.insert(key.to_string(), path);
        }

        Ok(Self { entries })
    }

    /// Build a store from explicit key/path pairs.
    pub fn from_entries<K, P>(entries: impl IntoIterator<Item = (K, P)>) -> Self
    where
        K: Into<String>,
        P: Into<PathBuf>,
    {
        Self {
            entries: entries
                .into_iter()
                .map(|(k, p)| (k.into(), p.into()))
                .collect(),
        }
    }

    /// Path registered for `key`, if any.
    pub fn path_of(&self, key: &str) -> Option<&Path> {
        self.entries.get(key).map(PathBuf::as_path)
    }
}

impl ContentStore for FileStore {
    fn resolve(&self, key: &str) -> Result<Option<Box<dyn ContentHandle>>> {
        let Some(path) = self.entries.get(key) else {
            return Ok(None);
        };

        match File::open(path) {
            Ok(file) => Ok(Some(Box::new(FileHandle { file }))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!(key, path = %path.display(), "Indexed file is missing");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Each resolve opens its own descriptor, so workers never share a cursor.
struct FileHandle {
    file: File,
}

impl ContentHandle for FileHandle {
    fn size(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        loop {
            match self.file.read_at(buf, offset) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }
}

// =============================================================================
// MemoryStore
// =============================================================================

/// In-memory store backed by `DashMap` for lock-free concurrent lookups.
#[derive(Debug, Default)]
pub struct MemoryStore {
    objects: DashMap<String, Bytes>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an object.
    pub fn insert(&self, key: impl Into<String>, data: impl Into<Bytes>) {
        let key = key.into();
        let data = data.into();
        debug!(key = %key, size = data.len(), "Stored object");
        self.objects.insert(key, data);
    }

    pub fn remove(&self, key: &str) -> Option<Bytes> {
        self.objects.remove(key).map(|(_, v)| v)
    }
}

impl ContentStore for MemoryStore {
    fn resolve(&self, key: &str) -> Result<Option<Box<dyn ContentHandle>>> {
        Ok(self
            .objects
            .get(key)
            .map(|data| Box::new(MemoryHandle(data.clone())) as Box<dyn ContentHandle>))
    }

    fn len(&self) -> usize {
        self.objects.len()
    }
}

struct MemoryHandle(Bytes);

impl ContentHandle for MemoryHandle {
    fn size(&self) -> Result<u64> {
        Ok(self.0.len() as u64)
    }

    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let start = usize::try_from(offset).unwrap_or(usize::MAX).min(self.0.len());
        let n = buf.len().min(self.0.len() - start);
        buf[..n].copy_from_slice(&self.0[start..start + n]);
        Ok(n)
    }
}
