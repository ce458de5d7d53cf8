//! Cache Store Module
//!
//! On-disk storage primitive for the read cache: one regular file per cache
//! entry. Names carry the object version plus the entry's admission sequence
//! number, so two entries never share a file even when they cache the same
//! object version. A restarted process matches leftovers on the version part.
//!
//! Layout: `cache_dir/<bucket>/<XX>/<sanitized object name>_<generation>_<seq>.bin`
//! where `XX` is the first two hex digits of the BLAKE3 hash of the object name.
//!
//! The store has no notion of watermarks or readers; it only creates, opens,
//! truncates, deletes and sizes files.

use crate::object_client::ObjectIdentity;
use crate::{CacheError, Result};
use bytes::Bytes;
use fs2::FileExt;
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use std::fs::File as StdFile;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, info, warn};

/// Extension of every backing file
const BACKING_FILE_EXTENSION: &str = "bin";

/// Lock file claiming the directory for one process
const LOCK_FILE_NAME: &str = ".bucket-fs-cache.lock";

/// Filesystem-unsafe ASCII characters percent-encoded in file names
const FILENAME_UNSAFE: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'/')
    .add(b'\\')
    .add(b':')
    .add(b'*')
    .add(b'?')
    .add(b'"')
    .add(b'<')
    .add(b'>')
    .add(b'|')
    .add(b'%');

/// Longest sanitized name kept verbatim; longer names are hashed
const MAX_SANITIZED_NAME_LEN: usize = 200;

/// A file found in the cache directory at startup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExistingFile {
    pub path: PathBuf,
    pub size: u64,
    /// Object version the file caches, see [`CacheStore::version_key`]
    pub version_key: PathBuf,
    /// Admission sequence number from the file name, 0 if it has none
    pub seq: u64,
}

/// Directory-backed storage for cache entry files
pub struct CacheStore {
    cache_dir: PathBuf,
    /// Held for the lifetime of the store so no other process shares the directory
    lock_file: Option<StdFile>,
}

impl CacheStore {
    pub fn new(cache_dir: PathBuf) -> Self {
        Self {
            cache_dir,
            lock_file: None,
        }
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Create the directory, verify it is writable, and take the exclusive
    /// directory lock. Any failure means the directory is unusable.
    pub fn initialize(&mut self) -> Result<()> {
        std::fs::create_dir_all(&self.cache_dir).map_err(|e| {
            CacheError::CacheStoreError(format!(
                "Failed to create cache directory {:?}: {}",
                self.cache_dir, e
            ))
        })?;

        let lock_path = self.cache_dir.join(LOCK_FILE_NAME);
        let lock_file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .map_err(|e| {
                CacheError::CacheStoreError(format!(
                    "Cache directory {:?} is not writable: {}",
                    self.cache_dir, e
                ))
            })?;

        lock_file.try_lock_exclusive().map_err(|e| {
            CacheError::CacheStoreError(format!(
                "Cache directory {:?} is in use by another process: {}",
                self.cache_dir, e
            ))
        })?;
        self.lock_file = Some(lock_file);

        info!("Cache store initialized at {:?}", self.cache_dir);
        Ok(())
    }

    /// Free space on the filesystem holding the cache directory
    pub fn available_space(&self) -> Result<u64> {
        fs2::available_space(&self.cache_dir).map_err(CacheError::from)
    }

    /// Path prefix shared by every backing file of one object version
    pub fn version_key(&self, id: &ObjectIdentity) -> PathBuf {
        let hash = blake3::hash(id.name.as_bytes());
        let hash_hex = hash.to_hex();
        let shard = &hash_hex.as_str()[0..2];

        let sanitized = utf8_percent_encode(&id.name, FILENAME_UNSAFE).to_string();
        let stem = if sanitized.len() > MAX_SANITIZED_NAME_LEN {
            hash_hex.to_string()
        } else {
            sanitized
        };

        let bucket = utf8_percent_encode(&id.bucket, FILENAME_UNSAFE).to_string();
        self.cache_dir
            .join(bucket)
            .join(shard)
            .join(format!("{}_{}", stem, id.generation))
    }

    /// Backing file path of the entry admitted as `seq` for `id`
    pub fn file_path(&self, id: &ObjectIdentity, seq: u64) -> PathBuf {
        let mut name = self.version_key(id).into_os_string();
        name.push(format!("_{}.{}", seq, BACKING_FILE_EXTENSION));
        PathBuf::from(name)
    }

    /// Split a backing file path into its version key and sequence number
    fn parse_backing_path(path: &Path) -> (PathBuf, u64) {
        let unversioned = path.with_extension("");
        let parsed = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .and_then(|stem| stem.rsplit_once('_'))
            .and_then(|(version, seq)| Some((version, seq.parse::<u64>().ok()?)));
        match parsed {
            Some((version, seq)) => (path.with_file_name(version), seq),
            None => (unversioned, 0),
        }
    }

    /// Create the backing file at `path` empty and open it for writing
    pub async fn create(&self, path: &Path) -> Result<File> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| {
                CacheError::CacheStoreError(format!(
                    "Failed to create directory {:?}: {}",
                    parent, e
                ))
            })?;
        }

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)
            .await
            .map_err(|e| {
                CacheError::CacheStoreError(format!("Failed to create {:?}: {}", path, e))
            })?;

        debug!("Created backing file {:?}", path);
        Ok(file)
    }

    /// Open an existing backing file for writing from offset 0, keeping its contents
    pub async fn open_writer(&self, path: &Path) -> Result<File> {
        OpenOptions::new()
            .write(true)
            .open(path)
            .await
            .map_err(|e| CacheError::CacheStoreError(format!("Failed to open {:?}: {}", path, e)))
    }

    /// Open an existing backing file for positioned reads.
    ///
    /// Every reader gets its own handle, so no file position is shared.
    pub async fn open(&self, path: &Path) -> Result<File> {
        File::open(path)
            .await
            .map_err(|e| CacheError::IoError(format!("Failed to open {:?}: {}", path, e)))
    }

    /// Read exactly `length` bytes at `offset` through a private handle
    pub async fn read_at(&self, path: &Path, offset: u64, length: usize) -> Result<Bytes> {
        let mut file = self.open(path).await?;
        file.seek(SeekFrom::Start(offset)).await?;
        let mut buf = vec![0u8; length];
        file.read_exact(&mut buf).await.map_err(|e| {
            CacheError::IoError(format!(
                "Short read of {} bytes at {} from {:?}: {}",
                length, offset, path, e
            ))
        })?;
        Ok(Bytes::from(buf))
    }

    /// Truncate the backing file to `len` bytes
    pub async fn truncate(&self, path: &Path, len: u64) -> Result<()> {
        let file = self.open_writer(path).await?;
        file.set_len(len).await.map_err(|e| {
            CacheError::CacheStoreError(format!("Failed to truncate {:?}: {}", path, e))
        })?;
        debug!("Truncated backing file {:?} to {} bytes", path, len);
        Ok(())
    }

    /// Delete a backing file, returning the bytes freed. A missing file frees nothing.
    pub async fn remove(&self, path: &Path) -> Result<u64> {
        let size = match fs::metadata(path).await {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        match fs::remove_file(path).await {
            Ok(()) => {
                debug!("Removed backing file {:?} ({} bytes)", path, size);
                Ok(size)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(CacheError::IoError(format!(
                "Failed to remove {:?}: {}",
                path, e
            ))),
        }
    }

    /// Current length of a backing file, `None` when it does not exist
    pub async fn file_size(&self, path: &Path) -> Result<Option<u64>> {
        match fs::metadata(path).await {
            Ok(meta) => Ok(Some(meta.len())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Make `path` an empty backing file, reusing a leftover file in place
    pub async fn prepare(&self, path: &Path) -> Result<()> {
        match self.file_size(path).await? {
            Some(0) => Ok(()),
            Some(_) => self.truncate(path, 0).await,
            None => self.create(path).await.map(|_| ()),
        }
    }

    /// List every backing file under the cache directory
    pub fn scan(&self) -> Vec<ExistingFile> {
        let mut found = Vec::new();
        for entry in walkdir::WalkDir::new(&self.cache_dir)
            .min_depth(1)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(BACKING_FILE_EXTENSION) {
                continue;
            }
            match entry.metadata() {
                Ok(meta) => {
                    let (version_key, seq) = Self::parse_backing_path(path);
                    found.push(ExistingFile {
                        path: path.to_path_buf(),
                        size: meta.len(),
                        version_key,
                        seq,
                    });
                }
                Err(e) => warn!("Skipping unreadable cache file {:?}: {}", path, e),
            }
        }
        found
    }

    /// Delete every backing file under the cache directory, returning bytes freed
    pub async fn purge(&self) -> u64 {
        let mut freed = 0;
        for file in self.scan() {
            match self.remove(&file.path).await {
                Ok(bytes) => freed += bytes,
                Err(e) => warn!("Failed to purge {:?}: {}", file.path, e),
            }
        }
        freed
    }
}

impl Drop for CacheStore {
    fn drop(&mut self) {
        if let Some(lock_file) = self.lock_file.take() {
            let _ = FileExt::unlock(&lock_file);
        }
    }
}
