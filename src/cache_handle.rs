//! Cache Handle Module
//!
//! Per-open-file read path. Each read decides between the cache entry's backing
//! file and a direct, generation-pinned range read from the object store.
//!
//! Decision order for `read(offset, length)`:
//! 1. A handle classified random reads directly, always.
//! 2. Sequential reads (offset 0, or where the previous read ended) start the
//!    download job if none ran yet.
//! 3. A range already below the watermark is served from the backing file.
//! 4. A sequential read with a running job waits, bounded, for the watermark,
//!    provided the read ends within one download chunk of it. Reads further
//!    ahead, a timeout, or a job failure serve the cached prefix and read the
//!    tail directly. The job keeps going.
//! 5. Anything else reads directly.

use crate::cache_entry::CacheEntry;
use crate::cache_manager::{CacheManager, EntryLease, NoCacheReason, ResolveOutcome};
use crate::object_client::ObjectIdentity;
use crate::{CacheError, Result};
use bytes::{Bytes, BytesMut};
use std::sync::Arc;
use tracing::debug;

enum Resolution {
    Unresolved,
    Cached(EntryLease),
    NoCache(NoCacheReason),
}

/// Read façade for one open file
pub struct CacheHandle {
    manager: Arc<CacheManager>,
    identity: ObjectIdentity,
    size: u64,
    resolution: Resolution,
    last_read_end: Option<u64>,
    non_sequential_reads: u32,
    random: bool,
}

impl CacheHandle {
    /// Open a handle on one object version of `size` bytes. Nothing is
    /// resolved until the first read.
    pub fn open(manager: Arc<CacheManager>, identity: ObjectIdentity, size: u64) -> Self {
        Self {
            manager,
            identity,
            size,
            resolution: Resolution::Unresolved,
            last_read_end: None,
            non_sequential_reads: 0,
            random: false,
        }
    }

    pub fn identity(&self) -> &ObjectIdentity {
        &self.identity
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Whether the handle stopped using the cache for good
    pub fn is_random(&self) -> bool {
        self.random
    }

    /// Entry backing this handle, if the resolve produced one
    pub fn entry(&self) -> Option<&Arc<CacheEntry>> {
        match &self.resolution {
            Resolution::Cached(lease) => Some(lease.entry()),
            _ => None,
        }
    }

    pub fn no_cache_reason(&self) -> Option<NoCacheReason> {
        match self.resolution {
            Resolution::NoCache(reason) => Some(reason),
            _ => None,
        }
    }

    /// Read up to `length` bytes at `offset`. Reads past the end are truncated.
    pub async fn read(&mut self, offset: u64, length: u64) -> Result<Bytes> {
        if offset > self.size {
            return Err(CacheError::InvalidRange(format!(
                "offset {} beyond size {} of {}",
                offset, self.size, self.identity
            )));
        }
        let length = length.min(self.size - offset);
        if length == 0 {
            return Ok(Bytes::new());
        }
        let sequential = self.classify(offset);
        let bytes = self.read_classified(offset, length, sequential).await?;
        // Only a completed read moves the sequential cursor
        self.last_read_end = Some(offset + length);
        Ok(bytes)
    }

    async fn read_classified(&mut self, offset: u64, length: u64, sequential: bool) -> Result<Bytes> {
        let end = offset + length;
        if self.random {
            let bytes = self.read_direct(offset, length).await?;
            self.manager.counters().record_random_read(length);
            return Ok(bytes);
        }

        let Some(entry) = self.resolve().await else {
            let bytes = self.read_direct(offset, length).await?;
            self.manager.counters().record_uncached_read(length);
            return Ok(bytes);
        };

        if sequential || (offset > 0 && self.manager.config().cache_file_for_range_read) {
            self.manager.ensure_job(&entry).await;
        }

        if entry.covers(self.identity.generation, offset, length) {
            match self.read_cached(&entry, offset, length).await {
                Ok(bytes) => {
                    self.manager.counters().record_cache_hit(length);
                    return Ok(bytes);
                }
                Err(e) => self.manager.invalidate_entry(&entry, &e.to_string()),
            }
        } else if sequential
            && entry.status().is_advancing()
            && self.within_lookahead(&entry, end)
        {
            let timeout = self.manager.config().sequential_read_wait_timeout;
            let progress = entry.wait_for_watermark(end, timeout).await;
            if entry.covers(self.identity.generation, offset, length) {
                match self.read_cached(&entry, offset, length).await {
                    Ok(bytes) => {
                        self.manager.counters().record_wait_hit(length);
                        return Ok(bytes);
                    }
                    Err(e) => self.manager.invalidate_entry(&entry, &e.to_string()),
                }
            } else {
                debug!(
                    "[CACHE_READ] Watermark did not reach read end: object={}, offset={}, end={}, watermark={}, status={:?}",
                    self.identity, offset, end, progress.downloaded_bytes, progress.status
                );
            }
        }

        if sequential {
            return self.read_prefix_then_direct(&entry, offset, length).await;
        }

        let bytes = self.read_direct(offset, length).await?;
        self.manager.counters().record_fallback(0, length);
        Ok(bytes)
    }

    /// Whether a read ending at `end` is close enough to the watermark to be
    /// worth waiting for
    fn within_lookahead(&self, entry: &CacheEntry, end: u64) -> bool {
        let lookahead = self.manager.config().download_chunk_size;
        end <= entry.downloaded_bytes().saturating_add(lookahead)
    }

    /// Release the entry. Dropping the handle does the same.
    pub fn close(self) {
        if let Resolution::Cached(lease) = self.resolution {
            self.manager.release(lease);
        }
    }

    /// Returns true for a sequential read; counts the others toward the
    /// random threshold.
    fn classify(&mut self, offset: u64) -> bool {
        if offset == 0 || Some(offset) == self.last_read_end {
            return true;
        }
        self.non_sequential_reads += 1;
        if !self.random && self.non_sequential_reads >= self.manager.config().random_read_threshold {
            self.random = true;
            debug!(
                "[CACHE_READ] Handle classified as random, bypassing cache: object={}, non_sequential_reads={}",
                self.identity, self.non_sequential_reads
            );
        }
        false
    }

    async fn resolve(&mut self) -> Option<Arc<CacheEntry>> {
        if let Resolution::Unresolved = self.resolution {
            self.resolution = match self.manager.resolve(&self.identity, self.size).await {
                ResolveOutcome::Cached(lease) => Resolution::Cached(lease),
                ResolveOutcome::NoCache(reason) => {
                    debug!(
                        "[CACHE_READ] Reading without cache: object={}, reason={:?}",
                        self.identity, reason
                    );
                    Resolution::NoCache(reason)
                }
            };
        }
        self.entry().cloned()
    }

    async fn read_cached(&self, entry: &CacheEntry, offset: u64, length: u64) -> Result<Bytes> {
        let store = self
            .manager
            .store()
            .ok_or_else(|| CacheError::CacheStoreError("cache store unavailable".to_string()))?;
        let bytes = store.read_at(entry.path(), offset, length as usize).await?;
        entry.touch();
        Ok(bytes)
    }

    /// Serve whatever the watermark covers from the backing file and read the
    /// rest directly from the store
    async fn read_prefix_then_direct(
        &self,
        entry: &CacheEntry,
        offset: u64,
        length: u64,
    ) -> Result<Bytes> {
        let end = offset + length;
        let watermark = entry.downloaded_bytes().min(end);
        let cached_len = watermark.saturating_sub(offset);

        if cached_len > 0 && entry.covers(self.identity.generation, offset, cached_len) {
            match self.read_cached(entry, offset, cached_len).await {
                Ok(prefix) => {
                    let tail = self.read_direct(watermark, end - watermark).await?;
                    let mut buf = BytesMut::with_capacity(length as usize);
                    buf.extend_from_slice(&prefix);
                    buf.extend_from_slice(&tail);
                    self.manager
                        .counters()
                        .record_fallback(cached_len, length - cached_len);
                    return Ok(buf.freeze());
                }
                Err(e) => self.manager.invalidate_entry(entry, &e.to_string()),
            }
        }

        let bytes = self.read_direct(offset, length).await?;
        self.manager.counters().record_fallback(0, length);
        Ok(bytes)
    }

    async fn read_direct(&self, offset: u64, length: u64) -> Result<Bytes> {
        let bytes = self
            .manager
            .client()
            .read_range(&self.identity, offset, length)
            .await?;
        if bytes.len() as u64 != length {
            return Err(CacheError::InvariantViolation(format!(
                "direct read of {} at {} returned {} of {} bytes",
                self.identity,
                offset,
                bytes.len(),
                length
            )));
        }
        Ok(bytes)
    }
}
