//! Cache Entry Module
//!
//! In-memory record for one (object, generation) pair: where its backing file
//! lives, how many bytes have been durably written (the watermark), its
//! lifecycle status, how many readers hold it, and when it was last read.
//!
//! All mutable fields sit behind one per-entry lock so reads on different
//! entries never contend. Every change of watermark or status is also published
//! on a watch channel, which is what blocked readers wait on.

use crate::object_client::ObjectIdentity;
use crate::{CacheError, Result};
use parking_lot::Mutex;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::sync::{watch, OnceCell};

/// Lifecycle status of a cache entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EntryStatus {
    /// Admitted, no download started yet
    Pending,
    /// A download job is advancing the watermark
    Downloading,
    /// Watermark equals the object size
    Complete,
    /// The download stopped on an error; bytes below the watermark stay valid
    Failed,
    /// The download was stopped on request; bytes below the watermark stay valid
    Cancelled,
    /// Superseded or declared stale; never served again
    Invalidated,
    /// Selected for deletion
    Evicting,
}

impl EntryStatus {
    /// Whether bytes below the watermark may be served to readers
    pub fn is_servable(&self) -> bool {
        !matches!(self, EntryStatus::Invalidated | EntryStatus::Evicting)
    }

    /// Whether the watermark can still move
    pub fn is_advancing(&self) -> bool {
        matches!(self, EntryStatus::Pending | EntryStatus::Downloading)
    }
}

/// Watermark and status as published to waiting readers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub downloaded_bytes: u64,
    pub status: EntryStatus,
}

struct EntryState {
    metageneration: i64,
    status: EntryStatus,
    downloaded_bytes: u64,
    reader_count: usize,
    last_access: Instant,
    /// Cancellation switch of the live download job, if any
    job_cancel: Option<watch::Sender<bool>>,
    failure: Option<String>,
}

/// One cached object version
pub struct CacheEntry {
    seq: u64,
    key: String,
    bucket: String,
    name: String,
    generation: i64,
    total_size: u64,
    path: PathBuf,
    state: Mutex<EntryState>,
    progress: watch::Sender<Progress>,
    /// Set once the backing file was created for this entry
    backing: OnceCell<()>,
}

impl CacheEntry {
    /// New entry with an empty backing file
    pub fn new(seq: u64, identity: &ObjectIdentity, total_size: u64, path: PathBuf) -> Self {
        Self::with_state(seq, identity, total_size, path, EntryStatus::Pending, 0)
    }

    /// Entry adopting a fully downloaded file from a previous run
    pub fn new_complete(
        seq: u64,
        identity: &ObjectIdentity,
        total_size: u64,
        path: PathBuf,
    ) -> Self {
        Self::with_state(
            seq,
            identity,
            total_size,
            path,
            EntryStatus::Complete,
            total_size,
        )
    }

    fn with_state(
        seq: u64,
        identity: &ObjectIdentity,
        total_size: u64,
        path: PathBuf,
        status: EntryStatus,
        downloaded_bytes: u64,
    ) -> Self {
        let (progress, _) = watch::channel(Progress {
            downloaded_bytes,
            status,
        });
        let backing = if status == EntryStatus::Complete {
            OnceCell::new_with(Some(()))
        } else {
            OnceCell::new()
        };
        Self {
            seq,
            key: identity.object_path(),
            bucket: identity.bucket.clone(),
            name: identity.name.clone(),
            generation: identity.generation,
            total_size,
            path,
            state: Mutex::new(EntryState {
                metageneration: identity.metageneration,
                status,
                downloaded_bytes,
                reader_count: 0,
                last_access: Instant::now(),
                job_cancel: None,
                failure: None,
            }),
            progress,
            backing,
        }
    }

    /// Admission sequence number, unique per manager
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Generation-independent object key (`bucket/name`)
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn generation(&self) -> i64 {
        self.generation
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Identity this entry caches, with the latest metageneration seen
    pub fn identity(&self) -> ObjectIdentity {
        let metageneration = self.state.lock().metageneration;
        ObjectIdentity::new(
            self.bucket.clone(),
            self.name.clone(),
            self.generation,
            metageneration,
        )
    }

    pub fn progress(&self) -> Progress {
        *self.progress.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<Progress> {
        self.progress.subscribe()
    }

    pub fn status(&self) -> EntryStatus {
        self.state.lock().status
    }

    pub fn downloaded_bytes(&self) -> u64 {
        self.state.lock().downloaded_bytes
    }

    pub fn reader_count(&self) -> usize {
        self.state.lock().reader_count
    }

    pub fn last_access(&self) -> Instant {
        self.state.lock().last_access
    }

    /// Reason the last download stopped early
    pub fn failure(&self) -> Option<String> {
        self.state.lock().failure.clone()
    }

    pub(crate) fn backing(&self) -> &OnceCell<()> {
        &self.backing
    }

    pub fn has_live_job(&self) -> bool {
        self.state.lock().job_cancel.is_some()
    }

    /// Whether `[offset, offset + length)` may be served from the backing file
    pub fn covers(&self, generation: i64, offset: u64, length: u64) -> bool {
        let state = self.state.lock();
        generation == self.generation
            && state.status.is_servable()
            && offset.saturating_add(length) <= state.downloaded_bytes
    }

    pub fn touch(&self) {
        self.state.lock().last_access = Instant::now();
    }

    /// Register a reader. Returns false if the entry is being evicted.
    pub(crate) fn acquire_reader(&self) -> bool {
        let mut state = self.state.lock();
        if state.status == EntryStatus::Evicting {
            return false;
        }
        state.reader_count += 1;
        state.last_access = Instant::now();
        true
    }

    /// Drop a reader, returning how many remain
    pub(crate) fn release_reader(&self) -> usize {
        let mut state = self.state.lock();
        state.reader_count = state.reader_count.saturating_sub(1);
        state.last_access = Instant::now();
        state.reader_count
    }

    pub(crate) fn update_metageneration(&self, metageneration: i64) {
        let mut state = self.state.lock();
        if metageneration > state.metageneration {
            state.metageneration = metageneration;
        }
    }

    /// Move Pending -> Downloading and install the job's cancel switch.
    ///
    /// Returns false when a job already ran or is running for this entry.
    pub(crate) fn begin_download(&self, cancel: watch::Sender<bool>) -> bool {
        let mut state = self.state.lock();
        if state.status != EntryStatus::Pending || state.job_cancel.is_some() {
            return false;
        }
        state.status = EntryStatus::Downloading;
        state.job_cancel = Some(cancel);
        self.publish(&state);
        true
    }

    /// Advance the watermark after a durable write.
    ///
    /// Fails when the download was stopped underneath the job, or when the new
    /// value would regress or pass the declared object size.
    pub(crate) fn advance(&self, downloaded_bytes: u64) -> Result<()> {
        let mut state = self.state.lock();
        if state.status != EntryStatus::Downloading {
            return Err(CacheError::Cancelled(format!(
                "{} is {:?}",
                self.key, state.status
            )));
        }
        if downloaded_bytes < state.downloaded_bytes {
            return Err(CacheError::InvariantViolation(format!(
                "watermark of {} would regress from {} to {}",
                self.key, state.downloaded_bytes, downloaded_bytes
            )));
        }
        if downloaded_bytes > self.total_size {
            return Err(CacheError::InvariantViolation(format!(
                "watermark of {} would pass object size {} ({})",
                self.key, self.total_size, downloaded_bytes
            )));
        }
        state.downloaded_bytes = downloaded_bytes;
        self.publish(&state);
        Ok(())
    }

    /// Downloading -> Complete once every byte is on disk
    pub(crate) fn complete(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.status != EntryStatus::Downloading {
            return Err(CacheError::Cancelled(format!(
                "{} is {:?}",
                self.key, state.status
            )));
        }
        if state.downloaded_bytes != self.total_size {
            return Err(CacheError::InvariantViolation(format!(
                "{} completed at {} of {} bytes",
                self.key, state.downloaded_bytes, self.total_size
            )));
        }
        state.status = EntryStatus::Complete;
        state.job_cancel = None;
        self.publish(&state);
        Ok(())
    }

    /// Downloading -> Failed, keeping the partial bytes
    pub(crate) fn fail(&self, reason: String) {
        let mut state = self.state.lock();
        state.job_cancel = None;
        if state.status == EntryStatus::Downloading {
            state.status = EntryStatus::Failed;
            state.failure = Some(reason);
            self.publish(&state);
        }
    }

    /// Downloading -> Cancelled, keeping the partial bytes
    pub(crate) fn mark_cancelled(&self) {
        let mut state = self.state.lock();
        state.job_cancel = None;
        if state.status == EntryStatus::Downloading {
            state.status = EntryStatus::Cancelled;
            self.publish(&state);
        }
    }

    /// Ask the live job, if any, to stop at its next chunk boundary
    pub(crate) fn cancel_job(&self) -> bool {
        let mut state = self.state.lock();
        match state.job_cancel.take() {
            Some(cancel) => {
                let _ = cancel.send(true);
                if state.status == EntryStatus::Downloading {
                    state.status = EntryStatus::Cancelled;
                    self.publish(&state);
                }
                true
            }
            None => false,
        }
    }

    /// Mark the entry stale and stop its job. Returns false if it already was.
    pub(crate) fn invalidate(&self) -> bool {
        let mut state = self.state.lock();
        if matches!(
            state.status,
            EntryStatus::Invalidated | EntryStatus::Evicting
        ) {
            return false;
        }
        if let Some(cancel) = state.job_cancel.take() {
            let _ = cancel.send(true);
        }
        state.status = EntryStatus::Invalidated;
        self.publish(&state);
        true
    }

    /// Claim the entry for deletion. Only succeeds with zero readers.
    pub(crate) fn begin_eviction(&self) -> bool {
        let mut state = self.state.lock();
        if state.reader_count > 0 || state.status == EntryStatus::Evicting {
            return false;
        }
        if let Some(cancel) = state.job_cancel.take() {
            let _ = cancel.send(true);
        }
        state.status = EntryStatus::Evicting;
        self.publish(&state);
        true
    }

    /// Snapshot used by the eviction policy
    pub(crate) fn eviction_view(&self) -> (EntryStatus, usize, Instant, u64) {
        let state = self.state.lock();
        (
            state.status,
            state.reader_count,
            state.last_access,
            state.downloaded_bytes,
        )
    }

    /// Wait until the watermark reaches `target`, the download stops, or
    /// `timeout` expires, and return the last observed progress.
    pub async fn wait_for_watermark(&self, target: u64, timeout: Duration) -> Progress {
        let mut rx = self.progress.subscribe();
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let progress = *rx.borrow_and_update();
            if progress.downloaded_bytes >= target || !progress.status.is_advancing() {
                return progress;
            }
            match tokio::time::timeout_at(deadline, rx.changed()).await {
                Ok(Ok(())) => continue,
                // Sender lives as long as the entry, so a closed channel only
                // happens during teardown
                Ok(Err(_)) | Err(_) => return *rx.borrow(),
            }
        }
    }

    fn publish(&self, state: &EntryState) {
        self.progress.send_replace(Progress {
            downloaded_bytes: state.downloaded_bytes,
            status: state.status,
        });
    }
}

impl std::fmt::Debug for CacheEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("CacheEntry")
            .field("seq", &self.seq)
            .field("key", &self.key)
            .field("generation", &self.generation)
            .field("total_size", &self.total_size)
            .field("status", &state.status)
            .field("downloaded_bytes", &state.downloaded_bytes)
            .field("reader_count", &state.reader_count)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn test_entry(size: u64) -> CacheEntry {
        let id = ObjectIdentity::new("bucket", "foo", 5, 1);
        CacheEntry::new(1, &id, size, PathBuf::from("/cache/foo_5.bin"))
    }

    #[test]
    fn test_watermark_is_monotonic_and_bounded() {
        let entry = test_entry(100);
        let (cancel, _rx) = watch::channel(false);
        assert!(entry.begin_download(cancel));

        entry.advance(40).unwrap();
        entry.advance(40).unwrap();
        assert!(matches!(
            entry.advance(30),
            Err(CacheError::InvariantViolation(_))
        ));
        assert!(matches!(
            entry.advance(101),
            Err(CacheError::InvariantViolation(_))
        ));
        assert_eq!(entry.downloaded_bytes(), 40);

        assert!(entry.complete().is_err());
        entry.advance(100).unwrap();
        entry.complete().unwrap();
        assert_eq!(entry.status(), EntryStatus::Complete);
        assert!(!entry.has_live_job());
    }

    #[test]
    fn test_only_one_download_per_entry() {
        let entry = test_entry(10);
        let (first, _rx1) = watch::channel(false);
        let (second, _rx2) = watch::channel(false);
        assert!(entry.begin_download(first));
        assert!(!entry.begin_download(second));
    }

    #[test]
    fn test_covers_checks_generation_and_status() {
        let entry = test_entry(100);
        let (cancel, _rx) = watch::channel(false);
        entry.begin_download(cancel);
        entry.advance(50).unwrap();

        assert!(entry.covers(5, 0, 50));
        assert!(!entry.covers(5, 10, 50));
        assert!(!entry.covers(6, 0, 10));

        assert!(entry.invalidate());
        assert!(!entry.covers(5, 0, 10));
        assert!(!entry.invalidate());
    }

    #[test]
    fn test_readers_block_eviction() {
        let entry = test_entry(10);
        assert!(entry.acquire_reader());
        assert!(!entry.begin_eviction());
        assert_eq!(entry.release_reader(), 0);
        assert!(entry.begin_eviction());
        assert!(!entry.acquire_reader());
    }

    #[test]
    fn test_invalidate_signals_job_cancellation() {
        let entry = test_entry(10);
        let (cancel, rx) = watch::channel(false);
        entry.begin_download(cancel);
        entry.invalidate();
        assert!(*rx.borrow());
        assert!(matches!(entry.advance(5), Err(CacheError::Cancelled(_))));
    }

    #[test]
    fn test_failed_download_keeps_partial_bytes() {
        let entry = test_entry(10);
        let (cancel, _rx) = watch::channel(false);
        entry.begin_download(cancel);
        entry.advance(4).unwrap();
        entry.fail("connection reset".to_string());

        assert_eq!(entry.status(), EntryStatus::Failed);
        assert!(entry.covers(5, 0, 4));
        assert_eq!(entry.failure().as_deref(), Some("connection reset"));
    }

    #[tokio::test]
    async fn test_wait_for_watermark_wakes_on_progress() {
        let entry = Arc::new(test_entry(100));
        let (cancel, _rx) = watch::channel(false);
        entry.begin_download(cancel);

        let writer = Arc::clone(&entry);
        let task = tokio::spawn(async move {
            for step in 1..=10u64 {
                tokio::time::sleep(Duration::from_millis(5)).await;
                writer.advance(step * 10).unwrap();
            }
        });

        let progress = entry.wait_for_watermark(60, Duration::from_secs(5)).await;
        assert!(progress.downloaded_bytes >= 60);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_for_watermark_times_out() {
        let entry = test_entry(100);
        let (cancel, _rx) = watch::channel(false);
        entry.begin_download(cancel);
        entry.advance(10).unwrap();

        let progress = entry
            .wait_for_watermark(50, Duration::from_millis(20))
            .await;
        assert_eq!(progress.downloaded_bytes, 10);
        assert_eq!(progress.status, EntryStatus::Downloading);
    }
}
