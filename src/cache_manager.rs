//! Cache Manager Module
//!
//! Owns the entry index and coordinates everything that touches it: entry
//! lookup and creation, download job lifecycle, invalidation, and eviction.
//!
//! Locking: the index sits behind one lock taken only for structural changes
//! and reader registration. Per-entry state has its own lock. When both are
//! needed the index lock is taken first. Neither is held across an await.

use crate::cache_entry::{CacheEntry, EntryStatus, Progress};
use crate::cache_store::CacheStore;
use crate::config::FileCacheConfig;
use crate::download_job::{DownloadJob, JobOutcome};
use crate::eviction::{format_bytes_human, select_victims, EvictionCandidate, EvictionReport};
use crate::metrics::{CacheCounters, CacheMetrics};
use crate::object_client::{ObjectClient, ObjectIdentity};
use crate::Result;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Requests delivered to the background eviction worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerEvent {
    RunEviction,
}

/// Why a resolve did not produce a cache entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoCacheReason {
    /// Caching is switched off, or the cache directory is unusable
    Disabled,
    /// The object alone would exceed the cache budget
    TooLarge,
    /// The cache already holds a newer generation of the object
    StaleGeneration,
    /// The backing file could not be created
    StoreUnavailable,
    ShuttingDown,
}

/// Result of [`CacheManager::resolve`]
#[derive(Debug)]
pub enum ResolveOutcome {
    Cached(EntryLease),
    /// Sentinel telling the caller to read directly from the store
    NoCache(NoCacheReason),
}

/// Registered reader of a cache entry.
///
/// The reader count is released when the lease is dropped, on every exit path.
pub struct EntryLease {
    entry: Arc<CacheEntry>,
    events: mpsc::UnboundedSender<ManagerEvent>,
}

impl EntryLease {
    pub fn entry(&self) -> &Arc<CacheEntry> {
        &self.entry
    }
}

impl Drop for EntryLease {
    fn drop(&mut self) {
        if self.entry.release_reader() == 0 {
            // Last reader gone: the entry may now be an eviction candidate
            let _ = self.events.send(ManagerEvent::RunEviction);
        }
    }
}

impl std::fmt::Debug for EntryLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntryLease")
            .field("entry", &self.entry)
            .finish()
    }
}

/// File left behind by a previous run, not yet claimed by any entry
#[derive(Debug, Clone)]
struct OrphanFile {
    id: u64,
    size: u64,
    version_key: PathBuf,
    found: Instant,
}

#[derive(Default)]
struct CacheIndex {
    entries: HashMap<String, Arc<CacheEntry>>,
    /// Entries replaced in the index, kept until eviction deletes them
    retired: Vec<Arc<CacheEntry>>,
    /// Keyed by file path
    orphans: HashMap<PathBuf, OrphanFile>,
}

/// Top-level coordinator of the read cache
pub struct CacheManager {
    config: FileCacheConfig,
    client: Arc<dyn ObjectClient>,
    /// `None` when caching is disabled or the directory is unusable
    store: Option<CacheStore>,
    index: Mutex<CacheIndex>,
    counters: Arc<CacheCounters>,
    next_seq: AtomicU64,
    events: mpsc::UnboundedSender<ManagerEvent>,
    jobs: Mutex<HashMap<u64, JoinHandle<JobOutcome>>>,
    eviction_lock: tokio::sync::Mutex<()>,
    shutdown: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl CacheManager {
    /// Build the manager and start its eviction worker.
    ///
    /// A cache directory that cannot be prepared never fails construction; the
    /// manager then runs with caching disabled.
    pub async fn new(config: FileCacheConfig, client: Arc<dyn ObjectClient>) -> Arc<Self> {
        let store = if config.is_active() {
            let mut store = CacheStore::new(config.cache_dir.clone());
            match store.initialize() {
                Ok(()) => Some(store),
                Err(e) => {
                    warn!(
                        "[CACHE_INIT] Cache directory unusable, serving all reads from the object store: dir={:?}, error={}",
                        config.cache_dir, e
                    );
                    None
                }
            }
        } else {
            info!("[CACHE_INIT] Read cache disabled");
            None
        };

        let next_seq = AtomicU64::new(1);
        let mut index = CacheIndex::default();

        if let Some(store) = &store {
            match store.available_space() {
                Ok(free) if free < config.max_size => warn!(
                    "[CACHE_INIT] Free space below cache budget: free={}, budget={}",
                    format_bytes_human(free),
                    format_bytes_human(config.max_size)
                ),
                Ok(_) => {}
                Err(e) => debug!("[CACHE_INIT] Could not query free space: {}", e),
            }

            let existing = store.scan();
            // New entries must never be named like a file still on disk
            let last_seq = existing.iter().map(|f| f.seq).max().unwrap_or(0);
            next_seq.store(last_seq + 1, Ordering::Relaxed);

            if config.reuse_existing_files {
                let found = Instant::now();
                for file in existing {
                    let id = next_seq.fetch_add(1, Ordering::Relaxed);
                    index.orphans.insert(
                        file.path,
                        OrphanFile {
                            id,
                            size: file.size,
                            version_key: file.version_key,
                            found,
                        },
                    );
                }
                info!(
                    "[CACHE_INIT] Keeping files from previous run for reuse: count={}",
                    index.orphans.len()
                );
            } else {
                let freed = store.purge().await;
                if freed > 0 {
                    info!(
                        "[CACHE_INIT] Purged files from previous run: freed={}",
                        format_bytes_human(freed)
                    );
                }
            }
        }

        let (events, events_rx) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let has_orphans = !index.orphans.is_empty();

        let manager = Arc::new(Self {
            config,
            client,
            store,
            index: Mutex::new(index),
            counters: Arc::new(CacheCounters::new()),
            next_seq,
            events,
            jobs: Mutex::new(HashMap::new()),
            eviction_lock: tokio::sync::Mutex::new(()),
            shutdown,
            worker: Mutex::new(None),
        });

        let worker = Self::spawn_eviction_worker(Arc::downgrade(&manager), events_rx, shutdown_rx);
        *manager.worker.lock() = Some(worker);

        if has_orphans {
            let _ = manager.events.send(ManagerEvent::RunEviction);
        }
        manager
    }

    fn spawn_eviction_worker(
        manager: Weak<Self>,
        mut events: mpsc::UnboundedReceiver<ManagerEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            debug!("[CACHE_EVICTION] Eviction worker started");
            loop {
                tokio::select! {
                    event = events.recv() => {
                        if event.is_none() {
                            break;
                        }
                        // Collapse a burst of triggers into one pass
                        while events.try_recv().is_ok() {}
                        let Some(manager) = manager.upgrade() else {
                            break;
                        };
                        manager.run_eviction().await;
                    }
                    _ = shutdown.changed() => break,
                }
            }
            debug!("[CACHE_EVICTION] Eviction worker stopped");
        })
    }

    pub fn config(&self) -> &FileCacheConfig {
        &self.config
    }

    pub fn client(&self) -> &Arc<dyn ObjectClient> {
        &self.client
    }

    pub fn store(&self) -> Option<&CacheStore> {
        self.store.as_ref()
    }

    pub fn counters(&self) -> &Arc<CacheCounters> {
        &self.counters
    }

    /// Whether resolves can produce cache entries at all
    pub fn is_enabled(&self) -> bool {
        self.store.is_some() && !self.is_shutting_down()
    }

    fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Current entry indexed under `object_path`, if any
    pub fn entry(&self, object_path: &str) -> Option<Arc<CacheEntry>> {
        self.index.lock().entries.get(object_path).cloned()
    }

    /// Find or create the entry for `id` and register the caller as a reader.
    ///
    /// Concurrent callers for the same identity share one entry. A different
    /// generation replaces the indexed entry and invalidates the old one.
    pub async fn resolve(&self, id: &ObjectIdentity, size: u64) -> ResolveOutcome {
        let Some(store) = &self.store else {
            return self.no_cache(NoCacheReason::Disabled);
        };
        if self.is_shutting_down() {
            return self.no_cache(NoCacheReason::ShuttingDown);
        }
        if size > self.config.max_size {
            debug!(
                "[CACHE_RESOLVE] Object larger than cache budget: object={}, size={}, budget={}",
                id, size, self.config.max_size
            );
            return self.no_cache(NoCacheReason::TooLarge);
        }

        let key = id.object_path();
        let (lease, created) = {
            let mut index = self.index.lock();
            let existing = index.entries.get(&key).cloned();

            match existing {
                Some(entry) if entry.generation() == id.generation && Self::is_reusable(&entry) => {
                    entry.update_metageneration(id.metageneration);
                    if !entry.acquire_reader() {
                        return self.no_cache(NoCacheReason::StoreUnavailable);
                    }
                    (self.lease(entry), false)
                }
                Some(entry) if entry.generation() > id.generation => {
                    debug!(
                        "[CACHE_RESOLVE] Cache holds a newer generation: object={}, cached_generation={}",
                        id,
                        entry.generation()
                    );
                    return self.no_cache(NoCacheReason::StaleGeneration);
                }
                previous => {
                    if let Some(old) = previous {
                        if old.invalidate() {
                            self.counters.record_invalidation();
                        }
                        info!(
                            "[CACHE_RESOLVE] Replacing cache entry: object={}, old_generation={}, old_status={:?}",
                            id,
                            old.generation(),
                            old.status()
                        );
                        index.retired.push(old);
                    }

                    let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
                    let entry = match Self::adopt_orphan(&mut index, store, id, size) {
                        Some((path, true)) => {
                            info!(
                                "[CACHE_RESOLVE] Reusing file from previous run: object={}, size={}, path={:?}",
                                id, size, path
                            );
                            CacheEntry::new_complete(seq, id, size, path)
                        }
                        Some((path, false)) => {
                            debug!(
                                "[CACHE_RESOLVE] Restarting partial file from previous run: object={}, path={:?}",
                                id, path
                            );
                            CacheEntry::new(seq, id, size, path)
                        }
                        None => CacheEntry::new(seq, id, size, store.file_path(id, seq)),
                    };
                    let entry = Arc::new(entry);
                    entry.acquire_reader();
                    index.entries.insert(key, Arc::clone(&entry));
                    (self.lease(entry), true)
                }
            }
        };

        let entry = Arc::clone(lease.entry());
        let prepared = entry
            .backing()
            .get_or_try_init(|| async { store.prepare(entry.path()).await })
            .await;
        if let Err(e) = prepared {
            warn!(
                "[CACHE_RESOLVE] Could not create backing file, reading directly: object={}, error={}",
                id, e
            );
            if entry.invalidate() {
                self.counters.record_invalidation();
            }
            drop(lease);
            return self.no_cache(NoCacheReason::StoreUnavailable);
        }

        if created {
            debug!("[CACHE_RESOLVE] Admitted entry: object={}, size={}", id, size);
            let _ = self.events.send(ManagerEvent::RunEviction);
        }
        ResolveOutcome::Cached(lease)
    }

    /// Claim a file of this exact object version left by a previous run.
    /// Returns its path and whether it is complete; a complete file wins over
    /// partial ones. A partial file is emptied before the new download.
    fn adopt_orphan(
        index: &mut CacheIndex,
        store: &CacheStore,
        id: &ObjectIdentity,
        size: u64,
    ) -> Option<(PathBuf, bool)> {
        if index.orphans.is_empty() {
            return None;
        }
        let version_key = store.version_key(id);
        let (path, complete) = index
            .orphans
            .iter()
            .filter(|(_, o)| o.version_key == version_key)
            .map(|(path, o)| (path, o.size == size))
            .max_by_key(|(_, complete)| *complete)
            .map(|(path, complete)| (path.clone(), complete))?;
        index.orphans.remove(&path);
        Some((path, complete))
    }

    /// Failed or cancelled entries are kept for their current readers only
    fn is_reusable(entry: &CacheEntry) -> bool {
        match entry.status() {
            EntryStatus::Invalidated | EntryStatus::Evicting => false,
            EntryStatus::Failed | EntryStatus::Cancelled => entry.reader_count() > 0,
            _ => true,
        }
    }

    fn lease(&self, entry: Arc<CacheEntry>) -> EntryLease {
        EntryLease {
            entry,
            events: self.events.clone(),
        }
    }

    fn no_cache(&self, reason: NoCacheReason) -> ResolveOutcome {
        self.counters.record_no_cache();
        ResolveOutcome::NoCache(reason)
    }

    /// Give up a reader registration
    pub fn release(&self, lease: EntryLease) {
        drop(lease);
    }

    /// Mark the entry for `object_path` stale, whatever its generation
    pub fn invalidate(&self, object_path: &str) -> bool {
        let entry = self.index.lock().entries.get(object_path).cloned();
        let Some(entry) = entry else {
            return false;
        };
        if !entry.invalidate() {
            return false;
        }
        self.counters.record_invalidation();
        info!(
            "[CACHE_INVALIDATE] Entry invalidated: object={}, generation={}",
            object_path,
            entry.generation()
        );
        let _ = self.events.send(ManagerEvent::RunEviction);
        true
    }

    /// Stop serving `entry` after a local I/O error or a detected mismatch
    pub(crate) fn invalidate_entry(&self, entry: &CacheEntry, reason: &str) {
        if entry.invalidate() {
            self.counters.record_invalidation();
            warn!(
                "[CACHE_INVALIDATE] Entry invalidated: object={}, generation={}, reason={}",
                entry.key(),
                entry.generation(),
                reason
            );
            let _ = self.events.send(ManagerEvent::RunEviction);
        }
    }

    /// Start the download job for a Pending entry. Returns false if one
    /// already ran, is running, or could not be started.
    pub async fn ensure_job(&self, entry: &Arc<CacheEntry>) -> bool {
        let Some(store) = &self.store else {
            return false;
        };
        if entry.status() != EntryStatus::Pending || self.is_shutting_down() {
            return false;
        }

        let file = match store.open_writer(entry.path()).await {
            Ok(file) => file,
            Err(e) => {
                warn!(
                    "[DOWNLOAD_JOB] Could not open backing file for writing: object={}, error={}",
                    entry.key(),
                    e
                );
                if entry.invalidate() {
                    self.counters.record_invalidation();
                }
                return false;
            }
        };

        let (cancel, cancel_rx) = watch::channel(false);
        if !entry.begin_download(cancel) {
            return false;
        }
        self.counters.record_job_started();

        let job = DownloadJob {
            entry: Arc::clone(entry),
            identity: entry.identity(),
            client: Arc::clone(&self.client),
            file,
            chunk_size: self.config.download_chunk_size as usize,
            counters: Arc::clone(&self.counters),
            events: self.events.clone(),
            cancel: cancel_rx,
        };
        let handle = job.spawn();

        let mut jobs = self.jobs.lock();
        jobs.retain(|_, h| !h.is_finished());
        jobs.insert(entry.seq(), handle);
        true
    }

    /// Await the download of `id` until it stops or `timeout` expires.
    ///
    /// Returns `None` when `id` has no cache entry.
    pub async fn wait_for_download(&self, id: &ObjectIdentity, timeout: Duration) -> Option<Progress> {
        let entry = self.entry(&id.object_path())?;
        if entry.generation() != id.generation {
            return None;
        }
        Some(entry.wait_for_watermark(entry.total_size(), timeout).await)
    }

    /// Bytes held by every entry, retired entry and unclaimed file
    pub fn total_size(&self) -> u64 {
        let index = self.index.lock();
        let entries: u64 = index.entries.values().map(|e| e.downloaded_bytes()).sum();
        let retired: u64 = index.retired.iter().map(|e| e.downloaded_bytes()).sum();
        let orphans: u64 = index.orphans.values().map(|o| o.size).sum();
        entries + retired + orphans
    }

    pub fn metrics(&self) -> CacheMetrics {
        let mut snapshot = self.counters.snapshot();
        snapshot.cache_size_bytes = self.total_size();
        snapshot.max_cache_size_bytes = self.config.max_size;
        snapshot.entry_count = self.index.lock().entries.len() as u64;
        snapshot
    }

    /// Delete retired entries, then least-recently-used ones, until the cache
    /// fits its budget. Entries with readers are never touched.
    pub async fn run_eviction(&self) -> EvictionReport {
        let Some(store) = &self.store else {
            return EvictionReport::default();
        };
        let _guard = self.eviction_lock.lock().await;

        let candidates = self.eviction_candidates();
        let plan = select_victims(&candidates, self.config.max_size);
        if plan.victims.is_empty() {
            let total_after = plan.projected_total;
            return EvictionReport {
                total_after,
                over_budget: total_after > self.config.max_size,
                ..EvictionReport::default()
            };
        }

        info!(
            "[CACHE_EVICTION] Starting eviction: usage={} / {}, victims={}, to_free={}",
            format_bytes_human(plan.projected_total + plan.bytes_to_free),
            format_bytes_human(self.config.max_size),
            plan.victims.len(),
            format_bytes_human(plan.bytes_to_free)
        );

        let doomed = self.claim_victims(&plan.victims);

        let mut report = EvictionReport::default();
        for path in doomed {
            let freed = match store.remove(&path).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(
                        "[EVICTION_ERROR] Failed to delete backing file: path={:?}, error={}",
                        path, e
                    );
                    continue;
                }
            };
            report.evicted += 1;
            report.bytes_freed += freed;
            self.counters.record_eviction(freed);
        }

        report.total_after = self.total_size();
        report.over_budget = report.total_after > self.config.max_size;
        info!(
            "[CACHE_EVICTION] Eviction completed: evicted={}, freed={}, new_usage={} / {}",
            report.evicted,
            format_bytes_human(report.bytes_freed),
            format_bytes_human(report.total_after),
            format_bytes_human(self.config.max_size)
        );
        report
    }

    fn eviction_candidates(&self) -> Vec<EvictionCandidate> {
        let index = self.index.lock();
        let mut candidates = Vec::with_capacity(
            index.entries.len() + index.retired.len() + index.orphans.len(),
        );

        let mut push = |entry: &Arc<CacheEntry>, retired: bool| {
            let (status, reader_count, last_access, size) = entry.eviction_view();
            candidates.push(EvictionCandidate {
                id: entry.seq(),
                status,
                reader_count,
                last_access,
                size,
                retired,
            });
        };
        for entry in index.entries.values() {
            push(entry, false);
        }
        for entry in &index.retired {
            push(entry, true);
        }

        for orphan in index.orphans.values() {
            candidates.push(EvictionCandidate {
                id: orphan.id,
                status: EntryStatus::Complete,
                reader_count: 0,
                last_access: orphan.found,
                size: orphan.size,
                retired: false,
            });
        }
        candidates
    }

    /// Mark victims Evicting and unlink them from the index. Returns the files
    /// to delete. Every file belongs to exactly one entry or orphan, so once
    /// unlinked here nothing else can reach it.
    fn claim_victims(&self, victims: &[u64]) -> Vec<PathBuf> {
        let mut index = self.index.lock();
        let mut doomed = Vec::with_capacity(victims.len());

        for &id in victims {
            if let Some(key) = index
                .entries
                .iter()
                .find(|(_, e)| e.seq() == id)
                .map(|(k, _)| k.clone())
            {
                if let Some(entry) = index.entries.get(&key).cloned() {
                    if entry.begin_eviction() {
                        index.entries.remove(&key);
                        doomed.push(entry.path().to_path_buf());
                    }
                }
                continue;
            }

            if let Some(pos) = index.retired.iter().position(|e| e.seq() == id) {
                let entry = Arc::clone(&index.retired[pos]);
                if entry.begin_eviction() {
                    index.retired.swap_remove(pos);
                    doomed.push(entry.path().to_path_buf());
                }
                continue;
            }

            if let Some(path) = index
                .orphans
                .iter()
                .find(|(_, o)| o.id == id)
                .map(|(p, _)| p.clone())
            {
                if index.orphans.remove(&path).is_some() {
                    doomed.push(path);
                }
            }
        }
        doomed
    }

    /// Cancel every live download and stop the eviction worker
    pub async fn shutdown(&self) -> usize {
        if self.shutdown.send_replace(true) {
            return 0;
        }
        info!("[CACHE_SHUTDOWN] Shutting down read cache");

        let mut cancelled = 0;
        {
            let index = self.index.lock();
            for entry in index.entries.values().chain(index.retired.iter()) {
                if entry.cancel_job() {
                    cancelled += 1;
                }
            }
        }

        let jobs: Vec<_> = self.jobs.lock().drain().map(|(_, h)| h).collect();
        for handle in jobs {
            if let Err(e) = handle.await {
                warn!("[CACHE_SHUTDOWN] Download task ended abnormally: {}", e);
            }
        }

        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            let _ = worker.await;
        }

        info!(
            "[CACHE_SHUTDOWN] Read cache stopped: cancelled_jobs={}",
            cancelled
        );
        cancelled
    }

    /// Stat an object and build its identity
    pub async fn stat(&self, bucket: &str, name: &str) -> Result<(ObjectIdentity, u64)> {
        let attrs = self.client.stat_object(bucket, name).await?;
        Ok((ObjectIdentity::from_attrs(bucket, name, &attrs), attrs.size))
    }
}
