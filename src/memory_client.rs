//! In-memory object client.
//!
//! Holds objects in process memory and accounts for every byte handed out, so
//! tests and demos can assert how much traffic the cache generated. Failure,
//! latency and concurrent-mutation injection hooks cover the cache's fallback
//! paths.

use crate::object_client::{object_path, ByteStream, ObjectAttrs, ObjectClient, ObjectIdentity};
use crate::{CacheError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Default size of the chunks yielded by [`ObjectClient::read_full`]
const DEFAULT_STREAM_CHUNK_SIZE: usize = 256 * 1024;

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    generation: i64,
    metageneration: i64,
}

/// Fault and latency injection applied to full-object streams
#[derive(Debug, Clone, Default)]
struct StreamBehavior {
    chunk_delay: Option<Duration>,
    fail_after: Option<u64>,
    extra_bytes: usize,
}

/// Traffic counters
#[derive(Debug, Default)]
struct ClientStats {
    stat_calls: AtomicU64,
    range_calls: AtomicU64,
    range_bytes: AtomicU64,
    full_calls: AtomicU64,
    full_bytes: AtomicU64,
}

/// Object client backed by a process-local map, used by tests and demos
pub struct MemoryObjectClient {
    objects: RwLock<HashMap<String, StoredObject>>,
    behavior: RwLock<StreamBehavior>,
    stream_chunk_size: usize,
    next_generation: AtomicI64,
    /// Range reads still to be answered with a transient error
    range_failures: AtomicU64,
    stats: Arc<ClientStats>,
}

impl MemoryObjectClient {
    pub fn new() -> Self {
        Self::with_stream_chunk_size(DEFAULT_STREAM_CHUNK_SIZE)
    }

    /// Create a client whose full-object streams yield chunks of `chunk_size` bytes
    pub fn with_stream_chunk_size(chunk_size: usize) -> Self {
        Self {
            objects: RwLock::new(HashMap::new()),
            behavior: RwLock::new(StreamBehavior::default()),
            stream_chunk_size: chunk_size.max(1),
            next_generation: AtomicI64::new(1),
            range_failures: AtomicU64::new(0),
            stats: Arc::new(ClientStats::default()),
        }
    }

    /// Create or overwrite an object. Every call assigns a new generation.
    pub fn put_object(&self, bucket: &str, name: &str, data: impl Into<Bytes>) -> ObjectIdentity {
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let stored = StoredObject {
            data: data.into(),
            generation,
            metageneration: 1,
        };
        self.objects
            .write()
            .insert(object_path(bucket, name), stored);
        ObjectIdentity::new(bucket, name, generation, 1)
    }

    /// Bump the metageneration without touching the content
    pub fn update_metadata(&self, bucket: &str, name: &str) -> Result<ObjectIdentity> {
        let mut objects = self.objects.write();
        let stored = objects
            .get_mut(&object_path(bucket, name))
            .ok_or_else(|| CacheError::NotFound(object_path(bucket, name)))?;
        stored.metageneration += 1;
        Ok(ObjectIdentity::new(
            bucket,
            name,
            stored.generation,
            stored.metageneration,
        ))
    }

    pub fn delete_object(&self, bucket: &str, name: &str) -> bool {
        self.objects
            .write()
            .remove(&object_path(bucket, name))
            .is_some()
    }

    /// Sleep this long before yielding each streamed chunk
    pub fn set_chunk_delay(&self, delay: Option<Duration>) {
        self.behavior.write().chunk_delay = delay;
    }

    /// Fail full-object streams with a transient error once the next chunk
    /// would cross `limit` bytes
    pub fn fail_full_reads_after(&self, limit: Option<u64>) {
        self.behavior.write().fail_after = limit;
    }

    /// Fail the next `count` range reads with a transient error
    pub fn fail_next_range_reads(&self, count: u64) {
        self.range_failures.store(count, Ordering::SeqCst);
    }

    /// Append `extra` bytes to every full-object stream, as if the object grew
    /// while it was being read
    pub fn set_stream_extra_bytes(&self, extra: usize) {
        self.behavior.write().extra_bytes = extra;
    }

    pub fn stat_calls(&self) -> u64 {
        self.stats.stat_calls.load(Ordering::Relaxed)
    }

    pub fn range_calls(&self) -> u64 {
        self.stats.range_calls.load(Ordering::Relaxed)
    }

    /// Bytes returned by range reads
    pub fn range_bytes(&self) -> u64 {
        self.stats.range_bytes.load(Ordering::Relaxed)
    }

    pub fn full_calls(&self) -> u64 {
        self.stats.full_calls.load(Ordering::Relaxed)
    }

    /// Bytes yielded by full-object streams
    pub fn full_bytes(&self) -> u64 {
        self.stats.full_bytes.load(Ordering::Relaxed)
    }

    /// All bytes that crossed the "network"
    pub fn total_bytes_fetched(&self) -> u64 {
        self.range_bytes() + self.full_bytes()
    }

    fn lookup(&self, id: &ObjectIdentity) -> Result<StoredObject> {
        let objects = self.objects.read();
        let stored = objects
            .get(&id.object_path())
            .ok_or_else(|| CacheError::NotFound(id.object_path()))?;
        if stored.generation != id.generation {
            return Err(CacheError::GenerationMismatch {
                object: id.object_path(),
                expected: id.generation,
                actual: stored.generation,
            });
        }
        Ok(stored.clone())
    }
}

impl Default for MemoryObjectClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ObjectClient for MemoryObjectClient {
    async fn stat_object(&self, bucket: &str, name: &str) -> Result<ObjectAttrs> {
        self.stats.stat_calls.fetch_add(1, Ordering::Relaxed);
        let objects = self.objects.read();
        let stored = objects
            .get(&object_path(bucket, name))
            .ok_or_else(|| CacheError::NotFound(object_path(bucket, name)))?;
        Ok(ObjectAttrs {
            size: stored.data.len() as u64,
            generation: stored.generation,
            metageneration: stored.metageneration,
        })
    }

    async fn read_range(&self, id: &ObjectIdentity, offset: u64, length: u64) -> Result<Bytes> {
        self.stats.range_calls.fetch_add(1, Ordering::Relaxed);
        if self
            .range_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(CacheError::TransientError(format!(
                "injected range read failure for {}",
                id
            )));
        }
        let stored = self.lookup(id)?;
        let size = stored.data.len() as u64;
        if offset > size {
            return Err(CacheError::InvalidRange(format!(
                "offset {} beyond size {} of {}",
                offset, size, id
            )));
        }
        let end = offset.saturating_add(length).min(size);
        let slice = stored.data.slice(offset as usize..end as usize);
        self.stats
            .range_bytes
            .fetch_add(slice.len() as u64, Ordering::Relaxed);
        Ok(slice)
    }

    async fn read_full(&self, id: &ObjectIdentity) -> Result<ByteStream> {
        self.stats.full_calls.fetch_add(1, Ordering::Relaxed);
        let stored = self.lookup(id)?;
        let behavior = self.behavior.read().clone();

        let data = stored.data;
        let mut items: Vec<Result<Bytes>> = Vec::new();
        let mut pos = 0usize;
        let mut failed = false;
        while pos < data.len() {
            let end = (pos + self.stream_chunk_size).min(data.len());
            if let Some(limit) = behavior.fail_after {
                if end as u64 > limit {
                    items.push(Err(CacheError::TransientError(format!(
                        "connection reset while streaming {} at offset {}",
                        id, pos
                    ))));
                    failed = true;
                    break;
                }
            }
            items.push(Ok(data.slice(pos..end)));
            pos = end;
        }
        if !failed && behavior.extra_bytes > 0 {
            items.push(Ok(Bytes::from(vec![0u8; behavior.extra_bytes])));
        }

        let stats = Arc::clone(&self.stats);
        let delay = behavior.chunk_delay;
        let stream = stream::iter(items)
            .then(move |item| {
                let stats = Arc::clone(&stats);
                async move {
                    if let Some(delay) = delay {
                        tokio::time::sleep(delay).await;
                    }
                    if let Ok(chunk) = &item {
                        stats
                            .full_bytes
                            .fetch_add(chunk.len() as u64, Ordering::Relaxed);
                    }
                    item
                }
            })
            .boxed();
        Ok(stream)
    }
}
