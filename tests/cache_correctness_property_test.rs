//! Property-Based Tests for Read Cache Correctness
//!
//! *For any* sequence of reads on an unmodified object, the bytes returned
//! through a cache handle SHALL equal the bytes of a direct range read at the
//! same offsets, whatever mix of cache hits, waits, fallbacks and random
//! bypasses served them.
//!
//! *For any* range already below the download watermark, a read SHALL NOT
//! touch the object store.

use bucket_fs_cache::cache_handle::CacheHandle;
use bucket_fs_cache::cache_manager::CacheManager;
use bucket_fs_cache::config::FileCacheConfig;
use bucket_fs_cache::memory_client::MemoryObjectClient;
use quickcheck::{Arbitrary, Gen, TestResult};
use quickcheck_macros::quickcheck;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

// ============================================================================
// Test Data Generators
// ============================================================================

/// A read request; `sequential` continues from the previous read's end.
#[derive(Debug, Clone)]
struct ReadOp {
    sequential: bool,
    offset: u32,
    length: u32,
}

impl Arbitrary for ReadOp {
    fn arbitrary(g: &mut Gen) -> Self {
        Self {
            sequential: bool::arbitrary(g),
            offset: u32::arbitrary(g),
            length: u32::arbitrary(g) % 20_000 + 1,
        }
    }
}

/// Cache tunables worth varying
#[derive(Debug, Clone)]
struct Tunables {
    object_size: u32,
    chunk_size: u32,
    random_threshold: u32,
    range_read_caching: bool,
    wait_ms: u64,
}

impl Arbitrary for Tunables {
    fn arbitrary(g: &mut Gen) -> Self {
        Self {
            object_size: u32::arbitrary(g) % 200_000 + 1,
            chunk_size: (u32::arbitrary(g) % 64 + 1) * 1024,
            random_threshold: u32::arbitrary(g) % 5 + 1,
            range_read_caching: bool::arbitrary(g),
            wait_ms: u64::arbitrary(g) % 3 * 50,
        }
    }
}

fn object_bytes(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}

async fn create_manager(
    temp_dir: &TempDir,
    client: Arc<MemoryObjectClient>,
    tunables: &Tunables,
) -> Arc<CacheManager> {
    let mut config = FileCacheConfig::with_dir(temp_dir.path(), 1 << 30);
    config.download_chunk_size = tunables.chunk_size as u64;
    config.random_read_threshold = tunables.random_threshold;
    config.cache_file_for_range_read = tunables.range_read_caching;
    config.sequential_read_wait_timeout = Duration::from_millis(tunables.wait_ms);
    CacheManager::new(config, client).await
}

// ============================================================================
// Properties
// ============================================================================

#[quickcheck]
fn prop_cached_reads_match_direct_reads(tunables: Tunables, ops: Vec<ReadOp>, seed: u8) -> TestResult {
    if ops.is_empty() {
        return TestResult::discard();
    }

    let rt = tokio::runtime::Runtime::new().unwrap();
    rt.block_on(async {
        let temp_dir = TempDir::new().unwrap();
        let client = Arc::new(MemoryObjectClient::with_stream_chunk_size(8 * 1024));
        let data = object_bytes(tunables.object_size as usize, seed);
        let size = data.len() as u64;
        let id = client.put_object("bucket", "prop.bin", data.clone());
        let manager = create_manager(&temp_dir, client.clone(), &tunables).await;

        let mut handle = CacheHandle::open(manager.clone(), id, size);
        let mut next = 0u64;
        for op in &ops {
            let offset = if op.sequential {
                next.min(size)
            } else {
                op.offset as u64 % (size + 1)
            };
            let bytes = match handle.read(offset, op.length as u64).await {
                Ok(bytes) => bytes,
                Err(e) => return TestResult::error(format!("read at {} failed: {}", offset, e)),
            };

            let end = (offset + op.length as u64).min(size);
            if bytes[..] != data[offset as usize..end as usize] {
                return TestResult::error(format!(
                    "bytes differ at offset {} length {} (random={})",
                    offset,
                    op.length,
                    handle.is_random()
                ));
            }
            next = end;
        }

        handle.close();
        manager.shutdown().await;
        TestResult::passed()
    })
}

#[quickcheck]
fn prop_reads_below_watermark_skip_the_store(tunables: Tunables, ops: Vec<ReadOp>) -> TestResult {
    if ops.is_empty() {
        return TestResult::discard();
    }

    let rt = tokio::runtime::Runtime::new().unwrap();
    rt.block_on(async {
        let temp_dir = TempDir::new().unwrap();
        let client = Arc::new(MemoryObjectClient::with_stream_chunk_size(8 * 1024));
        let data = object_bytes(tunables.object_size as usize, 7);
        let size = data.len() as u64;
        let id = client.put_object("bucket", "prop.bin", data.clone());
        let manager = create_manager(&temp_dir, client.clone(), &tunables).await;

        // Fill the cache with one sequential pass
        let mut warm = CacheHandle::open(manager.clone(), id.clone(), size);
        if warm.read(0, 1).await.is_err() {
            return TestResult::error("warm-up read failed");
        }
        let done = manager.wait_for_download(&id, Duration::from_secs(10)).await;
        warm.close();
        if done.map(|p| p.downloaded_bytes) != Some(size) {
            return TestResult::error("download did not complete");
        }

        let fetched_before = client.total_bytes_fetched();
        let mut handle = CacheHandle::open(manager.clone(), id, size);
        for op in &ops {
            // Stay below the random threshold so the handle keeps using the cache
            if handle.is_random() {
                break;
            }
            let offset = op.offset as u64 % (size + 1);
            let bytes = match handle.read(offset, op.length as u64).await {
                Ok(bytes) => bytes,
                Err(e) => return TestResult::error(format!("read failed: {}", e)),
            };
            let end = (offset + op.length as u64).min(size);
            if bytes[..] != data[offset as usize..end as usize] {
                return TestResult::error("bytes differ");
            }
            if !handle.is_random() && client.total_bytes_fetched() != fetched_before {
                return TestResult::error(format!(
                    "read at {} below the watermark hit the store",
                    offset
                ));
            }
        }

        handle.close();
        manager.shutdown().await;
        TestResult::passed()
    })
}
