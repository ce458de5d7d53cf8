//! Concurrent reader tests
//!
//! Handles opened at the same time on the same object version share one
//! cache entry and one download, and all observe the same bytes.

use bucket_fs_cache::cache_handle::CacheHandle;
use bucket_fs_cache::cache_manager::{CacheManager, ResolveOutcome};
use bucket_fs_cache::config::FileCacheConfig;
use bucket_fs_cache::memory_client::MemoryObjectClient;
use bucket_fs_cache::ObjectIdentity;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const MIB: u64 = 1 << 20;

async fn setup(
    temp_dir: &TempDir,
    size: usize,
) -> (Arc<CacheManager>, Arc<MemoryObjectClient>, ObjectIdentity, Vec<u8>) {
    let client = Arc::new(MemoryObjectClient::with_stream_chunk_size(128 * 1024));
    client.set_chunk_delay(Some(Duration::from_millis(2)));
    let data: Vec<u8> = (0..size).map(|i| (i * 31 % 256) as u8).collect();
    let id = client.put_object("bucket", "shared.bin", data.clone());

    let mut config = FileCacheConfig::with_dir(temp_dir.path(), 256 * MIB);
    config.download_chunk_size = 256 * 1024;
    config.sequential_read_wait_timeout = Duration::from_secs(10);
    let manager = CacheManager::new(config, client.clone()).await;
    (manager, client, id, data)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_two_handles_start_one_job() {
    let temp_dir = TempDir::new().unwrap();
    let (manager, client, id, data) = setup(&temp_dir, 2 * MIB as usize).await;

    let mut a = CacheHandle::open(manager.clone(), id.clone(), 2 * MIB);
    let mut b = CacheHandle::open(manager.clone(), id.clone(), 2 * MIB);

    let (ra, rb) = tokio::join!(a.read(0, 64 * 1024), b.read(0, 64 * 1024));
    let (ra, rb) = (ra.unwrap(), rb.unwrap());

    assert_eq!(ra, rb);
    assert_eq!(&ra[..], &data[..64 * 1024]);
    assert!(Arc::ptr_eq(a.entry().unwrap(), b.entry().unwrap()));
    assert_eq!(a.entry().unwrap().reader_count(), 2);
    assert_eq!(manager.metrics().jobs_started, 1);

    a.close();
    b.close();
    manager
        .wait_for_download(&id, Duration::from_secs(10))
        .await
        .unwrap();
    assert_eq!(client.full_calls(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_many_concurrent_readers_see_identical_bytes() {
    let temp_dir = TempDir::new().unwrap();
    let (manager, client, id, data) = setup(&temp_dir, 3 * MIB as usize).await;

    let mut tasks = Vec::new();
    for reader in 0..8u64 {
        let manager = manager.clone();
        let id = id.clone();
        tasks.push(tokio::spawn(async move {
            let mut handle = CacheHandle::open(manager, id, 3 * MIB);
            let block = 100_000 + reader * 10_000;
            let mut out = Vec::new();
            let mut offset = 0;
            while offset < 3 * MIB {
                let bytes = handle.read(offset, block).await.unwrap();
                offset += bytes.len() as u64;
                out.extend_from_slice(&bytes);
            }
            handle.close();
            out
        }));
    }

    for task in tasks {
        let out = task.await.unwrap();
        assert_eq!(out.len(), data.len());
        assert!(out == data, "reader observed different bytes");
    }

    assert_eq!(client.full_calls(), 1);
    assert_eq!(manager.metrics().jobs_started, 1);
    assert_eq!(manager.metrics().entry_count, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_resolve_is_idempotent() {
    let temp_dir = TempDir::new().unwrap();
    let (manager, _client, id, _data) = setup(&temp_dir, MIB as usize).await;

    let mut tasks = Vec::new();
    for _ in 0..16 {
        let manager = manager.clone();
        let id = id.clone();
        tasks.push(tokio::spawn(async move {
            match manager.resolve(&id, MIB).await {
                ResolveOutcome::Cached(lease) => lease,
                ResolveOutcome::NoCache(reason) => panic!("unexpected no-cache: {:?}", reason),
            }
        }));
    }

    let mut leases = Vec::new();
    for task in tasks {
        leases.push(task.await.unwrap());
    }
    let first = leases[0].entry().clone();
    assert!(leases.iter().all(|l| Arc::ptr_eq(l.entry(), &first)));
    assert_eq!(first.reader_count(), 16);

    for lease in leases {
        manager.release(lease);
    }
    assert_eq!(first.reader_count(), 0);
}
