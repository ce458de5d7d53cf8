//! HTTP object client tests against a minimal in-process object gateway
//!
//! The gateway speaks just enough HTTP/1.1 for HEAD, ranged GET and full GET
//! with generation pinning, closing the connection after every response.

use bucket_fs_cache::cache_handle::CacheHandle;
use bucket_fs_cache::cache_manager::CacheManager;
use bucket_fs_cache::config::{FileCacheConfig, ObjectStoreConfig};
use bucket_fs_cache::http_client::HttpObjectClient;
use bucket_fs_cache::{CacheError, ObjectClient};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

#[derive(Default)]
struct Gateway {
    objects: Mutex<HashMap<String, (Vec<u8>, i64)>>,
    requests: AtomicUsize,
    /// Answer this many upcoming requests with 503
    unavailable: AtomicUsize,
}

impl Gateway {
    fn put(&self, path: &str, data: Vec<u8>, generation: i64) {
        self.objects
            .lock()
            .unwrap()
            .insert(path.to_string(), (data, generation));
    }

    fn respond(&self, request: &str) -> Vec<u8> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        if self
            .unavailable
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return response(503, &[], &[], false);
        }

        let mut lines = request.lines();
        let mut parts = lines.next().unwrap_or_default().split_whitespace();
        let method = parts.next().unwrap_or_default();
        let target = parts.next().unwrap_or_default();
        let (path, query) = target.split_once('?').unwrap_or((target, ""));
        let range = lines
            .filter_map(|l| l.split_once(':'))
            .find(|(name, _)| name.eq_ignore_ascii_case("range"))
            .map(|(_, value)| value.trim().trim_start_matches("bytes=").to_string());

        let objects = self.objects.lock().unwrap();
        let Some((data, generation)) = objects.get(path.trim_start_matches('/')) else {
            return response(404, &[], &[], false);
        };
        let generation_header = ("x-goog-generation", generation.to_string());
        if let Some(pinned) = query.strip_prefix("generation=") {
            if pinned.parse::<i64>().ok() != Some(*generation) {
                return response(412, &[generation_header], &[], false);
            }
        }

        if method == "HEAD" {
            let headers = [
                generation_header,
                ("x-goog-metageneration", "3".to_string()),
                ("content-length", data.len().to_string()),
            ];
            return response(200, &headers, &[], true);
        }

        match range {
            Some(bounds) => {
                let (first, last) = bounds.split_once('-').unwrap();
                let first: usize = first.parse().unwrap();
                let last: usize = last.parse::<usize>().unwrap().min(data.len() - 1);
                response(206, &[generation_header], &data[first..=last], false)
            }
            None => response(200, &[generation_header], data, false),
        }
    }
}

fn response(status: u16, headers: &[(&str, String)], body: &[u8], head: bool) -> Vec<u8> {
    let mut out = format!("HTTP/1.1 {} X\r\nconnection: close\r\n", status);
    for (name, value) in headers {
        out.push_str(&format!("{}: {}\r\n", name, value));
    }
    if !head {
        out.push_str(&format!("content-length: {}\r\n", body.len()));
    }
    out.push_str("\r\n");
    let mut bytes = out.into_bytes();
    bytes.extend_from_slice(body);
    bytes
}

async fn serve_connection(gateway: Arc<Gateway>, mut socket: TcpStream) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
        match socket.read(&mut chunk).await {
            Ok(0) | Err(_) => return,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
        }
    }
    let reply = gateway.respond(&String::from_utf8_lossy(&buf));
    let _ = socket.write_all(&reply).await;
    let _ = socket.shutdown().await;
}

async fn start_gateway() -> (Arc<Gateway>, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let endpoint = format!("http://{}", listener.local_addr().unwrap());
    let gateway = Arc::new(Gateway::default());
    let accept = gateway.clone();
    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            tokio::spawn(serve_connection(accept.clone(), socket));
        }
    });
    (gateway, endpoint)
}

fn client_for(endpoint: &str) -> HttpObjectClient {
    HttpObjectClient::new(&ObjectStoreConfig {
        endpoint: endpoint.to_string(),
        request_timeout: Duration::from_secs(5),
        max_retries: 2,
        initial_retry_delay: Duration::from_millis(5),
        max_retry_delay: Duration::from_millis(20),
    })
    .unwrap()
}

#[tokio::test]
async fn test_stat_and_reads() {
    let (gateway, endpoint) = start_gateway().await;
    let data: Vec<u8> = (0..100_000).map(|i| (i % 256) as u8).collect();
    gateway.put("bucket/dir/file.bin", data.clone(), 42);
    let client = client_for(&endpoint);

    let attrs = client.stat_object("bucket", "dir/file.bin").await.unwrap();
    assert_eq!(attrs.size, 100_000);
    assert_eq!(attrs.generation, 42);
    assert_eq!(attrs.metageneration, 3);

    let id = bucket_fs_cache::ObjectIdentity::from_attrs("bucket", "dir/file.bin", &attrs);
    let range = client.read_range(&id, 1000, 500).await.unwrap();
    assert_eq!(&range[..], &data[1000..1500]);

    let mut stream = client.read_full(&id).await.unwrap();
    let mut full = Vec::new();
    while let Some(chunk) = stream.next().await {
        full.extend_from_slice(&chunk.unwrap());
    }
    assert_eq!(full, data);
}

#[tokio::test]
async fn test_error_mapping() {
    let (gateway, endpoint) = start_gateway().await;
    gateway.put("bucket/obj", vec![1, 2, 3], 5);
    let client = client_for(&endpoint);

    assert!(matches!(
        client.stat_object("bucket", "missing").await,
        Err(CacheError::NotFound(_))
    ));

    let stale = bucket_fs_cache::ObjectIdentity::new("bucket", "obj", 4, 1);
    match client.read_range(&stale, 0, 3).await {
        Err(CacheError::GenerationMismatch { expected, actual, .. }) => {
            assert_eq!(expected, 4);
            assert_eq!(actual, 5);
        }
        other => panic!("expected generation mismatch, got {:?}", other.map(|b| b.len())),
    }
    assert!(matches!(
        client.read_full(&stale).await.map(|_| ()),
        Err(CacheError::GenerationMismatch { .. })
    ));
}

#[tokio::test]
async fn test_transient_errors_are_retried() {
    let (gateway, endpoint) = start_gateway().await;
    gateway.put("bucket/obj", vec![9; 10], 1);
    let client = client_for(&endpoint);

    gateway.unavailable.store(2, Ordering::SeqCst);
    let attrs = client.stat_object("bucket", "obj").await.unwrap();
    assert_eq!(attrs.size, 10);
    assert_eq!(gateway.requests.load(Ordering::SeqCst), 3);

    gateway.unavailable.store(5, Ordering::SeqCst);
    assert!(matches!(
        client.stat_object("bucket", "obj").await,
        Err(CacheError::TransientError(_))
    ));
}

#[tokio::test]
async fn test_cache_over_http_downloads_once() {
    let (gateway, endpoint) = start_gateway().await;
    let data: Vec<u8> = (0..3 << 20).map(|i| (i % 241) as u8).collect();
    gateway.put("bucket/big.bin", data.clone(), 7);
    let client: Arc<dyn ObjectClient> = Arc::new(client_for(&endpoint));

    let temp_dir = TempDir::new().unwrap();
    let mut config = FileCacheConfig::with_dir(temp_dir.path(), 64 << 20);
    config.download_chunk_size = 1 << 20;
    config.sequential_read_wait_timeout = Duration::from_secs(10);
    let manager = CacheManager::new(config, client).await;

    let (id, size) = manager.stat("bucket", "big.bin").await.unwrap();
    for _ in 0..2 {
        let mut handle = CacheHandle::open(manager.clone(), id.clone(), size);
        let mut out = Vec::new();
        while (out.len() as u64) < size {
            out.extend_from_slice(&handle.read(out.len() as u64, 1 << 20).await.unwrap());
        }
        assert_eq!(out, data);
        handle.close();
    }

    // One HEAD plus one streamed GET
    assert_eq!(gateway.requests.load(Ordering::SeqCst), 2);
    assert_eq!(manager.metrics().jobs_completed, 1);
}
