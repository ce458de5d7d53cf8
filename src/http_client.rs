//! HTTP Object Client Module
//!
//! [`ObjectClient`] over a GCS-style HTTP endpoint using the Hyper connection
//! pool. Object versions are addressed with a `generation` query parameter, and
//! version counters come back in `x-goog-generation` / `x-goog-metageneration`.
//!
//! Stat and range reads are retried with exponential backoff on transient
//! failures. Full-object streams are never retried; the download job treats a
//! broken stream as a failed download.

use crate::config::ObjectStoreConfig;
use crate::object_client::{ByteStream, ObjectAttrs, ObjectClient, ObjectIdentity};
use crate::{CacheError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt};
use http_body_util::{BodyExt, Empty};
use hyper::body::Incoming;
use hyper::header::{HeaderMap, CONTENT_LENGTH, RANGE};
use hyper::{Method, Request, Response, StatusCode, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const GENERATION_HEADER: &str = "x-goog-generation";
const METAGENERATION_HEADER: &str = "x-goog-metageneration";

/// Characters escaped in bucket and object names. `/` stays literal so
/// object names keep their directory structure in the URL path.
const PATH_ENCODE_SET: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}');

/// Request retry configuration
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: usize,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `attempt` (0-based), capped at `max_delay`
    pub fn delay_for(&self, attempt: usize) -> Duration {
        let delay_ms =
            self.initial_delay.as_millis() as f64 * self.backoff_multiplier.powi(attempt as i32);
        let delay = Duration::from_millis(delay_ms as u64);
        if delay > self.max_delay {
            self.max_delay
        } else {
            delay
        }
    }
}

/// Object store client speaking plain HTTP
pub struct HttpObjectClient {
    client: Client<HttpConnector, Empty<Bytes>>,
    endpoint: String,
    request_timeout: Duration,
    retry: RetryConfig,
}

impl HttpObjectClient {
    pub fn new(config: &ObjectStoreConfig) -> Result<Self> {
        config.validate().map_err(CacheError::ConfigError)?;

        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(config.request_timeout));
        connector.set_nodelay(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(90))
            .build(connector);

        debug!(
            "Created object store client: endpoint={}, timeout={:?}, max_retries={}",
            config.endpoint, config.request_timeout, config.max_retries
        );

        Ok(Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            request_timeout: config.request_timeout,
            retry: RetryConfig {
                max_retries: config.max_retries,
                initial_delay: config.initial_retry_delay,
                max_delay: config.max_retry_delay,
                ..RetryConfig::default()
            },
        })
    }

    /// `{endpoint}/{bucket}/{name}` with an optional generation pin
    pub fn object_uri(&self, bucket: &str, name: &str, generation: Option<i64>) -> Result<Uri> {
        let mut uri = format!(
            "{}/{}/{}",
            self.endpoint,
            utf8_percent_encode(bucket, PATH_ENCODE_SET),
            utf8_percent_encode(name.trim_start_matches('/'), PATH_ENCODE_SET)
        );
        if let Some(generation) = generation {
            uri.push_str(&format!("?generation={}", generation));
        }
        uri.parse::<Uri>()
            .map_err(|e| CacheError::ConfigError(format!("Invalid object URI {}: {}", uri, e)))
    }

    async fn send(&self, method: Method, uri: Uri, range: Option<(u64, u64)>) -> Result<Response<Incoming>> {
        let mut builder = Request::builder().method(method.clone()).uri(uri.clone());
        if let Some((first, last)) = range {
            builder = builder.header(RANGE, format!("bytes={}-{}", first, last));
        }
        let request = builder
            .body(Empty::new())
            .map_err(|e| CacheError::HttpError(format!("Failed to build request: {}", e)))?;

        let start = Instant::now();
        let response = tokio::time::timeout(self.request_timeout, self.client.request(request))
            .await
            .map_err(|_| CacheError::TimeoutError(format!("{} {} timed out", method, uri)))??;

        debug!(
            "{} {} -> {} in {:.2}ms",
            method,
            uri,
            response.status(),
            start.elapsed().as_secs_f64() * 1000.0
        );
        Ok(response)
    }

    async fn with_retry<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.retry.max_retries => {
                    let delay = self.retry.delay_for(attempt);
                    warn!(
                        "{} attempt {} failed, retrying in {:?}: {}",
                        what,
                        attempt + 1,
                        delay,
                        e
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn try_stat(&self, bucket: &str, name: &str) -> Result<ObjectAttrs> {
        let uri = self.object_uri(bucket, name, None)?;
        let response = self.send(Method::HEAD, uri, None).await?;
        let object = format!("{}/{}", bucket, name);
        check_status(response.status(), &object, None, response.headers())?;

        let headers = response.headers();
        Ok(ObjectAttrs {
            size: header_value(headers, CONTENT_LENGTH.as_str())
                .ok_or_else(|| missing_header(&object, "content-length"))?,
            generation: header_value(headers, GENERATION_HEADER)
                .ok_or_else(|| missing_header(&object, GENERATION_HEADER))?,
            metageneration: header_value(headers, METAGENERATION_HEADER).unwrap_or(1),
        })
    }

    async fn try_read_range(&self, id: &ObjectIdentity, offset: u64, length: u64) -> Result<Bytes> {
        let uri = self.object_uri(&id.bucket, &id.name, Some(id.generation))?;
        let last = offset + length - 1;
        let response = self.send(Method::GET, uri, Some((offset, last))).await?;

        let status = response.status();
        if status == StatusCode::RANGE_NOT_SATISFIABLE {
            return Ok(Bytes::new());
        }
        check_status(status, &id.object_path(), Some(id.generation), response.headers())?;

        let body = response.into_body().collect().await?.to_bytes();
        if status == StatusCode::PARTIAL_CONTENT {
            return Ok(body);
        }

        // Server ignored the range and sent the whole object
        let start = (offset as usize).min(body.len());
        let end = (offset.saturating_add(length) as usize).min(body.len());
        Ok(body.slice(start..end))
    }
}

#[async_trait]
impl ObjectClient for HttpObjectClient {
    async fn stat_object(&self, bucket: &str, name: &str) -> Result<ObjectAttrs> {
        self.with_retry("stat", move || self.try_stat(bucket, name)).await
    }

    async fn read_range(&self, id: &ObjectIdentity, offset: u64, length: u64) -> Result<Bytes> {
        if length == 0 {
            return Ok(Bytes::new());
        }
        self.with_retry("range read", move || self.try_read_range(id, offset, length))
            .await
    }

    async fn read_full(&self, id: &ObjectIdentity) -> Result<ByteStream> {
        let uri = self.object_uri(&id.bucket, &id.name, Some(id.generation))?;
        let response = self.send(Method::GET, uri, None).await?;
        check_status(response.status(), &id.object_path(), Some(id.generation), response.headers())?;

        let stream = response
            .into_body()
            .into_data_stream()
            .map_err(CacheError::from)
            .boxed();
        Ok(stream)
    }
}

/// Map a response status (and generation header) to the cache's error taxonomy
pub fn check_status(
    status: StatusCode,
    object: &str,
    expected_generation: Option<i64>,
    headers: &HeaderMap,
) -> Result<()> {
    let actual = header_value::<i64>(headers, GENERATION_HEADER);

    if status.is_success() {
        if let (Some(expected), Some(actual)) = (expected_generation, actual) {
            if expected != actual {
                return Err(CacheError::GenerationMismatch {
                    object: object.to_string(),
                    expected,
                    actual,
                });
            }
        }
        return Ok(());
    }

    match status {
        StatusCode::NOT_FOUND => Err(CacheError::NotFound(object.to_string())),
        StatusCode::PRECONDITION_FAILED => Err(CacheError::GenerationMismatch {
            object: object.to_string(),
            expected: expected_generation.unwrap_or_default(),
            actual: actual.unwrap_or_default(),
        }),
        StatusCode::TOO_MANY_REQUESTS | StatusCode::REQUEST_TIMEOUT => Err(
            CacheError::TransientError(format!("{} returned {}", object, status)),
        ),
        s if s.is_server_error() => Err(CacheError::TransientError(format!(
            "{} returned {}",
            object, status
        ))),
        _ => Err(CacheError::HttpError(format!("{} returned {}", object, status))),
    }
}

fn header_value<T: std::str::FromStr>(headers: &HeaderMap, name: &str) -> Option<T> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<T>().ok())
}

fn missing_header(object: &str, header: &str) -> CacheError {
    CacheError::HttpError(format!("{} response is missing {}", object, header))
}
