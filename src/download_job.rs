//! Download Job Module
//!
//! Background task that streams one object version from the store into its
//! cache entry's backing file. Bytes are buffered up to the configured chunk
//! size, written and flushed, and only then is the entry's watermark advanced,
//! so a reader never observes bytes beyond the last durable write.
//!
//! Cancellation is cooperative: the job checks its cancel signal while waiting
//! for the next network chunk, never in the middle of a write.

use crate::cache_entry::CacheEntry;
use crate::cache_manager::ManagerEvent;
use crate::metrics::CacheCounters;
use crate::object_client::{ObjectClient, ObjectIdentity};
use crate::CacheError;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Instant;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How a download job ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed { bytes: u64 },
    /// Store or local I/O error; bytes below `offset` stay valid
    Failed { offset: u64, reason: String },
    Cancelled { offset: u64 },
    /// The object changed underneath the job; the entry was invalidated
    Invalidated { offset: u64, reason: String },
}

/// Everything a job needs, moved into its task
pub(crate) struct DownloadJob {
    pub entry: Arc<CacheEntry>,
    pub identity: ObjectIdentity,
    pub client: Arc<dyn ObjectClient>,
    pub file: File,
    pub chunk_size: usize,
    pub counters: Arc<CacheCounters>,
    pub events: mpsc::UnboundedSender<ManagerEvent>,
    pub cancel: watch::Receiver<bool>,
}

/// Why the streaming loop stopped early
enum Interrupt {
    Cancelled,
    Store(CacheError),
    Local(CacheError),
    SizeMismatch(String),
}

impl DownloadJob {
    pub fn spawn(self) -> JoinHandle<JobOutcome> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> JobOutcome {
        let start = Instant::now();
        let total = self.entry.total_size();
        debug!(
            "[DOWNLOAD_JOB] Starting download: object={}, size={}, chunk_size={}",
            self.identity, total, self.chunk_size
        );

        let mut written = 0u64;
        let outcome = match self.stream_into_file(&mut written).await {
            Ok(()) => match self.entry.complete() {
                Ok(()) => {
                    self.counters.record_job_completed();
                    info!(
                        "[DOWNLOAD_JOB] Download completed: object={}, bytes={}, duration_ms={:.2}",
                        self.identity,
                        written,
                        start.elapsed().as_secs_f64() * 1000.0
                    );
                    JobOutcome::Completed { bytes: written }
                }
                Err(CacheError::Cancelled(_)) => self.cancelled(written),
                Err(e) => self.invalidated(written, e.to_string()),
            },
            Err(Interrupt::Cancelled) => self.cancelled(written),
            Err(Interrupt::SizeMismatch(reason)) => self.invalidated(written, reason),
            Err(Interrupt::Store(e))
                if matches!(
                    e,
                    CacheError::GenerationMismatch { .. } | CacheError::NotFound(_)
                ) =>
            {
                self.invalidated(written, e.to_string())
            }
            Err(Interrupt::Store(e)) | Err(Interrupt::Local(e)) => {
                self.failed(written, e.to_string())
            }
        };

        let _ = self.events.send(ManagerEvent::RunEviction);
        outcome
    }

    async fn stream_into_file(&mut self, written: &mut u64) -> Result<(), Interrupt> {
        let total = self.entry.total_size();
        let client = Arc::clone(&self.client);

        let mut stream = tokio::select! {
            biased;
            _ = cancelled(&mut self.cancel) => return Err(Interrupt::Cancelled),
            stream = client.read_full(&self.identity) => stream.map_err(Interrupt::Store)?,
        };

        let mut buffer = BytesMut::with_capacity(self.chunk_size);
        loop {
            let next = tokio::select! {
                biased;
                _ = cancelled(&mut self.cancel) => return Err(Interrupt::Cancelled),
                next = stream.next() => next,
            };

            match next {
                Some(Ok(bytes)) => {
                    let received = *written + buffer.len() as u64 + bytes.len() as u64;
                    if received > total {
                        return Err(Interrupt::SizeMismatch(format!(
                            "stream yielded {} bytes, object size is {}",
                            received, total
                        )));
                    }
                    buffer.extend_from_slice(&bytes);
                    while buffer.len() >= self.chunk_size {
                        let chunk = buffer.split_to(self.chunk_size).freeze();
                        self.persist_chunk(chunk, written).await?;
                    }
                }
                Some(Err(e)) => return Err(Interrupt::Store(e)),
                None => break,
            }
        }

        if !buffer.is_empty() {
            self.persist_chunk(buffer.freeze(), written).await?;
        }

        if *written != total {
            return Err(Interrupt::SizeMismatch(format!(
                "stream ended at {} bytes, object size is {}",
                written, total
            )));
        }
        Ok(())
    }

    /// Write, flush, then publish the new watermark
    async fn persist_chunk(&mut self, chunk: Bytes, written: &mut u64) -> Result<(), Interrupt> {
        self.file.write_all(&chunk).await.map_err(|e| {
            Interrupt::Local(CacheError::IoError(format!(
                "Failed to write {:?}: {}",
                self.entry.path(),
                e
            )))
        })?;
        self.file.flush().await.map_err(|e| {
            Interrupt::Local(CacheError::IoError(format!(
                "Failed to flush {:?}: {}",
                self.entry.path(),
                e
            )))
        })?;

        let new_watermark = *written + chunk.len() as u64;
        match self.entry.advance(new_watermark) {
            Ok(()) => {
                *written = new_watermark;
                self.counters.record_bytes_downloaded(chunk.len() as u64);
                Ok(())
            }
            Err(CacheError::Cancelled(_)) => Err(Interrupt::Cancelled),
            Err(e) => Err(Interrupt::SizeMismatch(e.to_string())),
        }
    }

    fn cancelled(&self, offset: u64) -> JobOutcome {
        self.entry.mark_cancelled();
        self.counters.record_job_cancelled();
        debug!(
            "[DOWNLOAD_JOB] Download cancelled: object={}, offset={}",
            self.identity, offset
        );
        JobOutcome::Cancelled { offset }
    }

    fn failed(&self, offset: u64, reason: String) -> JobOutcome {
        self.entry.fail(reason.clone());
        self.counters.record_job_failed();
        warn!(
            "[DOWNLOAD_JOB] Download failed: object={}, offset={}, error={}",
            self.identity, offset, reason
        );
        JobOutcome::Failed { offset, reason }
    }

    fn invalidated(&self, offset: u64, reason: String) -> JobOutcome {
        if self.entry.invalidate() {
            self.counters.record_invalidation();
        }
        self.counters.record_job_failed();
        warn!(
            "[DOWNLOAD_JOB] Object changed during download, entry invalidated: object={}, offset={}, reason={}",
            self.identity, offset, reason
        );
        JobOutcome::Invalidated { offset, reason }
    }
}

/// Resolves once cancellation is requested. A dropped sender without a
/// request never resolves.
async fn cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            if *rx.borrow() {
                return;
            }
            std::future::pending::<()>().await;
        }
    }
}
