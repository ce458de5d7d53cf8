//! Graceful Shutdown Module
//!
//! Turns SIGINT/SIGTERM into an orderly stop: components listening on the
//! shutdown channel finish their current read, running downloads are
//! cancelled, and the final cache metrics are logged.

use crate::cache_manager::CacheManager;
use crate::{CacheError, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::broadcast;
use tokio::time::timeout;
use tracing::{debug, error, info};

/// Shutdown coordinator for graceful system shutdown
pub struct ShutdownCoordinator {
    cache_manager: Option<Arc<CacheManager>>,
    shutdown_sender: broadcast::Sender<()>,
    shutdown_timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new(shutdown_timeout: Duration) -> Self {
        let (shutdown_sender, _) = broadcast::channel(16);

        Self {
            cache_manager: None,
            shutdown_sender,
            shutdown_timeout,
        }
    }

    pub fn set_cache_manager(&mut self, cache_manager: Arc<CacheManager>) {
        self.cache_manager = Some(cache_manager);
    }

    /// Get shutdown receiver for components to listen for shutdown signals
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown_sender.subscribe()
    }

    /// Wait for SIGINT or SIGTERM, then shut down
    pub async fn listen_for_shutdown(&self) -> Result<()> {
        debug!("Starting shutdown signal listener");

        let mut sigint =
            signal::unix::signal(signal::unix::SignalKind::interrupt()).map_err(|e| {
                CacheError::SystemError(format!("Failed to create SIGINT handler: {}", e))
            })?;

        let mut sigterm =
            signal::unix::signal(signal::unix::SignalKind::terminate()).map_err(|e| {
                CacheError::SystemError(format!("Failed to create SIGTERM handler: {}", e))
            })?;

        tokio::select! {
            _ = sigint.recv() => {
                info!("Received SIGINT, initiating graceful shutdown");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, initiating graceful shutdown");
            }
        }

        self.initiate_shutdown().await
    }

    /// Notify listeners and stop the cache within the shutdown timeout
    pub async fn initiate_shutdown(&self) -> Result<()> {
        info!("Initiating graceful shutdown sequence");

        if let Err(e) = self.shutdown_sender.send(()) {
            // No receivers left, nothing to notify
            debug!("Shutdown signal not sent (no active receivers): {}", e);
        }

        match timeout(self.shutdown_timeout, self.perform_shutdown()).await {
            Ok(()) => {
                info!("Graceful shutdown completed successfully");
                Ok(())
            }
            Err(_) => {
                error!(
                    "Graceful shutdown timed out after {:?}, forcing shutdown",
                    self.shutdown_timeout
                );
                Err(CacheError::TimeoutError(
                    "Graceful shutdown timeout".to_string(),
                ))
            }
        }
    }

    async fn perform_shutdown(&self) {
        if let Some(cache_manager) = &self.cache_manager {
            let cancelled = cache_manager.shutdown().await;
            info!(
                "Read cache stopped: cancelled_downloads={}, final_metrics={}",
                cancelled,
                cache_manager.metrics().to_json()
            );
        }
    }
}

/// Shutdown signal wrapper for components
pub struct ShutdownSignal {
    receiver: broadcast::Receiver<()>,
    shutdown_requested: bool,
}

impl ShutdownSignal {
    pub fn new(receiver: broadcast::Receiver<()>) -> Self {
        Self {
            receiver,
            shutdown_requested: false,
        }
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested
    }

    /// Wait for the shutdown signal. A closed or lagged channel counts as one.
    pub async fn wait_for_shutdown(&mut self) {
        let _ = self.receiver.recv().await;
        self.shutdown_requested = true;
    }

    /// Non-blocking check for the shutdown signal
    pub fn try_recv_shutdown(&mut self) -> bool {
        match self.receiver.try_recv() {
            Err(broadcast::error::TryRecvError::Empty) => false,
            _ => {
                self.shutdown_requested = true;
                true
            }
        }
    }
}
