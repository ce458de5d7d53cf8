//! Logging Module
//!
//! Application logging through `tracing`: compact console output, plus a
//! daily-rotated log file when a log directory is configured.

use crate::config::LoggingConfig;
use crate::{CacheError, Result};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// File name prefix of rotated application logs
const LOG_FILE_NAME: &str = "bucket-fs-cache.log";

/// Logger manager for application logging
pub struct LoggerManager {
    pub config: LoggingConfig,
}

impl LoggerManager {
    pub fn new(config: LoggingConfig) -> Self {
        Self { config }
    }

    /// Install the global subscriber. Safe to call when one is already set.
    pub fn initialize(&self) -> Result<()> {
        let file_layer = match &self.config.app_log_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir).map_err(|e| {
                    CacheError::IoError(format!("Failed to create app log directory: {}", e))
                })?;
                let file_appender = RollingFileAppender::new(Rotation::DAILY, dir, LOG_FILE_NAME);
                Some(
                    tracing_subscriber::fmt::layer()
                        .with_writer(file_appender)
                        .with_ansi(false)
                        .with_target(true)
                        .with_thread_ids(true)
                        .with_file(true)
                        .with_line_number(true)
                        .with_level(true)
                        .with_timer(tracing_subscriber::fmt::time::ChronoUtc::rfc_3339())
                        .compact(),
                )
            }
            None => None,
        };

        let console_layer = tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_ansi(true)
            .with_target(false)
            .with_level(true)
            .with_timer(tracing_subscriber::fmt::time::ChronoUtc::rfc_3339())
            .compact();

        // RUST_LOG wins over the configured level
        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(&self.config.log_level));

        let result = tracing_subscriber::registry()
            .with(env_filter)
            .with(file_layer)
            .with(console_layer)
            .try_init();

        match result {
            Ok(_) => {
                info!("Logging initialized: level={}", self.config.log_level);
                if let Some(dir) = &self.config.app_log_dir {
                    info!("Application logs will be written to: {:?}", dir);
                }
            }
            Err(_) => {
                // Already initialized, likely in tests
                debug!("Tracing subscriber already initialized, skipping");
            }
        }

        if let Err(e) = self.rotate_logs() {
            warn!("Log cleanup failed: {}", e);
        }
        Ok(())
    }

    /// Remove rotated log files past the retention window
    pub fn rotate_logs(&self) -> Result<usize> {
        match &self.config.app_log_dir {
            Some(dir) => cleanup_old_logs(dir, self.config.retention_days),
            None => Ok(0),
        }
    }
}

/// Delete files in `log_dir` last modified more than `keep_days` ago.
/// Returns how many were removed.
pub fn cleanup_old_logs(log_dir: &Path, keep_days: u32) -> Result<usize> {
    let keep = Duration::from_secs(keep_days as u64 * 24 * 3600);
    let cutoff_time = SystemTime::now()
        .checked_sub(keep)
        .unwrap_or(SystemTime::UNIX_EPOCH);

    let mut removed = 0;
    let entries = match std::fs::read_dir(log_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };

    for entry in entries.flatten() {
        let path: PathBuf = entry.path();
        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        if !metadata.is_file() {
            continue;
        }
        if let Ok(modified) = metadata.modified() {
            if modified < cutoff_time {
                if let Err(e) = std::fs::remove_file(&path) {
                    warn!("Failed to remove old log file {:?}: {}", path, e);
                } else {
                    debug!("Removed old log file: {:?}", path);
                    removed += 1;
                }
            }
        }
    }

    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_cleanup_removes_only_expired_files() {
        let dir = TempDir::new().unwrap();
        let old = dir.path().join("bucket-fs-cache.log.2020-01-01");
        let fresh = dir.path().join("bucket-fs-cache.log.today");
        std::fs::write(&old, b"old").unwrap();
        std::fs::write(&fresh, b"fresh").unwrap();

        let file = std::fs::File::options().write(true).open(&old).unwrap();
        file.set_modified(SystemTime::now() - Duration::from_secs(10 * 24 * 3600))
            .unwrap();
        drop(file);

        assert_eq!(cleanup_old_logs(dir.path(), 7).unwrap(), 1);
        assert!(!old.exists());
        assert!(fresh.exists());
    }

    #[test]
    fn test_cleanup_of_missing_directory_is_noop() {
        let dir = TempDir::new().unwrap();
        assert_eq!(cleanup_old_logs(&dir.path().join("missing"), 7).unwrap(), 0);
    }

    #[test]
    fn test_initialize_twice_is_tolerated() {
        let dir = TempDir::new().unwrap();
        let manager = LoggerManager::new(LoggingConfig {
            log_level: "debug".to_string(),
            app_log_dir: Some(dir.path().join("logs")),
            retention_days: 7,
        });
        manager.initialize().unwrap();
        manager.initialize().unwrap();
        assert!(dir.path().join("logs").exists());
    }
}
