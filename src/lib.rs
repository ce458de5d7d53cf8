//! Bucket FS Cache - local file content cache for an object-store-backed filesystem
//!
//! Serves repeated and sequential reads of remote objects from a bounded
//! on-disk cache, populated by background downloads and invalidated by object
//! generation changes.

pub mod cache_entry;
pub mod cache_handle;
pub mod cache_manager;
pub mod cache_store;
pub mod config;
pub mod download_job;
pub mod error;
pub mod eviction;
pub mod http_client;
pub mod logging;
pub mod memory_client;
pub mod metrics;
pub mod object_client;
pub mod shutdown;

pub use cache_handle::CacheHandle;
pub use cache_manager::{CacheManager, NoCacheReason, ResolveOutcome};
pub use error::{CacheError, Result};
pub use object_client::{ObjectAttrs, ObjectClient, ObjectIdentity};
