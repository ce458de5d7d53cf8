//! Object Client Module
//!
//! The read cache consumes the object store through the [`ObjectClient`] trait:
//! stat an object, read a generation-pinned byte range, or stream the whole
//! object. Implementations handle their own retries; the cache only sees the
//! final outcome.

use crate::Result;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of one observed version of an object.
///
/// `generation` changes on every content overwrite, `metageneration` on
/// metadata-only updates. An identity is immutable once observed for a read.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectIdentity {
    pub bucket: String,
    pub name: String,
    pub generation: i64,
    pub metageneration: i64,
}

impl ObjectIdentity {
    pub fn new(
        bucket: impl Into<String>,
        name: impl Into<String>,
        generation: i64,
        metageneration: i64,
    ) -> Self {
        Self {
            bucket: bucket.into(),
            name: name.into(),
            generation,
            metageneration,
        }
    }

    /// Build an identity from the attributes returned by a stat call
    pub fn from_attrs(bucket: impl Into<String>, name: impl Into<String>, attrs: &ObjectAttrs) -> Self {
        Self::new(bucket, name, attrs.generation, attrs.metageneration)
    }

    /// Generation-independent key for the object: `bucket/name`
    pub fn object_path(&self) -> String {
        object_path(&self.bucket, &self.name)
    }
}

impl fmt::Display for ObjectIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}#{}.{}",
            self.bucket, self.name, self.generation, self.metageneration
        )
    }
}

/// Build the generation-independent key used to index cache entries
pub fn object_path(bucket: &str, name: &str) -> String {
    format!("{}/{}", bucket, name.trim_start_matches('/'))
}

/// Attributes returned by [`ObjectClient::stat_object`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectAttrs {
    pub size: u64,
    pub generation: i64,
    pub metageneration: i64,
}

/// Stream of object bytes, in order, starting at offset 0
pub type ByteStream = BoxStream<'static, Result<Bytes>>;

/// Object store operations consumed by the read cache.
///
/// Errors are reported as `NotFound`, `GenerationMismatch`, or a transient
/// variant (see [`crate::CacheError::is_transient`]).
#[async_trait]
pub trait ObjectClient: Send + Sync {
    /// Current size and version counters of the live object
    async fn stat_object(&self, bucket: &str, name: &str) -> Result<ObjectAttrs>;

    /// Read `[offset, offset + length)` of the exact generation in `id`.
    ///
    /// A range extending past the end of the object is truncated to the
    /// object's size.
    async fn read_range(&self, id: &ObjectIdentity, offset: u64, length: u64) -> Result<Bytes>;

    /// Stream every byte of the exact generation in `id`
    async fn read_full(&self, id: &ObjectIdentity) -> Result<ByteStream>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_path_strips_leading_slash() {
        assert_eq!(object_path("bucket", "/dir/foo"), "bucket/dir/foo");
        assert_eq!(object_path("bucket", "dir/foo"), "bucket/dir/foo");
    }

    #[test]
    fn test_identity_display_and_path() {
        let attrs = ObjectAttrs {
            size: 10,
            generation: 1700000000000001,
            metageneration: 2,
        };
        let id = ObjectIdentity::from_attrs("bucket", "dir/foo", &attrs);
        assert_eq!(id.object_path(), "bucket/dir/foo");
        assert_eq!(id.to_string(), "bucket/dir/foo#1700000000000001.2");
    }
}
