//! The response cache: entry model, freshness rules, header parsing, and the
//! disk-backed store.

mod disk;
mod headers;

pub use disk::DiskCache;
pub use headers::parse_cache_headers;

pub(crate) use headers::format_http_date;

use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::CacheError;
use crate::header::Headers;

/// Milliseconds since the Unix epoch.
#[must_use]
pub(crate) fn epoch_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// A cached HTTP response together with its revalidation metadata.
///
/// Entries are produced by the network leg (via
/// [`parse_cache_headers`]) and owned by the cache thereafter; reads hand
/// back an independent copy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheEntry {
    /// Raw response body bytes.
    pub data: Bytes,
    /// `ETag` returned with the original response, if any.
    pub etag: Option<String>,
    /// Server `Date`, in epoch milliseconds; `0` when absent.
    pub server_date: i64,
    /// `Last-Modified`, in epoch milliseconds; `0` when absent.
    pub last_modified: i64,
    /// Hard expiry instant (epoch milliseconds): past this the entry must be
    /// revalidated before use.
    pub ttl: i64,
    /// Soft expiry instant (epoch milliseconds, `<= ttl`): past this the
    /// entry may still be served but a refresh should be issued.
    pub soft_ttl: i64,
    /// The headers returned with the original response, in wire order.
    pub response_headers: Headers,
}

impl CacheEntry {
    /// Whether the entry is past its hard expiry at the captured instant.
    ///
    /// Callers must evaluate both freshness predicates against a single
    /// captured `now` so an entry whose two TTLs coincide cannot appear
    /// fresh to one check and stale to the other.
    #[must_use]
    pub fn is_expired(&self, now_millis: i64) -> bool {
        self.ttl < now_millis
    }

    /// Whether the entry is past its soft expiry and a background refresh
    /// should be issued.
    #[must_use]
    pub fn refresh_needed(&self, now_millis: i64) -> bool {
        self.soft_ttl < now_millis
    }
}

/// A keyed store of [`CacheEntry`] values.
///
/// All operations complete asynchronously; each resolves exactly once. The
/// pipeline treats read failures as misses and logs write failures, but the
/// errors are surfaced here for callers driving a store directly.
#[async_trait]
pub trait Cache: Send + Sync + 'static {
    /// Prepares the store for use. Idempotent.
    async fn initialize(&self) -> Result<(), CacheError>;

    /// Fetches the entry for `key`, if present and well-formed.
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, CacheError>;

    /// Stores `entry` under `key`, evicting older entries if needed. A store
    /// may refuse an entry that cannot fit within its size bound.
    async fn put(&self, key: &str, entry: CacheEntry) -> Result<(), CacheError>;

    /// Marks the entry for `key` as needing refresh; with `full_expire` the
    /// entry is also hard-expired and must be revalidated before use.
    async fn invalidate(
        &self,
        key: &str,
        full_expire: bool,
    ) -> Result<(), CacheError>;

    /// Removes the entry for `key`.
    async fn remove(&self, key: &str) -> Result<(), CacheError>;

    /// Removes every entry.
    async fn clear(&self) -> Result<(), CacheError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn freshness_predicates_use_one_instant() {
        let entry = CacheEntry { ttl: 1_000, soft_ttl: 1_000, ..Default::default() };
        // Both predicates agree at the shared boundary instant.
        assert!(!entry.is_expired(1_000));
        assert!(!entry.refresh_needed(1_000));
        assert!(entry.is_expired(1_001));
        assert!(entry.refresh_needed(1_001));
    }

    #[test]
    fn soft_expiry_precedes_hard_expiry() {
        let entry =
            CacheEntry { ttl: 2_000, soft_ttl: 1_000, ..Default::default() };
        assert!(!entry.is_expired(1_500));
        assert!(entry.refresh_needed(1_500));
    }
}
