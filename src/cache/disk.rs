//! Disk-backed cache store.
//!
//! Each entry lives in its own file named by the hex-encoded 32-bit hash of
//! the cache key. A file starts with a header carrying the magic number, the
//! embedded key, the validators and TTLs, and the response header list; the
//! body occupies the rest of the file. All multi-byte fields are
//! little-endian. There is no index file: the in-memory index is rebuilt at
//! initialization by scanning the cache directory, and any file that fails
//! to parse is deleted on sight.

use std::path::PathBuf;

use async_trait::async_trait;
use bytes::Bytes;
use indexmap::IndexMap;
use log::{debug, warn};
use tokio::fs;
use tokio::sync::Mutex;

use crate::cache::{Cache, CacheEntry};
use crate::error::CacheError;
use crate::header::Headers;

/// Magic number opening every cache file.
const MAGIC: u32 = 0x2015_0306;

/// Fraction of `max_size` the trim pass shrinks to, so the cache is not
/// re-trimmed on every write near its bound.
const HYSTERESIS_FACTOR: f64 = 0.9;

/// Default cache bound: 5 MiB.
const DEFAULT_MAX_SIZE: u64 = 5 * 1024 * 1024;

/// A size-bounded, persistent key→entry store.
///
/// Entries are admitted as long as the running total stays within
/// `max_size`; once a write would overflow, entries are evicted in on-disk
/// order until the total drops below the hysteresis target. A write that
/// could not fit even after evicting everything is refused and leaves the
/// store unchanged.
#[derive(Debug)]
pub struct DiskCache {
    root: PathBuf,
    max_size: u64,
    state: Mutex<IndexState>,
}

#[derive(Debug, Default)]
struct IndexState {
    /// key → file size, in on-disk order (scan order at initialization,
    /// insertion order afterwards).
    entries: IndexMap<String, u64>,
    total_size: u64,
    initialized: bool,
}

impl DiskCache {
    /// Creates a store rooted at `root` with the default 5 MiB bound.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::with_max_size(root, DEFAULT_MAX_SIZE)
    }

    /// Creates a store rooted at `root` bounded to `max_size` bytes.
    pub fn with_max_size(root: impl Into<PathBuf>, max_size: u64) -> Self {
        Self {
            root: root.into(),
            max_size,
            state: Mutex::new(IndexState::default()),
        }
    }

    fn file_path(&self, key: &str) -> PathBuf {
        self.root.join(file_name_for_key(key))
    }

    async fn drop_file(&self, state: &mut IndexState, key: &str) {
        fs::remove_file(self.file_path(key)).await.ok();
        if let Some(size) = state.entries.shift_remove(key) {
            state.total_size -= size;
        }
    }

    /// Makes room for `new_size` bytes, evicting in on-disk order. Returns
    /// `false` when the write must be refused.
    async fn make_room(
        &self,
        state: &mut IndexState,
        key: &str,
        new_size: u64,
    ) -> bool {
        let replaced = state.entries.get(key).copied().unwrap_or(0);
        if state.total_size - replaced + new_size <= self.max_size {
            return true;
        }
        let target = (self.max_size as f64 * HYSTERESIS_FACTOR) as u64;
        if new_size > target {
            return false;
        }
        let mut evicted = 0u32;
        while state.total_size - replaced + new_size > target {
            let Some(victim) = state
                .entries
                .keys()
                .find(|k| k.as_str() != key)
                .cloned()
            else {
                break;
            };
            if let Some(size) = state.entries.shift_remove(&victim) {
                state.total_size -= size;
            }
            fs::remove_file(self.file_path(&victim)).await.ok();
            evicted += 1;
        }
        debug!("evicted {evicted} cache entries to fit {new_size} bytes");
        state.total_size - replaced + new_size <= target
    }
}

#[async_trait]
impl Cache for DiskCache {
    async fn initialize(&self) -> Result<(), CacheError> {
        let mut state = self.state.lock().await;
        if state.initialized {
            return Ok(());
        }
        fs::create_dir_all(&self.root).await?;
        let mut dir = fs::read_dir(&self.root).await?;
        while let Some(dirent) = dir.next_entry().await? {
            let path = dirent.path();
            let metadata = dirent.metadata().await?;
            if !metadata.is_file() {
                continue;
            }
            match fs::read(&path).await {
                Ok(bytes) => match deserialize_entry(&bytes) {
                    Ok((key, _)) => {
                        state.total_size += metadata.len();
                        state.entries.insert(key, metadata.len());
                    }
                    Err(err) => {
                        warn!("removing unreadable cache file {path:?}: {err}");
                        fs::remove_file(&path).await.ok();
                    }
                },
                Err(err) => {
                    warn!("removing unreadable cache file {path:?}: {err}");
                    fs::remove_file(&path).await.ok();
                }
            }
        }
        state.initialized = true;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, CacheError> {
        let path = self.file_path(key);
        let mut state = self.state.lock().await;
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                if let Some(size) = state.entries.shift_remove(key) {
                    state.total_size -= size;
                }
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        };
        match deserialize_entry(&bytes) {
            Ok((stored_key, entry)) if stored_key == key => Ok(Some(entry)),
            Ok((stored_key, _)) => {
                warn!(
                    "cache file {path:?} stores key {stored_key:?}, \
                     expected {key:?}; removing"
                );
                self.drop_file(&mut state, key).await;
                Ok(None)
            }
            Err(err) => {
                warn!("corrupt cache file {path:?}: {err}; removing");
                self.drop_file(&mut state, key).await;
                Ok(None)
            }
        }
    }

    async fn put(&self, key: &str, entry: CacheEntry) -> Result<(), CacheError> {
        let bytes = serialize_entry(key, &entry);
        let new_size = bytes.len() as u64;
        let mut state = self.state.lock().await;
        if !self.make_room(&mut state, key, new_size).await {
            warn!("cache refused {new_size}-byte entry for {key:?}");
            return Ok(());
        }
        fs::write(self.file_path(key), &bytes).await?;
        let replaced =
            state.entries.insert(key.to_string(), new_size).unwrap_or(0);
        state.total_size = state.total_size - replaced + new_size;
        Ok(())
    }

    async fn invalidate(
        &self,
        key: &str,
        full_expire: bool,
    ) -> Result<(), CacheError> {
        let Some(mut entry) = self.get(key).await? else {
            return Ok(());
        };
        entry.soft_ttl = 0;
        if full_expire {
            entry.ttl = 0;
        }
        self.put(key, entry).await
    }

    async fn remove(&self, key: &str) -> Result<(), CacheError> {
        let mut state = self.state.lock().await;
        self.drop_file(&mut state, key).await;
        Ok(())
    }

    async fn clear(&self) -> Result<(), CacheError> {
        let mut state = self.state.lock().await;
        if let Ok(mut dir) = fs::read_dir(&self.root).await {
            while let Ok(Some(dirent)) = dir.next_entry().await {
                fs::remove_file(dirent.path()).await.ok();
            }
        }
        state.entries.clear();
        state.total_size = 0;
        Ok(())
    }
}

/// File name for a key: the hex-encoded FNV-1a hash of its bytes. Two keys
/// may collide; the embedded key check in `get` resolves that by deleting
/// the survivor of the older write.
fn file_name_for_key(key: &str) -> String {
    hex::encode(fnv1a_32(key.as_bytes()).to_be_bytes())
}

fn fnv1a_32(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for &byte in bytes {
        hash ^= u32::from(byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

fn put_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn put_i32(buf: &mut Vec<u8>, value: i32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn put_i64(buf: &mut Vec<u8>, value: i64) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn put_string(buf: &mut Vec<u8>, value: &str) {
    buf.extend_from_slice(&(value.len() as u64).to_le_bytes());
    buf.extend_from_slice(value.as_bytes());
}

fn serialize_entry(key: &str, entry: &CacheEntry) -> Vec<u8> {
    let mut buf = Vec::with_capacity(64 + entry.data.len());
    put_u32(&mut buf, MAGIC);
    put_string(&mut buf, key);
    put_string(&mut buf, entry.etag.as_deref().unwrap_or(""));
    put_i64(&mut buf, entry.server_date);
    put_i64(&mut buf, entry.last_modified);
    put_i64(&mut buf, entry.ttl);
    put_i64(&mut buf, entry.soft_ttl);
    put_i32(&mut buf, entry.response_headers.len() as i32);
    for header in entry.response_headers.iter() {
        put_string(&mut buf, header.name());
        put_string(&mut buf, header.value());
    }
    buf.extend_from_slice(&entry.data);
    buf
}

struct EntryReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> EntryReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], CacheError> {
        let end = self.pos.checked_add(len).filter(|&e| e <= self.buf.len());
        let Some(end) = end else {
            return Err(CacheError::Corrupt(format!(
                "read of {len} bytes past end of file"
            )));
        };
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn read_u32(&mut self) -> Result<u32, CacheError> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn read_i32(&mut self) -> Result<i32, CacheError> {
        Ok(self.read_u32()? as i32)
    }

    fn read_i64(&mut self) -> Result<i64, CacheError> {
        let bytes = self.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(bytes);
        Ok(i64::from_le_bytes(raw))
    }

    fn read_string(&mut self) -> Result<String, CacheError> {
        let len = self.read_i64()?;
        if len < 0 || len as usize > self.buf.len() - self.pos {
            return Err(CacheError::Corrupt(format!(
                "string length {len} exceeds remaining file"
            )));
        }
        let bytes = self.take(len as usize)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| {
            CacheError::Corrupt("string is not valid UTF-8".to_string())
        })
    }

    fn remaining(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }
}

fn deserialize_entry(bytes: &[u8]) -> Result<(String, CacheEntry), CacheError> {
    let mut reader = EntryReader::new(bytes);
    let magic = reader.read_u32()?;
    if magic != MAGIC {
        return Err(CacheError::Corrupt(format!("bad magic {magic:#010x}")));
    }
    let key = reader.read_string()?;
    let etag = reader.read_string()?;
    let etag = if etag.is_empty() { None } else { Some(etag) };
    let server_date = reader.read_i64()?;
    let last_modified = reader.read_i64()?;
    let ttl = reader.read_i64()?;
    let soft_ttl = reader.read_i64()?;
    // Legacy writers encoded an absent header list as a negative sentinel
    // count; both decode to an empty list.
    let header_count = reader.read_i32()?;
    let mut response_headers = Headers::new();
    for _ in 0..header_count.max(0) {
        let name = reader.read_string()?;
        let value = reader.read_string()?;
        response_headers.append(name, value);
    }
    let data = Bytes::copy_from_slice(reader.remaining());
    Ok((
        key,
        CacheEntry {
            data,
            etag,
            server_date,
            last_modified,
            ttl,
            soft_ttl,
            response_headers,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_entry(body: &str) -> CacheEntry {
        CacheEntry {
            data: Bytes::copy_from_slice(body.as_bytes()),
            etag: Some("\"v1\"".to_string()),
            server_date: 1_700_000_000_000,
            last_modified: 1_690_000_000_000,
            ttl: 1_800_000_000_000,
            soft_ttl: 1_750_000_000_000,
            response_headers: [
                ("Content-Type", "text/plain; charset=utf-8"),
                ("X-Origin", "test"),
            ]
            .into_iter()
            .collect(),
        }
    }

    #[tokio::test]
    async fn round_trip_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let entry = sample_entry("hello");
        {
            let cache = DiskCache::new(dir.path());
            cache.initialize().await.unwrap();
            cache.put("http://example.com/a", entry.clone()).await.unwrap();
        }
        // A fresh instance rebuilds its index from the directory alone.
        let cache = DiskCache::new(dir.path());
        cache.initialize().await.unwrap();
        let read = cache.get("http://example.com/a").await.unwrap().unwrap();
        assert_eq!(read, entry);
    }

    #[tokio::test]
    async fn absent_etag_round_trips_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiskCache::new(dir.path());
        cache.initialize().await.unwrap();
        let entry = CacheEntry { etag: None, ..sample_entry("x") };
        cache.put("k", entry).await.unwrap();
        let read = cache.get("k").await.unwrap().unwrap();
        assert_eq!(read.etag, None);
    }

    #[tokio::test]
    async fn corrupt_magic_is_deleted_on_read() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiskCache::new(dir.path());
        cache.initialize().await.unwrap();
        let path = cache.file_path("k");
        std::fs::write(&path, b"not a cache file").unwrap();
        assert!(cache.get("k").await.unwrap().is_none());
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn truncated_file_never_yields_original_body() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiskCache::new(dir.path());
        cache.initialize().await.unwrap();
        let full = serialize_entry("k", &sample_entry("body"));
        let path = cache.file_path("k");
        std::fs::write(&path, &full[..full.len() / 2]).unwrap();
        // The truncated file parses only when the cut lands past the
        // header; either way the embedded data is gone or the read fails.
        let _ = cache.get("k").await.unwrap();
        let again = cache.get("k").await.unwrap();
        assert!(again.is_none() || again.unwrap().data != sample_entry("body").data);
    }

    #[tokio::test]
    async fn embedded_key_mismatch_is_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiskCache::new(dir.path());
        cache.initialize().await.unwrap();
        // Simulate a hash collision: the file for "a" holds entry "b".
        let bytes = serialize_entry("b", &sample_entry("body"));
        let path = cache.file_path("a");
        std::fs::write(&path, bytes).unwrap();
        assert!(cache.get("a").await.unwrap().is_none());
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn negative_header_count_reads_as_empty_list() {
        let mut buf = Vec::new();
        put_u32(&mut buf, MAGIC);
        put_string(&mut buf, "k");
        put_string(&mut buf, "");
        put_i64(&mut buf, 1);
        put_i64(&mut buf, 2);
        put_i64(&mut buf, 3);
        put_i64(&mut buf, 4);
        put_i32(&mut buf, -1);
        buf.extend_from_slice(b"body");
        let (key, entry) = deserialize_entry(&buf).unwrap();
        assert_eq!(key, "k");
        assert!(entry.response_headers.is_empty());
        assert_eq!(&entry.data[..], b"body");
    }

    #[tokio::test]
    async fn initialization_discards_unparseable_files() {
        let dir = tempfile::tempdir().unwrap();
        {
            let cache = DiskCache::new(dir.path());
            cache.initialize().await.unwrap();
            cache.put("keep", sample_entry("keep")).await.unwrap();
        }
        let junk = dir.path().join("deadbeef");
        std::fs::write(&junk, b"junk").unwrap();

        let cache = DiskCache::new(dir.path());
        cache.initialize().await.unwrap();
        assert!(!junk.exists());
        assert!(cache.get("keep").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn eviction_keeps_total_within_bound() {
        let dir = tempfile::tempdir().unwrap();
        let max = 4_096;
        let cache = DiskCache::with_max_size(dir.path(), max);
        cache.initialize().await.unwrap();

        let body = "x".repeat(900);
        for i in 0..10 {
            let mut entry = sample_entry(&body);
            entry.response_headers = Headers::new();
            cache.put(&format!("key-{i}"), entry).await.unwrap();
            let state = cache.state.lock().await;
            assert!(
                state.total_size <= max,
                "total {} exceeds bound {max}",
                state.total_size
            );
        }
        // The earliest entries were evicted in on-disk order.
        assert!(cache.get("key-0").await.unwrap().is_none());
        assert!(cache.get("key-9").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn oversized_entry_is_refused_and_leaves_state_intact() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiskCache::with_max_size(dir.path(), 2_048);
        cache.initialize().await.unwrap();
        cache.put("small", sample_entry("small")).await.unwrap();

        let huge = sample_entry(&"y".repeat(8_192));
        cache.put("huge", huge).await.unwrap();
        assert!(cache.get("huge").await.unwrap().is_none());
        assert!(cache.get("small").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn large_entry_fitting_outright_is_admitted() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiskCache::with_max_size(dir.path(), 8_192);
        cache.initialize().await.unwrap();
        // Larger than the hysteresis target but within the bound, with the
        // cache empty: admitted without a trim.
        let mut entry = sample_entry(&"z".repeat(7_900));
        entry.response_headers = Headers::new();
        cache.put("big", entry).await.unwrap();
        assert!(cache.get("big").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn invalidate_soft_then_full() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiskCache::new(dir.path());
        cache.initialize().await.unwrap();
        cache.put("k", sample_entry("body")).await.unwrap();

        cache.invalidate("k", false).await.unwrap();
        let soft = cache.get("k").await.unwrap().unwrap();
        assert_eq!(soft.soft_ttl, 0);
        assert!(soft.ttl > 0);

        cache.invalidate("k", true).await.unwrap();
        let full = cache.get("k").await.unwrap().unwrap();
        assert_eq!(full.soft_ttl, 0);
        assert_eq!(full.ttl, 0);
    }

    #[tokio::test]
    async fn remove_and_clear() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiskCache::new(dir.path());
        cache.initialize().await.unwrap();
        cache.put("a", sample_entry("a")).await.unwrap();
        cache.put("b", sample_entry("b")).await.unwrap();

        cache.remove("a").await.unwrap();
        assert!(cache.get("a").await.unwrap().is_none());
        assert!(cache.get("b").await.unwrap().is_some());

        cache.clear().await.unwrap();
        assert!(cache.get("b").await.unwrap().is_none());
        assert_eq!(cache.state.lock().await.total_size, 0);
    }
}
