//! Persistent, size- and age-bounded store of complete per-library symbol
//! tables.
//!
//! Layout on disk: one bit-exact `.symtab` file per library (the
//! `(addrs, index, buffer)` byte format from `symlens-common`) plus a JSON
//! manifest recording, per cache key, the entry's file name and
//! last-used recency. All writes go through a temp file followed by a
//! rename, so a crash never leaves a half-written entry behind.
//!
//! Recency is a `(last_used_ms, seq)` pair: the sequence number makes LRU
//! ordering total even when several operations land in the same millisecond.

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio::sync::RwLock;

use crate::domain::SymbolError;
use symlens_common::{LibraryIdentity, SymbolTable};

const MANIFEST_FILE: &str = "manifest.json";

/// Size and age bounds for the cache.
#[derive(Debug, Clone, Copy)]
pub struct CacheConfig {
    /// Maximum number of symbol tables kept on disk
    pub max_count: usize,
    /// Entries not touched for this long are deleted by the startup sweep
    pub max_age: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { max_count: 200, max_age: Duration::from_secs(30 * 24 * 60 * 60) }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ManifestEntry {
    file: String,
    last_used_ms: u64,
    seq: u64,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<String, ManifestEntry>,
    next_seq: u64,
    closed: bool,
}

/// Persistent symbol table cache.
///
/// Each logical operation (get/put/sweep) runs as one atomic step under the
/// manifest lock; operations on different keys interleave freely between
/// those steps.
pub struct SymbolCache {
    dir: PathBuf,
    max_count: usize,
    state: RwLock<CacheState>,
}

fn now_ms() -> u64 {
    u64::try_from(
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis(),
    )
    .unwrap_or(u64::MAX)
}

/// File-system-safe form of a cache key component.
fn sanitize(part: &str) -> String {
    part.chars().map(|c| if c.is_ascii_alphanumeric() || ".-_".contains(c) { c } else { '_' }).collect()
}

impl SymbolCache {
    /// Open (or create) a cache directory and run the age sweep.
    ///
    /// The sweep deletes every entry older than `max_age`; sweep failures
    /// are logged, never fatal, and do not block cache availability. A
    /// manifest that fails to parse is treated as an empty cache.
    ///
    /// # Errors
    /// Returns an error only if the cache directory cannot be created.
    pub async fn open(dir: impl AsRef<Path>, config: CacheConfig) -> Result<Self, SymbolError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).await?;

        let manifest_path = dir.join(MANIFEST_FILE);
        let mut entries: HashMap<String, ManifestEntry> = if manifest_path.exists() {
            match fs::read_to_string(&manifest_path).await.map_err(SymbolError::from).and_then(
                |content| {
                    serde_json::from_str::<HashMap<String, ManifestEntry>>(&content)
                        .map_err(SymbolError::from)
                },
            ) {
                Ok(loaded) => {
                    info!("Loaded {} symbol cache entries from {}", loaded.len(), dir.display());
                    loaded
                }
                Err(e) => {
                    warn!("Failed to read cache manifest, starting empty: {e}");
                    HashMap::new()
                }
            }
        } else {
            HashMap::new()
        };

        let next_seq = entries.values().map(|e| e.seq + 1).max().unwrap_or(0);

        // Age sweep: delete everything not touched within max_age
        let max_age_ms = u64::try_from(config.max_age.as_millis()).unwrap_or(u64::MAX);
        let cutoff = now_ms();
        let expired: Vec<String> = entries
            .iter()
            .filter(|(_, e)| e.last_used_ms.saturating_add(max_age_ms) <= cutoff)
            .map(|(key, _)| key.clone())
            .collect();
        for key in expired {
            if let Some(entry) = entries.remove(&key) {
                debug!("Sweeping expired symbol table for {key}");
                if let Err(e) = fs::remove_file(dir.join(&entry.file)).await {
                    warn!("Failed to delete expired cache file {}: {e}", entry.file);
                }
            }
        }

        if let Err(e) = Self::persist_manifest(&dir, &entries).await {
            warn!("Failed to persist manifest after sweep: {e}");
        }

        Ok(Self {
            dir,
            max_count: config.max_count.max(1),
            state: RwLock::new(CacheState { entries, next_seq, closed: false }),
        })
    }

    /// Look up a symbol table by exact library identity.
    ///
    /// A hit updates the entry's recency ("touch"). A missing key fails with
    /// the domain-level [`SymbolError::NotFound`], distinct from I/O errors.
    ///
    /// # Errors
    /// `NotFound` on a miss, `CacheClosed` after [`Self::close`], or an I/O /
    /// format error if the entry file cannot be read back.
    pub async fn get(&self, lib: &LibraryIdentity) -> Result<SymbolTable, SymbolError> {
        let mut state = self.state.write().await;
        if state.closed {
            return Err(SymbolError::CacheClosed);
        }
        let state = &mut *state;

        let key = lib.key();
        let Some(entry) = state.entries.get_mut(&key) else {
            debug!("Symbol cache miss: {key}");
            return Err(SymbolError::NotFound(lib.clone()));
        };

        let bytes = fs::read(self.dir.join(&entry.file)).await?;
        let table = SymbolTable::from_bytes(&bytes)?;
        debug!("Symbol cache hit: {key} ({} symbols)", table.len());

        entry.last_used_ms = now_ms();
        entry.seq = state.next_seq;
        state.next_seq += 1;

        // Touch is best-effort on disk; the in-memory recency already moved
        if let Err(e) = Self::persist_manifest(&self.dir, &state.entries).await {
            warn!("Failed to persist manifest after touch: {e}");
        }
        Ok(table)
    }

    /// Insert a symbol table, evicting least-recently-used entries first so
    /// the store holds at most `max_count` entries afterwards.
    ///
    /// # Errors
    /// `CacheClosed` after [`Self::close`], or an I/O error if the entry or
    /// manifest cannot be written.
    pub async fn put(&self, lib: &LibraryIdentity, table: &SymbolTable) -> Result<(), SymbolError> {
        let mut state = self.state.write().await;
        if state.closed {
            return Err(SymbolError::CacheClosed);
        }

        // Make room: at most max_count - 1 entries before the insert
        while state.entries.len() > self.max_count - 1 {
            let Some(oldest) = state
                .entries
                .iter()
                .min_by_key(|(_, e)| (e.last_used_ms, e.seq))
                .map(|(key, _)| key.clone())
            else {
                break;
            };
            if let Some(entry) = state.entries.remove(&oldest) {
                debug!("Evicting least-recently-used symbol table: {oldest}");
                if let Err(e) = fs::remove_file(self.dir.join(&entry.file)).await {
                    warn!("Failed to delete evicted cache file {}: {e}", entry.file);
                }
            }
        }

        let file = format!("{}-{}.symtab", sanitize(&lib.debug_name), sanitize(&lib.breakpad_id));
        write_atomically(&self.dir.join(&file), &table.to_bytes()).await?;

        let entry = ManifestEntry { file, last_used_ms: now_ms(), seq: state.next_seq };
        state.next_seq += 1;
        state.entries.insert(lib.key(), entry);

        Self::persist_manifest(&self.dir, &state.entries).await?;
        debug!("Cached symbol table for {} ({} symbols)", lib.key(), table.len());
        Ok(())
    }

    /// Release the cache; every later call fails with `CacheClosed`.
    pub async fn close(&self) {
        let mut state = self.state.write().await;
        state.closed = true;
    }

    async fn persist_manifest(
        dir: &Path,
        entries: &HashMap<String, ManifestEntry>,
    ) -> Result<(), SymbolError> {
        let content = serde_json::to_string_pretty(entries)?;
        write_atomically(&dir.join(MANIFEST_FILE), content.as_bytes()).await
    }
}

/// Temp file + rename; atomic on the filesystems we care about.
async fn write_atomically(path: &Path, bytes: &[u8]) -> Result<(), SymbolError> {
    let temp = path.with_extension("tmp");
    fs::write(&temp, bytes).await?;
    fs::rename(&temp, path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn lib(name: &str) -> LibraryIdentity {
        LibraryIdentity::new(name, "DEADBEEF0")
    }

    fn table(name: &str) -> SymbolTable {
        SymbolTable::from_pairs(vec![(0, name.to_string()), (0x100, format!("{name}_tail"))])
    }

    async fn open(dir: &TempDir, max_count: usize) -> SymbolCache {
        SymbolCache::open(
            dir.path(),
            CacheConfig { max_count, max_age: Duration::from_secs(3600) },
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_put_get_round_trip_is_bit_identical() {
        let dir = TempDir::new().unwrap();
        let cache = open(&dir, 10).await;

        let t = table("alpha");
        cache.put(&lib("alpha.so"), &t).await.unwrap();
        let back = cache.get(&lib("alpha.so")).await.unwrap();
        assert_eq!(back, t);
        assert_eq!(back.to_bytes(), t.to_bytes());
    }

    #[tokio::test]
    async fn test_miss_is_not_found() {
        let dir = TempDir::new().unwrap();
        let cache = open(&dir, 10).await;

        match cache.get(&lib("missing.so")).await {
            Err(SymbolError::NotFound(l)) => assert_eq!(l.debug_name, "missing.so"),
            other => panic!("expected NotFound, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_lru_eviction_keeps_most_recent() {
        let dir = TempDir::new().unwrap();
        let cache = open(&dir, 3).await;

        for name in ["a.so", "b.so", "c.so", "d.so", "e.so"] {
            cache.put(&lib(name), &table(name)).await.unwrap();
        }

        assert!(matches!(cache.get(&lib("a.so")).await, Err(SymbolError::NotFound(_))));
        assert!(matches!(cache.get(&lib("b.so")).await, Err(SymbolError::NotFound(_))));
        assert!(cache.get(&lib("c.so")).await.is_ok());
        assert!(cache.get(&lib("d.so")).await.is_ok());
        assert!(cache.get(&lib("e.so")).await.is_ok());
    }

    #[tokio::test]
    async fn test_get_updates_recency() {
        let dir = TempDir::new().unwrap();
        let cache = open(&dir, 2).await;

        cache.put(&lib("a.so"), &table("a")).await.unwrap();
        cache.put(&lib("b.so"), &table("b")).await.unwrap();
        cache.get(&lib("a.so")).await.unwrap(); // a is now most recent
        cache.put(&lib("c.so"), &table("c")).await.unwrap();

        assert!(cache.get(&lib("a.so")).await.is_ok());
        assert!(matches!(cache.get(&lib("b.so")).await, Err(SymbolError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_close_rejects_further_calls() {
        let dir = TempDir::new().unwrap();
        let cache = open(&dir, 10).await;

        cache.put(&lib("a.so"), &table("a")).await.unwrap();
        cache.close().await;

        assert!(matches!(cache.get(&lib("a.so")).await, Err(SymbolError::CacheClosed)));
        assert!(matches!(
            cache.put(&lib("b.so"), &table("b")).await,
            Err(SymbolError::CacheClosed)
        ));
    }

    #[tokio::test]
    async fn test_entries_survive_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let cache = open(&dir, 10).await;
            cache.put(&lib("persist.so"), &table("p")).await.unwrap();
        }
        let cache = open(&dir, 10).await;
        assert_eq!(cache.get(&lib("persist.so")).await.unwrap(), table("p"));
    }

    #[tokio::test]
    async fn test_zero_max_age_sweeps_everything() {
        let dir = TempDir::new().unwrap();
        {
            let cache = open(&dir, 10).await;
            cache.put(&lib("a.so"), &table("a")).await.unwrap();
            cache.put(&lib("b.so"), &table("b")).await.unwrap();
        }

        let cache = SymbolCache::open(
            dir.path(),
            CacheConfig { max_count: 10, max_age: Duration::ZERO },
        )
        .await
        .unwrap();
        assert!(matches!(cache.get(&lib("a.so")).await, Err(SymbolError::NotFound(_))));
        assert!(matches!(cache.get(&lib("b.so")).await, Err(SymbolError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_corrupt_entry_is_an_error_not_a_miss() {
        let dir = TempDir::new().unwrap();
        let cache = open(&dir, 10).await;
        cache.put(&lib("a.so"), &table("a")).await.unwrap();

        // Clobber the entry file behind the cache's back
        let file = dir.path().join("a.so-DEADBEEF0.symtab");
        std::fs::write(&file, b"garbage").unwrap();

        match cache.get(&lib("a.so")).await {
            Err(SymbolError::Table(_)) => {}
            other => panic!("expected a table format error, got {other:?}"),
        }
    }
}
