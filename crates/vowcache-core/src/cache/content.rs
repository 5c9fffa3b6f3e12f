use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Duration;
use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::sync::broadcast;
use tracing::{debug, info, trace, warn};

use super::index::{temp_path, CacheIndex, CacheIndexEntry, INDEX_FILE, TEMP_SUFFIX};
use super::key;
use crate::error::{Error, Result};
use crate::remote::Fetcher;

/// Capacity of the cache event channel. Slow subscribers miss old events
/// (`RecvError::Lagged`) rather than blocking downloads.
const EVENT_CHANNEL_CAPACITY: usize = 64;

type SharedFetch = Shared<BoxFuture<'static, Result<PathBuf>>>;

/// What the UI should render for an image right now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisplaySource {
    /// Cached copy on disk.
    Local(PathBuf),
    /// Not cached yet; render the remote URL while the download runs.
    Remote(String),
}

impl DisplaySource {
    pub fn is_local(&self) -> bool {
        matches!(self, DisplaySource::Local(_))
    }
}

/// Published whenever a download settles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEvent {
    Cached { source_key: String, path: PathBuf },
    Failed { source_key: String, error: Error },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub total_bytes: u64,
}

/// Result of checking the cache before awaiting anything.
enum Pending {
    Ready(PathBuf),
    InFlight(SharedFetch),
}

/// Disk-backed image cache with fetch-through and in-flight de-duplication.
///
/// Cheap to clone; clones share the index, the in-flight registry and the
/// event channel.
pub struct ContentCache<F: Fetcher> {
    inner: Arc<Inner<F>>,
}

impl<F: Fetcher> Clone for ContentCache<F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<F> {
    dir: PathBuf,
    index: Mutex<CacheIndex>,
    /// Downloads in progress, keyed by cache key. Lock order: `in_flight`
    /// before `index`.
    in_flight: Mutex<HashMap<String, SharedFetch>>,
    fetcher: F,
    events: broadcast::Sender<CacheEvent>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl<F: Fetcher> ContentCache<F> {
    pub fn open(dir: PathBuf, fetcher: F) -> Result<Self> {
        std::fs::create_dir_all(&dir).map_err(|e| Error::cache_storage(&dir, e))?;
        let index = CacheIndex::load(&dir);
        info!(dir = %dir.display(), entries = index.len(), "Content cache opened");

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Ok(Self {
            inner: Arc::new(Inner {
                dir,
                index: Mutex::new(index),
                in_flight: Mutex::new(HashMap::new()),
                fetcher,
                events,
            }),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.inner.dir
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.inner.events.subscribe()
    }

    /// Cached path for `url`, without touching the network.
    ///
    /// An index entry whose file has gone missing is dropped and reported as
    /// absent.
    pub fn lookup(&self, url: &str) -> Option<PathBuf> {
        self.inner.lookup(key::source_key(url))
    }

    /// Return a cached copy of `url`, downloading it first on a miss.
    ///
    /// Concurrent calls that map to the same cache key share one download.
    pub async fn fetch_through(&self, url: &str) -> Result<PathBuf> {
        match self.join_or_start(url) {
            Pending::Ready(path) => Ok(path),
            Pending::InFlight(fetch) => fetch.await,
        }
    }

    fn join_or_start(&self, url: &str) -> Pending {
        if let Some(path) = self.lookup(url) {
            return Pending::Ready(path);
        }

        let cache_key = key::canonicalize(url);
        let mut in_flight = lock(&self.inner.in_flight);
        if let Some(existing) = in_flight.get(&cache_key) {
            trace!(cache_key = %cache_key, "Joining in-flight fetch");
            return Pending::InFlight(existing.clone());
        }

        // A download may have finished between the lookup above and taking
        // the registry lock; it records its entry before deregistering.
        if let Some(path) = self.lookup(url) {
            return Pending::Ready(path);
        }

        debug!(url, cache_key = %cache_key, "Cache miss, starting fetch");
        let fetch = Arc::clone(&self.inner)
            .download(url.to_string(), cache_key.clone())
            .boxed()
            .shared();
        in_flight.insert(cache_key, fetch.clone());
        Pending::InFlight(fetch)
    }

    /// Local path if cached, otherwise the remote URL immediately while the
    /// download continues in the background. Never waits.
    pub fn resolve_for_display(&self, url: &str) -> DisplaySource {
        if let Some(path) = self.lookup(url) {
            return DisplaySource::Local(path);
        }

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let cache = self.clone();
                let url = url.to_string();
                handle.spawn(async move {
                    if let Err(e) = cache.fetch_through(&url).await {
                        debug!(url = %url, error = %e, "Background fetch failed");
                    }
                });
            }
            Err(_) => warn!(url, "No async runtime available, skipping background fetch"),
        }

        DisplaySource::Remote(url.to_string())
    }

    /// Delete the cache directory and clear the index.
    pub fn evict_all(&self) -> Result<()> {
        let mut index = lock(&self.inner.index);
        let dropped = index.len();
        index.clear();

        match std::fs::remove_dir_all(&self.inner.dir) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(Error::cache_storage(&self.inner.dir, e)),
        }

        info!(entries = dropped, "Content cache evicted");
        Ok(())
    }

    /// Evict entries cached more than `max_age` ago. Returns how many were
    /// removed.
    pub fn prune_older_than(&self, max_age: Duration) -> Result<usize> {
        let mut index = lock(&self.inner.index);
        let expired: Vec<CacheIndexEntry> = index
            .entries()
            .filter(|e| e.is_older_than(max_age))
            .cloned()
            .collect();

        if expired.is_empty() {
            return Ok(0);
        }

        for entry in &expired {
            index.remove(&entry.source_key);
            remove_if_exists(&self.inner.dir.join(&entry.cache_key))?;
        }
        index.save(&self.inner.dir)?;

        debug!(removed = expired.len(), "Pruned expired cache entries");
        Ok(expired.len())
    }

    /// Delete files in the cache directory that no index entry refers to,
    /// including temp files left behind by interrupted downloads.
    pub fn prune_orphans(&self) -> Result<usize> {
        let in_flight = lock(&self.inner.in_flight);
        let index = lock(&self.inner.index);

        let entries = match std::fs::read_dir(&self.inner.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(Error::cache_storage(&self.inner.dir, e)),
        };

        let mut removed = 0;
        for entry in entries {
            let entry = entry.map_err(|e| Error::cache_storage(&self.inner.dir, e))?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };

            let keep = if name == INDEX_FILE {
                true
            } else if let Some(stem) = temp_stem(name) {
                in_flight.contains_key(stem)
            } else {
                index.references(name)
            };

            if !keep {
                trace!(file = name, "Removing orphaned cache file");
                remove_if_exists(&path)?;
                removed += 1;
            }
        }

        if removed > 0 {
            info!(removed, "Pruned orphaned cache files");
        }
        Ok(removed)
    }

    pub fn stats(&self) -> CacheStats {
        let index = lock(&self.inner.index);
        CacheStats {
            entries: index.len(),
            total_bytes: index.entries().filter_map(|e| e.size_bytes).sum(),
        }
    }

    /// Index entry for `url`, if any.
    pub fn entry(&self, url: &str) -> Option<CacheIndexEntry> {
        lock(&self.inner.index).get(key::source_key(url)).cloned()
    }
}

impl<F: Fetcher> Inner<F> {
    fn lookup(&self, source_key: &str) -> Option<PathBuf> {
        let mut index = lock(&self.index);
        let entry = index.get(source_key)?;
        let path = self.dir.join(&entry.cache_key);
        if path.is_file() {
            Some(path)
        } else {
            debug!(source_key, "Cached file missing, dropping index entry");
            index.remove(source_key);
            None
        }
    }

    async fn download(self: Arc<Self>, url: String, cache_key: String) -> Result<PathBuf> {
        let source_key = key::source_key(&url).to_string();
        let result = self.download_to_disk(&url, &source_key, &cache_key).await;

        lock(&self.in_flight).remove(&cache_key);

        let event = match &result {
            Ok(path) => CacheEvent::Cached {
                source_key,
                path: path.clone(),
            },
            Err(error) => CacheEvent::Failed {
                source_key,
                error: error.clone(),
            },
        };
        if self.events.send(event).is_err() {
            trace!("No subscribers for cache event");
        }

        result
    }

    async fn download_to_disk(
        self: &Arc<Self>,
        url: &str,
        source_key: &str,
        cache_key: &str,
    ) -> Result<PathBuf> {
        let bytes = self.fetcher.fetch(url).await.map_err(|e| {
            warn!(url, error = %e, "Image fetch failed");
            Error::FetchFailed {
                url: url.to_string(),
                reason: e.to_string(),
            }
        })?;

        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| Error::cache_storage(&self.dir, e))?;

        let target = self.dir.join(cache_key);
        let tmp = temp_path(&self.dir, cache_key);
        let written = match tokio::fs::write(&tmp, &bytes).await {
            Ok(()) => tokio::fs::rename(&tmp, &target).await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(Error::cache_storage(&target, e));
        }

        let entry = CacheIndexEntry::new(
            source_key.to_string(),
            cache_key.to_string(),
            Some(bytes.len() as u64),
        );
        // Index serialization and rename happen off the async workers.
        let inner = Arc::clone(self);
        let recorded = target.clone();
        tokio::task::spawn_blocking(move || inner.record(entry, &recorded))
            .await
            .map_err(|e| Error::cache_storage(&self.dir, e))??;

        debug!(url, bytes = bytes.len(), "Image cached");
        Ok(target)
    }

    /// Add the entry and persist the index; on failure the file is removed
    /// so no unindexed copy stays behind.
    fn record(&self, entry: CacheIndexEntry, target: &Path) -> Result<()> {
        let mut index = lock(&self.index);
        let source_key = entry.source_key.clone();
        index.insert(entry);
        if let Err(e) = index.save(&self.dir) {
            warn!(error = %e, "Failed to persist cache index");
            index.remove(&source_key);
            let _ = std::fs::remove_file(target);
            return Err(e);
        }
        Ok(())
    }
}

/// Cache key embedded in a temp file name (`.{key}.{random}.tmp`).
fn temp_stem(name: &str) -> Option<&str> {
    let inner = name.strip_prefix('.')?.strip_suffix(TEMP_SUFFIX)?;
    inner.rsplit_once('.').map(|(stem, _)| stem)
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::cache_storage(path, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::FetchError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct FakeFetcher {
        calls: AtomicUsize,
        fail: AtomicBool,
    }

    impl FakeFetcher {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl Fetcher for Arc<FakeFetcher> {
        async fn fetch(&self, url: &str) -> std::result::Result<Vec<u8>, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            if self.fail.load(Ordering::SeqCst) {
                return Err(FetchError::ServerError("offline".to_string()));
            }
            Ok(format!("bytes of {}", key::source_key(url)).into_bytes())
        }
    }

    fn setup() -> (tempfile::TempDir, Arc<FakeFetcher>, ContentCache<Arc<FakeFetcher>>) {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(FakeFetcher::new());
        let cache = ContentCache::open(dir.path().join("images"), Arc::clone(&fetcher)).unwrap();
        (dir, fetcher, cache)
    }

    #[tokio::test]
    async fn test_fetch_through_then_lookup() {
        let (_dir, fetcher, cache) = setup();
        let url = "https://img/a.jpg";
        assert!(cache.lookup(url).is_none());

        let path = cache.fetch_through(url).await.unwrap();
        assert_eq!(cache.lookup(url), Some(path.clone()));
        assert_eq!(std::fs::read(&path).unwrap(), b"bytes of https://img/a.jpg");

        // Second call is a hit
        cache.fetch_through(url).await.unwrap();
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.stats().entries, 1);
    }

    #[tokio::test]
    async fn test_concurrent_fetches_share_one_download() {
        let (_dir, fetcher, cache) = setup();
        let url = "https://img/shared.jpg";

        let calls = (0..8).map(|_| cache.fetch_through(url));
        let results = futures::future::join_all(calls).await;

        let first = results[0].clone().unwrap();
        assert!(results.iter().all(|r| r.as_ref() == Ok(&first)));
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_different_keys_fetch_independently() {
        let (_dir, fetcher, cache) = setup();
        let (a, b) = tokio::join!(
            cache.fetch_through("https://img/a.jpg"),
            cache.fetch_through("https://img/b.jpg"),
        );
        assert_ne!(a.unwrap(), b.unwrap());
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_similar_urls_keep_their_own_bytes() {
        let (_dir, fetcher, cache) = setup();
        let dash = "https://img/a-b.jpg";
        let underscore = "https://img/a_b.jpg";

        let dash_path = cache.fetch_through(dash).await.unwrap();
        let underscore_path = cache.fetch_through(underscore).await.unwrap();

        assert_ne!(dash_path, underscore_path);
        assert_eq!(cache.lookup(dash), Some(dash_path.clone()));
        assert_eq!(std::fs::read(&dash_path).unwrap(), b"bytes of https://img/a-b.jpg");
        assert_eq!(std::fs::read(&underscore_path).unwrap(), b"bytes of https://img/a_b.jpg");
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_lookup_self_heals_missing_file() {
        let (_dir, _fetcher, cache) = setup();
        let url = "https://img/a.jpg";
        let path = cache.fetch_through(url).await.unwrap();

        std::fs::remove_file(&path).unwrap();
        assert!(cache.lookup(url).is_none());
        assert!(cache.entry(url).is_none());
    }

    #[tokio::test]
    async fn test_failed_fetch_leaves_nothing_behind() {
        let (_dir, fetcher, cache) = setup();
        fetcher.fail.store(true, Ordering::SeqCst);

        let err = cache.fetch_through("https://img/a.jpg").await.unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::FetchFailed);
        assert!(cache.entry("https://img/a.jpg").is_none());

        let files: Vec<_> = std::fs::read_dir(cache.dir()).unwrap().collect();
        assert!(files.is_empty());
    }

    #[tokio::test]
    async fn test_resolve_for_display_publishes_local_path() {
        let (_dir, _fetcher, cache) = setup();
        let mut events = cache.subscribe();
        let url = "https://img/a.jpg?cb=123";

        assert_eq!(cache.resolve_for_display(url), DisplaySource::Remote(url.to_string()));

        match events.recv().await.unwrap() {
            CacheEvent::Cached { source_key, path } => {
                assert_eq!(source_key, "https://img/a.jpg");
                assert!(path.is_file());
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(cache.resolve_for_display(url).is_local());
    }

    #[tokio::test]
    async fn test_index_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(FakeFetcher::new());
        let cache_dir = dir.path().join("images");
        {
            let cache = ContentCache::open(cache_dir.clone(), Arc::clone(&fetcher)).unwrap();
            cache.fetch_through("https://img/a.jpg").await.unwrap();
        }

        let reopened = ContentCache::open(cache_dir, Arc::clone(&fetcher)).unwrap();
        assert!(reopened.lookup("https://img/a.jpg").is_some());
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_evict_all() {
        let (_dir, _fetcher, cache) = setup();
        cache.fetch_through("https://img/a.jpg").await.unwrap();

        cache.evict_all().unwrap();
        assert!(cache.lookup("https://img/a.jpg").is_none());
        assert!(!cache.dir().exists());

        // Directory already gone
        cache.evict_all().unwrap();

        // Cache still usable afterwards
        cache.fetch_through("https://img/a.jpg").await.unwrap();
        assert!(cache.lookup("https://img/a.jpg").is_some());
    }

    #[tokio::test]
    async fn test_prune_orphans() {
        let (_dir, _fetcher, cache) = setup();
        let kept = cache.fetch_through("https://img/a.jpg").await.unwrap();
        std::fs::write(cache.dir().join("stray.img"), b"x").unwrap();
        std::fs::write(cache.dir().join(".gone.img.00ff.tmp"), b"x").unwrap();

        assert_eq!(cache.prune_orphans().unwrap(), 2);
        assert!(kept.is_file());
        assert!(cache.dir().join(INDEX_FILE).is_file());
    }

    #[tokio::test]
    async fn test_prune_older_than() {
        let (_dir, _fetcher, cache) = setup();
        let path = cache.fetch_through("https://img/a.jpg").await.unwrap();

        assert_eq!(cache.prune_older_than(Duration::hours(1)).unwrap(), 0);
        assert_eq!(cache.prune_older_than(Duration::zero() - Duration::seconds(1)).unwrap(), 1);
        assert!(!path.exists());
        assert_eq!(cache.stats(), CacheStats::default());
    }

    #[test]
    fn test_temp_stem() {
        assert_eq!(temp_stem(".a_jpg.img.0123.tmp"), Some("a_jpg.img"));
        assert_eq!(temp_stem("a_jpg.img"), None);
    }
}
