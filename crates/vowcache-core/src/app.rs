//! Explicit wiring of the persistence layer for one signed-in user.
//!
//! `AppCore` owns the record store, the image cache and the optimistic
//! slices. UI code receives it (or clones of its parts) instead of reaching
//! for process-wide singletons.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::cache::ContentCache;
use crate::config::Config;
use crate::remote::{Fetcher, HttpFetcher};
use crate::store::{FsBackend, RecordStore, StorageBackend};
use crate::sync::{
    FavoritesDomain, FavoritesStore, NotificationsDomain, NotificationsStore, QuotesDomain,
    QuotesStore,
};

pub struct AppCore<F: Fetcher = HttpFetcher> {
    pub records: Arc<RecordStore>,
    pub images: ContentCache<F>,
    pub favorites: FavoritesStore,
    pub quotes: QuotesStore,
    pub notifications: NotificationsStore,
    user_id: String,
}

impl AppCore<HttpFetcher> {
    /// Open everything at the configured locations with an HTTP fetcher.
    pub async fn start(config: &Config, user_id: impl Into<String>) -> Result<Self> {
        let data_dir = config.data_dir()?;
        debug!(?data_dir, "Record store directory configured");
        let backend: Arc<dyn StorageBackend> = Arc::new(FsBackend::new(data_dir));

        let fetcher = HttpFetcher::with_timeout(config.fetch_timeout())
            .context("Failed to build HTTP client")?;

        Self::with_parts(config, backend, fetcher, user_id).await
    }
}

impl<F: Fetcher> AppCore<F> {
    /// Build from an injected backend and fetcher. Initial slice loads are
    /// attempted here; a failed load is logged and left on the slice.
    pub async fn with_parts(
        config: &Config,
        backend: Arc<dyn StorageBackend>,
        fetcher: F,
        user_id: impl Into<String>,
    ) -> Result<Self> {
        let user_id = user_id.into();

        let records = Arc::new(RecordStore::open(backend).context("Failed to open record store")?);

        let cache_dir = config.cache_dir()?;
        debug!(?cache_dir, "Image cache directory configured");
        let images = ContentCache::open(cache_dir, fetcher).context("Failed to open image cache")?;

        let favorites = FavoritesStore::new(FavoritesDomain::new(&user_id), Arc::clone(&records));
        let quotes = QuotesStore::new(QuotesDomain::new(&user_id), Arc::clone(&records));
        let notifications =
            NotificationsStore::new(NotificationsDomain::new(&user_id), Arc::clone(&records));

        let (fav, quo, notif) = tokio::join!(favorites.load(), quotes.load(), notifications.load());
        for (name, result) in [("favorites", fav), ("quotes", quo), ("notifications", notif)] {
            if let Err(e) = result {
                warn!(slice = name, error = %e, "Initial load failed");
            }
        }

        info!(user = %user_id, "App core started");
        Ok(Self {
            records,
            images,
            favorites,
            quotes,
            notifications,
            user_id,
        })
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Wait for queued mutations to persist and stop the slice workers.
    pub async fn shutdown(self) {
        let Self {
            favorites,
            quotes,
            notifications,
            user_id,
            ..
        } = self;
        tokio::join!(favorites.shutdown(), quotes.shutdown(), notifications.shutdown());
        info!(user = %user_id, "App core stopped");
    }
}
