//! Optimistic UI state kept in step with the record store.

mod domains;
mod slice;
mod store;

pub use domains::{
    FavoriteAction, FavoritesDomain, FavoritesStore, NotificationAction, NotificationsDomain,
    NotificationsStore, QuoteAction, QuotesDomain, QuotesStore,
};
pub use slice::{OptimisticSlice, SyncPhase};
pub use store::{OptimisticSyncStore, SyncDomain};
