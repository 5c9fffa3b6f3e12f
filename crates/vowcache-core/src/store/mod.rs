//! Embedded structured storage for app data.
//!
//! This module provides the `RecordStore` for vendors and their nested rows,
//! favorites, quotes, reviews, search history and notification settings.
//! Data lives in memory and is written through to a `StorageBackend`:
//!
//! - `FsBackend`: one JSON file per table, atomic batch commits via a journal
//! - `MemBackend`: in-memory, with write-failure injection

pub mod backend;
pub mod fs_backend;
pub mod mem_backend;
pub mod queries;
pub mod record_store;
pub mod records;

pub use backend::{BackendError, StorageBackend, TableRows, TableWrite};
pub use fs_backend::FsBackend;
pub use mem_backend::MemBackend;
pub use queries::RECENT_SEARCH_LIMIT;
pub use record_store::{ReadView, RecordStore, Transaction, WriteBatch};
pub use records::{
    sort_quotes, FavoriteEdge, NotificationChannel, NotificationSettings, Quote, QuoteStatus,
    Record, Review, SearchHistoryEntry, Table, Vendor, VendorBundle, VendorImage, VendorService,
    VendorStyle,
};
