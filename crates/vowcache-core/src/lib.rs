//! Vowcache core library.
//!
//! Local persistence and image caching for the vendor-browsing app:
//!
//! - `cache`: fetch-through on-disk image cache keyed by source URL
//! - `store`: typed, transactional record store with atomic multi-table writes
//! - `sync`: optimistic UI state that reconciles with the record store
//! - `remote`: the fetcher the image cache downloads through
//! - `app`: explicit construction of all of the above for one user

pub mod app;
pub mod cache;
pub mod config;
pub mod error;
pub mod logging;
pub mod remote;
pub mod store;
pub mod sync;

pub use app::AppCore;
pub use cache::{CacheEvent, ContentCache, DisplaySource};
pub use config::Config;
pub use error::{Error, ErrorKind, Result, WriteOp};
pub use remote::{FetchError, Fetcher, HttpFetcher};
pub use store::RecordStore;
pub use sync::{OptimisticSlice, OptimisticSyncStore, SyncDomain, SyncPhase};
