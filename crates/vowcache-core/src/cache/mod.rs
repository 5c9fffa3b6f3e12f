//! On-disk image cache.
//!
//! This module provides the `ContentCache` for keeping remotely fetched
//! images on local storage. Each image is stored as one file named by its
//! cache key, alongside an `index.json` recording where each source URL
//! landed and when.
//!
//! - `key`: URL to cache-key mapping
//! - `index`: the persisted index
//! - `content`: fetch-through, display resolution, eviction

pub mod content;
pub mod index;
pub mod key;

pub use content::{CacheEvent, CacheStats, ContentCache, DisplaySource};
pub use index::{CacheIndex, CacheIndexEntry};
pub use key::{canonicalize, source_key};
