//! Remote content source for the image cache.
//!
//! This module provides the `Fetcher` trait the cache downloads through and
//! `HttpFetcher`, its reqwest-backed implementation. A fetch is a single
//! idempotent GET; no retries, redirects beyond reqwest's defaults, or range
//! requests.

pub mod client;
pub mod error;

pub use client::{Fetcher, HttpFetcher};
pub use error::FetchError;
