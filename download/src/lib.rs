//! Coalesce concurrent range fetches of a remote object.
//!
//! A [Download] is bound to a single remote object (a `bucket`/`key` pair) and serves
//! byte ranges of it by offset. Concurrent requests for the same offset share one
//! [Chunk]: exactly one range read is issued against the [Store] and every requester
//! observes the same bytes (or the same [Error]) once it completes.
//!
//! # Coalescing
//!
//! Only requests for the *exact same* offset are coalesced. Two requests whose ranges
//! overlap but start at different offsets are independent and both reach the [Store].
//!
//! # Failures
//!
//! A failed fetch is retained like a successful one: later requests for the same offset
//! observe the same [Error] without a new read. Nothing is retried.
//!
//! # Short Reads
//!
//! A range that runs past the end of the object is not an error. The fetch returns the
//! bytes that exist (possibly none, when the offset is exactly the object length).
//! Only an offset strictly beyond the end of the object fails, with
//! [Error::OffsetBeyondEnd].
//!
//! # Buffer Reuse
//!
//! Fetched bytes live in [chunk::Buffer]s borrowed from a [rangefetch_pool::Pool]. A
//! buffer goes back to its pool once the last [Chunk] and [Data] handle referring to it
//! are dropped, so a result can never be recycled while someone is still reading it.
//!
//! # Example
//!
//! ```rust
//! use prometheus_client::registry::Registry;
//! use rangefetch_download::{chunk, store::memory::Memory, Config, Context, Download};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let store = Memory::default();
//! store.put("bucket", "object", vec![7u8; 4096]);
//!
//! let mut registry = Registry::default();
//! let pool = chunk::buffer_pool(Default::default(), registry.sub_registry_with_prefix("pool"));
//! let config = Config {
//!     range_size: 1024,
//!     ..Config::new("bucket", "object")
//! };
//! let download = Download::new(Context::current(), store, pool, &mut registry, config);
//!
//! let data = download.get(2048).await.unwrap();
//! assert_eq!(data.len(), 1024);
//! # }
//! ```

use std::sync::Arc;
use thiserror::Error;

pub mod chunk;
pub use chunk::{Chunk, Data};
mod context;
pub use context::Context;
mod download;
pub use download::{Config, Download, DEFAULT_CAPACITY, DEFAULT_RANGE_SIZE};
pub mod store;
pub use store::Store;

/// Errors that can occur when fetching a range.
///
/// Errors are cloned to every waiter of a failed [Chunk].
#[derive(Clone, Debug, Error)]
pub enum Error {
    /// The requested range cannot be expressed (zero size or an end past `u64::MAX`).
    #[error("invalid range: offset={offset} size={size}")]
    InvalidRange { offset: u64, size: u64 },
    /// The requested offset lies beyond the end of the object.
    #[error("offset beyond end of object: {offset}")]
    OffsetBeyondEnd { offset: u64, len: Option<u64> },
    /// The store failed to open or stream the range.
    #[error("transport failed: {0}")]
    Transport(Arc<dyn std::error::Error + Send + Sync>),
    /// The fetch was canceled before it completed.
    #[error("fetch canceled")]
    Canceled,
}

impl Error {
    /// Wrap a store failure as [Error::Transport].
    pub fn transport<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Transport(Arc::new(err))
    }
}
