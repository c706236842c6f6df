//! Remote object stores that [Chunk](crate::Chunk)s read ranges from.
//!
//! Implementations:
//! - [memory::Memory]: objects kept in memory, with hooks to delay and fail requests.
//! - `s3::S3` (feature `aws`): objects in Amazon S3 (or any S3-compatible service).

use crate::Error;
use bytes::Bytes;
use futures::Stream;
use std::future::Future;

pub mod memory;
#[cfg(feature = "aws")]
pub mod s3;

/// A remote store of byte-addressable objects.
pub trait Store: Clone + Send + Sync + 'static {
    /// The body of an opened range.
    ///
    /// The body is read to exhaustion and then dropped by the caller. Dropping it
    /// must release the underlying connection or file.
    type Body: Stream<Item = Result<Bytes, Error>> + Send + Unpin + 'static;

    /// Open bytes `[start, end]` (both inclusive) of the object at `bucket`/`key`.
    ///
    /// If the object is shorter than `end + 1`, the body ends early with whatever bytes
    /// exist. If `start` equals the object length the body is empty. If `start` is
    /// strictly greater than the object length, returns [Error::OffsetBeyondEnd].
    fn fetch_range(
        &self,
        bucket: &str,
        key: &str,
        start: u64,
        end: u64,
    ) -> impl Future<Output = Result<Self::Body, Error>> + Send;
}
