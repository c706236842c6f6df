//! A single range fetch, shared by everyone waiting on it.
//!
//! [Chunk::start] spawns the fetch and returns immediately. Any number of tasks may
//! then [Chunk::wait] on clones of the same [Chunk]; all of them are released together
//! when the fetch completes and all of them observe the same result. Waiting after
//! completion returns the retained result without suspending.
//!
//! The fetched bytes are written into a pooled [Buffer] exactly once and never
//! modified afterwards. [Data] handles give read access to them without copying.

use crate::{store::Store, Context, Error};
use futures::StreamExt;
use prometheus_client::registry::Registry;
use rangefetch_pool::{Config as PoolConfig, Pool, Pooled, Reset};
use rangefetch_utils::signal::{Signal, Signaler};
use std::{
    fmt,
    ops::Deref,
    sync::{Arc, OnceLock},
};
use tracing::{debug, warn};

/// Reusable storage for the bytes of one fetched range.
#[derive(Debug, Default)]
pub struct Buffer {
    offset: u64,
    size: u64,
    data: Vec<u8>,
}

impl Buffer {
    /// Offset the buffer was last filled from.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Number of bytes requested for the last fill.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Bytes currently held.
    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

impl Reset for Buffer {
    fn reset(&mut self) {
        self.offset = 0;
        self.size = 0;
        // Keep the allocation for the next fill
        self.data.clear();
    }
}

/// A [Pool] of [Buffer]s shared by the chunks of one or more downloads.
pub type BufferPool = Pool<Buffer>;

/// Create a [BufferPool].
///
/// Idle buffers keep the capacity of the largest range they held, so `max_idle`
/// bounds the memory retained by the pool at roughly `max_idle * range_size`.
pub fn buffer_pool(config: PoolConfig, registry: &mut Registry) -> BufferPool {
    Pool::new(config, registry, Buffer::default)
}

struct Inner {
    offset: u64,
    size: u64,
    result: OnceLock<Result<Pooled<Buffer>, Error>>,
    completion: Signal,
}

impl Inner {
    /// Returns the retained result, if the fetch has completed.
    fn result(self: &Arc<Self>) -> Option<Result<Data, Error>> {
        self.result.get().map(|result| match result {
            Ok(_) => Ok(Data {
                inner: self.clone(),
            }),
            Err(err) => Err(err.clone()),
        })
    }
}

/// An in-flight or completed fetch of `[offset, offset + size)`.
///
/// Cloning a [Chunk] is cheap; all clones observe the same fetch.
#[derive(Clone)]
pub struct Chunk {
    inner: Arc<Inner>,
}

impl Chunk {
    /// Start fetching `[offset, offset + size)` of `bucket`/`key` from `store`.
    ///
    /// A [Buffer] is taken from `pool` and the fetch is spawned on `context` before
    /// returning. Returns [Error::InvalidRange] (without spawning anything) if `size`
    /// is zero or the range ends past `u64::MAX`.
    pub fn start<S: Store>(
        context: &Context,
        store: S,
        pool: &BufferPool,
        bucket: Arc<str>,
        key: Arc<str>,
        offset: u64,
        size: u64,
    ) -> Result<Self, Error> {
        let end = size
            .checked_sub(1)
            .and_then(|last| offset.checked_add(last))
            .ok_or(Error::InvalidRange { offset, size })?;

        let mut buffer = pool.get();
        buffer.offset = offset;
        buffer.size = size;

        let (completer, completion) = Signaler::new();
        let inner = Arc::new(Inner {
            offset,
            size,
            result: OnceLock::new(),
            completion,
        });

        let stopped = context.stopped();
        let task = inner.clone();
        context.spawn(async move {
            debug!(%bucket, %key, offset, size, "fetching range");
            let result = tokio::select! {
                biased;
                _ = stopped.fired() => Err(Error::Canceled),
                result = fetch(&store, &bucket, &key, end, buffer) => result,
            };
            match &result {
                Ok(buffer) => {
                    debug!(%bucket, %key, offset, size, len = buffer.data.len(), "fetched range")
                }
                Err(err) => warn!(%bucket, %key, offset, size, ?err, "failed to fetch range"),
            }

            // Publish the result before releasing waiters, and drop our reference first
            // so a released waiter may hold the last one
            let _ = task.result.set(result);
            drop(task);
            completer.signal();
        });

        Ok(Self { inner })
    }

    /// Offset of the requested range.
    pub fn offset(&self) -> u64 {
        self.inner.offset
    }

    /// Size of the requested range.
    pub fn size(&self) -> u64 {
        self.inner.size
    }

    /// Returns whether the fetch has completed (successfully or not).
    pub fn is_complete(&self) -> bool {
        self.inner.result.get().is_some()
    }

    /// Wait for the fetch to complete and return its result.
    ///
    /// Every waiter receives the same bytes or the same [Error]. If the fetch task is
    /// dropped before completing (e.g. the runtime shut down), returns [Error::Canceled].
    pub async fn wait(&self) -> Result<Data, Error> {
        if let Some(result) = self.inner.result() {
            return result;
        }

        // Only a dropped fetch task resolves the completion without a result
        let _ = self.inner.completion.clone().await;
        let _ = self.inner.result.get_or_init(|| Err(Error::Canceled));
        self.inner.result().unwrap_or(Err(Error::Canceled))
    }

    /// Give up this handle.
    ///
    /// The [Buffer] returns to its pool once every [Chunk] and [Data] handle for this
    /// fetch (including those held by other waiters) has been released or dropped.
    pub fn release(self) {}
}

impl fmt::Debug for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chunk")
            .field("offset", &self.inner.offset)
            .field("size", &self.inner.size)
            .field("complete", &self.is_complete())
            .finish()
    }
}

/// Bytes of a successfully fetched [Chunk].
///
/// May be shorter than the requested size when the object ends inside the range.
/// Holding a [Data] keeps the underlying [Buffer] out of the pool.
#[derive(Clone)]
pub struct Data {
    inner: Arc<Inner>,
}

impl Data {
    /// Offset the bytes were read from.
    pub fn offset(&self) -> u64 {
        self.inner.offset
    }
}

impl Deref for Data {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self.inner.result.get() {
            Some(Ok(buffer)) => &buffer.data,
            _ => &[],
        }
    }
}

impl AsRef<[u8]> for Data {
    fn as_ref(&self) -> &[u8] {
        self
    }
}

impl fmt::Debug for Data {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Data")
            .field("offset", &self.inner.offset)
            .field("len", &self.len())
            .finish()
    }
}

/// Read `[buffer.offset, end]` into `buffer`.
///
/// The body is dropped (closing it) on every return path. Bytes beyond the requested
/// size are drained and discarded.
async fn fetch<S: Store>(
    store: &S,
    bucket: &str,
    key: &str,
    end: u64,
    mut buffer: Pooled<Buffer>,
) -> Result<Pooled<Buffer>, Error> {
    let mut body = store
        .fetch_range(bucket, key, buffer.offset, end)
        .await?;
    let limit = usize::try_from(buffer.size).unwrap_or(usize::MAX);
    while let Some(segment) = body.next().await {
        let segment = segment?;
        let take = limit.saturating_sub(buffer.data.len()).min(segment.len());
        buffer.data.extend_from_slice(&segment[..take]);
    }
    Ok(buffer)
}
