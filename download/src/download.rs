//! Serve ranges of one object, starting at most one fetch per offset.

use crate::{
    chunk::{BufferPool, Chunk, Data},
    store::Store,
    Context, Error,
};
use async_lock::RwLock;
use prometheus_client::{
    metrics::{counter::Counter, gauge::Gauge},
    registry::Registry,
};
use rangefetch_utils::NZUsize;
use std::{
    collections::{HashMap, VecDeque},
    num::NonZeroUsize,
    sync::Arc,
};
use tracing::trace;

/// Range size used when [Config::range_size] is zero (4 MiB).
pub const DEFAULT_RANGE_SIZE: u64 = 4 * 1024 * 1024;

/// Default number of chunks a [Download] retains.
pub const DEFAULT_CAPACITY: NonZeroUsize = NZUsize!(1024);

/// Configuration for a [Download].
#[derive(Clone, Debug)]
pub struct Config {
    /// Bucket holding the object.
    pub bucket: String,
    /// Key of the object.
    pub key: String,
    /// Number of bytes fetched per offset. Zero selects [DEFAULT_RANGE_SIZE].
    pub range_size: u64,
    /// Maximum number of chunks retained before completed ones are evicted
    /// (oldest first). `None` retains every chunk for the life of the [Download].
    pub capacity: Option<NonZeroUsize>,
}

impl Config {
    /// Default configuration for `bucket`/`key`.
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
            range_size: DEFAULT_RANGE_SIZE,
            capacity: Some(DEFAULT_CAPACITY),
        }
    }
}

struct Metrics {
    fetches: Counter,
    hits: Counter,
    evictions: Counter,
    chunks: Gauge,
}

impl Metrics {
    fn new(registry: &mut Registry) -> Self {
        let metrics = Self {
            fetches: Counter::default(),
            hits: Counter::default(),
            evictions: Counter::default(),
            chunks: Gauge::default(),
        };
        registry.register(
            "fetches",
            "Number of range fetches started",
            metrics.fetches.clone(),
        );
        registry.register(
            "hits",
            "Number of gets served by an existing chunk",
            metrics.hits.clone(),
        );
        registry.register(
            "evictions",
            "Number of completed chunks evicted",
            metrics.evictions.clone(),
        );
        registry.register(
            "chunks",
            "Number of chunks currently retained",
            metrics.chunks.clone(),
        );
        metrics
    }
}

/// Chunks by offset, with offsets in insertion order for eviction.
#[derive(Default)]
struct Inflight {
    chunks: HashMap<u64, Chunk>,
    order: VecDeque<u64>,
}

impl Inflight {
    fn insert(&mut self, offset: u64, chunk: Chunk) {
        self.chunks.insert(offset, chunk);
        self.order.push_back(offset);
    }

    /// Evict the oldest completed chunks until at most `capacity` remain.
    ///
    /// Pending chunks are never evicted, so the map may stay above `capacity`
    /// until they complete.
    fn evict(&mut self, capacity: usize) -> u64 {
        let mut evicted = 0;
        while self.chunks.len() > capacity {
            let Some(index) = self.order.iter().position(|offset| {
                self.chunks
                    .get(offset)
                    .is_some_and(|chunk| chunk.is_complete())
            }) else {
                break;
            };
            if let Some(offset) = self.order.remove(index) {
                self.chunks.remove(&offset);
                trace!(offset, "evicted chunk");
                evicted += 1;
            }
        }
        evicted
    }
}

/// Serves ranges of one remote object, fetching each offset at most once at a time.
///
/// Every [Download::get] for an offset that already has a [Chunk] (in flight or
/// completed) waits on that chunk instead of starting a new fetch. Completed chunks are
/// retained, successes and failures alike, until evicted (see [Config::capacity]).
pub struct Download<S: Store> {
    context: Context,
    store: S,
    pool: BufferPool,
    bucket: Arc<str>,
    key: Arc<str>,
    range_size: u64,
    capacity: Option<NonZeroUsize>,

    inflight: RwLock<Inflight>,
    metrics: Metrics,
}

impl<S: Store> Download<S> {
    /// Create a [Download] of `config.bucket`/`config.key` from `store`.
    ///
    /// Fetches run on `context` and take their buffers from `pool`. Metrics are
    /// registered on `registry`.
    pub fn new(
        context: Context,
        store: S,
        pool: BufferPool,
        registry: &mut Registry,
        config: Config,
    ) -> Self {
        let range_size = match config.range_size {
            0 => DEFAULT_RANGE_SIZE,
            size => size,
        };
        Self {
            context,
            store,
            pool,
            bucket: config.bucket.into(),
            key: config.key.into(),
            range_size,
            capacity: config.capacity,
            inflight: RwLock::new(Inflight::default()),
            metrics: Metrics::new(registry),
        }
    }

    /// Returns the bytes `[offset, offset + range_size)` of the object.
    ///
    /// Concurrent calls with the same `offset` share a single fetch and receive identical
    /// results. The result is shorter than `range_size` when the object ends inside the
    /// range, and empty when `offset` equals the object length.
    ///
    /// Returns [Error::InvalidRange] without fetching if the range cannot be expressed.
    pub async fn get(&self, offset: u64) -> Result<Data, Error> {
        let (chunk, existing) = self.chunk(offset).await?;
        if existing {
            self.metrics.hits.inc();
        }
        chunk.wait().await
    }

    /// Start fetching `offset` (unless it is already fetched or in flight) without
    /// waiting for the result.
    pub async fn prefetch(&self, offset: u64) -> Result<(), Error> {
        self.chunk(offset).await.map(|_| ())
    }

    /// Returns the [Chunk] for `offset`, starting it if none exists, and whether it
    /// already existed.
    async fn chunk(&self, offset: u64) -> Result<(Chunk, bool), Error> {
        // Fast path: the chunk already exists
        let existing = self.inflight.read().await.chunks.get(&offset).cloned();
        if let Some(chunk) = existing {
            trace!(offset, complete = chunk.is_complete(), "joined chunk");
            return Ok((chunk, true));
        }

        // Slow path: someone may have inserted it while we were unlocked
        let mut inflight = self.inflight.write().await;
        if let Some(chunk) = inflight.chunks.get(&offset) {
            trace!(offset, complete = chunk.is_complete(), "joined chunk");
            return Ok((chunk.clone(), true));
        }
        let chunk = Chunk::start(
            &self.context,
            self.store.clone(),
            &self.pool,
            self.bucket.clone(),
            self.key.clone(),
            offset,
            self.range_size,
        )?;
        self.metrics.fetches.inc();
        inflight.insert(offset, chunk.clone());
        if let Some(capacity) = self.capacity {
            let evicted = inflight.evict(capacity.get());
            self.metrics.evictions.inc_by(evicted);
        }
        self.metrics.chunks.set(inflight.chunks.len() as i64);
        Ok((chunk, false))
    }

    /// Returns the number of chunks currently retained.
    pub async fn len(&self) -> usize {
        self.inflight.read().await.chunks.len()
    }

    /// Returns whether no chunks are retained.
    pub async fn is_empty(&self) -> bool {
        self.inflight.read().await.chunks.is_empty()
    }

    /// Returns the number of bytes fetched per offset.
    pub fn range_size(&self) -> u64 {
        self.range_size
    }

    /// Returns the bucket holding the object.
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Returns the key of the object.
    pub fn key(&self) -> &str {
        &self.key
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        chunk::buffer_pool,
        mocks::{object, traced, OBJECT_SIZE},
        store::memory::{Failure, Memory},
    };
    use bytes::Bytes;
    use futures::future::join_all;
    use prometheus_client::encoding::text::encode;
    use rangefetch_pool::Config as PoolConfig;
    use rangefetch_utils::signal::Signaler;
    use std::time::Duration;
    use tokio::runtime::Handle;

    const BUCKET: &str = "bucket";
    const KEY: &str = "object";

    fn setup(seed: u64) -> (Memory, Bytes) {
        traced();
        let data = object(seed, OBJECT_SIZE);
        let store = Memory::default();
        store.put(BUCKET, KEY, data.clone());
        (store, data)
    }

    fn download(
        context: Context,
        store: &Memory,
        range_size: u64,
        capacity: Option<NonZeroUsize>,
    ) -> (Download<Memory>, Registry) {
        let mut registry = Registry::default();
        let pool = buffer_pool(
            PoolConfig::default(),
            registry.sub_registry_with_prefix("pool"),
        );
        let config = Config {
            range_size,
            capacity,
            ..Config::new(BUCKET, KEY)
        };
        let download = Download::new(context, store.clone(), pool, &mut registry, config);
        (download, registry)
    }

    #[tokio::test]
    async fn test_download() {
        let (store, data) = setup(0);
        let (download, _) = download(Context::current(), &store, 512, None);
        assert_eq!(download.bucket(), BUCKET);
        assert_eq!(download.key(), KEY);

        let fetched = download.get(0).await.unwrap();
        assert_eq!(fetched.len(), 512);
        assert_eq!(&*fetched, &data[..512]);

        let fetched = download.get(512 * 3).await.unwrap();
        assert_eq!(fetched.len(), 512);
        assert_eq!(&*fetched, &data[1536..2048]);
        assert_eq!(download.len().await, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_download() {
        let (store, data) = setup(1);
        let (release, gate) = Signaler::new();
        store.gate(gate);
        let (download, _) = download(Context::current(), &store, 512, None);
        let download = Arc::new(download);

        let requests: Vec<_> = (0..10)
            .map(|_| {
                let download = download.clone();
                tokio::spawn(async move { download.get(32).await })
            })
            .collect();

        // Hold the fetch until every request has joined it
        while store.requests() == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        release.signal();

        let results: Vec<_> = join_all(requests)
            .await
            .into_iter()
            .map(|result| result.unwrap().unwrap())
            .collect();
        for fetched in &results {
            assert_eq!(&**fetched, &data[32..544]);
        }
        assert_eq!(store.requests(), 1);
        assert_eq!(download.len().await, 1);
    }

    #[tokio::test]
    async fn test_overlapping_offsets_not_coalesced() {
        let (store, data) = setup(2);
        let (download, _) = download(Context::current(), &store, 512, None);

        let (first, second) = futures::join!(download.get(0), download.get(256));
        assert_eq!(&*first.unwrap(), &data[..512]);
        assert_eq!(&*second.unwrap(), &data[256..768]);
        assert_eq!(store.requests(), 2);
    }

    #[tokio::test]
    async fn test_offset_beyond_end() {
        let (store, _) = setup(3);
        let (download, _) = download(Context::current(), &store, 512, None);

        let offset = OBJECT_SIZE as u64 + 1;
        let result = download.get(offset).await;
        assert!(matches!(result, Err(Error::OffsetBeyondEnd { .. })));

        // The failure is retained rather than retried
        let result = download.get(offset).await;
        assert!(matches!(result, Err(Error::OffsetBeyondEnd { .. })));
        assert_eq!(store.requests(), 1);
    }

    #[tokio::test]
    async fn test_offset_at_end() {
        let (store, _) = setup(4);
        let (download, _) = download(Context::current(), &store, 512, None);
        let fetched = download.get(OBJECT_SIZE as u64).await.unwrap();
        assert!(fetched.is_empty());
    }

    #[tokio::test]
    async fn test_short_read() {
        let (store, data) = setup(5);
        let range_size = (OBJECT_SIZE - 512 + 1) as u64;
        let (download, _) = download(Context::current(), &store, range_size, None);

        let fetched = download.get(512).await.unwrap();
        assert_eq!(fetched.len(), OBJECT_SIZE - 512);
        assert_eq!(&*fetched, &data[512..]);
    }

    #[tokio::test]
    async fn test_default_range_size() {
        let (store, data) = setup(6);
        let (download, _) = download(Context::current(), &store, 0, None);
        assert_eq!(download.range_size(), DEFAULT_RANGE_SIZE);

        // The whole object fits in one default range
        let fetched = download.get(0).await.unwrap();
        assert_eq!(&*fetched, &data[..]);
    }

    #[tokio::test]
    async fn test_invalid_range_not_inserted() {
        let (store, _) = setup(7);
        let (download, _) = download(Context::current(), &store, 512, None);

        let result = download.get(u64::MAX).await;
        assert!(matches!(
            result,
            Err(Error::InvalidRange {
                offset: u64::MAX,
                size: 512
            })
        ));
        assert!(download.is_empty().await);
        assert_eq!(store.requests(), 0);
    }

    #[tokio::test]
    async fn test_failure_retained() {
        let (store, _) = setup(8);
        let (download, _) = download(Context::current(), &store, 512, None);

        store.fail(Some(Failure::Open("service unavailable".into())));
        assert!(matches!(download.get(0).await, Err(Error::Transport(_))));

        // Clearing the failure does not help an offset that already failed
        store.fail(None);
        assert!(matches!(download.get(0).await, Err(Error::Transport(_))));
        assert_eq!(store.requests(), 1);

        // Other offsets are unaffected
        assert!(download.get(512).await.is_ok());
        assert_eq!(store.requests(), 2);
    }

    #[tokio::test]
    async fn test_canceled() {
        let (store, _) = setup(9);
        let (_release, gate) = Signaler::new();
        store.gate(gate);

        let (stop, stopped) = Signaler::new();
        let context = Context::new(Handle::current(), stopped);
        let (download, _) = download(context, &store, 512, None);
        let download = Arc::new(download);

        let request = {
            let download = download.clone();
            tokio::spawn(async move { download.get(0).await })
        };
        while store.requests() == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        stop.signal();
        assert!(matches!(request.await.unwrap(), Err(Error::Canceled)));

        // The cancellation is retained for the offset
        assert!(matches!(download.get(0).await, Err(Error::Canceled)));
        assert_eq!(store.requests(), 1);
        assert_eq!(store.open_bodies(), 0);
    }

    #[tokio::test]
    async fn test_eviction() {
        let (store, data) = setup(10);
        let (download, _) = download(Context::current(), &store, 512, Some(NZUsize!(2)));

        let first = download.get(0).await.unwrap();
        download.get(512).await.unwrap();
        download.get(1024).await.unwrap();
        assert_eq!(download.len().await, 2);

        // Handles to an evicted chunk stay valid
        assert_eq!(&*first, &data[..512]);

        // The evicted offset is fetched again
        assert_eq!(&*download.get(0).await.unwrap(), &data[..512]);
        assert_eq!(store.requests(), 4);

        // The most recent offsets were retained
        download.get(1024).await.unwrap();
        assert_eq!(store.requests(), 4);
    }

    #[tokio::test]
    async fn test_eviction_skips_pending() {
        let (store, _) = setup(11);
        let (release, gate) = Signaler::new();
        store.gate(gate);
        let (download, _) = download(Context::current(), &store, 512, Some(NZUsize!(1)));

        // Both chunks are in flight, so neither can be evicted
        download.prefetch(0).await.unwrap();
        download.prefetch(512).await.unwrap();
        assert_eq!(download.len().await, 2);

        release.signal();
        download.get(0).await.unwrap();
        download.get(512).await.unwrap();
        assert_eq!(download.len().await, 2);

        // The next insert evicts every completed chunk but keeps the pending one
        let (_hold, gate) = Signaler::new();
        store.gate(gate);
        download.prefetch(1024).await.unwrap();
        assert_eq!(download.len().await, 1);
        assert!(!download.chunk(1024).await.unwrap().0.is_complete());
    }

    #[tokio::test]
    async fn test_unbounded() {
        let (store, _) = setup(12);
        let (download, _) = download(Context::current(), &store, 512, None);
        for i in 0..16 {
            download.get(i * 512).await.unwrap();
        }
        assert_eq!(download.len().await, 16);
    }

    #[tokio::test]
    async fn test_buffers_recycled() {
        let (store, _) = setup(13);
        let mut registry = Registry::default();
        let pool = buffer_pool(PoolConfig::default(), &mut registry);
        let config = Config {
            range_size: 512,
            capacity: Some(NZUsize!(1)),
            ..Config::new(BUCKET, KEY)
        };
        let download = Download::new(
            Context::current(),
            store.clone(),
            pool.clone(),
            &mut Registry::default(),
            config,
        );

        // Results dropped right away, so evicted chunks hand their buffer back
        for i in 0..4 {
            let fetched = download.get(i * 512).await.unwrap();
            assert_eq!(fetched.offset(), i * 512);
        }
        assert_eq!(download.len().await, 1);
        assert_eq!(pool.idle(), 1);
    }

    #[tokio::test]
    async fn test_metrics() {
        let (store, _) = setup(14);
        let (download, registry) = download(Context::current(), &store, 512, Some(NZUsize!(1)));

        download.get(0).await.unwrap();
        download.get(0).await.unwrap();
        download.get(512).await.unwrap();

        let mut buffer = String::new();
        encode(&mut buffer, &registry).unwrap();
        assert!(buffer.contains("fetches_total 2"));
        assert!(buffer.contains("hits_total 1"));
        assert!(buffer.contains("evictions_total 1"));
        assert!(buffer.contains("chunks 1"));
        assert!(buffer.contains("pool_created_total"));
    }

    #[tokio::test]
    async fn test_prefetch_not_counted_as_hit() {
        let (store, data) = setup(15);
        let (download, registry) = download(Context::current(), &store, 512, None);

        // Repeated prefetches join the same fetch without serving anything
        download.prefetch(0).await.unwrap();
        download.prefetch(0).await.unwrap();
        assert_eq!(&*download.get(0).await.unwrap(), &data[..512]);
        assert_eq!(store.requests(), 1);

        let mut buffer = String::new();
        encode(&mut buffer, &registry).unwrap();
        assert!(buffer.contains("fetches_total 1"));
        assert!(buffer.contains("hits_total 1"));
    }
}
