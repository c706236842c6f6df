//! Recycle short-lived values through a concurrent free list.
//!
//! A [Pool] hands out values produced by an injected factory and takes them back
//! once they are no longer needed, so request-scoped objects (and the allocations
//! they own) are reused instead of being rebuilt for every request.
//!
//! # Thread Safety
//!
//! [Pool] is `Send + Sync` and cheap to clone. The free list is a lock-free
//! bounded queue ([`crossbeam_queue::ArrayQueue`]), so values can be acquired and
//! returned from any thread without coordination.
//!
//! # Value Lifecycle
//!
//! [Pool::get] returns a [Pooled] guard. When the guard is dropped the value is
//! [Reset] and pushed back onto the free list. If the free list is already full
//! the value is discarded instead. Guards hold a weak reference to the pool: a
//! guard dropped after its pool is gone simply drops its value.
//!
//! Values never leave the free list without having been reset, so nothing a
//! previous holder wrote is observable by the next one.
//!
//! # Example
//!
//! ```rust
//! use prometheus_client::registry::Registry;
//! use rangefetch_pool::{Config, Pool, Reset};
//!
//! #[derive(Default)]
//! struct Scratch(Vec<u8>);
//!
//! impl Reset for Scratch {
//!     fn reset(&mut self) {
//!         self.0.clear();
//!     }
//! }
//!
//! let mut registry = Registry::default();
//! let pool = Pool::new(Config::default(), &mut registry, Scratch::default);
//!
//! let mut scratch = pool.get();
//! scratch.0.extend_from_slice(b"hello");
//! drop(scratch);
//!
//! // The recycled value comes back empty
//! assert_eq!(pool.idle(), 1);
//! assert!(pool.get().0.is_empty());
//! ```

use crossbeam_queue::ArrayQueue;
use prometheus_client::{
    metrics::{counter::Counter, gauge::Gauge},
    registry::Registry,
};
use rangefetch_utils::NZUsize;
use std::{
    fmt,
    mem::ManuallyDrop,
    num::NonZeroUsize,
    ops::{Deref, DerefMut},
    sync::{Arc, Weak},
};

/// A value that can be returned to a [Pool].
pub trait Reset {
    /// Clear all state left behind by the previous holder.
    ///
    /// Implementations should keep reusable allocations (e.g. vector capacity)
    /// while dropping their contents.
    fn reset(&mut self);
}

/// Configuration for a [Pool].
#[derive(Debug, Clone)]
pub struct Config {
    /// Maximum number of idle values kept on the free list.
    pub max_idle: NonZeroUsize,
    /// Whether to fill the free list on pool creation.
    pub prefill: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_idle: NZUsize!(1024),
            prefill: false,
        }
    }
}

/// Metrics for a [Pool].
struct Metrics {
    /// Number of values currently on the free list.
    idle: Gauge,
    /// Total number of values produced by the factory.
    created: Counter,
    /// Total number of values served from the free list.
    reused: Counter,
    /// Total number of returned values dropped because the free list was full.
    discarded: Counter,
}

impl Metrics {
    fn new(registry: &mut Registry) -> Self {
        let metrics = Self {
            idle: Gauge::default(),
            created: Counter::default(),
            reused: Counter::default(),
            discarded: Counter::default(),
        };
        registry.register(
            "idle",
            "Number of values waiting on the free list",
            metrics.idle.clone(),
        );
        registry.register(
            "created",
            "Total number of values produced by the factory",
            metrics.created.clone(),
        );
        registry.register(
            "reused",
            "Total number of values served from the free list",
            metrics.reused.clone(),
        );
        registry.register(
            "discarded",
            "Total number of returned values dropped because the free list was full",
            metrics.discarded.clone(),
        );
        metrics
    }
}

type Factory<T> = Box<dyn Fn() -> T + Send + Sync>;

/// Internal state of a [Pool].
struct Inner<T> {
    config: Config,
    factory: Factory<T>,
    freelist: ArrayQueue<T>,
    metrics: Metrics,
}

impl<T: Reset> Inner<T> {
    fn create(&self) -> T {
        self.metrics.created.inc();
        (self.factory)()
    }

    fn take(&self) -> T {
        match self.freelist.pop() {
            Some(value) => {
                self.metrics.reused.inc();
                self.metrics.idle.dec();
                value
            }
            None => self.create(),
        }
    }

    fn give(&self, mut value: T) {
        value.reset();
        match self.freelist.push(value) {
            Ok(()) => {
                self.metrics.idle.inc();
            }
            Err(_value) => {
                // Free list full, value is dropped
                self.metrics.discarded.inc();
            }
        }
    }
}

/// A concurrent free list of resettable values.
///
/// Construction goes through the factory supplied to [Pool::new]; there is no
/// process-wide pool, so independent users never share (or disturb) each other's
/// recycled values unless they share the same [Pool].
pub struct Pool<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Pool<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> fmt::Debug for Pool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("config", &self.inner.config)
            .field("idle", &self.inner.freelist.len())
            .finish()
    }
}

impl<T: Reset + Send + 'static> Pool<T> {
    /// Creates a new pool that builds values with `factory`.
    ///
    /// Metrics are registered directly on `registry`; callers that keep several
    /// pools should hand each one its own sub-registry.
    pub fn new<F>(config: Config, registry: &mut Registry, factory: F) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        let metrics = Metrics::new(registry);
        let inner = Inner {
            freelist: ArrayQueue::new(config.max_idle.get()),
            factory: Box::new(factory),
            config,
            metrics,
        };
        if inner.config.prefill {
            for _ in 0..inner.config.max_idle.get() {
                let value = inner.create();
                inner.give(value);
            }
        }
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Returns a ready-to-use value, recycled from the free list when one is
    /// available and freshly built otherwise.
    pub fn get(&self) -> Pooled<T> {
        let value = self.inner.take();
        Pooled::new(value, Arc::downgrade(&self.inner))
    }

    /// Returns a freshly built value, bypassing the free list.
    ///
    /// The value still returns to this pool when dropped.
    pub fn fresh(&self) -> Pooled<T> {
        let value = self.inner.create();
        Pooled::new(value, Arc::downgrade(&self.inner))
    }

    /// Resets `value` and places it on the free list.
    ///
    /// Passing `None` is a no-op.
    pub fn put(&self, value: Option<T>) {
        if let Some(value) = value {
            self.inner.give(value);
        }
    }

    /// Returns the number of values waiting on the free list.
    pub fn idle(&self) -> usize {
        self.inner.freelist.len()
    }

    /// Returns the pool configuration.
    pub fn config(&self) -> &Config {
        &self.inner.config
    }
}

/// A value borrowed from a [Pool].
///
/// Dereferences to the value. When dropped, the value is reset and returned to
/// the pool it came from (if that pool still exists).
pub struct Pooled<T: Reset> {
    value: ManuallyDrop<T>,
    pool: Weak<Inner<T>>,
}

impl<T: Reset> Pooled<T> {
    const fn new(value: T, pool: Weak<Inner<T>>) -> Self {
        Self {
            value: ManuallyDrop::new(value),
            pool,
        }
    }
}

impl<T: Reset> Deref for Pooled<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T: Reset> DerefMut for Pooled<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.value
    }
}

impl<T: Reset + fmt::Debug> fmt::Debug for Pooled<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Pooled").field(&*self.value).finish()
    }
}

impl<T: Reset> Drop for Pooled<T> {
    fn drop(&mut self) {
        // SAFETY: Drop runs at most once and `value` is not touched afterwards.
        let value = unsafe { ManuallyDrop::take(&mut self.value) };
        if let Some(pool) = self.pool.upgrade() {
            pool.give(value);
        }
        // else: the pool is gone and the value is dropped here
    }
}
