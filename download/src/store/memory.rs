//! Objects held in memory, with hooks to delay and fail requests.

use super::Store;
use crate::Error;
use bytes::Bytes;
use futures::Stream;
use rangefetch_utils::signal::Signal;
use std::{
    collections::{HashMap, VecDeque},
    io,
    pin::Pin,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, RwLock,
    },
    task::{Context, Poll},
};

/// Default number of bytes yielded per body segment.
const DEFAULT_SEGMENT_SIZE: usize = 64 * 1024;

/// A failure injected into every subsequent [Memory] request.
#[derive(Clone, Debug)]
pub enum Failure {
    /// Fail when opening the range.
    Open(String),
    /// Yield `after` segments and then fail.
    Read { after: usize, message: String },
}

struct State {
    objects: RwLock<HashMap<(String, String), Bytes>>,
    segment: usize,
    gate: Mutex<Signal>,
    failure: Mutex<Option<Failure>>,
    requests: AtomicUsize,
    open: Arc<AtomicUsize>,
}

/// In-memory object store.
///
/// Counts the ranges it serves and the bodies still open, and can hold requests
/// behind a [Signal] or fail them on demand.
#[derive(Clone)]
pub struct Memory {
    state: Arc<State>,
}

impl Default for Memory {
    fn default() -> Self {
        Self::with_segment_size(DEFAULT_SEGMENT_SIZE)
    }
}

impl Memory {
    /// Create an empty store whose bodies yield at most `segment` bytes at a time.
    pub fn with_segment_size(segment: usize) -> Self {
        Self {
            state: Arc::new(State {
                objects: RwLock::new(HashMap::new()),
                segment: segment.max(1),
                gate: Mutex::new(Signal::Closed),
                failure: Mutex::new(None),
                requests: AtomicUsize::new(0),
                open: Arc::new(AtomicUsize::new(0)),
            }),
        }
    }

    /// Store `data` at `bucket`/`key`, replacing any previous object.
    pub fn put(&self, bucket: &str, key: &str, data: impl Into<Bytes>) {
        self.state
            .objects
            .write()
            .unwrap()
            .insert((bucket.into(), key.into()), data.into());
    }

    /// Hold every subsequent request until `gate` resolves.
    pub fn gate(&self, gate: Signal) {
        *self.state.gate.lock().unwrap() = gate;
    }

    /// Inject (or clear) a failure for every subsequent request.
    pub fn fail(&self, failure: Option<Failure>) {
        *self.state.failure.lock().unwrap() = failure;
    }

    /// Number of ranges requested so far.
    pub fn requests(&self) -> usize {
        self.state.requests.load(Ordering::SeqCst)
    }

    /// Number of bodies opened and not yet dropped.
    pub fn open_bodies(&self) -> usize {
        self.state.open.load(Ordering::SeqCst)
    }
}

impl Store for Memory {
    type Body = Body;

    async fn fetch_range(
        &self,
        bucket: &str,
        key: &str,
        start: u64,
        end: u64,
    ) -> Result<Self::Body, Error> {
        self.state.requests.fetch_add(1, Ordering::SeqCst);

        // A dropped signaler releases the gate as well
        let gate = self.state.gate.lock().unwrap().clone();
        let _ = gate.await;

        let failure = self.state.failure.lock().unwrap().clone();
        if let Some(Failure::Open(message)) = &failure {
            return Err(Error::transport(io::Error::other(message.clone())));
        }

        let object = self
            .state
            .objects
            .read()
            .unwrap()
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
            .ok_or_else(|| {
                Error::transport(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("object missing: {bucket}/{key}"),
                ))
            })?;
        let len = object.len() as u64;
        if start > len {
            return Err(Error::OffsetBeyondEnd {
                offset: start,
                len: Some(len),
            });
        }
        let stop = end.saturating_add(1).min(len);
        let range = object.slice(start as usize..stop.max(start) as usize);

        let mut segments: VecDeque<_> = range
            .chunks(self.state.segment)
            .map(|segment| Ok(range.slice_ref(segment)))
            .collect();
        if let Some(Failure::Read { after, message }) = failure {
            segments.truncate(after);
            segments.push_back(Err(Error::transport(io::Error::other(message))));
        }
        Ok(Body::new(segments, self.state.open.clone()))
    }
}

/// Body of a range served by [Memory].
pub struct Body {
    segments: VecDeque<Result<Bytes, Error>>,
    open: Arc<AtomicUsize>,
}

impl Body {
    fn new(segments: VecDeque<Result<Bytes, Error>>, open: Arc<AtomicUsize>) -> Self {
        open.fetch_add(1, Ordering::SeqCst);
        Self { segments, open }
    }
}

impl Stream for Body {
    type Item = Result<Bytes, Error>;

    fn poll_next(mut self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Poll::Ready(self.segments.pop_front())
    }
}

impl Drop for Body {
    fn drop(&mut self) {
        self.open.fetch_sub(1, Ordering::SeqCst);
    }
}
