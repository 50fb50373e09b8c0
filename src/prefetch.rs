//! Ordered concurrent prefetching over any [`SequenceView`].
//!
//! A [`Prefetcher`] walks a view from index 0, keeps up to `max_buffered`
//! computations in flight on a worker pool, and yields results in strict
//! index order no matter which worker finishes first. Completions that
//! arrive ahead of their turn wait in a reorder buffer; the buffer can
//! never outgrow the issue window, so memory stays bounded.
//!
//! Element failures are ordinary items: the error for index `i` is yielded
//! at position `i` and iteration continues. A worker dying is not ordinary;
//! it is reported once and the iterator closes, since results it owned are
//! unrecoverable.

use ahash::AHashMap;
use log::{debug, warn};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

use crate::view::{SequenceView, ViewError};
use crate::worker::{Backend, Event, ProcessPool, ThreadPool};

#[derive(Error, Debug)]
pub enum PrefetchError {
    /// One element failed. Delivered at that element's position; later
    /// indices keep coming.
    #[error(transparent)]
    Element(#[from] ViewError),
    /// A worker terminated without handing back its work. Fatal; the
    /// iterator is closed after yielding this once.
    #[error("worker {worker} terminated unexpectedly")]
    WorkerLost { worker: usize },
    #[error("invalid prefetch configuration: {0}")]
    Config(String),
    #[error("internal invariant violated: {0}")]
    Internal(String),
    #[error("worker pool i/o failed: {0}")]
    Io(#[from] std::io::Error),
}

/// How workers are hosted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    /// Shared-address-space threads. Cheapest; computations must release
    /// whatever lock discipline the view needs on their own.
    Thread,
    /// Forked worker processes with results returned through shared memory
    /// or in-band frames. Isolates crashy or GIL-style computations.
    Process,
}

/// Prefetching parameters. Deserializable so deployments can keep them in
/// the same config files as everything else.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrefetchConfig {
    #[serde(default = "default_method")]
    pub method: Transport,
    /// Worker count. Defaults to the number of logical CPUs.
    #[serde(default = "default_nworkers")]
    pub nworkers: usize,
    /// Upper bound on `issued - delivered`. Defaults to twice the worker
    /// count.
    #[serde(default = "default_max_buffered")]
    pub max_buffered: usize,
    /// Shared-memory slot capacity in bytes for process transport. `None`
    /// ships every payload in-band instead.
    #[serde(default)]
    pub shm_slot_bytes: Option<usize>,
}

fn default_method() -> Transport {
    Transport::Thread
}

fn default_nworkers() -> usize {
    num_cpus::get().max(1)
}

fn default_max_buffered() -> usize {
    default_nworkers() * 2
}

impl Default for PrefetchConfig {
    fn default() -> Self {
        PrefetchConfig {
            method: default_method(),
            nworkers: default_nworkers(),
            max_buffered: default_max_buffered(),
            shm_slot_bytes: None,
        }
    }
}

impl PrefetchConfig {
    pub fn validate(&self) -> Result<(), PrefetchError> {
        validate_counts(self.nworkers, self.max_buffered)?;
        if self.shm_slot_bytes == Some(0) {
            return Err(PrefetchError::Config("shm_slot_bytes must be positive when set".into()));
        }
        Ok(())
    }
}

fn validate_counts(nworkers: usize, max_buffered: usize) -> Result<(), PrefetchError> {
    if nworkers == 0 {
        return Err(PrefetchError::Config("nworkers must be at least 1".into()));
    }
    if max_buffered == 0 {
        return Err(PrefetchError::Config("max_buffered must be at least 1".into()));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Issuing and delivering.
    Running,
    /// Every index issued; draining what is in flight.
    Draining,
    /// Nothing more will be delivered. Reached at exhaustion, after a fatal
    /// error, or through [`Prefetcher::stop`].
    Closed,
}

/// Completions parked until their index is next in line.
struct ReorderBuffer<T> {
    parked: AHashMap<usize, Result<T, ViewError>>,
    cap: usize,
}

impl<T> ReorderBuffer<T> {
    fn new(cap: usize) -> Self {
        ReorderBuffer { parked: AHashMap::with_capacity(cap), cap }
    }

    fn park(&mut self, index: usize, result: Result<T, ViewError>) {
        debug_assert!(self.parked.len() < self.cap, "reorder buffer exceeded the issue window");
        self.parked.insert(index, result);
    }

    fn claim(&mut self, index: usize) -> Option<Result<T, ViewError>> {
        self.parked.remove(&index)
    }

    fn clear(&mut self) {
        self.parked.clear();
    }
}

/// An iterator that computes ahead of its consumer.
///
/// Obtained from [`SequenceViewExt::prefetch`](crate::view::SequenceViewExt::prefetch)
/// or the constructors below. Yields `Result<T, PrefetchError>` in index
/// order; dropping it tears the worker pool down.
pub struct Prefetcher<T> {
    backend: Backend<T>,
    len: usize,
    max_buffered: usize,
    next_issue: usize,
    next_deliver: usize,
    reorder: ReorderBuffer<T>,
    state: State,
}

impl<T: Send + 'static> Prefetcher<T> {
    /// Prefetches on `nworkers` threads sharing the view in place.
    pub fn threads<V>(view: Arc<V>, nworkers: usize, max_buffered: usize) -> Result<Self, PrefetchError>
    where
        V: SequenceView<Item = T> + Send + Sync + 'static,
    {
        validate_counts(nworkers, max_buffered)?;
        let len = view.len();
        let backend = Backend::Threads(ThreadPool::spawn(view, nworkers, max_buffered));
        Ok(Prefetcher::assemble(backend, len, max_buffered))
    }
}

impl<T> Prefetcher<T>
where
    T: Send + Serialize + DeserializeOwned + 'static,
{
    /// Prefetches on forked worker processes. `shm_slot_bytes` sizes the
    /// shared-memory slots; results that fit travel through them, anything
    /// larger falls back to in-band frames, and `None` makes everything
    /// in-band.
    pub fn processes<V>(
        view: Arc<V>,
        nworkers: usize,
        max_buffered: usize,
        shm_slot_bytes: Option<usize>,
    ) -> Result<Self, PrefetchError>
    where
        V: SequenceView<Item = T> + Send + Sync + 'static,
    {
        validate_counts(nworkers, max_buffered)?;
        if shm_slot_bytes == Some(0) {
            return Err(PrefetchError::Config("shm_slot_bytes must be positive when set".into()));
        }
        let len = view.len();
        let backend =
            Backend::Processes(ProcessPool::spawn(view, nworkers, max_buffered, shm_slot_bytes)?);
        Ok(Prefetcher::assemble(backend, len, max_buffered))
    }

    /// Dispatches on [`PrefetchConfig::method`].
    pub fn with_config<V>(view: Arc<V>, config: &PrefetchConfig) -> Result<Self, PrefetchError>
    where
        V: SequenceView<Item = T> + Send + Sync + 'static,
    {
        config.validate()?;
        match config.method {
            Transport::Thread => Prefetcher::threads(view, config.nworkers, config.max_buffered),
            Transport::Process => Prefetcher::processes(
                view,
                config.nworkers,
                config.max_buffered,
                config.shm_slot_bytes,
            ),
        }
    }
}

impl<T> Prefetcher<T> {
    fn assemble(backend: Backend<T>, len: usize, max_buffered: usize) -> Self {
        Prefetcher {
            backend,
            len,
            max_buffered,
            next_issue: 0,
            next_deliver: 0,
            reorder: ReorderBuffer::new(max_buffered),
            state: State::Running,
        }
    }

    /// Indices delivered so far.
    pub fn delivered(&self) -> usize {
        self.next_deliver
    }

    /// Stops issuing work and tears the pool down. Idempotent, and also
    /// runs on drop. In-flight computations are given a grace period to
    /// finish; queued ones are abandoned.
    pub fn stop(&mut self) {
        self.close();
    }

    fn close(&mut self) {
        if self.state == State::Closed {
            return;
        }
        self.state = State::Closed;
        debug!(
            "prefetcher closing after delivering {} of {} elements",
            self.next_deliver, self.len
        );
        self.reorder.clear();
        self.backend.shutdown();
    }

    /// Issues indices until the window `issued - delivered < max_buffered`
    /// is full or the view is exhausted.
    fn top_up(&mut self) {
        if self.state != State::Running {
            return;
        }
        while self.next_issue < self.len && self.next_issue - self.next_deliver < self.max_buffered {
            self.backend.submit(self.next_issue);
            self.next_issue += 1;
        }
        if self.next_issue == self.len {
            self.state = State::Draining;
        }
    }
}

impl<T> Iterator for Prefetcher<T> {
    type Item = Result<T, PrefetchError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.state == State::Closed {
                return None;
            }
            if self.next_deliver == self.len {
                self.close();
                return None;
            }
            self.top_up();
            if let Some(result) = self.reorder.claim(self.next_deliver) {
                self.next_deliver += 1;
                // Delivering shrank the window; refill it before handing
                // control back so workers never sit idle across next() calls.
                self.top_up();
                return Some(result.map_err(PrefetchError::Element));
            }
            match self.backend.recv() {
                Ok(Event::Done { worker, index, result }) => {
                    self.reorder.park(index, result);
                    self.backend.task_finished(worker);
                }
                Ok(Event::Exited { worker, clean }) => {
                    // No worker leaves on its own while indices are still
                    // owed, so even a clean exit here means lost results.
                    if clean {
                        debug!("worker {worker} exited with {} indices undelivered", self.len - self.next_deliver);
                    } else {
                        warn!("worker {worker} terminated unexpectedly");
                    }
                    self.close();
                    return Some(Err(PrefetchError::WorkerLost { worker }));
                }
                Err(_) => {
                    self.close();
                    return Some(Err(PrefetchError::Internal(
                        "worker event channel disconnected".into(),
                    )));
                }
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        // A fatal error can truncate the stream, so only the upper bound
        // is firm.
        (0, Some(self.len - self.next_deliver))
    }
}

impl<T> Drop for Prefetcher<T> {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reorder_buffer_claims_in_any_arrival_order() {
        let mut buffer: ReorderBuffer<u32> = ReorderBuffer::new(4);
        buffer.park(2, Ok(20));
        buffer.park(0, Ok(0));
        buffer.park(1, Err(ViewError::Element { index: 1, reason: "x".into() }));
        assert!(buffer.claim(3).is_none());
        assert_eq!(buffer.claim(0), Some(Ok(0)));
        assert!(buffer.claim(1).is_some());
        assert_eq!(buffer.claim(2), Some(Ok(20)));
        assert!(buffer.claim(2).is_none());
    }

    #[test]
    fn config_defaults_are_sane() {
        let config = PrefetchConfig::default();
        assert_eq!(config.method, Transport::Thread);
        assert!(config.nworkers >= 1);
        assert_eq!(config.max_buffered, config.nworkers * 2);
        assert_eq!(config.shm_slot_bytes, None);
        config.validate().unwrap();
    }

    #[test]
    fn config_rejects_zero_counts() {
        let mut config = PrefetchConfig::default();
        config.nworkers = 0;
        assert!(matches!(config.validate(), Err(PrefetchError::Config(_))));

        let mut config = PrefetchConfig::default();
        config.max_buffered = 0;
        assert!(matches!(config.validate(), Err(PrefetchError::Config(_))));

        let mut config = PrefetchConfig::default();
        config.shm_slot_bytes = Some(0);
        assert!(matches!(config.validate(), Err(PrefetchError::Config(_))));
    }

    #[test]
    fn config_parses_from_toml_with_defaults() {
        let config: PrefetchConfig = toml::from_str(
            r#"
            method = "process"
            nworkers = 3
            shm_slot_bytes = 65536
            "#,
        )
        .unwrap();
        assert_eq!(config.method, Transport::Process);
        assert_eq!(config.nworkers, 3);
        assert_eq!(config.max_buffered, default_max_buffered());
        assert_eq!(config.shm_slot_bytes, Some(65536));

        let empty: PrefetchConfig = toml::from_str("").unwrap();
        assert_eq!(empty, PrefetchConfig::default());
    }

    #[test]
    fn constructors_reject_bad_counts() {
        let view = Arc::new(vec![1u32, 2, 3]);
        assert!(matches!(
            Prefetcher::threads(Arc::clone(&view), 0, 4),
            Err(PrefetchError::Config(_))
        ));
        assert!(matches!(Prefetcher::threads(view, 2, 0), Err(PrefetchError::Config(_))));
    }
}
