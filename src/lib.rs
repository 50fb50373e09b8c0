//! Lazy, randomly-indexable sequence views with an ordered concurrent
//! prefetching engine.
//!
//! Build a [`SequenceView`] over your data, stack transformations on it
//! with [`SequenceViewExt`], then hand it to a [`Prefetcher`] to evaluate
//! ahead of consumption on thread or forked-process workers. Results come
//! back in strict index order with bounded memory, and a single failed
//! element shows up as an `Err` in its slot instead of poisoning the run.

pub mod ops;
pub mod prefetch;
mod protocol;
pub mod slot;
pub mod view;
mod worker;

pub use ops::{Batch, Collate, Concat, Map, Slice, Unbatch, Zip};
pub use prefetch::{PrefetchConfig, PrefetchError, Prefetcher, Transport};
pub use slot::{SlotError, SlotId, SlotPool};
pub use view::{
    FnView, Iter, SequenceView, SequenceViewExt, TryFnView, ViewError, from_fn, try_from_fn,
};
