//! # Sequence Views
//!
//! This module defines the `SequenceView` trait, the random-access contract
//! every lazy view in this crate implements, along with the leaf adapters
//! that turn plain data into views.
//!
//! - Lazy by construction: a view holds O(1) state and computes elements
//!   only when `get` is called. Composing views never materializes data.
//! - Stable addressing: `len()` is O(1) and does not change for the lifetime
//!   of the view, and `get(i)` is deterministic for a fixed underlying
//!   dataset.
//! - Shared sources: composed views hold their sources behind `Arc`, so one
//!   dataset can back many derived views without copies.

use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use thiserror::Error;

use crate::ops::{Batch, Map, Slice, Zip};
use crate::prefetch::{PrefetchConfig, PrefetchError, Prefetcher};

/// Failure modes of element access.
///
/// `Element` is the ordinary per-element failure: whatever computes the
/// value reported an error for that one index. It is an isolated event,
/// sibling indices remain computable. The error is serializable because it
/// may have been produced in a worker process and shipped back over a pipe.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViewError {
    /// The index is not addressable by this view.
    #[error("index {index} out of range for view of length {len}")]
    OutOfBounds { index: usize, len: usize },
    /// The element at `index` could not be computed.
    #[error("element {index} failed to compute: {reason}")]
    Element { index: usize, reason: String },
    /// Views that must agree on length did not.
    #[error("length mismatch: expected {expected}, found {found}")]
    LengthMismatch { expected: usize, found: usize },
}

pub(crate) fn bounds_check(index: usize, len: usize) -> Result<(), ViewError> {
    if index < len {
        Ok(())
    } else {
        Err(ViewError::OutOfBounds { index, len })
    }
}

/// A lazily-evaluated, randomly-indexable sequence.
///
/// Implementors promise that `len` is O(1) and stable, and that `get`
/// evaluates exactly the element at `index`, returning
/// [`ViewError::OutOfBounds`] whenever `index >= len()`.
pub trait SequenceView: Send + Sync {
    type Item;

    /// Number of addressable elements.
    fn len(&self) -> usize;

    /// Compute the element at `index`.
    fn get(&self, index: usize) -> Result<Self::Item, ViewError>;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Clone + Send + Sync> SequenceView for Vec<T> {
    type Item = T;

    fn len(&self) -> usize {
        Vec::len(self)
    }

    fn get(&self, index: usize) -> Result<T, ViewError> {
        self.as_slice()
            .get(index)
            .cloned()
            .ok_or(ViewError::OutOfBounds { index, len: Vec::len(self) })
    }
}

impl<'a, V: SequenceView + ?Sized> SequenceView for &'a V {
    type Item = V::Item;

    fn len(&self) -> usize {
        V::len(self)
    }

    fn get(&self, index: usize) -> Result<V::Item, ViewError> {
        V::get(self, index)
    }
}

impl<V: SequenceView + ?Sized> SequenceView for Arc<V> {
    type Item = V::Item;

    fn len(&self) -> usize {
        V::len(self)
    }

    fn get(&self, index: usize) -> Result<V::Item, ViewError> {
        V::get(self, index)
    }
}

/// A view computed by a closure. See [`from_fn`].
pub struct FnView<F> {
    len: usize,
    f: F,
}

impl<T, F> SequenceView for FnView<F>
where
    F: Fn(usize) -> T + Send + Sync,
{
    type Item = T;

    fn len(&self) -> usize {
        self.len
    }

    fn get(&self, index: usize) -> Result<T, ViewError> {
        bounds_check(index, self.len)?;
        Ok((self.f)(index))
    }
}

/// A view computed by a fallible closure. See [`try_from_fn`].
pub struct TryFnView<F> {
    len: usize,
    f: F,
}

impl<T, F> SequenceView for TryFnView<F>
where
    F: Fn(usize) -> Result<T, ViewError> + Send + Sync,
{
    type Item = T;

    fn len(&self) -> usize {
        self.len
    }

    fn get(&self, index: usize) -> Result<T, ViewError> {
        bounds_check(index, self.len)?;
        (self.f)(index)
    }
}

/// Builds a view of `len` elements where element `i` is `f(i)`.
pub fn from_fn<T, F>(len: usize, f: F) -> FnView<F>
where
    F: Fn(usize) -> T + Send + Sync,
{
    FnView { len, f }
}

/// Builds a view of `len` elements where element `i` is `f(i)?`.
///
/// This is the canonical way to introduce per-element failure into a
/// pipeline: an `Err` from `f` is carried through operators and the
/// prefetcher to the consumer at exactly index `i`.
pub fn try_from_fn<T, F>(len: usize, f: F) -> TryFnView<F>
where
    F: Fn(usize) -> Result<T, ViewError> + Send + Sync,
{
    TryFnView { len, f }
}

/// Sequential iterator over a view, in ascending index order.
pub struct Iter<'a, V: ?Sized> {
    view: &'a V,
    index: usize,
}

impl<'a, V: SequenceView + ?Sized> Iterator for Iter<'a, V> {
    type Item = Result<V::Item, ViewError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.index >= self.view.len() {
            return None;
        }
        let item = self.view.get(self.index);
        self.index += 1;
        Some(item)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.view.len().saturating_sub(self.index);
        (remaining, Some(remaining))
    }
}

/// Combinator methods available on every view.
pub trait SequenceViewExt: SequenceView + Sized {
    /// Iterate elements in order on the calling thread.
    fn iter(&self) -> Iter<'_, Self> {
        Iter { view: self, index: 0 }
    }

    /// Lazily apply `f` to every element.
    fn map<U, F>(self, f: F) -> Map<Self, F>
    where
        F: Fn(Self::Item) -> U + Send + Sync,
    {
        Map::new(Arc::new(self), f)
    }

    /// Group consecutive elements into chunks of `size` (last may be short).
    fn batched(self, size: usize) -> Batch<Self> {
        Batch::new(Arc::new(self), size)
    }

    /// Group into chunks of `size`, then apply `collate` to each chunk.
    fn batched_by<B, F>(self, size: usize, collate: F) -> Map<Batch<Self>, F>
    where
        F: Fn(Vec<Self::Item>) -> B + Send + Sync,
    {
        Map::new(Arc::new(self.batched(size)), collate)
    }

    /// Pair this view with an equal-length view, element by element.
    fn zip<W>(self, other: W) -> Result<Zip<Self, W>, ViewError>
    where
        W: SequenceView,
    {
        Zip::new(Arc::new(self), Arc::new(other))
    }

    /// Take a `[start:stop:step]` window over this view.
    ///
    /// `start` and `stop` may be negative (counted from the end) and are
    /// clamped; `step` must be nonzero and may be negative to walk
    /// backwards.
    fn sliced(self, start: Option<isize>, stop: Option<isize>, step: isize) -> Slice<Self> {
        Slice::new(Arc::new(self), start, stop, step)
    }

    /// Evaluate this view ahead of consumption with a worker pool,
    /// delivering results in index order.
    fn prefetch(self, config: &PrefetchConfig) -> Result<Prefetcher<Self::Item>, PrefetchError>
    where
        Self: 'static,
        Self::Item: Send + Serialize + DeserializeOwned + 'static,
    {
        Prefetcher::with_config(Arc::new(self), config)
    }
}

impl<V: SequenceView> SequenceViewExt for V {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vec_views_report_length_and_elements() {
        let v = vec![10, 20, 30];
        assert_eq!(SequenceView::len(&v), 3);
        assert_eq!(v.get(1), Ok(20));
        assert!(!SequenceView::is_empty(&v));
    }

    #[test]
    fn out_of_range_access_names_index_and_length() {
        let v = vec![1, 2];
        assert_eq!(v.get(2), Err(ViewError::OutOfBounds { index: 2, len: 2 }));
        assert_eq!(v.get(usize::MAX), Err(ViewError::OutOfBounds { index: usize::MAX, len: 2 }));
    }

    #[test]
    fn fn_views_compute_on_demand() {
        let squares = from_fn(5, |i| (i * i) as u64);
        assert_eq!(squares.len(), 5);
        assert_eq!(squares.get(4), Ok(16));
        assert!(squares.get(5).is_err());
    }

    #[test]
    fn fallible_views_surface_element_errors() {
        let v = try_from_fn(4, |i| {
            if i == 2 {
                Err(ViewError::Element { index: 2, reason: "boom".into() })
            } else {
                Ok(i)
            }
        });
        assert_eq!(v.get(1), Ok(1));
        assert_eq!(v.get(2), Err(ViewError::Element { index: 2, reason: "boom".into() }));
        assert_eq!(v.get(3), Ok(3));
    }

    #[test]
    fn iter_walks_ascending_order() {
        let v = from_fn(4, |i| i + 1);
        let collected: Result<Vec<_>, _> = v.iter().collect();
        assert_eq!(collected.unwrap(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn views_compose_through_trait_objects() {
        let boxed: Arc<dyn SequenceView<Item = usize>> = Arc::new(from_fn(3, |i| i * 10));
        assert_eq!(boxed.len(), 3);
        assert_eq!(boxed.get(2), Ok(20));
    }

    #[test]
    fn empty_views_are_valid() {
        let v: Vec<u8> = Vec::new();
        assert!(SequenceView::is_empty(&v));
        assert_eq!(v.iter().count(), 0);
    }
}
