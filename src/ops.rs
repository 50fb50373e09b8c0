//! # View Operators
//!
//! Combinators over [`SequenceView`]s. Every operator holds O(1) state plus
//! its `Arc`'d sources, checks indices against its own length before
//! touching any source, and computes exactly the elements an access needs.

use std::sync::Arc;

use crate::view::{SequenceView, ViewError, bounds_check};

// ========================================================================================
//                                  ELEMENT TRANSFORMS
// ========================================================================================

/// Applies a function to every element of a source view.
pub struct Map<S, F> {
    source: Arc<S>,
    f: F,
}

impl<S, F> Map<S, F> {
    pub fn new(source: Arc<S>, f: F) -> Self {
        Map { source, f }
    }
}

impl<S, F, U> SequenceView for Map<S, F>
where
    S: SequenceView,
    F: Fn(S::Item) -> U + Send + Sync,
{
    type Item = U;

    fn len(&self) -> usize {
        self.source.len()
    }

    fn get(&self, index: usize) -> Result<U, ViewError> {
        Ok((self.f)(self.source.get(index)?))
    }
}

// ========================================================================================
//                                 GROUPING & FLATTENING
// ========================================================================================

/// Groups `size` consecutive source elements into one `Vec` element.
///
/// The final group is short when the source length is not a multiple of
/// `size`. Collation is composition: see `SequenceViewExt::batched_by`.
pub struct Batch<S> {
    source: Arc<S>,
    size: usize,
}

impl<S: SequenceView> Batch<S> {
    pub fn new(source: Arc<S>, size: usize) -> Self {
        assert!(size > 0, "batch size must be positive");
        Batch { source, size }
    }
}

impl<S: SequenceView> SequenceView for Batch<S> {
    type Item = Vec<S::Item>;

    fn len(&self) -> usize {
        self.source.len().div_ceil(self.size)
    }

    fn get(&self, index: usize) -> Result<Vec<S::Item>, ViewError> {
        bounds_check(index, self.len())?;
        let start = index * self.size;
        let end = (start + self.size).min(self.source.len());
        (start..end).map(|i| self.source.get(i)).collect()
    }
}

/// Exposes each element of pre-grouped chunks individually.
///
/// A flat index maps to `(chunk, offset)` through a binary search over
/// chunk-length prefix sums, so irregular chunk sizes are fine as long as
/// they are declared up front.
#[derive(Debug)]
pub struct Unbatch<S> {
    source: Arc<S>,
    offsets: Vec<usize>,
}

impl<S, T> Unbatch<S>
where
    S: SequenceView<Item = Vec<T>>,
{
    /// Builds from explicitly declared chunk lengths, one per source chunk.
    pub fn with_sizes(source: Arc<S>, sizes: &[usize]) -> Result<Self, ViewError> {
        if sizes.len() != source.len() {
            return Err(ViewError::LengthMismatch {
                expected: source.len(),
                found: sizes.len(),
            });
        }
        let mut offsets = Vec::with_capacity(sizes.len() + 1);
        let mut total = 0usize;
        offsets.push(0);
        for &size in sizes {
            total += size;
            offsets.push(total);
        }
        Ok(Unbatch { source, offsets })
    }

    /// Builds for uniform chunks of `batch_size` with a final chunk of
    /// `last_size`. Pass `last_size = batch_size` when the final chunk is
    /// full. This is the exact inverse of [`Batch`].
    pub fn regular(source: Arc<S>, batch_size: usize, last_size: usize) -> Self {
        assert!(batch_size > 0, "batch size must be positive");
        let chunks = source.len();
        let mut offsets = Vec::with_capacity(chunks + 1);
        offsets.push(0);
        if chunks > 0 {
            assert!(
                last_size >= 1 && last_size <= batch_size,
                "last chunk size must be in 1..=batch_size"
            );
            for c in 1..chunks {
                offsets.push(c * batch_size);
            }
            offsets.push((chunks - 1) * batch_size + last_size);
        }
        Unbatch { source, offsets }
    }

    /// Derives chunk lengths by evaluating every chunk once.
    ///
    /// This walks the whole source at construction time; prefer
    /// [`Unbatch::with_sizes`] when lengths are known from metadata.
    pub fn probe(source: Arc<S>) -> Result<Self, ViewError> {
        let mut offsets = Vec::with_capacity(source.len() + 1);
        let mut total = 0usize;
        offsets.push(0);
        for c in 0..source.len() {
            total += source.get(c)?.len();
            offsets.push(total);
        }
        Ok(Unbatch { source, offsets })
    }
}

impl<S, T> SequenceView for Unbatch<S>
where
    S: SequenceView<Item = Vec<T>>,
    T: Send + Sync,
{
    type Item = T;

    fn len(&self) -> usize {
        *self.offsets.last().unwrap_or(&0)
    }

    fn get(&self, index: usize) -> Result<T, ViewError> {
        bounds_check(index, self.len())?;
        let chunk = self.offsets.partition_point(|&o| o <= index) - 1;
        let offset = index - self.offsets[chunk];
        let mut items = self.source.get(chunk)?;
        if offset >= items.len() {
            return Err(ViewError::Element {
                index,
                reason: format!(
                    "chunk {chunk} yielded {} elements, expected at least {}",
                    items.len(),
                    offset + 1
                ),
            });
        }
        Ok(items.swap_remove(offset))
    }
}

// ========================================================================================
//                                      ALIGNMENT
// ========================================================================================

/// Zips k equal-length views of one item type into per-index groups.
#[derive(Debug)]
pub struct Collate<S> {
    sources: Vec<Arc<S>>,
    len: usize,
}

impl<S: SequenceView> Collate<S> {
    pub fn new(sources: Vec<Arc<S>>) -> Result<Self, ViewError> {
        assert!(!sources.is_empty(), "collate requires at least one view");
        let len = sources[0].len();
        for source in &sources[1..] {
            if source.len() != len {
                return Err(ViewError::LengthMismatch { expected: len, found: source.len() });
            }
        }
        Ok(Collate { sources, len })
    }
}

impl<S: SequenceView> SequenceView for Collate<S> {
    type Item = Vec<S::Item>;

    fn len(&self) -> usize {
        self.len
    }

    fn get(&self, index: usize) -> Result<Vec<S::Item>, ViewError> {
        bounds_check(index, self.len)?;
        self.sources.iter().map(|s| s.get(index)).collect()
    }
}

/// Zips two equal-length views into a view of pairs.
pub struct Zip<A, B> {
    left: Arc<A>,
    right: Arc<B>,
}

impl<A: SequenceView, B: SequenceView> Zip<A, B> {
    pub fn new(left: Arc<A>, right: Arc<B>) -> Result<Self, ViewError> {
        if left.len() != right.len() {
            return Err(ViewError::LengthMismatch {
                expected: left.len(),
                found: right.len(),
            });
        }
        Ok(Zip { left, right })
    }
}

impl<A: SequenceView, B: SequenceView> SequenceView for Zip<A, B> {
    type Item = (A::Item, B::Item);

    fn len(&self) -> usize {
        self.left.len()
    }

    fn get(&self, index: usize) -> Result<(A::Item, B::Item), ViewError> {
        Ok((self.left.get(index)?, self.right.get(index)?))
    }
}

// ========================================================================================
//                                       ROUTING
// ========================================================================================

/// Concatenates m views end to end; lengths may differ.
///
/// An index routes to `(view, local_index)` through a binary search over
/// prefix-sum lengths.
pub struct Concat<S> {
    sources: Vec<Arc<S>>,
    offsets: Vec<usize>,
}

impl<S: SequenceView> Concat<S> {
    pub fn new(sources: Vec<Arc<S>>) -> Self {
        let mut offsets = Vec::with_capacity(sources.len() + 1);
        let mut total = 0usize;
        offsets.push(0);
        for source in &sources {
            total += source.len();
            offsets.push(total);
        }
        Concat { sources, offsets }
    }
}

impl<S: SequenceView> SequenceView for Concat<S> {
    type Item = S::Item;

    fn len(&self) -> usize {
        *self.offsets.last().unwrap_or(&0)
    }

    fn get(&self, index: usize) -> Result<S::Item, ViewError> {
        bounds_check(index, self.len())?;
        let segment = self.offsets.partition_point(|&o| o <= index) - 1;
        self.sources[segment].get(index - self.offsets[segment])
    }
}

// ========================================================================================
//                                       WINDOWS
// ========================================================================================

/// Normalizes `[start:stop:step]` parameters against a length of `n`.
///
/// Negative `start`/`stop` count from the end; both are clamped into range;
/// an empty window collapses to `(0, 0, 1)`; otherwise `stop` is adjusted so
/// `(stop - start)` is an exact multiple of `step`. With a negative step the
/// returned `stop` may be negative, acting as an exclusive bound just before
/// index zero.
fn normalize_slice(start: Option<isize>, stop: Option<isize>, step: isize, n: usize) -> (isize, isize, isize) {
    assert!(step != 0, "slice step cannot be zero");
    let n = n as isize;
    let mut start = start.unwrap_or(0);
    let mut stop = stop.unwrap_or(n);

    start = start.min(n - 1).max(-n);
    if start < 0 {
        start += n;
    }
    stop = stop.min(n).max(-n - 1);
    if stop < 0 {
        stop += n;
    }

    if (stop - start) * step <= 0 {
        return (0, 0, 1);
    }

    if step > 0 {
        stop += step - ((stop - start - 1) % step) - 1;
    } else {
        stop -= -step - ((start - stop - 1) % -step) - 1;
    }
    (start, stop, step)
}

/// A `[start:stop:step]` window over a source view.
pub struct Slice<S> {
    source: Arc<S>,
    start: isize,
    stop: isize,
    step: isize,
}

impl<S: SequenceView> Slice<S> {
    pub fn new(source: Arc<S>, start: Option<isize>, stop: Option<isize>, step: isize) -> Self {
        let (start, stop, step) = normalize_slice(start, stop, step, source.len());
        Slice { source, start, stop, step }
    }

    /// Re-slices this window, composing into a single `Slice` over the same
    /// source instead of nesting.
    pub fn sliced(self, start: Option<isize>, stop: Option<isize>, step: isize) -> Slice<S> {
        let len = SequenceView::len(&self);
        let (key_start, key_stop, key_step) = normalize_slice(start, stop, step, len);
        // The composed bounds are exact multiples of the composed step by
        // construction, so they are adopted directly; re-clamping against the
        // source would corrupt a negative sentinel stop.
        let new_start = self.start + key_start * self.step;
        let new_stop = self.start + key_stop * self.step;
        let new_step = key_step * self.step;
        if (new_stop - new_start) * new_step <= 0 {
            return Slice { source: self.source, start: 0, stop: 0, step: 1 };
        }
        Slice { source: self.source, start: new_start, stop: new_stop, step: new_step }
    }
}

impl<S: SequenceView> SequenceView for Slice<S> {
    type Item = S::Item;

    fn len(&self) -> usize {
        ((self.stop - self.start).abs() / self.step.abs()) as usize
    }

    fn get(&self, index: usize) -> Result<S::Item, ViewError> {
        bounds_check(index, self.len())?;
        let source_index = self.start + index as isize * self.step;
        self.source.get(source_index as usize)
    }
}

// ========================================================================================
//                                        TESTS
// ========================================================================================
