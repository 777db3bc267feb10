// This file is part of chunkmat.
// Licensed under the MIT license, see LICENSE.md for details.
// SPDX-License-Identifier: MIT

//! Buffers made of fixed-capacity segments.
//!
//! The native boosting library accepts arrays whose length is bounded by a
//! 32-bit index, so large matrices are stored as a sequence of segments. A
//! global index `i` lives at `(i / capacity, i % capacity)`. Segments are
//! allocated directly from the global allocator and leased against a
//! [MemoryBudget], so dropping the array returns its memory immediately.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::mem::{self, size_of};
use std::ops::Index;
use std::ptr::{self, NonNull};
use std::slice;
use std::sync::Arc;

use log::*;

use crate::errors::{MatrixError, Result};
use crate::memory::{Lease, MemoryBudget};

/// Largest segment the native library accepts.
pub const DEFAULT_SEGMENT_CAPACITY: usize = i32::MAX as usize - 10;

mod private {
    pub trait Sealed {}
    impl Sealed for f32 {}
    impl Sealed for i32 {}
    impl Sealed for i64 {}
}

/// Element types that can be stored in a [SegmentedArray].
///
/// The all-zero bit pattern must be a valid value.
pub trait Element: private::Sealed + Copy + Default + Send + Sync + 'static {}

impl Element for f32 {}
impl Element for i32 {}
impl Element for i64 {}

/// Compute the `(segment, offset)` location of a global index.
pub fn locate(index: usize, capacity: usize) -> (usize, usize) {
    (index / capacity, index % capacity)
}

/// Sequential writer over a contiguous range of output elements.
pub trait Cursor<T: Copy> {
    /// Write the next element.
    fn put(&mut self, value: T);

    /// Write a run of elements.
    fn put_slice(&mut self, values: &[T]) {
        for v in values {
            self.put(*v);
        }
    }

    /// Get the number of elements written so far.
    fn written(&self) -> usize;
}

impl<T: Copy> Cursor<T> for Vec<T> {
    fn put(&mut self, value: T) {
        self.push(value);
    }

    fn put_slice(&mut self, values: &[T]) {
        self.extend_from_slice(values);
    }

    fn written(&self) -> usize {
        self.len()
    }
}

/// One heap block of a segmented array.
struct Segment<T: Element> {
    ptr: NonNull<T>,
    len: usize,
    layout: Option<Layout>,
    lease: Lease,
}

// SAFETY: a segment uniquely owns its allocation, like a Box<[T]>.
unsafe impl<T: Element> Send for Segment<T> {}
// SAFETY: shared access only hands out shared slices; concurrent writes go
// through `SegmentedArray::write_at`, whose callers guarantee disjointness.
unsafe impl<T: Element> Sync for Segment<T> {}

impl<T: Element> Segment<T> {
    fn allocate(len: usize, budget: &Arc<MemoryBudget>) -> Result<Self> {
        let layout = Layout::array::<T>(len).map_err(|e| MatrixError::Allocation {
            requested: len.saturating_mul(size_of::<T>()),
            reason: format!("{}", e),
        })?;
        let lease = budget.acquire(layout.size())?;
        if layout.size() == 0 {
            return Ok(Segment {
                ptr: NonNull::dangling(),
                len,
                layout: None,
                lease,
            });
        }

        // SAFETY: the layout has nonzero size
        let raw = unsafe { alloc_zeroed(layout) } as *mut T;
        let ptr = NonNull::new(raw).ok_or_else(|| MatrixError::Allocation {
            requested: layout.size(),
            reason: "allocator returned null".into(),
        })?;
        Ok(Segment {
            ptr,
            len,
            layout: Some(layout),
            lease,
        })
    }

    fn as_slice(&self) -> &[T] {
        // SAFETY: ptr is valid for len initialized (zeroed) elements
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    fn as_mut_slice(&mut self) -> &mut [T] {
        // SAFETY: as above, and &mut self guarantees exclusivity
        unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl<T: Element> Drop for Segment<T> {
    fn drop(&mut self) {
        if let Some(layout) = self.layout {
            // SAFETY: allocated in `Segment::allocate` with this layout
            unsafe { dealloc(self.ptr.as_ptr() as *mut u8, layout) }
        }
    }
}

/// A logical array spanning multiple fixed-capacity segments.
pub struct SegmentedArray<T: Element> {
    capacity: usize,
    len: usize,
    segments: Vec<Segment<T>>,
}

impl<T: Element> SegmentedArray<T> {
    /// Allocate a zeroed array of `len` elements in segments of `capacity`.
    ///
    /// If any segment cannot be allocated, the segments allocated so far are
    /// released before the error is returned.
    pub fn allocate(len: usize, capacity: usize, budget: &Arc<MemoryBudget>) -> Result<Self> {
        if capacity == 0 {
            return Err(MatrixError::Config("segment capacity must be positive".into()));
        }
        let n_full = len / capacity;
        let rem = len % capacity;
        let mut segments = Vec::with_capacity(n_full + if rem > 0 { 1 } else { 0 });
        for _ in 0..n_full {
            segments.push(Segment::allocate(capacity, budget)?);
        }
        if rem > 0 {
            segments.push(Segment::allocate(rem, budget)?);
        }
        trace!(
            "allocated {} elements of {} bytes in {} segments",
            len,
            size_of::<T>(),
            segments.len()
        );
        Ok(SegmentedArray {
            capacity,
            len,
            segments,
        })
    }

    /// Rebuild an array from segment contents, checking the segment shapes.
    pub fn from_segments(
        parts: Vec<Vec<T>>,
        capacity: usize,
        budget: &Arc<MemoryBudget>,
    ) -> Result<Self> {
        let n = parts.len();
        for (i, part) in parts.iter().enumerate() {
            let ok = if i + 1 < n {
                part.len() == capacity
            } else {
                !part.is_empty() && part.len() <= capacity
            };
            if !ok {
                return Err(MatrixError::Consistency(format!(
                    "segment {} of {} has {} elements (capacity {})",
                    i,
                    n,
                    part.len(),
                    capacity
                )));
            }
        }
        let len = parts.iter().map(Vec::len).sum();
        let mut array = Self::allocate(len, capacity, budget)?;
        for (seg, part) in array.segments.iter_mut().zip(parts) {
            seg.as_mut_slice().copy_from_slice(&part);
        }
        Ok(array)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Get the maximum number of elements per segment.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Get the number of bytes held by this array.
    pub fn allocated_bytes(&self) -> usize {
        self.segments.iter().map(|s| s.lease.bytes()).sum()
    }

    /// Compute the `(segment, offset)` location of a global index.
    pub fn locate(&self, index: usize) -> (usize, usize) {
        locate(index, self.capacity)
    }

    /// Set a single element.  Panics if out of bounds.
    pub fn set(&mut self, index: usize, value: T) {
        assert!(
            index < self.len,
            "index {} out of bounds for {}",
            index,
            self.len
        );
        let (s, o) = self.locate(index);
        self.segments[s].as_mut_slice()[o] = value;
    }

    /// Iterate over the segments as slices.
    pub fn segments(&self) -> impl Iterator<Item = &[T]> + '_ {
        self.segments.iter().map(Segment::as_slice)
    }

    pub fn to_vec(&self) -> Vec<T> {
        let mut out = Vec::with_capacity(self.len);
        for s in self.segments() {
            out.extend_from_slice(s);
        }
        out
    }

    /// Copy the segments out into owned vectors.
    pub fn segment_vecs(&self) -> Vec<Vec<T>> {
        self.segments().map(<[T]>::to_vec).collect()
    }

    /// Split the array into disjoint sequential views.
    ///
    /// `bounds` must start at 0, be non-decreasing, and end at the array
    /// length; view `i` covers `bounds[i]..bounds[i + 1]`, so every element
    /// belongs to exactly one view.
    pub fn split_mut(&mut self, bounds: &[usize]) -> Result<Vec<SegmentedSliceMut<'_, T>>> {
        check_bounds(bounds, self.len)?;
        let heads: Vec<&mut [T]> = self
            .segments
            .iter_mut()
            .map(Segment::as_mut_slice)
            .collect();
        let mut stream = SliceStream {
            rest: heads.into_iter(),
            head: &mut [],
        };
        Ok(bounds
            .windows(2)
            .map(|w| SegmentedSliceMut::new(stream.take(w[1] - w[0])))
            .collect())
    }

    /// Copy `src` into the array starting at `start` through a shared reference.
    ///
    /// # Safety
    ///
    /// No other thread may read or write `start..start + src.len()` while
    /// this runs, and no shared slices of the array may be alive.
    pub(crate) unsafe fn write_at(&self, start: usize, src: &[T]) {
        assert!(
            start + src.len() <= self.len,
            "write of {} elements at {} overflows array of {}",
            src.len(),
            start,
            self.len
        );
        let mut pos = start;
        let mut src = src;
        while !src.is_empty() {
            let (s, o) = self.locate(pos);
            let seg = &self.segments[s];
            let k = src.len().min(seg.len - o);
            ptr::copy_nonoverlapping(src.as_ptr(), seg.ptr.as_ptr().add(o), k);
            src = &src[k..];
            pos += k;
        }
    }
}

impl<T: Element> Index<usize> for SegmentedArray<T> {
    type Output = T;

    fn index(&self, index: usize) -> &T {
        assert!(
            index < self.len,
            "index {} out of bounds for {}",
            index,
            self.len
        );
        let (s, o) = self.locate(index);
        &self.segments[s].as_slice()[o]
    }
}

impl<T: Element + std::fmt::Debug> std::fmt::Debug for SegmentedArray<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentedArray")
            .field("len", &self.len)
            .field("capacity", &self.capacity)
            .field("segments", &self.segments.len())
            .finish()
    }
}

/// Check that split bounds cover `0..len` in order.
pub(crate) fn check_bounds(bounds: &[usize], len: usize) -> Result<()> {
    if bounds.first() != Some(&0) {
        return Err(MatrixError::Consistency(
            "split bounds must start at 0".into(),
        ));
    }
    if bounds.windows(2).any(|w| w[0] > w[1]) {
        return Err(MatrixError::Consistency(
            "split bounds are not monotone".into(),
        ));
    }
    let last = *bounds.last().unwrap_or(&0);
    if last != len {
        return Err(MatrixError::Consistency(format!(
            "split bounds end at {}, buffer has {} elements",
            last, len
        )));
    }
    Ok(())
}

/// Split a plain slice into the views described by `bounds`.
pub(crate) fn split_slice_mut<'a, T>(
    data: &'a mut [T],
    bounds: &[usize],
) -> Result<Vec<&'a mut [T]>> {
    check_bounds(bounds, data.len())?;
    let mut rest = data;
    let mut out = Vec::with_capacity(bounds.len().saturating_sub(1));
    for w in bounds.windows(2) {
        let (head, tail) = mem::take(&mut rest).split_at_mut(w[1] - w[0]);
        out.push(head);
        rest = tail;
    }
    Ok(out)
}

/// Walks segment slices front to back, handing out runs of elements.
struct SliceStream<'a, T> {
    rest: std::vec::IntoIter<&'a mut [T]>,
    head: &'a mut [T],
}

impl<'a, T> SliceStream<'a, T> {
    fn take(&mut self, mut n: usize) -> Vec<&'a mut [T]> {
        let mut out = Vec::new();
        while n > 0 {
            if self.head.is_empty() {
                match self.rest.next() {
                    Some(next) => self.head = next,
                    None => break,
                }
                continue;
            }
            let k = n.min(self.head.len());
            let (piece, tail) = mem::take(&mut self.head).split_at_mut(k);
            out.push(piece);
            self.head = tail;
            n -= k;
        }
        debug_assert_eq!(n, 0, "segment stream exhausted");
        out
    }
}

/// Mutable view of a contiguous range of a [SegmentedArray].
///
/// The range may straddle segment boundaries; it is written front to back
/// through the [Cursor] interface.
pub struct SegmentedSliceMut<'a, T> {
    pieces: Vec<&'a mut [T]>,
    len: usize,
    piece: usize,
    offset: usize,
    written: usize,
}

impl<'a, T: Copy> SegmentedSliceMut<'a, T> {
    fn new(pieces: Vec<&'a mut [T]>) -> Self {
        let len = pieces.iter().map(|p| p.len()).sum();
        SegmentedSliceMut {
            pieces,
            len,
            piece: 0,
            offset: 0,
            written: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Check whether every element of the view has been written.
    pub fn is_full(&self) -> bool {
        self.written == self.len
    }
}

impl<T: Copy> Cursor<T> for SegmentedSliceMut<'_, T> {
    fn put(&mut self, value: T) {
        assert!(
            self.written < self.len,
            "write past end of {}-element view",
            self.len
        );
        while self.offset == self.pieces[self.piece].len() {
            self.piece += 1;
            self.offset = 0;
        }
        self.pieces[self.piece][self.offset] = value;
        self.offset += 1;
        self.written += 1;
    }

    fn put_slice(&mut self, values: &[T]) {
        assert!(
            self.written + values.len() <= self.len,
            "write of {} elements past end of {}-element view ({} written)",
            values.len(),
            self.len,
            self.written
        );
        let mut values = values;
        while !values.is_empty() {
            let piece = &mut self.pieces[self.piece];
            let room = piece.len() - self.offset;
            if room == 0 {
                self.piece += 1;
                self.offset = 0;
                continue;
            }
            let k = room.min(values.len());
            piece[self.offset..self.offset + k].copy_from_slice(&values[..k]);
            self.offset += k;
            self.written += k;
            values = &values[k..];
        }
    }

    fn written(&self) -> usize {
        self.written
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locate_across_boundary() {
        let cap = 4;
        assert_eq!(locate(cap - 1, cap), (0, cap - 1));
        assert_eq!(locate(cap, cap), (1, 0));
        assert_eq!(locate(cap + 1, cap), (1, 1));

        let budget = MemoryBudget::unbounded();
        let mut arr = SegmentedArray::<i64>::allocate(10, cap, &budget).unwrap();
        for i in 0..10 {
            arr.set(i, i as i64 * 10);
        }
        assert_eq!(arr.locate(cap + 1), (1, 1));
        assert_eq!(arr[cap - 1], 30);
        assert_eq!(arr[cap], 40);
        assert_eq!(arr[cap + 1], 50);
    }

    #[test]
    fn allocate_exact_segments() {
        let budget = MemoryBudget::unbounded();
        let arr = SegmentedArray::<f32>::allocate(10, 4, &budget).unwrap();
        assert_eq!(arr.len(), 10);
        let lens: Vec<usize> = arr.segments().map(|s| s.len()).collect();
        assert_eq!(lens, vec![4, 4, 2]);
        assert!(arr.to_vec().iter().all(|v| *v == 0.0));
        assert_eq!(budget.in_use(), 40);
        drop(arr);
        assert_eq!(budget.in_use(), 0);
    }

    #[test]
    fn allocate_empty() {
        let budget = MemoryBudget::unbounded();
        let arr = SegmentedArray::<i32>::allocate(0, 4, &budget).unwrap();
        assert!(arr.is_empty());
        assert_eq!(arr.segments().count(), 0);
        assert!(arr.to_vec().is_empty());
    }

    #[test]
    fn failed_allocation_releases_segments() {
        // room for the first segment only
        let budget = MemoryBudget::with_limit(20);
        let err = SegmentedArray::<f32>::allocate(10, 4, &budget).unwrap_err();
        assert!(matches!(err, MatrixError::Allocation { .. }));
        assert_eq!(budget.in_use(), 0);
    }

    #[test]
    fn split_views_cross_segments() {
        let budget = MemoryBudget::unbounded();
        let mut arr = SegmentedArray::<i32>::allocate(10, 4, &budget).unwrap();
        {
            let mut views = arr.split_mut(&[0, 3, 3, 7, 10]).unwrap();
            assert_eq!(views.len(), 4);
            assert_eq!(views[1].len(), 0);
            views[0].put_slice(&[1, 2, 3]);
            for v in [4, 5, 6, 7] {
                views[2].put(v);
            }
            views[3].put_slice(&[8, 9, 10]);
            assert!(views.iter().all(|v| v.is_full()));
        }
        assert_eq!(arr.to_vec(), (1..=10).collect::<Vec<i32>>());
    }

    #[test]
    fn split_rejects_bad_bounds() {
        let budget = MemoryBudget::unbounded();
        let mut arr = SegmentedArray::<i32>::allocate(10, 4, &budget).unwrap();
        assert!(arr.split_mut(&[0, 5]).is_err());
        assert!(arr.split_mut(&[1, 10]).is_err());
        assert!(arr.split_mut(&[0, 6, 5, 10]).is_err());
    }

    #[test]
    #[should_panic]
    fn view_overflow_panics() {
        let budget = MemoryBudget::unbounded();
        let mut arr = SegmentedArray::<i32>::allocate(4, 4, &budget).unwrap();
        let mut views = arr.split_mut(&[0, 2, 4]).unwrap();
        views[0].put_slice(&[1, 2, 3]);
    }

    #[test]
    fn shared_write_spans_segments() {
        let budget = MemoryBudget::unbounded();
        let arr = SegmentedArray::<f32>::allocate(9, 4, &budget).unwrap();
        // SAFETY: single-threaded, no outstanding slices
        unsafe {
            arr.write_at(2, &[1.0, 2.0, 3.0, 4.0, 5.0]);
        }
        assert_eq!(
            arr.to_vec(),
            vec![0.0, 0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 0.0, 0.0]
        );
    }

    #[test]
    fn rebuild_from_segments() {
        let budget = MemoryBudget::unbounded();
        let arr = SegmentedArray::from_segments(vec![vec![1i64, 2, 3], vec![4]], 3, &budget)
            .unwrap();
        assert_eq!(arr.to_vec(), vec![1, 2, 3, 4]);
        assert!(SegmentedArray::from_segments(vec![vec![1i64, 2], vec![4]], 3, &budget).is_err());
    }

    #[test]
    fn split_plain_slice() {
        let mut data = vec![0u8; 5];
        let parts = split_slice_mut(&mut data, &[0, 2, 5]).unwrap();
        assert_eq!(parts.iter().map(|p| p.len()).collect::<Vec<_>>(), vec![2, 3]);
    }
}
