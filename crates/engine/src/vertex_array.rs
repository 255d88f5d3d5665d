//! The double-buffered global vertex array.
//!
//! `current` is read-only during an iteration; `next` cells are written by
//! exactly one global reducer each (stripe or row ownership depending on the
//! reducer mode, lock table in `Locking` mode); the appliers own disjoint
//! contiguous ranges during the apply phase. Those ownership rules plus the
//! iteration barriers are what make the unsynchronized cell access sound —
//! the accessors themselves do not check.

use std::cell::UnsafeCell;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use bytemuck::Pod;
use model::{AtomicBitset, VertexDegree};

pub(crate) struct SharedVec<T> {
    cells: Box<[UnsafeCell<T>]>,
}

unsafe impl<T: Send + Sync> Sync for SharedVec<T> {}
unsafe impl<T: Send> Send for SharedVec<T> {}

impl<T: Copy> SharedVec<T> {
    fn new(len: usize, fill: T) -> Self {
        Self {
            cells: (0..len).map(|_| UnsafeCell::new(fill)).collect(),
        }
    }

    /// Caller must not race a writer of this cell.
    pub(crate) fn get(&self, index: usize) -> T {
        unsafe { *self.cells[index].get() }
    }

    /// Caller must be the cell's sole writer with no concurrent readers.
    pub(crate) fn set(&self, index: usize, value: T) {
        unsafe { *self.cells[index].get() = value };
    }

    /// Caller must guarantee no concurrent writers for the borrow.
    pub(crate) unsafe fn as_slice(&self) -> &[T] {
        unsafe { std::slice::from_raw_parts(self.cells.as_ptr() as *const T, self.cells.len()) }
    }
}

pub(crate) struct VertexArrays<V> {
    values: [SharedVec<V>; 2],
    active: [AtomicBitset; 2],
    changed: AtomicBitset,
    degrees: Arc<Vec<VertexDegree>>,
    /// Index of the buffer currently acting as `current`.
    parity: AtomicUsize,
    count: usize,
}

impl<V: Pod> VertexArrays<V> {
    pub fn new(count: usize, degrees: Arc<Vec<VertexDegree>>) -> Self {
        assert_eq!(degrees.len(), count);
        Self {
            values: [
                SharedVec::new(count, V::zeroed()),
                SharedVec::new(count, V::zeroed()),
            ],
            active: [AtomicBitset::new(count), AtomicBitset::new(count)],
            changed: AtomicBitset::new(count),
            degrees,
            parity: AtomicUsize::new(0),
            count,
        }
    }

    pub fn count(&self) -> usize {
        self.count
    }

    fn parity(&self) -> usize {
        self.parity.load(Ordering::Acquire)
    }

    pub fn degree(&self, vertex: u64) -> VertexDegree {
        self.degrees[vertex as usize]
    }

    pub fn degrees(&self) -> &Arc<Vec<VertexDegree>> {
        &self.degrees
    }

    pub fn current_get(&self, vertex: u64) -> V {
        self.values[self.parity()].get(vertex as usize)
    }

    pub fn current_set(&self, vertex: u64, value: V) {
        self.values[self.parity()].set(vertex as usize, value);
    }

    pub fn next_get(&self, vertex: u64) -> V {
        self.values[self.parity() ^ 1].get(vertex as usize)
    }

    pub fn next_set(&self, vertex: u64, value: V) {
        self.values[self.parity() ^ 1].set(vertex as usize, value);
    }

    pub fn active_current(&self) -> &AtomicBitset {
        &self.active[self.parity()]
    }

    pub fn active_next(&self) -> &AtomicBitset {
        &self.active[self.parity() ^ 1]
    }

    pub fn changed(&self) -> &AtomicBitset {
        &self.changed
    }

    /// Fills a stripe of both value buffers; memory-init phase only.
    pub fn init_stripe(&self, start: usize, end: usize, fill: V) {
        for index in start..end {
            self.values[0].set(index, fill);
            self.values[1].set(index, fill);
        }
        self.active[0].clear_range(start, end);
        self.active[1].clear_range(start, end);
        self.changed.clear_range(start, end);
    }

    /// Rotates `{current, next}` and the active pair together, then zeroes
    /// the new `active_next` and the changed set. Single-threaded rendezvous
    /// point: every other pipeline thread is parked at a barrier.
    pub fn swap_round(&self) {
        let parity = self.parity();
        self.parity.store(parity ^ 1, Ordering::Release);
        self.active[parity].clear_all();
        self.changed.clear_all();
    }

    /// Snapshot of `current`; callers must be in a phase with no writers.
    pub fn snapshot_current(&self) -> Vec<V> {
        unsafe { self.values[self.parity()].as_slice() }.to_vec()
    }
}
