//! Multi-producer / multi-consumer FIFO of variably sized byte elements over
//! a fixed region.
//!
//! Each element carries a header with its size and a status word that walks
//! `free -> allocated -> ready -> done`. Producers reserve space with [`ByteRing::put`],
//! fill the payload through the returned guard and publish with
//! [`PutGuard::set_ready`]; consumers take ready elements with [`ByteRing::get`] and
//! release them with [`Element::set_done`]. The region only reclaims a prefix
//! of contiguous done elements, so completion may happen out of order without
//! corrupting the allocator.
//!
//! An element never straddles the wrap-around: when the tail of the region is
//! too small, a padding element fills it and the payload lands at offset 0.
//! Callers therefore always see one contiguous slice, which is the contract
//! the double-mapping trick of some implementations exists to provide.
//!
//! Counter roles: `head` is the allocation frontier, `tail` the ready
//! boundary visible to consumers, `reclaim` the done boundary. The
//! provisional allocation watermark that orders producers in lock-free
//! variants (`tail2`) is folded into the allocation mutex here; element
//! visibility is still gated exclusively on `set_ready`.

pub mod segment;

pub use segment::{SegmentHost, SegmentMaster, SegmentShadow, TransportError};

use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Blocking,
    NonBlocking,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RingError {
    #[error("ring buffer full")]
    Full,
    #[error("ring buffer empty")]
    Empty,
    #[error("ring buffer closed")]
    Closed,
    #[error("element of {requested} bytes does not fit a ring of {capacity} bytes")]
    TooLarge { requested: usize, capacity: usize },
}

const STATUS_ALLOCATED: u32 = 1;
const STATUS_READY: u32 = 2;
const STATUS_DONE: u32 = 3;
/// Wrap filler or cancelled reservation; skipped by consumers, reclaimed
/// like a done element.
const STATUS_PAD: u32 = 4;

const HEADER_BYTES: usize = 16;

#[repr(C)]
struct ElmHeader {
    /// Total element size including header and alignment padding.
    total: u32,
    /// Caller-visible payload size.
    payload: u32,
    status: AtomicU32,
    _reserved: u32,
}

#[derive(Debug)]
struct CoreState {
    /// Allocation frontier (monotonic byte counter).
    head: u64,
    /// Ready boundary: everything below is ready, done or padding.
    tail: u64,
    /// Consumer cursor, `<= tail`.
    next_get: u64,
    /// Done boundary: free space is `capacity - (head - reclaim)`.
    reclaim: u64,
    closed: bool,
}

#[derive(Debug)]
struct RingCore {
    buf: *mut u8,
    capacity: usize,
    align: usize,
    state: Mutex<CoreState>,
    not_full: Condvar,
    not_empty: Condvar,
}

// The raw buffer is only touched through offsets handed out by the
// allocation protocol; guards give out disjoint &mut ranges.
unsafe impl Send for RingCore {}
unsafe impl Sync for RingCore {}

impl Drop for RingCore {
    fn drop(&mut self) {
        let layout = Layout::from_size_align(self.capacity, self.align).unwrap();
        unsafe { dealloc(self.buf, layout) };
    }
}

impl RingCore {
    /// Header of the element starting at monotonic offset `offset`.
    ///
    /// Caller must hold the state lock or own the element; the element must
    /// not have been reclaimed.
    unsafe fn header(&self, offset: u64) -> &ElmHeader {
        let pos = (offset % self.capacity as u64) as usize;
        debug_assert_eq!(pos % self.align, 0);
        unsafe { &*(self.buf.add(pos) as *const ElmHeader) }
    }

    unsafe fn write_header(&self, offset: u64, total: u32, payload: u32, status: u32) {
        let pos = (offset % self.capacity as u64) as usize;
        let header = self.buf.wrapping_add(pos) as *mut ElmHeader;
        unsafe {
            (*header).total = total;
            (*header).payload = payload;
            (*header).status.store(status, Ordering::Release);
        }
    }

    fn advance_tail_locked(&self, state: &mut CoreState) -> bool {
        let mut advanced = false;
        while state.tail < state.head {
            let header = unsafe { self.header(state.tail) };
            match header.status.load(Ordering::Acquire) {
                STATUS_READY | STATUS_DONE | STATUS_PAD => {
                    state.tail += header.total as u64;
                    advanced = true;
                }
                _ => break,
            }
        }
        advanced
    }

    fn advance_reclaim_locked(&self, state: &mut CoreState) -> bool {
        let mut advanced = false;
        while state.reclaim < state.tail {
            let header = unsafe { self.header(state.reclaim) };
            match header.status.load(Ordering::Acquire) {
                STATUS_DONE | STATUS_PAD => {
                    state.reclaim += header.total as u64;
                    advanced = true;
                }
                _ => break,
            }
        }
        advanced
    }

    /// Advances both boundaries and wakes whichever side gained progress.
    /// Elements released through retained handles can complete ahead of the
    /// ready boundary, so every status change sweeps both scans.
    fn sweep_locked(&self, state: &mut CoreState) {
        if self.advance_tail_locked(state) {
            self.not_empty.notify_all();
        }
        if self.advance_reclaim_locked(state) {
            self.not_full.notify_all();
        }
    }

    fn mark_ready(&self, offset: u64) {
        unsafe { self.header(offset) }
            .status
            .store(STATUS_READY, Ordering::Release);
        let mut state = self.state.lock().unwrap();
        self.sweep_locked(&mut state);
    }

    fn mark_done(&self, offset: u64, status: u32) {
        unsafe { self.header(offset) }
            .status
            .store(status, Ordering::Release);
        let mut state = self.state.lock().unwrap();
        self.sweep_locked(&mut state);
    }
}

/// Handle to a shared byte ring. Cloning shares the same region.
#[derive(Debug, Clone)]
pub struct ByteRing {
    core: Arc<RingCore>,
}

impl ByteRing {
    /// `capacity` must be a multiple of `align`; `align` a power of two of at
    /// least 8 (commonly a cacheline or page).
    pub fn with_capacity(capacity: usize, align: usize) -> Self {
        assert!(capacity > 0, "ring capacity must be greater than zero");
        assert!(
            align >= 8 && align.is_power_of_two(),
            "ring alignment must be a power of two >= 8"
        );
        assert!(
            capacity % align == 0,
            "ring capacity must be a multiple of its alignment"
        );
        let layout = Layout::from_size_align(capacity, align).unwrap();
        let buf = unsafe { alloc_zeroed(layout) };
        assert!(!buf.is_null(), "ring allocation failed");
        Self {
            core: Arc::new(RingCore {
                buf,
                capacity,
                align,
                state: Mutex::new(CoreState {
                    head: 0,
                    tail: 0,
                    next_get: 0,
                    reclaim: 0,
                    closed: false,
                }),
                not_full: Condvar::new(),
                not_empty: Condvar::new(),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.core.capacity
    }

    /// Bytes currently reserved (allocated through done-but-unreclaimed).
    pub fn used(&self) -> usize {
        let state = self.core.state.lock().unwrap();
        (state.head - state.reclaim) as usize
    }

    fn element_total(&self, payload_len: usize) -> usize {
        (HEADER_BYTES + payload_len).next_multiple_of(self.core.align)
    }

    /// Reserves `payload_len` bytes. The element becomes visible to
    /// consumers only after `set_ready`.
    pub fn put(&self, payload_len: usize, mode: Mode) -> Result<PutGuard, RingError> {
        let total = self.element_total(payload_len) as u64;
        let capacity = self.core.capacity as u64;
        if total > capacity {
            return Err(RingError::TooLarge {
                requested: payload_len,
                capacity: self.core.capacity,
            });
        }

        let mut state = self.core.state.lock().unwrap();
        loop {
            if state.closed {
                return Err(RingError::Closed);
            }
            let pos = state.head % capacity;
            let pad = if pos + total > capacity {
                capacity - pos
            } else {
                0
            };
            let free = capacity - (state.head - state.reclaim);
            if free >= pad + total {
                if pad > 0 {
                    unsafe {
                        self.core
                            .write_header(state.head, pad as u32, 0, STATUS_PAD)
                    };
                    state.head += pad;
                    // The filler may sit right at the ready boundary.
                    self.core.sweep_locked(&mut state);
                }
                let offset = state.head;
                unsafe {
                    self.core
                        .write_header(offset, total as u32, payload_len as u32, STATUS_ALLOCATED)
                };
                state.head += total;
                drop(state);
                return Ok(PutGuard {
                    ring: self.clone(),
                    offset,
                    payload_len,
                    published: false,
                });
            }
            match mode {
                Mode::NonBlocking => return Err(RingError::Full),
                Mode::Blocking => state = self.core.not_full.wait(state).unwrap(),
            }
        }
    }

    /// Takes the oldest ready element.
    pub fn get(&self, mode: Mode) -> Result<Element, RingError> {
        let mut state = self.core.state.lock().unwrap();
        loop {
            // Elements released through retained handles can be reclaimed
            // before any get reaches them; never scan reused space.
            if state.next_get < state.reclaim {
                state.next_get = state.reclaim;
            }
            while state.next_get < state.tail {
                let header = unsafe { self.core.header(state.next_get) };
                let total = header.total as u64;
                match header.status.load(Ordering::Acquire) {
                    STATUS_PAD | STATUS_DONE => {
                        state.next_get += total;
                    }
                    STATUS_READY => {
                        let offset = state.next_get;
                        let payload_len = header.payload as usize;
                        state.next_get += total;
                        drop(state);
                        return Ok(Element {
                            ring: self.clone(),
                            offset,
                            payload_len,
                            done: AtomicBool::new(false),
                        });
                    }
                    status => unreachable!("element below ready boundary has status {status}"),
                }
            }
            if state.closed {
                return Err(RingError::Closed);
            }
            match mode {
                Mode::NonBlocking => return Err(RingError::Empty),
                Mode::Blocking => state = self.core.not_empty.wait(state).unwrap(),
            }
        }
    }

    /// Unblocks all waiters; subsequent `put` fails and `get` drains what is
    /// left before failing.
    pub fn close(&self) {
        let mut state = self.core.state.lock().unwrap();
        state.closed = true;
        drop(state);
        self.core.not_full.notify_all();
        self.core.not_empty.notify_all();
    }

    fn payload_ptr(&self, offset: u64) -> *mut u8 {
        let pos = (offset % self.core.capacity as u64) as usize;
        self.core.buf.wrapping_add(pos + HEADER_BYTES)
    }
}

/// Write access to a reserved element. Dropping without publishing cancels
/// the reservation (the space is reclaimed like a done element).
#[derive(Debug)]
pub struct PutGuard {
    ring: ByteRing,
    offset: u64,
    payload_len: usize,
    published: bool,
}

impl PutGuard {
    pub fn payload_len(&self) -> usize {
        self.payload_len
    }

    /// Bulk write into the payload, mirroring the `copy_to_ring` call shape
    /// of segment shadows.
    pub fn write_at(&mut self, offset: usize, src: &[u8]) {
        self[offset..offset + src.len()].copy_from_slice(src);
    }

    /// Publishes the element to consumers.
    pub fn set_ready(mut self) {
        self.published = true;
        self.ring.core.mark_ready(self.offset);
    }

    /// Publishes and keeps a read handle, for elements distributed through
    /// offset tables instead of `get`.
    pub fn publish(mut self) -> Element {
        self.published = true;
        let element = Element {
            ring: self.ring.clone(),
            offset: self.offset,
            payload_len: self.payload_len,
            done: AtomicBool::new(false),
        };
        self.ring.core.mark_ready(self.offset);
        element
    }
}

impl Deref for PutGuard {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ring.payload_ptr(self.offset), self.payload_len) }
    }
}

impl DerefMut for PutGuard {
    fn deref_mut(&mut self) -> &mut [u8] {
        unsafe {
            std::slice::from_raw_parts_mut(self.ring.payload_ptr(self.offset), self.payload_len)
        }
    }
}

impl Drop for PutGuard {
    fn drop(&mut self) {
        if !self.published {
            self.ring.core.mark_done(self.offset, STATUS_PAD);
        }
    }
}

/// Read access to a published element. `set_done` (or drop) releases it;
/// the element is reclaimed once it joins the contiguous done prefix.
#[derive(Debug)]
pub struct Element {
    ring: ByteRing,
    offset: u64,
    payload_len: usize,
    done: AtomicBool,
}

impl Element {
    pub fn payload(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ring.payload_ptr(self.offset), self.payload_len) }
    }

    pub fn payload_len(&self) -> usize {
        self.payload_len
    }

    pub fn set_done(self) {
        self.release();
    }

    fn release(&self) {
        if !self.done.swap(true, Ordering::AcqRel) {
            self.ring.core.mark_done(self.offset, STATUS_DONE);
        }
    }
}

impl Deref for Element {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.payload()
    }
}

impl Drop for Element {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn put_get_round_trip() {
        let ring = ByteRing::with_capacity(4096, 64);
        let mut guard = ring.put(5, Mode::NonBlocking).unwrap();
        guard.copy_from_slice(b"hello");
        guard.set_ready();

        let element = ring.get(Mode::NonBlocking).unwrap();
        assert_eq!(&*element, b"hello");
        element.set_done();
        assert_eq!(ring.used(), 0);
    }

    #[test]
    fn visibility_gated_on_set_ready() {
        let ring = ByteRing::with_capacity(4096, 64);
        let guard = ring.put(8, Mode::NonBlocking).unwrap();
        assert_eq!(ring.get(Mode::NonBlocking).unwrap_err(), RingError::Empty);
        guard.set_ready();
        assert!(ring.get(Mode::NonBlocking).is_ok());
    }

    #[test]
    fn fifo_order_across_one_producer() {
        let ring = ByteRing::with_capacity(4096, 64);
        for value in 0u8..10 {
            let mut guard = ring.put(1, Mode::NonBlocking).unwrap();
            guard[0] = value;
            guard.set_ready();
        }
        for value in 0u8..10 {
            let element = ring.get(Mode::NonBlocking).unwrap();
            assert_eq!(element[0], value);
        }
    }

    #[test]
    fn out_of_order_done_reclaims_only_prefix() {
        let ring = ByteRing::with_capacity(512, 64);
        let mut elements = Vec::new();
        for _ in 0..4 {
            ring.put(8, Mode::NonBlocking).unwrap().set_ready();
            elements.push(ring.get(Mode::NonBlocking).unwrap());
        }
        let used_before = ring.used();
        // Release the second element first: nothing can be reclaimed.
        elements.remove(1).set_done();
        assert_eq!(ring.used(), used_before);
        // Releasing the first element reclaims both.
        elements.remove(0).set_done();
        assert_eq!(ring.used(), used_before - 2 * 64);
    }

    #[test]
    fn elements_never_straddle_the_wrap() {
        let ring = ByteRing::with_capacity(256, 64);
        // Fill 192 of 256 bytes, release, then ask for an element that would
        // straddle the boundary.
        for _ in 0..3 {
            ring.put(8, Mode::NonBlocking).unwrap().set_ready();
        }
        for _ in 0..3 {
            ring.get(Mode::NonBlocking).unwrap().set_done();
        }
        let mut guard = ring.put(100, Mode::NonBlocking).unwrap();
        guard[99] = 42;
        guard.set_ready();
        let element = ring.get(Mode::NonBlocking).unwrap();
        assert_eq!(element.payload_len(), 100);
        assert_eq!(element[99], 42);
    }

    #[test]
    fn oversized_put_is_rejected() {
        let ring = ByteRing::with_capacity(256, 64);
        assert!(matches!(
            ring.put(512, Mode::NonBlocking),
            Err(RingError::TooLarge { .. })
        ));
    }

    #[test]
    fn non_blocking_put_reports_full() {
        let ring = ByteRing::with_capacity(256, 64);
        // Payload 40 + 16-byte header lands on exactly one 64-byte unit.
        let _a = ring.put(40, Mode::NonBlocking).unwrap();
        let _b = ring.put(40, Mode::NonBlocking).unwrap();
        let _c = ring.put(40, Mode::NonBlocking).unwrap();
        let _d = ring.put(40, Mode::NonBlocking).unwrap();
        assert_eq!(
            ring.put(40, Mode::NonBlocking).unwrap_err(),
            RingError::Full
        );
    }

    #[test]
    fn cancelled_reservation_is_reclaimed() {
        let ring = ByteRing::with_capacity(256, 64);
        drop(ring.put(40, Mode::NonBlocking).unwrap());
        assert_eq!(ring.used(), 0);
        assert_eq!(ring.get(Mode::NonBlocking).unwrap_err(), RingError::Empty);
    }

    #[test]
    fn publish_handle_releases_without_get() {
        let ring = ByteRing::with_capacity(4096, 64);
        let mut guard = ring.put(4, Mode::NonBlocking).unwrap();
        guard.copy_from_slice(&[1, 2, 3, 4]);
        let handle = guard.publish();
        assert_eq!(&*handle, &[1, 2, 3, 4]);
        drop(handle);
        assert_eq!(ring.used(), 0);
    }

    #[test]
    fn blocking_put_waits_for_consumer() {
        let ring = ByteRing::with_capacity(256, 64);
        for _ in 0..4 {
            ring.put(8, Mode::NonBlocking).unwrap().set_ready();
        }
        let producer = {
            let ring = ring.clone();
            thread::spawn(move || {
                let mut guard = ring.put(8, Mode::Blocking).unwrap();
                guard[0] = 9;
                guard.set_ready();
            })
        };
        for _ in 0..4 {
            ring.get(Mode::Blocking).unwrap().set_done();
        }
        producer.join().unwrap();
        let element = ring.get(Mode::Blocking).unwrap();
        assert_eq!(element[0], 9);
    }

    #[test]
    fn mpmc_transfers_every_element_once() {
        let ring = ByteRing::with_capacity(8192, 64);
        let producers: Vec<_> = (0..4u8)
            .map(|producer_id| {
                let ring = ring.clone();
                thread::spawn(move || {
                    for sequence in 0..50u8 {
                        let mut guard = ring.put(2, Mode::Blocking).unwrap();
                        guard[0] = producer_id;
                        guard[1] = sequence;
                        guard.set_ready();
                    }
                })
            })
            .collect();
        let received = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let consumers: Vec<_> = (0..2)
            .map(|_| {
                let ring = ring.clone();
                let received = Arc::clone(&received);
                thread::spawn(move || {
                    let mut seen = Vec::new();
                    while received.load(Ordering::Relaxed) < 200 {
                        match ring.get(Mode::NonBlocking) {
                            Ok(element) => {
                                seen.push((element[0], element[1]));
                                element.set_done();
                                received.fetch_add(1, Ordering::Relaxed);
                            }
                            Err(RingError::Empty) => thread::yield_now(),
                            Err(error) => panic!("unexpected ring error: {error}"),
                        }
                    }
                    seen
                })
            })
            .collect();
        for producer in producers {
            producer.join().unwrap();
        }
        let mut all: Vec<(u8, u8)> = Vec::new();
        for consumer in consumers {
            all.extend(consumer.join().unwrap());
        }
        all.sort_unstable();
        let expected: Vec<(u8, u8)> = (0..4u8)
            .flat_map(|p| (0..50u8).map(move |s| (p, s)))
            .collect();
        assert_eq!(all, expected);
    }

    #[test]
    fn close_unblocks_and_drains() {
        let ring = ByteRing::with_capacity(256, 64);
        let mut guard = ring.put(1, Mode::NonBlocking).unwrap();
        guard[0] = 7;
        guard.set_ready();
        ring.close();
        assert!(matches!(ring.put(1, Mode::Blocking), Err(RingError::Closed)));
        // Remaining ready elements drain before Closed surfaces.
        let element = ring.get(Mode::Blocking).unwrap();
        assert_eq!(element[0], 7);
        element.set_done();
        assert!(matches!(ring.get(Mode::Blocking), Err(RingError::Closed)));
    }
}
