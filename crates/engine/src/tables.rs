//! Per-tile offset tables: the publish/consume protocol between readers and
//! their downstream consumers.
//!
//! Slot lifecycle: IDLE -> (producer CAS `active` false->true) ACQUIRED ->
//! (producer stores payload, flips `ready`) READY -> (consumers use it and
//! release) -> last release clears back to IDLE. Producers that meet a slot
//! still held by a stale consumer spin with a staged backoff rather than
//! corrupting it. In-memory mode publishes with a retained consumer count so
//! slots survive every iteration.

use std::cell::UnsafeCell;
use std::ops::Range;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use ringbuf::Element;

/// Consumer count marking a slot as retained forever (in-memory mode).
pub const RETAINED: u32 = u32::MAX;

/// One tile inside a bundle slab read from disk. Cloning shares the slab;
/// the last clone to drop releases the slab back to its ring.
#[derive(Clone)]
pub struct TileBundleRef {
    bundle: Arc<Element>,
    range: Range<usize>,
    pub global_tile_id: u64,
}

impl TileBundleRef {
    pub fn new(bundle: Arc<Element>, range: Range<usize>, global_tile_id: u64) -> Self {
        Self {
            bundle,
            range,
            global_tile_id,
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bundle[self.range.clone()]
    }
}

struct Slot<P> {
    active: AtomicBool,
    ready: AtomicBool,
    consumers: AtomicU32,
    payload: UnsafeCell<Option<P>>,
}

// Payload access is ordered by the active/ready protocol.
unsafe impl<P: Send> Sync for Slot<P> {}

impl<P> Default for Slot<P> {
    fn default() -> Self {
        Self {
            active: AtomicBool::new(false),
            ready: AtomicBool::new(false),
            consumers: AtomicU32::new(0),
            payload: UnsafeCell::new(None),
        }
    }
}

/// Staged backoff for bounded waits: spin briefly, yield, then sleep in
/// growing steps to reduce scheduler thrash under sustained pressure.
pub(crate) struct Backoff {
    rounds: u64,
    sleep: Duration,
}

impl Backoff {
    pub fn new() -> Self {
        Self {
            rounds: 0,
            sleep: Duration::from_micros(50),
        }
    }

    pub fn wait(&mut self) {
        self.rounds += 1;
        if self.rounds <= 64 {
            std::hint::spin_loop();
        } else if self.rounds <= 72 {
            std::thread::yield_now();
        } else {
            std::thread::sleep(self.sleep);
            self.sleep = (self.sleep * 2).min(Duration::from_millis(1));
        }
    }
}

pub struct SlotTable<P> {
    slots: Box<[Slot<P>]>,
}

impl<P: Clone> SlotTable<P> {
    pub fn new(len: usize) -> Self {
        Self {
            slots: (0..len).map(|_| Slot::default()).collect(),
        }
    }

    /// Producer side: acquires the slot (waiting out stale consumers),
    /// stores the payload and publishes it for `consumers` releases.
    pub fn publish(&self, index: usize, payload: P, consumers: u32) {
        let slot = &self.slots[index];
        let mut backoff = Backoff::new();
        while slot
            .active
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            backoff.wait();
        }
        debug_assert!(!slot.ready.load(Ordering::Relaxed));
        slot.consumers.store(consumers, Ordering::Relaxed);
        unsafe { *slot.payload.get() = Some(payload) };
        slot.ready.store(true, Ordering::Release);
    }

    /// Consumer side: waits for the slot to publish.
    pub fn wait_ready(&self, index: usize) {
        let slot = &self.slots[index];
        let mut backoff = Backoff::new();
        while !slot.ready.load(Ordering::Acquire) {
            backoff.wait();
        }
    }

    /// Clone of a published payload. Callers pair this with `release`
    /// unless the slot is retained.
    pub fn get(&self, index: usize) -> P {
        let slot = &self.slots[index];
        debug_assert!(slot.ready.load(Ordering::Acquire));
        unsafe { (*slot.payload.get()).as_ref().cloned().unwrap() }
    }

    /// Drops one consumer reference; the last one clears the slot for the
    /// next publish. Retained slots ignore releases.
    pub fn release(&self, index: usize) {
        let slot = &self.slots[index];
        if slot.consumers.load(Ordering::Relaxed) == RETAINED {
            return;
        }
        let previous = slot.consumers.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous >= 1);
        if previous == 1 {
            unsafe { *slot.payload.get() = None };
            slot.ready.store(false, Ordering::Release);
            slot.active.store(false, Ordering::Release);
        }
    }

    pub fn is_ready(&self, index: usize) -> bool {
        self.slots[index].ready.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn publish_take_release_cycle() {
        let table: SlotTable<u64> = SlotTable::new(4);
        table.publish(2, 99, 1);
        assert!(table.is_ready(2));
        table.wait_ready(2);
        assert_eq!(table.get(2), 99);
        table.release(2);
        assert!(!table.is_ready(2));
        // The slot is reusable immediately.
        table.publish(2, 100, 1);
        assert_eq!(table.get(2), 100);
        table.release(2);
    }

    #[test]
    fn two_consumers_clear_on_last_release() {
        let table: SlotTable<u64> = SlotTable::new(1);
        table.publish(0, 7, 2);
        assert_eq!(table.get(0), 7);
        table.release(0);
        assert!(table.is_ready(0), "slot must survive the first release");
        assert_eq!(table.get(0), 7);
        table.release(0);
        assert!(!table.is_ready(0));
    }

    #[test]
    fn retained_slots_survive_releases() {
        let table: SlotTable<u64> = SlotTable::new(1);
        table.publish(0, 5, RETAINED);
        for _ in 0..10 {
            assert_eq!(table.get(0), 5);
            table.release(0);
        }
        assert!(table.is_ready(0));
    }

    #[test]
    fn producer_waits_for_stale_consumer() {
        let table: Arc<SlotTable<u64>> = Arc::new(SlotTable::new(1));
        table.publish(0, 1, 1);

        let producer = {
            let table = Arc::clone(&table);
            thread::spawn(move || {
                // Blocks until the consumer below releases the slot.
                table.publish(0, 2, 1);
            })
        };
        thread::sleep(Duration::from_millis(20));
        assert_eq!(table.get(0), 1);
        table.release(0);
        producer.join().unwrap();
        table.wait_ready(0);
        assert_eq!(table.get(0), 2);
        table.release(0);
    }
}
