//! Performance event collection.
//!
//! Components receive an event sink at construction and report scoped
//! durations to it; there is no process-wide collector. The recording sink
//! is a bounded lossy queue: under pressure it drops events and counts the
//! drops rather than stalling the pipeline.

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_queue::ArrayQueue;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentKind {
    TileReader,
    TileProcessor,
    IndexReader,
    VertexFetcher,
    GlobalFetcher,
    VertexReducer,
    GlobalReducer,
    VertexApplier,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PerfEvent {
    pub component: ComponentKind,
    pub engine: usize,
    pub worker: usize,
    pub block_id: u64,
    pub nanos: u64,
    pub label: &'static str,
}

pub trait PerfEventSink: Send + Sync {
    fn record(&self, event: PerfEvent);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl PerfEventSink for NoopSink {
    fn record(&self, _event: PerfEvent) {}
}

#[derive(Debug)]
pub struct RecordingSink {
    queue: ArrayQueue<PerfEvent>,
    dropped: AtomicU64,
}

impl RecordingSink {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn drain(&self) -> Vec<PerfEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.queue.pop() {
            events.push(event);
        }
        events
    }

    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl PerfEventSink for RecordingSink {
    fn record(&self, event: PerfEvent) {
        if self.queue.push(event).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Edge-engine read totals, updated with relaxed atomics by the tile
/// readers and logged at iteration boundaries.
#[derive(Debug, Default)]
pub struct EdgePerfCounters {
    pub bytes_read: AtomicU64,
    pub edges_read: AtomicU64,
    pub tiles_read: AtomicU64,
    pub active_tiles_seen: AtomicU64,
    pub inactive_tiles_seen: AtomicU64,
}

impl EdgePerfCounters {
    pub fn add_batch(&self, bytes: u64, edges: u64, tiles: u64) {
        self.bytes_read.fetch_add(bytes, Ordering::Relaxed);
        self.edges_read.fetch_add(edges, Ordering::Relaxed);
        self.tiles_read.fetch_add(tiles, Ordering::Relaxed);
    }

    pub fn update_tile_stat(&self, active: u64, inactive: u64) {
        self.active_tiles_seen.fetch_add(active, Ordering::Relaxed);
        self.inactive_tiles_seen.fetch_add(inactive, Ordering::Relaxed);
    }

    pub fn reset_tile_stat(&self) {
        self.active_tiles_seen.store(0, Ordering::Relaxed);
        self.inactive_tiles_seen.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_sink_drops_beyond_capacity() {
        let sink = RecordingSink::with_capacity(2);
        for i in 0..3 {
            sink.record(PerfEvent {
                component: ComponentKind::TileReader,
                engine: 0,
                worker: 0,
                block_id: i,
                nanos: 1,
                label: "tile",
            });
        }
        assert_eq!(sink.dropped_events(), 1);
        let events = sink.drain();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].block_id, 0);
    }
}
