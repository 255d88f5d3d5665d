//! Vertex domain: owns the global vertex arrays and the reduce/apply side
//! of the pipeline. One per-edge-engine part mirrors the tile layout and
//! hosts the index readers, vertex fetchers and vertex reducers serving
//! that engine; the global reducers, global fetchers and vertex appliers
//! are domain-wide.

pub(crate) mod applier;
pub(crate) mod fetcher;
pub(crate) mod global_reducer;
pub(crate) mod index_reader;
pub(crate) mod reducer;

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Mutex};
use std::thread::JoinHandle;
use std::time::Instant;

use arc_swap::ArcSwap;
use bitvec::order::Lsb0;
use bitvec::vec::BitVec;
use crossbeam_channel::{Receiver, Sender};
use model::{
    TileGrid, VERTEX_LOCK_TABLE_SIZE, VERTICES_PER_PARTITION_STRIPE, VertexId, bitset_len_bytes,
};
use protocol::{ActiveTilesHeader, active_tiles_block_bytes};
use ringbuf::{ByteRing, Mode, SegmentShadow};
use tiles::{ResultWriter, TileFile, VertexToTiles};

use algorithms::VertexProgram;

use crate::config::{LocalFetcherMode, RuntimeConfig};
use crate::events::PerfEventSink;
use crate::split::TileBreakPoint;
use crate::tables::{SlotTable, TileBundleRef};
use crate::vertex_array::VertexArrays;
use crate::{EngineError, fatal};

/// Source-vertex lookup shipped to a global fetcher.
pub(crate) enum FetchRequest {
    Fetch {
        block_id: u64,
        fetcher_slot: usize,
        vertex_ids: Vec<VertexId>,
    },
    Shutdown,
}

pub(crate) struct FetchResponse<V> {
    pub block_id: u64,
    pub values: Vec<V>,
}

/// Vertex-domain state serving one edge engine.
pub(crate) struct VertexPart {
    pub engine_index: usize,
    pub index_file: Arc<TileFile>,
    pub index_ring: ByteRing,
    pub index_table: Arc<SlotTable<TileBundleRef>>,
    pub tiles_data_ring: ByteRing,
    pub processed_ring: ByteRing,
    pub active_tiles_shadow: Option<SegmentShadow>,
    pub index_reader_progress: Arc<AtomicU64>,
    pub fetcher_progress: Arc<AtomicU64>,
    /// Vertex-side view of the engine's active tiles this iteration.
    pub tile_active_current: ArcSwap<BitVec<u8, Lsb0>>,
    /// Accumulates next-iteration activations; bits only move 0 -> 1 here.
    pub tile_active_next: Mutex<BitVec<u8, Lsb0>>,
    /// Countdown used by the vertex reducers' shutdown handshake.
    pub reducers_draining: AtomicUsize,
}

pub(crate) struct VertexDomain<A: VertexProgram> {
    pub config: Arc<RuntimeConfig>,
    pub grid: TileGrid,
    pub algorithm: Arc<A>,
    pub vertices: VertexArrays<A::Value>,
    pub v2t: VertexToTiles,
    pub parts: Vec<Arc<VertexPart>>,
    /// One response ring per global reducer.
    pub reducer_rings: Vec<ByteRing>,
    pub break_point: Arc<TileBreakPoint>,
    pub lock_table: Vec<Mutex<()>>,

    pub reducer_init_barrier: Barrier,
    pub memory_init_barrier: Barrier,
    pub end_reduce_barrier: Barrier,
    pub local_apply_barrier: Barrier,
    pub end_apply_barrier: Barrier,

    /// Completed iterations.
    pub iteration: AtomicU64,
    pub shutdown: AtomicBool,
    pub result_writer: Option<ResultWriter>,

    pub fetch_tx: Sender<FetchRequest>,
    pub fetch_rx: Receiver<FetchRequest>,
    pub fetch_responses: Vec<(Sender<FetchResponse<A::Value>>, Receiver<FetchResponse<A::Value>>)>,

    pub sink: Arc<dyn PerfEventSink>,
    pub round_started: Mutex<Instant>,
}

impl<A: VertexProgram> VertexDomain<A> {
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    pub fn raise_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    pub fn count_vertices(&self) -> u64 {
        self.config.count_vertices
    }

    /// Barrier population for `memory_init_barrier`.
    pub fn memory_init_parties(config: &RuntimeConfig) -> usize {
        let per_part = config.count_index_readers
            + config.count_vertex_fetchers
            + config.count_vertex_reducers;
        let global_fetchers = if config.local_fetcher_mode == LocalFetcherMode::GlobalFetcher {
            config.count_global_fetchers
        } else {
            0
        };
        config.count_global_reducers + global_fetchers + per_part * config.count_edge_engines
    }

    /// Barrier population for `end_apply_barrier`.
    pub fn end_apply_parties(config: &RuntimeConfig) -> usize {
        let mut parties = config.count_vertex_appliers
            + config.count_vertex_fetchers * config.count_edge_engines;
        if config.use_selective_scheduling {
            parties += config.count_index_readers * config.count_edge_engines;
        }
        parties
    }

    /// Leader-side startup: seed the vertex arrays from the algorithm and,
    /// in selective mode, derive and ship the initial active-tile sets.
    /// Runs once on the global reducer that wins the init barrier, after
    /// every reducer has first-touched its stripes.
    pub fn init_algorithm(&self) {
        let count = self.count_vertices();
        let identity = self.algorithm.gather_identity();
        for vertex in 0..count {
            self.vertices
                .current_set(vertex, self.algorithm.init_vertex(vertex));
            self.vertices.next_set(vertex, identity);
            if self.algorithm.initially_active(vertex) {
                self.vertices.active_current().set(vertex as usize);
            }
        }
        tracing::info!(vertices = count, "algorithm state initialized");

        if self.config.use_selective_scheduling {
            let mut per_engine: Vec<BitVec<u8, Lsb0>> = self
                .parts
                .iter()
                .map(|part| {
                    BitVec::repeat(false, self.grid.tiles_in_engine(part.engine_index) as usize)
                })
                .collect();
            for vertex in 0..count {
                if !self.vertices.active_current().get(vertex as usize) {
                    continue;
                }
                for &tile in self.v2t.tiles_of(vertex) {
                    let engine = self.grid.engine_of_tile(tile as u64);
                    let local = self.grid.local_tile_id(tile as u64) as usize;
                    per_engine[engine].set(local, true);
                }
            }
            for (part, bits) in self.parts.iter().zip(per_engine) {
                let count_active = bits.count_ones() as u64;
                let bits = Arc::new(bits);
                part.tile_active_current.store(Arc::clone(&bits));
                self.send_active_tiles(part, &bits, count_active, false);
            }
        }
    }

    /// Ships one engine's active-tile bitmap through the segmented ring
    /// with the bulk-copy primitive.
    pub fn send_active_tiles(
        &self,
        part: &VertexPart,
        bits: &BitVec<u8, Lsb0>,
        count_active: u64,
        shutdown: bool,
    ) {
        let Some(shadow) = part.active_tiles_shadow.as_ref() else {
            return;
        };
        let tiles_local = self.grid.tiles_in_engine(part.engine_index) as usize;
        let size = active_tiles_block_bytes(tiles_local);
        let mut guard = shadow
            .ring()
            .put(size, Mode::Blocking)
            .unwrap_or_else(|error| fatal(EngineError::Ring(error)));
        let header = ActiveTilesHeader::new(shutdown, count_active);
        guard.write_at(0, bytemuck::bytes_of(&header));
        let bit_bytes = &bits.as_raw_slice()[..bitset_len_bytes(tiles_local)];
        shadow
            .copy_to_ring(&mut guard, std::mem::size_of::<ActiveTilesHeader>(), bit_bytes)
            .unwrap_or_else(|error| fatal(EngineError::Transport(error)));
        guard.set_ready();
        tracing::info!(
            engine = part.engine_index,
            active = count_active,
            shutdown,
            "sent active tile list"
        );
    }

    /// End-of-iteration reset, run by the applier that wins the
    /// local-apply barrier while every other pipeline thread is parked:
    /// swaps the double buffers, dumps the iteration output, rotates the
    /// per-engine tile-active arrays and decides global shutdown.
    pub fn reset_round(&self) {
        let completed = self.iteration.fetch_add(1, Ordering::AcqRel) + 1;
        self.vertices.swap_round();

        if let Some(writer) = &self.result_writer {
            let values = self.vertices.snapshot_current();
            writer
                .write_iteration(completed - 1, &values)
                .unwrap_or_else(|error| fatal(EngineError::Store(error)));
        }

        let capped = completed >= self.config.max_iterations;
        let mut raise = capped;

        if self.config.use_selective_scheduling {
            let mut rotated = Vec::with_capacity(self.parts.len());
            let mut total_active = 0u64;
            for part in &self.parts {
                let tiles_local = self.grid.tiles_in_engine(part.engine_index) as usize;
                let mut next = part.tile_active_next.lock().unwrap();
                let bits = std::mem::replace(&mut *next, BitVec::repeat(false, tiles_local));
                let count_active = bits.count_ones() as u64;
                total_active += count_active;
                let bits = Arc::new(bits);
                part.tile_active_current.store(Arc::clone(&bits));
                rotated.push((part, bits, count_active));
            }
            raise = raise || total_active == 0;
            for (part, bits, count_active) in rotated {
                self.send_active_tiles(part, &bits, count_active, raise);
            }
        }

        if raise {
            self.raise_shutdown();
            for _ in 0..self.config.count_global_fetchers {
                // Ignore send failures: fetch channels may already be idle.
                let _ = self.fetch_tx.send(FetchRequest::Shutdown);
            }
        }

        let mut round_started = self.round_started.lock().unwrap();
        tracing::info!(
            iteration = completed - 1,
            elapsed_ms = round_started.elapsed().as_millis() as u64,
            shutdown = raise,
            "round reset"
        );
        *round_started = Instant::now();
    }

    /// Stripe ownership for memory init: `(v / STRIPE) mod G`.
    pub fn stripe_owner_of(&self, vertex: VertexId) -> usize {
        model::stripe_owner(vertex, self.config.count_global_reducers)
    }

    /// First-touch pass for one reducer: zero every stripe it owns.
    pub fn init_reducer_memory(&self, reducer: usize) {
        let count = self.count_vertices();
        let stripe = VERTICES_PER_PARTITION_STRIPE;
        let mut start = 0u64;
        while start < count {
            let end = (start + stripe).min(count);
            if self.stripe_owner_of(start) == reducer {
                self.vertices
                    .init_stripe(start as usize, end as usize, bytemuck::Zeroable::zeroed());
            }
            start = end;
        }
    }

    pub fn start(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let config = &self.config;
        let mut handles = Vec::new();

        for reducer_id in 0..config.count_global_reducers {
            let domain = Arc::clone(self);
            handles.push(
                std::thread::Builder::new()
                    .name(format!("global_reducer_{reducer_id}"))
                    .spawn(move || global_reducer::run_global_reducer(domain, reducer_id))
                    .expect("spawn global reducer thread"),
            );
        }

        for applier_id in 0..config.count_vertex_appliers {
            let domain = Arc::clone(self);
            handles.push(
                std::thread::Builder::new()
                    .name(format!("vertex_applier_{applier_id}"))
                    .spawn(move || applier::run_vertex_applier(domain, applier_id))
                    .expect("spawn vertex applier thread"),
            );
        }

        if config.local_fetcher_mode == LocalFetcherMode::GlobalFetcher {
            for fetcher_id in 0..config.count_global_fetchers {
                let domain = Arc::clone(self);
                handles.push(
                    std::thread::Builder::new()
                        .name(format!("global_fetcher_{fetcher_id}"))
                        .spawn(move || fetcher::run_global_fetcher(domain, fetcher_id))
                        .expect("spawn global fetcher thread"),
                );
            }
        }

        for part in &self.parts {
            for reader_id in 0..config.count_index_readers {
                let domain = Arc::clone(self);
                let part = Arc::clone(part);
                handles.push(
                    std::thread::Builder::new()
                        .name(format!("index_reader_{}_{}", part.engine_index, reader_id))
                        .spawn(move || index_reader::run_index_reader(domain, part, reader_id))
                        .expect("spawn index reader thread"),
                );
            }
            for fetcher_id in 0..config.count_vertex_fetchers {
                let domain = Arc::clone(self);
                let part = Arc::clone(part);
                handles.push(
                    std::thread::Builder::new()
                        .name(format!("vertex_fetcher_{}_{}", part.engine_index, fetcher_id))
                        .spawn(move || fetcher::run_vertex_fetcher(domain, part, fetcher_id))
                        .expect("spawn vertex fetcher thread"),
                );
            }
            for reducer_id in 0..config.count_vertex_reducers {
                let domain = Arc::clone(self);
                let part = Arc::clone(part);
                handles.push(
                    std::thread::Builder::new()
                        .name(format!("vertex_reducer_{}_{}", part.engine_index, reducer_id))
                        .spawn(move || reducer::run_vertex_reducer(domain, part, reducer_id))
                        .expect("spawn vertex reducer thread"),
                );
            }
        }
        handles
    }
}

pub(crate) fn lock_table() -> Vec<Mutex<()>> {
    (0..VERTEX_LOCK_TABLE_SIZE).map(|_| Mutex::new(())).collect()
}
