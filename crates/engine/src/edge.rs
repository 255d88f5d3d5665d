//! Edge engine: streams immutable edge data from disk and runs the user
//! pull-gather over it. One instance per compute domain, owning its tile
//! readers and tile-processor groups.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Barrier};
use std::thread::JoinHandle;

use arc_swap::ArcSwap;
use bitvec::order::Lsb0;
use bitvec::vec::BitVec;
use model::{MAX_EDGES_PER_TILE, TileGrid, TileStats};
use protocol::ActiveTilesBlock;
use ringbuf::{ByteRing, Mode, SegmentMaster};
use tiles::TileFile;

use algorithms::VertexProgram;

use crate::config::RuntimeConfig;
use crate::events::{EdgePerfCounters, PerfEventSink};
use crate::reader::ReaderEngine;
use crate::split::TileBreakPoint;
use crate::tables::{RETAINED, SlotTable, TileBundleRef};
use crate::tile_processor::{ProcessorGroup, run_tile_processor};
use crate::{EngineError, fatal};

pub(crate) struct EdgeEngine {
    pub config: Arc<RuntimeConfig>,
    pub engine_index: usize,
    pub grid: TileGrid,
    pub tile_stats: Arc<Vec<TileStats>>,
    pub edge_file: Arc<TileFile>,

    pub local_tiles_ring: ByteRing,
    /// Source-vertex blocks arriving from the vertex domain.
    pub tiles_data_ring: ByteRing,
    /// Responses leaving for the vertex reducers.
    pub processed_ring: ByteRing,
    pub offset_table: Arc<SlotTable<TileBundleRef>>,

    pub reader_progress: Arc<AtomicU64>,
    pub reader_barrier: Barrier,
    pub processor_barrier: Barrier,

    /// Local-tile active bitmap for the running iteration.
    pub tile_active: ArcSwap<BitVec<u8, Lsb0>>,
    pub active_tiles_master: Option<SegmentMaster>,

    pub shutdown: AtomicBool,
    pub perf: EdgePerfCounters,
    pub break_point: Arc<TileBreakPoint>,
    pub sink: Arc<dyn PerfEventSink>,
}

impl EdgeEngine {
    pub fn tiles_local(&self) -> u64 {
        self.grid.tiles_in_engine(self.engine_index)
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    pub fn raise_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    /// Blocks for the next active-tile bitmap from the vertex domain and
    /// installs it. Returns the advertised active count and whether the
    /// message carries the global shutdown flag.
    pub fn update_active_tiles(&self) -> Result<(u64, bool), EngineError> {
        let master = self
            .active_tiles_master
            .as_ref()
            .expect("selective scheduling without an active-tiles ring");
        let element = master.ring().get(Mode::Blocking)?;
        let block = ActiveTilesBlock::parse(&element)?;
        let count = block.header.count_active_tiles;
        let shutdown = block.is_shutdown();

        let mut bits: BitVec<u8, Lsb0> = BitVec::from_slice(block.tile_bits());
        bits.truncate(self.tiles_local() as usize);
        self.tile_active.store(Arc::new(bits));
        element.set_done();
        tracing::debug!(
            engine = self.engine_index,
            active = count,
            shutdown,
            "active tile list received"
        );
        Ok((count, shutdown))
    }

    fn reader_engine(&self) -> ReaderEngine {
        let grid = self.grid;
        let engine_index = self.engine_index;
        ReaderEngine {
            ring: self.local_tiles_ring.clone(),
            table: Arc::clone(&self.offset_table),
            file: Arc::clone(&self.edge_file),
            progress: Arc::clone(&self.reader_progress),
            // Tile batches are single tiles; selective scheduling skips at
            // tile granularity.
            batch_size: 1,
            count_tiles_local: self.tiles_local(),
            global_id_of: Box::new(move |local| grid.global_tile_id(engine_index, local)),
        }
    }

    /// Consumes the initial active-tile set, launches the readers (joining
    /// them first in in-memory mode) and the processor groups.
    pub fn start<A: VertexProgram>(
        self: &Arc<Self>,
        algorithm: &Arc<A>,
    ) -> Vec<JoinHandle<()>> {
        if self.config.use_selective_scheduling {
            self.update_active_tiles()
                .unwrap_or_else(|error| fatal(error));
        }

        let mut handles = Vec::new();
        let mut reader_handles = Vec::new();
        for reader_id in 0..self.config.count_tile_readers {
            let engine = Arc::clone(self);
            let reader = self.reader_engine();
            let handle = std::thread::Builder::new()
                .name(format!("tile_reader_{}_{}", self.engine_index, reader_id))
                .spawn(move || run_tile_reader(engine, reader, reader_id))
                .expect("spawn tile reader thread");
            reader_handles.push(handle);
        }

        if self.config.in_memory_mode {
            // Everything must be resident before processing starts.
            for handle in reader_handles.drain(..) {
                handle.join().expect("join tile reader thread");
            }
            tracing::info!(engine = self.engine_index, "done reading, tiles resident");
        } else {
            handles.extend(reader_handles);
        }

        for processor_id in 0..self.config.count_tile_processors {
            let engine = Arc::clone(self);
            let leader_algorithm = Arc::clone(algorithm);
            let group = ProcessorGroup::launch(
                Arc::clone(self),
                Arc::clone(algorithm),
                processor_id,
                &mut handles,
            );
            let handle = std::thread::Builder::new()
                .name(format!("tile_proc_{}_{}", self.engine_index, processor_id))
                .spawn(move || run_tile_processor(engine, leader_algorithm, group, processor_id))
                .expect("spawn tile processor thread");
            handles.push(handle);
        }
        handles
    }
}

fn run_tile_reader(engine: Arc<EdgeEngine>, reader: ReaderEngine, worker: usize) {
    let config = &engine.config;
    let selective = config.use_selective_scheduling;
    let mut prev_iter = 0u64;
    let mut count_active = 0u64;
    let mut count_inactive = 0u64;
    let mut active_snapshot = engine.tile_active.load_full();
    let mut exit = false;

    loop {
        let (iteration, start_tile) = reader.grab_a_tile();

        if selective {
            // One barrier generation per iteration boundary; a reader whose
            // batch counter jumped several iterations catches up one round
            // at a time so every reader consumes every bitmap exactly once.
            while prev_iter < iteration {
                tracing::info!(
                    engine = engine.engine_index,
                    round = prev_iter,
                    active = count_active,
                    inactive = count_inactive,
                    "tile reader done with round"
                );
                engine.perf.update_tile_stat(count_active, count_inactive);
                count_active = 0;
                count_inactive = 0;

                let arrival = engine.reader_barrier.wait();
                if arrival.is_leader() {
                    let (count, shutdown) = engine
                        .update_active_tiles()
                        .unwrap_or_else(|error| fatal(error));
                    if shutdown || count == 0 {
                        engine.raise_shutdown();
                    }
                    engine.perf.reset_tile_stat();
                }
                engine.reader_barrier.wait();
                prev_iter += 1;
                if engine.is_shutdown() {
                    exit = true;
                    break;
                }
            }
            if exit {
                break;
            }
            // Pin the bitmap version matching this reader's iteration; the
            // shared slot may advance while this round's tiles drain.
            active_snapshot = engine.tile_active.load_full();
        }

        if config.in_memory_mode && iteration > 0 {
            tracing::info!(engine = engine.engine_index, worker, "tile reader finished resident pass");
            break;
        }
        if iteration >= config.max_iterations {
            break;
        }

        if selective && !active_snapshot[start_tile as usize] {
            count_inactive += 1;
            continue;
        }
        count_active += 1;

        let end_tile = (start_tile + reader.batch_size).min(reader.count_tiles_local);
        let mut batch_edges = 0u64;
        for tile in start_tile..end_tile {
            let stats = engine.tile_stats[tile as usize];
            if stats.count_edges as u64 > MAX_EDGES_PER_TILE {
                fatal(EngineError::Overflow {
                    tile_id: engine.grid.global_tile_id(engine.engine_index, tile),
                    count_edges: stats.count_edges as u64,
                });
            }
            batch_edges += stats.count_edges as u64;
        }

        let consumers = if config.in_memory_mode { RETAINED } else { 1 };
        let started = std::time::Instant::now();
        let bytes = reader
            .read_a_batch_of_tiles(start_tile, end_tile, consumers)
            .unwrap_or_else(|error| fatal(error));
        engine
            .perf
            .add_batch(bytes, batch_edges, end_tile - start_tile);
        engine.sink.record(crate::events::PerfEvent {
            component: crate::events::ComponentKind::TileReader,
            engine: engine.engine_index,
            worker,
            block_id: engine.grid.global_tile_id(engine.engine_index, start_tile),
            nanos: started.elapsed().as_nanos() as u64,
            label: "tile",
        });
    }
    tracing::info!(
        engine = engine.engine_index,
        worker,
        bytes_read = engine.perf.bytes_read.load(Ordering::Relaxed),
        edges_read = engine.perf.edges_read.load(Ordering::Relaxed),
        tiles_read = engine.perf.tiles_read.load(Ordering::Relaxed),
        "shutdown tile reader"
    );
}
