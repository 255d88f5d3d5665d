//! Tile processor groups: one leader plus `F` followers.
//!
//! The leader takes a source-vertex block from the tiles-data ring, pairs it
//! with the tile's edge data from the offset table, splits the edge range
//! into partitions sized by the adaptive break point, and sweeps the
//! partitions with its followers in lockstep barrier rounds. Every thread
//! gathers into a private accumulator; the leader folds them with the
//! algorithm's reduce and publishes one response per tile.
//!
//! Work descriptors travel to followers over single-producer rings; the
//! group barrier is what sequences a round, the rings only carry data.

use std::sync::{Arc, Barrier};
use std::thread::JoinHandle;
use std::time::Instant;

use model::{EDGES_STRIPE_SIZE, TileStats, VertexCount, VertexDegree, bitset_len_bytes};
use protocol::{
    PROCESSED_SHUTDOWN_BLOCK_BYTES, ProcessedBlockLayout, RleCursor, VertexEdgeTilesBlock,
    encode_processed_shutdown_block,
};
use ringbuf::{Element, Mode};

use algorithms::{AlgorithmFlags, GatherContext, VertexProgram};

use crate::config::TileProcessorMode;
use crate::edge::EdgeEngine;
use crate::events::{ComponentKind, PerfEvent};
use crate::tables::{Backoff, TileBundleRef};
use crate::{EngineError, fatal};

/// Per-thread gather accumulator, recycled across tiles.
pub(crate) struct TileScratch<V> {
    pub targets: Vec<V>,
    pub active_src: Vec<u8>,
    pub active_tgt: Vec<u8>,
    pub edges_seen: u32,
}

impl<V> Default for TileScratch<V> {
    fn default() -> Self {
        Self {
            targets: Vec::new(),
            active_src: Vec::new(),
            active_tgt: Vec::new(),
            edges_seen: 0,
        }
    }
}

impl<V: bytemuck::Pod> TileScratch<V> {
    fn prepare<A: VertexProgram<Value = V>>(
        &mut self,
        algorithm: &A,
        stats: &TileStats,
        flags: AlgorithmFlags,
    ) {
        self.targets.resize(stats.count_vertex_tgt as usize, V::zeroed());
        algorithm.reset_tile_targets(&mut self.targets);
        let src_bytes = if flags.contains(AlgorithmFlags::NEED_ACTIVE_SOURCE_BLOCK) {
            bitset_len_bytes(stats.count_vertex_src as usize)
        } else {
            0
        };
        let tgt_bytes = if flags.contains(AlgorithmFlags::NEED_ACTIVE_TARGET_BLOCK) {
            bitset_len_bytes(stats.count_vertex_tgt as usize)
        } else {
            0
        };
        self.active_src.clear();
        self.active_src.resize(src_bytes, 0);
        self.active_tgt.clear();
        self.active_tgt.resize(tgt_bytes, 0);
        self.edges_seen = 0;
    }
}

/// One tile of work for a follower.
pub(crate) struct FollowerWork<V> {
    shutdown: bool,
    edge: Option<TileBundleRef>,
    source: Option<Arc<Element>>,
    stats: TileStats,
    partitions: u32,
    gather_active: bool,
    scratch: TileScratch<V>,
}

pub(crate) struct ProcessorGroup<V> {
    pub barrier: Arc<Barrier>,
    work_txs: Vec<rtrb::Producer<FollowerWork<V>>>,
    result_rxs: Vec<rtrb::Consumer<TileScratch<V>>>,
}

impl<V: bytemuck::Pod + Send + 'static> ProcessorGroup<V> {
    /// Spawns the follower threads for one processor group and returns the
    /// leader's handles to them.
    pub fn launch<A>(
        engine: Arc<EdgeEngine>,
        algorithm: Arc<A>,
        processor_id: usize,
        handles: &mut Vec<JoinHandle<()>>,
    ) -> Self
    where
        A: VertexProgram<Value = V>,
    {
        let count_followers = engine.config.count_followers;
        let barrier = Arc::new(Barrier::new(1 + count_followers));
        let mut work_txs = Vec::with_capacity(count_followers);
        let mut result_rxs = Vec::with_capacity(count_followers);

        for follower_id in 0..count_followers {
            let (work_tx, work_rx) = rtrb::RingBuffer::new(2);
            let (result_tx, result_rx) = rtrb::RingBuffer::new(2);
            work_txs.push(work_tx);
            result_rxs.push(result_rx);

            let barrier = Arc::clone(&barrier);
            let algorithm = Arc::clone(&algorithm);
            let engine = Arc::clone(&engine);
            let handle = std::thread::Builder::new()
                .name(format!(
                    "tile_follower_{}_{}_{}",
                    engine.engine_index, processor_id, follower_id
                ))
                .spawn(move || {
                    run_follower(
                        engine,
                        algorithm,
                        barrier,
                        work_rx,
                        result_tx,
                        follower_id,
                        processor_id,
                    )
                })
                .expect("spawn tile follower thread");
            handles.push(handle);
        }

        Self {
            barrier,
            work_txs,
            result_rxs,
        }
    }
}

fn pop_spin<T>(consumer: &mut rtrb::Consumer<T>) -> T {
    let mut backoff = Backoff::new();
    loop {
        match consumer.pop() {
            Ok(value) => return value,
            Err(rtrb::PopError::Empty) => backoff.wait(),
        }
    }
}

/// Parsed per-tile inputs shared by leader and followers.
struct TileView<'a, V> {
    src: &'a [u16],
    tgt_list: Option<&'a [u16]>,
    tgt_rle: Option<&'a [VertexCount]>,
    weights: Option<&'a [f32]>,
    source_vertices: &'a [V],
    active_src_in: Option<&'a [u8]>,
    src_degrees: Option<&'a [VertexDegree]>,
    tgt_degrees: Option<&'a [VertexDegree]>,
    extensions: &'a [u8],
}

fn parse_tile<'a, V: bytemuck::Pod>(
    edge_bytes: &'a [u8],
    source_block: &VertexEdgeTilesBlock<'a>,
    stats: &TileStats,
    weighted: bool,
    flags: AlgorithmFlags,
) -> Result<TileView<'a, V>, EngineError> {
    let edge = protocol::EdgeBlock::parse(edge_bytes, *stats, weighted)?;
    let (tgt_list, tgt_rle) = if stats.rle() {
        (None, Some(edge.tgt_rle()?))
    } else {
        (Some(edge.tgt_list()?), None)
    };
    Ok(TileView {
        src: edge.src()?,
        tgt_list,
        tgt_rle,
        weights: edge.weights()?,
        source_vertices: source_block.source_vertices::<V>()?,
        active_src_in: source_block.active_src_bits()?,
        src_degrees: source_block
            .src_degrees(flags.contains(AlgorithmFlags::NEED_DEGREES_SOURCE_BLOCK))?,
        tgt_degrees: source_block
            .tgt_degrees(flags.contains(AlgorithmFlags::NEED_DEGREES_TARGET_BLOCK))?,
        extensions: &[],
    })
}

fn partition_range(count_edges: u32, partitions: u32, partition: u32) -> (u32, u32) {
    let per_partition = count_edges / partitions;
    let start = partition * per_partition;
    let end = if partition + 1 == partitions {
        count_edges
    } else {
        start + per_partition
    };
    (start, end)
}

fn bit_is_set(bits: &[u8], index: usize) -> bool {
    bits[index / 8] & (1 << (index % 8)) != 0
}

/// The striped edge loop shared by leader (`thread_slot` 0) and followers
/// (`thread_slot` 1 + follower id). Returns the edge positions this thread
/// visited, including edges skipped for inactive sources.
fn process_edges_range<A: VertexProgram>(
    algorithm: &A,
    view: &TileView<'_, A::Value>,
    scratch: &mut TileScratch<A::Value>,
    thread_slot: u32,
    thread_count: u32,
    start: u32,
    end: u32,
    flags: AlgorithmFlags,
) -> u32 {
    let TileScratch {
        targets,
        active_src,
        active_tgt,
        ..
    } = scratch;
    let need_active_input = flags.contains(AlgorithmFlags::NEED_ACTIVE_SOURCE_INPUT);
    let stride = thread_count * EDGES_STRIPE_SIZE;
    let mut visited = 0u32;

    let mut gather = |src_id: u16, tgt_id: u16, weight: Option<f32>, targets: &mut [A::Value]| {
        let src = &view.source_vertices[src_id as usize];
        let tgt = &mut targets[tgt_id as usize];
        let mut ctx = GatherContext {
            src_id,
            tgt_id,
            src_degree: view.src_degrees.map(|degrees| &degrees[src_id as usize]),
            tgt_degree: view.tgt_degrees.map(|degrees| &degrees[tgt_id as usize]),
            active_src_next: (!active_src.is_empty()).then_some(active_src.as_mut_slice()),
            active_tgt_next: (!active_tgt.is_empty()).then_some(active_tgt.as_mut_slice()),
            extensions: view.extensions,
        };
        match weight {
            Some(weight) => algorithm.pull_gather_weighted(src, tgt, weight, &mut ctx),
            None => algorithm.pull_gather(src, tgt, &mut ctx),
        }
    };

    if let Some(runs) = view.tgt_rle {
        let mut start_index = start + thread_slot * EDGES_STRIPE_SIZE;
        let mut cursor = RleCursor::at(runs, start_index);
        let skip = stride - EDGES_STRIPE_SIZE;
        while start_index < end {
            let end_index = (start_index + EDGES_STRIPE_SIZE).min(end);
            for i in start_index..end_index {
                visited += 1;
                let src_id = view.src[i as usize];
                if need_active_input
                    && view
                        .active_src_in
                        .is_some_and(|bits| !bit_is_set(bits, src_id as usize))
                {
                    // Keep the tgt stream in lockstep even for skipped edges.
                    cursor.advance_one();
                    continue;
                }
                let tgt_id = cursor.current_id();
                let weight = view.weights.map(|weights| weights[i as usize]);
                gather(src_id, tgt_id, weight, targets);
                cursor.advance_one();
            }
            start_index += stride;
            cursor.advance(skip);
        }
    } else {
        let tgt_list = view.tgt_list.expect("plain target stream");
        let mut start_index = start + thread_slot * EDGES_STRIPE_SIZE;
        while start_index < end {
            let end_index = (start_index + EDGES_STRIPE_SIZE).min(end);
            for i in start_index..end_index {
                visited += 1;
                let src_id = view.src[i as usize];
                if need_active_input
                    && view
                        .active_src_in
                        .is_some_and(|bits| !bit_is_set(bits, src_id as usize))
                {
                    continue;
                }
                let tgt_id = tgt_list[i as usize];
                let weight = view.weights.map(|weights| weights[i as usize]);
                gather(src_id, tgt_id, weight, targets);
            }
            start_index += stride;
        }
    }
    visited
}

fn run_follower<A: VertexProgram>(
    engine: Arc<EdgeEngine>,
    algorithm: Arc<A>,
    barrier: Arc<Barrier>,
    mut work_rx: rtrb::Consumer<FollowerWork<A::Value>>,
    mut result_tx: rtrb::Producer<TileScratch<A::Value>>,
    follower_id: usize,
    processor_id: usize,
) {
    let flags = A::FLAGS;
    let weighted = engine.config.is_weighted_graph;
    let thread_count = 1 + engine.config.count_followers as u32;
    let thread_slot = 1 + follower_id as u32;

    loop {
        // Wait for the leader to summon this follower.
        barrier.wait();
        let mut work = pop_spin(&mut work_rx);
        if work.shutdown {
            break;
        }

        work.scratch.prepare(&*algorithm, &work.stats, flags);
        let source = work.source.take().expect("follower work without source block");
        let edge = work.edge.take().expect("follower work without edge data");
        let source_block = VertexEdgeTilesBlock::parse(&source)
            .unwrap_or_else(|error| fatal(EngineError::TileCorruption(error)));
        let view = parse_tile::<A::Value>(edge.bytes(), &source_block, &work.stats, weighted, flags)
            .unwrap_or_else(|error| fatal(error));

        for partition in 0..work.partitions {
            let (start, end) = partition_range(work.stats.count_edges, work.partitions, partition);
            if work.gather_active {
                let visited = process_edges_range(
                    &*algorithm,
                    &view,
                    &mut work.scratch,
                    thread_slot,
                    thread_count,
                    start,
                    end,
                    flags,
                );
                work.scratch.edges_seen += visited;
            }
            barrier.wait();
        }

        drop(view);
        drop(source_block);
        drop(source);
        drop(edge);
        if result_tx.push(work.scratch).is_err() {
            unreachable!("follower result ring overflow");
        }
        // Arrival tells the leader its followers are finished.
        barrier.wait();
    }
    tracing::info!(
        engine = engine.engine_index,
        processor = processor_id,
        follower = follower_id,
        "shutdown tile processor follower"
    );
}

pub(crate) fn run_tile_processor<A: VertexProgram>(
    engine: Arc<EdgeEngine>,
    algorithm: Arc<A>,
    mut group: ProcessorGroup<A::Value>,
    processor_id: usize,
) {
    let flags = A::FLAGS;
    let config = &engine.config;
    let weighted = config.is_weighted_graph;
    let thread_count = 1 + config.count_followers as u32;
    let gather_active = config.tile_processor_mode == TileProcessorMode::Active;
    let mut scratch_pool: Vec<TileScratch<A::Value>> = Vec::new();
    let mut leader_scratch = TileScratch::default();

    loop {
        let element = engine
            .tiles_data_ring
            .get(Mode::Blocking)
            .unwrap_or_else(|error| fatal(EngineError::Ring(error)));
        let header = match VertexEdgeTilesBlock::parse(&element) {
            Ok(block) => block.header,
            Err(error) => fatal(EngineError::TileCorruption(error)),
        };

        if header.shutdown != 0 {
            element.set_done();
            let arrival = engine.processor_barrier.wait();
            if arrival.is_leader() {
                // The last leader to shut down releases the vertex reducers.
                for _ in 0..config.count_vertex_reducers {
                    let mut guard = engine
                        .processed_ring
                        .put(PROCESSED_SHUTDOWN_BLOCK_BYTES, Mode::Blocking)
                        .unwrap_or_else(|error| fatal(EngineError::Ring(error)));
                    encode_processed_shutdown_block(&mut guard);
                    guard.set_ready();
                }
            }
            for work_tx in &mut group.work_txs {
                let work = FollowerWork {
                    shutdown: true,
                    edge: None,
                    source: None,
                    stats: TileStats::default(),
                    partitions: 0,
                    gather_active: false,
                    scratch: TileScratch::default(),
                };
                if work_tx.push(work).is_err() {
                    unreachable!("follower work ring overflow");
                }
            }
            group.barrier.wait();
            break;
        }

        let block_id = header.block_id;
        let local_tile = engine.grid.local_tile_id(block_id) as usize;
        let stats = engine.tile_stats[local_tile];
        engine.offset_table.wait_ready(local_tile);
        let edge_ref = engine.offset_table.get(local_tile);
        debug_assert_eq!(edge_ref.global_tile_id, block_id);

        let partitions = engine.break_point.partition_count(stats.count_edges);
        let sample = header.sample_execution_time != 0;
        let started = Instant::now();
        let source = Arc::new(element);

        // Hand each follower its work, then open the tile.
        for work_tx in &mut group.work_txs {
            let work = FollowerWork {
                shutdown: false,
                edge: Some(edge_ref.clone()),
                source: Some(Arc::clone(&source)),
                stats,
                partitions,
                gather_active: gather_active && stats.count_edges > 0,
                scratch: scratch_pool.pop().unwrap_or_default(),
            };
            if work_tx.push(work).is_err() {
                unreachable!("follower work ring overflow");
            }
        }
        group.barrier.wait();

        leader_scratch.prepare(&*algorithm, &stats, flags);
        if gather_active && stats.count_edges > 0 {
            let source_block = VertexEdgeTilesBlock::parse(&source)
                .unwrap_or_else(|error| fatal(EngineError::TileCorruption(error)));
            let view =
                parse_tile::<A::Value>(edge_ref.bytes(), &source_block, &stats, weighted, flags)
                    .unwrap_or_else(|error| fatal(error));
            for partition in 0..partitions {
                let (start, end) = partition_range(stats.count_edges, partitions, partition);
                let visited = process_edges_range(
                    &*algorithm,
                    &view,
                    &mut leader_scratch,
                    0,
                    thread_count,
                    start,
                    end,
                    flags,
                );
                leader_scratch.edges_seen += visited;
                group.barrier.wait();
            }
        } else {
            // A tile with no edges (or a noop processor) still has to keep
            // the partition rounds in lockstep with its followers.
            for _ in 0..partitions {
                group.barrier.wait();
            }
        }
        group.barrier.wait();

        // Fold follower accumulators into the leader's.
        let mut total_edges = leader_scratch.edges_seen;
        for result_rx in &mut group.result_rxs {
            let follower_scratch = pop_spin(result_rx);
            total_edges += follower_scratch.edges_seen;
            for (index, incoming) in follower_scratch.targets.iter().enumerate() {
                algorithm.reduce_vertex(
                    &mut leader_scratch.targets[index],
                    incoming,
                    index as u64,
                    VertexDegree::default(),
                );
            }
            for (byte, incoming) in leader_scratch
                .active_src
                .iter_mut()
                .zip(&follower_scratch.active_src)
            {
                *byte |= incoming;
            }
            for (byte, incoming) in leader_scratch
                .active_tgt
                .iter_mut()
                .zip(&follower_scratch.active_tgt)
            {
                *byte |= incoming;
            }
            scratch_pool.push(follower_scratch);
        }
        if gather_active {
            debug_assert_eq!(total_edges, stats.count_edges);
        }

        // Publish the merged response.
        let count_active_src = if flags.contains(AlgorithmFlags::NEED_ACTIVE_SOURCE_BLOCK) {
            stats.count_vertex_src
        } else {
            0
        };
        let count_active_tgt = if flags.contains(AlgorithmFlags::NEED_ACTIVE_TARGET_BLOCK) {
            stats.count_vertex_tgt
        } else {
            0
        };
        let layout = ProcessedBlockLayout::compute(
            count_active_src,
            count_active_tgt,
            stats.count_vertex_tgt,
            std::mem::size_of::<A::Value>(),
        );
        let mut response = layout.header(block_id);
        if sample {
            response.sample_execution_time = 1;
            response.count_edges = stats.count_edges;
            response.processing_time_nano = started.elapsed().as_nanos() as u64;
        }
        let mut guard = engine
            .processed_ring
            .put(layout.total_bytes, Mode::Blocking)
            .unwrap_or_else(|error| fatal(EngineError::Ring(error)));
        guard.write_at(0, bytemuck::bytes_of(&response));
        guard.write_at(
            layout.offset_vertices,
            bytemuck::cast_slice(&leader_scratch.targets),
        );
        if count_active_src > 0 {
            guard.write_at(layout.offset_active_src, &leader_scratch.active_src);
        }
        if count_active_tgt > 0 {
            guard.write_at(layout.offset_active_tgt, &leader_scratch.active_tgt);
        }
        guard.set_ready();

        engine.offset_table.release(local_tile);
        drop(edge_ref);
        drop(source);
        engine.sink.record(PerfEvent {
            component: ComponentKind::TileProcessor,
            engine: engine.engine_index,
            worker: processor_id,
            block_id,
            nanos: started.elapsed().as_nanos() as u64,
            label: "process_edges",
        });
    }
    tracing::info!(
        engine = engine.engine_index,
        processor = processor_id,
        "shutdown tile processor"
    );
}
