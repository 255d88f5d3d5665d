//! Vertex fetchers: join a tile's source-id index against the global
//! vertex array and ship the packed source-vertex block to the edge
//! engine. For tiles skipped by selective scheduling the fetcher posts
//! dummy completions straight to every global reducer so the per-round
//! accounting stays exact. Global fetchers service indirect lookups when a
//! fetcher cannot touch the array directly.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Instant;

use model::{VertexDegree, VertexId};
use protocol::{
    EdgeBlockIndex, REDUCE_CONTROL_BLOCK_BYTES, TILES_SHUTDOWN_BLOCK_BYTES, TilesBlockLayout,
    TilesBlockShape, encode_reduce_dummy_block, encode_tiles_shutdown_block, resolve_id,
};
use ringbuf::Mode;

use algorithms::{AlgorithmFlags, VertexProgram};

use crate::EngineError;
use crate::config::{GlobalFetcherMode, LocalFetcherMode};
use crate::events::{ComponentKind, PerfEvent};
use crate::fatal;
use crate::vertex::{FetchRequest, FetchResponse, VertexDomain, VertexPart};

pub(crate) fn run_vertex_fetcher<A: VertexProgram>(
    domain: Arc<VertexDomain<A>>,
    part: Arc<VertexPart>,
    worker: usize,
) {
    domain.memory_init_barrier.wait();

    let config = &domain.config;
    let flags = A::FLAGS;
    let grid = domain.grid;
    let selective = config.use_selective_scheduling;
    let mode = config.local_fetcher_mode;
    let fetcher_slot = part.engine_index * config.count_vertex_fetchers + worker;
    let tiles_local = grid.tiles_in_engine(part.engine_index);
    let extended = !config.is_index_32_bits;

    let shape = TilesBlockShape {
        active_src: flags.contains(AlgorithmFlags::NEED_ACTIVE_SOURCE_INPUT)
            && mode != LocalFetcherMode::Fake,
        src_degrees: flags.contains(AlgorithmFlags::NEED_DEGREES_SOURCE_BLOCK)
            && mode != LocalFetcherMode::Fake,
        tgt_degrees: flags.contains(AlgorithmFlags::NEED_DEGREES_TARGET_BLOCK)
            && mode != LocalFetcherMode::Fake,
        extension_bytes: 0,
    };

    let mut prev_iter = 0u64;
    let mut exit = false;

    loop {
        let counter = part.fetcher_progress.fetch_add(1, Ordering::Relaxed);
        let iteration = counter / tiles_local;
        let local_tile = counter % tiles_local;

        while prev_iter < iteration {
            domain.end_apply_barrier.wait();
            prev_iter += 1;
            if domain.is_shutdown() {
                exit = true;
                break;
            }
        }
        if exit {
            if worker == 0 {
                // One shutdown block per tile processor of this engine.
                for _ in 0..config.count_tile_processors {
                    let mut guard = part
                        .tiles_data_ring
                        .put(TILES_SHUTDOWN_BLOCK_BYTES, Mode::Blocking)
                        .unwrap_or_else(|error| fatal(EngineError::Ring(error)));
                    encode_tiles_shutdown_block(&mut guard);
                    guard.set_ready();
                }
            }
            break;
        }

        let global_id = grid.global_tile_id(part.engine_index, local_tile);

        if selective {
            let active = part.tile_active_current.load();
            if !active[local_tile as usize] {
                // The reducers still expect one completion per tile.
                for ring in &domain.reducer_rings {
                    let mut guard = ring
                        .put(REDUCE_CONTROL_BLOCK_BYTES, Mode::Blocking)
                        .unwrap_or_else(|error| fatal(EngineError::Ring(error)));
                    encode_reduce_dummy_block(&mut guard, global_id);
                    guard.set_ready();
                }
                continue;
            }
        }

        let started = Instant::now();
        part.index_table.wait_ready(local_tile as usize);
        let index_ref = part.index_table.get(local_tile as usize);
        let index = EdgeBlockIndex::parse(index_ref.bytes(), extended)
            .unwrap_or_else(|error| fatal(EngineError::TileCorruption(error)));
        let src_index = index
            .src_index()
            .unwrap_or_else(|error| fatal(EngineError::TileCorruption(error)));
        let src_ext = index
            .src_ext_bits()
            .unwrap_or_else(|error| fatal(EngineError::TileCorruption(error)));
        let count_src = index.header.count_src_vertices;
        let count_tgt = index.header.count_tgt_vertices;

        let src_globals: Vec<VertexId> = (0..count_src as usize)
            .map(|i| resolve_id(src_index, src_ext, i))
            .collect();

        let count_src_block = if mode == LocalFetcherMode::Fake {
            0
        } else {
            count_src
        };
        let layout = TilesBlockLayout::compute(
            shape,
            count_src_block,
            count_tgt,
            std::mem::size_of::<A::Value>(),
        );
        let sample = global_id % 100 == 0;
        let header = layout.header(global_id, sample);

        let mut guard = part
            .tiles_data_ring
            .put(layout.total_bytes, Mode::Blocking)
            .unwrap_or_else(|error| fatal(EngineError::Ring(error)));
        guard.write_at(0, bytemuck::bytes_of(&header));

        if shape.active_src {
            let active_current = domain.vertices.active_current();
            let offset = layout.offset_active_src;
            for (i, &vertex) in src_globals.iter().enumerate() {
                if active_current.get(vertex as usize) {
                    guard[offset + i / 8] |= 1 << (i % 8);
                }
            }
        }
        if shape.src_degrees {
            let degrees: Vec<VertexDegree> = src_globals
                .iter()
                .map(|&vertex| domain.vertices.degree(vertex))
                .collect();
            guard.write_at(layout.offset_src_degrees, bytemuck::cast_slice(&degrees));
        }
        if shape.tgt_degrees {
            let tgt_index = index
                .tgt_index()
                .unwrap_or_else(|error| fatal(EngineError::TileCorruption(error)));
            let tgt_ext = index
                .tgt_ext_bits()
                .unwrap_or_else(|error| fatal(EngineError::TileCorruption(error)));
            let degrees: Vec<VertexDegree> = (0..count_tgt as usize)
                .map(|i| domain.vertices.degree(resolve_id(tgt_index, tgt_ext, i)))
                .collect();
            guard.write_at(layout.offset_tgt_degrees, bytemuck::cast_slice(&degrees));
        }

        match mode {
            LocalFetcherMode::DirectAccess => {
                let values: Vec<A::Value> = src_globals
                    .iter()
                    .map(|&vertex| domain.vertices.current_get(vertex))
                    .collect();
                guard.write_at(layout.offset_source_vertices, bytemuck::cast_slice(&values));
            }
            LocalFetcherMode::ConstantValue => {
                let values = vec![domain.algorithm.gather_identity(); count_src as usize];
                guard.write_at(layout.offset_source_vertices, bytemuck::cast_slice(&values));
            }
            LocalFetcherMode::GlobalFetcher => {
                domain
                    .fetch_tx
                    .send(FetchRequest::Fetch {
                        block_id: global_id,
                        fetcher_slot,
                        vertex_ids: src_globals.clone(),
                    })
                    .expect("global fetcher request channel closed");
                let response = domain.fetch_responses[fetcher_slot]
                    .1
                    .recv()
                    .expect("global fetcher response channel closed");
                debug_assert_eq!(response.block_id, global_id);
                guard.write_at(
                    layout.offset_source_vertices,
                    bytemuck::cast_slice(&response.values),
                );
            }
            LocalFetcherMode::Fake => {}
        }
        guard.set_ready();
        part.index_table.release(local_tile as usize);

        domain.sink.record(PerfEvent {
            component: ComponentKind::VertexFetcher,
            engine: part.engine_index,
            worker,
            block_id: global_id,
            nanos: started.elapsed().as_nanos() as u64,
            label: "fetch",
        });
    }
    tracing::info!(engine = part.engine_index, worker, "shutdown vertex fetcher");
}

/// Services random-access reads of the global array on behalf of fetchers
/// that cannot touch it directly.
pub(crate) fn run_global_fetcher<A: VertexProgram>(domain: Arc<VertexDomain<A>>, worker: usize) {
    domain.memory_init_barrier.wait();

    loop {
        match domain.fetch_rx.recv() {
            Ok(FetchRequest::Fetch {
                block_id,
                fetcher_slot,
                vertex_ids,
            }) => {
                let values: Vec<A::Value> = match domain.config.global_fetcher_mode {
                    GlobalFetcherMode::Active => vertex_ids
                        .iter()
                        .map(|&vertex| domain.vertices.current_get(vertex))
                        .collect(),
                    GlobalFetcherMode::ConstantValue => {
                        vec![domain.algorithm.gather_identity(); vertex_ids.len()]
                    }
                };
                domain.fetch_responses[fetcher_slot]
                    .0
                    .send(FetchResponse { block_id, values })
                    .expect("fetch response receiver dropped");
            }
            Ok(FetchRequest::Shutdown) | Err(_) => break,
        }
    }
    tracing::info!(worker, "shutdown global fetcher");
}
