//! Vertex reducers: match tile-processor responses with the tile's index
//! block, split the target entries by owning global reducer and forward the
//! merged index blocks. Every global reducer receives a block for every
//! tile, so per-round completion counting needs no extra bookkeeping.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use model::stripe_owner;
use protocol::{
    EdgeBlockIndex, ProcessedIndexLayout, ProcessedVertexBlock, REDUCE_CONTROL_BLOCK_BYTES,
    encode_reduce_shutdown_block, resolve_id,
};
use ringbuf::Mode;
use smallvec::{SmallVec, smallvec};

use algorithms::{AlgorithmFlags, VertexProgram};

use crate::EngineError;
use crate::config::GlobalReducerMode;
use crate::fatal;
use crate::vertex::{VertexDomain, VertexPart};

fn bit_is_set(bits: &[u8], index: usize) -> bool {
    bits[index / 8] & (1 << (index % 8)) != 0
}

pub(crate) fn run_vertex_reducer<A: VertexProgram>(
    domain: Arc<VertexDomain<A>>,
    part: Arc<VertexPart>,
    worker: usize,
) {
    domain.memory_init_barrier.wait();

    let config = &domain.config;
    let flags = A::FLAGS;
    let grid = domain.grid;
    let count_reducers = config.count_global_reducers;
    let extended = !config.is_index_32_bits;
    let with_active_tgt = flags.contains(AlgorithmFlags::NEED_ACTIVE_TARGET_BLOCK);
    let with_source = flags.contains(AlgorithmFlags::NEED_ACTIVE_SOURCE_BLOCK);

    loop {
        let element = part
            .processed_ring
            .get(Mode::Blocking)
            .unwrap_or_else(|error| fatal(EngineError::Ring(error)));
        let response = ProcessedVertexBlock::parse(&element)
            .unwrap_or_else(|error| fatal(EngineError::TileCorruption(error)));

        if response.is_shutdown() {
            drop(response);
            element.set_done();
            // The last reducer of this part forwards the shutdown to every
            // global reducer.
            if part.reducers_draining.fetch_sub(1, Ordering::AcqRel) == 1 {
                for ring in &domain.reducer_rings {
                    let mut guard = ring
                        .put(REDUCE_CONTROL_BLOCK_BYTES, Mode::Blocking)
                        .unwrap_or_else(|error| fatal(EngineError::Ring(error)));
                    encode_reduce_shutdown_block(&mut guard);
                    guard.set_ready();
                }
            }
            break;
        }

        let header = response.header;
        let block_id = header.block_id;
        let local_tile = grid.local_tile_id(block_id) as usize;

        part.index_table.wait_ready(local_tile);
        let index_ref = part.index_table.get(local_tile);
        debug_assert_eq!(index_ref.global_tile_id, block_id);
        let index = EdgeBlockIndex::parse(index_ref.bytes(), extended)
            .unwrap_or_else(|error| fatal(EngineError::TileCorruption(error)));
        let tgt_index = index
            .tgt_index()
            .unwrap_or_else(|error| fatal(EngineError::TileCorruption(error)));
        let tgt_ext = index
            .tgt_ext_bits()
            .unwrap_or_else(|error| fatal(EngineError::TileCorruption(error)));
        let src_index = index
            .src_index()
            .unwrap_or_else(|error| fatal(EngineError::TileCorruption(error)));
        let src_ext = index
            .src_ext_bits()
            .unwrap_or_else(|error| fatal(EngineError::TileCorruption(error)));

        let tgt_values: &[A::Value] = response
            .tgt_vertices()
            .unwrap_or_else(|error| fatal(EngineError::TileCorruption(error)));
        let active_tgt_bits = response
            .active_tgt_bits()
            .unwrap_or_else(|error| fatal(EngineError::TileCorruption(error)));
        let active_src_bits = response
            .active_src_bits()
            .unwrap_or_else(|error| fatal(EngineError::TileCorruption(error)));

        let count_tgt = header.count_tgt_vertex_block as usize;
        debug_assert_eq!(count_tgt, tgt_index.len());
        let tgt_globals: Vec<u64> = (0..count_tgt)
            .map(|j| resolve_id(tgt_index, tgt_ext, j))
            .collect();

        // Bucket target entries by their owning reducer. In locking mode
        // the whole response routes by block id and the lock table
        // serializes the writes instead.
        let mut buckets: SmallVec<[Vec<u32>; 8]> = smallvec![Vec::new(); count_reducers];
        match config.global_reducer_mode {
            GlobalReducerMode::Striped => {
                for (j, &global) in tgt_globals.iter().enumerate() {
                    buckets[stripe_owner(global, count_reducers)].push(j as u32);
                }
            }
            GlobalReducerMode::Locking => {
                let owner = (block_id % count_reducers as u64) as usize;
                buckets[owner] = (0..count_tgt as u32).collect();
            }
        }

        let source_owner = (block_id % count_reducers as u64) as usize;
        let count_src = header.count_active_vertex_src;

        for (reducer, bucket) in buckets.iter().enumerate() {
            let carries_source = with_source && reducer == source_owner;
            let layout = ProcessedIndexLayout::compute(
                bucket.len() as u32,
                count_src,
                with_active_tgt,
                carries_source,
                std::mem::size_of::<A::Value>(),
            );
            let mut forwarded = layout.header(block_id);
            if reducer == 0 && header.sample_execution_time != 0 {
                forwarded.sample_execution_time = 1;
                forwarded.count_edges = header.count_edges;
                forwarded.processing_time_nano = header.processing_time_nano;
            }

            let mut guard = domain.reducer_rings[reducer]
                .put(layout.total_bytes, Mode::Blocking)
                .unwrap_or_else(|error| fatal(EngineError::Ring(error)));
            guard.write_at(0, bytemuck::bytes_of(&forwarded));

            let indices: Vec<u64> = bucket.iter().map(|&j| tgt_globals[j as usize]).collect();
            guard.write_at(layout.offset_tgt_indices, bytemuck::cast_slice(&indices));
            let values: Vec<A::Value> = bucket
                .iter()
                .map(|&j| tgt_values[j as usize])
                .collect();
            guard.write_at(layout.offset_tgt_values, bytemuck::cast_slice(&values));

            if with_active_tgt {
                if let Some(bits) = active_tgt_bits {
                    // Bits are re-indexed to the bucket's entry order.
                    for (position, &j) in bucket.iter().enumerate() {
                        if bit_is_set(bits, j as usize) {
                            guard[layout.offset_active_tgt + position / 8] |= 1 << (position % 8);
                        }
                    }
                }
            }

            if carries_source {
                let src_globals: Vec<u64> = (0..count_src as usize)
                    .map(|k| resolve_id(src_index, src_ext, k))
                    .collect();
                guard.write_at(layout.offset_src_indices, bytemuck::cast_slice(&src_globals));
                if let Some(bits) = active_src_bits {
                    guard.write_at(layout.offset_active_src, bits);
                }
            }
            guard.set_ready();
        }

        drop(response);
        element.set_done();
        part.index_table.release(local_tile);
    }
    tracing::info!(engine = part.engine_index, worker, "shutdown vertex reducer");
}
