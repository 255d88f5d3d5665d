//! Index readers: stream the per-engine index file (local-to-global id
//! maps) into the part's index ring, publishing tiles through the index
//! offset table for the vertex fetchers and vertex reducers.

use std::sync::Arc;

use algorithms::VertexProgram;

use crate::fatal;
use crate::reader::ReaderEngine;
use crate::tables::RETAINED;
use crate::vertex::{VertexDomain, VertexPart};

pub(crate) fn run_index_reader<A: VertexProgram>(
    domain: Arc<VertexDomain<A>>,
    part: Arc<VertexPart>,
    worker: usize,
) {
    domain.memory_init_barrier.wait();

    let config = &domain.config;
    let selective = config.use_selective_scheduling;
    let grid = domain.grid;
    let engine_index = part.engine_index;
    let reader = ReaderEngine {
        ring: part.index_ring.clone(),
        table: Arc::clone(&part.index_table),
        file: Arc::clone(&part.index_file),
        progress: Arc::clone(&part.index_reader_progress),
        // Selective scheduling needs tile-granular skipping; otherwise a
        // batch amortizes the read syscall over sixteen tiles.
        batch_size: if selective { 1 } else { 16 },
        count_tiles_local: grid.tiles_in_engine(engine_index),
        global_id_of: Box::new(move |local| grid.global_tile_id(engine_index, local)),
    };
    // Every published tile is read by one fetcher and one vertex reducer.
    let consumers = if config.in_memory_mode { RETAINED } else { 2 };

    let mut prev_iter = 0u64;
    let mut active_snapshot = part.tile_active_current.load_full();
    let mut exit = false;

    loop {
        let (iteration, start_tile) = reader.grab_a_tile();

        while prev_iter < iteration {
            if selective {
                // Wait for the apply phase so the next round's active set
                // is in place before deciding what to read.
                domain.end_apply_barrier.wait();
            }
            prev_iter += 1;
            if selective {
                // Pin the bitmap matching this reader's round: skipped
                // tiles let the world advance while this thread lags, and
                // a newer bitmap would publish tiles nobody consumes.
                active_snapshot = part.tile_active_current.load_full();
            }
            if selective && domain.is_shutdown() {
                exit = true;
                break;
            }
            if prev_iter >= config.max_iterations {
                exit = true;
                break;
            }
            if config.in_memory_mode {
                tracing::info!(engine = engine_index, worker, "index reader resident pass done");
                exit = true;
                break;
            }
        }
        if exit {
            break;
        }
        if iteration >= config.max_iterations {
            break;
        }
        if selective && !active_snapshot[start_tile as usize] {
            continue;
        }

        let end_tile = (start_tile + reader.batch_size).min(reader.count_tiles_local);
        reader
            .read_a_batch_of_tiles(start_tile, end_tile, consumers)
            .unwrap_or_else(|error| fatal(error));
    }
    tracing::info!(engine = engine_index, worker, "exit index reader");
}
