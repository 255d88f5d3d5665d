//! Global reducers: shard the vertex space, fold partial target values
//! into `next[]` and maintain the active-vertex and active-tile sets.
//! Each reducer first-touches the stripes it owns, then consumes exactly
//! one block per tile per round (real, empty or dummy) before joining the
//! end-of-reduce barrier.

use std::sync::Arc;
use std::time::Instant;

use protocol::ProcessedIndexBlock;
use ringbuf::Mode;

use algorithms::VertexProgram;

use crate::EngineError;
use crate::config::GlobalReducerMode;
use crate::events::{ComponentKind, PerfEvent};
use crate::fatal;
use crate::vertex::VertexDomain;

fn bit_is_set(bits: &[u8], index: usize) -> bool {
    bits[index / 8] & (1 << (index % 8)) != 0
}

pub(crate) fn run_global_reducer<A: VertexProgram>(domain: Arc<VertexDomain<A>>, worker: usize) {
    let config = &domain.config;
    let grid = domain.grid;
    let locking = config.global_reducer_mode == GlobalReducerMode::Locking;
    let selective = config.use_selective_scheduling;

    // First-touch the owned stripes, then let the winner seed the
    // algorithm state and the initial active-tile sets.
    domain.init_reducer_memory(worker);
    if domain.reducer_init_barrier.wait().is_leader() {
        domain.init_algorithm();
        *domain.round_started.lock().unwrap() = Instant::now();
    }
    domain.memory_init_barrier.wait();

    let ring = domain.reducer_rings[worker].clone();
    let count_tiles = config.count_tiles;
    let mut shutdown = false;
    let mut round = 0u64;

    loop {
        let mut responses_received = 0u64;
        while responses_received < count_tiles {
            let element = ring
                .get(Mode::Blocking)
                .unwrap_or_else(|error| fatal(EngineError::Ring(error)));
            let block = ProcessedIndexBlock::parse(&element)
                .unwrap_or_else(|error| fatal(EngineError::TileCorruption(error)));

            if block.is_shutdown() {
                shutdown = true;
                drop(block);
                element.set_done();
                break;
            }
            responses_received += 1;
            if block.is_dummy() {
                drop(block);
                element.set_done();
                continue;
            }

            let header = block.header;
            let started = Instant::now();

            // Target pass: fold the entries this reducer owns.
            let tgt_indices = block
                .tgt_indices()
                .unwrap_or_else(|error| fatal(EngineError::TileCorruption(error)));
            let tgt_values: &[A::Value] = block
                .tgt_values()
                .unwrap_or_else(|error| fatal(EngineError::TileCorruption(error)));
            let active_tgt = block
                .active_tgt_bits()
                .unwrap_or_else(|error| fatal(EngineError::TileCorruption(error)));
            for (j, (&vertex, incoming)) in tgt_indices.iter().zip(tgt_values).enumerate() {
                debug_assert!(
                    locking || domain.stripe_owner_of(vertex) == worker,
                    "vertex {vertex} reduced outside its stripe owner"
                );
                let guard = locking.then(|| {
                    domain.lock_table[(vertex as usize) % domain.lock_table.len()]
                        .lock()
                        .unwrap()
                });
                let mut out = domain.vertices.next_get(vertex);
                domain
                    .algorithm
                    .reduce_vertex(&mut out, incoming, vertex, domain.vertices.degree(vertex));
                domain.vertices.next_set(vertex, out);
                drop(guard);
                if let Some(bits) = active_tgt {
                    if bit_is_set(bits, j) {
                        domain.vertices.active_next().set(vertex as usize);
                    }
                }
            }

            // Source pass: propagate next-round activations; a 0 -> 1
            // transition wakes every tile the vertex feeds.
            if let (Ok(Some(src_indices)), Ok(Some(active_src))) =
                (block.src_indices(), block.active_src_bits())
            {
                for (k, &vertex) in src_indices.iter().enumerate() {
                    if !bit_is_set(active_src, k) {
                        continue;
                    }
                    let was_active = domain.vertices.active_next().set(vertex as usize);
                    if !was_active && selective {
                        for &tile in domain.v2t.tiles_of(vertex) {
                            let engine = grid.engine_of_tile(tile as u64);
                            let local = grid.local_tile_id(tile as u64) as usize;
                            domain.parts[engine]
                                .tile_active_next
                                .lock()
                                .unwrap()
                                .set(local, true);
                        }
                    }
                }
            }

            if worker == 0 && header.sample_execution_time != 0 {
                domain
                    .break_point
                    .record_sample(header.count_edges, header.processing_time_nano);
            }

            domain.sink.record(PerfEvent {
                component: ComponentKind::GlobalReducer,
                engine: 0,
                worker,
                block_id: header.block_id,
                nanos: started.elapsed().as_nanos() as u64,
                label: "reduce",
            });
            drop(block);
            element.set_done();
        }

        if shutdown {
            break;
        }
        round += 1;
        tracing::debug!(worker, round, "global reducer done with round");
        domain.end_reduce_barrier.wait();
    }
    tracing::info!(worker, "shutdown global reducer");
}
