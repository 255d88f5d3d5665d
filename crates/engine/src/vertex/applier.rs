//! Vertex appliers: finalize every vertex at iteration end and seed the
//! next round's active tiles. The appliers split the vertex space into
//! contiguous ranges; the one that wins the local-apply barrier runs the
//! round reset while everyone else is parked.

use std::sync::Arc;
use std::time::Instant;

use bitvec::order::Lsb0;
use bitvec::vec::BitVec;

use algorithms::VertexProgram;

use crate::events::{ComponentKind, PerfEvent};
use crate::vertex::VertexDomain;

pub(crate) fn run_vertex_applier<A: VertexProgram>(domain: Arc<VertexDomain<A>>, worker: usize) {
    let config = &domain.config;
    let grid = domain.grid;
    let selective = config.use_selective_scheduling;
    let count = domain.count_vertices();
    let share = count.div_ceil(config.count_vertex_appliers as u64);
    let start = worker as u64 * share;
    let end = (start + share).min(count);
    let identity = domain.algorithm.gather_identity();

    let mut local_active_tiles: BitVec<u8, Lsb0> =
        BitVec::repeat(false, config.count_tiles as usize);

    loop {
        // Wait for every tile of the round to be reduced.
        domain.end_reduce_barrier.wait();
        let iteration = domain.iteration.load(std::sync::atomic::Ordering::Acquire);
        let started = Instant::now();
        local_active_tiles.fill(false);

        for vertex in start..end {
            let current = domain.vertices.current_get(vertex);
            let mut reduced = domain.vertices.next_get(vertex);
            let outcome = domain.algorithm.apply(
                &current,
                &mut reduced,
                vertex,
                domain.vertices.degree(vertex),
                iteration,
            );
            domain.vertices.next_set(vertex, reduced);
            // Pre-reset the buffer that becomes the next accumulator.
            domain.vertices.current_set(vertex, identity);

            if outcome.changed {
                domain.vertices.changed().set(vertex as usize);
            }
            if outcome.activate {
                domain.vertices.active_next().set(vertex as usize);
            }
            if selective && domain.vertices.active_next().get(vertex as usize) {
                for &tile in domain.v2t.tiles_of(vertex) {
                    local_active_tiles.set(tile as usize, true);
                }
            }
        }

        if selective {
            // Merge the private set into the per-engine arrays under their
            // locks.
            for part in &domain.parts {
                let mut next = part.tile_active_next.lock().unwrap();
                for tile in local_active_tiles.iter_ones() {
                    if grid.engine_of_tile(tile as u64) == part.engine_index {
                        let local = grid.local_tile_id(tile as u64) as usize;
                        next.set(local, true);
                    }
                }
            }
        }

        domain.sink.record(PerfEvent {
            component: ComponentKind::VertexApplier,
            engine: 0,
            worker,
            block_id: iteration,
            nanos: started.elapsed().as_nanos() as u64,
            label: "apply",
        });

        if domain.local_apply_barrier.wait().is_leader() {
            domain.reset_round();
        }
        domain.local_apply_barrier.wait();
        domain.end_apply_barrier.wait();

        if domain.is_shutdown() {
            break;
        }
    }
    tracing::info!(worker, "shutdown vertex applier");
}
