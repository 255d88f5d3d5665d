//! Pipeline assembly and top-level run loop: loads the compiled graph,
//! builds the vertex domain and the edge engines, wires the rings between
//! them, spawns every worker thread and joins them at shutdown.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Mutex};
use std::time::Instant;

use arc_swap::ArcSwap;
use bitvec::order::Lsb0;
use bitvec::vec::BitVec;
use model::{PAGE_SIZE, TileGrid};
use ringbuf::{ByteRing, SegmentHost, SegmentMaster, SegmentShadow};
use tiles::{GraphPaths, ResultWriter, TileFile, VertexToTiles};

use algorithms::VertexProgram;

use crate::EngineError;
use crate::config::RuntimeConfig;
use crate::edge::EdgeEngine;
use crate::events::{EdgePerfCounters, NoopSink, PerfEventSink};
use crate::split::TileBreakPoint;
use crate::tables::SlotTable;
use crate::vertex::{VertexDomain, VertexPart, lock_table};
use crate::vertex_array::VertexArrays;

/// Result of a pipeline run: the number of completed iterations and the
/// final vertex values (`current[]` after the last apply).
#[derive(Debug)]
pub struct RunOutcome<V> {
    pub iterations: u64,
    pub vertices: Vec<V>,
}

pub struct Runtime;

impl Runtime {
    pub fn run<A: VertexProgram>(
        config: RuntimeConfig,
        algorithm: A,
        paths: &GraphPaths,
    ) -> Result<RunOutcome<A::Value>, EngineError> {
        Self::run_with_sink(config, algorithm, paths, Arc::new(NoopSink))
    }

    pub fn run_with_sink<A: VertexProgram>(
        mut config: RuntimeConfig,
        algorithm: A,
        paths: &GraphPaths,
        sink: Arc<dyn PerfEventSink>,
    ) -> Result<RunOutcome<A::Value>, EngineError> {
        let scenario = tiles::load_scenario_stats(&paths.globals)?;
        config.adopt_scenario(&scenario)?;
        config.validate()?;
        if paths.engines.len() != config.count_edge_engines {
            return Err(EngineError::ConfigMismatch(format!(
                "{} engine path sets for {} edge engines",
                paths.engines.len(),
                config.count_edge_engines
            )));
        }

        let algorithm = Arc::new(algorithm);
        let count_vertices = config.count_vertices;

        // An iteration cap of zero leaves the initial state untouched.
        if config.max_iterations == 0 {
            let vertices = (0..count_vertices)
                .map(|vertex| algorithm.init_vertex(vertex))
                .collect();
            return Ok(RunOutcome {
                iterations: 0,
                vertices,
            });
        }

        let started = Instant::now();
        let config = Arc::new(config);
        let grid = TileGrid::new(config.count_tiles, config.count_edge_engines);
        let degrees = Arc::new(tiles::load_degrees(&paths.globals, count_vertices)?);
        let v2t = VertexToTiles::load(&paths.globals, count_vertices)?;
        let vertices = VertexArrays::new(count_vertices as usize, degrees);
        let break_point = Arc::new(TileBreakPoint::new());
        let segment_host = SegmentHost::new();

        let result_writer = match &config.output_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir)
                    .map_err(|_| EngineError::OutputDir(dir.clone()))?;
                Some(ResultWriter::new(dir.clone()))
            }
            None => None,
        };

        let reducer_rings: Vec<ByteRing> = (0..config.count_global_reducers)
            .map(|_| ByteRing::with_capacity(config.ring_sizes.reducer, 64))
            .collect();

        let mut edge_engines = Vec::with_capacity(config.count_edge_engines);
        let mut parts = Vec::with_capacity(config.count_edge_engines);

        for engine_index in 0..config.count_edge_engines {
            let engine_paths = &paths.engines[engine_index];
            let tiles_local = grid.tiles_in_engine(engine_index) as usize;
            let tile_stats =
                Arc::new(tiles::load_tile_stats(&engine_paths.meta_dir, tiles_local)?);

            let edge_offsets =
                Arc::new(tiles::edge_tile_offsets(&tile_stats, config.is_weighted_graph));
            let edge_file = Arc::new(TileFile::open(
                tiles::edge_tiles_path(&engine_paths.tile_dir),
                edge_offsets,
            )?);
            let index_offsets = Arc::new(tiles::index_tile_offsets(
                &tile_stats,
                !config.is_index_32_bits,
            ));
            let index_file = Arc::new(TileFile::open(
                tiles::index_tiles_path(&engine_paths.meta_dir),
                index_offsets,
            )?);

            let tiles_data_ring = ByteRing::with_capacity(config.ring_sizes.tiles_data, 64);
            let processed_ring = ByteRing::with_capacity(config.ring_sizes.processed, 64);

            let (active_tiles_master, active_tiles_shadow) = if config.use_selective_scheduling {
                let port = engine_index as u16;
                let master = SegmentMaster::create(
                    &segment_host,
                    port,
                    config.ring_sizes.active_tiles,
                    64,
                );
                let shadow = SegmentShadow::connect(&segment_host, port);
                master.wait_for_shadow(&segment_host);
                (Some(master), Some(shadow))
            } else {
                (None, None)
            };

            edge_engines.push(Arc::new(EdgeEngine {
                config: Arc::clone(&config),
                engine_index,
                grid,
                tile_stats: Arc::clone(&tile_stats),
                edge_file,
                local_tiles_ring: ByteRing::with_capacity(config.ring_sizes.read_tiles, PAGE_SIZE),
                tiles_data_ring: tiles_data_ring.clone(),
                processed_ring: processed_ring.clone(),
                offset_table: Arc::new(SlotTable::new(tiles_local)),
                reader_progress: Arc::new(AtomicU64::new(0)),
                reader_barrier: Barrier::new(config.count_tile_readers),
                processor_barrier: Barrier::new(config.count_tile_processors),
                tile_active: ArcSwap::from_pointee(BitVec::new()),
                active_tiles_master,
                shutdown: AtomicBool::new(false),
                perf: EdgePerfCounters::default(),
                break_point: Arc::clone(&break_point),
                sink: Arc::clone(&sink),
            }));

            parts.push(Arc::new(VertexPart {
                engine_index,
                index_file,
                index_ring: ByteRing::with_capacity(config.ring_sizes.index, PAGE_SIZE),
                index_table: Arc::new(SlotTable::new(tiles_local)),
                tiles_data_ring,
                processed_ring,
                active_tiles_shadow,
                index_reader_progress: Arc::new(AtomicU64::new(0)),
                fetcher_progress: Arc::new(AtomicU64::new(0)),
                tile_active_current: ArcSwap::from_pointee(BitVec::repeat(false, tiles_local)),
                tile_active_next: Mutex::new(BitVec::repeat(false, tiles_local)),
                reducers_draining: AtomicUsize::new(config.count_vertex_reducers),
            }));
        }

        let (fetch_tx, fetch_rx) = crossbeam_channel::bounded(1024);
        let fetch_responses = (0..config.count_edge_engines * config.count_vertex_fetchers)
            .map(|_| crossbeam_channel::bounded(4))
            .collect();

        let domain = Arc::new(VertexDomain {
            config: Arc::clone(&config),
            grid,
            algorithm: Arc::clone(&algorithm),
            vertices,
            v2t,
            parts,
            reducer_rings,
            break_point,
            lock_table: lock_table(),
            reducer_init_barrier: Barrier::new(config.count_global_reducers),
            memory_init_barrier: Barrier::new(VertexDomain::<A>::memory_init_parties(&config)),
            end_reduce_barrier: Barrier::new(
                config.count_global_reducers + config.count_vertex_appliers,
            ),
            local_apply_barrier: Barrier::new(config.count_vertex_appliers),
            end_apply_barrier: Barrier::new(VertexDomain::<A>::end_apply_parties(&config)),
            iteration: AtomicU64::new(0),
            shutdown: AtomicBool::new(false),
            result_writer,
            fetch_tx,
            fetch_rx,
            fetch_responses,
            sink: Arc::clone(&sink),
            round_started: Mutex::new(Instant::now()),
        });

        tracing::info!(
            vertices = count_vertices,
            tiles = config.count_tiles,
            engines = config.count_edge_engines,
            selective = config.use_selective_scheduling,
            "pipeline starting"
        );

        let mut handles = domain.start();
        for engine in &edge_engines {
            handles.extend(engine.start(&algorithm));
        }
        for handle in handles {
            if let Err(panic) = handle.join() {
                std::panic::resume_unwind(panic);
            }
        }

        let iterations = domain.iteration.load(Ordering::Acquire);
        let estimate = domain.break_point.current();
        tracing::info!(
            iterations,
            elapsed_ms = started.elapsed().as_millis() as u64,
            edge_rate_per_nano = estimate.edge_rate,
            sampled_tiles = estimate.samples,
            "pipeline finished"
        );
        Ok(RunOutcome {
            iterations,
            vertices: domain.vertices.snapshot_current(),
        })
    }
}
