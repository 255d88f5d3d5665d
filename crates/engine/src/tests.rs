//! End-to-end pipeline tests over tiny compiled graphs.

use std::sync::{Arc, Mutex};

use approx::assert_relative_eq;
use tempfile::TempDir;
use tiles::GraphPaths;
use tiles::fixture::{FixtureGraph, FixtureOptions, write_fixture};

use algorithms::{
    AlgorithmFlags, ApplyOutcome, GatherContext, PageRank, Reachability, ShortestPaths,
    VertexProgram,
};
use model::{VertexDegree, VertexId};

use crate::config::{GlobalReducerMode, LocalFetcherMode, RingSizes, RuntimeConfig};
use crate::events::{ComponentKind, PerfEventSink, RecordingSink};
use crate::runtime::Runtime;

/// Five vertices, one tile: 0 -> {1,2} -> 3 -> 4.
fn tiny_graph() -> FixtureGraph {
    FixtureGraph::unweighted(5, &[(0, 1), (0, 2), (1, 3), (2, 3), (3, 4)])
}

fn small_rings() -> RingSizes {
    RingSizes {
        read_tiles: 4 << 20,
        index: 2 << 20,
        tiles_data: 1 << 20,
        processed: 1 << 20,
        reducer: 1 << 20,
        active_tiles: 1 << 16,
    }
}

fn test_config() -> RuntimeConfig {
    RuntimeConfig {
        ring_sizes: small_rings(),
        ..RuntimeConfig::default()
    }
}

fn write_tiny(dir: &TempDir) -> GraphPaths {
    write_fixture(dir.path(), &tiny_graph(), &FixtureOptions::default()).unwrap()
}

#[test]
fn reachability_expands_one_hop_per_iteration_then_shuts_down() {
    let dir = TempDir::new().unwrap();
    let paths = write_tiny(&dir);

    // Single iterations first: the frontier moves exactly one hop.
    for (max_iterations, expected) in [
        (1u64, vec![1u8, 1, 1, 0, 0]),
        (2, vec![1, 1, 1, 1, 0]),
        (3, vec![1, 1, 1, 1, 1]),
    ] {
        let config = RuntimeConfig {
            use_selective_scheduling: true,
            max_iterations,
            ..test_config()
        };
        let outcome = Runtime::run(config, Reachability::from_root(0), &paths).unwrap();
        assert_eq!(outcome.vertices, expected, "after {max_iterations} iterations");
    }

    // Unbounded: one further no-op iteration raises the global shutdown.
    let config = RuntimeConfig {
        use_selective_scheduling: true,
        ..test_config()
    };
    let outcome = Runtime::run(config, Reachability::from_root(0), &paths).unwrap();
    assert_eq!(outcome.vertices, vec![1, 1, 1, 1, 1]);
    assert_eq!(outcome.iterations, 4);
}

#[test]
fn pagerank_conserves_rank_mass_without_dangling_leak() {
    let dir = TempDir::new().unwrap();
    let paths = write_tiny(&dir);

    for iterations in 1..=3u64 {
        let config = RuntimeConfig {
            max_iterations: iterations,
            ..test_config()
        };
        let outcome = Runtime::run(config, PageRank::new(5), &paths).unwrap();
        assert_eq!(outcome.iterations, iterations);
        let total: f32 = outcome.vertices.iter().sum();
        // Vertex 4 dangles, so mass decays but never past the teleport
        // floor, and the closed-world ceiling holds.
        assert!(total <= 1.0 + 1e-5, "total rank {total} above 1");
        assert!(total > 0.15, "total rank {total} below the teleport floor");
    }
}

#[test]
fn max_iterations_zero_leaves_initial_state() {
    let dir = TempDir::new().unwrap();
    let paths = write_tiny(&dir);
    let config = RuntimeConfig {
        max_iterations: 0,
        ..test_config()
    };
    let outcome = Runtime::run(config, PageRank::new(5), &paths).unwrap();
    assert_eq!(outcome.iterations, 0);
    for value in outcome.vertices {
        assert_relative_eq!(value, 0.2);
    }
}

#[test]
fn converged_pagerank_changes_only_within_noise() {
    let dir = TempDir::new().unwrap();
    let paths = write_tiny(&dir);
    let run = |max_iterations| {
        let config = RuntimeConfig {
            max_iterations,
            ..test_config()
        };
        Runtime::run(config, PageRank::new(5), &paths).unwrap().vertices
    };
    let converged = run(60);
    let one_more = run(61);
    for (a, b) in converged.iter().zip(&one_more) {
        assert!((a - b).abs() <= 1e-4, "post-convergence drift: {a} vs {b}");
    }
}

#[test]
fn single_iteration_processes_each_tile_exactly_once() {
    let dir = TempDir::new().unwrap();
    let paths = write_tiny(&dir);
    let sink = Arc::new(RecordingSink::with_capacity(4096));
    let config = RuntimeConfig {
        max_iterations: 1,
        ..test_config()
    };
    let outcome =
        Runtime::run_with_sink(config, PageRank::new(5), &paths, Arc::clone(&sink) as Arc<dyn PerfEventSink>).unwrap();
    assert_eq!(outcome.iterations, 1);

    let processed: Vec<_> = sink
        .drain()
        .into_iter()
        .filter(|event| event.component == ComponentKind::TileProcessor)
        .collect();
    assert_eq!(processed.len(), 1, "count_tiles = 1 tile responses");
    assert_eq!(processed[0].block_id, 0);
}

/// Records the gather order; the pipeline sees it as a plain vertex
/// program with no capabilities.
struct OrderProbe {
    log: Arc<Mutex<Vec<(u16, u16)>>>,
}

impl VertexProgram for OrderProbe {
    type Value = f32;

    const FLAGS: AlgorithmFlags = AlgorithmFlags::empty();

    fn init_vertex(&self, _vertex: VertexId) -> f32 {
        0.0
    }

    fn initially_active(&self, _vertex: VertexId) -> bool {
        true
    }

    fn gather_identity(&self) -> f32 {
        0.0
    }

    fn pull_gather(&self, _src: &f32, tgt: &mut f32, ctx: &mut GatherContext<'_>) {
        self.log.lock().unwrap().push((ctx.src_id, ctx.tgt_id));
        *tgt += 1.0;
    }

    fn reduce_vertex(&self, out: &mut f32, incoming: &f32, _vertex: VertexId, _degree: VertexDegree) {
        *out += *incoming;
    }

    fn apply(
        &self,
        _current: &f32,
        _reduced: &mut f32,
        _vertex: VertexId,
        _degree: VertexDegree,
        _iteration: u64,
    ) -> ApplyOutcome {
        ApplyOutcome::default()
    }
}

#[test]
fn rle_target_stream_decodes_in_edge_order() {
    let dir = TempDir::new().unwrap();
    // Tgt stream RLE [(2, id of 3), (3, id of 7)]; src stream
    // [10, 11, 20, 21, 22].
    let graph = FixtureGraph::unweighted(
        23,
        &[(10, 3), (11, 3), (20, 7), (21, 7), (22, 7)],
    );
    let options = FixtureOptions {
        rle: true,
        ..FixtureOptions::default()
    };
    let paths = write_fixture(dir.path(), &graph, &options).unwrap();

    let log = Arc::new(Mutex::new(Vec::new()));
    let config = RuntimeConfig {
        max_iterations: 1,
        ..test_config()
    };
    let probe = OrderProbe {
        log: Arc::clone(&log),
    };
    Runtime::run(config, probe, &paths).unwrap();

    // Local ids after per-tile compaction: sources 10,11,20,21,22 -> 0..4,
    // targets 3 -> 0 and 7 -> 1.
    assert_eq!(
        *log.lock().unwrap(),
        vec![(0, 0), (1, 0), (2, 1), (3, 1), (4, 1)]
    );
}

#[test]
fn follower_counts_produce_identical_results() {
    let dir = TempDir::new().unwrap();
    let graph = FixtureGraph::unweighted(
        12,
        &[
            (0, 1),
            (0, 2),
            (1, 3),
            (2, 4),
            (3, 5),
            (4, 5),
            (5, 6),
            (6, 7),
            (6, 8),
            (7, 9),
            (8, 10),
            (9, 11),
            (10, 11),
            (11, 0),
        ],
    );
    let paths = write_fixture(dir.path(), &graph, &FixtureOptions::default()).unwrap();

    let mut baseline: Option<Vec<u8>> = None;
    for count_followers in [0usize, 1, 3, 7] {
        let config = RuntimeConfig {
            count_followers,
            max_iterations: 8,
            ..test_config()
        };
        let outcome = Runtime::run(config, Reachability::from_root(0), &paths).unwrap();
        match &baseline {
            None => baseline = Some(outcome.vertices),
            Some(expected) => assert_eq!(
                &outcome.vertices, expected,
                "{count_followers} followers diverged"
            ),
        }
    }
    assert_eq!(baseline.unwrap(), vec![1u8; 12]);
}

#[test]
fn selective_scheduling_never_reads_a_permanently_inactive_tile() {
    let dir = TempDir::new().unwrap();
    // Two disconnected components in different tiles: {0,1,2} and {4,5}.
    let graph = FixtureGraph::unweighted(6, &[(0, 1), (1, 2), (4, 5)]);
    let options = FixtureOptions {
        max_vertices_per_tile: 3,
        ..FixtureOptions::default()
    };
    let paths = write_fixture(dir.path(), &graph, &options).unwrap();

    let sink = Arc::new(RecordingSink::with_capacity(4096));
    let config = RuntimeConfig {
        use_selective_scheduling: true,
        ..test_config()
    };
    let outcome =
        Runtime::run_with_sink(config, Reachability::from_root(0), &paths, Arc::clone(&sink) as Arc<dyn PerfEventSink>)
            .unwrap();
    assert_eq!(outcome.vertices, vec![1, 1, 1, 0, 0, 0]);
    assert_eq!(outcome.iterations, 3);

    // The component of {4,5} lives in tile 3 (target row 1, source column
    // 1); its reader must never touch it.
    let read_tiles: Vec<u64> = sink
        .drain()
        .into_iter()
        .filter(|event| event.component == ComponentKind::TileReader)
        .map(|event| event.block_id)
        .collect();
    assert!(!read_tiles.is_empty());
    assert!(
        !read_tiles.contains(&3),
        "inactive tile was read: {read_tiles:?}"
    );
}

#[test]
fn weighted_sssp_relaxes_to_shortest_distances() {
    let dir = TempDir::new().unwrap();
    let graph = FixtureGraph::weighted(
        4,
        &[(0, 1, 2.0), (0, 2, 5.0), (1, 2, 1.0), (2, 3, 1.0)],
    );
    let paths = write_fixture(dir.path(), &graph, &FixtureOptions::default()).unwrap();

    let config = RuntimeConfig {
        is_weighted_graph: true,
        use_selective_scheduling: true,
        ..test_config()
    };
    let outcome = Runtime::run(config, ShortestPaths::new(0), &paths).unwrap();
    assert_relative_eq!(outcome.vertices[0], 0.0);
    assert_relative_eq!(outcome.vertices[1], 2.0);
    assert_relative_eq!(outcome.vertices[2], 3.0);
    assert_relative_eq!(outcome.vertices[3], 4.0);
}

#[test]
fn sharded_engines_match_the_single_engine_result() {
    let single_dir = TempDir::new().unwrap();
    let sharded_dir = TempDir::new().unwrap();
    let graph = FixtureGraph::unweighted(
        6,
        &[(0, 1), (1, 2), (2, 3), (3, 4), (4, 5), (5, 0), (0, 3), (3, 0)],
    );
    let single = write_fixture(single_dir.path(), &graph, &FixtureOptions::default()).unwrap();
    let sharded = write_fixture(
        sharded_dir.path(),
        &graph,
        &FixtureOptions {
            count_engines: 2,
            max_vertices_per_tile: 3,
            ..FixtureOptions::default()
        },
    )
    .unwrap();

    let run = |paths: &GraphPaths, engines| {
        let config = RuntimeConfig {
            count_edge_engines: engines,
            max_iterations: 5,
            ..test_config()
        };
        Runtime::run(config, PageRank::new(6), paths).unwrap().vertices
    };
    let expected = run(&single, 1);
    let actual = run(&sharded, 2);
    for (a, b) in expected.iter().zip(&actual) {
        assert_relative_eq!(a, b, epsilon = 1e-5);
    }
}

#[test]
fn degenerate_pipeline_modes_match_direct_access() {
    let dir = TempDir::new().unwrap();
    let paths = write_tiny(&dir);
    let run = |mutate: fn(&mut RuntimeConfig)| {
        let mut config = RuntimeConfig {
            max_iterations: 3,
            ..test_config()
        };
        mutate(&mut config);
        Runtime::run(config, PageRank::new(5), &paths).unwrap().vertices
    };

    let direct = run(|_| {});
    let global_fetcher = run(|config| {
        config.local_fetcher_mode = LocalFetcherMode::GlobalFetcher;
        config.count_global_fetchers = 2;
    });
    let locking = run(|config| {
        config.global_reducer_mode = GlobalReducerMode::Locking;
        config.count_global_reducers = 3;
    });
    let striped = run(|config| config.count_global_reducers = 3);
    let in_memory = run(|config| config.in_memory_mode = true);

    for other in [&global_fetcher, &locking, &striped, &in_memory] {
        for (a, b) in direct.iter().zip(other.iter()) {
            assert_relative_eq!(a, b, epsilon = 1e-5);
        }
    }
}

#[test]
fn wide_thread_configuration_converges() {
    let dir = TempDir::new().unwrap();
    let graph = FixtureGraph::unweighted(
        9,
        &[
            (0, 1),
            (0, 4),
            (1, 2),
            (2, 5),
            (3, 6),
            (4, 3),
            (5, 8),
            (6, 7),
            (7, 8),
            (8, 0),
        ],
    );
    let options = FixtureOptions {
        max_vertices_per_tile: 3,
        ..FixtureOptions::default()
    };
    let paths = write_fixture(dir.path(), &graph, &options).unwrap();

    let config = RuntimeConfig {
        use_selective_scheduling: true,
        count_tile_readers: 2,
        count_tile_processors: 2,
        count_followers: 2,
        count_index_readers: 2,
        count_vertex_fetchers: 2,
        count_vertex_reducers: 2,
        count_global_reducers: 2,
        count_vertex_appliers: 2,
        ..test_config()
    };
    let outcome = Runtime::run(config, Reachability::from_root(0), &paths).unwrap();
    assert_eq!(outcome.vertices, vec![1u8; 9]);
}

#[test]
fn iteration_outputs_are_dumped_per_round() {
    let dir = TempDir::new().unwrap();
    let out_dir = TempDir::new().unwrap();
    let paths = write_tiny(&dir);
    let config = RuntimeConfig {
        max_iterations: 2,
        output_dir: Some(out_dir.path().to_owned()),
        ..test_config()
    };
    Runtime::run(config, PageRank::new(5), &paths).unwrap();

    for iteration in 0..2 {
        let dump = tiles::vertex_output_path(out_dir.path(), iteration);
        let bytes = std::fs::read(&dump).unwrap();
        assert_eq!(bytes.len(), 5 * std::mem::size_of::<f32>());
    }
}

#[test]
fn empty_tiles_flow_through_the_pipeline() {
    let dir = TempDir::new().unwrap();
    // One edge in tile 0; the other three tiles of the 2x2 grid are empty
    // and still produce one completion each per round.
    let graph = FixtureGraph::unweighted(6, &[(0, 1)]);
    let options = FixtureOptions {
        max_vertices_per_tile: 3,
        ..FixtureOptions::default()
    };
    let paths = write_fixture(dir.path(), &graph, &options).unwrap();

    let config = RuntimeConfig {
        max_iterations: 2,
        ..test_config()
    };
    let outcome = Runtime::run(config, PageRank::new(6), &paths).unwrap();
    assert_eq!(outcome.iterations, 2);
    let total: f32 = outcome.vertices.iter().sum();
    assert!(total > 0.15 && total <= 1.0 + 1e-5);
}

#[test]
fn config_mismatch_is_rejected_before_spawning() {
    let dir = TempDir::new().unwrap();
    let paths = write_tiny(&dir);

    let config = RuntimeConfig {
        is_weighted_graph: true,
        ..test_config()
    };
    let error = Runtime::run(config, PageRank::new(5), &paths).unwrap_err();
    assert!(matches!(error, crate::EngineError::ConfigMismatch(_)));

    let config = RuntimeConfig {
        use_selective_scheduling: true,
        in_memory_mode: true,
        ..test_config()
    };
    let error = Runtime::run(config, PageRank::new(5), &paths).unwrap_err();
    assert!(matches!(error, crate::EngineError::ConfigMismatch(_)));
}
