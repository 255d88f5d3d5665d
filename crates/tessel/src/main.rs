//! Command-line front end: maps flags onto the runtime configuration,
//! selects a vertex program and runs the pipeline over a compiled graph.

use std::path::PathBuf;

use anyhow::{Context, bail};
use clap::{Parser, ValueEnum};
use tracing::Level;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;

use algorithms::{PageRank, Reachability, ShortestPaths, VertexProgram};
use engine::{
    GlobalReducerMode, LocalFetcherMode, RunOutcome, Runtime, RuntimeConfig, TileProcessorMode,
};
use tiles::{EnginePaths, GraphPaths};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Algorithm {
    Pagerank,
    Reachability,
    Sssp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum FetcherMode {
    Direct,
    Global,
    Constant,
    Fake,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ReducerMode {
    Striped,
    Locking,
}

#[derive(Debug, Parser)]
#[command(name = "tessel", about = "Tile-sharded pull-style graph processing runtime")]
struct Cli {
    /// Directory holding stat.dat, vertex_deg.dat and the cross references.
    #[arg(long)]
    globals: PathBuf,

    /// Per-engine directory containing tiles.dat; repeat per edge engine.
    #[arg(long = "tile-dir", required = true)]
    tile_dirs: Vec<PathBuf>,

    /// Per-engine directory containing tile_stats.dat and meta.dat; repeat
    /// per edge engine, in the same order as --tile-dir.
    #[arg(long = "meta-dir", required = true)]
    meta_dirs: Vec<PathBuf>,

    #[arg(long, value_enum)]
    algorithm: Algorithm,

    /// Root vertex for reachability / SSSP.
    #[arg(long, default_value_t = 0)]
    root: u64,

    #[arg(long, default_value_t = 0.85)]
    damping: f32,

    #[arg(long, default_value_t = u64::MAX)]
    max_iterations: u64,

    #[arg(long)]
    weighted: bool,

    #[arg(long)]
    selective: bool,

    #[arg(long)]
    in_memory: bool,

    #[arg(long, value_enum, default_value_t = FetcherMode::Direct)]
    fetcher_mode: FetcherMode,

    #[arg(long, value_enum, default_value_t = ReducerMode::Striped)]
    reducer_mode: ReducerMode,

    #[arg(long, default_value_t = 1)]
    tile_readers: usize,
    #[arg(long, default_value_t = 1)]
    tile_processors: usize,
    #[arg(long, default_value_t = 0)]
    followers: usize,
    #[arg(long, default_value_t = 1)]
    index_readers: usize,
    #[arg(long, default_value_t = 1)]
    vertex_fetchers: usize,
    #[arg(long, default_value_t = 1)]
    vertex_reducers: usize,
    #[arg(long, default_value_t = 1)]
    global_reducers: usize,
    #[arg(long, default_value_t = 1)]
    global_fetchers: usize,
    #[arg(long, default_value_t = 1)]
    vertex_appliers: usize,

    /// Dump vertex-output-<i>.data per iteration into this directory.
    #[arg(long)]
    output: Option<PathBuf>,

    /// Print the top K vertices by value after the run.
    #[arg(long, default_value_t = 10)]
    top_k: usize,
}

/// Renders events as the pipeline's tagged stderr lines: `[SG-ERR]` for
/// errors, `[SG-LOG]` for everything else.
struct SgFormat;

impl<S, N> FormatEvent<S, N> for SgFormat
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> std::fmt::Result {
        let tag = if *event.metadata().level() == Level::ERROR {
            "[SG-ERR]"
        } else {
            "[SG-LOG]"
        };
        write!(writer, "{tag} {}: ", event.metadata().target())?;
        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

fn build_config(cli: &Cli) -> RuntimeConfig {
    RuntimeConfig {
        count_edge_engines: cli.tile_dirs.len(),
        count_tile_readers: cli.tile_readers,
        count_tile_processors: cli.tile_processors,
        count_followers: cli.followers,
        count_index_readers: cli.index_readers,
        count_vertex_fetchers: cli.vertex_fetchers,
        count_vertex_reducers: cli.vertex_reducers,
        count_global_reducers: cli.global_reducers,
        count_global_fetchers: cli.global_fetchers,
        count_vertex_appliers: cli.vertex_appliers,
        max_iterations: cli.max_iterations,
        is_weighted_graph: cli.weighted,
        use_selective_scheduling: cli.selective,
        in_memory_mode: cli.in_memory,
        local_fetcher_mode: match cli.fetcher_mode {
            FetcherMode::Direct => LocalFetcherMode::DirectAccess,
            FetcherMode::Global => LocalFetcherMode::GlobalFetcher,
            FetcherMode::Constant => LocalFetcherMode::ConstantValue,
            FetcherMode::Fake => LocalFetcherMode::Fake,
        },
        global_reducer_mode: match cli.reducer_mode {
            ReducerMode::Striped => GlobalReducerMode::Striped,
            ReducerMode::Locking => GlobalReducerMode::Locking,
        },
        tile_processor_mode: if cli.fetcher_mode == FetcherMode::Fake {
            TileProcessorMode::Noop
        } else {
            TileProcessorMode::Active
        },
        output_dir: cli.output.clone(),
        ..RuntimeConfig::default()
    }
}

/// Maps internal ids back to the original graph's ids when the
/// presentation file is present.
fn original_id(map: &Option<Vec<u64>>, vertex: usize) -> u64 {
    match map {
        Some(map) => map[vertex],
        None => vertex as u64,
    }
}

fn report_top(
    iterations: u64,
    map: &Option<Vec<u64>>,
    top_k: usize,
    unit: &str,
    mut entries: Vec<(usize, f64)>,
    ascending: bool,
) {
    entries.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
    if !ascending {
        entries.reverse();
    }
    println!("iterations: {iterations}");
    for (vertex, value) in entries.into_iter().take(top_k) {
        println!("vertex {:>12}  {unit} {value}", original_id(map, vertex));
    }
}

fn run<A: VertexProgram>(
    cli: &Cli,
    algorithm: A,
    paths: &GraphPaths,
) -> anyhow::Result<RunOutcome<A::Value>> {
    Runtime::run(build_config(cli), algorithm, paths).context("pipeline run failed")
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .event_format(SgFormat)
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    if cli.tile_dirs.len() != cli.meta_dirs.len() {
        bail!(
            "{} --tile-dir entries but {} --meta-dir entries",
            cli.tile_dirs.len(),
            cli.meta_dirs.len()
        );
    }

    let paths = GraphPaths {
        globals: cli.globals.clone(),
        engines: cli
            .tile_dirs
            .iter()
            .zip(&cli.meta_dirs)
            .map(|(tile_dir, meta_dir)| EnginePaths {
                tile_dir: tile_dir.clone(),
                meta_dir: meta_dir.clone(),
            })
            .collect(),
    };

    let scenario = tiles::load_scenario_stats(&paths.globals).context("read graph descriptor")?;
    let id_map = tiles::load_global_to_orig(&paths.globals, scenario.count_vertices).ok();

    match cli.algorithm {
        Algorithm::Pagerank => {
            let mut pagerank = PageRank::new(scenario.count_vertices);
            pagerank.damping = cli.damping;
            let outcome = run(&cli, pagerank, &paths)?;
            let entries = outcome
                .vertices
                .iter()
                .enumerate()
                .map(|(vertex, &rank)| (vertex, rank as f64))
                .collect();
            report_top(outcome.iterations, &id_map, cli.top_k, "rank", entries, false);
        }
        Algorithm::Reachability => {
            let outcome = run(&cli, Reachability::from_root(cli.root), &paths)?;
            let reached = outcome.vertices.iter().filter(|&&value| value != 0).count();
            println!("iterations: {}", outcome.iterations);
            println!(
                "reached {} of {} vertices from {}",
                reached, scenario.count_vertices, cli.root
            );
        }
        Algorithm::Sssp => {
            let outcome = run(&cli, ShortestPaths::new(cli.root), &paths)?;
            let entries = outcome
                .vertices
                .iter()
                .enumerate()
                .filter(|(_, distance)| distance.is_finite())
                .map(|(vertex, &distance)| (vertex, distance as f64))
                .collect();
            report_top(outcome.iterations, &id_map, cli.top_k, "distance", entries, true);
        }
    }
    Ok(())
}
