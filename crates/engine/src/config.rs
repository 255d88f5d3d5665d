//! Runtime configuration surface.

use std::path::PathBuf;

use model::ScenarioStats;

use crate::EngineError;

/// How a vertex fetcher obtains source-vertex values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LocalFetcherMode {
    /// Read the global `current[]` array directly.
    #[default]
    DirectAccess,
    /// Route lookups through global fetchers (remote-array topology).
    GlobalFetcher,
    /// Fill blocks with the algorithm's gather identity (debugging).
    ConstantValue,
    /// Emit empty source blocks.
    Fake,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GlobalFetcherMode {
    #[default]
    Active,
    ConstantValue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TileProcessorMode {
    #[default]
    Active,
    /// Skip the gather loop; responses carry reset accumulators.
    Noop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GlobalReducerMode {
    /// Responses split per stripe owner; `next[]` cells have one writer.
    #[default]
    Striped,
    /// Responses route whole by block id; writes serialize through the
    /// vertex lock table.
    Locking,
}

/// Ring capacities in bytes. Every capacity must hold the largest block the
/// configuration can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingSizes {
    pub read_tiles: usize,
    pub index: usize,
    pub tiles_data: usize,
    pub processed: usize,
    pub reducer: usize,
    pub active_tiles: usize,
}

impl Default for RingSizes {
    fn default() -> Self {
        Self {
            read_tiles: 64 << 20,
            index: 32 << 20,
            tiles_data: 16 << 20,
            processed: 16 << 20,
            reducer: 16 << 20,
            active_tiles: 1 << 20,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub count_vertices: u64,
    pub count_tiles: u64,
    pub count_edge_engines: usize,

    pub count_tile_readers: usize,
    pub count_tile_processors: usize,
    pub count_followers: usize,

    pub count_index_readers: usize,
    pub count_vertex_fetchers: usize,
    pub count_vertex_reducers: usize,
    pub count_global_reducers: usize,
    pub count_global_fetchers: usize,
    pub count_vertex_appliers: usize,

    pub max_iterations: u64,
    pub is_weighted_graph: bool,
    pub is_index_32_bits: bool,
    pub use_selective_scheduling: bool,
    pub in_memory_mode: bool,

    pub local_fetcher_mode: LocalFetcherMode,
    pub global_fetcher_mode: GlobalFetcherMode,
    pub tile_processor_mode: TileProcessorMode,
    pub global_reducer_mode: GlobalReducerMode,

    pub ring_sizes: RingSizes,
    /// Per-iteration `vertex-output-<i>.data` dumps land here when set.
    pub output_dir: Option<PathBuf>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            count_vertices: 0,
            count_tiles: 0,
            count_edge_engines: 1,
            count_tile_readers: 1,
            count_tile_processors: 1,
            count_followers: 0,
            count_index_readers: 1,
            count_vertex_fetchers: 1,
            count_vertex_reducers: 1,
            count_global_reducers: 1,
            count_global_fetchers: 1,
            count_vertex_appliers: 1,
            max_iterations: u64::MAX,
            is_weighted_graph: false,
            is_index_32_bits: true,
            use_selective_scheduling: false,
            in_memory_mode: false,
            local_fetcher_mode: LocalFetcherMode::default(),
            global_fetcher_mode: GlobalFetcherMode::default(),
            tile_processor_mode: TileProcessorMode::default(),
            global_reducer_mode: GlobalReducerMode::default(),
            ring_sizes: RingSizes::default(),
            output_dir: None,
        }
    }
}

impl RuntimeConfig {
    /// Adopts the graph's descriptor and cross-checks flags the caller may
    /// have pinned.
    pub fn adopt_scenario(&mut self, stats: &ScenarioStats) -> Result<(), EngineError> {
        if self.count_vertices != 0 && self.count_vertices != stats.count_vertices {
            return Err(EngineError::ConfigMismatch(format!(
                "configured {} vertices but the graph has {}",
                self.count_vertices, stats.count_vertices
            )));
        }
        if self.is_weighted_graph != stats.is_weighted() {
            return Err(EngineError::ConfigMismatch(format!(
                "weighted flag {} disagrees with graph descriptor {}",
                self.is_weighted_graph,
                stats.is_weighted()
            )));
        }
        if self.is_index_32_bits != stats.index_32_bits() {
            return Err(EngineError::ConfigMismatch(format!(
                "index width flag {} disagrees with graph descriptor {}",
                self.is_index_32_bits,
                stats.index_32_bits()
            )));
        }
        self.count_vertices = stats.count_vertices;
        self.count_tiles = stats.count_tiles;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        let thread_counts = [
            ("count_edge_engines", self.count_edge_engines),
            ("count_tile_readers", self.count_tile_readers),
            ("count_tile_processors", self.count_tile_processors),
            ("count_index_readers", self.count_index_readers),
            ("count_vertex_fetchers", self.count_vertex_fetchers),
            ("count_vertex_reducers", self.count_vertex_reducers),
            ("count_global_reducers", self.count_global_reducers),
            ("count_vertex_appliers", self.count_vertex_appliers),
        ];
        for (name, value) in thread_counts {
            if value == 0 {
                return Err(EngineError::ConfigMismatch(format!(
                    "{name} must be at least 1"
                )));
            }
        }
        if self.count_vertices == 0 {
            return Err(EngineError::ConfigMismatch(
                "count_vertices must be set from the graph descriptor".into(),
            ));
        }
        if self.count_tiles != 0 && self.count_edge_engines as u64 > self.count_tiles {
            return Err(EngineError::ConfigMismatch(format!(
                "{} edge engines cannot shard {} tiles",
                self.count_edge_engines, self.count_tiles
            )));
        }
        if self.in_memory_mode && self.use_selective_scheduling {
            return Err(EngineError::ConfigMismatch(
                "in_memory_mode retires the tile readers after one pass and cannot \
                 drive the per-iteration active-tile exchange"
                    .into(),
            ));
        }
        if self.local_fetcher_mode == LocalFetcherMode::GlobalFetcher
            && self.count_global_fetchers == 0
        {
            return Err(EngineError::ConfigMismatch(
                "GlobalFetcher mode needs at least one global fetcher".into(),
            ));
        }
        if self.local_fetcher_mode == LocalFetcherMode::Fake
            && self.tile_processor_mode != TileProcessorMode::Noop
        {
            return Err(EngineError::ConfigMismatch(
                "fake fetcher blocks carry no source values; pair them with a noop \
                 tile processor"
                    .into(),
            ));
        }
        Ok(())
    }
}
