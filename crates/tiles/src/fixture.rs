//! Writes a complete compiled-graph file set from an in-memory edge list.
//!
//! This is test tooling, not the offline compiler: it produces small graphs
//! in the exact on-disk format the runtime consumes, including tile
//! sharding, RLE target streams and the vertex-to-tile cross references.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::Write;
use std::path::Path;

use model::{PAGE_SIZE, ScenarioStats, TILE_READ_ALIGN, TileGrid, TileStats, VertexCount,
            VertexDegree, int_ceil};
use protocol::{encode_edge_block, encode_index_block};

use crate::{EnginePaths, GraphPaths, StoreError, edge_tiles_path, global_stats_path,
            global_to_orig_path, index_tiles_path, tile_stats_path, vertex_degrees_path,
            vertex_to_tile_count_path, vertex_to_tile_index_path};

#[derive(Debug, Clone)]
pub struct FixtureGraph {
    pub count_vertices: u64,
    /// `(src, tgt, weight)`; weights ignored for unweighted fixtures.
    pub edges: Vec<(u64, u64, f32)>,
    pub weighted: bool,
}

impl FixtureGraph {
    pub fn unweighted(count_vertices: u64, edges: &[(u64, u64)]) -> Self {
        Self {
            count_vertices,
            edges: edges.iter().map(|&(src, tgt)| (src, tgt, 0.0)).collect(),
            weighted: false,
        }
    }

    pub fn weighted(count_vertices: u64, edges: &[(u64, u64, f32)]) -> Self {
        Self {
            count_vertices,
            edges: edges.to_vec(),
            weighted: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FixtureOptions {
    pub count_engines: usize,
    /// Tile partition width; lowering it forces multi-tile layouts for
    /// graphs far below 2^16 vertices.
    pub max_vertices_per_tile: u64,
    /// Encode target streams with run-length encoding.
    pub rle: bool,
}

impl Default for FixtureOptions {
    fn default() -> Self {
        Self {
            count_engines: 1,
            max_vertices_per_tile: model::MAX_VERTICES_PER_TILE as u64,
            rle: false,
        }
    }
}

struct TileDraft {
    stats: TileStats,
    edge_block: Vec<u8>,
    index_block: Vec<u8>,
    src_index: Vec<u32>,
    tgt_index: Vec<u32>,
}

fn build_tile(
    block_id: u64,
    edges: &[(u64, u64, f32)],
    partition: u64,
    tile_row: u64,
    tile_col: u64,
    rle: bool,
    weighted: bool,
) -> TileDraft {
    // Compact local id spaces: sorted distinct globals, position = local id.
    let mut src_index: Vec<u32> = edges.iter().map(|edge| edge.0 as u32).collect();
    src_index.sort_unstable();
    src_index.dedup();
    let mut tgt_index: Vec<u32> = edges.iter().map(|edge| edge.1 as u32).collect();
    tgt_index.sort_unstable();
    tgt_index.dedup();

    let local_src = |global: u64| -> u16 {
        src_index.binary_search(&(global as u32)).unwrap() as u16
    };
    let local_tgt = |global: u64| -> u16 {
        tgt_index.binary_search(&(global as u32)).unwrap() as u16
    };

    // Target-major order, the layout RLE assumes.
    let mut local_edges: Vec<(u16, u16, f32)> = edges
        .iter()
        .map(|&(src, tgt, weight)| (local_tgt(tgt), local_src(src), weight))
        .collect();
    local_edges.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));

    let src_stream: Vec<u16> = local_edges.iter().map(|edge| edge.1).collect();
    let weight_stream: Vec<f32> = local_edges.iter().map(|edge| edge.2).collect();

    let stats = TileStats::new(
        block_id,
        src_index.len() as u32,
        tgt_index.len() as u32,
        local_edges.len() as u32,
        rle,
    );

    let edge_block = if rle {
        let mut runs: Vec<VertexCount> = Vec::with_capacity(tgt_index.len());
        for local_id in 0..tgt_index.len() as u16 {
            let count = local_edges
                .iter()
                .filter(|edge| edge.0 == local_id)
                .count();
            // 65 536 wraps to the count = 0 encoding.
            runs.push(VertexCount {
                count: count as u16,
                id: local_id,
            });
        }
        encode_edge_block(
            block_id,
            &stats,
            &src_stream,
            None,
            Some(&runs),
            weighted.then_some(weight_stream.as_slice()),
        )
    } else {
        let tgt_stream: Vec<u16> = local_edges.iter().map(|edge| edge.0).collect();
        encode_edge_block(
            block_id,
            &stats,
            &src_stream,
            Some(&tgt_stream),
            None,
            weighted.then_some(weight_stream.as_slice()),
        )
    };

    // Local ids were compacted against partition-relative globals already
    // offset into the full id space.
    let src_globals: Vec<u32> = src_index
        .iter()
        .map(|&local| local + (tile_col * partition) as u32)
        .collect();
    let tgt_globals: Vec<u32> = tgt_index
        .iter()
        .map(|&local| local + (tile_row * partition) as u32)
        .collect();
    let index_block = encode_index_block(block_id, &src_globals, &tgt_globals, None);

    TileDraft {
        stats,
        edge_block,
        index_block,
        src_index: src_globals,
        tgt_index: tgt_globals,
    }
}

pub fn write_fixture(
    dir: &Path,
    graph: &FixtureGraph,
    options: &FixtureOptions,
) -> Result<GraphPaths, StoreError> {
    assert!(options.count_engines > 0);
    let partition = options.max_vertices_per_tile;
    let partitions = graph.count_vertices.div_ceil(partition).max(1);
    let count_tiles = partitions * partitions;
    let grid = TileGrid::new(count_tiles, options.count_engines);

    // Bucket edges into (tgt partition, src partition) rectangles, keeping
    // ids partition-relative.
    let mut buckets: BTreeMap<u64, Vec<(u64, u64, f32)>> = BTreeMap::new();
    for &(src, tgt, weight) in &graph.edges {
        let tile_row = tgt / partition;
        let tile_col = src / partition;
        let tile_id = tile_row * partitions + tile_col;
        buckets
            .entry(tile_id)
            .or_default()
            .push((src % partition, tgt % partition, weight));
    }

    let mut drafts = Vec::with_capacity(count_tiles as usize);
    for tile_id in 0..count_tiles {
        let tile_row = tile_id / partitions;
        let tile_col = tile_id % partitions;
        let edges = buckets.remove(&tile_id).unwrap_or_default();
        drafts.push(build_tile(
            tile_id,
            &edges,
            partition,
            tile_row,
            tile_col,
            options.rle,
            graph.weighted,
        ));
    }

    let globals = dir.join("globals");
    std::fs::create_dir_all(&globals).map_err(|source| StoreError::DiskWrite {
        path: globals.clone(),
        source,
    })?;

    let write_file = |path: &Path, bytes: &[u8]| -> Result<(), StoreError> {
        let mut file = File::create(path).map_err(|source| StoreError::DiskWrite {
            path: path.to_owned(),
            source,
        })?;
        file.write_all(bytes).map_err(|source| StoreError::DiskWrite {
            path: path.to_owned(),
            source,
        })
    };

    // Global stats + degrees + id map.
    let stats = ScenarioStats::new(
        graph.count_vertices,
        count_tiles,
        true,
        graph.weighted,
        false,
    );
    write_file(&global_stats_path(&globals), bytemuck::bytes_of(&stats))?;

    let mut degrees = vec![VertexDegree::default(); graph.count_vertices as usize];
    for &(src, tgt, _) in &graph.edges {
        degrees[src as usize].out_degree += 1;
        degrees[tgt as usize].in_degree += 1;
    }
    write_file(
        &vertex_degrees_path(&globals),
        bytemuck::cast_slice(&degrees),
    )?;

    let orig: Vec<u64> = (0..graph.count_vertices).collect();
    write_file(&global_to_orig_path(&globals), bytemuck::cast_slice(&orig))?;

    // Vertex-to-tile cross references: every tile the vertex participates
    // in, on either axis, in tile order.
    let mut tiles_per_vertex: Vec<Vec<u32>> = vec![Vec::new(); graph.count_vertices as usize];
    for draft in &drafts {
        for &src_global in &draft.src_index {
            tiles_per_vertex[src_global as usize].push(draft.stats.block_id as u32);
        }
        for &tgt_global in &draft.tgt_index {
            let tiles = &mut tiles_per_vertex[tgt_global as usize];
            if tiles.last() != Some(&(draft.stats.block_id as u32)) {
                tiles.push(draft.stats.block_id as u32);
            }
        }
    }
    let counts: Vec<u32> = tiles_per_vertex
        .iter()
        .map(|tiles| tiles.len() as u32)
        .collect();
    let index: Vec<u32> = tiles_per_vertex.into_iter().flatten().collect();
    write_file(
        &vertex_to_tile_count_path(&globals),
        bytemuck::cast_slice(&counts),
    )?;
    write_file(
        &vertex_to_tile_index_path(&globals),
        bytemuck::cast_slice(&index),
    )?;

    // Per-engine sharded edge/index/stats files, local tile order.
    let mut engines = Vec::with_capacity(options.count_engines);
    for engine in 0..options.count_engines {
        let tile_dir = dir.join(format!("tiles-{engine}"));
        let meta_dir = dir.join(format!("meta-{engine}"));
        std::fs::create_dir_all(&tile_dir).map_err(|source| StoreError::DiskWrite {
            path: tile_dir.clone(),
            source,
        })?;
        std::fs::create_dir_all(&meta_dir).map_err(|source| StoreError::DiskWrite {
            path: meta_dir.clone(),
            source,
        })?;

        let mut engine_stats = Vec::new();
        let mut edge_bytes = Vec::new();
        let mut index_bytes = Vec::new();
        for local_id in 0..grid.tiles_in_engine(engine) {
            let draft = &drafts[grid.global_tile_id(engine, local_id) as usize];
            engine_stats.push(draft.stats);

            let padded_edge = int_ceil(draft.edge_block.len() as u64, TILE_READ_ALIGN) as usize;
            edge_bytes.extend_from_slice(&draft.edge_block);
            edge_bytes.resize(edge_bytes.len() + padded_edge - draft.edge_block.len(), 0);

            let padded_index = int_ceil(draft.index_block.len() as u64, PAGE_SIZE as u64) as usize;
            index_bytes.extend_from_slice(&draft.index_block);
            index_bytes.resize(index_bytes.len() + padded_index - draft.index_block.len(), 0);
        }

        write_file(
            &tile_stats_path(&meta_dir),
            bytemuck::cast_slice(&engine_stats),
        )?;
        write_file(&edge_tiles_path(&tile_dir), &edge_bytes)?;
        write_file(&index_tiles_path(&meta_dir), &index_bytes)?;
        engines.push(EnginePaths { tile_dir, meta_dir });
    }

    Ok(GraphPaths { globals, engines })
}
