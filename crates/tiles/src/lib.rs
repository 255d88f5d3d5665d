//! The on-disk file set produced by the offline graph compiler and consumed
//! at runtime: global graph statistics, vertex degrees, vertex-to-tile cross
//! references, per-engine tile statistics, and the per-engine edge and index
//! payload files. Also the per-iteration result writer.
//!
//! Per-engine edge payloads are padded to the 128 KiB read alignment so a
//! batch of tiles can be fetched with one aligned read; index payloads are
//! padded to the page size.

#[cfg(any(test, feature = "test-helpers"))]
pub mod fixture;

use std::fs::File;
use std::io::{Read, Write};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use model::{PAGE_SIZE, ScenarioStats, TILE_READ_ALIGN, TileStats, VertexDegree, int_ceil};
use protocol::{edge_block_bytes, index_block_bytes};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("disk read failed for {path}: {source}")]
    DiskRead {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("disk write failed for {path}: {source}")]
    DiskWrite {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("{path} holds {actual} bytes, expected {expected}")]
    UnexpectedLength {
        path: PathBuf,
        expected: u64,
        actual: u64,
    },
}

/// Directory layout of one compiled graph.
#[derive(Debug, Clone)]
pub struct GraphPaths {
    pub globals: PathBuf,
    pub engines: Vec<EnginePaths>,
}

#[derive(Debug, Clone)]
pub struct EnginePaths {
    pub tile_dir: PathBuf,
    pub meta_dir: PathBuf,
}

pub fn global_stats_path(globals: &Path) -> PathBuf {
    globals.join("stat.dat")
}

pub fn vertex_degrees_path(globals: &Path) -> PathBuf {
    globals.join("vertex_deg.dat")
}

pub fn global_to_orig_path(globals: &Path) -> PathBuf {
    globals.join("vertex_global_to_orig.dat")
}

pub fn vertex_to_tile_count_path(globals: &Path) -> PathBuf {
    globals.join("vertex_to_tile_count.dat")
}

pub fn vertex_to_tile_index_path(globals: &Path) -> PathBuf {
    globals.join("vertex_to_tile_index.dat")
}

pub fn tile_stats_path(meta_dir: &Path) -> PathBuf {
    meta_dir.join("tile_stats.dat")
}

pub fn edge_tiles_path(tile_dir: &Path) -> PathBuf {
    tile_dir.join("tiles.dat")
}

pub fn index_tiles_path(meta_dir: &Path) -> PathBuf {
    meta_dir.join("meta.dat")
}

pub fn vertex_output_path(log_dir: &Path, iteration: u64) -> PathBuf {
    log_dir.join(format!("vertex-output-{iteration}.data"))
}

fn read_pod_vec<T: Pod + Zeroable>(path: &Path, count: usize) -> Result<Vec<T>, StoreError> {
    let mut file = File::open(path).map_err(|source| StoreError::DiskRead {
        path: path.to_owned(),
        source,
    })?;
    let expected = (count * std::mem::size_of::<T>()) as u64;
    let actual = file
        .metadata()
        .map_err(|source| StoreError::DiskRead {
            path: path.to_owned(),
            source,
        })?
        .len();
    if actual != expected {
        return Err(StoreError::UnexpectedLength {
            path: path.to_owned(),
            expected,
            actual,
        });
    }
    let mut items = vec![T::zeroed(); count];
    file.read_exact(bytemuck::cast_slice_mut(&mut items))
        .map_err(|source| StoreError::DiskRead {
            path: path.to_owned(),
            source,
        })?;
    Ok(items)
}

pub fn load_scenario_stats(globals: &Path) -> Result<ScenarioStats, StoreError> {
    let items: Vec<ScenarioStats> = read_pod_vec(&global_stats_path(globals), 1)?;
    Ok(items[0])
}

pub fn load_degrees(globals: &Path, count_vertices: u64) -> Result<Vec<VertexDegree>, StoreError> {
    read_pod_vec(&vertex_degrees_path(globals), count_vertices as usize)
}

/// Internal-to-original id map; optional, for result presentation only.
pub fn load_global_to_orig(globals: &Path, count_vertices: u64) -> Result<Vec<u64>, StoreError> {
    read_pod_vec(&global_to_orig_path(globals), count_vertices as usize)
}

pub fn load_tile_stats(meta_dir: &Path, count_tiles: usize) -> Result<Vec<TileStats>, StoreError> {
    read_pod_vec(&tile_stats_path(meta_dir), count_tiles)
}

/// Per-vertex ordered lists of the tiles the vertex participates in as a
/// source, used to activate tiles when a vertex transitions active.
#[derive(Debug)]
pub struct VertexToTiles {
    offsets: Vec<u64>,
    index: Vec<u32>,
}

impl VertexToTiles {
    pub fn load(globals: &Path, count_vertices: u64) -> Result<Self, StoreError> {
        let counts: Vec<u32> =
            read_pod_vec(&vertex_to_tile_count_path(globals), count_vertices as usize)?;
        let mut offsets = Vec::with_capacity(counts.len() + 1);
        let mut total = 0u64;
        offsets.push(0);
        for count in &counts {
            total += *count as u64;
            offsets.push(total);
        }
        let index = read_pod_vec(&vertex_to_tile_index_path(globals), total as usize)?;
        Ok(Self { offsets, index })
    }

    pub fn tiles_of(&self, vertex: u64) -> &[u32] {
        let start = self.offsets[vertex as usize] as usize;
        let end = self.offsets[vertex as usize + 1] as usize;
        &self.index[start..end]
    }
}

/// Byte offsets of each tile in the per-engine edge file, plus the file
/// total as the final entry. Each tile occupies its payload rounded up to
/// the read alignment.
pub fn edge_tile_offsets(stats: &[TileStats], weighted: bool) -> Vec<u64> {
    let mut offsets = Vec::with_capacity(stats.len() + 1);
    let mut cursor = 0u64;
    offsets.push(0);
    for tile in stats {
        cursor += int_ceil(edge_block_bytes(tile, weighted) as u64, TILE_READ_ALIGN);
        offsets.push(cursor);
    }
    offsets
}

/// Byte offsets in the per-engine index file; tiles are page-padded.
pub fn index_tile_offsets(stats: &[TileStats], extended: bool) -> Vec<u64> {
    let mut offsets = Vec::with_capacity(stats.len() + 1);
    let mut cursor = 0u64;
    offsets.push(0);
    for tile in stats {
        cursor += int_ceil(
            index_block_bytes(tile.count_vertex_src, tile.count_vertex_tgt, extended) as u64,
            PAGE_SIZE as u64,
        );
        offsets.push(cursor);
    }
    offsets
}

/// One per-engine payload file (edge or index) with its precomputed tile
/// offsets. Shared read-only across reader threads.
#[derive(Debug)]
pub struct TileFile {
    file: File,
    path: PathBuf,
    offsets: Arc<Vec<u64>>,
}

impl TileFile {
    pub fn open(path: PathBuf, offsets: Arc<Vec<u64>>) -> Result<Self, StoreError> {
        let file = File::open(&path).map_err(|source| StoreError::DiskRead {
            path: path.clone(),
            source,
        })?;
        Ok(Self {
            file,
            path,
            offsets,
        })
    }

    pub fn offsets(&self) -> &Arc<Vec<u64>> {
        &self.offsets
    }

    pub fn batch_len(&self, start_tile: usize, end_tile: usize) -> usize {
        (self.offsets[end_tile] - self.offsets[start_tile]) as usize
    }

    /// Reads tiles `[start_tile, end_tile)` with a single positioned read.
    pub fn read_batch(
        &self,
        start_tile: usize,
        end_tile: usize,
        dst: &mut [u8],
    ) -> Result<usize, StoreError> {
        let len = self.batch_len(start_tile, end_tile);
        debug_assert_eq!(dst.len(), len);
        self.file
            .read_exact_at(&mut dst[..len], self.offsets[start_tile])
            .map_err(|source| StoreError::DiskRead {
                path: self.path.clone(),
                source,
            })?;
        Ok(len)
    }
}

/// Writes the per-iteration vertex dump. The payload goes to a temporary
/// file first and is renamed into place only after a size check, so a
/// mid-iteration abort leaves the previous iteration's output intact.
#[derive(Debug, Clone)]
pub struct ResultWriter {
    log_dir: PathBuf,
}

impl ResultWriter {
    pub fn new(log_dir: PathBuf) -> Self {
        Self { log_dir }
    }

    pub fn write_iteration<V: Pod>(
        &self,
        iteration: u64,
        values: &[V],
    ) -> Result<PathBuf, StoreError> {
        let final_path = vertex_output_path(&self.log_dir, iteration);
        let temp_path = self.log_dir.join(format!(".vertex-output-{iteration}.tmp"));
        let bytes: &[u8] = bytemuck::cast_slice(values);

        let write = |path: &Path| -> std::io::Result<()> {
            let mut file = File::create(path)?;
            file.write_all(bytes)?;
            file.sync_all()?;
            let written = file.metadata()?.len();
            if written != bytes.len() as u64 {
                return Err(std::io::Error::other(format!(
                    "short result write: {written} of {} bytes",
                    bytes.len()
                )));
            }
            Ok(())
        };
        write(&temp_path).map_err(|source| StoreError::DiskWrite {
            path: temp_path.clone(),
            source,
        })?;
        std::fs::rename(&temp_path, &final_path).map_err(|source| StoreError::DiskWrite {
            path: final_path.clone(),
            source,
        })?;
        tracing::debug!(
            iteration,
            path = %final_path.display(),
            "wrote iteration result"
        );
        Ok(final_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixture::{FixtureGraph, FixtureOptions};
    use model::TileGrid;
    use protocol::{EdgeBlock, EdgeBlockIndex};
    use tempfile::TempDir;

    fn tiny_graph() -> FixtureGraph {
        FixtureGraph::unweighted(5, &[(0, 1), (0, 2), (1, 3), (2, 3), (3, 4)])
    }

    #[test]
    fn fixture_round_trips_through_loaders() {
        let dir = TempDir::new().unwrap();
        let paths = fixture::write_fixture(dir.path(), &tiny_graph(), &FixtureOptions::default())
            .unwrap();

        let stats = load_scenario_stats(&paths.globals).unwrap();
        assert_eq!(stats.count_vertices, 5);
        assert_eq!(stats.count_tiles, 1);
        assert!(!stats.is_weighted());

        let degrees = load_degrees(&paths.globals, 5).unwrap();
        assert_eq!(degrees[0].out_degree, 2);
        assert_eq!(degrees[3].in_degree, 2);
        assert_eq!(degrees[3].out_degree, 1);
        assert_eq!(degrees[4].in_degree, 1);

        let orig = load_global_to_orig(&paths.globals, 5).unwrap();
        assert_eq!(orig, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn vertex_to_tiles_covers_both_axes() {
        let dir = TempDir::new().unwrap();
        let paths = fixture::write_fixture(dir.path(), &tiny_graph(), &FixtureOptions::default())
            .unwrap();
        let v2t = VertexToTiles::load(&paths.globals, 5).unwrap();
        assert_eq!(v2t.tiles_of(0), &[0]);
        assert_eq!(v2t.tiles_of(3), &[0]);
        // Vertex 4 only ever appears as a target, still in the tile.
        assert_eq!(v2t.tiles_of(4), &[0]);
    }

    #[test]
    fn edge_file_tiles_land_on_read_alignment() {
        let dir = TempDir::new().unwrap();
        let paths = fixture::write_fixture(dir.path(), &tiny_graph(), &FixtureOptions::default())
            .unwrap();
        let tile_stats = load_tile_stats(&paths.engines[0].meta_dir, 1).unwrap();
        let offsets = edge_tile_offsets(&tile_stats, false);
        assert_eq!(offsets[0], 0);
        assert_eq!(offsets[1], TILE_READ_ALIGN);

        let file = TileFile::open(
            edge_tiles_path(&paths.engines[0].tile_dir),
            Arc::new(offsets),
        )
        .unwrap();
        // Word-backed buffer so array views cast in place like ring slabs do.
        let mut words = vec![0u64; file.batch_len(0, 1) / 8];
        let buffer: &mut [u8] = bytemuck::cast_slice_mut(&mut words);
        let read = file.read_batch(0, 1, buffer).unwrap();
        assert_eq!(read, TILE_READ_ALIGN as usize);

        let view = EdgeBlock::parse(buffer, tile_stats[0], false).unwrap();
        assert_eq!(view.src().unwrap().len(), 5);
    }

    #[test]
    fn index_file_maps_local_ids_back_to_global() {
        let dir = TempDir::new().unwrap();
        let paths = fixture::write_fixture(dir.path(), &tiny_graph(), &FixtureOptions::default())
            .unwrap();
        let tile_stats = load_tile_stats(&paths.engines[0].meta_dir, 1).unwrap();
        let offsets = index_tile_offsets(&tile_stats, false);
        let file = TileFile::open(
            index_tiles_path(&paths.engines[0].meta_dir),
            Arc::new(offsets),
        )
        .unwrap();
        let mut words = vec![0u64; file.batch_len(0, 1) / 8];
        let buffer: &mut [u8] = bytemuck::cast_slice_mut(&mut words);
        file.read_batch(0, 1, buffer).unwrap();

        let view = EdgeBlockIndex::parse(buffer, false).unwrap();
        // Sources are 0..=3 (vertex 4 never appears as a source).
        assert_eq!(view.src_index().unwrap(), &[0, 1, 2, 3]);
        // Targets are 1..=4.
        assert_eq!(view.tgt_index().unwrap(), &[1, 2, 3, 4]);
    }

    #[test]
    fn fixture_shards_tiles_across_engines() {
        let dir = TempDir::new().unwrap();
        let graph = FixtureGraph::unweighted(
            6,
            &[(0, 1), (1, 2), (2, 3), (3, 4), (4, 5), (5, 0), (0, 3), (3, 0)],
        );
        let options = FixtureOptions {
            count_engines: 2,
            max_vertices_per_tile: 3,
            ..FixtureOptions::default()
        };
        let paths = fixture::write_fixture(dir.path(), &graph, &options).unwrap();
        let stats = load_scenario_stats(&paths.globals).unwrap();
        assert_eq!(stats.count_tiles, 4);
        assert_eq!(paths.engines.len(), 2);

        let grid = TileGrid::new(4, 2);
        for engine in 0..2 {
            let count = grid.tiles_in_engine(engine) as usize;
            let tile_stats = load_tile_stats(&paths.engines[engine].meta_dir, count).unwrap();
            for (local_id, tile) in tile_stats.iter().enumerate() {
                assert_eq!(
                    tile.block_id,
                    grid.global_tile_id(engine, local_id as u64)
                );
            }
        }
    }

    #[test]
    fn result_writer_renames_after_size_check() {
        let dir = TempDir::new().unwrap();
        let writer = ResultWriter::new(dir.path().to_owned());
        let path = writer.write_iteration(3, &[1.0f32, 2.0, 3.0]).unwrap();
        assert_eq!(path, vertex_output_path(dir.path(), 3));
        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(bytes.len(), 12);
        assert!(!dir.path().join(".vertex-output-3.tmp").exists());
    }

    #[test]
    fn short_file_is_an_unexpected_length_error() {
        let dir = TempDir::new().unwrap();
        std::fs::write(global_stats_path(dir.path()), [0u8; 7]).unwrap();
        assert!(matches!(
            load_scenario_stats(dir.path()),
            Err(StoreError::UnexpectedLength { .. })
        ));
    }
}
