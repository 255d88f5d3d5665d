//! The reader engine shared by tile readers and index readers.
//!
//! Both convert an on-disk payload file into per-tile ring-buffer slabs
//! published through an offset table. They differ only in how a tile's size
//! is computed (which the per-file offset table already encodes) and in
//! which ring, table and progress counter they bind to.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use ringbuf::{ByteRing, Mode};
use tiles::TileFile;

use crate::EngineError;
use crate::tables::{SlotTable, TileBundleRef};

pub(crate) struct ReaderEngine {
    pub ring: ByteRing,
    pub table: Arc<SlotTable<TileBundleRef>>,
    pub file: Arc<TileFile>,
    pub progress: Arc<AtomicU64>,
    pub batch_size: u64,
    pub count_tiles_local: u64,
    /// Maps a local tile id to the global block id stamped on payloads.
    pub global_id_of: Box<dyn Fn(u64) -> u64 + Send + Sync>,
}

impl ReaderEngine {
    pub fn batches_per_iter(&self) -> u64 {
        self.count_tiles_local.div_ceil(self.batch_size).max(1)
    }

    /// Draws the next batch from the shared counter; returns the iteration
    /// it belongs to and the first tile of the batch.
    pub fn grab_a_tile(&self) -> (u64, u64) {
        let batch = self.progress.fetch_add(1, Ordering::Relaxed);
        let iteration = batch / self.batches_per_iter();
        let start_tile = (batch % self.batches_per_iter()) * self.batch_size;
        (iteration, start_tile)
    }

    /// Reads tiles `[start, end)` as one slab and publishes each tile into
    /// the offset table. Returns the bytes read.
    pub fn read_a_batch_of_tiles(
        &self,
        start_tile: u64,
        end_tile: u64,
        consumers: u32,
    ) -> Result<u64, EngineError> {
        let offsets = self.file.offsets();
        let base = offsets[start_tile as usize];
        let total = (offsets[end_tile as usize] - base) as usize;

        let mut slab = self.ring.put(total, Mode::Blocking)?;
        self.file
            .read_batch(start_tile as usize, end_tile as usize, &mut slab)?;
        let bundle = Arc::new(slab.publish());

        for tile in start_tile..end_tile {
            let tile_start = (offsets[tile as usize] - base) as usize;
            let tile_end = (offsets[tile as usize + 1] - base) as usize;
            let payload = TileBundleRef::new(
                Arc::clone(&bundle),
                tile_start..tile_end,
                (self.global_id_of)(tile),
            );
            self.table.publish(tile as usize, payload, consumers);
        }
        Ok(total as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reader(count_tiles: u64, batch_size: u64) -> ReaderEngine {
        use tempfile::TempDir;
        use tiles::fixture::{FixtureGraph, FixtureOptions};

        // A real single-tile file backs the engine; only the counter math is
        // under test here so the tile content is irrelevant.
        let dir = TempDir::new().unwrap();
        let graph = FixtureGraph::unweighted(2, &[(0, 1)]);
        let paths = tiles::fixture::write_fixture(dir.path(), &graph, &FixtureOptions::default())
            .unwrap();
        let stats = tiles::load_tile_stats(&paths.engines[0].meta_dir, 1).unwrap();
        let offsets = Arc::new(tiles::edge_tile_offsets(&stats, false));
        let file = Arc::new(
            TileFile::open(tiles::edge_tiles_path(&paths.engines[0].tile_dir), offsets).unwrap(),
        );
        // Leak the tempdir so the file outlives this constructor.
        std::mem::forget(dir);

        ReaderEngine {
            ring: ByteRing::with_capacity(1 << 20, 4096),
            table: Arc::new(SlotTable::new(count_tiles as usize)),
            file,
            progress: Arc::new(AtomicU64::new(0)),
            batch_size,
            count_tiles_local: count_tiles,
            global_id_of: Box::new(|local| local),
        }
    }

    #[test]
    fn grab_walks_batches_then_iterations() {
        let engine = reader(5, 2);
        assert_eq!(engine.batches_per_iter(), 3);
        assert_eq!(engine.grab_a_tile(), (0, 0));
        assert_eq!(engine.grab_a_tile(), (0, 2));
        assert_eq!(engine.grab_a_tile(), (0, 4));
        assert_eq!(engine.grab_a_tile(), (1, 0));
        assert_eq!(engine.grab_a_tile(), (1, 2));
    }

    #[test]
    fn batch_size_one_maps_batches_to_tiles() {
        let engine = reader(3, 1);
        assert_eq!(engine.grab_a_tile(), (0, 0));
        assert_eq!(engine.grab_a_tile(), (0, 1));
        assert_eq!(engine.grab_a_tile(), (0, 2));
        assert_eq!(engine.grab_a_tile(), (1, 0));
    }
}
