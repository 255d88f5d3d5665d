pub mod bitset;

pub use bitset::{AtomicBitset, bitset_len_bytes};

use bytemuck::{Pod, Zeroable};
use static_assertions::const_assert_eq;

pub type VertexId = u64;
pub type LocalVertexId = u16;
pub type TileId = u64;

/// A tile never addresses more than 2^16 local vertices on either axis.
pub const MAX_VERTICES_PER_TILE: usize = 1 << 16;
pub const MAX_EDGES_PER_TILE: u64 = 1 << 28;

/// Contiguous run of vertex ids statically assigned to one global reducer
/// for memory-init ownership.
pub const VERTICES_PER_PARTITION_STRIPE: u64 = 1024;

/// Edge-loop stride for the tile processor and its followers.
pub const EDGES_STRIPE_SIZE: u32 = 16;

/// Alignment of batched edge-file reads. Must be a power of two.
pub const TILE_READ_ALIGN: u64 = 128 * 1024;
pub const PAGE_SIZE: usize = 4096;

pub const MAGIC_IDENTIFIER: u64 = 0x9A5D_5C8F_5A92_C3C1;

/// Fraction of tiles whose processing time is sampled for the adaptive
/// partition split.
pub const SAMPLE_THRESHOLD: f64 = 0.01;

pub const INIT_TILE_BREAK_POINT: u64 = 2_500_000;
pub const MAX_TILE_BREAK_POINT: u64 = 2_500_000;
pub const MIN_TILE_BREAK_POINT: u64 = 500_000;

pub const VERTEX_LOCK_TABLE_SIZE: usize = 223;

/// In-degree / out-degree pair, read-only after startup.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct VertexDegree {
    pub in_degree: u32,
    pub out_degree: u32,
}

const_assert_eq!(std::mem::size_of::<VertexDegree>(), 8);

/// Global graph descriptor stored in `stat.dat`. Little-endian, no padding.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct ScenarioStats {
    pub count_vertices: u64,
    pub count_tiles: u64,
    pub is_index_32_bits: u8,
    pub is_weighted_graph: u8,
    pub index_33_bit_extension: u8,
    reserved: [u8; 5],
}

const_assert_eq!(std::mem::size_of::<ScenarioStats>(), 24);

impl ScenarioStats {
    pub fn new(
        count_vertices: u64,
        count_tiles: u64,
        is_index_32_bits: bool,
        is_weighted_graph: bool,
        index_33_bit_extension: bool,
    ) -> Self {
        Self {
            count_vertices,
            count_tiles,
            is_index_32_bits: is_index_32_bits as u8,
            is_weighted_graph: is_weighted_graph as u8,
            index_33_bit_extension: index_33_bit_extension as u8,
            reserved: [0; 5],
        }
    }

    pub fn is_weighted(&self) -> bool {
        self.is_weighted_graph != 0
    }

    pub fn index_32_bits(&self) -> bool {
        self.is_index_32_bits != 0
    }
}

/// Per-tile descriptor stored in the per-engine `tile_stats.dat`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct TileStats {
    pub block_id: u64,
    pub count_vertex_src: u32,
    pub count_vertex_tgt: u32,
    pub count_edges: u32,
    /// Non-zero when the target stream is run-length encoded as
    /// `(count, local_tgt_id)` pairs.
    pub use_rle: u8,
    reserved: [u8; 3],
}

const_assert_eq!(std::mem::size_of::<TileStats>(), 24);

impl TileStats {
    pub fn new(
        block_id: u64,
        count_vertex_src: u32,
        count_vertex_tgt: u32,
        count_edges: u32,
        use_rle: bool,
    ) -> Self {
        Self {
            block_id,
            count_vertex_src,
            count_vertex_tgt,
            count_edges,
            use_rle: use_rle as u8,
            reserved: [0; 3],
        }
    }

    pub fn rle(&self) -> bool {
        self.use_rle != 0
    }
}

/// One run of an RLE-encoded target stream. A count of 0 decodes to 65 536.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct VertexCount {
    pub count: u16,
    pub id: u16,
}

const_assert_eq!(std::mem::size_of::<VertexCount>(), 4);

impl VertexCount {
    pub fn run_len(&self) -> u32 {
        if self.count == 0 { 65_536 } else { self.count as u32 }
    }
}

/// Stripe-ownership map: `owner(v) = (v / STRIPE) mod reducer_count`.
pub fn stripe_owner(vertex: VertexId, reducer_count: usize) -> usize {
    ((vertex / VERTICES_PER_PARTITION_STRIPE) % reducer_count as u64) as usize
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum GridError {
    #[error("tile id {tile_id} out of bounds for {count_tiles} tiles")]
    TileOutOfBounds { tile_id: TileId, count_tiles: u64 },
}

/// Static assignment of tiles to edge engines: tile `t` belongs to engine
/// `t mod E` with local id `t div E`, so the per-engine counts differ by at
/// most one and the remainder lands on low-indexed engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileGrid {
    count_tiles: u64,
    count_engines: usize,
}

impl TileGrid {
    pub fn new(count_tiles: u64, count_engines: usize) -> Self {
        assert!(count_engines > 0, "tile grid requires at least one engine");
        Self {
            count_tiles,
            count_engines,
        }
    }

    pub fn count_tiles(&self) -> u64 {
        self.count_tiles
    }

    pub fn count_engines(&self) -> usize {
        self.count_engines
    }

    pub fn engine_of_tile(&self, tile_id: TileId) -> usize {
        (tile_id % self.count_engines as u64) as usize
    }

    pub fn local_tile_id(&self, tile_id: TileId) -> u64 {
        tile_id / self.count_engines as u64
    }

    pub fn global_tile_id(&self, engine: usize, local_tile_id: u64) -> TileId {
        local_tile_id * self.count_engines as u64 + engine as u64
    }

    pub fn tiles_in_engine(&self, engine: usize) -> u64 {
        let base = self.count_tiles / self.count_engines as u64;
        let remainder = self.count_tiles % self.count_engines as u64;
        base + u64::from((engine as u64) < remainder)
    }

    pub fn check_tile(&self, tile_id: TileId) -> Result<(), GridError> {
        if tile_id >= self.count_tiles {
            return Err(GridError::TileOutOfBounds {
                tile_id,
                count_tiles: self.count_tiles,
            });
        }
        Ok(())
    }
}

pub fn int_ceil(value: u64, align: u64) -> u64 {
    debug_assert!(align > 0);
    value.div_ceil(align) * align
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tile_grid_splits_remainder_onto_low_engines() {
        let grid = TileGrid::new(10, 3);
        assert_eq!(grid.tiles_in_engine(0), 4);
        assert_eq!(grid.tiles_in_engine(1), 3);
        assert_eq!(grid.tiles_in_engine(2), 3);

        let total: u64 = (0..3).map(|e| grid.tiles_in_engine(e)).sum();
        assert_eq!(total, 10);
    }

    #[test]
    fn tile_grid_local_ids_round_trip() {
        let grid = TileGrid::new(10, 3);
        for tile_id in 0..10 {
            let engine = grid.engine_of_tile(tile_id);
            let local = grid.local_tile_id(tile_id);
            assert_eq!(grid.global_tile_id(engine, local), tile_id);
            assert!(local < grid.tiles_in_engine(engine));
        }
    }

    #[test]
    fn last_engine_count_differs_by_at_most_one() {
        for count_tiles in 1..40u64 {
            for count_engines in 1..7usize {
                let grid = TileGrid::new(count_tiles, count_engines);
                let max = (0..count_engines)
                    .map(|e| grid.tiles_in_engine(e))
                    .max()
                    .unwrap();
                let min = (0..count_engines)
                    .map(|e| grid.tiles_in_engine(e))
                    .min()
                    .unwrap();
                assert!(max - min <= 1);
            }
        }
    }

    #[test]
    fn stripe_owner_is_constant_within_a_stripe() {
        let owner = stripe_owner(0, 4);
        for v in 0..VERTICES_PER_PARTITION_STRIPE {
            assert_eq!(stripe_owner(v, 4), owner);
        }
        assert_ne!(stripe_owner(VERTICES_PER_PARTITION_STRIPE, 4), owner);
    }

    #[test]
    fn rle_count_zero_decodes_to_full_tile() {
        let run = VertexCount { count: 0, id: 7 };
        assert_eq!(run.run_len(), 65_536);
    }

    #[test]
    fn int_ceil_rounds_to_alignment() {
        assert_eq!(int_ceil(0, 4096), 0);
        assert_eq!(int_ceil(1, 4096), 4096);
        assert_eq!(int_ceil(4096, 4096), 4096);
        assert_eq!(int_ceil(4097, 4096), 8192);
    }
}
