//! Block formats exchanged between the edge engines and the vertex domain.
//!
//! Every block is a contiguous byte payload (a ring-buffer element or a
//! region of an on-disk file) starting with a fixed `#[repr(C)]` header whose
//! `offset_*` fields locate the trailing arrays relative to the payload
//! start. All offsets are kept 8-aligned so array views can be cast in place;
//! multi-byte integers are little-endian on disk, bitsets LSB-first per byte.

pub mod rle;

pub use rle::RleCursor;

use bytemuck::{Pod, Zeroable};
use model::{MAGIC_IDENTIFIER, TileStats, VertexCount, VertexDegree, bitset_len_bytes};
use static_assertions::const_assert_eq;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum BlockError {
    #[error("block of {len} bytes is shorter than its {needed}-byte header")]
    Truncated { len: usize, needed: usize },
    #[error("array at offset {offset} with {len} bytes escapes block of {block_len} bytes")]
    OutOfBounds {
        offset: usize,
        len: usize,
        block_len: usize,
    },
    #[error("array at offset {offset} is not aligned for its element type")]
    Misaligned { offset: usize },
    #[error("magic identifier mismatch: got {got:#018x}")]
    BadMagic { got: u64 },
}

fn array<T: Pod>(block: &[u8], offset: usize, count: usize) -> Result<&[T], BlockError> {
    let len = count * std::mem::size_of::<T>();
    let end = offset
        .checked_add(len)
        .filter(|end| *end <= block.len())
        .ok_or(BlockError::OutOfBounds {
            offset,
            len,
            block_len: block.len(),
        })?;
    bytemuck::try_cast_slice(&block[offset..end]).map_err(|_| BlockError::Misaligned { offset })
}

fn header<H: Pod>(block: &[u8]) -> Result<H, BlockError> {
    let needed = std::mem::size_of::<H>();
    if block.len() < needed {
        return Err(BlockError::Truncated {
            len: block.len(),
            needed,
        });
    }
    Ok(bytemuck::pod_read_unaligned(&block[..needed]))
}

const fn align8(value: usize) -> usize {
    value.next_multiple_of(8)
}

// ---------------------------------------------------------------------------
// Edge block (tile file payload)
// ---------------------------------------------------------------------------

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pod, Zeroable)]
pub struct EdgeBlockHeader {
    pub block_id: u64,
    pub offset_src: u32,
    pub offset_tgt: u32,
    pub offset_weight: u32,
    reserved: u32,
}

const_assert_eq!(std::mem::size_of::<EdgeBlockHeader>(), 24);

/// Read view over one tile's edge data.
pub struct EdgeBlock<'a> {
    pub header: EdgeBlockHeader,
    block: &'a [u8],
    stats: TileStats,
    weighted: bool,
}

impl<'a> EdgeBlock<'a> {
    pub fn parse(block: &'a [u8], stats: TileStats, weighted: bool) -> Result<Self, BlockError> {
        let parsed = header::<EdgeBlockHeader>(block)?;
        Ok(Self {
            header: parsed,
            block,
            stats,
            weighted,
        })
    }

    pub fn src(&self) -> Result<&'a [u16], BlockError> {
        array(
            self.block,
            self.header.offset_src as usize,
            self.stats.count_edges as usize,
        )
    }

    /// Plain target stream; only valid when the tile is not RLE.
    pub fn tgt_list(&self) -> Result<&'a [u16], BlockError> {
        debug_assert!(!self.stats.rle());
        array(
            self.block,
            self.header.offset_tgt as usize,
            self.stats.count_edges as usize,
        )
    }

    /// RLE target stream; only valid when the tile is RLE.
    pub fn tgt_rle(&self) -> Result<&'a [VertexCount], BlockError> {
        debug_assert!(self.stats.rle());
        array(
            self.block,
            self.header.offset_tgt as usize,
            self.stats.count_vertex_tgt as usize,
        )
    }

    pub fn weights(&self) -> Result<Option<&'a [f32]>, BlockError> {
        if !self.weighted {
            return Ok(None);
        }
        array(
            self.block,
            self.header.offset_weight as usize,
            self.stats.count_edges as usize,
        )
        .map(Some)
    }
}

/// Size of an encoded edge block before file padding.
pub fn edge_block_bytes(stats: &TileStats, weighted: bool) -> usize {
    let src = 2 * stats.count_edges as usize;
    let tgt = if stats.rle() {
        std::mem::size_of::<VertexCount>() * stats.count_vertex_tgt as usize
    } else {
        src
    };
    let weight = if weighted {
        4 * stats.count_edges as usize
    } else {
        0
    };
    let mut cursor = std::mem::size_of::<EdgeBlockHeader>();
    cursor = align8(cursor + src);
    cursor = align8(cursor + tgt);
    cursor + weight
}

/// Encodes one tile's edge data (test fixtures and the offline-format
/// writer). Layout matches what `EdgeBlock::parse` expects.
pub fn encode_edge_block(
    block_id: u64,
    stats: &TileStats,
    src: &[u16],
    tgt_list: Option<&[u16]>,
    tgt_rle: Option<&[VertexCount]>,
    weights: Option<&[f32]>,
) -> Vec<u8> {
    assert_eq!(src.len(), stats.count_edges as usize);
    let mut block = vec![0u8; edge_block_bytes(stats, weights.is_some())];

    let offset_src = std::mem::size_of::<EdgeBlockHeader>();
    let src_bytes: &[u8] = bytemuck::cast_slice(src);
    let offset_tgt = align8(offset_src + src_bytes.len());
    let tgt_bytes: Vec<u8> = match (tgt_list, tgt_rle) {
        (Some(list), None) => {
            assert!(!stats.rle());
            bytemuck::cast_slice(list).to_vec()
        }
        (None, Some(runs)) => {
            assert!(stats.rle());
            assert_eq!(runs.len(), stats.count_vertex_tgt as usize);
            bytemuck::cast_slice(runs).to_vec()
        }
        _ => panic!("exactly one target stream encoding must be provided"),
    };
    let offset_weight = align8(offset_tgt + tgt_bytes.len());

    let header = EdgeBlockHeader {
        block_id,
        offset_src: offset_src as u32,
        offset_tgt: offset_tgt as u32,
        offset_weight: offset_weight as u32,
        reserved: 0,
    };
    block[..offset_src].copy_from_slice(bytemuck::bytes_of(&header));
    block[offset_src..offset_src + src_bytes.len()].copy_from_slice(src_bytes);
    block[offset_tgt..offset_tgt + tgt_bytes.len()].copy_from_slice(&tgt_bytes);
    if let Some(weights) = weights {
        let weight_bytes: &[u8] = bytemuck::cast_slice(weights);
        block[offset_weight..offset_weight + weight_bytes.len()].copy_from_slice(weight_bytes);
    }
    block
}

// ---------------------------------------------------------------------------
// Edge block index (meta file payload)
// ---------------------------------------------------------------------------

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pod, Zeroable)]
pub struct EdgeBlockIndexHeader {
    pub block_id: u64,
    pub count_src_vertices: u32,
    pub count_tgt_vertices: u32,
    pub offset_src_index: u32,
    pub offset_tgt_index: u32,
    /// Zero when the graph fits 32-bit global ids.
    pub offset_src_ext_bits: u32,
    pub offset_tgt_ext_bits: u32,
}

const_assert_eq!(std::mem::size_of::<EdgeBlockIndexHeader>(), 32);

/// Local-to-global id maps for one tile. When global ids need a 33rd bit,
/// two parallel bitsets carry the extension.
pub struct EdgeBlockIndex<'a> {
    pub header: EdgeBlockIndexHeader,
    block: &'a [u8],
    extended: bool,
}

impl<'a> EdgeBlockIndex<'a> {
    pub fn parse(block: &'a [u8], extended: bool) -> Result<Self, BlockError> {
        let parsed = header::<EdgeBlockIndexHeader>(block)?;
        Ok(Self {
            header: parsed,
            block,
            extended,
        })
    }

    pub fn src_index(&self) -> Result<&'a [u32], BlockError> {
        array(
            self.block,
            self.header.offset_src_index as usize,
            self.header.count_src_vertices as usize,
        )
    }

    pub fn tgt_index(&self) -> Result<&'a [u32], BlockError> {
        array(
            self.block,
            self.header.offset_tgt_index as usize,
            self.header.count_tgt_vertices as usize,
        )
    }

    fn ext_bits(&self, offset: u32, count: u32) -> Result<Option<&'a [u8]>, BlockError> {
        if !self.extended {
            return Ok(None);
        }
        array(self.block, offset as usize, bitset_len_bytes(count as usize)).map(Some)
    }

    pub fn src_ext_bits(&self) -> Result<Option<&'a [u8]>, BlockError> {
        self.ext_bits(
            self.header.offset_src_ext_bits,
            self.header.count_src_vertices,
        )
    }

    pub fn tgt_ext_bits(&self) -> Result<Option<&'a [u8]>, BlockError> {
        self.ext_bits(
            self.header.offset_tgt_ext_bits,
            self.header.count_tgt_vertices,
        )
    }
}

/// Global id from a 32-bit entry plus the optional extension bit.
pub fn resolve_id(index: &[u32], ext: Option<&[u8]>, i: usize) -> u64 {
    let low = index[i] as u64;
    match ext {
        Some(bits) if bits[i / 8] & (1 << (i % 8)) != 0 => low | (1 << 32),
        _ => low,
    }
}

pub fn index_block_bytes(count_src: u32, count_tgt: u32, extended: bool) -> usize {
    let mut cursor = std::mem::size_of::<EdgeBlockIndexHeader>();
    cursor = align8(cursor + 4 * count_src as usize);
    cursor = align8(cursor + 4 * count_tgt as usize);
    if extended {
        cursor = align8(cursor + bitset_len_bytes(count_src as usize));
        cursor = align8(cursor + bitset_len_bytes(count_tgt as usize));
    }
    cursor
}

pub fn encode_index_block(
    block_id: u64,
    src_index: &[u32],
    tgt_index: &[u32],
    ext: Option<(&[u8], &[u8])>,
) -> Vec<u8> {
    let mut block = vec![
        0u8;
        index_block_bytes(src_index.len() as u32, tgt_index.len() as u32, ext.is_some())
    ];

    let offset_src_index = std::mem::size_of::<EdgeBlockIndexHeader>();
    let offset_tgt_index = align8(offset_src_index + 4 * src_index.len());
    let mut cursor = align8(offset_tgt_index + 4 * tgt_index.len());
    let (offset_src_ext, offset_tgt_ext) = if let Some((src_ext, tgt_ext)) = ext {
        let src_at = cursor;
        cursor = align8(cursor + src_ext.len());
        let tgt_at = cursor;
        (src_at, tgt_at)
    } else {
        (0, 0)
    };

    let header = EdgeBlockIndexHeader {
        block_id,
        count_src_vertices: src_index.len() as u32,
        count_tgt_vertices: tgt_index.len() as u32,
        offset_src_index: offset_src_index as u32,
        offset_tgt_index: offset_tgt_index as u32,
        offset_src_ext_bits: offset_src_ext as u32,
        offset_tgt_ext_bits: offset_tgt_ext as u32,
    };
    block[..offset_src_index].copy_from_slice(bytemuck::bytes_of(&header));
    block[offset_src_index..offset_src_index + 4 * src_index.len()]
        .copy_from_slice(bytemuck::cast_slice(src_index));
    block[offset_tgt_index..offset_tgt_index + 4 * tgt_index.len()]
        .copy_from_slice(bytemuck::cast_slice(tgt_index));
    if let Some((src_ext, tgt_ext)) = ext {
        block[offset_src_ext..offset_src_ext + src_ext.len()].copy_from_slice(src_ext);
        block[offset_tgt_ext..offset_tgt_ext + tgt_ext.len()].copy_from_slice(tgt_ext);
    }
    block
}

// ---------------------------------------------------------------------------
// Vertex/edge tiles block (vertex fetcher -> tile processor)
// ---------------------------------------------------------------------------

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pod, Zeroable)]
pub struct VertexEdgeTilesHeader {
    pub shutdown: u8,
    pub sample_execution_time: u8,
    reserved: [u8; 6],
    pub magic_identifier: u64,
    pub block_id: u64,
    pub count_active_vertex_src: u32,
    pub count_active_vertex_tgt: u32,
    pub count_src_vertex_block: u32,
    pub count_tgt_vertex_block: u32,
    pub num_tile_partition: u32,
    pub tile_partition_id: u32,
    pub offset_active_vertices_src: u32,
    pub offset_active_vertices_tgt: u32,
    pub offset_src_degrees: u32,
    pub offset_tgt_degrees: u32,
    pub offset_source_vertices: u32,
    pub offset_extensions: u32,
}

const_assert_eq!(std::mem::size_of::<VertexEdgeTilesHeader>(), 72);

/// Which trailing arrays a tiles block carries, decided by the algorithm's
/// capability set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TilesBlockShape {
    pub active_src: bool,
    pub src_degrees: bool,
    pub tgt_degrees: bool,
    pub extension_bytes: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct TilesBlockLayout {
    pub shape: TilesBlockShape,
    pub count_src: u32,
    pub count_tgt: u32,
    pub offset_active_src: usize,
    pub offset_src_degrees: usize,
    pub offset_tgt_degrees: usize,
    pub offset_source_vertices: usize,
    pub offset_extensions: usize,
    pub total_bytes: usize,
}

impl TilesBlockLayout {
    pub fn compute(shape: TilesBlockShape, count_src: u32, count_tgt: u32, value_size: usize) -> Self {
        let mut cursor = std::mem::size_of::<VertexEdgeTilesHeader>();
        let offset_active_src = cursor;
        if shape.active_src {
            cursor = align8(cursor + bitset_len_bytes(count_src as usize));
        }
        let offset_src_degrees = cursor;
        if shape.src_degrees {
            cursor = align8(cursor + std::mem::size_of::<VertexDegree>() * count_src as usize);
        }
        let offset_tgt_degrees = cursor;
        if shape.tgt_degrees {
            cursor = align8(cursor + std::mem::size_of::<VertexDegree>() * count_tgt as usize);
        }
        let offset_source_vertices = cursor;
        cursor = align8(cursor + value_size * count_src as usize);
        let offset_extensions = cursor;
        cursor += shape.extension_bytes;
        Self {
            shape,
            count_src,
            count_tgt,
            offset_active_src,
            offset_src_degrees,
            offset_tgt_degrees,
            offset_source_vertices,
            offset_extensions,
            total_bytes: cursor,
        }
    }

    pub fn header(&self, block_id: u64, sample_execution_time: bool) -> VertexEdgeTilesHeader {
        VertexEdgeTilesHeader {
            shutdown: 0,
            sample_execution_time: sample_execution_time as u8,
            reserved: [0; 6],
            magic_identifier: MAGIC_IDENTIFIER,
            block_id,
            count_active_vertex_src: if self.shape.active_src {
                self.count_src
            } else {
                0
            },
            count_active_vertex_tgt: 0,
            count_src_vertex_block: self.count_src,
            count_tgt_vertex_block: self.count_tgt,
            num_tile_partition: 1,
            tile_partition_id: 0,
            offset_active_vertices_src: self.offset_active_src as u32,
            offset_active_vertices_tgt: 0,
            offset_src_degrees: self.offset_src_degrees as u32,
            offset_tgt_degrees: self.offset_tgt_degrees as u32,
            offset_source_vertices: self.offset_source_vertices as u32,
            offset_extensions: self.offset_extensions as u32,
        }
    }
}

/// Header-only shutdown marker for the tiles-data ring.
pub fn encode_tiles_shutdown_block(block: &mut [u8]) {
    let header = VertexEdgeTilesHeader {
        shutdown: 1,
        magic_identifier: MAGIC_IDENTIFIER,
        ..VertexEdgeTilesHeader::default()
    };
    block[..std::mem::size_of::<VertexEdgeTilesHeader>()]
        .copy_from_slice(bytemuck::bytes_of(&header));
}

pub const TILES_SHUTDOWN_BLOCK_BYTES: usize = std::mem::size_of::<VertexEdgeTilesHeader>();

pub struct VertexEdgeTilesBlock<'a> {
    pub header: VertexEdgeTilesHeader,
    block: &'a [u8],
}

impl<'a> VertexEdgeTilesBlock<'a> {
    /// Parses and checks the magic identifier.
    pub fn parse(block: &'a [u8]) -> Result<Self, BlockError> {
        let parsed = header::<VertexEdgeTilesHeader>(block)?;
        if parsed.magic_identifier != MAGIC_IDENTIFIER {
            return Err(BlockError::BadMagic {
                got: parsed.magic_identifier,
            });
        }
        Ok(Self {
            header: parsed,
            block,
        })
    }

    pub fn is_shutdown(&self) -> bool {
        self.header.shutdown != 0
    }

    pub fn active_src_bits(&self) -> Result<Option<&'a [u8]>, BlockError> {
        if self.header.count_active_vertex_src == 0 {
            return Ok(None);
        }
        array(
            self.block,
            self.header.offset_active_vertices_src as usize,
            bitset_len_bytes(self.header.count_active_vertex_src as usize),
        )
        .map(Some)
    }

    pub fn src_degrees(&self, present: bool) -> Result<Option<&'a [VertexDegree]>, BlockError> {
        if !present {
            return Ok(None);
        }
        array(
            self.block,
            self.header.offset_src_degrees as usize,
            self.header.count_src_vertex_block as usize,
        )
        .map(Some)
    }

    pub fn tgt_degrees(&self, present: bool) -> Result<Option<&'a [VertexDegree]>, BlockError> {
        if !present {
            return Ok(None);
        }
        array(
            self.block,
            self.header.offset_tgt_degrees as usize,
            self.header.count_tgt_vertex_block as usize,
        )
        .map(Some)
    }

    pub fn source_vertices<V: Pod>(&self) -> Result<&'a [V], BlockError> {
        array(
            self.block,
            self.header.offset_source_vertices as usize,
            self.header.count_src_vertex_block as usize,
        )
    }

    pub fn extensions(&self, len: usize) -> Result<&'a [u8], BlockError> {
        array(self.block, self.header.offset_extensions as usize, len)
    }
}

// ---------------------------------------------------------------------------
// Processed vertex block (tile processor -> vertex reducer)
// ---------------------------------------------------------------------------

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pod, Zeroable)]
pub struct ProcessedVertexHeader {
    pub shutdown: u8,
    pub sample_execution_time: u8,
    reserved: [u8; 2],
    pub count_edges: u32,
    pub processing_time_nano: u64,
    pub magic_identifier: u64,
    pub block_id: u64,
    pub count_active_vertex_src: u32,
    pub count_active_vertex_tgt: u32,
    pub count_tgt_vertex_block: u32,
    pub offset_active_vertices_src: u32,
    pub offset_active_vertices_tgt: u32,
    pub offset_vertices: u32,
}

const_assert_eq!(std::mem::size_of::<ProcessedVertexHeader>(), 56);

#[derive(Debug, Clone, Copy)]
pub struct ProcessedBlockLayout {
    pub count_active_src: u32,
    pub count_active_tgt: u32,
    pub count_tgt: u32,
    pub offset_active_src: usize,
    pub offset_active_tgt: usize,
    pub offset_vertices: usize,
    pub total_bytes: usize,
}

impl ProcessedBlockLayout {
    pub fn compute(
        count_active_src: u32,
        count_active_tgt: u32,
        count_tgt: u32,
        value_size: usize,
    ) -> Self {
        let mut cursor = std::mem::size_of::<ProcessedVertexHeader>();
        let offset_active_src = cursor;
        cursor = align8(cursor + bitset_len_bytes(count_active_src as usize));
        let offset_active_tgt = cursor;
        cursor = align8(cursor + bitset_len_bytes(count_active_tgt as usize));
        let offset_vertices = cursor;
        cursor = align8(cursor + value_size * count_tgt as usize);
        Self {
            count_active_src,
            count_active_tgt,
            count_tgt,
            offset_active_src,
            offset_active_tgt,
            offset_vertices,
            total_bytes: cursor,
        }
    }

    pub fn header(&self, block_id: u64) -> ProcessedVertexHeader {
        ProcessedVertexHeader {
            magic_identifier: MAGIC_IDENTIFIER,
            block_id,
            count_active_vertex_src: self.count_active_src,
            count_active_vertex_tgt: self.count_active_tgt,
            count_tgt_vertex_block: self.count_tgt,
            offset_active_vertices_src: self.offset_active_src as u32,
            offset_active_vertices_tgt: self.offset_active_tgt as u32,
            offset_vertices: self.offset_vertices as u32,
            ..ProcessedVertexHeader::default()
        }
    }
}

pub fn encode_processed_shutdown_block(block: &mut [u8]) {
    let header = ProcessedVertexHeader {
        shutdown: 1,
        magic_identifier: MAGIC_IDENTIFIER,
        ..ProcessedVertexHeader::default()
    };
    block[..std::mem::size_of::<ProcessedVertexHeader>()]
        .copy_from_slice(bytemuck::bytes_of(&header));
}

pub const PROCESSED_SHUTDOWN_BLOCK_BYTES: usize = std::mem::size_of::<ProcessedVertexHeader>();

pub struct ProcessedVertexBlock<'a> {
    pub header: ProcessedVertexHeader,
    block: &'a [u8],
}

impl<'a> ProcessedVertexBlock<'a> {
    pub fn parse(block: &'a [u8]) -> Result<Self, BlockError> {
        let parsed = header::<ProcessedVertexHeader>(block)?;
        if parsed.magic_identifier != MAGIC_IDENTIFIER {
            return Err(BlockError::BadMagic {
                got: parsed.magic_identifier,
            });
        }
        Ok(Self {
            header: parsed,
            block,
        })
    }

    pub fn is_shutdown(&self) -> bool {
        self.header.shutdown != 0
    }

    pub fn active_src_bits(&self) -> Result<Option<&'a [u8]>, BlockError> {
        if self.header.count_active_vertex_src == 0 {
            return Ok(None);
        }
        array(
            self.block,
            self.header.offset_active_vertices_src as usize,
            bitset_len_bytes(self.header.count_active_vertex_src as usize),
        )
        .map(Some)
    }

    pub fn active_tgt_bits(&self) -> Result<Option<&'a [u8]>, BlockError> {
        if self.header.count_active_vertex_tgt == 0 {
            return Ok(None);
        }
        array(
            self.block,
            self.header.offset_active_vertices_tgt as usize,
            bitset_len_bytes(self.header.count_active_vertex_tgt as usize),
        )
        .map(Some)
    }

    pub fn tgt_vertices<V: Pod>(&self) -> Result<&'a [V], BlockError> {
        array(
            self.block,
            self.header.offset_vertices as usize,
            self.header.count_tgt_vertex_block as usize,
        )
    }
}

// ---------------------------------------------------------------------------
// Processed vertex index block (vertex reducer -> global reducer)
// ---------------------------------------------------------------------------

/// One global reducer's share of a tile response: the target entries whose
/// stripe the reducer owns, with global ids already resolved, plus (on the
/// designated reducer only) the tile's source-index section for the
/// active-source pass.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pod, Zeroable)]
pub struct ProcessedIndexHeader {
    pub shutdown: u8,
    pub sample_execution_time: u8,
    /// Filler for a tile skipped by selective scheduling.
    pub dummy: u8,
    pub has_source_section: u8,
    pub count_edges: u32,
    pub processing_time_nano: u64,
    pub block_id: u64,
    pub count_tgt: u32,
    pub count_src: u32,
    pub offset_tgt_indices: u32,
    pub offset_tgt_values: u32,
    pub offset_active_tgt: u32,
    pub offset_src_indices: u32,
    pub offset_active_src: u32,
    reserved: u32,
}

const_assert_eq!(std::mem::size_of::<ProcessedIndexHeader>(), 56);

#[derive(Debug, Clone, Copy)]
pub struct ProcessedIndexLayout {
    pub count_tgt: u32,
    pub count_src: u32,
    pub with_active_tgt: bool,
    pub with_source_section: bool,
    pub offset_tgt_indices: usize,
    pub offset_tgt_values: usize,
    pub offset_active_tgt: usize,
    pub offset_src_indices: usize,
    pub offset_active_src: usize,
    pub total_bytes: usize,
}

impl ProcessedIndexLayout {
    pub fn compute(
        count_tgt: u32,
        count_src: u32,
        with_active_tgt: bool,
        with_source_section: bool,
        value_size: usize,
    ) -> Self {
        let mut cursor = std::mem::size_of::<ProcessedIndexHeader>();
        let offset_tgt_indices = cursor;
        cursor = align8(cursor + 8 * count_tgt as usize);
        let offset_tgt_values = cursor;
        cursor = align8(cursor + value_size * count_tgt as usize);
        let offset_active_tgt = cursor;
        if with_active_tgt {
            cursor = align8(cursor + bitset_len_bytes(count_tgt as usize));
        }
        let offset_src_indices = cursor;
        let offset_active_src;
        if with_source_section {
            cursor = align8(cursor + 8 * count_src as usize);
            offset_active_src = cursor;
            cursor = align8(cursor + bitset_len_bytes(count_src as usize));
        } else {
            offset_active_src = cursor;
        }
        Self {
            count_tgt,
            count_src,
            with_active_tgt,
            with_source_section,
            offset_tgt_indices,
            offset_tgt_values,
            offset_active_tgt,
            offset_src_indices,
            offset_active_src,
            total_bytes: cursor,
        }
    }

    pub fn header(&self, block_id: u64) -> ProcessedIndexHeader {
        ProcessedIndexHeader {
            has_source_section: self.with_source_section as u8,
            block_id,
            count_tgt: self.count_tgt,
            count_src: if self.with_source_section {
                self.count_src
            } else {
                0
            },
            offset_tgt_indices: self.offset_tgt_indices as u32,
            offset_tgt_values: self.offset_tgt_values as u32,
            offset_active_tgt: if self.with_active_tgt {
                self.offset_active_tgt as u32
            } else {
                0
            },
            offset_src_indices: self.offset_src_indices as u32,
            offset_active_src: self.offset_active_src as u32,
            ..ProcessedIndexHeader::default()
        }
    }
}

pub fn encode_reduce_shutdown_block(block: &mut [u8]) {
    let header = ProcessedIndexHeader {
        shutdown: 1,
        ..ProcessedIndexHeader::default()
    };
    block[..std::mem::size_of::<ProcessedIndexHeader>()]
        .copy_from_slice(bytemuck::bytes_of(&header));
}

pub fn encode_reduce_dummy_block(block: &mut [u8], block_id: u64) {
    let header = ProcessedIndexHeader {
        dummy: 1,
        block_id,
        ..ProcessedIndexHeader::default()
    };
    block[..std::mem::size_of::<ProcessedIndexHeader>()]
        .copy_from_slice(bytemuck::bytes_of(&header));
}

pub const REDUCE_CONTROL_BLOCK_BYTES: usize = std::mem::size_of::<ProcessedIndexHeader>();

pub struct ProcessedIndexBlock<'a> {
    pub header: ProcessedIndexHeader,
    block: &'a [u8],
}

impl<'a> ProcessedIndexBlock<'a> {
    pub fn parse(block: &'a [u8]) -> Result<Self, BlockError> {
        let parsed = header::<ProcessedIndexHeader>(block)?;
        Ok(Self {
            header: parsed,
            block,
        })
    }

    pub fn is_shutdown(&self) -> bool {
        self.header.shutdown != 0
    }

    pub fn is_dummy(&self) -> bool {
        self.header.dummy != 0
    }

    pub fn tgt_indices(&self) -> Result<&'a [u64], BlockError> {
        array(
            self.block,
            self.header.offset_tgt_indices as usize,
            self.header.count_tgt as usize,
        )
    }

    pub fn tgt_values<V: Pod>(&self) -> Result<&'a [V], BlockError> {
        array(
            self.block,
            self.header.offset_tgt_values as usize,
            self.header.count_tgt as usize,
        )
    }

    pub fn active_tgt_bits(&self) -> Result<Option<&'a [u8]>, BlockError> {
        if self.header.offset_active_tgt == 0 {
            return Ok(None);
        }
        array(
            self.block,
            self.header.offset_active_tgt as usize,
            bitset_len_bytes(self.header.count_tgt as usize),
        )
        .map(Some)
    }

    pub fn src_indices(&self) -> Result<Option<&'a [u64]>, BlockError> {
        if self.header.has_source_section == 0 {
            return Ok(None);
        }
        array(
            self.block,
            self.header.offset_src_indices as usize,
            self.header.count_src as usize,
        )
        .map(Some)
    }

    pub fn active_src_bits(&self) -> Result<Option<&'a [u8]>, BlockError> {
        if self.header.has_source_section == 0 {
            return Ok(None);
        }
        array(
            self.block,
            self.header.offset_active_src as usize,
            bitset_len_bytes(self.header.count_src as usize),
        )
        .map(Some)
    }
}

// ---------------------------------------------------------------------------
// Active tiles message (vertex domain -> edge engine)
// ---------------------------------------------------------------------------

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pod, Zeroable)]
pub struct ActiveTilesHeader {
    pub shutdown: u8,
    reserved: [u8; 7],
    pub count_active_tiles: u64,
}

const_assert_eq!(std::mem::size_of::<ActiveTilesHeader>(), 16);

impl ActiveTilesHeader {
    pub fn new(shutdown: bool, count_active_tiles: u64) -> Self {
        Self {
            shutdown: shutdown as u8,
            reserved: [0; 7],
            count_active_tiles,
        }
    }
}

pub fn active_tiles_block_bytes(count_tiles: usize) -> usize {
    std::mem::size_of::<ActiveTilesHeader>() + bitset_len_bytes(count_tiles)
}

pub struct ActiveTilesBlock<'a> {
    pub header: ActiveTilesHeader,
    block: &'a [u8],
}

impl<'a> ActiveTilesBlock<'a> {
    pub fn parse(block: &'a [u8]) -> Result<Self, BlockError> {
        let parsed = header::<ActiveTilesHeader>(block)?;
        Ok(Self {
            header: parsed,
            block,
        })
    }

    pub fn is_shutdown(&self) -> bool {
        self.header.shutdown != 0
    }

    pub fn tile_bits(&self) -> &'a [u8] {
        &self.block[std::mem::size_of::<ActiveTilesHeader>()..]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ringbuf::{ByteRing, Mode};

    fn stats(count_edges: u32, count_src: u32, count_tgt: u32, rle: bool) -> TileStats {
        TileStats::new(0, count_src, count_tgt, count_edges, rle)
    }

    /// Stages encoded bytes in a ring element so views see the same
    /// alignment they get at runtime.
    fn in_ring(bytes: &[u8], check: impl FnOnce(&[u8])) {
        let ring = ByteRing::with_capacity(1 << 20, 4096);
        let mut guard = ring.put(bytes.len(), Mode::NonBlocking).unwrap();
        guard.copy_from_slice(bytes);
        let element = guard.publish();
        check(&element);
    }

    #[test]
    fn edge_block_round_trip_list() {
        let tile_stats = stats(3, 4, 4, false);
        let encoded = encode_edge_block(
            9,
            &tile_stats,
            &[0, 1, 2],
            Some(&[3, 3, 1]),
            None,
            Some(&[0.5, 1.5, 2.5]),
        );
        in_ring(&encoded, |block| {
            let view = EdgeBlock::parse(block, tile_stats, true).unwrap();
            assert_eq!(view.header.block_id, 9);
            assert_eq!(view.src().unwrap(), &[0, 1, 2]);
            assert_eq!(view.tgt_list().unwrap(), &[3, 3, 1]);
            assert_eq!(view.weights().unwrap().unwrap(), &[0.5, 1.5, 2.5]);
        });
    }

    #[test]
    fn edge_block_round_trip_rle() {
        let tile_stats = stats(5, 5, 2, true);
        let runs = [
            VertexCount { count: 2, id: 3 },
            VertexCount { count: 3, id: 7 },
        ];
        let encoded = encode_edge_block(1, &tile_stats, &[10, 11, 20, 21, 22], None, Some(&runs), None);
        in_ring(&encoded, |block| {
            let view = EdgeBlock::parse(block, tile_stats, false).unwrap();
            assert_eq!(view.tgt_rle().unwrap(), &runs);
            assert_eq!(view.weights().unwrap(), None);
        });
    }

    #[test]
    fn index_block_resolves_extension_bit() {
        let src_index = [100u32, 200, 300];
        let tgt_index = [7u32, 8];
        // Bit 1 of the src extension set: vertex 200 lives above 2^32.
        let src_ext = [0b0000_0010u8];
        let tgt_ext = [0u8];
        let encoded = encode_index_block(4, &src_index, &tgt_index, Some((&src_ext, &tgt_ext)));
        in_ring(&encoded, |block| {
            let view = EdgeBlockIndex::parse(block, true).unwrap();
            let index = view.src_index().unwrap();
            let ext = view.src_ext_bits().unwrap();
            assert_eq!(resolve_id(index, ext, 0), 100);
            assert_eq!(resolve_id(index, ext, 1), 200 + (1u64 << 32));
            assert_eq!(resolve_id(index, ext, 2), 300);
            assert_eq!(view.tgt_index().unwrap(), &tgt_index);
        });
    }

    #[test]
    fn tiles_block_magic_is_checked() {
        let mut block = vec![0u8; TILES_SHUTDOWN_BLOCK_BYTES];
        encode_tiles_shutdown_block(&mut block);
        in_ring(&block, |bytes| {
            assert!(VertexEdgeTilesBlock::parse(bytes).unwrap().is_shutdown());
        });

        // Corrupt the magic.
        block[8] ^= 0xFF;
        in_ring(&block, |bytes| {
            assert!(matches!(
                VertexEdgeTilesBlock::parse(bytes),
                Err(BlockError::BadMagic { .. })
            ));
        });
    }

    #[test]
    fn tiles_block_layout_places_all_sections() {
        let shape = TilesBlockShape {
            active_src: true,
            src_degrees: true,
            tgt_degrees: true,
            extension_bytes: 16,
        };
        let layout = TilesBlockLayout::compute(shape, 100, 50, 8);
        let header = layout.header(3, true);
        assert_eq!(header.count_active_vertex_src, 100);
        assert!(header.offset_src_degrees > header.offset_active_vertices_src);
        assert!(header.offset_tgt_degrees > header.offset_src_degrees);
        assert!(header.offset_source_vertices > header.offset_tgt_degrees);
        assert_eq!(
            layout.total_bytes,
            layout.offset_extensions + shape.extension_bytes
        );
        assert_eq!(layout.offset_source_vertices % 8, 0);
    }

    #[test]
    fn processed_index_block_sections_follow_flags() {
        let layout = ProcessedIndexLayout::compute(3, 2, true, true, 8);
        let mut bytes = vec![0u8; layout.total_bytes];
        let header = layout.header(5);
        bytes[..std::mem::size_of::<ProcessedIndexHeader>()]
            .copy_from_slice(bytemuck::bytes_of(&header));
        in_ring(&bytes, |block| {
            let view = ProcessedIndexBlock::parse(block).unwrap();
            assert_eq!(view.header.block_id, 5);
            assert_eq!(view.tgt_indices().unwrap().len(), 3);
            assert!(view.active_tgt_bits().unwrap().is_some());
            assert_eq!(view.src_indices().unwrap().unwrap().len(), 2);
        });

        let bare = ProcessedIndexLayout::compute(3, 2, false, false, 8);
        let mut bytes = vec![0u8; bare.total_bytes];
        bytes[..std::mem::size_of::<ProcessedIndexHeader>()]
            .copy_from_slice(bytemuck::bytes_of(&bare.header(5)));
        in_ring(&bytes, |block| {
            let view = ProcessedIndexBlock::parse(block).unwrap();
            assert!(view.active_tgt_bits().unwrap().is_none());
            assert!(view.src_indices().unwrap().is_none());
        });
    }

    #[test]
    fn dummy_and_shutdown_markers_parse_back() {
        let mut block = vec![0u8; REDUCE_CONTROL_BLOCK_BYTES];
        encode_reduce_dummy_block(&mut block, 42);
        in_ring(&block, |bytes| {
            let view = ProcessedIndexBlock::parse(bytes).unwrap();
            assert!(view.is_dummy());
            assert!(!view.is_shutdown());
            assert_eq!(view.header.block_id, 42);
        });

        encode_reduce_shutdown_block(&mut block);
        in_ring(&block, |bytes| {
            assert!(ProcessedIndexBlock::parse(bytes).unwrap().is_shutdown());
        });
    }

    #[test]
    fn truncated_block_is_rejected() {
        let short = [0u8; 10];
        assert!(matches!(
            VertexEdgeTilesBlock::parse(&short),
            Err(BlockError::Truncated { .. })
        ));
    }
}
