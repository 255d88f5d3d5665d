//! Vertex programs and their capability set.
//!
//! An algorithm declares which per-tile blocks it needs (active-source
//! input, active bitsets, degree blocks) and provides the per-edge
//! pull-gather, the per-vertex reduce, and the end-of-iteration apply. The
//! pipeline reads the capability flags to size blocks and decide which
//! bitsets and degree arrays ride along with each tile.

use bitflags::bitflags;
use bytemuck::Pod;
use model::{VertexDegree, VertexId};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AlgorithmFlags: u32 {
        /// Skip edges whose source is inactive this iteration.
        const NEED_ACTIVE_SOURCE_INPUT = 1 << 0;
        /// Gather emits next-iteration source activations.
        const NEED_ACTIVE_SOURCE_BLOCK = 1 << 1;
        /// Gather emits next-iteration target activations.
        const NEED_ACTIVE_TARGET_BLOCK = 1 << 2;
        const NEED_DEGREES_SOURCE_BLOCK = 1 << 3;
        const NEED_DEGREES_TARGET_BLOCK = 1 << 4;
    }
}

/// Per-edge context handed to the gather kernel. Local bitsets are private
/// to the calling thread; the merge step folds them afterwards.
pub struct GatherContext<'a> {
    pub src_id: u16,
    pub tgt_id: u16,
    pub src_degree: Option<&'a VertexDegree>,
    pub tgt_degree: Option<&'a VertexDegree>,
    pub active_src_next: Option<&'a mut [u8]>,
    pub active_tgt_next: Option<&'a mut [u8]>,
    pub extensions: &'a [u8],
}

impl GatherContext<'_> {
    pub fn mark_src_active_next(&mut self) {
        if let Some(bits) = self.active_src_next.as_deref_mut() {
            let id = self.src_id as usize;
            bits[id / 8] |= 1 << (id % 8);
        }
    }

    pub fn mark_tgt_active_next(&mut self) {
        if let Some(bits) = self.active_tgt_next.as_deref_mut() {
            let id = self.tgt_id as usize;
            bits[id / 8] |= 1 << (id % 8);
        }
    }
}

/// Outcome of the end-of-iteration apply for one vertex.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyOutcome {
    /// Participate in the next iteration (drives selective scheduling).
    pub activate: bool,
    /// Value moved beyond the algorithm's tolerance.
    pub changed: bool,
}

/// A pull-style vertex program.
///
/// `Value` lives inside ring payloads and on-disk dumps, hence `Pod`. The
/// reduce must be commutative and associative: partial blocks from follower
/// threads and striped reducers fold in arbitrary order.
pub trait VertexProgram: Send + Sync + 'static {
    type Value: Pod + PartialEq + std::fmt::Debug + Send + Sync;

    const FLAGS: AlgorithmFlags;

    /// Initial `current[]` value.
    fn init_vertex(&self, vertex: VertexId) -> Self::Value;

    /// Seed membership in iteration 0's active set.
    fn initially_active(&self, vertex: VertexId) -> bool;

    /// Identity of the reduce; fills freshly reset accumulators.
    fn gather_identity(&self) -> Self::Value;

    /// Resets a tile's target accumulator before gathering.
    fn reset_tile_targets(&self, targets: &mut [Self::Value]) {
        targets.fill(self.gather_identity());
    }

    fn pull_gather(
        &self,
        src: &Self::Value,
        tgt: &mut Self::Value,
        ctx: &mut GatherContext<'_>,
    );

    /// Weighted variant; unweighted algorithms ignore the weight.
    fn pull_gather_weighted(
        &self,
        src: &Self::Value,
        tgt: &mut Self::Value,
        _weight: f32,
        ctx: &mut GatherContext<'_>,
    ) {
        self.pull_gather(src, tgt, ctx);
    }

    /// Folds one partial accumulator into the global `next[]` cell.
    fn reduce_vertex(
        &self,
        out: &mut Self::Value,
        incoming: &Self::Value,
        vertex: VertexId,
        degree: VertexDegree,
    );

    /// Finalizes `next[]` from the reduced accumulator at iteration end.
    /// `current` is the vertex's value entering the iteration.
    fn apply(
        &self,
        current: &Self::Value,
        reduced: &mut Self::Value,
        vertex: VertexId,
        degree: VertexDegree,
        iteration: u64,
    ) -> ApplyOutcome;
}

// ---------------------------------------------------------------------------
// PageRank
// ---------------------------------------------------------------------------

/// Uniform PageRank under the closed-world assumption: contributions are
/// `rank / out_degree`, finalized as `(1 - d) / N + d * sum`.
#[derive(Debug, Clone)]
pub struct PageRank {
    pub count_vertices: u64,
    pub damping: f32,
    pub tolerance: f32,
}

impl PageRank {
    pub fn new(count_vertices: u64) -> Self {
        Self {
            count_vertices,
            damping: 0.85,
            tolerance: 1e-6,
        }
    }
}

impl VertexProgram for PageRank {
    type Value = f32;

    const FLAGS: AlgorithmFlags = AlgorithmFlags::NEED_DEGREES_SOURCE_BLOCK;

    fn init_vertex(&self, _vertex: VertexId) -> f32 {
        1.0 / self.count_vertices as f32
    }

    fn initially_active(&self, _vertex: VertexId) -> bool {
        true
    }

    fn gather_identity(&self) -> f32 {
        0.0
    }

    fn pull_gather(&self, src: &f32, tgt: &mut f32, ctx: &mut GatherContext<'_>) {
        let out_degree = ctx
            .src_degree
            .map(|degree| degree.out_degree)
            .unwrap_or(0);
        if out_degree > 0 {
            *tgt += *src / out_degree as f32;
        }
    }

    fn reduce_vertex(&self, out: &mut f32, incoming: &f32, _vertex: VertexId, _degree: VertexDegree) {
        *out += *incoming;
    }

    fn apply(
        &self,
        current: &f32,
        reduced: &mut f32,
        _vertex: VertexId,
        _degree: VertexDegree,
        _iteration: u64,
    ) -> ApplyOutcome {
        let rank = (1.0 - self.damping) / self.count_vertices as f32 + self.damping * *reduced;
        let changed = (rank - *current).abs() > self.tolerance;
        *reduced = rank;
        ApplyOutcome {
            activate: changed,
            changed,
        }
    }
}

// ---------------------------------------------------------------------------
// Reachability (BFS-like frontier expansion)
// ---------------------------------------------------------------------------

/// Marks every vertex reachable from a set of roots. The frontier is the
/// active set; converged components stop producing active tiles.
#[derive(Debug, Clone)]
pub struct Reachability {
    pub roots: Vec<VertexId>,
}

impl Reachability {
    pub fn from_root(root: VertexId) -> Self {
        Self { roots: vec![root] }
    }
}

impl VertexProgram for Reachability {
    type Value = u8;

    const FLAGS: AlgorithmFlags = AlgorithmFlags::NEED_ACTIVE_SOURCE_INPUT
        .union(AlgorithmFlags::NEED_ACTIVE_SOURCE_BLOCK)
        .union(AlgorithmFlags::NEED_ACTIVE_TARGET_BLOCK);

    fn init_vertex(&self, vertex: VertexId) -> u8 {
        self.roots.contains(&vertex) as u8
    }

    fn initially_active(&self, vertex: VertexId) -> bool {
        self.roots.contains(&vertex)
    }

    fn gather_identity(&self) -> u8 {
        0
    }

    fn pull_gather(&self, src: &u8, tgt: &mut u8, ctx: &mut GatherContext<'_>) {
        if *src != 0 {
            if *tgt == 0 {
                ctx.mark_tgt_active_next();
            }
            *tgt = 1;
        }
    }

    fn reduce_vertex(&self, out: &mut u8, incoming: &u8, _vertex: VertexId, _degree: VertexDegree) {
        *out |= *incoming;
    }

    fn apply(
        &self,
        current: &u8,
        reduced: &mut u8,
        _vertex: VertexId,
        _degree: VertexDegree,
        _iteration: u64,
    ) -> ApplyOutcome {
        let reached = *current | *reduced;
        let newly_reached = reached != 0 && *current == 0;
        *reduced = reached;
        ApplyOutcome {
            activate: newly_reached,
            changed: newly_reached,
        }
    }
}

// ---------------------------------------------------------------------------
// Single-source shortest paths
// ---------------------------------------------------------------------------

/// Label-correcting SSSP over non-negative edge weights.
#[derive(Debug, Clone)]
pub struct ShortestPaths {
    pub source: VertexId,
}

impl ShortestPaths {
    pub fn new(source: VertexId) -> Self {
        Self { source }
    }
}

impl VertexProgram for ShortestPaths {
    type Value = f32;

    const FLAGS: AlgorithmFlags = AlgorithmFlags::NEED_ACTIVE_SOURCE_INPUT
        .union(AlgorithmFlags::NEED_ACTIVE_SOURCE_BLOCK)
        .union(AlgorithmFlags::NEED_ACTIVE_TARGET_BLOCK);

    fn init_vertex(&self, vertex: VertexId) -> f32 {
        if vertex == self.source { 0.0 } else { f32::INFINITY }
    }

    fn initially_active(&self, vertex: VertexId) -> bool {
        vertex == self.source
    }

    fn gather_identity(&self) -> f32 {
        f32::INFINITY
    }

    fn pull_gather(&self, src: &f32, tgt: &mut f32, ctx: &mut GatherContext<'_>) {
        self.pull_gather_weighted(src, tgt, 1.0, ctx);
    }

    fn pull_gather_weighted(
        &self,
        src: &f32,
        tgt: &mut f32,
        weight: f32,
        ctx: &mut GatherContext<'_>,
    ) {
        let relaxed = *src + weight;
        if relaxed < *tgt {
            *tgt = relaxed;
            ctx.mark_tgt_active_next();
        }
    }

    fn reduce_vertex(&self, out: &mut f32, incoming: &f32, _vertex: VertexId, _degree: VertexDegree) {
        *out = out.min(*incoming);
    }

    fn apply(
        &self,
        current: &f32,
        reduced: &mut f32,
        _vertex: VertexId,
        _degree: VertexDegree,
        _iteration: u64,
    ) -> ApplyOutcome {
        let distance = current.min(*reduced);
        let improved = distance < *current;
        *reduced = distance;
        ApplyOutcome {
            activate: improved,
            changed: improved,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn ctx<'a>(src_id: u16, tgt_id: u16, src_degree: Option<&'a VertexDegree>) -> GatherContext<'a> {
        GatherContext {
            src_id,
            tgt_id,
            src_degree,
            tgt_degree: None,
            active_src_next: None,
            active_tgt_next: None,
            extensions: &[],
        }
    }

    #[test]
    fn pagerank_gather_divides_by_out_degree() {
        let pagerank = PageRank::new(5);
        let degree = VertexDegree {
            in_degree: 0,
            out_degree: 2,
        };
        let mut accumulator = pagerank.gather_identity();
        pagerank.pull_gather(&0.2, &mut accumulator, &mut ctx(0, 1, Some(&degree)));
        pagerank.pull_gather(&0.2, &mut accumulator, &mut ctx(2, 1, Some(&degree)));
        assert_relative_eq!(accumulator, 0.2);
    }

    #[test]
    fn pagerank_apply_conserves_dangling_free_rank() {
        // A 2-cycle: every vertex keeps receiving the full rank mass.
        let pagerank = PageRank::new(2);
        let mut reduced = 0.5f32;
        let outcome = pagerank.apply(&0.5, &mut reduced, 0, VertexDegree::default(), 0);
        assert_relative_eq!(reduced, 0.15 / 2.0 + 0.85 * 0.5);
        assert!(!outcome.changed || (reduced - 0.5).abs() > pagerank.tolerance);
    }

    #[test]
    fn reachability_marks_targets_active_once() {
        let reachability = Reachability::from_root(0);
        let mut active_tgt = [0u8; 1];
        let mut context = GatherContext {
            active_tgt_next: Some(&mut active_tgt),
            ..ctx(0, 3, None)
        };
        let mut target = 0u8;
        reachability.pull_gather(&1, &mut target, &mut context);
        assert_eq!(target, 1);
        assert_eq!(active_tgt[0], 0b0000_1000);
    }

    #[test]
    fn reachability_apply_activates_only_new_vertices() {
        let reachability = Reachability::from_root(0);

        let mut reduced = 1u8;
        let outcome = reachability.apply(&0, &mut reduced, 1, VertexDegree::default(), 0);
        assert_eq!(reduced, 1);
        assert!(outcome.activate);

        let mut reduced = 1u8;
        let outcome = reachability.apply(&1, &mut reduced, 1, VertexDegree::default(), 1);
        assert!(!outcome.activate);
    }

    #[test]
    fn sssp_relaxes_and_keeps_minimum() {
        let sssp = ShortestPaths::new(0);
        let mut target = f32::INFINITY;
        sssp.pull_gather_weighted(&2.0, &mut target, 1.5, &mut ctx(0, 1, None));
        assert_relative_eq!(target, 3.5);
        sssp.pull_gather_weighted(&2.0, &mut target, 5.0, &mut ctx(0, 1, None));
        assert_relative_eq!(target, 3.5);

        let mut out = 4.0f32;
        sssp.reduce_vertex(&mut out, &3.5, 1, VertexDegree::default());
        assert_relative_eq!(out, 3.5);
    }

    #[test]
    fn reduce_is_commutative_for_all_programs() {
        let pagerank = PageRank::new(4);
        let mut a = 0.0f32;
        let mut b = 0.0f32;
        for value in [0.1f32, 0.2, 0.3] {
            pagerank.reduce_vertex(&mut a, &value, 0, VertexDegree::default());
        }
        for value in [0.3f32, 0.1, 0.2] {
            pagerank.reduce_vertex(&mut b, &value, 0, VertexDegree::default());
        }
        assert_relative_eq!(a, b);
    }
}
