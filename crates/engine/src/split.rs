//! Adaptive tile-partition split point.
//!
//! Tile processors sample roughly 1% of tiles and ship `(edges, nanos)`
//! pairs back in their response headers; global reducer 0 folds them into a
//! moving average edge rate and republishes the break point. Publication is
//! an observable value with a single writer and many readers, not a shared
//! global mutable.

use arc_swap::ArcSwap;
use std::sync::Arc;

use model::{INIT_TILE_BREAK_POINT, MAX_TILE_BREAK_POINT, MIN_TILE_BREAK_POINT};

/// Wall time one tile partition should cost at the estimated edge rate.
const TILE_PARTITION_TARGET_NANOS: f64 = 2_500_000.0;

/// Hard cap on partitions per tile; keeps degenerate samples from turning a
/// tile into thousands of barrier rounds.
pub const MAX_TILE_PARTITIONS: u32 = 64;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BreakPointEstimate {
    /// Target edges per tile partition, clamped to the configured band.
    pub edges_per_partition: u64,
    /// Moving average rate in edges per nanosecond.
    pub edge_rate: f64,
    pub samples: u64,
}

#[derive(Debug)]
pub struct TileBreakPoint {
    estimate: ArcSwap<BreakPointEstimate>,
}

impl Default for TileBreakPoint {
    fn default() -> Self {
        Self::new()
    }
}

impl TileBreakPoint {
    pub fn new() -> Self {
        Self {
            estimate: ArcSwap::from_pointee(BreakPointEstimate {
                edges_per_partition: INIT_TILE_BREAK_POINT,
                edge_rate: 1.0,
                samples: 0,
            }),
        }
    }

    pub fn current(&self) -> BreakPointEstimate {
        **self.estimate.load()
    }

    /// Partition count for a tile of `count_edges` edges at the current
    /// break point.
    pub fn partition_count(&self, count_edges: u32) -> u32 {
        let per_partition = self.current().edges_per_partition.max(1);
        let partitions = (count_edges as u64).div_ceil(per_partition) as u32;
        partitions.clamp(1, MAX_TILE_PARTITIONS)
    }

    /// Folds one sampled tile into the moving average. Single writer
    /// (global reducer 0); readers pick the new estimate up on their next
    /// load.
    pub fn record_sample(&self, count_edges: u32, nanos: u64) {
        if nanos == 0 {
            return;
        }
        let previous = self.current();
        let sample_rate = count_edges as f64 / nanos as f64;
        let samples = previous.samples + 1;
        let edge_rate =
            previous.edge_rate * (previous.samples as f64 / samples as f64) + sample_rate / samples as f64;
        let edges_per_partition = ((edge_rate * TILE_PARTITION_TARGET_NANOS) as u64)
            .clamp(MIN_TILE_BREAK_POINT, MAX_TILE_BREAK_POINT);
        self.estimate.store(Arc::new(BreakPointEstimate {
            edges_per_partition,
            edge_rate,
            samples,
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_count_tracks_the_break_point() {
        let break_point = TileBreakPoint::new();
        assert_eq!(break_point.partition_count(0), 1);
        assert_eq!(break_point.partition_count(100), 1);
        assert_eq!(
            break_point.partition_count(2 * INIT_TILE_BREAK_POINT as u32 + 1),
            3
        );
    }

    #[test]
    fn slow_samples_pull_the_break_point_down() {
        let break_point = TileBreakPoint::new();
        // 1000 edges in 10ms: 1e-4 edges/ns, far below the initial 1.0.
        for _ in 0..50 {
            break_point.record_sample(1_000, 10_000_000);
        }
        let estimate = break_point.current();
        assert!(estimate.edge_rate < 1.0);
        assert_eq!(estimate.edges_per_partition, MIN_TILE_BREAK_POINT);
        assert_eq!(estimate.samples, 50);
    }

    #[test]
    fn estimate_stays_within_the_clamp_band() {
        let break_point = TileBreakPoint::new();
        break_point.record_sample(u32::MAX, 1);
        assert_eq!(
            break_point.current().edges_per_partition,
            MAX_TILE_BREAK_POINT
        );
    }

    #[test]
    fn zero_duration_samples_are_ignored() {
        let break_point = TileBreakPoint::new();
        break_point.record_sample(100, 0);
        assert_eq!(break_point.current().samples, 0);
    }
}
