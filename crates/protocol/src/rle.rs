//! Cursor over a run-length-encoded target stream.
//!
//! The tgt column of a tile is encoded as `(count, local_tgt_id)` runs whose
//! counts sum to the tile's edge count; a count of 0 decodes to 65 536. The
//! edge loop consumes one run position per edge and must keep the cursor in
//! lockstep even for edges it skips (inactive sources, other threads'
//! stripes), so the cursor supports bulk advancement.

use model::VertexCount;

#[derive(Debug, Clone, Copy)]
pub struct RleCursor<'a> {
    runs: &'a [VertexCount],
    run_index: usize,
    /// Edges already consumed from the current run.
    within: u32,
}

impl<'a> RleCursor<'a> {
    /// Positions the cursor on edge `start` of the stream.
    pub fn at(runs: &'a [VertexCount], start: u32) -> Self {
        let mut cursor = Self {
            runs,
            run_index: 0,
            within: 0,
        };
        cursor.advance(start);
        cursor
    }

    /// Local target id of the edge under the cursor.
    pub fn current_id(&self) -> u16 {
        self.runs[self.run_index].id
    }

    pub fn advance_one(&mut self) {
        self.advance(1);
    }

    /// Moves the cursor `count` edges forward. Advancing past the end of the
    /// stream parks the cursor one past the last run; it must not be read
    /// there.
    pub fn advance(&mut self, count: u32) {
        self.within += count;
        while self.run_index < self.runs.len() {
            let run_len = self.runs[self.run_index].run_len();
            if self.within < run_len {
                return;
            }
            self.within -= run_len;
            self.run_index += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runs(pairs: &[(u16, u16)]) -> Vec<VertexCount> {
        pairs
            .iter()
            .map(|&(count, id)| VertexCount { count, id })
            .collect()
    }

    #[test]
    fn walks_runs_in_order() {
        let stream = runs(&[(2, 3), (3, 7)]);
        let mut cursor = RleCursor::at(&stream, 0);
        let mut ids = Vec::new();
        for _ in 0..5 {
            ids.push(cursor.current_id());
            cursor.advance_one();
        }
        assert_eq!(ids, [3, 3, 7, 7, 7]);
    }

    #[test]
    fn seeks_into_the_middle_of_a_run() {
        let stream = runs(&[(2, 3), (3, 7), (1, 9)]);
        let cursor = RleCursor::at(&stream, 4);
        assert_eq!(cursor.current_id(), 7);
        let cursor = RleCursor::at(&stream, 5);
        assert_eq!(cursor.current_id(), 9);
    }

    #[test]
    fn bulk_advance_matches_single_steps() {
        let stream = runs(&[(1, 0), (4, 1), (2, 2), (3, 5)]);
        let mut stepped = RleCursor::at(&stream, 0);
        for _ in 0..7 {
            stepped.advance_one();
        }
        let jumped = RleCursor::at(&stream, 7);
        assert_eq!(stepped.current_id(), jumped.current_id());
    }

    #[test]
    fn count_zero_decodes_to_max_run() {
        let stream = runs(&[(0, 1), (1, 2)]);
        let cursor = RleCursor::at(&stream, 65_535);
        assert_eq!(cursor.current_id(), 1);
        let cursor = RleCursor::at(&stream, 65_536);
        assert_eq!(cursor.current_id(), 2);
    }
}
