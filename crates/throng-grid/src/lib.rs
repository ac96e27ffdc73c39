//! Uniform spatial hash grid primitives for the throng crowd engine.
//!
//! The grid covers an origin-centered square of `width × width` cells. Agents
//! are bucketed by a linear cell id derived from their predicted position,
//! the agent array is sorted by that id with a parallel bitonic network, and
//! a [`CellTable`] maps every cell id to the `[start, end)` run it occupies
//! in the sorted array. Padding slots carry [`SENTINEL_CELL`] so they always
//! sort behind real agents and never appear in the table.

use glam::Vec3;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::TryReserveError;
use thiserror::Error;

/// Cell id assigned to padding slots; compares greater than every real cell.
pub const SENTINEL_CELL: u32 = u32::MAX;

/// Largest supported grid width. At 65 535 cells per side the far-corner id
/// is `width² − 1 = 4_294_836_224`, still below [`SENTINEL_CELL`]; one more
/// cell per side and linear ids would overflow `u32` or alias the sentinel.
pub const MAX_GRID_WIDTH: u32 = 65_535;

/// Errors emitted by grid construction and the sort network.
#[derive(Debug, Error)]
pub enum GridError {
    /// Configuration values that cannot be used (e.g., zero grid width).
    #[error("invalid grid configuration: {0}")]
    InvalidConfig(&'static str),
    /// The sort network only operates on power-of-two lengths.
    #[error("slice length {len} is not a power of two")]
    NotPowerOfTwo { len: usize },
    /// The cell-range table could not be allocated.
    #[error("cell table allocation failed: {0}")]
    Allocation(#[from] TryReserveError),
}

/// Geometry of the square hash grid: cell count per side, cell edge length,
/// and the derived half-extent of the covered world square.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GridLayout {
    width: u32,
    cell_size: f32,
    half_extent: f32,
}

impl GridLayout {
    /// Create a layout with `width` cells per side and `cell_size` world
    /// units per cell edge. The covered square is centered on the origin.
    /// `width` must lie in `1..=MAX_GRID_WIDTH` so every cell id fits in
    /// `u32` below the sentinel.
    pub fn new(width: u32, cell_size: f32) -> Result<Self, GridError> {
        if width == 0 {
            return Err(GridError::InvalidConfig("grid width must be positive"));
        }
        if width > MAX_GRID_WIDTH {
            return Err(GridError::InvalidConfig(
                "grid width must not exceed 65535 cells per side",
            ));
        }
        if !(cell_size > 0.0) || !cell_size.is_finite() {
            return Err(GridError::InvalidConfig(
                "grid cell size must be positive and finite",
            ));
        }
        let half_extent = width as f32 * cell_size * 0.5;
        Ok(Self {
            width,
            cell_size,
            half_extent,
        })
    }

    /// Cells per side.
    #[must_use]
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Edge length of one cell in world units.
    #[must_use]
    pub fn cell_size(&self) -> f32 {
        self.cell_size
    }

    /// Half the side length of the covered world square.
    #[must_use]
    pub fn half_extent(&self) -> f32 {
        self.half_extent
    }

    /// Total number of cells.
    #[must_use]
    pub fn cell_count(&self) -> usize {
        self.width as usize * self.width as usize
    }

    /// Linear cell id for a world position. Positions outside the covered
    /// square clamp to the nearest border cell; nothing is ever dropped.
    #[must_use]
    pub fn cell_of(&self, position: Vec3) -> u32 {
        let col = self.axis_cell(position.x);
        let row = self.axis_cell(position.z);
        row * self.width + col
    }

    fn axis_cell(&self, coord: f32) -> u32 {
        let shifted = (coord + self.half_extent) / self.cell_size;
        let max = (self.width - 1) as f32;
        shifted.floor().clamp(0.0, max) as u32
    }

    /// Column/row coordinates of a linear cell id.
    #[must_use]
    pub fn cell_coords(&self, cell: u32) -> (u32, u32) {
        (cell % self.width, cell / self.width)
    }

    /// Iterate the linear ids of the `(2 × radius + 1)²` block centered on
    /// `cell`. Rows and columns outside the grid are skipped, not clamped,
    /// so no cell is yielded twice. `cell` must be a valid cell id.
    pub fn cells_around(&self, cell: u32, radius: u32) -> impl Iterator<Item = u32> {
        debug_assert!((cell as usize) < self.cell_count(), "cell id out of range");
        let width = i64::from(self.width);
        let center_col = i64::from(cell % self.width);
        let center_row = i64::from(cell / self.width);
        let reach = i64::from(radius);
        (-reach..=reach).flat_map(move |row_off| {
            let row = center_row + row_off;
            (-reach..=reach).filter_map(move |col_off| {
                let col = center_col + col_off;
                (row >= 0 && row < width && col >= 0 && col < width)
                    .then(|| (row * width + col) as u32)
            })
        })
    }
}

/// Half-open `[start, end)` index run for one cell of the sorted agent array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellRange {
    pub start: u32,
    pub end: u32,
}

impl CellRange {
    /// Range covering no agents.
    pub const EMPTY: Self = Self { start: 0, end: 0 };

    /// Number of agents in the run.
    #[must_use]
    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start) as usize
    }

    /// Whether the run covers no agents.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    /// The run as a `usize` index range.
    #[must_use]
    pub fn indices(&self) -> std::ops::Range<usize> {
        self.start as usize..self.end as usize
    }
}

/// Per-cell `[start, end)` table derived from a cell-sorted agent array.
///
/// Rebuilt once per frame; allocation happens once at construction and is
/// reused across rebuilds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CellTable {
    ranges: Vec<CellRange>,
}

impl CellTable {
    /// Allocate a table for `cell_count` cells, all ranges empty.
    pub fn new(cell_count: usize) -> Result<Self, GridError> {
        let mut ranges = Vec::new();
        ranges.try_reserve_exact(cell_count)?;
        ranges.resize(cell_count, CellRange::EMPTY);
        Ok(Self { ranges })
    }

    /// Number of cells tracked.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    /// Whether the table tracks no cells.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Run for `cell`; out-of-range ids yield the empty run.
    #[must_use]
    pub fn range(&self, cell: u32) -> CellRange {
        self.ranges
            .get(cell as usize)
            .copied()
            .unwrap_or(CellRange::EMPTY)
    }

    /// Rebuild the table from a cell-id column already sorted non-decreasing.
    /// Shorthand for [`CellTable::rebuild_by`] with the identity key.
    pub fn rebuild(&mut self, cells: &[u32]) {
        self.rebuild_by(cells, |&cell| cell);
    }

    /// Rebuild the table from `items` already sorted non-decreasing by
    /// `key`. Items whose key is [`SENTINEL_CELL`] are ignored. Each run
    /// boundary is found by comparing every entry with its predecessor/
    /// successor, so the scan parallelizes per element; the sparse boundary
    /// list is then written back sequentially.
    pub fn rebuild_by<T, K>(&mut self, items: &[T], key: K)
    where
        T: Sync,
        K: Fn(&T) -> u32 + Sync,
    {
        debug_assert!(
            items.windows(2).all(|pair| key(&pair[0]) <= key(&pair[1])),
            "items must be sorted by cell before table rebuild"
        );
        self.ranges.fill(CellRange::EMPTY);

        let starts: Vec<(u32, u32)> = items
            .par_iter()
            .enumerate()
            .filter_map(|(idx, item)| {
                let cell = key(item);
                let boundary =
                    cell != SENTINEL_CELL && (idx == 0 || key(&items[idx - 1]) != cell);
                boundary.then_some((cell, idx as u32))
            })
            .collect();
        let ends: Vec<(u32, u32)> = items
            .par_iter()
            .enumerate()
            .filter_map(|(idx, item)| {
                let cell = key(item);
                let boundary = cell != SENTINEL_CELL
                    && (idx + 1 == items.len() || key(&items[idx + 1]) != cell);
                boundary.then_some((cell, idx as u32 + 1))
            })
            .collect();
        debug_assert_eq!(starts.len(), ends.len());

        for (&(cell, start), &(end_cell, end)) in starts.iter().zip(&ends) {
            debug_assert_eq!(cell, end_cell);
            if let Some(range) = self.ranges.get_mut(cell as usize) {
                *range = CellRange { start, end };
            }
        }
    }
}

/// Number of compare-exchange passes the network performs for `len` items:
/// `log2(len) × (log2(len) + 1) / 2`.
#[must_use]
pub fn pass_count(len: usize) -> u32 {
    if len < 2 {
        return 0;
    }
    let stages = len.ilog2();
    stages * (stages + 1) / 2
}

/// Sort `items` in place, non-decreasing by `key`, using a parallel bitonic
/// network. The length must be a power of two (callers pad to capacity and
/// use [`SENTINEL_CELL`] keys for the padding).
///
/// Every `(k, j)` pass of the network runs as one parallel dispatch over
/// disjoint `2j`-element chunks; the dispatch returning is the barrier the
/// next pass depends on. Equal keys are never exchanged, so the result is
/// identical regardless of worker count.
pub fn sort_by_cell<T, K>(items: &mut [T], key: K) -> Result<(), GridError>
where
    T: Send,
    K: Fn(&T) -> u32 + Sync,
{
    let len = items.len();
    if !len.is_power_of_two() {
        return Err(GridError::NotPowerOfTwo { len });
    }
    let mut k = 2;
    while k <= len {
        let mut j = k / 2;
        while j >= 1 {
            exchange_pass(items, k, j, &key);
            j /= 2;
        }
        k *= 2;
    }
    Ok(())
}

/// One `(k, j)` compare-exchange pass. A pair `(m, m ^ j)` always falls
/// inside a single aligned `2j` chunk, and because `2j ≤ k` the sort
/// direction bit `base & k` is constant per chunk, so chunks are mutually
/// independent and safe to process concurrently.
fn exchange_pass<T, K>(items: &mut [T], k: usize, j: usize, key: &K)
where
    T: Send,
    K: Fn(&T) -> u32 + Sync,
{
    let span = 2 * j;
    items
        .par_chunks_exact_mut(span)
        .enumerate()
        .for_each(|(chunk_idx, chunk)| {
            let base = chunk_idx * span;
            let ascending = (base & k) == 0;
            for lane in 0..j {
                let lo = key(&chunk[lane]);
                let hi = key(&chunk[lane + j]);
                if lo != hi && (lo > hi) == ascending {
                    chunk.swap(lane, lane + j);
                }
            }
        });
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng, rngs::SmallRng};

    fn layout_50() -> GridLayout {
        GridLayout::new(50, 2.0).expect("layout")
    }

    #[test]
    fn layout_rejects_degenerate_config() {
        assert!(matches!(
            GridLayout::new(0, 2.0),
            Err(GridError::InvalidConfig(_))
        ));
        assert!(matches!(
            GridLayout::new(50, 0.0),
            Err(GridError::InvalidConfig(_))
        ));
        assert!(matches!(
            GridLayout::new(50, -1.0),
            Err(GridError::InvalidConfig(_))
        ));
        assert!(matches!(
            GridLayout::new(50, f32::NAN),
            Err(GridError::InvalidConfig(_))
        ));
    }

    #[test]
    fn layout_accepts_the_widest_addressable_grid() {
        let layout = GridLayout::new(MAX_GRID_WIDTH, 1.0).expect("max-width layout");
        let far_corner = layout.cell_of(Vec3::new(1.0e9, 0.0, 1.0e9));
        assert_eq!(far_corner, MAX_GRID_WIDTH * MAX_GRID_WIDTH - 1);
        assert!(far_corner < SENTINEL_CELL);
    }

    #[test]
    fn layout_rejects_widths_whose_ids_reach_the_sentinel() {
        // One past the bound the far-corner id equals the sentinel; two past,
        // the row multiply leaves u32 entirely.
        for width in [MAX_GRID_WIDTH + 1, MAX_GRID_WIDTH + 2, u32::MAX] {
            assert!(
                matches!(
                    GridLayout::new(width, 1.0),
                    Err(GridError::InvalidConfig(_))
                ),
                "width {width} must be rejected"
            );
        }
    }

    #[test]
    fn layout_derives_half_extent() {
        let layout = layout_50();
        assert_eq!(layout.half_extent(), 50.0);
        assert_eq!(layout.cell_count(), 2500);
    }

    #[test]
    fn cell_of_maps_origin_to_center_block() {
        let layout = layout_50();
        let cell = layout.cell_of(Vec3::ZERO);
        let (col, row) = layout.cell_coords(cell);
        assert_eq!((col, row), (25, 25));
    }

    #[test]
    fn cell_of_clamps_outside_positions_to_borders() {
        let layout = layout_50();
        let far = layout.cell_of(Vec3::new(1_000.0, 0.0, 1_000.0));
        assert_eq!(layout.cell_coords(far), (49, 49));
        let near = layout.cell_of(Vec3::new(-1_000.0, 0.0, -1_000.0));
        assert_eq!(layout.cell_coords(near), (0, 0));
        let mixed = layout.cell_of(Vec3::new(-1_000.0, 0.0, 3.0));
        assert_eq!(layout.cell_coords(mixed), (0, 26));
    }

    #[test]
    fn cell_of_ignores_height() {
        let layout = layout_50();
        let ground = layout.cell_of(Vec3::new(3.0, 0.0, -4.0));
        let raised = layout.cell_of(Vec3::new(3.0, 17.5, -4.0));
        assert_eq!(ground, raised);
    }

    #[test]
    fn cells_around_interior_yields_full_block() {
        let layout = layout_50();
        let center = layout.cell_of(Vec3::ZERO);
        let block: Vec<u32> = layout.cells_around(center, 1).collect();
        assert_eq!(block.len(), 9);
        assert!(block.contains(&center));
    }

    #[test]
    fn cells_around_skips_out_of_bounds_neighbors() {
        let layout = layout_50();
        let corner = 0;
        let corner_block: Vec<u32> = layout.cells_around(corner, 1).collect();
        assert_eq!(corner_block, vec![0, 1, 50, 51]);

        let edge = 25;
        let edge_block: Vec<u32> = layout.cells_around(edge, 1).collect();
        assert_eq!(edge_block.len(), 6);
        for cell in &edge_block {
            let (_, row) = layout.cell_coords(*cell);
            assert!(row <= 1);
        }
    }

    #[test]
    fn cells_around_radius_two() {
        let layout = layout_50();
        let center = layout.cell_of(Vec3::ZERO);
        let block: Vec<u32> = layout.cells_around(center, 2).collect();
        assert_eq!(block.len(), 25);
    }

    #[test]
    fn bitonic_matches_comparison_sort() {
        let mut rng = SmallRng::seed_from_u64(0xB170);
        for &len in &[1usize, 2, 8, 64, 256, 1024] {
            let mut keys: Vec<u32> = (0..len).map(|_| rng.gen_range(0..64)).collect();
            let mut expected = keys.clone();
            expected.sort_unstable();
            sort_by_cell(&mut keys, |&k| k).expect("power-of-two sort");
            assert_eq!(keys, expected, "length {len}");
        }
    }

    #[test]
    fn bitonic_rejects_non_power_of_two() {
        let mut keys = vec![3u32, 1, 2];
        assert!(matches!(
            sort_by_cell(&mut keys, |&k| k),
            Err(GridError::NotPowerOfTwo { len: 3 })
        ));
    }

    #[test]
    fn bitonic_sorts_payload_structs_by_key() {
        let mut rng = SmallRng::seed_from_u64(0x51D3);
        let mut items: Vec<(u32, usize)> = (0..512)
            .map(|id| (rng.gen_range(0..40u32), id))
            .collect();
        let mut expected_ids: Vec<usize> = items.iter().map(|&(_, id)| id).collect();
        expected_ids.sort_unstable();

        sort_by_cell(&mut items, |item| item.0).expect("sort");

        assert!(items.windows(2).all(|pair| pair[0].0 <= pair[1].0));
        let mut seen_ids: Vec<usize> = items.iter().map(|&(_, id)| id).collect();
        seen_ids.sort_unstable();
        assert_eq!(seen_ids, expected_ids, "sort must permute, not clobber");
    }

    #[test]
    fn sentinels_sort_to_tail() {
        let mut rng = SmallRng::seed_from_u64(0x7A11);
        let mut keys: Vec<u32> = (0..256)
            .map(|idx| {
                if idx % 3 == 0 {
                    SENTINEL_CELL
                } else {
                    rng.gen_range(0..100)
                }
            })
            .collect();
        let sentinel_count = keys.iter().filter(|&&k| k == SENTINEL_CELL).count();
        sort_by_cell(&mut keys, |&k| k).expect("sort");
        assert!(
            keys[keys.len() - sentinel_count..]
                .iter()
                .all(|&k| k == SENTINEL_CELL)
        );
        assert!(
            keys[..keys.len() - sentinel_count]
                .iter()
                .all(|&k| k != SENTINEL_CELL)
        );
    }

    #[test]
    fn pass_count_matches_network_depth() {
        assert_eq!(pass_count(1), 0);
        assert_eq!(pass_count(2), 1);
        assert_eq!(pass_count(8), 6);
        assert_eq!(pass_count(1024), 55);
    }

    #[test]
    fn table_covers_sorted_runs_exactly() {
        let mut rng = SmallRng::seed_from_u64(0xC311);
        let mut cells: Vec<u32> = (0..512).map(|_| rng.gen_range(0..80u32)).collect();
        cells.extend(std::iter::repeat(SENTINEL_CELL).take(512));
        sort_by_cell(&mut cells, |&c| c).expect("sort");

        let mut table = CellTable::new(80).expect("table");
        table.rebuild(&cells);

        let mut covered = 0usize;
        let mut prev_end = 0u32;
        for cell in 0..80u32 {
            let range = table.range(cell);
            if range.is_empty() {
                continue;
            }
            assert!(range.start >= prev_end, "ranges must be ordered/disjoint");
            prev_end = range.end;
            covered += range.len();
            for idx in range.indices() {
                assert_eq!(cells[idx], cell, "index {idx} outside its cell run");
            }
        }
        assert_eq!(covered, 512, "table must cover every non-padding agent");
    }

    #[test]
    fn table_rebuild_clears_stale_runs() {
        let mut table = CellTable::new(8).expect("table");
        table.rebuild(&[1, 1, 2, 5]);
        assert_eq!(table.range(1).len(), 2);
        assert_eq!(table.range(5).len(), 1);

        table.rebuild(&[2, 2, 2, 2]);
        assert_eq!(table.range(1), CellRange::EMPTY);
        assert_eq!(table.range(5), CellRange::EMPTY);
        assert_eq!(table.range(2), CellRange { start: 0, end: 4 });
    }

    #[test]
    fn table_ignores_all_sentinel_input() {
        let mut table = CellTable::new(4).expect("table");
        table.rebuild(&[SENTINEL_CELL; 16]);
        for cell in 0..4 {
            assert!(table.range(cell).is_empty());
        }
    }

    #[test]
    fn table_out_of_range_lookup_is_empty() {
        let table = CellTable::new(4).expect("table");
        assert_eq!(table.range(99), CellRange::EMPTY);
    }
}
