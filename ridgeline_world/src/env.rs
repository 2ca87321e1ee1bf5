// The environment: a rectangle of grids and the operations over them.
//
// `Env` routes 2D points to a grid and cell, recovers the terrain interval
// and the sorted blocking spans for any query point, applies batched
// add/remove operations, and folds high-precision columns back to low
// precision when all sixteen subtile views coincide.
//
// Effective precision on reads: a high-precision query against a cell with
// no HP data downgrades to the LP view; a low-precision query against a
// cell that has any HP data promotes to the canonical subtile 0 (the (1,1)
// offset), so whole-cell reads keep seeing the refined column. Writes are
// never re-targeted.
//
// **Critical constraint: read/write phases must not interleave.** The core
// is single-threaded per `Env`; hosts run queries against an immutable
// snapshot and serialize mutations. Nothing here suspends or blocks.

use std::collections::BTreeSet;

use crate::base::{range_query_slice, split_header};
use crate::cell::CellColumn;
use crate::grid::{ColumnSource, Grid};
use crate::tree::{BestSurface, NodePool};
use crate::types::{
    Accessory, Point2d, Point3d, Range, Rect, RichRange, SnapRichRange, Texture, GRID_SIZE,
    SUB_TILE_COUNT,
};

/// A routed query point: which grid, which cell, and the requested
/// precision.
#[derive(Clone, Copy, Debug)]
pub struct RouteCtx {
    pub grid_idx: usize,
    pub cell_idx: usize,
    pub is_hp: bool,
    pub sub_idx: usize,
}

#[derive(Debug, Default)]
pub struct Env {
    rect: Rect,
    min_x: u16,
    min_y: u16,
    grid_w: u16,
    grid_h: u16,
    grids: Vec<Option<Grid>>,
}

impl Env {
    pub fn new(rect: Rect) -> Self {
        let grid_w = (rect.width() + GRID_SIZE - 1) / GRID_SIZE;
        let grid_h = (rect.height() + GRID_SIZE - 1) / GRID_SIZE;
        Self {
            rect,
            min_x: rect.min.x,
            min_y: rect.min.y,
            grid_w,
            grid_h,
            grids: (0..grid_w as usize * grid_h as usize).map(|_| None).collect(),
        }
    }

    pub fn rect(&self) -> Rect {
        self.rect
    }

    pub fn min_x(&self) -> u16 {
        self.min_x
    }

    pub fn min_y(&self) -> u16 {
        self.min_y
    }

    pub fn width(&self) -> u16 {
        self.rect.width()
    }

    pub fn height(&self) -> u16 {
        self.rect.height()
    }

    /// Place a built grid at the slot its origin names. Fails when the
    /// origin is misaligned or outside the environment rectangle.
    pub fn attach_grid(&mut self, grid: Grid) -> bool {
        let (bx, by) = (grid.base_x(), grid.base_y());
        if bx < self.min_x || by < self.min_y {
            return false;
        }
        if (bx - self.min_x) % GRID_SIZE != 0 || (by - self.min_y) % GRID_SIZE != 0 {
            return false;
        }
        if bx >= self.rect.max.x || by >= self.rect.max.y {
            return false;
        }
        let idx = self.grid_idx_of(bx, by);
        self.grids[idx] = Some(grid);
        true
    }

    pub fn contains(&self, p: Point2d) -> bool {
        self.rect.contains_point(p)
    }

    fn grid_idx_of(&self, x: u16, y: u16) -> usize {
        let gx = ((x - self.min_x) >> 5) as usize;
        let gy = ((y - self.min_y) >> 5) as usize;
        gx + gy * self.grid_w as usize
    }

    fn grid(&self, idx: usize) -> Option<&Grid> {
        self.grids.get(idx)?.as_ref()
    }

    fn grid_mut(&mut self, idx: usize) -> Option<&mut Grid> {
        self.grids.get_mut(idx)?.as_mut()
    }

    /// Resolve a point to its grid and cell. Fails for out-of-rect points,
    /// invalid offsets, and unloaded grids.
    pub fn route(&self, p: Point2d) -> Option<RouteCtx> {
        if !self.contains(p) {
            return None;
        }
        let grid_idx = self.grid_idx_of(p.x, p.y);
        let grid = self.grid(grid_idx)?;
        let cell_idx = grid.cell_index(p.x, p.y);

        let is_hp = p.x_offset != 0 || p.y_offset != 0;
        let sub_idx = if is_hp { p.sub_idx()? } else { 0 };

        Some(RouteCtx { grid_idx, cell_idx, is_hp, sub_idx })
    }

    // ------------------------------------------------------------------
    // Terrain
    // ------------------------------------------------------------------

    fn terrain_of(grid: &Grid, cell_idx: usize) -> Option<RichRange> {
        match grid.lp_source(cell_idx) {
            ColumnSource::Base(seg) => terrain_from_base_slice(seg),
            ColumnSource::Dirty(root) => terrain_from_dirty(grid.pool(), root),
            ColumnSource::Empty => None,
        }
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Append the point's blocking spans to `out` and return its terrain.
    /// Spans come back sorted by `(end asc, begin asc)` with the exact
    /// terrain triple removed; `out` is not cleared first.
    pub fn terrain_and_spans_into(
        &self,
        p: Point2d,
        out: &mut Vec<RichRange>,
    ) -> Option<RichRange> {
        let rc = self.route(p)?;
        let grid = self.grid(rc.grid_idx)?;
        let terrain = Self::terrain_of(grid, rc.cell_idx)?;

        let start = out.len();
        append_source(grid.pool(), grid.lp_source(rc.cell_idx), terrain, out);
        if let Some(sub) = effective_sub(grid.cell(rc.cell_idx), rc) {
            append_source(grid.pool(), grid.hp_source(rc.cell_idx, sub), terrain, out);
        }

        sort_spans_by_end_begin(&mut out[start..]);
        Some(terrain)
    }

    /// Convenience wrapper allocating a fresh span list.
    pub fn terrain_and_spans(&self, p: Point2d) -> Option<(RichRange, Vec<RichRange>)> {
        let mut spans = Vec::with_capacity(16);
        let terrain = self.terrain_and_spans_into(p, &mut spans)?;
        Some((terrain, spans))
    }

    /// The highest surface at the point that `accept` admits, scanning
    /// terrain, the LP column, and (at effective HP) the subtile column.
    /// Ties on the surface height prefer the range with the larger begin.
    pub fn highest_surface(
        &self,
        p: Point2d,
        accept: impl Fn(RichRange) -> bool,
    ) -> Option<SnapRichRange> {
        let rc = self.route(p)?;
        let grid = self.grid(rc.grid_idx)?;

        let admit =
            |rr: RichRange| rr.end() != 0 && !rr.range.is_empty() && accept(rr);

        let mut best = BestSurface::default();

        if let Some(terrain) = Self::terrain_of(grid, rc.cell_idx) {
            if admit(terrain) {
                best.offer(terrain);
            }
        }

        let mut scan = |src: ColumnSource<'_>, best: &mut BestSurface| match src {
            ColumnSource::Dirty(root) => {
                grid.pool().find_max_end_le(root, u16::MAX, best, &admit);
            }
            ColumnSource::Base(seg) => {
                range_query_slice(seg, Range::MAX, |rr| {
                    if admit(rr) {
                        best.offer(rr);
                    }
                    true
                });
            }
            ColumnSource::Empty => {}
        };

        scan(grid.lp_source(rc.cell_idx), &mut best);
        if let Some(sub) = effective_sub(grid.cell(rc.cell_idx), rc) {
            scan(grid.hp_source(rc.cell_idx, sub), &mut best);
        }

        if !best.found || best.value.range.is_empty() || best.value.end() == 0 {
            return None;
        }
        Some(SnapRichRange { range: best.value.range, texture: best.value.texture() })
    }

    // ------------------------------------------------------------------
    // Mutation
    // ------------------------------------------------------------------

    /// Apply a batch: all adds, then all removes, then the HP→LP fold pass
    /// over cells whose HP columns changed. A failed item does not stop
    /// the batch; the return value is the conjunction of per-op results.
    pub fn apply_batch(
        &mut self,
        adds: &[Point3d],
        removes: &[Point3d],
        accessory: Accessory,
    ) -> bool {
        if adds.is_empty() && removes.is_empty() {
            return true;
        }
        let mut ok = true;

        for p in adds {
            if !self.add_range_point(*p, accessory) {
                ok = false;
            }
        }

        let mut hp_changed_cells: BTreeSet<(u16, u16)> = BTreeSet::new();
        for p in removes {
            let (hp_changed, succ) = self.remove_range_point(*p, accessory);
            if !succ {
                ok = false;
                continue;
            }
            if hp_changed {
                hp_changed_cells.insert((p.x, p.y));
            }
        }

        for (x, y) in hp_changed_cells {
            self.try_fold_hp_to_lp(Point2d::new(x, y));
        }

        ok
    }

    /// An LP add lands in the LP tree (visible to every subtile through
    /// the LP layer); an HP add touches only its subtile.
    fn add_range_point(&mut self, p: Point3d, accessory: Accessory) -> bool {
        let Some(rc) = self.route(p.point2d()) else {
            return false;
        };
        let rr = RichRange { range: p.height_range(), accessory };
        let Some(grid) = self.grid_mut(rc.grid_idx) else {
            return false;
        };
        if rc.is_hp {
            grid.include_hp(rc.cell_idx, rc.sub_idx, rr)
        } else {
            grid.include_lp(rc.cell_idx, rr)
        }
    }

    /// Returns `(hp_changed, ok)`. An LP remove also applies to every
    /// existing HP subtile so the removal is visible at all precisions
    /// (without creating new subtiles); an HP remove against a cell with
    /// no HP data is rejected.
    fn remove_range_point(&mut self, p: Point3d, accessory: Accessory) -> (bool, bool) {
        let Some(rc) = self.route(p.point2d()) else {
            return (false, false);
        };
        let exc = p.height_range();
        let config = accessory.config;
        let Some(grid) = self.grid_mut(rc.grid_idx) else {
            return (false, false);
        };

        let mut changed_lp = false;
        let mut changed_hp = false;

        if rc.is_hp {
            if !grid.cell(rc.cell_idx).has_any_hp() {
                return (false, false);
            }
            let has_span = grid
                .cell(rc.cell_idx)
                .high_precision
                .as_deref()
                .is_some_and(|hp| hp.has_span(rc.sub_idx));
            if !has_span {
                return (false, false);
            }
            changed_hp = grid.exclude_hp(rc.cell_idx, rc.sub_idx, exc, config);
        } else {
            changed_lp = grid.exclude_lp(rc.cell_idx, exc, config);

            if grid.cell(rc.cell_idx).has_any_hp() {
                for sub in 0..SUB_TILE_COUNT {
                    let has_span = grid
                        .cell(rc.cell_idx)
                        .high_precision
                        .as_deref()
                        .is_some_and(|hp| hp.has_span(sub));
                    if !has_span {
                        continue;
                    }
                    if grid.exclude_hp(rc.cell_idx, sub, exc, config) {
                        changed_hp = true;
                    }
                }
            }
        }

        if !changed_lp && !changed_hp {
            return (false, false);
        }
        (changed_hp, true)
    }

    // ------------------------------------------------------------------
    // HP → LP fold
    // ------------------------------------------------------------------

    /// Collapse the cell's HP column back into LP when all sixteen subtile
    /// views are identical. Folding is skipped while any span still
    /// references a base segment (the base semantics would be lost).
    fn try_fold_hp_to_lp(&mut self, lp: Point2d) {
        let Some(rc) = self.route(lp) else {
            return;
        };
        {
            let Some(grid) = self.grid(rc.grid_idx) else {
                return;
            };
            let d = grid.cell(rc.cell_idx);
            if !d.has_any_hp() || d.has_base_hp() {
                return;
            }
        }

        let mut first: Option<Vec<RichRange>> = None;
        let mut uniform = true;
        lp.for_each_subtile(|hp_p| {
            let view = self.collect_point_view(hp_p);
            match &first {
                None => {
                    first = Some(view);
                    true
                }
                Some(reference) => {
                    if *reference != view {
                        uniform = false;
                        return false;
                    }
                    true
                }
            }
        });

        if !uniform || first.is_none() {
            return;
        }

        if let Some(grid) = self.grid_mut(rc.grid_idx) {
            grid.fold_hp_into_lp(rc.cell_idx);
        }
    }

    /// The point's full merged view (terrain included) in total order,
    /// used to compare subtile snapshots.
    fn collect_point_view(&self, p: Point2d) -> Vec<RichRange> {
        let mut out = Vec::with_capacity(16);
        if let Some(terrain) = self.terrain_and_spans_into(p, &mut out) {
            out.push(terrain);
        }
        out.sort();
        out
    }
}

/// The effective HP subtile for a read, after promotion/demotion.
fn effective_sub(d: &CellColumn, rc: RouteCtx) -> Option<usize> {
    let has_any = d.has_any_hp();
    if rc.is_hp {
        if has_any {
            Some(rc.sub_idx)
        } else {
            None
        }
    } else if has_any {
        Some(0)
    } else {
        None
    }
}

fn terrain_from_base_slice(seg: &[RichRange]) -> Option<RichRange> {
    let (hdr, payload) = split_header(seg);
    if let Some(hdr) = hdr {
        if hdr.end() > 0 {
            let mut terrain = hdr;
            terrain.range = Range::new(0, hdr.end());
            return Some(terrain);
        }
    }

    // No usable header: the best ground-bearing range starting at zero,
    // preferring base material.
    let pick = |want_base: bool| {
        let mut best: Option<RichRange> = None;
        for rr in payload {
            if rr.begin() != 0 || rr.end() == 0 || rr.range.is_empty() {
                continue;
            }
            if want_base && !rr.texture().intersects(Texture::MATER_BASE) {
                continue;
            }
            if best.map_or(true, |b| rr.end() > b.end()) {
                best = Some(*rr);
            }
        }
        best
    };
    pick(true).or_else(|| pick(false))
}

fn terrain_from_dirty(pool: &NodePool, root: i32) -> Option<RichRange> {
    let q = Range::new(0, 1);
    let pick = |want_base: bool| {
        let mut best: Option<RichRange> = None;
        pool.range_query_in_order(root, q, |rr| {
            if rr.begin() != 0 || rr.end() == 0 || rr.range.is_empty() {
                return true;
            }
            if want_base && !rr.texture().intersects(Texture::MATER_BASE) {
                return true;
            }
            if best.map_or(true, |b| rr.end() > b.end()) {
                best = Some(rr);
            }
            true
        });
        best
    };
    pick(true).or_else(|| pick(false))
}

fn append_source(
    pool: &NodePool,
    src: ColumnSource<'_>,
    terrain: RichRange,
    out: &mut Vec<RichRange>,
) {
    let keep = |rr: RichRange| rr.end() > 0 && !rr.range.is_empty() && rr != terrain;
    match src {
        ColumnSource::Empty => {}
        ColumnSource::Dirty(root) => {
            pool.for_each_all(root, |rr| {
                if keep(rr) {
                    out.push(rr);
                }
                true
            });
        }
        ColumnSource::Base(seg) => {
            let (_, payload) = split_header(seg);
            out.extend(payload.iter().copied().filter(|rr| keep(*rr)));
        }
    }
}

/// Sort by `(end asc, begin asc)` — the order the gap scan expects.
/// Insertion sort below 24 elements keeps the hot path allocation-free.
fn sort_spans_by_end_begin(spans: &mut [RichRange]) {
    let n = spans.len();
    if n < 2 {
        return;
    }
    if n <= 24 {
        for i in 1..n {
            let x = spans[i];
            let mut j = i;
            while j > 0 {
                let prev = spans[j - 1];
                if prev.end() < x.end() || (prev.end() == x.end() && prev.begin() <= x.begin()) {
                    break;
                }
                spans[j] = prev;
                j -= 1;
            }
            spans[j] = x;
        }
        return;
    }
    spans.sort_by(|a, b| a.end().cmp(&b.end()).then(a.begin().cmp(&b.begin())));
}
