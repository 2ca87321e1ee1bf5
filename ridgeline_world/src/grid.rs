// One 32×32-cell grid: base store, dirty arena, and the mutation engine.
//
// A grid owns its immutable `BaseStore` and a single `NodePool` shared by
// every dirty tree of its 1024 cells. Cells start out pointing into the
// base store; the first mutation materializes the referenced segment into
// a fresh dirty tree and rewrites the cell's root ("copy-on-write at the
// segment level"). Mutation is always two-phase: `ensure_dirty_*` makes a
// writable root, then `include`/`exclude` operate on it and store it back.
//
// `include` merges only touching ranges with an identical accessory;
// overlapping ranges with different accessories coexist, so a column's
// ends are not monotone. `exclude` has two modes: config 0 carves every
// intersecting range, any other config deletes from exactly one matching
// channel. Neither ever removes the terrain (a base-material range
// starting at 0).

use crate::base::{split_header, BaseStore};
use crate::cell::{CellColumn, RootCode};
use crate::tree::NodePool;
use crate::types::{Range, RichRange, Texture, GRID_CELL_COUNT, MAX_RANGE_END, SUB_TILE_COUNT};

/// Where a cell's (or subtile's) column data currently lives.
#[derive(Clone, Copy, Debug)]
pub enum ColumnSource<'a> {
    /// Nothing, or an override that shadows base data.
    Empty,
    /// An immutable base segment (header included).
    Base(&'a [RichRange]),
    /// A dirty tree root in the owning grid's pool.
    Dirty(i32),
}

#[derive(Clone, Debug)]
pub struct Grid {
    base_x: u16,
    base_y: u16,
    cells: Vec<CellColumn>,
    base: BaseStore,
    pool: NodePool,
}

impl Grid {
    pub(crate) fn from_parts(
        base_x: u16,
        base_y: u16,
        base: BaseStore,
        cells: Vec<CellColumn>,
    ) -> Self {
        debug_assert_eq!(cells.len(), GRID_CELL_COUNT);
        Self { base_x, base_y, cells, base, pool: NodePool::new() }
    }

    pub fn base_x(&self) -> u16 {
        self.base_x
    }

    pub fn base_y(&self) -> u16 {
        self.base_y
    }

    pub fn base(&self) -> &BaseStore {
        &self.base
    }

    pub fn pool(&self) -> &NodePool {
        &self.pool
    }

    /// Cell index for world coordinates that the environment already
    /// routed into this grid.
    pub fn cell_index(&self, x: u16, y: u16) -> usize {
        let dx = (x - self.base_x) as usize;
        let dy = (y - self.base_y) as usize;
        dx + (dy << 5)
    }

    pub fn cell(&self, cell_idx: usize) -> &CellColumn {
        &self.cells[cell_idx]
    }

    /// The cell's base LP segment, only while the base is authoritative.
    pub fn base_lp(&self, cell_idx: usize) -> Option<&[RichRange]> {
        match self.cells.get(cell_idx)?.root {
            RootCode::Base(root) => self.base.slice(root),
            _ => None,
        }
    }

    // ------------------------------------------------------------------
    // Base → dirty materialization
    // ------------------------------------------------------------------

    /// Rebuild an LP base segment as a dirty tree: the terrain is restored
    /// to `[0, header.end)` from the header, then the payload is inserted.
    fn materialize_lp(base: &BaseStore, pool: &mut NodePool, base_root: i32) -> RootCode {
        let Some(seg) = base.slice(base_root) else {
            return RootCode::Nil;
        };

        let mut root = crate::tree::NIL;
        let (hdr, payload) = split_header(seg);
        if let Some(hdr) = hdr {
            let mut terrain = hdr;
            terrain.range = Range::new(0, hdr.end());
            if !terrain.range.is_empty() {
                pool.insert(&mut root, terrain);
            }
            for rr in payload {
                pool.insert(&mut root, *rr);
            }
        } else {
            for rr in seg {
                pool.insert(&mut root, *rr);
            }
        }
        RootCode::from_tree_root(root)
    }

    /// HP segments carry no terrain: payload only.
    fn materialize_hp(base: &BaseStore, pool: &mut NodePool, base_root: i32) -> RootCode {
        let Some(seg) = base.slice(base_root) else {
            return RootCode::Nil;
        };
        let (_, payload) = split_header(seg);
        let mut root = crate::tree::NIL;
        for rr in payload {
            pool.insert(&mut root, *rr);
        }
        RootCode::from_tree_root(root)
    }

    /// Make the cell's LP root writable (dirty or nil) and return it.
    pub fn ensure_dirty_lp(&mut self, cell_idx: usize) -> Option<RootCode> {
        if cell_idx >= GRID_CELL_COUNT {
            return None;
        }
        let root = self.cells[cell_idx].root;
        let new_root = match root {
            RootCode::Dirty(_) => root,
            RootCode::Nil | RootCode::Shadow => RootCode::Nil,
            RootCode::Base(base_root) => {
                Self::materialize_lp(&self.base, &mut self.pool, base_root)
            }
        };
        self.cells[cell_idx].root = new_root;
        Some(new_root)
    }

    /// Make the subtile's span root writable and return its palette slot.
    /// After this call the slot holds a dirty root or nil.
    pub fn ensure_dirty_hp(&mut self, cell_idx: usize, sub_idx: usize) -> Option<u8> {
        if cell_idx >= GRID_CELL_COUNT || sub_idx >= SUB_TILE_COUNT {
            return None;
        }

        let base = &self.base;
        let pool = &mut self.pool;
        let hp = self.cells[cell_idx].high_precision.get_or_insert_with(Default::default);

        let slot = hp.ensure_writable_span(sub_idx, pool)?;
        let code = hp.spans[slot as usize];
        let new_code = match code {
            RootCode::Dirty(_) => code,
            RootCode::Nil | RootCode::Shadow => RootCode::Nil,
            RootCode::Base(base_root) => Self::materialize_hp(base, pool, base_root),
        };
        hp.spans[slot as usize] = new_code;
        Some(slot)
    }

    // ------------------------------------------------------------------
    // Include / exclude
    // ------------------------------------------------------------------

    pub fn include_lp(&mut self, cell_idx: usize, rr: RichRange) -> bool {
        let Some(mut root) = self.ensure_dirty_lp(cell_idx) else {
            return false;
        };
        let ok = include_on_root(&mut self.pool, &mut root, rr);
        self.cells[cell_idx].root = root;
        ok
    }

    pub fn include_hp(&mut self, cell_idx: usize, sub_idx: usize, rr: RichRange) -> bool {
        let Some(slot) = self.ensure_dirty_hp(cell_idx, sub_idx) else {
            return false;
        };
        let Some(hp) = self.cells[cell_idx].high_precision.as_deref_mut() else {
            return false;
        };
        let mut code = hp.spans[slot as usize];
        let ok = include_on_root(&mut self.pool, &mut code, rr);
        hp.spans[slot as usize] = code;
        ok
    }

    pub fn exclude_lp(&mut self, cell_idx: usize, exc: Range, config: u32) -> bool {
        let Some(mut root) = self.ensure_dirty_lp(cell_idx) else {
            return false;
        };
        let ok = exclude_on_root(&mut self.pool, &mut root, exc, config);
        self.cells[cell_idx].root = root;
        ok
    }

    pub fn exclude_hp(&mut self, cell_idx: usize, sub_idx: usize, exc: Range, config: u32) -> bool {
        let Some(slot) = self.ensure_dirty_hp(cell_idx, sub_idx) else {
            return false;
        };
        let Some(hp) = self.cells[cell_idx].high_precision.as_deref_mut() else {
            return false;
        };
        let mut code = hp.spans[slot as usize];
        let ok = exclude_on_root(&mut self.pool, &mut code, exc, config);
        hp.spans[slot as usize] = code;
        ok
    }

    // ------------------------------------------------------------------
    // Source selection
    // ------------------------------------------------------------------

    pub fn lp_source(&self, cell_idx: usize) -> ColumnSource<'_> {
        let Some(d) = self.cells.get(cell_idx) else {
            return ColumnSource::Empty;
        };
        match d.root {
            RootCode::Nil | RootCode::Shadow => ColumnSource::Empty,
            RootCode::Dirty(root) => ColumnSource::Dirty(root),
            RootCode::Base(root) => {
                self.base.slice(root).map_or(ColumnSource::Empty, ColumnSource::Base)
            }
        }
    }

    pub fn hp_source(&self, cell_idx: usize, sub_idx: usize) -> ColumnSource<'_> {
        let Some(d) = self.cells.get(cell_idx) else {
            return ColumnSource::Empty;
        };
        let Some(hp) = d.high_precision.as_deref() else {
            return ColumnSource::Empty;
        };
        match hp.span_root(sub_idx) {
            Some(RootCode::Base(root)) => {
                self.base.slice(root).map_or(ColumnSource::Empty, ColumnSource::Base)
            }
            Some(RootCode::Dirty(root)) => ColumnSource::Dirty(root),
            // A nil span root has lost any base reference; shadow blocks it
            // explicitly. Either way there is nothing to read here.
            Some(RootCode::Nil) | Some(RootCode::Shadow) | None => ColumnSource::Empty,
        }
    }

    // ------------------------------------------------------------------
    // HP → LP folding support
    // ------------------------------------------------------------------

    /// Ingest the representative subtile's overlays into the dirty LP tree
    /// and drop the HP column. The environment has already verified that
    /// all 16 subtile views coincide and that no span references base.
    pub(crate) fn fold_hp_into_lp(&mut self, cell_idx: usize) {
        if !self.cells.get(cell_idx).map_or(false, CellColumn::has_any_hp) {
            return;
        }

        let Some(mut lp_root) = self.ensure_dirty_lp(cell_idx) else {
            return;
        };

        // Representative subtile 0, the (1,1) offset view.
        let mut overlays = Vec::new();
        match self.hp_source(cell_idx, 0) {
            ColumnSource::Dirty(root) => {
                self.pool.for_each_all(root, |rr| {
                    if rr.end() > 0 && !rr.range.is_empty() {
                        overlays.push(rr);
                    }
                    true
                });
            }
            ColumnSource::Base(seg) => {
                let (_, payload) = split_header(seg);
                overlays.extend(
                    payload.iter().copied().filter(|rr| rr.end() > 0 && !rr.range.is_empty()),
                );
            }
            ColumnSource::Empty => {}
        }

        let mut tree_root = lp_root.tree_root();
        for rr in overlays {
            self.pool.insert(&mut tree_root, rr);
        }
        lp_root = RootCode::from_tree_root(tree_root);
        self.cells[cell_idx].root = lp_root;

        // Free the dirty span trees and drop the column.
        if let Some(hp) = self.cells[cell_idx].high_precision.take() {
            for span in hp.spans {
                if let RootCode::Dirty(root) = span {
                    let mut r = root;
                    self.pool.free_all(&mut r);
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tree mutation primitives
// ---------------------------------------------------------------------------

/// Insert with touch-merge: repeatedly absorb neighbours that share the
/// accessory and touch the growing range exactly (left `end == begin`,
/// right `begin == end`), then insert the merged range. The root must be
/// dirty or nil; zero-length input after clamping is a success no-op.
pub fn include_on_root(pool: &mut NodePool, code: &mut RootCode, mut rr: RichRange) -> bool {
    if code.is_base() {
        return false;
    }
    if !rr.range.is_valid() {
        return false;
    }

    rr.range = Range::MAX.intersect(rr.range);
    if rr.range.len() == 0 {
        return true;
    }

    let mut root = code.tree_root();
    let acc = rr.accessory;
    let (mut merged_b, mut merged_e) = (rr.begin(), rr.end());

    loop {
        let mut changed = false;

        if merged_b > 0 {
            // Left touch: a neighbour ending exactly at merged_b. Among
            // candidates pick the one with the largest begin.
            let mut hit: Option<RichRange> = None;
            pool.range_query(root, Range::new(merged_b - 1, merged_b), |x| {
                if x.accessory == acc && x.end() == merged_b {
                    if hit.map_or(true, |h| x.begin() > h.begin()) {
                        hit = Some(x);
                    }
                }
                true
            });
            if let Some(h) = hit {
                pool.delete_exact(&mut root, h);
                merged_b = h.begin();
                changed = true;
            }
        }

        if merged_e < MAX_RANGE_END {
            // Right touch: a neighbour beginning exactly at merged_e.
            // Among candidates pick the one with the smallest end.
            let mut hit: Option<RichRange> = None;
            pool.range_query(root, Range::new(merged_e, merged_e + 1), |x| {
                if x.accessory == acc && x.begin() == merged_e {
                    if hit.map_or(true, |h| x.end() < h.end()) {
                        hit = Some(x);
                    }
                }
                true
            });
            if let Some(h) = hit {
                pool.delete_exact(&mut root, h);
                merged_e = h.end();
                changed = true;
            }
        }

        if !changed {
            break;
        }
    }

    rr.range = Range::new(merged_b, merged_e);
    pool.insert(&mut root, rr);
    *code = RootCode::from_tree_root(root);
    true
}

/// Remove height coverage from a dirty tree.
///
/// `config == 0` carves: every intersecting range except the terrain is
/// split around `exc` (success as long as the tree was non-empty).
/// `config != 0` deletes from one channel: the hit must carry the config
/// and fully contain `exc`; an exact match wins, otherwise the shortest
/// containing range.
pub fn exclude_on_root(pool: &mut NodePool, code: &mut RootCode, exc: Range, config: u32) -> bool {
    if code.is_base() {
        return false;
    }

    let exc = Range::MAX.intersect(exc);
    if exc.len() == 0 {
        return true;
    }

    let mut root = code.tree_root();
    if root < 0 {
        return false;
    }

    let is_terrain =
        |rr: RichRange| rr.texture().intersects(Texture::MATER_BASE) && rr.begin() == 0;

    if config == 0 {
        let mut hits: Vec<RichRange> = Vec::new();
        pool.range_query_in_order(root, exc, |hit| {
            if !is_terrain(hit) {
                hits.push(hit);
            }
            true
        });

        for hit in hits {
            let cut = hit.range.intersect(exc);
            if cut.len() == 0 {
                continue;
            }
            pool.delete_exact(&mut root, hit);

            if hit.begin() < cut.begin {
                let mut left = hit;
                left.range = Range::new(hit.begin(), cut.begin);
                pool.insert(&mut root, left);
            }
            if cut.end < hit.end() {
                let mut right = hit;
                right.range = Range::new(cut.end, hit.end());
                pool.insert(&mut root, right);
            }
        }

        *code = RootCode::from_tree_root(root);
        return true;
    }

    let mut best: Option<RichRange> = None;
    let mut best_len = 0u16;
    pool.range_query_in_order(root, exc, |hit| {
        if is_terrain(hit) || hit.accessory.config != config {
            return true;
        }
        if !(hit.begin() <= exc.begin && exc.end <= hit.end()) {
            return true;
        }
        if hit.range == exc {
            best = Some(hit);
            return false;
        }
        let len = hit.range.len();
        if best.is_none() || len < best_len {
            best = Some(hit);
            best_len = len;
        }
        true
    });

    let Some(hit) = best else {
        return false;
    };

    pool.delete_exact(&mut root, hit);
    if hit.begin() < exc.begin {
        let mut left = hit;
        left.range = Range::new(hit.begin(), exc.begin);
        pool.insert(&mut root, left);
    }
    if exc.end < hit.end() {
        let mut right = hit;
        right.range = Range::new(exc.end, hit.end());
        pool.insert(&mut root, right);
    }

    *code = RootCode::from_tree_root(root);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::build_grid_from_columns;

    fn terrain(end: u16) -> RichRange {
        RichRange::new(0, end, Texture::MATER_BASE, 0)
    }

    fn obstacle(begin: u16, end: u16) -> RichRange {
        RichRange::new(begin, end, Texture::MATER_OBSTACLE, 0)
    }

    fn build_one_cell(lp0: Vec<RichRange>) -> Grid {
        let mut lp: Vec<Vec<RichRange>> = (0..GRID_CELL_COUNT).map(|_| Vec::new()).collect();
        lp[0] = lp0;
        build_grid_from_columns(0, 0, &lp, None).unwrap()
    }

    fn dirty_values(grid: &Grid, cell_idx: usize) -> Vec<RichRange> {
        let mut out = Vec::new();
        match grid.lp_source(cell_idx) {
            ColumnSource::Dirty(root) => {
                grid.pool().for_each_all(root, |rr| {
                    out.push(rr);
                    true
                });
            }
            ColumnSource::Base(seg) => {
                let (_, payload) = split_header(seg);
                out.extend_from_slice(payload);
            }
            ColumnSource::Empty => {}
        }
        out
    }

    #[test]
    fn cell_index_is_row_major_from_grid_origin() {
        let grid = build_one_cell(vec![terrain(20)]);
        assert_eq!(grid.cell_index(0, 0), 0);
        assert_eq!(grid.cell_index(31, 0), 31);
        assert_eq!(grid.cell_index(0, 1), 32);
        assert_eq!(grid.cell_index(31, 31), GRID_CELL_COUNT - 1);
    }

    #[test]
    fn materialization_restores_terrain_from_header() {
        let mut grid = build_one_cell(vec![terrain(25), obstacle(40, 50)]);
        let root = grid.ensure_dirty_lp(0).unwrap();
        assert!(root.is_dirty());

        assert_eq!(dirty_values(&grid, 0), vec![terrain(25), obstacle(40, 50)]);
    }

    #[test]
    fn materialization_of_zero_height_terrain_skips_it() {
        let mut grid = build_one_cell(vec![RichRange::new(0, 0, Texture::MATER_BASE, 0)]);
        let root = grid.ensure_dirty_lp(0).unwrap();
        // Empty terrain plus empty payload leaves an empty tree.
        assert_eq!(root, RootCode::Nil);
    }

    #[test]
    fn ensure_dirty_is_idempotent() {
        let mut grid = build_one_cell(vec![terrain(25)]);
        let first = grid.ensure_dirty_lp(0).unwrap();
        let nodes = grid.pool().node_count();
        let second = grid.ensure_dirty_lp(0).unwrap();
        assert_eq!(first, second);
        assert_eq!(grid.pool().node_count(), nodes);
    }

    #[test]
    fn include_merges_touching_same_accessory() {
        let mut grid = build_one_cell(vec![terrain(10)]);
        assert!(grid.include_lp(0, obstacle(20, 30)));
        assert!(grid.include_lp(0, obstacle(30, 40)));
        assert!(grid.include_lp(0, obstacle(10, 20)));

        let got = dirty_values(&grid, 0);
        assert!(got.contains(&obstacle(10, 40)), "expected one merged range, got {got:?}");
        assert_eq!(got.iter().filter(|rr| rr.texture() == Texture::MATER_OBSTACLE).count(), 1);
    }

    #[test]
    fn include_does_not_merge_different_accessory_or_overlap() {
        let mut grid = build_one_cell(vec![terrain(10)]);
        assert!(grid.include_lp(0, obstacle(20, 30)));
        // Touching but different texture: stays separate.
        assert!(grid.include_lp(0, RichRange::new(30, 40, Texture::MATER_COLLIDER, 0)));
        // Overlapping same texture: coexists (no merge on overlap).
        assert!(grid.include_lp(0, obstacle(25, 35)));

        let got = dirty_values(&grid, 0);
        assert!(got.contains(&obstacle(20, 30)));
        assert!(got.contains(&obstacle(25, 35)));
        assert!(got.contains(&RichRange::new(30, 40, Texture::MATER_COLLIDER, 0)));
    }

    #[test]
    fn include_chains_through_multiple_neighbours() {
        let mut grid = build_one_cell(vec![terrain(10)]);
        assert!(grid.include_lp(0, obstacle(20, 25)));
        assert!(grid.include_lp(0, obstacle(30, 35)));
        // The middle piece touches both existing ranges.
        assert!(grid.include_lp(0, obstacle(25, 30)));

        let got = dirty_values(&grid, 0);
        assert!(got.contains(&obstacle(20, 35)), "got {got:?}");
    }

    #[test]
    fn include_clamps_to_max_range() {
        let mut grid = build_one_cell(vec![terrain(10)]);
        assert!(grid.include_lp(0, obstacle(0xFF80, 0xFFFF)));
        // Entirely above the representable band: clamped empty, no-op.
        let got = dirty_values(&grid, 0);
        assert_eq!(got.iter().filter(|rr| rr.texture() == Texture::MATER_OBSTACLE).count(), 0);
    }

    #[test]
    fn exclude_carve_splits_hits_and_spares_terrain() {
        let mut grid = build_one_cell(vec![terrain(50), obstacle(20, 60)]);
        assert!(grid.exclude_lp(0, Range::new(30, 40), 0));

        let got = dirty_values(&grid, 0);
        assert!(got.contains(&terrain(50)), "terrain must survive a carve, got {got:?}");
        assert!(got.contains(&obstacle(20, 30)));
        assert!(got.contains(&obstacle(40, 60)));
        assert!(!got.contains(&obstacle(20, 60)));
    }

    #[test]
    fn exclude_on_empty_tree_fails() {
        let mut grid = build_one_cell(Vec::new());
        assert!(!grid.exclude_lp(0, Range::new(10, 20), 0));
    }

    #[test]
    fn exclude_zero_length_is_success_noop() {
        let mut grid = build_one_cell(vec![terrain(50)]);
        assert!(grid.exclude_lp(0, Range::new(30, 30), 0));
    }

    #[test]
    fn exclude_channel_requires_matching_config_and_containment() {
        let mut grid = build_one_cell(vec![terrain(10)]);
        assert!(grid.include_lp(0, RichRange::new(20, 40, Texture::MATER_OBSTACLE, 7)));

        // Wrong config fails.
        assert!(!grid.exclude_lp(0, Range::new(20, 40), 9));
        // Not contained fails.
        assert!(!grid.exclude_lp(0, Range::new(30, 50), 7));
        // Contained with the right config splits residuals.
        assert!(grid.exclude_lp(0, Range::new(25, 30), 7));

        let got = dirty_values(&grid, 0);
        assert!(got.contains(&RichRange::new(20, 25, Texture::MATER_OBSTACLE, 7)));
        assert!(got.contains(&RichRange::new(30, 40, Texture::MATER_OBSTACLE, 7)));
    }

    #[test]
    fn exclude_channel_prefers_exact_then_shortest_container() {
        let mut grid = build_one_cell(vec![terrain(10)]);
        let long = RichRange::new(20, 60, Texture::MATER_OBSTACLE, 7);
        let short = RichRange::new(25, 40, Texture::MATER_OBSTACLE, 7);
        assert!(grid.include_lp(0, long));
        assert!(grid.include_lp(0, short));

        // Both contain [26, 39); the shorter one is consumed.
        assert!(grid.exclude_lp(0, Range::new(26, 39), 7));
        let got = dirty_values(&grid, 0);
        assert!(got.contains(&long));
        assert!(!got.contains(&short));
        assert!(got.contains(&RichRange::new(25, 26, Texture::MATER_OBSTACLE, 7)));
        assert!(got.contains(&RichRange::new(39, 40, Texture::MATER_OBSTACLE, 7)));
    }

    #[test]
    fn hp_mutation_stays_per_subtile() {
        let mut grid = build_one_cell(vec![terrain(10)]);
        assert!(grid.include_hp(0, 3, obstacle(30, 40)));

        match grid.hp_source(0, 3) {
            ColumnSource::Dirty(root) => {
                let mut got = Vec::new();
                grid.pool().for_each_all(root, |rr| {
                    got.push(rr);
                    true
                });
                assert_eq!(got, vec![obstacle(30, 40)]);
            }
            other => panic!("expected dirty HP source, got {other:?}"),
        }
        // The neighbouring subtile is untouched.
        assert!(matches!(grid.hp_source(0, 4), ColumnSource::Empty));
        // LP is untouched too.
        assert!(matches!(grid.lp_source(0), ColumnSource::Base(_)));
    }

    #[test]
    fn lp_source_transitions_with_mutation() {
        let mut grid = build_one_cell(vec![terrain(10)]);
        assert!(matches!(grid.lp_source(0), ColumnSource::Base(_)));

        grid.include_lp(0, obstacle(20, 30));
        assert!(matches!(grid.lp_source(0), ColumnSource::Dirty(_)));
    }
}
