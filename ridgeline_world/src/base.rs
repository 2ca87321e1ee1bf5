// Immutable base store: the deduplicated segment pool built per grid.
//
// All base column data for one grid lives in a single `Vec<RichRange>`,
// concatenated segment by segment. Each segment starts with a header whose
// `begin` stores the segment length (header included) — that is how a bare
// root index recovers its extent — and whose `end` stores the cell's
// terrain height for LP segments or zero for HP segments. The header's
// accessory is the terrain accessory for LP segments. The payload follows,
// sorted by begin.
//
// Index 0 of the pool is a reserved sentinel so that 0 never names a
// segment. Root indices must stay below `BASE_ROOT_LIMIT`; the region at
// and above it encodes dirty tree roots (see `cell.rs`).
//
// Building hashes each assembled segment (FNV-1a 64 over the 12-byte
// little-endian element representation, xored with the length) into
// buckets and reuses an existing equal segment instead of appending,
// counting references per root. Buckets and refcounts use `BTreeMap` so
// serialization order is defined.

use std::collections::BTreeMap;
use std::error::Error;
use std::fmt;

use crate::cell::{CellColumn, HighPrecisionColumn, RootCode, BASE_ROOT_LIMIT};
use crate::grid::Grid;
use crate::types::{Range, RichRange, Texture, GRID_CELL_COUNT, SUB_TILE_COUNT};

/// Build-time validation failure. Fatal; the build aborts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BuildError {
    /// `lp_per_cell` / `hp_per_cell` is not exactly one entry per cell.
    WrongCellCount { got: usize },
    /// A non-empty LP column's first element is not a terrain range.
    MissingTerrain { cell: usize },
    /// More than 16 unique HP slices in one cell.
    PaletteOverflow { cell: usize },
    /// The segment pool grew into the dirty-root encoding region.
    RootIndexOverflow,
    /// Internal: a segment was assembled empty or with a bad header.
    EmptySegment,
}

impl fmt::Display for BuildError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuildError::WrongCellCount { got } => {
                write!(f, "expected {GRID_CELL_COUNT} cell entries, got {got}")
            }
            BuildError::MissingTerrain { cell } => {
                write!(f, "cell {cell}: first LP element must be terrain (begin 0, base material)")
            }
            BuildError::PaletteOverflow { cell } => {
                write!(f, "cell {cell}: more than {SUB_TILE_COUNT} unique high-precision slices")
            }
            BuildError::RootIndexOverflow => {
                write!(f, "base segment pool reached the dirty-root encoding region")
            }
            BuildError::EmptySegment => write!(f, "assembled an empty or malformed segment"),
        }
    }
}

impl Error for BuildError {}

/// The immutable segment pool plus its build-time dedup index.
#[derive(Clone, Debug, Default)]
pub struct BaseStore {
    ranges: Vec<RichRange>,
    root_counts: BTreeMap<i32, u16>,
    buckets: BTreeMap<u64, Vec<i32>>,
}

impl BaseStore {
    pub fn empty() -> Self {
        Self {
            // Slot 0 is the reserved sentinel.
            ranges: vec![RichRange::default()],
            root_counts: BTreeMap::new(),
            buckets: BTreeMap::new(),
        }
    }

    pub(crate) fn from_parts(
        ranges: Vec<RichRange>,
        root_counts: BTreeMap<i32, u16>,
        buckets: BTreeMap<u64, Vec<i32>>,
    ) -> Self {
        Self { ranges, root_counts, buckets }
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        // The sentinel alone counts as empty.
        self.ranges.len() <= 1
    }

    pub(crate) fn ranges(&self) -> &[RichRange] {
        &self.ranges
    }

    pub(crate) fn root_counts(&self) -> &BTreeMap<i32, u16> {
        &self.root_counts
    }

    pub(crate) fn buckets(&self) -> &BTreeMap<u64, Vec<i32>> {
        &self.buckets
    }

    /// The whole segment (header included) named by `root`, or `None` for
    /// the sentinel, out-of-range indices, and corrupt headers.
    pub fn slice(&self, root: i32) -> Option<&[RichRange]> {
        if root <= 0 || (root as usize) >= self.ranges.len() {
            return None;
        }
        let lo = root as usize;
        let seg_len = self.ranges[lo].begin() as usize;
        if seg_len == 0 {
            return None;
        }
        let hi = lo + seg_len;
        if hi > self.ranges.len() {
            return None;
        }
        Some(&self.ranges[lo..hi])
    }

    /// Header and payload of the segment named by `root`.
    pub fn payload(&self, root: i32) -> Option<(RichRange, &[RichRange])> {
        let seg = self.slice(root)?;
        Some((seg[0], &seg[1..]))
    }

    /// Intern a fully assembled segment (header first), returning its root
    /// index. Equal segments share one root and bump its refcount.
    fn intern(&mut self, seg: &[RichRange]) -> Result<i32, BuildError> {
        if seg.is_empty() || seg[0].begin() as usize != seg.len() {
            return Err(BuildError::EmptySegment);
        }

        let hash = fnv64a_ranges(seg);
        let cur = self.ranges.len() as i32;
        if cur >= BASE_ROOT_LIMIT {
            return Err(BuildError::RootIndexOverflow);
        }

        let mut reuse = None;
        if let Some(candidates) = self.buckets.get(&hash) {
            for &root in candidates {
                if self.slice(root).is_some_and(|existing| existing == seg) {
                    reuse = Some(root);
                    break;
                }
            }
        }
        if let Some(root) = reuse {
            *self.root_counts.entry(root).or_insert(0) += 1;
            return Ok(root);
        }

        self.buckets.entry(hash).or_default().push(cur);
        *self.root_counts.entry(cur).or_insert(0) += 1;
        self.ranges.extend_from_slice(seg);
        Ok(cur)
    }
}

/// FNV-1a 64 over each element's 12-byte little-endian representation
/// (begin, end, accessory), xored with the element count.
pub fn fnv64a_ranges(rrs: &[RichRange]) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;

    let mut h = OFFSET;
    let mut byte = |b: u8| {
        h ^= b as u64;
        h = h.wrapping_mul(PRIME);
    };
    for rr in rrs {
        for b in rr.begin().to_le_bytes() {
            byte(b);
        }
        for b in rr.end().to_le_bytes() {
            byte(b);
        }
        for b in rr.accessory.as_u64().to_le_bytes() {
            byte(b);
        }
    }
    h ^ rrs.len() as u64
}

/// Split a base segment into header and payload. Segments whose first
/// element does not encode the length are treated as all-payload.
pub fn split_header(seg: &[RichRange]) -> (Option<RichRange>, &[RichRange]) {
    if !seg.is_empty() && seg[0].begin() as usize == seg.len() {
        (Some(seg[0]), &seg[1..])
    } else {
        (None, seg)
    }
}

/// Visit every payload element of a base segment intersecting `q`, in
/// begin order. Overlays with different configs may overlap, so ends are
/// not monotone; the begin-sorted prefix bound is the only safe cut.
pub fn range_query_slice(seg: &[RichRange], q: Range, mut visit: impl FnMut(RichRange) -> bool) {
    if seg.is_empty() || q.is_empty() {
        return;
    }
    let (_, payload) = split_header(seg);
    if payload.is_empty() {
        return;
    }

    // Only the begin-sorted prefix with begin < q.end can intersect.
    let cut = payload.partition_point(|rr| rr.begin() < q.end);
    for rr in &payload[..cut] {
        if rr.end() > q.begin {
            if !visit(*rr) {
                return;
            }
        }
    }
}

/// Build one grid's base store and cell table from per-cell column lists.
///
/// Every non-empty LP list must start with its terrain range (`begin == 0`
/// with the base material bit); empty cells get a synthetic zero-height
/// terrain header. `hp_per_cell` is optional; each cell allows at most 16
/// unique subtile slices.
pub fn build_grid_from_columns(
    min_x: u16,
    min_y: u16,
    lp_per_cell: &[Vec<RichRange>],
    hp_per_cell: Option<&[[Vec<RichRange>; SUB_TILE_COUNT]]>,
) -> Result<Grid, BuildError> {
    if lp_per_cell.len() != GRID_CELL_COUNT {
        return Err(BuildError::WrongCellCount { got: lp_per_cell.len() });
    }
    if let Some(hp) = hp_per_cell {
        if hp.len() != GRID_CELL_COUNT {
            return Err(BuildError::WrongCellCount { got: hp.len() });
        }
    }

    let mut store = BaseStore::empty();
    let mut cells: Vec<CellColumn> = (0..GRID_CELL_COUNT).map(|_| CellColumn::default()).collect();
    let mut seg_buf: Vec<RichRange> = Vec::with_capacity(32);

    // LP segments.
    for (cell, src) in lp_per_cell.iter().enumerate() {
        seg_buf.clear();

        if src.is_empty() {
            // Synthetic zero-height terrain keeps the cell's root valid.
            let mut header = RichRange::new(0, 0, Texture::MATER_BASE, 0);
            header.range = Range::new(1, 0);
            seg_buf.push(header);
        } else {
            let terrain = src[0];
            if terrain.begin() != 0 || !terrain.texture().intersects(Texture::MATER_BASE) {
                return Err(BuildError::MissingTerrain { cell });
            }

            // Terrain folds into the header: begin carries the segment
            // length, end the terrain height, accessory the terrain's.
            let mut header = terrain;
            header.range = Range::new(src.len() as u16, terrain.end());
            seg_buf.push(header);
            seg_buf.extend_from_slice(&src[1..]);
            seg_buf[1..].sort();
        }

        let root = store.intern(&seg_buf)?;
        cells[cell].root = RootCode::Base(root);
    }

    // HP segments.
    if let Some(hp_cells) = hp_per_cell {
        for (cell, subs) in hp_cells.iter().enumerate() {
            // Per-cell palette: identical subtile slices share one slot.
            let mut local_spans: Vec<&Vec<RichRange>> = Vec::new();
            let mut local_buckets: BTreeMap<u64, Vec<u8>> = BTreeMap::new();

            for (sub, slice) in subs.iter().enumerate() {
                if slice.is_empty() {
                    continue;
                }

                let hash = fnv64a_ranges(slice);
                let mut slot = None;
                if let Some(candidates) = local_buckets.get(&hash) {
                    for &si in candidates {
                        if local_spans[si as usize] == slice {
                            slot = Some(si);
                            break;
                        }
                    }
                }
                let slot = match slot {
                    Some(si) => si,
                    None => {
                        if local_spans.len() >= SUB_TILE_COUNT {
                            return Err(BuildError::PaletteOverflow { cell });
                        }
                        let si = local_spans.len() as u8;
                        local_spans.push(slice);
                        local_buckets.entry(hash).or_default().push(si);
                        si
                    }
                };

                let hp = cells[cell]
                    .high_precision
                    .get_or_insert_with(|| Box::new(HighPrecisionColumn::default()));
                hp.same.set(sub, slot);
                hp.has |= 1 << sub;
            }

            if local_spans.is_empty() {
                continue;
            }

            let mut spans = vec![RootCode::Nil; local_spans.len()];
            for (i, payload) in local_spans.iter().enumerate() {
                seg_buf.clear();
                let mut header = RichRange::default();
                header.range = Range::new(payload.len() as u16 + 1, 0);
                seg_buf.push(header);
                seg_buf.extend_from_slice(payload);
                seg_buf[1..].sort();

                let root = store.intern(&seg_buf)?;
                spans[i] = RootCode::Base(root);
            }
            if let Some(hp) = cells[cell].high_precision.as_mut() {
                hp.spans = spans;
            }
        }
    }

    Ok(Grid::from_parts(min_x, min_y, store, cells))
}
