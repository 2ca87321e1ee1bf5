// Core value types shared across the world model.
//
// Heights are fixed-point integers in units of 1/20 m, so 20 = 1 m and the
// vertical precision is 0.05 m. A `Range` is the half-open interval
// `[begin, end)` in those units; a `RichRange` tags a range with its
// material `Texture` and an opaque `Config` channel id. Horizontal
// coordinates are integer metres; a `Point2d` optionally addresses one of
// the 16 quarter-metre subtiles inside its cell via 1-based offsets.
//
// All value types derive `Serialize`/`Deserialize` for persistence and
// test fixtures.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign, Not};

/// Cells per grid edge. Must stay a power of two — routing shifts by 5.
pub const GRID_SIZE: u16 = 32;

/// Cells per grid (32 × 32).
pub const GRID_CELL_COUNT: usize = (GRID_SIZE as usize) * (GRID_SIZE as usize);

/// Exclusive upper bound for stored heights; values above are reserved.
pub const MAX_RANGE_END: u16 = 0xFF00;

/// Subtiles per cell edge (each subtile is 0.25 m × 0.25 m).
pub const SUB_ACCURACY: u8 = 4;

/// Subtiles per cell (4 × 4).
pub const SUB_TILE_COUNT: usize = (SUB_ACCURACY as usize) * (SUB_ACCURACY as usize);

/// Height units per metre.
pub const HEIGHT_SCALE: u16 = 20;

// ---------------------------------------------------------------------------
// Range
// ---------------------------------------------------------------------------

/// A half-open height interval `[begin, end)` in 1/20 m units.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Range {
    pub begin: u16,
    pub end: u16,
}

impl Range {
    /// The full representable height band.
    pub const MAX: Range = Range { begin: 0, end: MAX_RANGE_END };

    pub const fn new(begin: u16, end: u16) -> Self {
        Self { begin, end }
    }

    /// Whether `h` lies inside `[begin, end)`.
    pub fn contains(self, h: u16) -> bool {
        self.begin <= h && h < self.end
    }

    pub fn len(self) -> u16 {
        self.end - self.begin
    }

    pub fn is_empty(self) -> bool {
        self.end <= self.begin
    }

    pub fn is_valid(self) -> bool {
        self.begin <= self.end
    }

    /// Whether the two intervals share at least one height.
    pub fn overlaps(self, other: Range) -> bool {
        self.begin.max(other.begin) < self.end.min(other.end)
    }

    /// Intersection of the two intervals; empty (default) when disjoint.
    pub fn intersect(self, other: Range) -> Range {
        if self.end < other.begin || other.end < self.begin {
            return Range::default();
        }
        Range::new(self.begin.max(other.begin), self.end.min(other.end))
    }
}

impl fmt::Display for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.begin, self.end)
    }
}

// ---------------------------------------------------------------------------
// Texture
// ---------------------------------------------------------------------------

const TEX_OFFSET_MATERIAL: u32 = 0;
const TEX_OFFSET_PROPERTY: u32 = TEX_OFFSET_MATERIAL + 8;
const TEX_OFFSET_BLOCK: u32 = TEX_OFFSET_PROPERTY + 12;
const TEX_OFFSET_CLASS: u32 = TEX_OFFSET_BLOCK + 9;

/// A 32-bit material bitmask attached to a range.
///
/// The bit space is partitioned into material bits (what the range is),
/// property bits (water/solid/...), and block/class regions reserved for
/// interaction typing. Masks compose with `|` and test with `intersects`.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Texture(pub u32);

impl Texture {
    pub const NONE: Texture = Texture(0);

    // Material bits.
    /// Ground-bearing surface material; water surfaces included.
    pub const MATER_BASE: Texture = Texture(1 << TEX_OFFSET_MATERIAL);
    /// Voxel-built material.
    pub const MATER_VOXEL: Texture = Texture(1 << (TEX_OFFSET_MATERIAL + 1));
    /// Coarse blocking volume.
    pub const MATER_OBSTACLE: Texture = Texture(1 << (TEX_OFFSET_MATERIAL + 2));
    /// Fine-grained collider.
    pub const MATER_COLLIDER: Texture = Texture(1 << (TEX_OFFSET_MATERIAL + 3));
    /// Vehicle body (collider specialization).
    pub const MATER_VEHICLE: Texture = Texture(1 << (TEX_OFFSET_MATERIAL + 4));
    /// Monster body (collider specialization).
    pub const MATER_MONSTER: Texture = Texture(1 << (TEX_OFFSET_MATERIAL + 5));

    // Property bits.
    pub const PROP_WATER: Texture = Texture(1 << TEX_OFFSET_PROPERTY);
    pub const PROP_SOLID: Texture = Texture(1 << (TEX_OFFSET_PROPERTY + 1));
    pub const PROP_WATER_DEEP: Texture = Texture(1 << (TEX_OFFSET_PROPERTY + 2));
    pub const PROP_HUMAN: Texture = Texture(1 << (TEX_OFFSET_PROPERTY + 3));

    /// Block-type region sentinel: no block type at all.
    pub const BLOCK_NONE: Texture = Texture(1 << (TEX_OFFSET_CLASS - 1));

    // Composite masks.
    pub const MASK_EVERYTHING: Texture = Texture(u32::MAX);
    pub const MASK_EVERY_MATERIAL: Texture = Texture((1 << TEX_OFFSET_PROPERTY) - 1);
    pub const MASK_EVERY_PROPERTY: Texture =
        Texture(((1 << TEX_OFFSET_BLOCK) - 1) & !((1 << TEX_OFFSET_PROPERTY) - 1));
    pub const MASK_GENERAL_BASE: Texture =
        Texture(Self::MATER_BASE.0 | Self::MATER_VOXEL.0);
    pub const MASK_GENERAL_COLLIDER: Texture =
        Texture(Self::MATER_COLLIDER.0 | Self::MATER_VEHICLE.0 | Self::MATER_MONSTER.0);
    pub const MASK_GENERAL_WATER: Texture =
        Texture(Self::PROP_WATER.0 | Self::PROP_WATER_DEEP.0);

    /// Whether any bit of `mask` is set in `self`.
    pub fn intersects(self, mask: Texture) -> bool {
        self.0 & mask.0 != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for Texture {
    type Output = Texture;
    fn bitor(self, rhs: Texture) -> Texture {
        Texture(self.0 | rhs.0)
    }
}

impl BitOrAssign for Texture {
    fn bitor_assign(&mut self, rhs: Texture) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for Texture {
    type Output = Texture;
    fn bitand(self, rhs: Texture) -> Texture {
        Texture(self.0 & rhs.0)
    }
}

impl Not for Texture {
    type Output = Texture;
    fn not(self) -> Texture {
        Texture(!self.0)
    }
}

// ---------------------------------------------------------------------------
// Accessory / RichRange / SnapRichRange
// ---------------------------------------------------------------------------

/// The attribute tag attached to a range: its texture plus an opaque
/// 32-bit channel id used for exact-match removal.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Accessory {
    pub texture: Texture,
    pub config: u32,
}

impl Accessory {
    pub const fn new(texture: Texture, config: u32) -> Self {
        Self { texture, config }
    }

    /// Packed 64-bit key: `texture << 32 | config`.
    pub fn as_u64(self) -> u64 {
        ((self.texture.0 as u64) << 32) | self.config as u64
    }

    pub fn from_u64(v: u64) -> Self {
        Self { texture: Texture((v >> 32) as u32), config: v as u32 }
    }
}

/// A height interval with its accessory.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RichRange {
    pub range: Range,
    pub accessory: Accessory,
}

impl RichRange {
    pub const fn new(begin: u16, end: u16, texture: Texture, config: u32) -> Self {
        Self {
            range: Range::new(begin, end),
            accessory: Accessory::new(texture, config),
        }
    }

    pub fn begin(self) -> u16 {
        self.range.begin
    }

    pub fn end(self) -> u16 {
        self.range.end
    }

    pub fn texture(self) -> Texture {
        self.accessory.texture
    }
}

// Total order: (begin, end, accessory-as-u64). This is the tree's BST order
// and the snapshot comparison order; keep it stable.
impl Ord for RichRange {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.range
            .begin
            .cmp(&other.range.begin)
            .then(self.range.end.cmp(&other.range.end))
            .then(self.accessory.as_u64().cmp(&other.accessory.as_u64()))
    }
}

impl PartialOrd for RichRange {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for RichRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}#{:08x}/{}",
            self.range, self.accessory.texture.0, self.accessory.config
        )
    }
}

/// A flattened query result: a gap or surface with the texture that
/// produced it. Snapshots carry no config channel.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapRichRange {
    pub range: Range,
    pub texture: Texture,
}

// ---------------------------------------------------------------------------
// Points and rectangles
// ---------------------------------------------------------------------------

/// One 2D query position. Offsets of zero address the whole 1 m cell (a
/// low-precision query); offsets in `1..=4` address one quarter-metre
/// subtile. A non-zero x offset implies a non-zero y offset.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Point2d {
    pub x: u16,
    pub y: u16,
    pub x_offset: u8,
    pub y_offset: u8,
}

impl Point2d {
    pub const fn new(x: u16, y: u16) -> Self {
        Self { x, y, x_offset: 0, y_offset: 0 }
    }

    pub const fn with_offsets(x: u16, y: u16, x_offset: u8, y_offset: u8) -> Self {
        Self { x, y, x_offset, y_offset }
    }

    pub fn is_low_precision(self) -> bool {
        self.x_offset == 0
    }

    /// The same cell addressed as a whole-cell query.
    pub fn low_precision_point(self) -> Point2d {
        Point2d::new(self.x, self.y)
    }

    /// Subtile index `0..16` for a high-precision point; `None` for
    /// low-precision points or out-of-range offsets.
    pub fn sub_idx(self) -> Option<usize> {
        if self.x_offset == 0 || self.y_offset == 0 {
            return None;
        }
        if self.x_offset > SUB_ACCURACY || self.y_offset > SUB_ACCURACY {
            return None;
        }
        let sx = (self.x_offset - 1) as usize;
        let sy = (self.y_offset - 1) as usize;
        Some((sx << 2) | sy)
    }

    /// 1-based offsets for a subtile index.
    pub fn offsets_of_sub(sub_idx: usize) -> (u8, u8) {
        ((sub_idx >> 2) as u8 + 1, (sub_idx & 3) as u8 + 1)
    }

    /// Visit all 16 subtile points of this cell; stop early on `false`.
    pub fn for_each_subtile(self, mut f: impl FnMut(Point2d) -> bool) {
        for x in 1..=SUB_ACCURACY {
            for y in 1..=SUB_ACCURACY {
                if !f(Point2d::with_offsets(self.x, self.y, x, y)) {
                    return;
                }
            }
        }
    }

    /// Wrap float world coordinates into the subtile containing them.
    /// Range checking is the caller's job.
    pub fn from_world(xf: f32, yf: f32) -> Point2d {
        let x = xf as u16;
        let y = yf as u16;
        let sub_len = 1.0 / SUB_ACCURACY as f32;
        Point2d {
            x,
            y,
            x_offset: ((xf - x as f32) / sub_len) as u8 + 1,
            y_offset: ((yf - y as f32) / sub_len) as u8 + 1,
        }
    }
}

impl fmt::Display for Point2d {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}+{}, {}+{})", self.x, self.x_offset, self.y, self.y_offset)
    }
}

/// A 2D position plus the height interval an operation applies to.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Point3d {
    pub x: u16,
    pub y: u16,
    pub x_offset: u8,
    pub y_offset: u8,
    pub h: u16,
    pub range_end: u16,
}

impl Point3d {
    pub fn point2d(self) -> Point2d {
        Point2d::with_offsets(self.x, self.y, self.x_offset, self.y_offset)
    }

    pub fn height_range(self) -> Range {
        Range::new(self.h, self.range_end)
    }
}

/// An axis-aligned rectangle: `min` inclusive, `max` exclusive.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rect {
    pub min: Point2d,
    pub max: Point2d,
}

impl Rect {
    pub fn new(min_x: u16, min_y: u16, max_x: u16, max_y: u16) -> Self {
        Self { min: Point2d::new(min_x, min_y), max: Point2d::new(max_x, max_y) }
    }

    pub fn width(self) -> u16 {
        self.max.x - self.min.x
    }

    pub fn height(self) -> u16 {
        self.max.y - self.min.y
    }

    pub fn contains_point(self, p: Point2d) -> bool {
        self.min.x <= p.x && p.x < self.max.x && self.min.y <= p.y && p.y < self.max.y
    }
}

impl fmt::Display for Rect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.min, self.max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_contains_is_half_open() {
        let r = Range::new(10, 20);
        assert!(r.contains(10));
        assert!(r.contains(19));
        assert!(!r.contains(20));
        assert!(!r.contains(9));
    }

    #[test]
    fn range_intersect_disjoint_is_empty() {
        let a = Range::new(0, 5);
        let b = Range::new(10, 20);
        assert!(a.intersect(b).is_empty());
        assert!(!a.overlaps(b));
    }

    #[test]
    fn range_intersect_touching_is_empty_but_not_default_on_overlap() {
        let a = Range::new(0, 10);
        let b = Range::new(10, 20);
        // Touching ranges do not overlap.
        assert!(!a.overlaps(b));
        assert_eq!(a.intersect(b), Range::new(10, 10));

        let c = Range::new(5, 15);
        assert!(a.overlaps(c));
        assert_eq!(a.intersect(c), Range::new(5, 10));
    }

    #[test]
    fn accessory_u64_roundtrip() {
        let acc = Accessory::new(Texture::MATER_OBSTACLE | Texture::PROP_WATER, 1234);
        assert_eq!(Accessory::from_u64(acc.as_u64()), acc);
        // Texture occupies the high half.
        assert_eq!(acc.as_u64() >> 32, (Texture::MATER_OBSTACLE | Texture::PROP_WATER).0 as u64);
    }

    #[test]
    fn rich_range_total_order() {
        let a = RichRange::new(0, 10, Texture::MATER_BASE, 0);
        let b = RichRange::new(0, 12, Texture::MATER_BASE, 0);
        let c = RichRange::new(1, 5, Texture::MATER_BASE, 0);
        let d = RichRange::new(0, 10, Texture::MATER_BASE, 7);
        assert!(a < b);
        assert!(b < c);
        assert!(a < d);
    }

    #[test]
    fn texture_mask_regions_are_disjoint() {
        assert!(!Texture::MASK_EVERY_MATERIAL.intersects(Texture::MASK_EVERY_PROPERTY));
        assert!(Texture::MASK_EVERY_MATERIAL.intersects(Texture::MATER_MONSTER));
        assert!(Texture::MASK_EVERY_PROPERTY.intersects(Texture::PROP_HUMAN));
        assert!(Texture::MASK_GENERAL_WATER.intersects(Texture::PROP_WATER_DEEP));
    }

    #[test]
    fn sub_idx_mapping() {
        // Offsets (1,1) map to subtile 0; x is the major axis.
        assert_eq!(Point2d::with_offsets(0, 0, 1, 1).sub_idx(), Some(0));
        assert_eq!(Point2d::with_offsets(0, 0, 1, 2).sub_idx(), Some(1));
        assert_eq!(Point2d::with_offsets(0, 0, 2, 1).sub_idx(), Some(4));
        assert_eq!(Point2d::with_offsets(0, 0, 4, 4).sub_idx(), Some(15));
        assert_eq!(Point2d::new(0, 0).sub_idx(), None);
        assert_eq!(Point2d::with_offsets(0, 0, 5, 1).sub_idx(), None);
    }

    #[test]
    fn sub_idx_offsets_roundtrip() {
        for sub in 0..SUB_TILE_COUNT {
            let (xo, yo) = Point2d::offsets_of_sub(sub);
            let p = Point2d::with_offsets(3, 4, xo, yo);
            assert_eq!(p.sub_idx(), Some(sub));
        }
    }

    #[test]
    fn for_each_subtile_visits_sixteen() {
        let mut n = 0;
        Point2d::new(2, 2).for_each_subtile(|p| {
            assert!(p.sub_idx().is_some());
            n += 1;
            true
        });
        assert_eq!(n, SUB_TILE_COUNT);
    }

    #[test]
    fn from_world_picks_the_containing_subtile() {
        let p = Point2d::from_world(3.1, 7.8);
        assert_eq!((p.x, p.y), (3, 7));
        assert_eq!((p.x_offset, p.y_offset), (1, 4));
    }

    #[test]
    fn rect_contains_half_open() {
        let r = Rect::new(0, 0, 32, 32);
        assert!(r.contains_point(Point2d::new(0, 0)));
        assert!(r.contains_point(Point2d::new(31, 31)));
        assert!(!r.contains_point(Point2d::new(32, 0)));
    }

    #[test]
    fn value_types_serialize_roundtrip() {
        let rr = RichRange::new(5, 40, Texture::MATER_COLLIDER, 9);
        let json = serde_json::to_string(&rr).unwrap();
        let back: RichRange = serde_json::from_str(&json).unwrap();
        assert_eq!(rr, back);
    }
}
