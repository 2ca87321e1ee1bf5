// ridgeline_world — voxel column world model.
//
// This crate stores a world as vertical stacks of blocking height intervals
// ("columns") behind a two-level spatial index: an `Env` covers a rectangle
// of 32×32-cell `Grid`s, and every 1 m × 1 m cell can be refined into a 4×4
// lattice of high-precision subtiles. Column data is split between an
// immutable, deduplicated base store built once per grid and per-cell
// mutable interval trees materialized on first write.
//
// The companion crate `ridgeline_nav` layers gap queries and the planner on
// top of this one; nothing here knows about agents or pathfinding.
//
// **Critical constraint: determinism.** Anything that feeds serialization
// or cross-run comparison iterates in a defined order — `BTreeMap` and
// `BTreeSet`, never `HashMap`. Query results depend only on the stored
// columns, not on mutation history beyond the ranges it produced.

pub mod base;
pub mod binio;
pub mod cell;
pub mod env;
pub mod grid;
pub mod pool;
pub mod store;
pub mod tree;
pub mod types;

pub use base::{build_grid_from_columns, BaseStore, BuildError};
pub use cell::{CellColumn, HighPrecisionColumn, RootCode, SameMap};
pub use env::{Env, RouteCtx};
pub use grid::{ColumnSource, Grid};
pub use pool::SlabPool;
pub use store::{read_grid, write_grid};
pub use tree::{BestSurface, NodePool, NIL};
pub use types::{
    Accessory, Point2d, Point3d, Range, Rect, RichRange, SnapRichRange, Texture,
    GRID_CELL_COUNT, GRID_SIZE, HEIGHT_SCALE, MAX_RANGE_END, SUB_ACCURACY, SUB_TILE_COUNT,
};
