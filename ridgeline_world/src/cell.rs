// Per-cell state: encoded roots and the high-precision palette.
//
// A cell's column data is named by a single `RootCode`, which is one of
// four things: nothing at all (`Nil`), an override that shadows any base
// data (`Shadow`), a reference into the grid's immutable base store
// (`Base`), or the root of a mutable interval tree in the grid's node pool
// (`Dirty`). On disk the four states share one `i32`:
//
//   code <  0           Nil
//   code == 0           Shadow
//   0 < code < 2^30     Base(code)
//   code >= 2^30        Dirty(code - 2^30)
//
// In memory the enum is used everywhere; the numeric form exists only for
// the wire (`store.rs`).
//
// High-precision cells carry up to 16 palette slots shared across their 16
// subtiles: `has` marks which subtiles have an override, `same` maps each
// subtile to a slot, and `spans` holds one `RootCode` per slot. Sharing is
// observed by counting `same` references, not stored per slot; writers go
// through `ensure_writable_span`, which copy-on-writes a shared dirty slot
// (base slots are immutable and safe to share by value).

use crate::tree::{NodePool, NIL};
use crate::types::SUB_TILE_COUNT;

/// Base root indices must stay below this; at and above is the dirty
/// encoding region.
pub const BASE_ROOT_LIMIT: i32 = 1 << 30;

/// The tri-state (plus shadow) column root. See the module header for the
/// on-disk encoding.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RootCode {
    /// No data; reads fall back to base where a base reference exists.
    Nil,
    /// Explicitly empty; shadows any base data.
    Shadow,
    /// Segment start index in the grid's base store.
    Base(i32),
    /// Root node id of a dirty tree in the grid's node pool.
    Dirty(i32),
}

impl RootCode {
    pub fn decode(raw: i32) -> RootCode {
        if raw == 0 {
            RootCode::Shadow
        } else if raw < 0 {
            RootCode::Nil
        } else if raw < BASE_ROOT_LIMIT {
            RootCode::Base(raw)
        } else {
            RootCode::Dirty(raw - BASE_ROOT_LIMIT)
        }
    }

    pub fn encode(self) -> i32 {
        match self {
            RootCode::Nil => NIL,
            RootCode::Shadow => 0,
            RootCode::Base(idx) => idx,
            RootCode::Dirty(node) => BASE_ROOT_LIMIT + node,
        }
    }

    pub fn is_dirty(self) -> bool {
        matches!(self, RootCode::Dirty(_))
    }

    pub fn is_base(self) -> bool {
        matches!(self, RootCode::Base(_))
    }

    /// Nil or shadow: no tree and no base segment of its own.
    pub fn is_empty(self) -> bool {
        matches!(self, RootCode::Nil | RootCode::Shadow)
    }

    /// Wrap a dirty tree root, mapping an empty tree back to `Nil`.
    pub fn from_tree_root(root: i32) -> RootCode {
        if root < 0 {
            RootCode::Nil
        } else {
            RootCode::Dirty(root)
        }
    }

    /// The dirty tree root, or `NIL` for every other state.
    pub fn tree_root(self) -> i32 {
        match self {
            RootCode::Dirty(node) => node,
            _ => NIL,
        }
    }
}

impl Default for RootCode {
    fn default() -> Self {
        RootCode::Nil
    }
}

// ---------------------------------------------------------------------------
// SameMap
// ---------------------------------------------------------------------------

/// 16 packed 4-bit palette indices: subtile `i` occupies bits `4i..4i+4`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SameMap(pub u64);

impl SameMap {
    pub fn get(self, sub_idx: usize) -> u8 {
        ((self.0 >> (sub_idx * 4)) & 0xF) as u8
    }

    pub fn set(&mut self, sub_idx: usize, slot: u8) {
        let shift = sub_idx * 4;
        let mask = 0xFu64 << shift;
        self.0 = (self.0 & !mask) | (((slot & 0xF) as u64) << shift);
    }
}

// ---------------------------------------------------------------------------
// HighPrecisionColumn
// ---------------------------------------------------------------------------

/// Subtile overrides for one cell: a `has` bitmask, the subtile→slot
/// palette mapping, and up to 16 slot roots.
#[derive(Clone, Debug, Default)]
pub struct HighPrecisionColumn {
    pub has: u16,
    pub same: SameMap,
    pub spans: Vec<RootCode>,
}

impl HighPrecisionColumn {
    /// Whether the subtile carries an override. Cleared subtiles fall back
    /// to base HP data if any exists.
    pub fn has_span(&self, sub_idx: usize) -> bool {
        sub_idx < SUB_TILE_COUNT && (self.has & (1 << sub_idx)) != 0
    }

    fn set_has(&mut self, sub_idx: usize, on: bool) {
        if sub_idx >= SUB_TILE_COUNT {
            return;
        }
        let mask = 1u16 << sub_idx;
        if on {
            self.has |= mask;
        } else {
            self.has &= !mask;
        }
    }

    /// The subtile's span root, if it has one.
    pub fn span_root(&self, sub_idx: usize) -> Option<RootCode> {
        if !self.has_span(sub_idx) {
            return None;
        }
        let slot = self.same.get(sub_idx) as usize;
        self.spans.get(slot).copied()
    }

    /// How many overridden subtiles reference the slot.
    pub fn ref_count(&self, slot: u8) -> usize {
        (0..SUB_TILE_COUNT)
            .filter(|&sub| self.has & (1 << sub) != 0 && self.same.get(sub) == slot)
            .count()
    }

    fn replace_span_index(&mut self, old: u8, new: u8) {
        for sub in 0..SUB_TILE_COUNT {
            if self.has & (1 << sub) != 0 && self.same.get(sub) == old {
                self.same.set(sub, new);
            }
        }
    }

    /// Reclaim the slot if it is empty and unreferenced, swap-removing the
    /// tail slot into its place and remapping any subtile that pointed at
    /// the tail.
    pub fn try_reclaim_empty_span(&mut self, slot: u8) {
        let idx = slot as usize;
        if idx >= self.spans.len() {
            return;
        }
        if !self.spans[idx].is_empty() {
            return;
        }
        if self.ref_count(slot) != 0 {
            return;
        }

        let last = (self.spans.len() - 1) as u8;
        if slot == last {
            self.spans.pop();
            return;
        }
        self.spans[idx] = self.spans[last as usize];
        self.spans.pop();
        self.replace_span_index(last, slot);
    }

    /// Clear the subtile's override so it falls back to base HP; reclaim
    /// its slot if possible. Returns whether the whole column is now empty
    /// (caller drops it).
    pub fn clear_sub(&mut self, sub_idx: usize) -> bool {
        if !self.has_span(sub_idx) {
            return self.has == 0;
        }
        let old_slot = self.same.get(sub_idx);
        self.set_has(sub_idx, false);
        self.same.set(sub_idx, 0);
        self.try_reclaim_empty_span(old_slot);
        self.has == 0
    }

    /// Allocate a palette slot, reusing an unreferenced one at capacity.
    /// All 16 slots referenced at once is a caller bug.
    fn alloc_span(&mut self) -> u8 {
        if self.spans.len() < SUB_TILE_COUNT {
            self.spans.push(RootCode::Nil);
            return (self.spans.len() - 1) as u8;
        }
        for slot in 0..self.spans.len() as u8 {
            if self.ref_count(slot) == 0 {
                self.spans[slot as usize] = RootCode::Nil;
                return slot;
            }
        }
        panic!("high-precision palette exhausted: all {SUB_TILE_COUNT} slots referenced");
    }

    /// Make the subtile's slot exclusively writable and return it. A slot
    /// shared with other subtiles is split: dirty roots are cloned through
    /// the pool, base and nil roots copy by value.
    pub fn ensure_writable_span(&mut self, sub_idx: usize, pool: &mut NodePool) -> Option<u8> {
        if sub_idx >= SUB_TILE_COUNT {
            return None;
        }

        if !self.has_span(sub_idx) {
            let slot = self.alloc_span();
            self.set_has(sub_idx, true);
            self.same.set(sub_idx, slot);
            return Some(slot);
        }

        let slot = self.same.get(sub_idx);
        if slot as usize >= self.spans.len() {
            let slot = self.alloc_span();
            self.same.set(sub_idx, slot);
            return Some(slot);
        }

        if self.ref_count(slot) == 1 {
            return Some(slot);
        }

        // Shared: split off a private copy.
        let old = self.spans[slot as usize];
        let new_slot = self.alloc_span();
        self.spans[new_slot as usize] = match old {
            RootCode::Dirty(root) => RootCode::from_tree_root(pool.clone_tree(root)),
            other => other,
        };
        self.same.set(sub_idx, new_slot);
        Some(new_slot)
    }

    /// Like `ensure_writable_span`, but the caller will overwrite the slot
    /// wholesale, so a shared slot is remapped without cloning.
    pub fn ensure_writable_span_overwrite(&mut self, sub_idx: usize) -> Option<u8> {
        if sub_idx >= SUB_TILE_COUNT {
            return None;
        }

        if !self.has_span(sub_idx) {
            let slot = self.alloc_span();
            self.set_has(sub_idx, true);
            self.same.set(sub_idx, slot);
            return Some(slot);
        }

        let slot = self.same.get(sub_idx);
        if slot as usize >= self.spans.len() {
            let slot = self.alloc_span();
            self.same.set(sub_idx, slot);
            return Some(slot);
        }

        if self.ref_count(slot) == 1 {
            return Some(slot);
        }

        let new_slot = self.alloc_span();
        self.same.set(sub_idx, new_slot);
        Some(new_slot)
    }

    /// Whether any slot still references a base segment.
    pub fn any_base_span(&self) -> bool {
        self.has != 0 && self.spans.iter().any(|s| s.is_base())
    }
}

// ---------------------------------------------------------------------------
// CellColumn
// ---------------------------------------------------------------------------

/// One cell's column state: the LP root plus the optional HP column.
#[derive(Clone, Debug, Default)]
pub struct CellColumn {
    pub root: RootCode,
    pub high_precision: Option<Box<HighPrecisionColumn>>,
}

impl CellColumn {
    pub fn has_any_hp(&self) -> bool {
        self.high_precision.as_ref().is_some_and(|hp| hp.has != 0)
    }

    pub fn has_base_hp(&self) -> bool {
        self.high_precision.as_ref().is_some_and(|hp| hp.any_base_span())
    }
}
