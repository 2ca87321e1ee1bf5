// Grid persistence: a versioned little-endian wire format.
//
// Only built grids persist — base store, dedup index, and per-cell roots.
// Dirty trees are runtime state: writing a grid that has materialized any
// cell is an `InvalidInput` error, and a root code from the dirty region
// on the read side is `InvalidData`.
//
// Layout (all little-endian):
//
//   [u8; 4] magic "RLG1" ; u16 version (= 1)
//   u16 base_x ; u16 base_y
//   u32 base_len ; base_len × (u16 begin, u16 end, u64 accessory)
//   u32 bucket_count ; per bucket: u64 hash, u32 count, count × i32 root
//   u32 refcount_entries ; per entry: i32 root, u16 refs
//   per cell (1024, row-major):
//     i32 root_code
//     u8  has_hp
//     if has_hp: u16 has_mask ; u64 same_bits ; u8 span_count ;
//                span_count × i32 root_code
//
// Read-side rejections (`InvalidData`): wrong magic or version, oversized
// pools, dirty root codes, base roots outside the pool, span counts above
// 16, and `has_mask` bits whose palette slot is missing.

use std::collections::BTreeMap;
use std::io::{self, Read, Write};

use crate::base::BaseStore;
use crate::binio::{BinReader, BinWriter};
use crate::cell::{CellColumn, HighPrecisionColumn, RootCode, SameMap};
use crate::grid::Grid;
use crate::types::{Accessory, Range, RichRange, GRID_CELL_COUNT, SUB_TILE_COUNT};

const MAGIC: [u8; 4] = *b"RLG1";
const VERSION: u16 = 1;

/// Allocation guard against malformed length prefixes.
const MAX_BASE_RANGES: u32 = 1 << 26;
const MAX_BUCKETS: u32 = 1 << 24;

fn invalid(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

/// Serialize a built grid. Fails with `InvalidInput` if any cell has been
/// materialized to a dirty tree.
pub fn write_grid<W: Write>(grid: &Grid, out: W) -> io::Result<()> {
    let mut w = BinWriter::new(out);

    w.write_bytes(&MAGIC)?;
    w.write_u16(VERSION)?;
    w.write_u16(grid.base_x())?;
    w.write_u16(grid.base_y())?;

    let base = grid.base();
    let ranges = base.ranges();
    w.write_u32(ranges.len() as u32)?;
    for rr in ranges {
        w.write_u16(rr.begin())?;
        w.write_u16(rr.end())?;
        w.write_u64(rr.accessory.as_u64())?;
    }

    let buckets = base.buckets();
    w.write_u32(buckets.len() as u32)?;
    for (hash, roots) in buckets {
        w.write_u64(*hash)?;
        w.write_u32(roots.len() as u32)?;
        for root in roots {
            w.write_i32(*root)?;
        }
    }

    let counts = base.root_counts();
    w.write_u32(counts.len() as u32)?;
    for (root, refs) in counts {
        w.write_i32(*root)?;
        w.write_u16(*refs)?;
    }

    for cell_idx in 0..GRID_CELL_COUNT {
        let cell = grid.cell(cell_idx);
        if cell.root.is_dirty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("cell {cell_idx}: dirty roots cannot be persisted"),
            ));
        }
        w.write_i32(cell.root.encode())?;

        match cell.high_precision.as_deref() {
            None => w.write_u8(0)?,
            Some(hp) => {
                for span in &hp.spans {
                    if span.is_dirty() {
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidInput,
                            format!("cell {cell_idx}: dirty HP spans cannot be persisted"),
                        ));
                    }
                }
                w.write_u8(1)?;
                w.write_u16(hp.has)?;
                w.write_u64(hp.same.0)?;
                w.write_u8(hp.spans.len() as u8)?;
                for span in &hp.spans {
                    w.write_i32(span.encode())?;
                }
            }
        }
    }

    w.flush()
}

/// Deserialize a grid written by `write_grid`, validating every root.
pub fn read_grid<R: Read>(input: R) -> io::Result<Grid> {
    let mut r = BinReader::new(input);

    let mut magic = [0u8; 4];
    r.read_bytes(&mut magic)?;
    if magic != MAGIC {
        return Err(invalid("bad magic"));
    }
    let version = r.read_u16()?;
    if version != VERSION {
        return Err(invalid(format!("unsupported version {version}")));
    }

    let base_x = r.read_u16()?;
    let base_y = r.read_u16()?;

    let base_len = r.read_u32()?;
    if base_len == 0 || base_len > MAX_BASE_RANGES {
        return Err(invalid(format!("base pool length {base_len} out of range")));
    }
    let mut ranges = Vec::with_capacity(base_len as usize);
    for _ in 0..base_len {
        let begin = r.read_u16()?;
        let end = r.read_u16()?;
        let accessory = Accessory::from_u64(r.read_u64()?);
        ranges.push(RichRange { range: Range::new(begin, end), accessory });
    }

    let bucket_count = r.read_u32()?;
    if bucket_count > MAX_BUCKETS {
        return Err(invalid(format!("bucket count {bucket_count} out of range")));
    }
    let mut buckets = BTreeMap::new();
    for _ in 0..bucket_count {
        let hash = r.read_u64()?;
        let count = r.read_u32()?;
        if count as usize > ranges.len() {
            return Err(invalid("bucket larger than the base pool"));
        }
        let mut roots = Vec::with_capacity(count as usize);
        for _ in 0..count {
            roots.push(r.read_i32()?);
        }
        buckets.insert(hash, roots);
    }

    let refcount_entries = r.read_u32()?;
    if refcount_entries as usize > ranges.len() {
        return Err(invalid("refcount table larger than the base pool"));
    }
    let mut root_counts = BTreeMap::new();
    for _ in 0..refcount_entries {
        let root = r.read_i32()?;
        let refs = r.read_u16()?;
        root_counts.insert(root, refs);
    }

    let check_root = |code: RootCode, what: &str| -> io::Result<RootCode> {
        match code {
            RootCode::Dirty(_) => Err(invalid(format!("{what}: dirty root on the wire"))),
            RootCode::Base(idx) if idx as usize >= ranges.len() => {
                Err(invalid(format!("{what}: base root {idx} outside the pool")))
            }
            other => Ok(other),
        }
    };

    let mut cells = Vec::with_capacity(GRID_CELL_COUNT);
    for cell_idx in 0..GRID_CELL_COUNT {
        let root = check_root(RootCode::decode(r.read_i32()?), "cell root")?;
        let mut cell = CellColumn { root, high_precision: None };

        if r.read_u8()? != 0 {
            let has = r.read_u16()?;
            let same = SameMap(r.read_u64()?);
            let span_count = r.read_u8()? as usize;
            if span_count > SUB_TILE_COUNT {
                return Err(invalid(format!("cell {cell_idx}: {span_count} palette slots")));
            }
            let mut spans = Vec::with_capacity(span_count);
            for _ in 0..span_count {
                spans.push(check_root(RootCode::decode(r.read_i32()?), "span root")?);
            }

            for sub in 0..SUB_TILE_COUNT {
                if has & (1 << sub) != 0 && same.get(sub) as usize >= span_count {
                    return Err(invalid(format!(
                        "cell {cell_idx}: subtile {sub} maps to a missing palette slot"
                    )));
                }
            }

            cell.high_precision = Some(Box::new(HighPrecisionColumn { has, same, spans }));
        }
        cells.push(cell);
    }

    let base = BaseStore::from_parts(ranges, root_counts, buckets);
    Ok(Grid::from_parts(base_x, base_y, base, cells))
}
