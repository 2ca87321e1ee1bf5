// The gap algorithm: first traversable vertical gap in a column.
//
// Given the terrain interval and the blocking spans sorted by
// `(end asc, begin asc)`, scan upward from the terrain surface. Spans
// matching the ignore mask are invisible; spans overlapping the current
// gap floor push it up; the first candidate gap that satisfies the
// agent's height, head-top, forbidden-texture, and step-limit constraints
// wins. Once the floor climbs past the upward step limit nothing later
// can qualify (spans arrive sorted by end), so the scan stops early.
// After the last span an open-top gap up to 0xFFFF remains.
//
// Signed 32-bit arithmetic for every limit check: `cur_y - down_limit`
// must not wrap.

use ridgeline_world::{Env, Point2d, Range, RichRange, SlabPool, SnapRichRange, Texture};

static SPAN_BUFFERS: SlabPool<RichRange> = SlabPool::new(64);

/// First traversable gap at `p2d` relative to the standing height
/// `cur_y`. Routes the point through the environment, then runs the scan.
#[allow(clippy::too_many_arguments)]
pub fn get_interval(
    env: &Env,
    p2d: Point2d,
    cur_y: i32,
    ignore: Texture,
    forbidden: Texture,
    height: i32,
    up_limit: i32,
    down_limit: i32,
) -> Option<SnapRichRange> {
    let mut spans = SPAN_BUFFERS.acquire(32);
    let result = env.terrain_and_spans_into(p2d, &mut spans).and_then(|terrain| {
        get_interval_from_parts(
            terrain, &spans, cur_y, ignore, forbidden, height, up_limit, down_limit,
        )
    });
    SPAN_BUFFERS.release(spans);
    result
}

/// The pure scan over pre-collected parts. `spans` must be sorted by
/// `(end asc, begin asc)` — exactly what
/// `Env::terrain_and_spans_into` produces.
#[allow(clippy::too_many_arguments)]
pub fn get_interval_from_parts(
    terrain: RichRange,
    spans: &[RichRange],
    cur_y: i32,
    ignore: Texture,
    forbidden: Texture,
    height: i32,
    up_limit: i32,
    down_limit: i32,
) -> Option<SnapRichRange> {
    if spans.is_empty() {
        let texture = terrain.texture();
        if !forbidden.is_empty() && texture.intersects(forbidden) {
            return None;
        }
        let t_max = terrain.end() as i32;
        if t_max > cur_y + up_limit || t_max < cur_y - down_limit {
            return None;
        }
        return Some(SnapRichRange { range: Range::new(terrain.end(), u16::MAX), texture });
    }

    let need_top = cur_y + height;
    let min_allowed = cur_y - down_limit;
    let max_allowed = cur_y + up_limit;
    let height_u16 = height.clamp(0, u16::MAX as i32) as u16;

    let mut gap_min = terrain.end();
    let mut gap_texture = terrain.texture();

    for v in spans {
        let v_texture = v.texture();
        if !ignore.is_empty() && v_texture.intersects(ignore) {
            continue;
        }
        // Entirely below the current floor: no effect.
        if v.end() <= gap_min {
            continue;
        }

        if v.begin() >= gap_min {
            // A candidate gap [gap_min, v.begin) has formed.
            let floor = gap_min as i32;
            if floor > max_allowed {
                break;
            }
            if floor >= min_allowed {
                let gap_max = v.begin();
                if gap_max - gap_min >= height_u16
                    && gap_max as i32 >= need_top
                    && (forbidden.is_empty() || !gap_texture.intersects(forbidden))
                {
                    return Some(SnapRichRange {
                        range: Range::new(gap_min, gap_max),
                        texture: gap_texture,
                    });
                }
            }
        }

        // The span overlaps or caps the gap: the floor moves to its top.
        gap_min = v.end();
        gap_texture = v_texture;
        if gap_min as i32 > max_allowed {
            break;
        }
    }

    // Open-top gap above the last blocking span.
    let final_max = u16::MAX as i32;
    if final_max - (gap_min as i32) < height {
        return None;
    }
    if final_max < need_top {
        return None;
    }
    if !forbidden.is_empty() && gap_texture.intersects(forbidden) {
        return None;
    }
    let floor = gap_min as i32;
    if floor > max_allowed || floor < min_allowed {
        return None;
    }

    Some(SnapRichRange { range: Range::new(gap_min, u16::MAX), texture: gap_texture })
}
