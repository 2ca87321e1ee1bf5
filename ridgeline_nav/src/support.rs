// Column support resolution: which surface can an agent stand on?
//
// Works over a normalized column — the cell's full interval list (terrain
// included) sorted by `(end asc, begin asc)` with same-texture runs that
// overlap or touch merged into one. `find_best_support` then picks the
// surface reachable from the agent's standing height: an upward step
// within the step-up limit is preferred, otherwise the highest surface
// below within the step-down limit. A surface only qualifies when the next
// non-ignored blocker above it leaves at least `head_clear` of room.
//
// Ignored textures are skipped for the head-clearance test only; they
// still bear weight as surfaces.

use ridgeline_world::{RichRange, Texture};

/// Agent constraints that shape support resolution.
#[derive(Clone, Copy, Debug)]
pub struct SupportParams {
    /// Maximum upward step, in 1/20 m.
    pub up_limit: u16,
    /// Maximum downward step, in 1/20 m.
    pub down_limit: u16,
    /// Required clearance above a surface, in 1/20 m.
    pub head_clear: u16,
    /// Textures skipped when testing head clearance.
    pub ignore: Texture,
}

/// Sort by `(end asc, begin asc)` and merge same-texture entries that
/// overlap or touch. The result is the planner's working column.
pub fn normalize_column(column: &mut Vec<RichRange>) {
    if column.len() <= 1 {
        return;
    }
    column.sort_by(|a, b| a.end().cmp(&b.end()).then(a.begin().cmp(&b.begin())));

    let mut write = 0;
    for i in 1..column.len() {
        let rr = column[i];
        let last = &mut column[write];
        if last.texture() == rr.texture() && rr.begin() <= last.end() {
            if rr.end() > last.end() {
                last.range.end = rr.end();
            }
            if rr.begin() < last.begin() {
                last.range.begin = rr.begin();
            }
        } else {
            write += 1;
            column[write] = rr;
        }
    }
    column.truncate(write + 1);
}

/// The best surface reachable from `h20`: first an upward step with
/// `end ∈ [h20, h20 + up_limit]`, then the highest `end < h20` within the
/// step-down limit. Returns the surface height.
pub fn find_best_support(column: &[RichRange], h20: u16, params: SupportParams) -> Option<u16> {
    if column.is_empty() {
        return None;
    }

    // Step up: scan candidates with end <= h20 + up_limit from the top.
    let upper = h20 as u32 + params.up_limit as u32;
    let idx = column.partition_point(|rr| (rr.end() as u32) <= upper);
    for i in (0..idx).rev() {
        let end = column[i].end();
        if end < h20 {
            break;
        }
        if has_headroom_above(column, i, end, params) {
            return Some(end);
        }
    }

    // Step down: the highest end below h20, no farther than down_limit.
    let idx = column.partition_point(|rr| rr.end() < h20);
    for i in (0..idx).rev() {
        let end = column[i].end();
        if (h20 - end) as u32 > params.down_limit as u32 {
            break;
        }
        if has_headroom_above(column, i, end, params) {
            return Some(end);
        }
    }

    None
}

/// Whether the next non-ignored entry above index `i` starts at least
/// `head_clear` above the surface at `end`. No blocker above means
/// unlimited headroom.
fn has_headroom_above(column: &[RichRange], i: usize, end: u16, params: SupportParams) -> bool {
    for rr in &column[i + 1..] {
        if !params.ignore.is_empty() && rr.texture().intersects(params.ignore) {
            continue;
        }
        let delta = rr.begin() as i32 - end as i32;
        return delta >= params.head_clear as i32;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: Texture = Texture::MATER_BASE;
    const OBSTACLE: Texture = Texture::MATER_OBSTACLE;
    const WATER: Texture = Texture::PROP_WATER;

    fn rr(begin: u16, end: u16, tex: Texture) -> RichRange {
        RichRange::new(begin, end, tex, 0)
    }

    fn params() -> SupportParams {
        SupportParams {
            up_limit: 20,
            down_limit: u16::MAX,
            head_clear: 36,
            ignore: Texture::NONE,
        }
    }

    #[test]
    fn normalize_sorts_and_merges_same_texture() {
        let mut col = vec![rr(30, 40, OBSTACLE), rr(0, 20, BASE), rr(38, 50, OBSTACLE)];
        normalize_column(&mut col);
        assert_eq!(col, vec![rr(0, 20, BASE), rr(30, 50, OBSTACLE)]);
    }

    #[test]
    fn normalize_merges_touching_not_disjoint() {
        let mut col = vec![rr(0, 10, OBSTACLE), rr(10, 20, OBSTACLE), rr(30, 40, OBSTACLE)];
        normalize_column(&mut col);
        assert_eq!(col, vec![rr(0, 20, OBSTACLE), rr(30, 40, OBSTACLE)]);
    }

    #[test]
    fn normalize_keeps_different_textures_apart() {
        let mut col = vec![rr(0, 20, BASE), rr(15, 30, OBSTACLE)];
        normalize_column(&mut col);
        assert_eq!(col, vec![rr(0, 20, BASE), rr(15, 30, OBSTACLE)]);
    }

    #[test]
    fn flat_ground_supports_at_terrain_height() {
        let col = vec![rr(0, 20, BASE)];
        assert_eq!(find_best_support(&col, 20, params()), Some(20));
    }

    #[test]
    fn step_up_within_limit_is_preferred() {
        // Ground at 20, a ledge topping out at 35 (15 up — within 20).
        let col = vec![rr(0, 20, BASE), rr(20, 35, OBSTACLE)];
        assert_eq!(find_best_support(&col, 20, params()), Some(35));
    }

    #[test]
    fn wall_above_the_step_limit_blocks() {
        // The wall tops out 30 above the current height and sits directly
        // on the ground, so neither stepping up nor standing below works.
        let col = vec![rr(0, 20, BASE), rr(20, 50, OBSTACLE)];
        assert_eq!(find_best_support(&col, 20, params()), None);
    }

    #[test]
    fn headroom_requires_clearance_below_next_blocker() {
        // Ground at 20, ceiling starting at 40: only 20 of clearance.
        let col = vec![rr(0, 20, BASE), rr(40, 60, OBSTACLE)];
        assert_eq!(find_best_support(&col, 20, params()), None);

        // Ceiling at 56 gives exactly 36: passes.
        let col = vec![rr(0, 20, BASE), rr(56, 76, OBSTACLE)];
        assert_eq!(find_best_support(&col, 20, params()), Some(20));
    }

    #[test]
    fn ignored_textures_do_not_block_headroom() {
        let col = vec![rr(0, 20, BASE), rr(30, 40, WATER)];
        assert_eq!(find_best_support(&col, 20, params()), None);

        let mut p = params();
        p.ignore = WATER;
        assert_eq!(find_best_support(&col, 20, p), Some(20));
    }

    #[test]
    fn step_down_picks_the_highest_surface_below() {
        // Standing at 100 above two floors at 60 and 20.
        let col = vec![rr(0, 20, BASE), rr(40, 60, OBSTACLE)];
        assert_eq!(find_best_support(&col, 100, params()), Some(60));
    }

    #[test]
    fn step_down_respects_down_limit() {
        let col = vec![rr(0, 20, BASE)];
        let mut p = params();
        p.down_limit = 30;
        assert_eq!(find_best_support(&col, 100, p), None);
        p.down_limit = 80;
        assert_eq!(find_best_support(&col, 100, p), Some(20));
    }

    #[test]
    fn ignored_surfaces_still_bear_weight() {
        // Ignoring water hides it from the head-clearance test, but its
        // top surface is still a valid support.
        let col = vec![rr(0, 20, BASE), rr(40, 60, WATER)];
        let mut p = params();
        p.ignore = WATER;
        assert_eq!(find_best_support(&col, 100, p), Some(60));
    }

    #[test]
    fn empty_column_has_no_support() {
        assert_eq!(find_best_support(&[], 20, params()), None);
    }
}
