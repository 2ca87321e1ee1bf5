// Multi-resolution weighted A* over the cell lattice.
//
// One search space per stride, each with its own open heap and g-map. The
// stride-1 space is the anchor: its weight is 1 (admissible) and only an
// anchor pop at the goal terminates the search, so the returned path costs
// at most `w1 · w2` times the optimum. Non-anchor spaces run weighted A*
// (`f = g + w1·h`) and are only allowed to expand while their best f stays
// within `w2` of the anchor's ("queue gating"). Whenever a neighbour lands
// on coordinates divisible by another space's stride, its g-value is
// seeded there too.
//
// Edge feasibility: the agent occupies the 2×2 block of quarter-tile
// subtiles at a cell's centre. A unit move is allowed when all four
// destination subtiles resolve a support from the current standing height
// (`support::find_best_support`); the new standing height is their
// maximum. Strides above 1 sweep — a stride-s edge is s chained unit
// steps, height carried through, so coarse spaces cannot jump through
// walls. Diagonal unit steps additionally require both orthogonal
// components to pass (no corner cutting).
//
// `edge_pass` results are memoized per plan call, keyed by position,
// height, direction, and ignore mask. The world is immutable during a
// plan, so entries never go stale within a call.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};

use ridgeline_world::{Env, Point2d, RichRange, Texture, HEIGHT_SCALE};

use crate::support::{find_best_support, normalize_column, SupportParams};

const SQRT_2: f32 = std::f32::consts::SQRT_2;

/// The destination-cell subtiles an agent's footprint covers: the four
/// quarter tiles around the cell centre, as 1-based offsets.
const CENTER_SUBTILES: [(u8, u8); 4] = [(2, 2), (2, 3), (3, 2), (3, 3)];

/// Agent movement constraints. The footprint is fixed at 2×2 subtiles.
#[derive(Clone, Copy, Debug)]
pub struct AgentSpec {
    /// Body height in 1/20 m.
    pub height: u16,
    /// Clearance required above a support surface, in 1/20 m.
    pub head_clear: u16,
    /// Maximum upward step per move, in 1/20 m.
    pub up_limit: u16,
    /// Maximum downward step per move, in 1/20 m.
    pub down_limit: u16,
    /// Textures ignored for head clearance.
    pub ignore: Texture,
    /// Textures forbidden as gap floors. Consumed by the gap queries
    /// (`gap::get_interval`); edge feasibility uses `ignore` only.
    pub forbidden: Texture,
}

impl AgentSpec {
    fn support_params(&self) -> SupportParams {
        SupportParams {
            up_limit: self.up_limit,
            down_limit: self.down_limit,
            head_clear: self.head_clear,
            ignore: self.ignore,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Dir {
    E,
    W,
    N,
    S,
    NE,
    NW,
    SE,
    SW,
}

impl Dir {
    pub const ALL: [Dir; 8] =
        [Dir::E, Dir::W, Dir::N, Dir::S, Dir::NE, Dir::NW, Dir::SE, Dir::SW];

    fn delta(self) -> (i32, i32) {
        match self {
            Dir::E => (1, 0),
            Dir::W => (-1, 0),
            Dir::N => (0, -1),
            Dir::S => (0, 1),
            Dir::NE => (1, -1),
            Dir::NW => (-1, -1),
            Dir::SE => (1, 1),
            Dir::SW => (-1, 1),
        }
    }

    fn is_diagonal(self) -> bool {
        matches!(self, Dir::NE | Dir::NW | Dir::SE | Dir::SW)
    }

    /// The two orthogonal components of a diagonal.
    fn orthogonal(self) -> (Dir, Dir) {
        match self {
            Dir::NE => (Dir::E, Dir::N),
            Dir::NW => (Dir::W, Dir::N),
            Dir::SE => (Dir::E, Dir::S),
            Dir::SW => (Dir::W, Dir::S),
            other => (other, other),
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
struct EdgeKey {
    x: i32,
    y: i32,
    h20: u16,
    dir: Dir,
    ignore: u32,
}

struct PathNode {
    x: i32,
    y: i32,
    h20: u16,
    g: f32,
    parent: Option<u32>,
}

struct OpenEntry {
    f: f32,
    g: f32,
    node: u32,
}

impl PartialEq for OpenEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for OpenEntry {}

impl PartialOrd for OpenEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OpenEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed on f for a min-heap; ties prefer the deeper node
        // (larger g), then the node id for determinism.
        other
            .f
            .total_cmp(&self.f)
            .then(self.g.total_cmp(&other.g))
            .then(other.node.cmp(&self.node))
    }
}

struct Search {
    stride: u16,
    weight: f32,
    open: BinaryHeap<OpenEntry>,
    g: HashMap<(i32, i32), f32>,
    closed: HashSet<(i32, i32)>,
}

/// A planner bound to one immutable environment. Owns its edge cache;
/// parallel planners each need their own instance.
pub struct Planner<'a> {
    env: &'a Env,
    agent: AgentSpec,
    cache: HashMap<EdgeKey, Option<u16>>,
    column: Vec<RichRange>,
}

impl<'a> Planner<'a> {
    pub fn new(env: &'a Env, agent: AgentSpec) -> Self {
        Self { env, agent, cache: HashMap::new(), column: Vec::with_capacity(32) }
    }

    /// Plan from `(x, y, standing height)` to a goal cell. `strides` must
    /// contain 1, the anchor. Returns the path as world-space points
    /// `[x, height, y]` (cell centres, metres), or `None` when no path is
    /// found within `max_expansions`.
    pub fn plan(
        &mut self,
        start: (u16, u16, u16),
        goal: (u16, u16),
        strides: &[u16],
        w1: f32,
        w2: f32,
        max_expansions: usize,
    ) -> Option<Vec<[f32; 3]>> {
        let anchor = strides.iter().position(|&s| s == 1)?;
        if strides.iter().any(|&s| s == 0) {
            return None;
        }

        self.cache.clear();

        let (sx, sy, sh) = (start.0 as i32, start.1 as i32, start.2);
        let (gx, gy) = (goal.0 as i32, goal.1 as i32);

        // Start must bear the agent at its declared height; the goal cell
        // must at least resolve columns under the footprint.
        self.cell_support(sx, sy, sh)?;
        if !self.footprint_resolvable(gx, gy) {
            return None;
        }

        let mut nodes: Vec<PathNode> = Vec::new();
        let mut searches: Vec<Search> = strides
            .iter()
            .enumerate()
            .map(|(i, &stride)| Search {
                stride,
                weight: if i == anchor { 1.0 } else { w1 },
                open: BinaryHeap::new(),
                g: HashMap::new(),
                closed: HashSet::new(),
            })
            .collect();

        nodes.push(PathNode { x: sx, y: sy, h20: sh, g: 0.0, parent: None });
        let h0 = octile(sx, sy, gx, gy);
        for search in searches.iter_mut() {
            if coincides(sx, sy, search.stride) {
                search.g.insert((sx, sy), 0.0);
                search.open.push(OpenEntry { f: search.weight * h0, g: 0.0, node: 0 });
            }
        }

        let mut expansions = 0usize;
        while expansions < max_expansions {
            // The anchor bounds solution quality; once it drains, no
            // acceptable goal pop can happen.
            if searches[anchor].open.is_empty() {
                return None;
            }

            let si = choose_queue(&searches, anchor, w2);
            let Some(entry) = searches[si].open.pop() else {
                return None;
            };

            let (cx, cy) = {
                let n = &nodes[entry.node as usize];
                (n.x, n.y)
            };
            if searches[si].closed.contains(&(cx, cy)) {
                continue;
            }
            searches[si].closed.insert((cx, cy));
            expansions += 1;

            if si == anchor && (cx, cy) == (gx, gy) {
                return Some(reconstruct(&nodes, entry.node));
            }

            let stride = searches[si].stride as i32;
            let (cur_g, cur_h20) = {
                let n = &nodes[entry.node as usize];
                (n.g, n.h20)
            };

            for dir in Dir::ALL {
                let (dx, dy) = dir.delta();
                let (nx, ny) = (cx + dx * stride, cy + dy * stride);
                if !self.in_bounds(nx, ny) {
                    continue;
                }
                let Some(nh) = self.stride_edge(cx, cy, cur_h20, dir, stride) else {
                    continue;
                };
                let ng = cur_g + move_cost(stride, dir.is_diagonal());

                // Seed every space whose lattice the neighbour lies on.
                for search in searches.iter_mut() {
                    if !coincides(nx, ny, search.stride) {
                        continue;
                    }
                    if search.closed.contains(&(nx, ny)) {
                        continue;
                    }
                    if search.g.get(&(nx, ny)).is_some_and(|&old| ng >= old) {
                        continue;
                    }
                    search.g.insert((nx, ny), ng);
                    let node = nodes.len() as u32;
                    nodes.push(PathNode {
                        x: nx,
                        y: ny,
                        h20: nh,
                        g: ng,
                        parent: Some(entry.node),
                    });
                    let f = ng + search.weight * octile(nx, ny, gx, gy);
                    search.open.push(OpenEntry { f, g: ng, node });
                }
            }
        }

        None
    }

    fn in_bounds(&self, x: i32, y: i32) -> bool {
        let rect = self.env.rect();
        x >= rect.min.x as i32 && x < rect.max.x as i32 && y >= rect.min.y as i32
            && y < rect.max.y as i32
    }

    /// Support for the agent footprint at a cell, from standing height
    /// `h20`: every centre subtile must resolve one; the result is the
    /// highest.
    fn cell_support(&mut self, x: i32, y: i32, h20: u16) -> Option<u16> {
        if !self.in_bounds(x, y) {
            return None;
        }
        let env = self.env;
        let params = self.agent.support_params();

        let mut best: Option<u16> = None;
        for (xo, yo) in CENTER_SUBTILES {
            let p = Point2d::with_offsets(x as u16, y as u16, xo, yo);
            self.column.clear();
            let terrain = env.terrain_and_spans_into(p, &mut self.column)?;
            self.column.push(terrain);
            normalize_column(&mut self.column);

            let support = find_best_support(&self.column, h20, params)?;
            best = Some(best.map_or(support, |b| b.max(support)));
        }
        best
    }

    /// Whether the footprint's columns exist at all (goal precheck — the
    /// arrival height is unknown until the search reaches it).
    fn footprint_resolvable(&mut self, x: i32, y: i32) -> bool {
        if !self.in_bounds(x, y) {
            return false;
        }
        let env = self.env;
        for (xo, yo) in CENTER_SUBTILES {
            let p = Point2d::with_offsets(x as u16, y as u16, xo, yo);
            self.column.clear();
            if env.terrain_and_spans_into(p, &mut self.column).is_none() {
                return false;
            }
        }
        true
    }

    /// One unit move in `dir`, memoized.
    fn edge_pass(&mut self, x: i32, y: i32, h20: u16, dir: Dir) -> Option<u16> {
        let key = EdgeKey { x, y, h20, dir, ignore: self.agent.ignore.0 };
        if let Some(&cached) = self.cache.get(&key) {
            return cached;
        }
        let (dx, dy) = dir.delta();
        let result = self.cell_support(x + dx, y + dy, h20);
        self.cache.insert(key, result);
        result
    }

    /// A stride-s edge: s chained unit steps with the standing height
    /// carried through. Diagonal unit steps require both orthogonal
    /// components to pass.
    fn stride_edge(&mut self, x: i32, y: i32, h20: u16, dir: Dir, stride: i32) -> Option<u16> {
        let (dx, dy) = dir.delta();
        let mut cx = x;
        let mut cy = y;
        let mut h = h20;
        for _ in 0..stride {
            if dir.is_diagonal() {
                let (a, b) = dir.orthogonal();
                self.edge_pass(cx, cy, h, a)?;
                self.edge_pass(cx, cy, h, b)?;
            }
            h = self.edge_pass(cx, cy, h, dir)?;
            cx += dx;
            cy += dy;
        }
        Some(h)
    }
}

fn coincides(x: i32, y: i32, stride: u16) -> bool {
    let s = stride as i32;
    x % s == 0 && y % s == 0
}

fn move_cost(stride: i32, diagonal: bool) -> f32 {
    let base = stride as f32;
    if diagonal {
        base * SQRT_2
    } else {
        base
    }
}

/// Octile distance in cell units — admissible for 8-connected movement
/// with these move costs.
fn octile(x: i32, y: i32, gx: i32, gy: i32) -> f32 {
    let dx = (gx - x).abs() as f32;
    let dy = (gy - y).abs() as f32;
    let (min, max) = if dx < dy { (dx, dy) } else { (dy, dx) };
    (max - min) + min * SQRT_2
}

/// Pick the queue to expand: the best eligible non-anchor (min f within
/// `w2` of the anchor's min f), else the anchor. The anchor is known
/// non-empty.
fn choose_queue(searches: &[Search], anchor: usize, w2: f32) -> usize {
    let anchor_min = searches[anchor].open.peek().map_or(f32::INFINITY, |e| e.f);

    let mut best = anchor;
    let mut best_f = anchor_min;
    for (i, search) in searches.iter().enumerate() {
        if i == anchor {
            continue;
        }
        let Some(peek) = search.open.peek() else {
            continue;
        };
        if peek.f <= w2 * anchor_min && (best == anchor || peek.f < best_f) {
            best = i;
            best_f = peek.f;
        }
    }
    best
}

/// Follow parent links and lift to world coordinates: cell centres in the
/// horizontal plane, supports converted to metres.
fn reconstruct(nodes: &[PathNode], goal: u32) -> Vec<[f32; 3]> {
    let mut path = Vec::new();
    let mut cur = Some(goal);
    while let Some(idx) = cur {
        let n = &nodes[idx as usize];
        path.push([n.x as f32 + 0.5, n.h20 as f32 / HEIGHT_SCALE as f32, n.y as f32 + 0.5]);
        cur = n.parent;
    }
    path.reverse();
    path
}

#[cfg(test)]
mod tests {
    use super::*;
    use ridgeline_world::{build_grid_from_columns, Rect, RichRange, GRID_CELL_COUNT, GRID_SIZE};

    const BASE: Texture = Texture::MATER_BASE;
    const OBSTACLE: Texture = Texture::MATER_OBSTACLE;

    fn agent() -> AgentSpec {
        AgentSpec {
            height: 22,
            head_clear: 36,
            up_limit: 20,
            down_limit: u16::MAX,
            ignore: Texture::NONE,
            forbidden: Texture::NONE,
        }
    }

    /// Flat world with terrain `[0, 20)` everywhere, then per-cell extras.
    fn build_env(extras: &[(u16, u16, RichRange)]) -> Env {
        let mut lp: Vec<Vec<RichRange>> = (0..GRID_CELL_COUNT)
            .map(|_| vec![RichRange::new(0, 20, BASE, 0)])
            .collect();
        for (x, y, rr) in extras {
            lp[*x as usize + (*y as usize) * 32].push(*rr);
        }
        let grid = build_grid_from_columns(0, 0, &lp, None).unwrap();
        let mut env = Env::new(Rect::new(0, 0, GRID_SIZE, GRID_SIZE));
        assert!(env.attach_grid(grid));
        env
    }

    fn wall(begin: u16, end: u16) -> RichRange {
        RichRange::new(begin, end, OBSTACLE, 0)
    }

    fn assert_eight_connected(path: &[[f32; 3]]) {
        for pair in path.windows(2) {
            let dx = (pair[1][0] - pair[0][0]).abs();
            let dy = (pair[1][2] - pair[0][2]).abs();
            assert!(dx <= 1.01 && dy <= 1.01, "step too long: {pair:?}");
            assert!(dx > 0.5 || dy > 0.5, "null step: {pair:?}");
        }
    }

    #[test]
    fn straight_line_on_flat_ground() {
        let env = build_env(&[]);
        let mut planner = Planner::new(&env, agent());
        let path = planner.plan((2, 2, 20), (10, 2), &[1], 1.0, 1.0, 100_000).unwrap();

        assert_eq!(path.first().unwrap(), &[2.5, 1.0, 2.5]);
        assert_eq!(path.last().unwrap(), &[10.5, 1.0, 2.5]);
        assert_eq!(path.len(), 9);
        assert_eight_connected(&path);
    }

    #[test]
    fn diagonal_paths_use_diagonal_moves() {
        let env = build_env(&[]);
        let mut planner = Planner::new(&env, agent());
        let path = planner.plan((2, 2, 20), (7, 7), &[1], 1.0, 1.0, 100_000).unwrap();
        assert_eq!(path.len(), 6);
        assert_eight_connected(&path);
    }

    #[test]
    fn wall_with_gap_is_threaded() {
        // A wall across y = 10, x ∈ [5, 25), with a two-cell gap at 14/15.
        let mut extras = Vec::new();
        for x in 5u16..25 {
            if x == 14 || x == 15 {
                continue;
            }
            extras.push((x, 10u16, wall(20, 220)));
        }
        let env = build_env(&extras);
        let mut planner = Planner::new(&env, agent());

        let path = planner.plan((2, 2, 20), (26, 16), &[1], 1.5, 2.0, 500_000).unwrap();
        assert_eq!(path.first().unwrap(), &[2.5, 1.0, 2.5]);
        assert_eq!(path.last().unwrap(), &[26.5, 1.0, 16.5]);
        assert_eight_connected(&path);

        // Every visited cell must bear the agent: wall cells cannot.
        for p in &path {
            let (x, y) = (p[0] as u16, p[2] as u16);
            if y == 10 {
                assert!(
                    (14..=15).contains(&x) || !(5..25).contains(&x),
                    "path crosses the wall at ({x}, {y})"
                );
            }
        }
    }

    #[test]
    fn step_up_limit_gates_ledges() {
        // The cell east of the start is 40 higher than the floor.
        let env = build_env(&[(3, 2, wall(0, 60))]);

        let mut planner = Planner::new(&env, agent());
        // up_limit 20 cannot climb 40.
        assert!(planner.plan((2, 2, 20), (3, 2), &[1], 1.0, 1.0, 10_000).is_none());

        let mut climber = agent();
        climber.up_limit = 50;
        let mut planner = Planner::new(&env, climber);
        let path = planner.plan((2, 2, 20), (3, 2), &[1], 1.0, 1.0, 10_000).unwrap();
        // The agent stands on top of the ledge at 60/20 = 3 m.
        assert_eq!(path.last().unwrap(), &[3.5, 3.0, 2.5]);
    }

    #[test]
    fn corners_are_not_cut() {
        // Block east and keep south open: the diagonal SE move from the
        // start would cut the corner and is rejected, so the path detours.
        let env = build_env(&[(3, 2, wall(20, 220))]);
        let mut planner = Planner::new(&env, agent());

        let path = planner.plan((2, 2, 20), (3, 3), &[1], 1.0, 1.0, 10_000).unwrap();
        assert_eight_connected(&path);
        // Direct diagonal would be 2 points; the detour needs 3.
        assert_eq!(path.len(), 3);
    }

    #[test]
    fn multi_resolution_reaches_the_goal() {
        let env = build_env(&[]);
        let mut planner = Planner::new(&env, agent());
        let path = planner.plan((0, 0, 20), (16, 16), &[1, 4], 1.5, 2.0, 500_000).unwrap();
        assert_eq!(path.first().unwrap(), &[0.5, 1.0, 0.5]);
        assert_eq!(path.last().unwrap(), &[16.5, 1.0, 16.5]);
        // Coarse segments may jump up to the stride per step.
        for pair in path.windows(2) {
            let dx = (pair[1][0] - pair[0][0]).abs();
            let dy = (pair[1][2] - pair[0][2]).abs();
            assert!(dx <= 4.01 && dy <= 4.01, "step exceeds the stride: {pair:?}");
        }
    }

    #[test]
    fn strides_without_an_anchor_fail() {
        let env = build_env(&[]);
        let mut planner = Planner::new(&env, agent());
        assert!(planner.plan((2, 2, 20), (5, 5), &[2, 4], 1.5, 2.0, 10_000).is_none());
    }

    #[test]
    fn expansion_budget_bounds_the_search() {
        let env = build_env(&[]);
        let mut planner = Planner::new(&env, agent());
        assert!(planner.plan((0, 0, 20), (30, 30), &[1], 1.0, 1.0, 3).is_none());
    }

    #[test]
    fn blocked_start_fails_immediately() {
        // A slab over the start leaves no headroom anywhere in the cell.
        let env = build_env(&[(2, 2, wall(20, 220))]);
        let mut planner = Planner::new(&env, agent());
        assert!(planner.plan((2, 2, 20), (5, 2), &[1], 1.0, 1.0, 10_000).is_none());
    }

    #[test]
    fn edge_cache_is_cleared_between_plans() {
        let env = build_env(&[]);
        let mut planner = Planner::new(&env, agent());
        assert!(planner.plan((2, 2, 20), (5, 2), &[1], 1.0, 1.0, 10_000).is_some());
        let cached = planner.cache.len();
        assert!(cached > 0);
        assert!(planner.plan((2, 2, 20), (6, 2), &[1], 1.0, 1.0, 10_000).is_some());
        // The second call repopulated the cache from scratch.
        assert!(planner.cache.len() >= 1);
    }
}
