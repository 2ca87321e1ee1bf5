// End-to-end navigation: build a world, mutate it, query it, plan in it.

use ridgeline_nav::{get_interval, NavConfig, Planner};
use ridgeline_world::{
    build_grid_from_columns, read_grid, write_grid, Accessory, Env, Point2d, Point3d, Range,
    Rect, RichRange, Texture, GRID_CELL_COUNT, GRID_SIZE,
};

const BASE: Texture = Texture::MATER_BASE;
const OBSTACLE: Texture = Texture::MATER_OBSTACLE;
const NONE: Texture = Texture::NONE;

/// Flat 32×32 world with terrain `[0, 20)` in every cell.
fn flat_env() -> Env {
    let lp: Vec<Vec<RichRange>> = (0..GRID_CELL_COUNT)
        .map(|_| vec![RichRange::new(0, 20, BASE, 0)])
        .collect();
    let grid = build_grid_from_columns(0, 0, &lp, None).unwrap();
    let mut env = Env::new(Rect::new(0, 0, GRID_SIZE, GRID_SIZE));
    assert!(env.attach_grid(grid));
    env
}

fn block(x: u16, y: u16, h: u16, end: u16) -> Point3d {
    Point3d { x, y, x_offset: 0, y_offset: 0, h, range_end: end }
}

#[test]
fn mutation_reroutes_the_planner() {
    let mut env = flat_env();
    let config = NavConfig::default();

    // An open corridor first.
    let path = {
        let mut planner = Planner::new(&env, config.agent());
        planner
            .plan((2, 5, 20), (12, 5), &config.strides, config.w1, config.w2, config.max_expansions)
            .unwrap()
    };
    assert_eq!(path.len(), 11);

    // Drop a wall across the corridor, leaving a gap at y = 9.
    let acc = Accessory::new(OBSTACLE, 1);
    let adds: Vec<Point3d> = (0..GRID_SIZE)
        .filter(|&y| y != 9)
        .map(|y| block(7, y, 20, 220))
        .collect();
    assert!(env.apply_batch(&adds, &[], acc));

    let detour = {
        let mut planner = Planner::new(&env, config.agent());
        planner
            .plan((2, 5, 20), (12, 5), &config.strides, config.w1, config.w2, config.max_expansions)
            .unwrap()
    };
    // The detour must thread the gap: the wall column is only passable
    // at y = 9.
    assert!(detour.len() > path.len());
    for p in &detour {
        let (x, y) = (p[0] as u16, p[2] as u16);
        if x == 7 {
            assert_eq!(y, 9, "path crosses the wall away from the gap");
        }
    }

    // Remove the wall again; the straight route returns.
    let removes: Vec<Point3d> =
        (0..GRID_SIZE).filter(|&y| y != 9).map(|y| block(7, y, 20, 220)).collect();
    assert!(env.apply_batch(&[], &removes, acc));

    let restored = {
        let mut planner = Planner::new(&env, config.agent());
        planner
            .plan((2, 5, 20), (12, 5), &config.strides, config.w1, config.w2, config.max_expansions)
            .unwrap()
    };
    assert_eq!(restored.len(), path.len());
}

#[test]
fn gap_queries_track_batched_edits() {
    let mut env = flat_env();
    let acc = Accessory::new(OBSTACLE, 7);
    let p2d = Point2d::new(4, 4);

    // A low ceiling over the cell: the standing gap shrinks to [20, 40).
    assert!(env.apply_batch(&[block(4, 4, 40, 60)], &[], acc));
    let snap = get_interval(&env, p2d, 20, NONE, NONE, 20, 200, 200).unwrap();
    assert_eq!(snap.range, Range::new(20, 40));
    assert_eq!(snap.texture, BASE);

    // A taller agent does not fit under it any more.
    assert!(get_interval(&env, p2d, 20, NONE, NONE, 30, 0, 0).is_none());

    // Channel-exact removal restores the open column.
    assert!(env.apply_batch(&[], &[block(4, 4, 40, 60)], acc));
    let snap = get_interval(&env, p2d, 20, NONE, NONE, 30, 0, 0).unwrap();
    assert_eq!(snap.range, Range::new(20, u16::MAX));
}

#[test]
fn persisted_world_plans_identically() {
    let lp: Vec<Vec<RichRange>> = (0..GRID_CELL_COUNT)
        .map(|i| {
            let mut cell = vec![RichRange::new(0, 20, BASE, 0)];
            // A diagonal ridge of blockers through the grid.
            if i % 33 == 0 && i > 0 && i < 300 {
                cell.push(RichRange::new(20, 220, OBSTACLE, 0));
            }
            cell
        })
        .collect();
    let grid = build_grid_from_columns(0, 0, &lp, None).unwrap();

    let mut bytes = Vec::new();
    write_grid(&grid, &mut bytes).unwrap();
    let restored = read_grid(bytes.as_slice()).unwrap();

    let mut env_a = Env::new(Rect::new(0, 0, GRID_SIZE, GRID_SIZE));
    assert!(env_a.attach_grid(grid));
    let mut env_b = Env::new(Rect::new(0, 0, GRID_SIZE, GRID_SIZE));
    assert!(env_b.attach_grid(restored));

    let config = NavConfig::default();
    let plan = |env: &Env| {
        let mut planner = Planner::new(env, config.agent());
        planner.plan((0, 3, 20), (20, 3), &config.strides, config.w1, config.w2, 500_000)
    };
    assert_eq!(plan(&env_a), plan(&env_b));
    assert!(plan(&env_a).is_some());
}
