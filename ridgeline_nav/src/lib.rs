// ridgeline_nav — gap queries and planning over a ridgeline world.
//
// This crate answers the navigation questions `ridgeline_world` stores the
// data for: "from this standing height, what is the first vertical gap a
// body can occupy here?" (`gap`), "what surface can an agent step onto?"
// (`support`), and "how does a 2×2-subtile agent get from A to B?"
// (`planner`, a multi-resolution weighted A*). All tunables live in
// `config::NavConfig`, loaded from JSON — call sites carry no magic
// numbers.
//
// The world is read-only during a plan call; planners own their caches, so
// hosts may run one planner per thread against a shared immutable `Env`.

pub mod config;
pub mod gap;
pub mod planner;
pub mod support;

pub use config::NavConfig;
pub use gap::{get_interval, get_interval_from_parts};
pub use planner::{AgentSpec, Planner};
pub use support::{find_best_support, normalize_column, SupportParams};
