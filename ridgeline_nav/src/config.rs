// Data-driven navigation configuration.
//
// Every tunable of the query and planning layer lives in `NavConfig`,
// loaded from JSON at startup — call sites read from the config instead of
// carrying magic numbers, and hosts can rebalance agents without a
// recompile. The defaults reproduce the classic agent: 1.1 m body,
// 1.8 m head clearance, 1 m step-up, unlimited step-down.

use serde::{Deserialize, Serialize};

use crate::planner::AgentSpec;
use ridgeline_world::Texture;

/// Navigation tunables. Heights are in 1/20 m units.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NavConfig {
    /// Agent body height.
    pub agent_height: u16,

    /// Clearance required above a support surface.
    pub head_clear: u16,

    /// Maximum upward step per move.
    pub up_limit: u16,

    /// Maximum downward step per move.
    pub down_limit: u16,

    /// Texture bits ignored while scanning for gaps and head clearance.
    pub ignore_mask: u32,

    /// Texture bits the agent refuses to stand on.
    pub forbidden_mask: u32,

    /// Search strides; must contain 1 (the anchor resolution).
    pub strides: Vec<u16>,

    /// Weight of the non-anchor searches (WA*). At least 1.
    pub w1: f32,

    /// Queue gate: non-anchor queues expand while their best f stays
    /// within this factor of the anchor's. At least 1.
    pub w2: f32,

    /// Expansion budget per plan call.
    pub max_expansions: usize,
}

impl Default for NavConfig {
    fn default() -> Self {
        Self {
            agent_height: 22,
            head_clear: 36,
            up_limit: 20,
            down_limit: u16::MAX,
            ignore_mask: 0,
            forbidden_mask: 0,
            strides: vec![1],
            w1: 1.5,
            w2: 2.0,
            max_expansions: 500_000,
        }
    }
}

impl NavConfig {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// The agent this configuration describes.
    pub fn agent(&self) -> AgentSpec {
        AgentSpec {
            height: self.agent_height,
            head_clear: self.head_clear,
            up_limit: self.up_limit,
            down_limit: self.down_limit,
            ignore: Texture(self.ignore_mask),
            forbidden: Texture(self.forbidden_mask),
        }
    }
}
