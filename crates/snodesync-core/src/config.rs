use serde::{Deserialize, Serialize};

pub const DEFAULT_SEED_NODE_LIMIT: usize = 20;
pub const MINIMUM_SWARM_NODES: usize = 1;

/// Which configuration path handles incoming account state.
///
/// `SharedConfig` is the namespace-merge path only. `Legacy` is the
/// single-shot configuration message path only. `Both` keeps the two
/// running side by side; the legacy path then only runs until registration
/// is done.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum SyncMode {
    SharedConfig,
    Legacy,
    Both,
}

impl Default for SyncMode {
    fn default() -> Self {
        SyncMode::Both
    }
}

impl SyncMode {
    pub fn shared_config_enabled(&self) -> bool {
        matches!(self, SyncMode::SharedConfig | SyncMode::Both)
    }

    /// In mixed mode a freshly linked device may still need the legacy
    /// message until it finished registering.
    pub fn legacy_enabled(&self, registration_done: bool) -> bool {
        match self {
            SyncMode::Legacy => true,
            SyncMode::Both => !registration_done,
            SyncMode::SharedConfig => false,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct CoreConfig {
    pub seed_node_url: String,
    pub seed_node_port: u16,
    pub seed_node_limit: usize,
    pub minimum_swarm_nodes: usize,
    pub sync_mode: SyncMode,
    pub registration_done: bool,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            seed_node_url: "seed1.snodesync.network".to_string(),
            seed_node_port: 22023,
            seed_node_limit: DEFAULT_SEED_NODE_LIMIT,
            minimum_swarm_nodes: MINIMUM_SWARM_NODES,
            sync_mode: SyncMode::Both,
            registration_done: false,
        }
    }
}
