use core::time::Duration;
use serde::{Deserialize, Serialize};

/// Configuration shared by the boxing planner and the in-process collective fabric.
///
/// Built once and never mutated; every participant of a cluster must use the same values,
/// since the planner's output has to be identical on every device.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoxingConfig {
    /// Allow redistributing between meshes that differ in shape or device order but address
    /// the same devices, by regrouping through a fully broadcast copy.
    pub regroup_across_meshes: bool,
    /// How long a participant waits for its peers at a collective before giving up.
    pub collective_timeout: Duration,
}

impl Default for BoxingConfig {
    fn default() -> Self {
        Self {
            regroup_across_meshes: true,
            collective_timeout: Duration::from_secs(30),
        }
    }
}

impl BoxingConfig {
    /// Sets [`regroup_across_meshes`](Self::regroup_across_meshes).
    pub fn with_regroup_across_meshes(mut self, regroup_across_meshes: bool) -> Self {
        self.regroup_across_meshes = regroup_across_meshes;
        self
    }

    /// Sets [`collective_timeout`](Self::collective_timeout).
    pub fn with_collective_timeout(mut self, collective_timeout: Duration) -> Self {
        self.collective_timeout = collective_timeout;
        self
    }
}
