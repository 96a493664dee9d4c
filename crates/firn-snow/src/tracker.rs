//! Bootstrap weight gate.

use std::sync::Arc;

use firn_ids::NodeId;
use firn_utils::math::{add_weight, sub_weight};
use tracing::info;

use crate::validators::ValidatorSet;
use crate::Result;

/// Tracks how much beacon stake is currently connected, gating the switch
/// out of bootstrapping.
///
/// The gate is a one-way latch: once the configured startup weight has
/// been crossed it stays crossed, even if disconnects later pull the
/// running weight back below the threshold. Flapping peers during startup
/// would otherwise bounce the node in and out of bootstrap.
pub struct WeightTracker {
    beacons: Arc<ValidatorSet>,
    startup_weight: u64,
    connected: u64,
    latched: bool,
}

impl WeightTracker {
    #[must_use]
    pub fn new(beacons: Arc<ValidatorSet>, startup_weight: u64) -> Self {
        Self {
            beacons,
            startup_weight,
            connected: 0,
            latched: startup_weight == 0,
        }
    }

    /// Records that `node_id` connected.
    pub fn add_weight_for_node(&mut self, node_id: &NodeId) -> Result<()> {
        if self.latched {
            return Ok(());
        }
        let weight = self.beacons.get_weight(node_id);
        if weight == 0 {
            return Ok(());
        }
        self.connected = add_weight(self.connected, weight)?;
        if self.connected >= self.startup_weight {
            self.latched = true;
            info!(
                connected = self.connected,
                required = self.startup_weight,
                "startup weight reached"
            );
        }
        Ok(())
    }

    /// Records that `node_id` disconnected. Never clears the latch.
    pub fn remove_weight_for_node(&mut self, node_id: &NodeId) {
        let weight = self.beacons.get_weight(node_id);
        self.connected = sub_weight(self.connected, weight);
    }

    /// True once enough beacon stake has been seen connected.
    #[must_use]
    pub fn enough_connected_weight(&self) -> bool {
        self.latched
    }
}
