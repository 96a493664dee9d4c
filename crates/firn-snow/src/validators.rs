//! The weighted validator set.

use std::collections::HashMap;
use std::sync::Arc;

use firn_ids::NodeId;
use firn_utils::math::{add_weight, sub_weight};
use parking_lot::RwLock;
use rand::Rng;
use tracing::debug;

use crate::sampler::WeightedSampler;
use crate::Result;

/// One validator and its stake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Validator {
    pub node_id: NodeId,
    pub weight: u64,
}

/// Observes validator set mutations. Callbacks run on the mutating thread
/// after the set lock is released; they must not block it for long.
pub trait ValidatorSetListener: Send + Sync {
    fn validator_added(&self, node_id: NodeId, weight: u64);

    fn validator_removed(&self, node_id: NodeId, weight: u64);

    /// An existing validator's weight moved without it joining or leaving.
    fn weight_changed(&self, node_id: NodeId, old_weight: u64, new_weight: u64) {
        let _ = (node_id, old_weight, new_weight);
    }
}

#[derive(Default)]
struct SetState {
    /// Sampleable validators.
    active: HashMap<NodeId, u64>,
    /// Weights parked by `mask`, remembered exactly for `reveal`.
    masked: HashMap<NodeId, u64>,
    /// Sum over `active`.
    total: u64,
}

/// The set of validators for one chain, shared between the engine and
/// non-engine readers. Every operation sees a consistent snapshot.
#[derive(Default)]
pub struct ValidatorSet {
    state: RwLock<SetState>,
    listeners: RwLock<Vec<Arc<dyn ValidatorSetListener>>>,
}

impl ValidatorSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes to set mutations.
    pub fn register_listener(&self, listener: Arc<dyn ValidatorSetListener>) {
        self.listeners.write().push(listener);
    }

    /// Grants `weight` more stake to `node_id`, creating it if needed.
    pub fn add_weight(&self, node_id: NodeId, weight: u64) -> Result<()> {
        if weight == 0 {
            return Ok(());
        }
        let mut state = self.state.write();
        if let Some(parked) = state.masked.get_mut(&node_id) {
            *parked = add_weight(*parked, weight)?;
            return Ok(());
        }
        let current = state.active.get(&node_id).copied().unwrap_or(0);
        let updated = add_weight(current, weight)?;
        let total = add_weight(state.total, weight)?;
        let is_new = state.active.insert(node_id, updated).is_none();
        state.total = total;
        drop(state);

        for listener in self.listeners.read().iter() {
            if is_new {
                listener.validator_added(node_id, weight);
            } else {
                listener.weight_changed(node_id, current, updated);
            }
        }
        Ok(())
    }

    /// Takes `weight` stake away from `node_id`, saturating at zero.
    /// Disconnects can outrun joins during recovery, so undercounting is
    /// preferred over failing.
    pub fn remove_weight(&self, node_id: NodeId, weight: u64) {
        if weight == 0 {
            return;
        }
        let mut state = self.state.write();
        if let Some(parked) = state.masked.get_mut(&node_id) {
            let updated = sub_weight(*parked, weight);
            if updated == 0 {
                state.masked.remove(&node_id);
            } else {
                *parked = updated;
            }
            return;
        }
        let Some(current) = state.active.get(&node_id).copied() else {
            return;
        };
        let removed = current.min(weight);
        let updated = sub_weight(current, weight);
        state.total = sub_weight(state.total, removed);
        let gone = updated == 0;
        if gone {
            state.active.remove(&node_id);
        } else {
            state.active.insert(node_id, updated);
        }
        drop(state);

        for listener in self.listeners.read().iter() {
            if gone {
                listener.validator_removed(node_id, removed);
            } else {
                listener.weight_changed(node_id, current, updated);
            }
        }
    }

    /// Hides `node_id` from sampling and the weight total. The weight is
    /// remembered exactly and restored by `reveal`.
    pub fn mask(&self, node_id: NodeId) {
        let mut state = self.state.write();
        if let Some(weight) = state.active.remove(&node_id) {
            state.total = sub_weight(state.total, weight);
            state.masked.insert(node_id, weight);
            debug!(node = %node_id, weight, "validator masked");
        }
    }

    /// Restores a masked validator.
    pub fn reveal(&self, node_id: NodeId) -> Result<()> {
        let mut state = self.state.write();
        if let Some(weight) = state.masked.remove(&node_id) {
            let total = add_weight(state.total, weight)?;
            state.active.insert(node_id, weight);
            state.total = total;
            debug!(node = %node_id, weight, "validator revealed");
        }
        Ok(())
    }

    /// The sampleable weight of `node_id`; zero while masked.
    #[must_use]
    pub fn get_weight(&self, node_id: &NodeId) -> u64 {
        self.state.read().active.get(node_id).copied().unwrap_or(0)
    }

    /// Sum of sampleable weights.
    #[must_use]
    pub fn total_weight(&self) -> u64 {
        self.state.read().total
    }

    /// True when the validator is known, masked or not.
    #[must_use]
    pub fn contains(&self, node_id: &NodeId) -> bool {
        let state = self.state.read();
        state.active.contains_key(node_id) || state.masked.contains_key(node_id)
    }

    /// The sampleable validators.
    #[must_use]
    pub fn list(&self) -> Vec<Validator> {
        self.state
            .read()
            .active
            .iter()
            .map(|(node_id, weight)| Validator {
                node_id: *node_id,
                weight: *weight,
            })
            .collect()
    }

    /// Number of sampleable validators.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.read().active.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.read().active.is_empty()
    }

    /// Draws `k` validators with replacement, weighted by stake.
    pub fn sample<R: Rng>(&self, k: usize, rng: &mut R) -> Result<Vec<NodeId>> {
        let weights: Vec<(NodeId, u64)> = {
            let state = self.state.read();
            state.active.iter().map(|(n, w)| (*n, *w)).collect()
        };
        WeightedSampler::new(&weights)?.sample(k, rng)
    }
}
