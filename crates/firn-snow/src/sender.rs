//! Outbound message contract and back-pressure.

use std::collections::HashMap;
use std::sync::Arc;

use firn_ids::NodeId;
use firn_utils::Set;
use parking_lot::Mutex;
use tracing::debug;

use crate::message::Message;
use crate::validators::ValidatorSet;

/// An encoded message headed for the network.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub message: Message,
    pub bytes: Vec<u8>,
    /// Reliability-critical messages skip the byte throttler.
    pub bypass_throttling: bool,
}

impl OutboundMessage {
    pub fn new(message: Message) -> Result<Self, firn_codec::PackError> {
        let bytes = message.pack()?;
        Ok(Self {
            message,
            bytes,
            bypass_throttling: false,
        })
    }
}

/// The networking layer, as consensus sees it.
///
/// Both calls return the node ids the message was actually handed off to;
/// the engine treats everything else as a prospective timeout.
pub trait ExternalSender: Send + Sync {
    /// Sends to a specific set of peers.
    fn send(
        &self,
        message: OutboundMessage,
        node_ids: &Set<NodeId>,
        validators_only: bool,
    ) -> Set<NodeId>;

    /// Sends to a sampled mix of validators and non-validators.
    fn gossip(
        &self,
        message: OutboundMessage,
        validators_only: bool,
        num_validators: usize,
        num_non_validators: usize,
    ) -> Set<NodeId>;
}

/// Byte-quota gate for outbound messages.
///
/// A successful [`Throttler::acquire`] must be paired with exactly one
/// [`Throttler::release`] once the message is sent or given up on. A failed
/// acquire means drop the message; the engine never blocks on this.
pub trait Throttler: Send + Sync {
    fn acquire(&self, message: &OutboundMessage, node_id: NodeId) -> bool;

    fn release(&self, message: &OutboundMessage, node_id: NodeId);
}

/// No-op throttler for tests and trusted links.
pub struct NoThrottler;

impl Throttler for NoThrottler {
    fn acquire(&self, _message: &OutboundMessage, _node_id: NodeId) -> bool {
        true
    }

    fn release(&self, _message: &OutboundMessage, _node_id: NodeId) {}
}

/// Configuration for [`StakeThrottler`].
#[derive(Debug, Clone)]
pub struct ThrottlerConfig {
    /// Bytes shared among validators in proportion to stake.
    pub validator_alloc: u64,
    /// Bytes shared by everyone, first come first served.
    pub at_large_alloc: u64,
    /// Cap on how much of the at-large pool one node may hold.
    pub node_max_at_large: u64,
}

struct ThrottlerState {
    remaining_validator: u64,
    remaining_at_large: u64,
    validator_used: HashMap<NodeId, u64>,
    at_large_used: HashMap<NodeId, u64>,
}

/// Rate-limits outbound bytes per peer.
///
/// Each validator gets a slice of the validator allocation proportional to
/// its stake; every peer may additionally draw from a shared at-large pool
/// up to a per-node cap. A message is accepted only if both draws together
/// cover it exactly; otherwise nothing is taken.
pub struct StakeThrottler {
    config: ThrottlerConfig,
    validators: Arc<ValidatorSet>,
    state: Mutex<ThrottlerState>,
}

impl StakeThrottler {
    #[must_use]
    pub fn new(config: ThrottlerConfig, validators: Arc<ValidatorSet>) -> Self {
        Self {
            state: Mutex::new(ThrottlerState {
                remaining_validator: config.validator_alloc,
                remaining_at_large: config.at_large_alloc,
                validator_used: HashMap::new(),
                at_large_used: HashMap::new(),
            }),
            config,
            validators,
        }
    }

    fn validator_slice(&self, node_id: &NodeId) -> u64 {
        let total = self.validators.total_weight();
        if total == 0 {
            return 0;
        }
        let weight = self.validators.get_weight(node_id);
        ((self.config.validator_alloc as f64) * (weight as f64) / (total as f64)) as u64
    }
}

impl Throttler for StakeThrottler {
    fn acquire(&self, message: &OutboundMessage, node_id: NodeId) -> bool {
        if message.bypass_throttling {
            return true;
        }
        let mut needed = message.bytes.len() as u64;
        let mut state = self.state.lock();

        // at-large first, bounded by the per-node cap and the pool
        let at_large_used = state.at_large_used.get(&node_id).copied().unwrap_or(0);
        let from_at_large = needed
            .min(self.config.node_max_at_large.saturating_sub(at_large_used))
            .min(state.remaining_at_large);
        needed -= from_at_large;

        // then the node's validator slice
        let slice = self.validator_slice(&node_id);
        let slice_used = state.validator_used.get(&node_id).copied().unwrap_or(0);
        let from_validator = needed
            .min(slice.saturating_sub(slice_used))
            .min(state.remaining_validator);
        needed -= from_validator;

        if needed != 0 {
            debug!(node = %node_id, size = message.bytes.len(), "outbound message throttled");
            return false;
        }
        if from_at_large > 0 {
            state.remaining_at_large -= from_at_large;
            *state.at_large_used.entry(node_id).or_insert(0) += from_at_large;
        }
        if from_validator > 0 {
            state.remaining_validator -= from_validator;
            *state.validator_used.entry(node_id).or_insert(0) += from_validator;
        }
        true
    }

    fn release(&self, message: &OutboundMessage, node_id: NodeId) {
        if message.bypass_throttling {
            return;
        }
        let size = message.bytes.len() as u64;
        let mut state = self.state.lock();

        // return validator bytes first, the remainder to the at-large pool
        let mut to_validator = 0;
        if let Some(used) = state.validator_used.get_mut(&node_id) {
            to_validator = size.min(*used);
            *used -= to_validator;
        }
        state.remaining_validator += to_validator;
        if state.validator_used.get(&node_id) == Some(&0) {
            state.validator_used.remove(&node_id);
        }

        let to_at_large = size - to_validator;
        if to_at_large > 0 {
            state.remaining_at_large += to_at_large;
            if let Some(used) = state.at_large_used.get_mut(&node_id) {
                *used = used.saturating_sub(to_at_large);
                if *used == 0 {
                    state.at_large_used.remove(&node_id);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use firn_ids::Id;

    fn node(n: u8) -> NodeId {
        NodeId::from_bytes([n; 20])
    }

    fn message(len: usize) -> OutboundMessage {
        OutboundMessage {
            message: Message::AppGossip {
                chain_id: Id::EMPTY,
                payload: vec![0; len],
            },
            bytes: vec![0; len],
            bypass_throttling: false,
        }
    }

    fn setup(at_large: u64, node_cap: u64, validator_alloc: u64) -> StakeThrottler {
        let validators = ValidatorSet::new();
        validators.add_weight(node(1), 50).unwrap();
        validators.add_weight(node(2), 50).unwrap();
        StakeThrottler::new(
            ThrottlerConfig {
                validator_alloc,
                at_large_alloc: at_large,
                node_max_at_large: node_cap,
            },
            Arc::new(validators),
        )
    }

    #[test]
    fn acquire_is_all_or_nothing() {
        let throttler = setup(10, 10, 0);
        let big = message(11);
        assert!(!throttler.acquire(&big, node(1)));
        // the failed acquire took nothing
        let fits = message(10);
        assert!(throttler.acquire(&fits, node(1)));
    }

    #[test]
    fn validator_slice_is_stake_proportional() {
        // no at-large pool: everything must come from the 100-byte
        // validator allocation, of which each 50-weight node gets half
        let throttler = setup(0, 0, 100);
        assert!(throttler.acquire(&message(50), node(1)));
        assert!(!throttler.acquire(&message(1), node(1)));
        assert!(throttler.acquire(&message(50), node(2)));
    }

    #[test]
    fn non_validator_uses_only_at_large() {
        let throttler = setup(20, 10, 100);
        let outsider = node(9);
        assert!(throttler.acquire(&message(10), outsider));
        // per-node at-large cap reached
        assert!(!throttler.acquire(&message(1), outsider));
    }

    #[test]
    fn release_restores_both_pools() {
        let throttler = setup(10, 10, 100);
        let msg = message(40); // 10 at-large + 30 validator
        assert!(throttler.acquire(&msg, node(1)));
        assert!(!throttler.acquire(&message(25), node(1)));

        throttler.release(&msg, node(1));
        assert!(throttler.acquire(&message(40), node(1)));
    }

    #[test]
    fn bypass_skips_accounting() {
        let throttler = setup(1, 1, 0);
        let mut msg = message(1000);
        msg.bypass_throttling = true;
        assert!(throttler.acquire(&msg, node(1)));
        throttler.release(&msg, node(1));
        assert!(throttler.acquire(&message(1), node(1)));
    }
}
