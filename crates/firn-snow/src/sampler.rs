//! Stake-weighted sampling with replacement.

use firn_ids::NodeId;
use firn_utils::math::add_weight;
use rand::Rng;

use crate::{ConsensusError, Result};

/// Draws validators with probability proportional to stake.
///
/// Built once per sample from the current weights; each draw is a binary
/// search over the cumulative weight table. The randomness source is the
/// caller's: a seeded generator in tests, an OS-backed one in production.
pub struct WeightedSampler {
    nodes: Vec<NodeId>,
    /// `cumulative[i]` is the total weight of `nodes[..=i]`.
    cumulative: Vec<u64>,
    total: u64,
}

impl WeightedSampler {
    /// Builds a sampler over `(node, weight)` pairs. Zero-weight entries
    /// are unsampleable and skipped.
    pub fn new(weights: &[(NodeId, u64)]) -> Result<Self> {
        let mut nodes = Vec::with_capacity(weights.len());
        let mut cumulative = Vec::with_capacity(weights.len());
        let mut total: u64 = 0;
        for (node, weight) in weights {
            if *weight == 0 {
                continue;
            }
            total = add_weight(total, *weight)?;
            nodes.push(*node);
            cumulative.push(total);
        }
        Ok(Self {
            nodes,
            cumulative,
            total,
        })
    }

    /// Total sampleable weight.
    #[must_use]
    pub fn total_weight(&self) -> u64 {
        self.total
    }

    /// Draws `k` validators with replacement.
    pub fn sample<R: Rng>(&self, k: usize, rng: &mut R) -> Result<Vec<NodeId>> {
        if self.total == 0 {
            return Err(ConsensusError::InsufficientWeight);
        }
        let mut drawn = Vec::with_capacity(k);
        for _ in 0..k {
            let point = rng.gen_range(0..self.total);
            let index = self.cumulative.partition_point(|&c| c <= point);
            drawn.push(self.nodes[index]);
        }
        Ok(drawn)
    }
}
