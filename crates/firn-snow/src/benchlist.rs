//! Temporary exclusion of unresponsive validators.

use std::collections::HashMap;

use firn_ids::NodeId;
use firn_utils::Set;
use tracing::warn;

/// Counts consecutive poll failures per validator and benches a validator
/// once it crosses the threshold. Any successful response restores it.
pub struct Benchlist {
    threshold: u32,
    failures: HashMap<NodeId, u32>,
    benched: Set<NodeId>,
}

impl Benchlist {
    #[must_use]
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold,
            failures: HashMap::new(),
            benched: Set::new(),
        }
    }

    /// Records an unanswered poll. Returns true when this failure benched
    /// the validator.
    pub fn register_failure(&mut self, node_id: NodeId) -> bool {
        let count = self.failures.entry(node_id).or_insert(0);
        *count += 1;
        if *count >= self.threshold && !self.benched.contains(&node_id) {
            self.benched.add(node_id);
            warn!(node = %node_id, failures = *count, "validator benched");
            return true;
        }
        false
    }

    /// Records a response; clears any failure streak and unbenches.
    pub fn register_success(&mut self, node_id: NodeId) {
        self.failures.remove(&node_id);
        self.benched.remove(&node_id);
    }

    #[must_use]
    pub fn is_benched(&self, node_id: &NodeId) -> bool {
        self.benched.contains(node_id)
    }

    #[must_use]
    pub fn num_benched(&self) -> usize {
        self.benched.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(n: u8) -> NodeId {
        NodeId::from_bytes([n; 20])
    }

    #[test]
    fn benches_at_the_threshold() {
        let mut bench = Benchlist::new(3);
        assert!(!bench.register_failure(node(1)));
        assert!(!bench.register_failure(node(1)));
        assert!(bench.register_failure(node(1)));
        assert!(bench.is_benched(&node(1)));
        // further failures do not re-report
        assert!(!bench.register_failure(node(1)));
    }

    #[test]
    fn success_restores() {
        let mut bench = Benchlist::new(2);
        bench.register_failure(node(1));
        bench.register_failure(node(1));
        assert!(bench.is_benched(&node(1)));

        bench.register_success(node(1));
        assert!(!bench.is_benched(&node(1)));
        // the streak restarted
        assert!(!bench.register_failure(node(1)));
    }

    #[test]
    fn streaks_are_per_validator() {
        let mut bench = Benchlist::new(2);
        bench.register_failure(node(1));
        bench.register_failure(node(2));
        assert_eq!(bench.num_benched(), 0);
        bench.register_failure(node(1));
        assert!(bench.is_benched(&node(1)));
        assert!(!bench.is_benched(&node(2)));
    }
}
