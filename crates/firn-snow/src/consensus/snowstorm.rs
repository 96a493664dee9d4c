//! Snowstorm: transaction-level consensus over conflict sets.
//!
//! Two transactions conflict when they name a common input. Every input
//! keys a conflict set, of which at most one member may ever be accepted.
//! A transaction with no conflicts is virtuous and finalizes at the lower
//! β; once a rival appears both sides are rogue and need the higher β.

use std::collections::HashMap;
use std::sync::Arc;

use firn_ids::Id;
use firn_utils::{Bag, Set};
use tracing::debug;

use super::snowball::UnarySnowball;
use super::PollOutcome;
use crate::{ConsensusError, Decidable, Parameters, Result, Status};

/// A transaction as consensus sees it: an opaque payload plus the two id
/// sets that drive conflict and ordering.
pub trait Tx: Decidable {
    fn bytes(&self) -> Vec<u8>;

    /// Cheap structural validity. Called once, before the tx is tracked.
    fn verify(&self) -> Result<()>;

    /// Transactions that must be accepted before this one may be.
    fn dependencies(&self) -> Vec<Id>;

    /// Conflict keys; two txs sharing one can never both be accepted.
    fn input_ids(&self) -> Vec<Id>;
}

struct TxNode {
    tx: Arc<dyn Tx>,
    inputs: Vec<Id>,
    /// Dependencies not yet accepted.
    pending_deps: Set<Id>,
    sb: UnarySnowball,
}

/// The conflict graph over every processing transaction.
pub struct ConflictGraph {
    params: Parameters,
    nodes: HashMap<Id, TxNode>,
    /// input id → processing txs naming it
    spenders: HashMap<Id, Set<Id>>,
    /// input id → the accepted tx that consumed it
    consumed: HashMap<Id, Id>,
    /// dependency tx id → processing txs waiting on it
    dependents: HashMap<Id, Set<Id>>,
    accepted: Set<Id>,
    rejected: Set<Id>,
}

impl ConflictGraph {
    #[must_use]
    pub fn new(params: Parameters) -> Self {
        Self {
            params,
            nodes: HashMap::new(),
            spenders: HashMap::new(),
            consumed: HashMap::new(),
            dependents: HashMap::new(),
            accepted: Set::new(),
            rejected: Set::new(),
        }
    }

    /// Starts tracking `tx`.
    ///
    /// The tx is rejected on the spot (and the call errors) when one of its
    /// inputs was already consumed by an accepted tx, or when one of its
    /// dependencies was already rejected. A conflict against a tx whose
    /// counters have already finalized is refused the same way.
    pub fn add(&mut self, tx: Arc<dyn Tx>) -> Result<()> {
        let id = tx.id();
        if self.nodes.contains_key(&id) || self.accepted.contains(&id) || self.rejected.contains(&id)
        {
            return Err(ConsensusError::DuplicateItem(id));
        }
        tx.verify()?;

        let inputs = tx.input_ids();
        for input in &inputs {
            if let Some(owner) = self.consumed.get(input) {
                let owner = *owner;
                tx.reject()?;
                self.rejected.add(id);
                debug!(tx = %id, input = %input, "rejected at issuance, input already consumed");
                return Err(ConsensusError::InputConsumed(owner));
            }
        }
        for input in &inputs {
            if let Some(rivals) = self.spenders.get(input) {
                for rival in rivals.iter() {
                    if self.nodes[rival].sb.finalized() {
                        tx.reject()?;
                        self.rejected.add(id);
                        return Err(ConsensusError::ConflictWithFinalized(*rival));
                    }
                }
            }
        }

        let mut pending_deps = Set::new();
        for dep in tx.dependencies() {
            if self.rejected.contains(&dep) {
                tx.reject()?;
                self.rejected.add(id);
                return Err(ConsensusError::DependencyRejected(dep));
            }
            if !self.accepted.contains(&dep) {
                pending_deps.add(dep);
            }
        }

        let mut sb = UnarySnowball::new(self.params.beta_virtuous, self.params.beta_rogue);
        for input in &inputs {
            let rivals = self.spenders.entry(*input).or_default();
            if !rivals.is_empty() {
                sb.set_rogue();
                for rival in rivals.iter() {
                    if let Some(node) = self.nodes.get_mut(rival) {
                        node.sb.set_rogue();
                    }
                }
            }
            rivals.add(id);
        }
        for dep in pending_deps.iter() {
            self.dependents.entry(*dep).or_default().add(id);
        }

        self.nodes.insert(
            id,
            TxNode {
                tx,
                inputs,
                pending_deps,
                sb,
            },
        );
        Ok(())
    }

    /// Applies one poll's worth of votes.
    ///
    /// `votes` counts, per tx, how many of the k sampled validators named
    /// it. Txs at or above α record a success; every other processing tx
    /// records a failed poll and loses its confidence run.
    ///
    /// A tx is accepted once its counters finalize and every dependency is
    /// accepted. Accepting it rejects all of its rivals, so the first tx
    /// in a conflict set to finalize wins even if a rival holds a higher
    /// cumulative tally from earlier, non-consecutive wins.
    pub fn record_poll(&mut self, votes: &Bag<Id>) -> Result<PollOutcome> {
        let mut votes = votes.clone();
        votes.set_threshold(self.params.alpha);
        let met = votes.threshold_met().clone();

        for (id, node) in &mut self.nodes {
            if met.contains(id) {
                node.sb.record_successful_poll();
            } else {
                node.sb.record_unsuccessful_poll();
            }
        }

        let mut outcome = PollOutcome::default();
        loop {
            let candidate = self.nodes.iter().find_map(|(id, node)| {
                (node.sb.finalized() && node.pending_deps.is_empty()).then_some(*id)
            });
            match candidate {
                Some(id) => self.accept_tx(id, &mut outcome)?,
                None => break,
            }
        }
        Ok(outcome)
    }

    /// True when `id` strictly leads every rival in every conflict set it
    /// belongs to. A virtuous tx is trivially preferred. This steers what
    /// gets named in poll responses; it plays no part in acceptance.
    fn is_preferred(&self, id: &Id) -> bool {
        let node = match self.nodes.get(id) {
            Some(n) => n,
            None => return false,
        };
        let own = node.sb.num_successful_polls();
        for input in &node.inputs {
            if let Some(rivals) = self.spenders.get(input) {
                for rival in rivals.iter() {
                    if rival == id {
                        continue;
                    }
                    if self.nodes[rival].sb.num_successful_polls() >= own {
                        return false;
                    }
                }
            }
        }
        true
    }

    fn accept_tx(&mut self, id: Id, outcome: &mut PollOutcome) -> Result<()> {
        let node = self
            .nodes
            .remove(&id)
            .ok_or(ConsensusError::UnknownItem(id))?;
        node.tx.accept()?;
        self.accepted.add(id);
        outcome.accepted_txs.push(id);
        debug!(tx = %id, "transaction accepted");

        // every rival loses its input
        let mut losers = Vec::new();
        for input in &node.inputs {
            self.consumed.insert(*input, id);
            if let Some(rivals) = self.spenders.remove(input) {
                for rival in rivals {
                    if rival != id {
                        losers.push(rival);
                    }
                }
            }
        }
        self.reject_txs(losers, outcome)?;

        // waiters may now only be blocked by their other dependencies
        if let Some(waiters) = self.dependents.remove(&id) {
            for waiter in waiters {
                if let Some(waiting) = self.nodes.get_mut(&waiter) {
                    waiting.pending_deps.remove(&id);
                }
            }
        }
        Ok(())
    }

    /// Rejects each listed tx and, transitively, everything depending on one.
    fn reject_txs(&mut self, seed: Vec<Id>, outcome: &mut PollOutcome) -> Result<()> {
        let mut queue = seed;
        while let Some(id) = queue.pop() {
            let node = match self.nodes.remove(&id) {
                Some(n) => n,
                None => continue,
            };
            node.tx.reject()?;
            self.rejected.add(id);
            outcome.rejected_txs.push(id);
            debug!(tx = %id, "transaction rejected");

            for input in &node.inputs {
                if let Some(rivals) = self.spenders.get_mut(input) {
                    rivals.remove(&id);
                    if rivals.is_empty() {
                        self.spenders.remove(input);
                    }
                }
            }
            if let Some(waiters) = self.dependents.remove(&id) {
                queue.extend(waiters);
            }
        }
        Ok(())
    }

    /// Processing txs with no conflicts.
    #[must_use]
    pub fn virtuous(&self) -> Set<Id> {
        self.nodes
            .iter()
            .filter(|(_, node)| !node.sb.rogue())
            .map(|(id, _)| *id)
            .collect()
    }

    /// Processing txs currently leading (or alone in) all their conflict sets.
    #[must_use]
    pub fn preferences(&self) -> Set<Id> {
        self.nodes
            .keys()
            .filter(|id| self.is_preferred(id))
            .copied()
            .collect()
    }

    /// True when `id` is tracked and has no conflicts.
    #[must_use]
    pub fn is_virtuous(&self, id: &Id) -> bool {
        self.nodes.get(id).is_some_and(|node| !node.sb.rogue())
    }

    /// The rivals of `id` across all its conflict sets.
    #[must_use]
    pub fn conflicts(&self, id: &Id) -> Set<Id> {
        let mut out = Set::new();
        if let Some(node) = self.nodes.get(id) {
            for input in &node.inputs {
                if let Some(rivals) = self.spenders.get(input) {
                    for rival in rivals.iter() {
                        if rival != id {
                            out.add(*rival);
                        }
                    }
                }
            }
        }
        out
    }

    /// The decision recorded for `id`, if any.
    #[must_use]
    pub fn status_of(&self, id: &Id) -> Status {
        if self.accepted.contains(id) {
            Status::Accepted
        } else if self.rejected.contains(id) {
            Status::Rejected
        } else if self.nodes.contains_key(id) {
            Status::Processing
        } else {
            Status::Unknown
        }
    }

    /// True when nothing is left processing.
    #[must_use]
    pub fn finalized(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Number of processing txs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use parking_lot::RwLock;

    /// A scriptable transaction for exercising the graph.
    pub(crate) struct TestTx {
        pub id: Id,
        pub inputs: Vec<Id>,
        pub deps: Vec<Id>,
        pub status: RwLock<Status>,
        pub verify_err: Option<String>,
    }

    impl TestTx {
        pub(crate) fn new(id: Id, inputs: Vec<Id>) -> Arc<Self> {
            Arc::new(Self {
                id,
                inputs,
                deps: Vec::new(),
                status: RwLock::new(Status::Processing),
                verify_err: None,
            })
        }

        pub(crate) fn with_deps(id: Id, inputs: Vec<Id>, deps: Vec<Id>) -> Arc<Self> {
            Arc::new(Self {
                id,
                inputs,
                deps,
                status: RwLock::new(Status::Processing),
                verify_err: None,
            })
        }
    }

    impl Decidable for TestTx {
        fn id(&self) -> Id {
            self.id
        }

        fn status(&self) -> Status {
            *self.status.read()
        }

        fn accept(&self) -> Result<()> {
            *self.status.write() = Status::Accepted;
            Ok(())
        }

        fn reject(&self) -> Result<()> {
            *self.status.write() = Status::Rejected;
            Ok(())
        }
    }

    impl Tx for TestTx {
        fn bytes(&self) -> Vec<u8> {
            self.id.as_bytes().to_vec()
        }

        fn verify(&self) -> Result<()> {
            match &self.verify_err {
                Some(msg) => Err(ConsensusError::InvalidTx(msg.clone())),
                None => Ok(()),
            }
        }

        fn dependencies(&self) -> Vec<Id> {
            self.deps.clone()
        }

        fn input_ids(&self) -> Vec<Id> {
            self.inputs.clone()
        }
    }

    fn id(n: u64) -> Id {
        Id::EMPTY.prefixed(n)
    }

    fn params() -> Parameters {
        // k=2, alpha=2, beta_virtuous=1, beta_rogue=2
        let mut p = Parameters::new(2, 2, 1, 2);
        p.concurrent_repolls = 1;
        p
    }

    fn poll(graph: &mut ConflictGraph, votes: &[(Id, usize)]) -> PollOutcome {
        let mut bag = Bag::new();
        for (id, count) in votes {
            bag.add_count(*id, *count);
        }
        graph.record_poll(&bag).unwrap()
    }

    #[test]
    fn virtuous_tx_accepts_at_beta_virtuous() {
        let mut graph = ConflictGraph::new(params());
        let tx = TestTx::new(id(1), vec![id(100)]);
        graph.add(tx.clone()).unwrap();
        assert!(graph.is_virtuous(&tx.id()));

        let outcome = poll(&mut graph, &[(tx.id(), 2)]);
        assert_eq!(outcome.accepted_txs, vec![tx.id()]);
        assert_eq!(tx.status(), Status::Accepted);
        assert!(graph.finalized());
    }

    #[test]
    fn conflicting_txs_are_rogue_and_exclusive() {
        let mut graph = ConflictGraph::new(params());
        let t1 = TestTx::new(id(1), vec![id(100)]);
        let t2 = TestTx::new(id(2), vec![id(100)]);
        graph.add(t1.clone()).unwrap();
        graph.add(t2.clone()).unwrap();

        assert!(!graph.is_virtuous(&t1.id()));
        assert!(!graph.is_virtuous(&t2.id()));
        assert!(graph.conflicts(&t1.id()).contains(&t2.id()));

        // one successful poll is not enough at beta_rogue = 2
        let outcome = poll(&mut graph, &[(t1.id(), 2)]);
        assert!(!outcome.changed());

        let outcome = poll(&mut graph, &[(t1.id(), 2)]);
        assert_eq!(outcome.accepted_txs, vec![t1.id()]);
        assert_eq!(outcome.rejected_txs, vec![t2.id()]);
        assert_eq!(t1.status(), Status::Accepted);
        assert_eq!(t2.status(), Status::Rejected);
    }

    #[test]
    fn below_alpha_resets_the_run() {
        let mut graph = ConflictGraph::new(params());
        let t1 = TestTx::new(id(1), vec![id(100)]);
        let t2 = TestTx::new(id(2), vec![id(100)]);
        graph.add(t1.clone()).unwrap();
        graph.add(t2.clone()).unwrap();

        poll(&mut graph, &[(t1.id(), 2)]);
        // a split vote resets t1's confidence
        poll(&mut graph, &[(t1.id(), 1), (t2.id(), 1)]);
        let outcome = poll(&mut graph, &[(t1.id(), 2)]);
        assert!(!outcome.changed(), "confidence must restart after the reset");

        let outcome = poll(&mut graph, &[(t1.id(), 2)]);
        assert_eq!(outcome.accepted_txs, vec![t1.id()]);
    }

    #[test]
    fn acceptance_waits_for_dependencies() {
        let mut graph = ConflictGraph::new(params());
        let dep = TestTx::new(id(1), vec![id(100)]);
        let spender = TestTx::with_deps(id(2), vec![id(200)], vec![dep.id()]);
        graph.add(dep.clone()).unwrap();
        graph.add(spender.clone()).unwrap();

        // only the dependent is voted for: finalizable but blocked
        let outcome = poll(&mut graph, &[(spender.id(), 2)]);
        assert!(outcome.accepted_txs.is_empty());
        assert_eq!(spender.status(), Status::Processing);

        // once the dependency lands, the waiter clears in the same poll
        let outcome = poll(&mut graph, &[(dep.id(), 2), (spender.id(), 2)]);
        assert_eq!(outcome.accepted_txs, vec![dep.id(), spender.id()]);
    }

    #[test]
    fn rejection_cascades_through_dependents() {
        let mut graph = ConflictGraph::new(params());
        let t1 = TestTx::new(id(1), vec![id(100)]);
        let t2 = TestTx::new(id(2), vec![id(100)]);
        let child = TestTx::with_deps(id(3), vec![id(300)], vec![t2.id()]);
        graph.add(t1.clone()).unwrap();
        graph.add(t2.clone()).unwrap();
        graph.add(child.clone()).unwrap();

        poll(&mut graph, &[(t1.id(), 2)]);
        let outcome = poll(&mut graph, &[(t1.id(), 2)]);

        assert_eq!(outcome.accepted_txs, vec![t1.id()]);
        assert_eq!(t2.status(), Status::Rejected);
        assert_eq!(child.status(), Status::Rejected);
        assert!(outcome.rejected_txs.contains(&t2.id()));
        assert!(outcome.rejected_txs.contains(&child.id()));
    }

    #[test]
    fn consumed_input_rejects_newcomer() {
        let mut graph = ConflictGraph::new(params());
        let t1 = TestTx::new(id(1), vec![id(100)]);
        graph.add(t1.clone()).unwrap();
        poll(&mut graph, &[(t1.id(), 2)]);
        assert_eq!(t1.status(), Status::Accepted);

        let late = TestTx::new(id(2), vec![id(100)]);
        let err = graph.add(late.clone()).unwrap_err();
        assert!(matches!(err, ConsensusError::InputConsumed(owner) if owner == t1.id()));
        assert_eq!(late.status(), Status::Rejected);
    }

    #[test]
    fn rejected_dependency_rejects_newcomer() {
        let mut graph = ConflictGraph::new(params());
        let t1 = TestTx::new(id(1), vec![id(100)]);
        let t2 = TestTx::new(id(2), vec![id(100)]);
        graph.add(t1.clone()).unwrap();
        graph.add(t2.clone()).unwrap();
        poll(&mut graph, &[(t1.id(), 2)]);
        poll(&mut graph, &[(t1.id(), 2)]);
        assert_eq!(t2.status(), Status::Rejected);

        let late = TestTx::with_deps(id(3), vec![id(300)], vec![t2.id()]);
        let err = graph.add(late.clone()).unwrap_err();
        assert!(matches!(err, ConsensusError::DependencyRejected(d) if d == t2.id()));
        assert_eq!(late.status(), Status::Rejected);
    }

    #[test]
    fn duplicate_add_is_refused() {
        let mut graph = ConflictGraph::new(params());
        let tx = TestTx::new(id(1), vec![id(100)]);
        graph.add(tx.clone()).unwrap();
        assert!(matches!(
            graph.add(tx),
            Err(ConsensusError::DuplicateItem(_))
        ));
    }

    #[test]
    fn alternating_wins_never_finalize() {
        let mut graph = ConflictGraph::new(params());
        let t1 = TestTx::new(id(1), vec![id(100)]);
        let t2 = TestTx::new(id(2), vec![id(100)]);
        graph.add(t1.clone()).unwrap();
        graph.add(t2.clone()).unwrap();

        // each win resets the rival's confidence run, so neither side
        // reaches beta_rogue; the level tallies also leave no preference
        poll(&mut graph, &[(t1.id(), 2)]);
        poll(&mut graph, &[(t2.id(), 2)]);
        poll(&mut graph, &[(t1.id(), 2)]);
        poll(&mut graph, &[(t2.id(), 2)]);

        assert_eq!(t1.status(), Status::Processing);
        assert_eq!(t2.status(), Status::Processing);
        assert!(graph.preferences().is_empty());
    }

    #[test]
    fn finalizing_streak_beats_a_larger_stale_tally() {
        // beta_virtuous = 1, beta_rogue = 3
        let mut p = Parameters::new(2, 2, 1, 3);
        p.concurrent_repolls = 1;
        let mut graph = ConflictGraph::new(p);

        let t1 = TestTx::new(id(1), vec![id(100)]);
        let t2 = TestTx::new(id(2), vec![id(100)]);
        graph.add(t1.clone()).unwrap();
        graph.add(t2.clone()).unwrap();

        // t2 banks four wins, but split votes break both its streaks
        poll(&mut graph, &[(t2.id(), 2)]);
        poll(&mut graph, &[(t2.id(), 2)]);
        poll(&mut graph, &[(t1.id(), 1), (t2.id(), 1)]);
        poll(&mut graph, &[(t2.id(), 2)]);
        poll(&mut graph, &[(t2.id(), 2)]);
        poll(&mut graph, &[(t1.id(), 1), (t2.id(), 1)]);

        // t1 now runs three consecutive wins; its cumulative tally (3)
        // stays behind t2's (4) the whole way
        poll(&mut graph, &[(t1.id(), 2)]);
        let outcome = poll(&mut graph, &[(t1.id(), 2)]);
        assert!(!outcome.changed());
        assert!(graph.preferences().contains(&t2.id()));
        assert!(!graph.preferences().contains(&t1.id()));

        // the streak reaches beta_rogue: t1 is accepted regardless of the
        // rival's larger historical tally
        let outcome = poll(&mut graph, &[(t1.id(), 2)]);
        assert_eq!(outcome.accepted_txs, vec![t1.id()]);
        assert_eq!(outcome.rejected_txs, vec![t2.id()]);
        assert_eq!(t1.status(), Status::Accepted);
        assert_eq!(t2.status(), Status::Rejected);
        assert!(graph.finalized());
    }
}
