//! Avalanche: consensus over a DAG of vertices.
//!
//! A vertex bundles transactions and points at parent vertices. A vote for
//! a vertex is an implicit vote for every processing ancestor, so
//! confidence flows from the sampled frontier back through the DAG. A
//! vertex is accepted only after its parents are accepted and every
//! transaction it carries has been accepted by the conflict graph, which
//! keeps acceptance order parent-before-child and preserves the accepted
//! frontier as an antichain.

use std::collections::HashMap;
use std::sync::Arc;

use firn_ids::Id;
use firn_utils::{Bag, Set};
use tracing::{debug, warn};

use super::snowball::UnarySnowflake;
use super::snowstorm::{ConflictGraph, Tx};
use super::PollOutcome;
use crate::{ConsensusError, Decidable, Parameters, Result, Status};

/// A DAG node as consensus sees it.
pub trait Vertex: Decidable {
    fn parent_ids(&self) -> Result<Vec<Id>>;

    /// One greater than the maximum parent height; zero with no parents.
    fn height(&self) -> Result<u64>;

    fn epoch(&self) -> Result<u32>;

    fn txs(&self) -> Result<Vec<Arc<dyn Tx>>>;

    fn bytes(&self) -> Vec<u8>;

    /// True when this vertex closes the DAG for linearization.
    fn stop_vertex(&self) -> bool;

    /// Full verification, including the stop-vertex closure rules.
    fn verify(&self) -> Result<()>;
}

struct VtxNode<V> {
    vtx: V,
    parents: Vec<Id>,
    children: Set<Id>,
    tx_ids: Vec<Id>,
    height: u64,
    sb: UnarySnowflake,
}

/// The DAG consensus instance for one chain.
pub struct Topological<V: Vertex> {
    params: Parameters,
    conflicts: ConflictGraph,
    nodes: HashMap<Id, VtxNode<V>>,
    /// Accepted vertices with no accepted descendant known locally.
    frontier: Set<Id>,
    /// Decisions this instance knows about, including recovery seeds.
    decided: HashMap<Id, Status>,
    max_frontier_height: u64,
}

impl<V: Vertex + Clone> Topological<V> {
    /// Builds an instance whose accepted frontier is `frontier`
    /// (id, height) pairs, as recovered from the store.
    #[must_use]
    pub fn new(params: Parameters, frontier: &[(Id, u64)]) -> Self {
        let mut decided = HashMap::new();
        let mut edge = Set::new();
        let mut max_height = 0;
        for (id, height) in frontier {
            decided.insert(*id, Status::Accepted);
            edge.add(*id);
            max_height = max_height.max(*height);
        }
        Self {
            conflicts: ConflictGraph::new(params.clone()),
            params,
            nodes: HashMap::new(),
            frontier: edge,
            decided,
            max_frontier_height: max_height,
        }
    }

    /// Tells the instance about a vertex that was accepted before it came
    /// up, so later additions may name it as a parent.
    pub fn note_accepted(&mut self, id: Id) {
        self.decided.entry(id).or_insert(Status::Accepted);
    }

    /// Issues `vtx` to consensus.
    ///
    /// The vertex must already have passed verification. A vertex naming a
    /// rejected parent, or carrying a transaction the conflict graph
    /// refuses, is rejected on the spot and the call errors.
    pub fn add(&mut self, vtx: V) -> Result<()> {
        let id = vtx.id();
        if self.nodes.contains_key(&id) || self.decided.contains_key(&id) {
            return Err(ConsensusError::DuplicateItem(id));
        }

        let parents = vtx.parent_ids()?;
        for parent in &parents {
            match self.status_of(parent) {
                Status::Processing | Status::Accepted => {}
                Status::Rejected => {
                    vtx.reject()?;
                    self.decided.insert(id, Status::Rejected);
                    return Err(ConsensusError::ParentRejected(*parent));
                }
                Status::Unknown => return Err(ConsensusError::UnknownItem(*parent)),
            }
        }

        let txs = vtx.txs()?;
        let mut tx_ids = Vec::with_capacity(txs.len());
        for tx in txs {
            let tx_id = tx.id();
            tx_ids.push(tx_id);
            if tx.status().decided() {
                if tx.status() == Status::Rejected {
                    vtx.reject()?;
                    self.decided.insert(id, Status::Rejected);
                    return Err(ConsensusError::DependencyRejected(tx_id));
                }
                continue;
            }
            match self.conflicts.add(tx) {
                Ok(()) => {}
                // already tracked through another vertex
                Err(ConsensusError::DuplicateItem(_)) => {}
                Err(err @ (ConsensusError::InputConsumed(_)
                | ConsensusError::DependencyRejected(_)
                | ConsensusError::ConflictWithFinalized(_)
                | ConsensusError::InvalidTx(_))) => {
                    vtx.reject()?;
                    self.decided.insert(id, Status::Rejected);
                    return Err(err);
                }
                Err(err) => return Err(err),
            }
        }

        let height = vtx.height()?;
        for parent in &parents {
            if let Some(parent_node) = self.nodes.get_mut(parent) {
                parent_node.children.add(id);
            }
        }
        self.nodes.insert(
            id,
            VtxNode {
                vtx,
                parents,
                children: Set::new(),
                tx_ids,
                height,
                sb: UnarySnowflake::new(self.params.beta_virtuous, self.params.beta_rogue),
            },
        );
        debug!(vertex = %id, height, "vertex issued");
        Ok(())
    }

    /// Applies one poll.
    ///
    /// `votes` counts, per vertex id, how many sampled validators named it.
    /// Votes for unknown or decided ids are dropped, which is how a voter
    /// answering with garbage becomes a non-vote.
    pub fn record_poll(&mut self, votes: &Bag<Id>) -> Result<PollOutcome> {
        // A vote for a vertex is a vote for every processing ancestor.
        let mut extended: Bag<Id> = Bag::new();
        for (id, count) in votes.iter() {
            if !self.nodes.contains_key(id) {
                continue;
            }
            for ancestor in self.ancestry(id) {
                extended.add_count(ancestor, count);
            }
        }
        extended.set_threshold(self.params.alpha);
        let met = extended.threshold_met().clone();

        // Vertex votes carry down to the transactions they package.
        let mut tx_votes: Bag<Id> = Bag::new();
        for (id, node) in &self.nodes {
            let count = extended.count(id);
            if count == 0 {
                continue;
            }
            for tx_id in &node.tx_ids {
                tx_votes.add_count(*tx_id, count);
            }
        }
        let mut outcome = self.conflicts.record_poll(&tx_votes)?;

        // Per-vertex confidence. A vertex carrying any conflicted tx needs
        // the rogue β.
        for (id, node) in &mut self.nodes {
            if !node.sb.rogue() {
                let any_rogue = node
                    .tx_ids
                    .iter()
                    .any(|tx_id| {
                        self.conflicts.status_of(tx_id) == Status::Processing
                            && !self.conflicts.is_virtuous(tx_id)
                    });
                if any_rogue {
                    node.sb.set_rogue();
                }
            }
            if met.contains(id) {
                node.sb.record_successful_poll();
            } else {
                node.sb.record_unsuccessful_poll();
            }
        }

        // A vertex whose tx was rejected can never be accepted.
        let doomed: Vec<Id> = self
            .nodes
            .iter()
            .filter(|(_, node)| {
                node.tx_ids
                    .iter()
                    .any(|tx_id| outcome.rejected_txs.contains(tx_id))
            })
            .map(|(id, _)| *id)
            .collect();
        self.reject_vertices(doomed, &mut outcome)?;

        self.sweep_accepts(&mut outcome)?;
        Ok(outcome)
    }

    /// Accepts every vertex that is finalized, parent-complete and
    /// tx-complete, walking heights upward until nothing more moves.
    fn sweep_accepts(&mut self, outcome: &mut PollOutcome) -> Result<()> {
        loop {
            let mut candidates: Vec<(u64, Id)> = self
                .nodes
                .iter()
                .filter(|(_, node)| {
                    node.sb.finalized()
                        && node
                            .parents
                            .iter()
                            .all(|p| self.status_of(p) == Status::Accepted)
                        && node
                            .tx_ids
                            .iter()
                            .all(|t| self.conflicts.status_of(t) == Status::Accepted)
                })
                .map(|(id, node)| (node.height, *id))
                .collect();
            if candidates.is_empty() {
                return Ok(());
            }
            candidates.sort_unstable();
            for (_, id) in candidates {
                self.accept_vertex(id, outcome)?;
            }
        }
    }

    fn accept_vertex(&mut self, id: Id, outcome: &mut PollOutcome) -> Result<()> {
        let node = match self.nodes.remove(&id) {
            Some(n) => n,
            None => return Ok(()),
        };
        node.vtx.accept()?;
        self.decided.insert(id, Status::Accepted);

        self.frontier.add(id);
        for parent in &node.parents {
            self.frontier.remove(parent);
        }
        if node.height > self.max_frontier_height {
            self.max_frontier_height = node.height;
        }

        outcome.accepted_vertices.push(id);
        debug!(vertex = %id, height = node.height, "vertex accepted");
        Ok(())
    }

    /// Rejects each seed vertex and every descendant.
    fn reject_vertices(&mut self, seed: Vec<Id>, outcome: &mut PollOutcome) -> Result<()> {
        let mut queue = seed;
        while let Some(id) = queue.pop() {
            let node = match self.nodes.remove(&id) {
                Some(n) => n,
                None => continue,
            };
            node.vtx.reject()?;
            self.decided.insert(id, Status::Rejected);
            outcome.rejected_vertices.push(id);
            warn!(vertex = %id, "vertex rejected");
            queue.extend(node.children);
        }
        Ok(())
    }

    /// The processing ancestor closure of `id`, including `id` itself.
    fn ancestry(&self, id: &Id) -> Set<Id> {
        let mut seen = Set::new();
        let mut queue = vec![*id];
        while let Some(current) = queue.pop() {
            if !seen.add(current) {
                continue;
            }
            if let Some(node) = self.nodes.get(&current) {
                for parent in &node.parents {
                    if self.nodes.contains_key(parent) {
                        queue.push(*parent);
                    }
                }
            }
        }
        seen
    }

    /// The status of a vertex as far as this instance knows.
    #[must_use]
    pub fn status_of(&self, id: &Id) -> Status {
        if self.nodes.contains_key(id) {
            Status::Processing
        } else {
            self.decided.get(id).copied().unwrap_or(Status::Unknown)
        }
    }

    /// The accepted frontier.
    #[must_use]
    pub fn frontier(&self) -> Vec<Id> {
        self.frontier.list()
    }

    /// Highest height on the frontier; never decreases.
    #[must_use]
    pub fn frontier_height(&self) -> u64 {
        self.max_frontier_height
    }

    /// Processing vertices whose ancestry and transactions are all either
    /// accepted or currently preferred. These are the ids worth naming in a
    /// poll response.
    #[must_use]
    pub fn preferences(&self) -> Set<Id> {
        let tx_preferred = self.conflicts.preferences();
        let mut preferred = Set::new();

        let mut by_height: Vec<(u64, Id)> = self
            .nodes
            .iter()
            .map(|(id, node)| (node.height, *id))
            .collect();
        by_height.sort_unstable();

        for (_, id) in by_height {
            let node = &self.nodes[&id];
            let parents_ok = node.parents.iter().all(|p| {
                self.status_of(p) == Status::Accepted || preferred.contains(p)
            });
            let txs_ok = node.tx_ids.iter().all(|t| {
                self.conflicts.status_of(t) == Status::Accepted || tx_preferred.contains(t)
            });
            if parents_ok && txs_ok {
                preferred.add(id);
            }
        }
        preferred
    }

    /// True when no vertex is left processing.
    #[must_use]
    pub fn finalized(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Number of processing vertices.
    #[must_use]
    pub fn num_processing(&self) -> usize {
        self.nodes.len()
    }

    /// Whether `id` carries only conflict-free transactions.
    #[must_use]
    pub fn is_virtuous(&self, id: &Id) -> bool {
        self.nodes.get(id).is_some_and(|node| {
            node.tx_ids.iter().all(|t| {
                self.conflicts.status_of(t) != Status::Processing || self.conflicts.is_virtuous(t)
            })
        })
    }

    /// The conflict graph, for tx-level queries.
    #[must_use]
    pub fn conflict_graph(&self) -> &ConflictGraph {
        &self.conflicts
    }
}
