//! The per-chain consensus engine.
//!
//! One engine owns one chain's consensus state and runs single-threaded:
//! the embedding node drains its inbound queue into these methods in
//! arrival order. Collaborators (sender, VM, store) run on their own
//! threads behind their trait boundaries.

use std::collections::HashMap;
use std::fmt;
use std::time::Instant;

use std::sync::Arc;

use firn_ids::{Id, NodeId};
use firn_utils::timer::AdaptiveTimeout;
use firn_utils::{Bag, Set};
use rand::RngCore;
use tracing::{debug, info, warn};

use crate::benchlist::Benchlist;
use crate::consensus::avalanche::{Topological, Vertex};
use crate::consensus::poll::{EarlyTermNoTraversalFactory, FinishedPoll, PollSet};
use crate::events::EventDispatcher;
use crate::message::Message;
use crate::sampler::WeightedSampler;
use crate::sender::{ExternalSender, OutboundMessage, Throttler};
use crate::state::{UniqueVertex, VertexManager};
use crate::tracker::WeightTracker;
use crate::validators::ValidatorSet;
use crate::version::Version;
use crate::vm::DagVm;
use crate::{ConsensusError, Decidable, Parameters, Result, Status};

/// Engine lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Constructed, not yet started.
    Initializing,
    /// Waiting for enough connected stake.
    Bootstrapping,
    /// Normal operation.
    Consensus,
    /// Stopped after a fatal error; no further commits.
    Halted,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EngineState::Initializing => "Initializing",
            EngineState::Bootstrapping => "Bootstrapping",
            EngineState::Consensus => "Consensus",
            EngineState::Halted => "Halted",
        };
        f.write_str(s)
    }
}

/// Everything an engine needs at construction.
pub struct EngineConfig {
    pub chain_id: Id,
    pub params: Parameters,
    pub validators: Arc<ValidatorSet>,
    pub manager: VertexManager,
    pub sender: Arc<dyn ExternalSender>,
    pub throttler: Arc<dyn Throttler>,
    pub dispatcher: Arc<EventDispatcher>,
    pub vm: Arc<dyn DagVm>,
    pub rng: Box<dyn RngCore + Send>,
}

/// How many validators / non-validators an accepted-frontier gossip
/// message is sampled out to.
const GOSSIP_VALIDATORS: usize = 6;
const GOSSIP_NON_VALIDATORS: usize = 2;

struct OutstandingQuery {
    vertex_id: Id,
    deadline: Instant,
}

/// The consensus engine for one chain.
pub struct Engine {
    chain_id: Id,
    params: Parameters,
    validators: Arc<ValidatorSet>,
    manager: VertexManager,
    consensus: Topological<UniqueVertex>,
    polls: PollSet,
    sender: Arc<dyn ExternalSender>,
    throttler: Arc<dyn Throttler>,
    dispatcher: Arc<EventDispatcher>,
    vm: Arc<dyn DagVm>,
    tracker: WeightTracker,
    timeouts: AdaptiveTimeout,
    benchlist: Benchlist,
    rng: Box<dyn RngCore + Send>,
    state: EngineState,
    next_request_id: u32,
    outstanding: HashMap<u32, OutstandingQuery>,
    /// Issuance instants for the stuck-vertex watchdog.
    issued_at: HashMap<Id, Instant>,
}

impl Engine {
    /// Builds the engine, recovering the accepted frontier from the store.
    pub fn new(config: EngineConfig) -> Result<Self> {
        config
            .params
            .validate()
            .map_err(ConsensusError::InvalidParameters)?;
        let frontier = config.manager.frontier_with_heights()?;
        let consensus = Topological::new(config.params.clone(), &frontier);
        Ok(Self {
            polls: PollSet::new(Box::new(EarlyTermNoTraversalFactory {
                alpha: config.params.alpha,
            })),
            timeouts: AdaptiveTimeout::new(
                config.params.poll_timeout,
                config.params.poll_timeout_min,
                config.params.poll_timeout_max,
            ),
            benchlist: Benchlist::new(config.params.bench_threshold),
            tracker: WeightTracker::new(config.validators.clone(), config.params.startup_alpha),
            consensus,
            chain_id: config.chain_id,
            params: config.params,
            validators: config.validators,
            manager: config.manager,
            sender: config.sender,
            throttler: config.throttler,
            dispatcher: config.dispatcher,
            vm: config.vm,
            rng: config.rng,
            state: EngineState::Initializing,
            next_request_id: 0,
            outstanding: HashMap::new(),
            issued_at: HashMap::new(),
        })
    }

    /// Moves into bootstrapping (and straight to consensus when the
    /// startup weight gate is already open).
    pub fn start(&mut self) -> Result<()> {
        self.transition(EngineState::Bootstrapping)?;
        self.maybe_finish_bootstrap()
    }

    fn transition(&mut self, next: EngineState) -> Result<()> {
        let legal = matches!(
            (self.state, next),
            (EngineState::Initializing, EngineState::Bootstrapping)
                | (EngineState::Bootstrapping, EngineState::Consensus)
                | (EngineState::Bootstrapping, EngineState::Halted)
                | (EngineState::Consensus, EngineState::Halted)
        );
        if !legal {
            return Err(ConsensusError::Internal(format!(
                "illegal engine transition {} -> {}",
                self.state, next
            )));
        }
        info!(chain = %self.chain_id, from = %self.state, to = %next, "engine state change");
        self.state = next;
        Ok(())
    }

    fn maybe_finish_bootstrap(&mut self) -> Result<()> {
        if self.state == EngineState::Bootstrapping && self.tracker.enough_connected_weight() {
            self.transition(EngineState::Consensus)?;
        }
        Ok(())
    }

    fn ensure_running(&self) -> Result<()> {
        match self.state {
            EngineState::Consensus => Ok(()),
            EngineState::Halted => Err(ConsensusError::Halted),
            other => Err(ConsensusError::Internal(format!(
                "engine is {other}, not running"
            ))),
        }
    }

    fn halt(&mut self) {
        warn!(chain = %self.chain_id, "halting chain");
        self.state = EngineState::Halted;
    }

    /// Escalates fatal errors into a chain halt; passes the rest through.
    fn guard<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            if err.is_fatal() {
                self.halt();
            }
        }
        result
    }

    // ---- peer lifecycle ----

    pub fn connected(&mut self, node_id: NodeId, version: &Version) -> Result<()> {
        self.vm.connected(node_id, version)?;
        self.tracker.add_weight_for_node(&node_id)?;
        self.maybe_finish_bootstrap()
    }

    pub fn disconnected(&mut self, node_id: NodeId) -> Result<()> {
        self.vm.disconnected(node_id)?;
        self.tracker.remove_weight_for_node(&node_id);
        Ok(())
    }

    // ---- issuance ----

    /// Verifies and issues a vertex, then polls the network about it.
    /// Returns false when the vertex was dropped by back-pressure or is
    /// already known.
    pub fn issue(&mut self, vertex: UniqueVertex) -> Result<bool> {
        self.ensure_running()?;
        let id = vertex.id();
        if self.consensus.status_of(&id) != Status::Unknown
            || self.manager.status(&id)?.decided()
        {
            return Ok(false);
        }
        if self.consensus.num_processing() >= self.params.max_outstanding_items {
            warn!(vertex = %id, "dropping issuance, too many undecided vertices");
            return Ok(false);
        }
        if self.consensus.num_processing() >= self.params.optimal_processing {
            debug!(
                processing = self.consensus.num_processing(),
                optimal = self.params.optimal_processing,
                "issuing above the optimal processing target"
            );
        }

        vertex.verify()?;
        for parent in vertex.parent_ids()? {
            if self.manager.status(&parent)? == Status::Accepted {
                self.consensus.note_accepted(parent);
            }
        }
        self.consensus.add(vertex.clone())?;
        self.issued_at.insert(id, Instant::now());
        self.dispatcher
            .issue(self.chain_id, id, &vertex.bytes());
        self.send_query(&vertex)?;
        Ok(true)
    }

    /// Parses raw vertex bytes and issues the result.
    pub fn issue_bytes(&mut self, bytes: &[u8]) -> Result<bool> {
        let parse = self.manager.parse_vertex(bytes);
        let vertex = self.guard(parse)?;
        self.issue(vertex)
    }

    // ---- polling ----

    fn send_query(&mut self, vertex: &UniqueVertex) -> Result<()> {
        if self.polls.len() >= self.params.concurrent_repolls {
            return Ok(());
        }

        let weights: Vec<(NodeId, u64)> = self
            .validators
            .list()
            .into_iter()
            .filter(|v| !self.benchlist.is_benched(&v.node_id))
            .map(|v| (v.node_id, v.weight))
            .collect();
        let sampled = match WeightedSampler::new(&weights)?.sample(self.params.k, &mut self.rng) {
            Ok(sampled) => sampled,
            Err(ConsensusError::InsufficientWeight) => {
                warn!("no sampleable stake, query skipped");
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        let request_id = self.next_request_id;
        self.next_request_id = self.next_request_id.wrapping_add(1);
        let sampled_bag = Bag::of(sampled.iter().copied());
        self.polls.add(request_id, sampled_bag.clone());
        self.outstanding.insert(
            request_id,
            OutstandingQuery {
                vertex_id: vertex.id(),
                deadline: Instant::now() + self.timeouts.current(),
            },
        );

        let message = OutboundMessage::new(Message::PushQuery {
            chain_id: self.chain_id,
            request_id,
            vertex: vertex.bytes(),
        })?;

        let mut targets = Set::new();
        for node in sampled_bag.list() {
            if self.throttler.acquire(&message, node) {
                targets.add(node);
            }
        }
        let delivered = self.sender.send(message.clone(), &targets, true);
        for node in targets.iter() {
            self.throttler.release(&message, *node);
        }
        debug!(
            request_id,
            vertex = %vertex.id(),
            sampled = sampled_bag.len(),
            delivered = delivered.len(),
            "query sent"
        );

        if delivered.is_empty() {
            // nothing went out; applying the empty poll would only spin
            warn!(request_id, "query reached no one, abandoning poll");
            self.polls.abandon(request_id);
            self.outstanding.remove(&request_id);
            return Ok(());
        }

        // undeliverable voters are immediate non-votes
        let mut finished = Vec::new();
        for (node, count) in sampled_bag.iter() {
            if delivered.contains(node) {
                continue;
            }
            for _ in 0..count {
                if let Some(done) = self.polls.drop_vote(request_id, *node) {
                    finished.push(done);
                }
            }
        }
        for done in finished {
            self.apply_poll(done)?;
        }
        Ok(())
    }

    /// Applies a peer's poll response. Responses for unknown polls are
    /// silently discarded.
    pub fn chits(&mut self, node_id: NodeId, request_id: u32, votes: Vec<Id>) -> Result<()> {
        self.ensure_running()?;
        self.benchlist.register_success(node_id);
        if let Some(finished) = self.polls.vote(request_id, node_id, votes) {
            self.timeouts.observe_latency(finished.duration);
            self.apply_poll(finished)?;
        }
        Ok(())
    }

    /// Records that a peer will not answer a request.
    pub fn query_failed(&mut self, node_id: NodeId, request_id: u32) -> Result<()> {
        self.ensure_running()?;
        self.benchlist.register_failure(node_id);
        if let Some(finished) = self.polls.drop_vote(request_id, node_id) {
            self.apply_poll(finished)?;
        }
        Ok(())
    }

    /// Expires polls whose deadline has passed, benching the laggards.
    pub fn advance_time(&mut self, now: Instant) -> Result<()> {
        let expired: Vec<u32> = self
            .outstanding
            .iter()
            .filter(|(_, query)| query.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for request_id in expired {
            self.timeouts.observe_timeout();
            for voter in self.polls.waiting(request_id) {
                self.benchlist.register_failure(voter);
            }
            if let Some(query) = self.outstanding.remove(&request_id) {
                warn!(request_id, vertex = %query.vertex_id, "poll timed out");
            }
            if let Some(finished) = self.polls.abandon(request_id) {
                self.apply_poll(finished)?;
            }
        }

        // stuck-vertex watchdog; each laggard is reported once
        let cutoff = self.params.max_item_processing_time;
        let stuck: Vec<Id> = self
            .issued_at
            .iter()
            .filter(|(_, issued)| now.saturating_duration_since(**issued) > cutoff)
            .map(|(id, _)| *id)
            .collect();
        for id in stuck {
            self.issued_at.remove(&id);
            if self.consensus.status_of(&id) == Status::Processing {
                warn!(vertex = %id, "vertex stuck beyond the processing deadline");
            }
        }
        Ok(())
    }

    fn apply_poll(&mut self, finished: FinishedPoll) -> Result<()> {
        self.outstanding.remove(&finished.request_id);

        let applied = self.consensus.record_poll(&finished.result);
        let outcome = self.guard(applied)?;
        let recorded = self
            .manager
            .record_tx_decisions(&outcome.accepted_txs, &outcome.rejected_txs);
        self.guard(recorded)?;

        for vertex_id in &outcome.accepted_vertices {
            let bytes = self.manager.get_vertex(*vertex_id)?.bytes();
            let dispatched = self.dispatcher.accept(self.chain_id, *vertex_id, &bytes);
            self.guard(dispatched)?;
        }
        for vertex_id in &outcome.rejected_vertices {
            let bytes = self
                .manager
                .get_vertex(*vertex_id)
                .map(|v| v.bytes())
                .unwrap_or_default();
            self.dispatcher.reject(self.chain_id, *vertex_id, &bytes);
        }
        for vertex_id in outcome
            .accepted_vertices
            .iter()
            .chain(outcome.rejected_vertices.iter())
        {
            self.issued_at.remove(vertex_id);
        }

        self.repoll()
    }

    /// Keeps polling while anything is undecided.
    fn repoll(&mut self) -> Result<()> {
        if self.consensus.num_processing() == 0 {
            return Ok(());
        }
        let preferred = self.consensus.preferences();
        let Some(target) = preferred.iter().next().copied() else {
            return Ok(());
        };
        let vertex = self.manager.get_vertex(target)?;
        self.send_query(&vertex)
    }

    // ---- inbound messages ----

    /// A peer pushed a vertex and asked for our preference.
    pub fn push_query(&mut self, from: NodeId, request_id: u32, vertex_bytes: &[u8]) -> Result<()> {
        self.ensure_running()?;
        match self.issue_bytes(vertex_bytes) {
            Ok(_) => {}
            Err(err) if err.is_fatal() => return Err(err),
            // a bad vertex is the sender's problem, not ours
            Err(err) => debug!(%from, %err, "pushed vertex not issued"),
        }
        self.send_chits(from, request_id)
    }

    /// A peer asked for our preference on a vertex by id.
    pub fn pull_query(&mut self, from: NodeId, request_id: u32, vertex_id: Id) -> Result<()> {
        self.ensure_running()?;
        if self.manager.status(&vertex_id)? == Status::Unknown {
            self.send_to(
                from,
                Message::Get {
                    chain_id: self.chain_id,
                    request_id,
                    vertex_id,
                },
            )?;
        }
        self.send_chits(from, request_id)
    }

    /// A peer asked for a vertex we may have.
    pub fn get(&mut self, from: NodeId, request_id: u32, vertex_id: Id) -> Result<()> {
        self.ensure_running()?;
        if self.manager.status(&vertex_id)? == Status::Unknown {
            return Ok(());
        }
        let vertex = self.manager.get_vertex(vertex_id)?;
        self.send_to(
            from,
            Message::Put {
                chain_id: self.chain_id,
                request_id,
                vertex: vertex.bytes(),
            },
        )
    }

    /// A peer answered a `Get`.
    pub fn put(&mut self, from: NodeId, _request_id: u32, vertex_bytes: &[u8]) -> Result<()> {
        self.ensure_running()?;
        match self.issue_bytes(vertex_bytes) {
            Ok(_) => Ok(()),
            Err(err) if err.is_fatal() => Err(err),
            Err(err) => {
                debug!(%from, %err, "fetched vertex not issued");
                Ok(())
            }
        }
    }

    // ---- VM passthrough ----

    pub fn app_request(&mut self, from: NodeId, request_id: u32, payload: &[u8]) -> Result<()> {
        self.vm.app_request(from, request_id, payload)
    }

    pub fn app_response(&mut self, from: NodeId, request_id: u32, payload: &[u8]) -> Result<()> {
        self.vm.app_response(from, request_id, payload)
    }

    pub fn app_request_failed(&mut self, from: NodeId, request_id: u32) -> Result<()> {
        self.vm.app_request_failed(from, request_id)
    }

    pub fn app_gossip(&mut self, from: NodeId, payload: &[u8]) -> Result<()> {
        self.vm.app_gossip(from, payload)
    }

    /// Shares one accepted frontier vertex with a sampled mix of peers,
    /// so nodes that missed its acceptance can catch up.
    pub fn gossip(&mut self) -> Result<()> {
        self.ensure_running()?;
        let frontier = self.consensus.frontier();
        if frontier.is_empty() {
            return Ok(());
        }
        let pick = frontier[self.rng.next_u32() as usize % frontier.len()];
        let vertex = self.manager.get_vertex(pick)?;
        let message = OutboundMessage::new(Message::Put {
            chain_id: self.chain_id,
            request_id: 0,
            vertex: vertex.bytes(),
        })?;
        self.sender
            .gossip(message, false, GOSSIP_VALIDATORS, GOSSIP_NON_VALIDATORS);
        Ok(())
    }

    // ---- outbound helpers ----

    fn send_chits(&mut self, to: NodeId, request_id: u32) -> Result<()> {
        let preferred = self.consensus.preferences();
        let ids = if preferred.is_empty() {
            self.consensus.frontier()
        } else {
            preferred.list()
        };
        self.send_to(
            to,
            Message::Chits {
                chain_id: self.chain_id,
                request_id,
                preferred: ids,
            },
        )
    }

    fn send_to(&mut self, to: NodeId, message: Message) -> Result<()> {
        let outbound = OutboundMessage::new(message)?;
        if !self.throttler.acquire(&outbound, to) {
            // never block the engine on back-pressure
            return Ok(());
        }
        let targets = Set::of([to]);
        self.sender.send(outbound.clone(), &targets, false);
        self.throttler.release(&outbound, to);
        Ok(())
    }

    // ---- introspection ----

    #[must_use]
    pub fn state(&self) -> EngineState {
        self.state
    }

    #[must_use]
    pub fn frontier(&self) -> Vec<Id> {
        self.consensus.frontier()
    }

    #[must_use]
    pub fn num_processing(&self) -> usize {
        self.consensus.num_processing()
    }

    #[must_use]
    pub fn num_outstanding_polls(&self) -> usize {
        self.polls.len()
    }

    #[must_use]
    pub fn is_benched(&self, node_id: &NodeId) -> bool {
        self.benchlist.is_benched(node_id)
    }

    /// The manager backing this engine, for issuing locally built vertices.
    #[must_use]
    pub fn manager(&self) -> &VertexManager {
        &self.manager
    }
}
