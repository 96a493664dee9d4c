//! Outstanding-poll registry.
//!
//! Every outbound query round registers a poll keyed by request id,
//! carrying the multiset of sampled validators it still waits on. Votes
//! and drops consume waiting slots; a finished poll yields the tally that
//! is then applied to the DAG. Results are surfaced in the order polls
//! finish.

use std::collections::HashMap;
use std::time::Duration;

use firn_ids::{Id, NodeId};
use firn_utils::timer::Timer;
use firn_utils::Bag;
use tracing::debug;

/// One round of vote collection.
pub trait Poll: Send {
    /// Records `voter`'s chits. A voter not sampled (or already heard
    /// from as often as it was sampled) is ignored.
    fn vote(&mut self, voter: NodeId, votes: Vec<Id>);

    /// Records that `voter` will not answer.
    fn drop_vote(&mut self, voter: NodeId);

    fn finished(&self) -> bool;

    /// The voters still owing an answer.
    fn waiting(&self) -> Vec<NodeId>;

    /// The tally. Meaningful once [`Poll::finished`] is true.
    fn take_result(&mut self) -> Bag<Id>;
}

/// Chooses the termination policy for new polls.
pub trait PollFactory: Send + Sync {
    fn new_poll(&self, sampled: Bag<NodeId>) -> Box<dyn Poll>;
}

/// Waits for every sampled validator to answer or drop.
pub struct NoEarlyTermFactory;

impl PollFactory for NoEarlyTermFactory {
    fn new_poll(&self, sampled: Bag<NodeId>) -> Box<dyn Poll> {
        Box::new(NoEarlyTermPoll {
            waiting: sampled,
            votes: Bag::new(),
        })
    }
}

struct NoEarlyTermPoll {
    waiting: Bag<NodeId>,
    votes: Bag<Id>,
}

impl Poll for NoEarlyTermPoll {
    fn vote(&mut self, voter: NodeId, votes: Vec<Id>) {
        if self.waiting.count(&voter) == 0 {
            return;
        }
        self.waiting.remove_one(&voter);
        for id in votes {
            self.votes.add(id);
        }
    }

    fn drop_vote(&mut self, voter: NodeId) {
        self.waiting.remove_one(&voter);
    }

    fn finished(&self) -> bool {
        self.waiting.is_empty()
    }

    fn waiting(&self) -> Vec<NodeId> {
        self.waiting.list()
    }

    fn take_result(&mut self) -> Bag<Id> {
        std::mem::take(&mut self.votes)
    }
}

/// Finishes as soon as the outcome is settled: either some choice reached
/// α and no rival can, or no choice can reach α at all.
pub struct EarlyTermNoTraversalFactory {
    pub alpha: usize,
}

impl PollFactory for EarlyTermNoTraversalFactory {
    fn new_poll(&self, sampled: Bag<NodeId>) -> Box<dyn Poll> {
        Box::new(EarlyTermNoTraversalPoll {
            waiting: sampled,
            votes: Bag::new(),
            alpha: self.alpha,
        })
    }
}

struct EarlyTermNoTraversalPoll {
    waiting: Bag<NodeId>,
    votes: Bag<Id>,
    alpha: usize,
}

impl Poll for EarlyTermNoTraversalPoll {
    fn vote(&mut self, voter: NodeId, votes: Vec<Id>) {
        if self.waiting.count(&voter) == 0 {
            return;
        }
        self.waiting.remove_one(&voter);
        for id in votes {
            self.votes.add(id);
        }
    }

    fn drop_vote(&mut self, voter: NodeId) {
        self.waiting.remove_one(&voter);
    }

    fn finished(&self) -> bool {
        let remaining = self.waiting.len();
        if remaining == 0 {
            return true;
        }
        let leader = self.votes.mode().map_or(0, |(_, count)| count);
        if leader + remaining < self.alpha {
            // nothing can reach alpha any more
            return true;
        }
        if leader >= self.alpha {
            // settled unless a trailing or as-yet-unseen choice could
            // still catch up
            let fresh_alive = remaining >= self.alpha;
            let chasers_alive = self
                .votes
                .iter()
                .any(|(_, count)| count < self.alpha && count + remaining >= self.alpha);
            return !fresh_alive && !chasers_alive;
        }
        false
    }

    fn waiting(&self) -> Vec<NodeId> {
        self.waiting.list()
    }

    fn take_result(&mut self) -> Bag<Id> {
        std::mem::take(&mut self.votes)
    }
}

struct PollEntry {
    poll: Box<dyn Poll>,
    timer: Timer,
}

/// A finished poll: its tally and how long it was open.
pub struct FinishedPoll {
    pub request_id: u32,
    pub result: Bag<Id>,
    pub duration: Duration,
}

/// The registry of open polls for one chain.
pub struct PollSet {
    factory: Box<dyn PollFactory>,
    open: HashMap<u32, PollEntry>,
}

impl PollSet {
    #[must_use]
    pub fn new(factory: Box<dyn PollFactory>) -> Self {
        Self {
            factory,
            open: HashMap::new(),
        }
    }

    /// Registers a poll. Returns false (and changes nothing) when the
    /// request id is already in flight.
    pub fn add(&mut self, request_id: u32, sampled: Bag<NodeId>) -> bool {
        if self.open.contains_key(&request_id) {
            return false;
        }
        self.open.insert(
            request_id,
            PollEntry {
                poll: self.factory.new_poll(sampled),
                timer: Timer::start(),
            },
        );
        true
    }

    /// Applies one voter's chits. Responses for unknown request ids are
    /// silently discarded.
    pub fn vote(&mut self, request_id: u32, voter: NodeId, votes: Vec<Id>) -> Option<FinishedPoll> {
        let entry = self.open.get_mut(&request_id)?;
        entry.poll.vote(voter, votes);
        self.harvest(request_id)
    }

    /// Treats `voter` as a non-vote in the given poll.
    pub fn drop_vote(&mut self, request_id: u32, voter: NodeId) -> Option<FinishedPoll> {
        let entry = self.open.get_mut(&request_id)?;
        entry.poll.drop_vote(voter);
        self.harvest(request_id)
    }

    /// Abandons a poll wholesale, yielding whatever votes it collected.
    pub fn abandon(&mut self, request_id: u32) -> Option<FinishedPoll> {
        let mut entry = self.open.remove(&request_id)?;
        debug!(request_id, "poll abandoned");
        Some(FinishedPoll {
            request_id,
            result: entry.poll.take_result(),
            duration: entry.timer.elapsed(),
        })
    }

    fn harvest(&mut self, request_id: u32) -> Option<FinishedPoll> {
        if !self.open.get(&request_id)?.poll.finished() {
            return None;
        }
        let mut entry = self.open.remove(&request_id)?;
        Some(FinishedPoll {
            request_id,
            result: entry.poll.take_result(),
            duration: entry.timer.elapsed(),
        })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.open.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.open.is_empty()
    }

    #[must_use]
    pub fn contains(&self, request_id: u32) -> bool {
        self.open.contains_key(&request_id)
    }

    /// The voters a poll is still waiting on; empty for unknown polls.
    #[must_use]
    pub fn waiting(&self, request_id: u32) -> Vec<NodeId> {
        self.open
            .get(&request_id)
            .map(|entry| entry.poll.waiting())
            .unwrap_or_default()
    }
}
