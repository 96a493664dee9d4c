//! Consensus protocols: the Snowball counter family, transaction-level
//! conflict resolution (Snowstorm) and the vertex DAG (Avalanche).

pub mod avalanche;
pub mod poll;
pub mod snowball;
pub mod snowstorm;

use firn_ids::Id;

/// Everything one applied poll decided.
///
/// Vertices and transactions are listed in decision order, parents and
/// dependencies before the items that rely on them.
#[derive(Debug, Default, Clone)]
pub struct PollOutcome {
    pub accepted_txs: Vec<Id>,
    pub rejected_txs: Vec<Id>,
    pub accepted_vertices: Vec<Id>,
    pub rejected_vertices: Vec<Id>,
}

impl PollOutcome {
    /// True when the poll decided anything at all.
    #[must_use]
    pub fn changed(&self) -> bool {
        !(self.accepted_txs.is_empty()
            && self.rejected_txs.is_empty()
            && self.accepted_vertices.is_empty()
            && self.rejected_vertices.is_empty())
    }

    pub fn absorb(&mut self, other: PollOutcome) {
        self.accepted_txs.extend(other.accepted_txs);
        self.rejected_txs.extend(other.rejected_txs);
        self.accepted_vertices.extend(other.accepted_vertices);
        self.rejected_vertices.extend(other.rejected_vertices);
    }
}
