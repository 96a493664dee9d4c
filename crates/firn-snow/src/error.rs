//! Consensus error taxonomy.
//!
//! Four classes with different handling:
//! - verification failures reject the offending item and never halt the chain
//! - state conflicts transition items to `Rejected`
//! - transient conditions are retried by the caller
//! - storage and invariant failures are fatal and halt the chain

use firn_codec::{PackError, UnpackError};
use firn_db::DatabaseError;
use firn_ids::Id;
use firn_utils::math::WeightOverflow;
use thiserror::Error;

/// Result alias for consensus operations.
pub type Result<T> = std::result::Result<T, ConsensusError>;

/// Errors surfaced by the consensus core.
#[derive(Debug, Error)]
pub enum ConsensusError {
    // ---- verification ----
    #[error("invalid vertex: {0}")]
    InvalidVertex(String),

    #[error("invalid transaction: {0}")]
    InvalidTx(String),

    #[error("malformed bytes: {0}")]
    Codec(#[from] UnpackError),

    #[error("encoding failed: {0}")]
    Encode(#[from] PackError),

    #[error("stop vertex issued before its activation time")]
    StopVertexNotAllowedTimestamp,

    #[error("a stop vertex has already been accepted")]
    StopVertexAlreadyAccepted,

    #[error("stop vertex closure does not match the accepted frontier")]
    UnexpectedEdges,

    #[error("dependency outside the stop vertex transitive path")]
    UnexpectedDependencyStopVtx,

    // ---- state ----
    #[error("input already consumed by accepted transaction {0}")]
    InputConsumed(Id),

    #[error("{0} already issued")]
    DuplicateItem(Id),

    #[error("{0} is not known")]
    UnknownItem(Id),

    #[error("parent {0} is rejected")]
    ParentRejected(Id),

    #[error("dependency {0} is rejected")]
    DependencyRejected(Id),

    #[error("conflict arose against already finalized {0}")]
    ConflictWithFinalized(Id),

    // ---- configuration ----
    #[error("invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("validator set has no weight to sample")]
    InsufficientWeight,

    #[error(transparent)]
    WeightOverflow(#[from] WeightOverflow),

    // ---- fatal ----
    #[error("store error: {0}")]
    Database(#[from] DatabaseError),

    #[error("store version {found} is newer than the supported {supported}")]
    IncompatibleStore { found: String, supported: String },

    #[error("handler {name} failed while accepting {container}: {source}")]
    HandlerFailure {
        name: String,
        container: Id,
        #[source]
        source: Box<ConsensusError>,
    },

    #[error("chain halted")]
    Halted,

    #[error("internal: {0}")]
    Internal(String),
}

impl ConsensusError {
    /// True for failures after which the chain must stop committing.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ConsensusError::Database(_)
                | ConsensusError::IncompatibleStore { .. }
                | ConsensusError::HandlerFailure { .. }
                | ConsensusError::Halted
                | ConsensusError::Internal(_)
        )
    }
}
