//! The Avalanche-family consensus core.
//!
//! Agreement is reached by repeated sampled polls against a weighted
//! validator set. Per-choice counters (the Snowball family) turn poll
//! results into confidence; the conflict graph (Snowstorm) resolves
//! transaction-level conflicts; the DAG instance (Avalanche) propagates
//! confidence along ancestry and maintains the accepted frontier; and the
//! engine drives polls, applies results and persists decisions with
//! crash-safe commits.
//!
//! # Layout
//!
//! - [`consensus`]: Snowball counters, Snowstorm, the DAG, the poll registry
//! - [`state`]: vertex wire form, durable layout, unique-vertex cache
//! - [`engine`]: the per-chain driver
//! - [`validators`] / [`sampler`] / [`tracker`] / [`benchlist`]: the
//!   validator side
//! - [`events`] / [`sender`] / [`vm`] / [`message`]: collaborator contracts

pub mod benchlist;
mod choices;
pub mod consensus;
pub mod engine;
mod error;
pub mod events;
pub mod message;
mod parameters;
pub mod sampler;
pub mod sender;
pub mod state;
pub mod tracker;
pub mod validators;
pub mod version;
pub mod vm;

pub use choices::{Decidable, Status};
pub use consensus::avalanche::{Topological, Vertex};
pub use consensus::snowstorm::{ConflictGraph, Tx};
pub use consensus::PollOutcome;
pub use engine::{Engine, EngineConfig, EngineState};
pub use error::{ConsensusError, Result};
pub use parameters::Parameters;
pub use state::{StatelessVertex, UniqueVertex, VertexManager};
pub use validators::{Validator, ValidatorSet};
