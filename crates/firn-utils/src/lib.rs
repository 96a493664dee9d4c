//! Shared containers and plumbing for the firn stack.
//!
//! - [`Bag`]: multiset with threshold tracking (vote tallies)
//! - [`Set`]: thin hash-set wrapper with set-algebra helpers
//! - [`cache`]: bounded LRU with eviction notification
//! - [`timer`]: wall-clock timers and the adaptive network timeout
//! - [`math`]: checked arithmetic on stake weights
//! - [`logging`]: `tracing` subscriber bootstrap

pub mod bag;
pub mod cache;
pub mod logging;
pub mod math;
pub mod set;
pub mod timer;

pub use bag::Bag;
pub use set::Set;
