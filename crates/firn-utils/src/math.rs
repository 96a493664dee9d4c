//! Checked arithmetic on stake weights.

use thiserror::Error;

/// Overflow while combining stake weights.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("weight overflow adding {0} and {1}")]
pub struct WeightOverflow(pub u64, pub u64);

/// Adds two weights, surfacing overflow instead of wrapping.
pub fn add_weight(a: u64, b: u64) -> Result<u64, WeightOverflow> {
    a.checked_add(b).ok_or(WeightOverflow(a, b))
}

/// Subtracts `b` from `a`, clamping at zero.
///
/// Disconnects can outpace joins while a validator set is being rebuilt, so
/// undercounting is preferred over failing the caller.
#[must_use]
pub fn sub_weight(a: u64, b: u64) -> u64 {
    a.saturating_sub(b)
}
