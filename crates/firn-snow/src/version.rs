//! Node and store version constants.
//!
//! These are compiled defaults read at startup; nothing mutates them after
//! the engine starts.

use std::fmt;
use std::str::FromStr;

/// A three-part semantic version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

/// The running node version.
pub const CURRENT: Version = Version::new(0, 3, 0);

/// Oldest peer version this node will speak to.
pub const MINIMUM_COMPATIBLE: Version = Version::new(0, 2, 0);

/// Layout version written to new stores; startup refuses anything newer.
pub const CURRENT_STORE: Version = Version::new(1, 1, 0);

impl Version {
    #[must_use]
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// True when a peer at `other` can interoperate with this version.
    #[must_use]
    pub fn compatible_with(&self, other: &Version) -> bool {
        *other >= MINIMUM_COMPATIBLE && other.major == self.major
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for Version {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split('.');
        let mut next = |name: &str| -> Result<u32, String> {
            parts
                .next()
                .ok_or_else(|| format!("missing {name} component in {s:?}"))?
                .parse::<u32>()
                .map_err(|e| format!("bad {name} component in {s:?}: {e}"))
        };
        let version = Version::new(next("major")?, next("minor")?, next("patch")?);
        if parts.next().is_some() {
            return Err(format!("too many components in {s:?}"));
        }
        Ok(version)
    }
}
