//! Protocol version negotiation.

use std::fmt;

use crate::error::{Error, ErrorKind};

/// A protocol version number carried in `Setup` messages.
pub type Version = u16;

/// Inclusive range of protocol versions a peer is willing to speak.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VersionRange {
    pub min: Version,
    pub max: Version,
}

/// Versions this implementation understands.
pub const SUPPORTED_VERSIONS: VersionRange = VersionRange { min: 6, max: 7 };

impl VersionRange {
    pub fn new(min: Version, max: Version) -> Self {
        VersionRange { min, max }
    }

    pub fn contains(&self, v: Version) -> bool {
        self.min <= v && v <= self.max
    }

    /// Pick the version both ranges agree on: the lower of the two maxima,
    /// provided the ranges intersect at all.
    pub fn common(&self, other: &VersionRange) -> Result<Version, Error> {
        let v = self.max.min(other.max);
        if self.contains(v) && other.contains(v) {
            Ok(v)
        } else {
            Err(Error::new(
                ErrorKind::VersionMismatch,
                format!("version mismatch: local {} vs remote {}", self, other),
            ))
        }
    }
}

impl Default for VersionRange {
    fn default() -> Self {
        SUPPORTED_VERSIONS
    }
}

impl fmt::Display for VersionRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{},{}]", self.min, self.max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn common_picks_lower_max() {
        let a = VersionRange::new(6, 9);
        let b = VersionRange::new(6, 7);
        assert_eq!(a.common(&b).unwrap(), 7);
        assert_eq!(b.common(&a).unwrap(), 7);
    }

    #[test]
    fn disjoint_ranges_fail() {
        let a = VersionRange::new(9, 9);
        let b = VersionRange::new(1, 7);
        let err = a.common(&b).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::VersionMismatch);
        assert!(err.to_string().contains("version mismatch"));
    }

    #[test]
    fn identical_ranges() {
        let a = VersionRange::new(7, 7);
        assert_eq!(a.common(&a).unwrap(), 7);
    }
}
