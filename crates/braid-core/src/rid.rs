//! Routing identifiers.
//!
//! A [`RoutingId`] names an endpoint instance independently of its network
//! address: a process keeps the same id across re-listens and address
//! changes, and the proxy routes by it without caring where the instance
//! currently lives.

use std::fmt;
use std::str::FromStr;

use rand::RngCore;

use crate::error::{Error, ErrorKind};

/// Fixed-size random identifier for an endpoint instance.
///
/// Compared by bytes. The all-zero value is reserved as [`RoutingId::NULL`]
/// and means "no routing id"; endpoints used purely as listening hints may
/// carry it, endpoints used for dialing must not.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RoutingId(pub [u8; 16]);

impl RoutingId {
    /// The well-known null value.
    pub const NULL: RoutingId = RoutingId([0u8; 16]);

    /// Generate a fresh random routing id.
    pub fn random() -> Self {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        RoutingId(bytes)
    }

    pub fn is_null(&self) -> bool {
        *self == Self::NULL
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        RoutingId(bytes)
    }
}

impl fmt::Display for RoutingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for RoutingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RoutingId({})", self)
    }
}

impl FromStr for RoutingId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = hex::decode(s).map_err(|_| {
            Error::new(
                ErrorKind::UnrecognizedMessage,
                format!("bad routing id {:?}: not hex", s),
            )
        })?;
        let bytes: [u8; 16] = raw.as_slice().try_into().map_err(|_| {
            Error::new(
                ErrorKind::UnrecognizedMessage,
                format!("bad routing id {:?}: want 16 bytes, got {}", s, raw.len()),
            )
        })?;
        Ok(RoutingId(bytes))
    }
}
