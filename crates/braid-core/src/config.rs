//! Tunables consumed by the transport core.

use std::time::Duration;

use crate::bqueue::DEFAULT_QUANTUM;
use crate::version::VersionRange;

/// Whether a VC encrypts payloads.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SecurityLevel {
    /// Skip key agreement and blessing exchange; payloads stay plaintext.
    /// Allowed only for tests.
    None,
    /// Authenticated encryption with handshake-derived session keys.
    Confidential,
}

/// Configuration for dialing, accepting and running VCs.
#[derive(Clone, Debug)]
pub struct Config {
    /// Time allowed for the underlying TCP/WebSocket connect.
    pub dial_timeout: Duration,
    /// Time allowed for the whole VC handshake.
    pub handshake_timeout: Duration,
    /// Initial receive window per flow, in bytes.
    pub default_flow_credit: u32,
    /// Fair-share scheduler quantum, in bytes.
    pub drr_quantum: usize,
    pub security: SecurityLevel,
    /// Protocol versions this peer is willing to negotiate.
    pub versions: VersionRange,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            dial_timeout: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(30),
            default_flow_credit: 16384,
            drr_quantum: DEFAULT_QUANTUM,
            security: SecurityLevel::Confidential,
            versions: VersionRange::default(),
        }
    }
}

impl Config {
    /// Plaintext configuration for tests.
    pub fn insecure() -> Self {
        Config {
            security: SecurityLevel::None,
            ..Config::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = Config::default();
        assert_eq!(cfg.dial_timeout, Duration::from_secs(30));
        assert_eq!(cfg.handshake_timeout, Duration::from_secs(30));
        assert_eq!(cfg.default_flow_credit, 16384);
        assert_eq!(cfg.drr_quantum, 4096);
        assert_eq!(cfg.security, SecurityLevel::Confidential);
    }
}
