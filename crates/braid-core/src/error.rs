//! Error taxonomy for the transport core.
//!
//! Every failure surfaced by this crate carries an [`ErrorKind`] with a
//! stable machine-readable identifier plus a human-readable message. The
//! identifier is what callers and logs should key on; the message text may
//! change between releases, the identifier does not.

use std::fmt;
use std::io;

/// Classification of a transport error.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Transient I/O failure; the operation may be retried by the caller.
    TransientIo,
    /// The peers' advertised version ranges do not intersect.
    VersionMismatch,
    /// The VC handshake failed (malformed setup, missing key material,
    /// bad blessing signature, timeout mid-exchange).
    HandshakeFailure,
    /// A configured authorizer rejected the peer.
    AuthorizationDenied,
    /// An authenticated payload failed to decrypt; the connection is
    /// treated as compromised and torn down.
    DecryptionFailure,
    /// The flow was closed; other flows on the VC are unaffected.
    FlowClosed,
    /// The VC was closed; every flow on it fails with this kind.
    VcClosed,
    /// The proxy has no registration for the requested route.
    RouteNotFound,
    /// An unknown message tag or malformed frame was read; fatal for the
    /// connection and not retryable.
    UnrecognizedMessage,
    /// The operation was cancelled by the caller.
    Canceled,
    /// The operation did not complete within its deadline.
    Timeout,
}

impl ErrorKind {
    /// Stable machine-readable identifier for this kind.
    pub fn id(&self) -> &'static str {
        match self {
            ErrorKind::TransientIo => "braid.transientIo",
            ErrorKind::VersionMismatch => "braid.versionMismatch",
            ErrorKind::HandshakeFailure => "braid.handshakeFailure",
            ErrorKind::AuthorizationDenied => "braid.authorizationDenied",
            ErrorKind::DecryptionFailure => "braid.decryptionFailure",
            ErrorKind::FlowClosed => "braid.flowClosed",
            ErrorKind::VcClosed => "braid.vcClosed",
            ErrorKind::RouteNotFound => "braid.routeNotFound",
            ErrorKind::UnrecognizedMessage => "braid.unrecognizedMessage",
            ErrorKind::Canceled => "braid.canceled",
            ErrorKind::Timeout => "braid.timeout",
        }
    }

    /// Whether the caller may retry the failed operation.
    pub fn retryable(&self) -> bool {
        matches!(self, ErrorKind::TransientIo)
    }
}

/// A transport error: a kind plus a human-readable message.
#[derive(Clone, Debug)]
pub struct Error {
    kind: ErrorKind,
    msg: String,
}

impl Error {
    pub fn new(kind: ErrorKind, msg: impl Into<String>) -> Self {
        Error {
            kind,
            msg: msg.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn id(&self) -> &'static str {
        self.kind.id()
    }

    pub fn message(&self) -> &str {
        &self.msg
    }

    pub fn retryable(&self) -> bool {
        self.kind.retryable()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.id(), self.msg)
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::new(ErrorKind::TransientIo, e.to_string())
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_stable() {
        assert_eq!(ErrorKind::VersionMismatch.id(), "braid.versionMismatch");
        assert_eq!(ErrorKind::FlowClosed.id(), "braid.flowClosed");
        assert_eq!(ErrorKind::RouteNotFound.id(), "braid.routeNotFound");
    }

    #[test]
    fn display_includes_id_and_message() {
        let err = Error::new(ErrorKind::VcClosed, "went away");
        let s = err.to_string();
        assert!(s.contains("braid.vcClosed"));
        assert!(s.contains("went away"));
    }

    #[test]
    fn only_transient_io_is_retryable() {
        assert!(ErrorKind::TransientIo.retryable());
        assert!(!ErrorKind::VersionMismatch.retryable());
        assert!(!ErrorKind::DecryptionFailure.retryable());
    }

    #[test]
    fn io_errors_map_to_transient() {
        let err: Error = io::Error::new(io::ErrorKind::ConnectionReset, "reset").into();
        assert_eq!(err.kind(), ErrorKind::TransientIo);
    }
}
