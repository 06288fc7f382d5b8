//! The uniform dial/listen contract over underlying byte streams.
//!
//! A transport is a pair of capabilities `{dial, listen}` producing
//! reliable, in-order byte streams. Protocols register in an explicit
//! [`Registry`] passed at initialisation; there is no implicit global
//! table. The TCP and WebSocket adaptors live in their own crates and
//! install themselves into a registry via their `register` functions;
//! the `braid` umbrella crate's `default_registry()` returns a registry
//! with every shipped adaptor already installed.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use parking_lot::RwLock;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::{Error, ErrorKind, Result};

/// A reliable, in-order, bidirectional byte stream.
pub trait Conn: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> Conn for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

pub type BoxedConn = Box<dyn Conn>;

/// `dial(protocol, address, timeout)` capability.
pub type DialFn =
    Arc<dyn Fn(&str, &str, Duration) -> BoxFuture<'static, Result<BoxedConn>> + Send + Sync>;

/// `listen(protocol, address)` capability.
pub type ListenFn = Arc<dyn Fn(&str, &str) -> BoxFuture<'static, Result<ConnListener>> + Send + Sync>;

/// Capability object for one protocol family.
#[derive(Clone)]
pub struct Transport {
    pub dial: DialFn,
    pub listen: ListenFn,
}

/// An accepting socket produced by `listen`.
pub struct ConnListener {
    address: String,
    accept: Box<dyn FnMut() -> BoxFuture<'static, Result<BoxedConn>> + Send>,
}

impl ConnListener {
    pub fn new(
        address: impl Into<String>,
        accept: impl FnMut() -> BoxFuture<'static, Result<BoxedConn>> + Send + 'static,
    ) -> Self {
        ConnListener {
            address: address.into(),
            accept: Box::new(accept),
        }
    }

    /// The bound address, with ephemeral ports resolved.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Accept the next connection.
    pub async fn accept(&mut self) -> Result<BoxedConn> {
        (self.accept)().await
    }
}

impl std::fmt::Debug for ConnListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnListener")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

/// Maps protocol names to transports.
#[derive(Default)]
pub struct Registry {
    map: RwLock<HashMap<String, Transport>>,
}

impl Registry {
    pub fn new() -> Self {
        Registry::default()
    }

    /// Register one transport under several protocol names
    /// (e.g. "tcp", "tcp4", "tcp6").
    pub fn register(&self, protocols: &[&str], transport: Transport) {
        let mut map = self.map.write();
        for p in protocols {
            map.insert((*p).to_string(), transport.clone());
        }
    }

    pub fn get(&self, protocol: &str) -> Option<Transport> {
        self.map.read().get(protocol).cloned()
    }

    fn require(&self, protocol: &str) -> Result<Transport> {
        self.get(protocol).ok_or_else(|| {
            Error::new(
                ErrorKind::HandshakeFailure,
                format!("no transport registered for protocol {:?}", protocol),
            )
        })
    }

    pub async fn dial(&self, protocol: &str, address: &str, timeout: Duration) -> Result<BoxedConn> {
        let t = self.require(protocol)?;
        (t.dial)(protocol, address, timeout).await
    }

    pub async fn listen(&self, protocol: &str, address: &str) -> Result<ConnListener> {
        let t = self.require(protocol)?;
        (t.listen)(protocol, address).await
    }
}
