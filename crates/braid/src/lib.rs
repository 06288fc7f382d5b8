//! braid: a secure multiplexed stream transport.
//!
//! This umbrella crate re-exports the core types and wires the shipped
//! transport adaptors into a ready-to-use [`Registry`]. Each adaptor is
//! behind a feature flag; enable the ones you need:
//!
//! ```toml
//! [dependencies]
//! braid = { version = "0.1", features = ["tcp", "websocket"] }
//! ```

// Re-export core types
pub use braid_core::*;

/// TCP transport adaptor.
#[cfg(feature = "tcp")]
pub use braid_transport_tcp as tcp;

/// WebSocket transport adaptor.
#[cfg(feature = "websocket")]
pub use braid_transport_websocket as websocket;

/// A registry pre-populated with every transport adaptor this build
/// ships: "tcp", "tcp4", "tcp6" and "ws", "ws4", "ws6" with the default
/// features.
///
/// This is the process default: construct it once at startup and pass it
/// down explicitly. There is no hidden global; programs that want a
/// different wiring build their own [`Registry`] and call the adaptors'
/// `register` functions themselves.
pub fn default_registry() -> Registry {
    let registry = Registry::new();
    #[cfg(feature = "tcp")]
    braid_transport_tcp::register(&registry);
    #[cfg(feature = "websocket")]
    braid_transport_websocket::register(&registry);
    registry
}

/// Prelude module for convenient imports.
///
/// ```ignore
/// use braid::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{
        default_registry, Config, DialOpts, Endpoint, Flow, Listener, Principal, Registry,
        RoutingId, Vc,
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn default_registry_carries_shipped_adaptors() {
        let registry = default_registry();
        for protocol in ["tcp", "tcp4", "tcp6", "ws", "ws4", "ws6"] {
            assert!(
                registry.get(protocol).is_some(),
                "missing adaptor for {}",
                protocol
            );
        }
        assert!(registry.get("ipc").is_none());
    }

    #[test]
    fn registries_are_independent_values() {
        let a = default_registry();
        let b = Registry::new();
        // A fresh registry is empty; the default wiring did not leak into
        // a shared global.
        assert!(a.get("tcp").is_some());
        assert!(b.get("tcp").is_none());
    }

    #[tokio::test]
    async fn default_registry_dials_tcp_loopback() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let registry = default_registry();
        let mut listener = registry.listen("tcp", "127.0.0.1:0").await.unwrap();
        let addr = listener.address().to_string();

        let server = tokio::spawn(async move {
            let mut conn = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            conn.read_exact(&mut buf).await.unwrap();
            conn.write_all(&buf).await.unwrap();
        });

        let mut conn = registry
            .dial("tcp", &addr, Duration::from_secs(5))
            .await
            .unwrap();
        conn.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        server.await.unwrap();
    }
}
