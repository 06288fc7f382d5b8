//! TCP transport adaptor.
//!
//! Dials with a caller-supplied timeout and enables keep-alive on every
//! connection, tuned so a dead peer is detected within roughly two
//! minutes (30 s idle, 15 s probe interval).

use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use socket2::{SockRef, TcpKeepalive};
use tokio::net::{TcpListener, TcpStream};

use braid_core::{BoxedConn, ConnListener, Error, ErrorKind, Registry, Result, Transport};

/// Protocol names served by this adaptor.
pub const PROTOCOLS: &[&str] = &["tcp", "tcp4", "tcp6"];

const KEEPALIVE_IDLE: Duration = Duration::from_secs(30);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);

fn configure(stream: &TcpStream) -> std::io::Result<()> {
    stream.set_nodelay(true)?;
    let keepalive = TcpKeepalive::new()
        .with_time(KEEPALIVE_IDLE)
        .with_interval(KEEPALIVE_INTERVAL);
    SockRef::from(stream).set_tcp_keepalive(&keepalive)?;
    Ok(())
}

/// Connect to `addr` within `timeout`.
pub async fn dial(addr: &str, timeout: Duration) -> Result<BoxedConn> {
    let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| {
            Error::new(
                ErrorKind::Timeout,
                format!("connect to {} timed out after {:?}", addr, timeout),
            )
        })??;
    configure(&stream)?;
    Ok(Box::new(stream))
}

/// Bind `addr` and accept connections with keep-alive enabled.
pub async fn listen(addr: &str) -> Result<ConnListener> {
    let listener = TcpListener::bind(addr).await?;
    let bound = listener.local_addr()?.to_string();
    let listener = Arc::new(listener);
    Ok(ConnListener::new(bound, move || {
        let listener = listener.clone();
        async move {
            let (stream, _peer) = listener.accept().await?;
            configure(&stream)?;
            Ok(Box::new(stream) as BoxedConn)
        }
        .boxed()
    }))
}

/// The `{dial, listen}` capability object for TCP.
pub fn transport() -> Transport {
    Transport {
        dial: Arc::new(|_protocol, addr, timeout| {
            let addr = addr.to_string();
            async move { dial(&addr, timeout).await }.boxed()
        }),
        listen: Arc::new(|_protocol, addr| {
            let addr = addr.to_string();
            async move { listen(&addr).await }.boxed()
        }),
    }
}

/// Install this adaptor into a registry under [`PROTOCOLS`].
pub fn register(registry: &Registry) {
    registry.register(PROTOCOLS, transport());
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn dial_listen_roundtrip() {
        let mut listener = listen("127.0.0.1:0").await.unwrap();
        let addr = listener.address().to_string();

        let server = tokio::spawn(async move {
            let mut conn = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            conn.read_exact(&mut buf).await.unwrap();
            conn.write_all(&buf).await.unwrap();
        });

        let mut conn = dial(&addr, Duration::from_secs(5)).await.unwrap();
        conn.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn dial_refused_is_transient() {
        // Bind then drop to get a port nothing listens on.
        let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = probe.local_addr().unwrap().to_string();
        drop(probe);

        let err = match dial(&addr, Duration::from_secs(5)).await {
            Err(e) => e,
            Ok(_) => panic!("expected dial to fail"),
        };
        assert_eq!(err.kind(), ErrorKind::TransientIo);
    }

    #[tokio::test]
    async fn registry_integration() {
        let registry = Registry::new();
        register(&registry);
        for p in PROTOCOLS {
            assert!(registry.get(p).is_some());
        }

        let mut listener = registry.listen("tcp", "127.0.0.1:0").await.unwrap();
        let addr = listener.address().to_string();
        let accepting = tokio::spawn(async move { listener.accept().await.unwrap() });
        registry
            .dial("tcp", &addr, Duration::from_secs(5))
            .await
            .unwrap();
        accepting.await.unwrap();
    }
}
