//! WebSocket transport adaptor.
//!
//! The client performs the HTTP upgrade, then the socket is wrapped so
//! each application write goes out as one binary message and reads
//! concatenate binary messages back into a byte stream, giving VCs the
//! same reliable in-order contract as TCP.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use futures_util::{FutureExt, Sink, Stream};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;

use braid_core::{BoxedConn, ConnListener, Error, ErrorKind, Registry, Result, Transport};

/// Protocol names served by this adaptor.
pub const PROTOCOLS: &[&str] = &["ws", "ws4", "ws6"];

/// Adapts a WebSocket into the byte-stream `Conn` contract.
pub struct WsByteStream<S> {
    ws: WebSocketStream<S>,
    pending: Bytes,
}

impl<S> WsByteStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(ws: WebSocketStream<S>) -> Self {
        WsByteStream {
            ws,
            pending: Bytes::new(),
        }
    }
}

fn ws_err(e: tokio_tungstenite::tungstenite::Error) -> io::Error {
    io::Error::other(e)
}

impl<S> AsyncRead for WsByteStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if !this.pending.is_empty() {
                let n = buf.remaining().min(this.pending.len());
                let chunk = this.pending.split_to(n);
                buf.put_slice(&chunk);
                return Poll::Ready(Ok(()));
            }
            match Pin::new(&mut this.ws).poll_next(cx) {
                Poll::Ready(Some(Ok(msg))) => match msg {
                    WsMessage::Binary(data) => this.pending = Bytes::from(data),
                    WsMessage::Text(text) => this.pending = Bytes::from(text.into_bytes()),
                    WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_) => {}
                    WsMessage::Close(_) => return Poll::Ready(Ok(())),
                },
                Poll::Ready(Some(Err(e))) => return Poll::Ready(Err(ws_err(e))),
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl<S> AsyncWrite for WsByteStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        match Pin::new(&mut this.ws).poll_ready(cx) {
            Poll::Ready(Ok(())) => {}
            Poll::Ready(Err(e)) => return Poll::Ready(Err(ws_err(e))),
            Poll::Pending => return Poll::Pending,
        }
        match Pin::new(&mut this.ws).start_send(WsMessage::Binary(buf.to_vec())) {
            Ok(()) => Poll::Ready(Ok(buf.len())),
            Err(e) => Poll::Ready(Err(ws_err(e))),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        Pin::new(&mut this.ws).poll_flush(cx).map_err(ws_err)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        Pin::new(&mut this.ws).poll_close(cx).map_err(ws_err)
    }
}

/// Upgrade to a WebSocket at `addr` within `timeout`.
pub async fn dial(addr: &str, timeout: Duration) -> Result<BoxedConn> {
    let url = format!("ws://{}", addr);
    let (ws, _response) = tokio::time::timeout(timeout, tokio_tungstenite::connect_async(url))
        .await
        .map_err(|_| {
            Error::new(
                ErrorKind::Timeout,
                format!("websocket connect to {} timed out after {:?}", addr, timeout),
            )
        })?
        .map_err(|e| Error::new(ErrorKind::TransientIo, e.to_string()))?;
    Ok(Box::new(WsByteStream::new(ws)))
}

/// Bind `addr` and upgrade each accepted connection.
pub async fn listen(addr: &str) -> Result<ConnListener> {
    let listener = TcpListener::bind(addr).await?;
    let bound = listener.local_addr()?.to_string();
    let listener = Arc::new(listener);
    Ok(ConnListener::new(bound, move || {
        let listener = listener.clone();
        async move {
            let (stream, _peer) = listener.accept().await?;
            let ws = tokio_tungstenite::accept_async(stream)
                .await
                .map_err(|e| Error::new(ErrorKind::TransientIo, e.to_string()))?;
            Ok(Box::new(WsByteStream::new(ws)) as BoxedConn)
        }
        .boxed()
    }))
}

/// The `{dial, listen}` capability object for WebSockets.
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
