//! Proxy traversal preambles.
//!
//! A connection through a routing proxy starts with a short plaintext
//! preamble on each hop: a version-only `Setup` exchange with the proxy,
//! then either a `SetupRoute` registration (servers) or a routing
//! `SetupVc` naming the target (clients). Once the proxy splices the two
//! connections, the client and server run the ordinary VC handshake
//! end-to-end through the relay, so the proxy never holds key material.

use crate::config::Config;
use crate::crypto::channel_binding;
use crate::endpoint::Endpoint;
use crate::error::{Error, ErrorKind, Result};
use crate::message::{Message, RawFrame, RouteOption, Setup, SetupRoute, SetupVc};
use crate::rid::RoutingId;
use crate::security::Principal;
use crate::transport::BoxedConn;

/// Outcome of a successful proxy registration.
#[derive(Clone, Debug)]
pub struct Registration {
    /// Endpoint strings external clients may dial to reach the server.
    pub endpoints: Vec<String>,
}

async fn exchange_setup(conn: &mut BoxedConn, config: &Config) -> Result<(Vec<u8>, Vec<u8>)> {
    let my_setup = Message::Setup(Setup {
        versions: config.versions,
        options: Vec::new(),
    });
    let my_body = my_setup.encode_body().freeze().to_vec();
    my_setup.write_to(conn).await?;

    match RawFrame::read_from(conn).await? {
        Some(frame) => {
            let peer_body = frame.body.to_vec();
            match frame.decode()? {
                Message::Setup(peer) => {
                    config.versions.common(&peer.versions)?;
                    Ok((my_body, peer_body))
                }
                Message::CloseVc { reason, .. } => Err(Error::new(
                    ErrorKind::VcClosed,
                    format!("closed by peer: {}", reason),
                )),
                other => Err(Error::new(
                    ErrorKind::HandshakeFailure,
                    format!("expected Setup from proxy, got message tag {}", other.tag()),
                )),
            }
        }
        None => Err(Error::new(
            ErrorKind::HandshakeFailure,
            "proxy closed the connection during setup",
        )),
    }
}

/// Client-side preamble: negotiate with the proxy, then send the routing
/// request naming `target`. The caller follows up with the ordinary VC
/// dial handshake on the same connection; it runs end-to-end through the
/// relay.
pub async fn dial_via_proxy(conn: &mut BoxedConn, config: &Config, target: &Endpoint) -> Result<()> {
    if target.routes.is_empty() {
        return Err(Error::new(
            ErrorKind::RouteNotFound,
            format!("endpoint {} names no proxy routes", target),
        ));
    }
    exchange_setup(conn, config).await?;
    Message::SetupVc(SetupVc {
        local_endpoint: String::new(),
        remote_endpoint: target.to_string(),
        counters: Vec::new(),
        options: Vec::new(),
    })
    .write_to(conn)
    .await?;
    Ok(())
}

/// Server-side preamble: register `rid` with the proxy, presenting
/// blessings bound to this hop's setup transcript so the proxy can apply
/// its allow-list.
pub async fn register_with_proxy(
    conn: &mut BoxedConn,
    config: &Config,
    principal: &Principal,
    rid: RoutingId,
) -> Result<Registration> {
    let (my_body, proxy_body) = exchange_setup(conn, config).await?;
    let binding = channel_binding(&my_body, &proxy_body);

    let mut options = Vec::new();
    if !principal.blessings().is_empty() {
        options.push(RouteOption::PeerBlessings(principal.blessings().encode()));
        options.push(RouteOption::ChannelBinding(
            principal.sign_binding(&binding).to_vec(),
        ));
    }
    Message::SetupRoute(SetupRoute {
        route: rid.to_string(),
        options,
    })
    .write_to(conn)
    .await?;

    match Message::read_from(conn).await? {
        Some(Message::ProxyResponse { endpoints }) => Ok(Registration { endpoints }),
        Some(Message::CloseVc { reason, .. }) => Err(Error::new(
            ErrorKind::VcClosed,
            format!("proxy refused registration: {}", reason),
        )),
        Some(other) => Err(Error::new(
            ErrorKind::HandshakeFailure,
            format!("expected ProxyResponse, got message tag {}", other.tag()),
        )),
        None => Err(Error::new(
            ErrorKind::HandshakeFailure,
            "proxy closed the connection during registration",
        )),
    }
}

/// Park on a registered proxy connection until a client is relayed to
/// us. Health probes are absorbed; the routing `SetupVc` consumed here is
/// the relay's start marker, after which the caller runs the ordinary
/// accept handshake on the same connection.
pub async fn await_relay(conn: &mut BoxedConn) -> Result<()> {
    loop {
        match RawFrame::read_from(conn).await? {
            Some(frame) => match frame.decode()? {
                Message::HealthCheck { .. } => continue,
                Message::SetupVc(_) => return Ok(()),
                Message::CloseVc { reason, .. } => {
                    return Err(Error::new(
                        ErrorKind::VcClosed,
                        format!("closed by peer: {}", reason),
                    ))
                }
                other => {
                    return Err(Error::new(
                        ErrorKind::UnrecognizedMessage,
                        format!("unexpected message tag {} while awaiting relay", other.tag()),
                    ))
                }
            },
            None => {
                return Err(Error::new(ErrorKind::VcClosed, "peer disconnected"));
            }
        }
    }
}
