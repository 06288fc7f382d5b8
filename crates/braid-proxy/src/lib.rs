//! Routing proxy.
//!
//! Servers dial the proxy and register their routing id with
//! `SetupRoute`; clients dial the proxy with an endpoint whose route list
//! names a registered server. On the client's routing `SetupVc` the proxy
//! claims the server's parked connection and becomes a relayer: frames
//! are forwarded verbatim in both directions, so the relayed VC handshake
//! and all payload encryption run end-to-end and the proxy never holds
//! plaintext or key material. If either end of a relay disconnects, the
//! other side is closed with reason "peer disconnected".
//!
//! A proxy may chain through an upstream proxy with `MultiProxyRequest`,
//! which the upstream treats as an ordinary server registration.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use braid_core::{
    channel_binding, verify_binding, BlessingPattern, Blessings, BoxedConn, Config, ConnListener,
    Endpoint, Error, ErrorKind, Message, Principal, RawFrame, Result, RouteOption, RoutingId,
    Setup, SetupRoute, SetupVc, DEFAULT_VCI,
};

/// Proxy-specific configuration.
pub struct ProxyConfig {
    pub config: Config,
    /// Blessing patterns allowed to register routes; empty allows anyone.
    pub allowlist: Vec<BlessingPattern>,
    /// Interval between liveness probes to parked registrations.
    pub health_interval: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        ProxyConfig {
            config: Config::default(),
            allowlist: Vec::new(),
            health_interval: Duration::from_secs(10),
        }
    }
}

/// A relayed client handed to a parked registration.
struct Claim {
    conn: BoxedConn,
    /// The routing `SetupVc`, with this hop's route element popped.
    setup_vc: SetupVc,
}

struct RouteEntry {
    claim: mpsc::Sender<Claim>,
}

struct ProxyInner {
    principal: Principal,
    /// The address clients dial; updated when chaining through an
    /// upstream extends the route list.
    endpoint: RwLock<Endpoint>,
    cfg: ProxyConfig,
    routes: RwLock<HashMap<RoutingId, RouteEntry>>,
    tasks: Mutex<JoinSet<()>>,
}

/// A routing proxy. Relays frames between registered servers and dialing
/// clients by routing id.
#[derive(Clone)]
pub struct Proxy {
    inner: Arc<ProxyInner>,
}

impl Proxy {
    pub fn new(principal: Principal, endpoint: Endpoint, cfg: ProxyConfig) -> Proxy {
        Proxy {
            inner: Arc::new(ProxyInner {
                principal,
                endpoint: RwLock::new(endpoint),
                cfg,
                routes: RwLock::new(HashMap::new()),
                tasks: Mutex::new(JoinSet::new()),
            }),
        }
    }

    /// The endpoint this proxy advertises to registering servers.
    pub fn endpoint(&self) -> Endpoint {
        self.inner.endpoint.read().clone()
    }

    pub fn is_registered(&self, rid: RoutingId) -> bool {
        self.inner.routes.read().contains_key(&rid)
    }

    /// Accept and serve connections from `listener` until [`Proxy::shutdown`].
    pub fn serve(&self, mut listener: ConnListener) {
        let inner = self.inner.clone();
        self.inner.tasks.lock().spawn(async move {
            loop {
                match listener.accept().await {
                    Ok(conn) => {
                        let inner2 = inner.clone();
                        inner.tasks.lock().spawn(async move {
                            if let Err(err) = handle_conn(&inner2, conn).await {
                                debug!(error = %err, "proxy connection ended");
                            }
                        });
                    }
                    Err(err) => {
                        warn!(error = %err, "proxy listener failed");
                        break;
                    }
                }
            }
        });
    }

    /// Register this proxy with an upstream proxy over `conn`, extending
    /// the advertised route list. Relayed clients arriving over the
    /// upstream are handled like any other client connection.
    pub fn chain(&self, conn: BoxedConn) {
        let inner = self.inner.clone();
        self.inner.tasks.lock().spawn(async move {
            if let Err(err) = chain_loop(&inner, conn).await {
                warn!(error = %err, "upstream chain ended");
            }
        });
    }

    /// Abort every serving, parked and relaying task.
    pub fn shutdown(&self) {
        self.inner.tasks.lock().abort_all();
        self.inner.routes.write().clear();
    }
}

/// Setup exchange with a dialing peer. Returns (dialer body, our body)
/// for channel binding.
async fn accept_setup(conn: &mut BoxedConn, config: &Config) -> Result<(Vec<u8>, Vec<u8>)> {
    let frame = RawFrame::read_from(conn).await?.ok_or_else(|| {
        Error::new(ErrorKind::HandshakeFailure, "peer closed before Setup")
    })?;
    let peer_body = frame.body.to_vec();
    let peer = match frame.decode()? {
        Message::Setup(setup) => setup,
        other => {
            return Err(Error::new(
                ErrorKind::HandshakeFailure,
                format!("expected Setup, got message tag {}", other.tag()),
            ))
        }
    };

    let my_setup = Message::Setup(Setup {
        versions: config.versions,
        options: Vec::new(),
    });
    let my_body = my_setup.encode_body().freeze().to_vec();
    my_setup.write_to(conn).await?;

    config.versions.common(&peer.versions)?;
    Ok((peer_body, my_body))
}

async fn handle_conn(inner: &Arc<ProxyInner>, mut conn: BoxedConn) -> Result<()> {
    let (peer_body, my_body) = accept_setup(&mut conn, &inner.cfg.config).await?;
    let binding = channel_binding(&peer_body, &my_body);

    let frame = RawFrame::read_from(&mut conn).await?.ok_or_else(|| {
        Error::new(ErrorKind::HandshakeFailure, "peer closed after Setup")
    })?;
    match frame.decode()? {
        // A downstream proxy chains exactly like a server registration.
        Message::MultiProxyRequest => {
            let frame = RawFrame::read_from(&mut conn).await?.ok_or_else(|| {
                Error::new(ErrorKind::HandshakeFailure, "peer closed after MultiProxyRequest")
            })?;
            match frame.decode()? {
                Message::SetupRoute(sr) => handle_registration(inner, conn, sr, &binding).await,
                other => Err(Error::new(
                    ErrorKind::UnrecognizedMessage,
                    format!("expected SetupRoute, got message tag {}", other.tag()),
                )),
            }
        }
        Message::SetupRoute(sr) => handle_registration(inner, conn, sr, &binding).await,
        Message::SetupVc(sv) => handle_client(inner, conn, sv).await,
        other => Err(Error::new(
            ErrorKind::UnrecognizedMessage,
            format!("unexpected message tag {} after proxy setup", other.tag()),
        )),
    }
}

/// Verify a registration's blessings against the allow-list. Returns the
/// verified names.
fn authorize_registration(
    inner: &ProxyInner,
    sr: &SetupRoute,
    binding: &[u8; 32],
) -> Result<Vec<String>> {
    let names = match sr.peer_blessings() {
        Some(raw) => {
            let blessings = Blessings::decode(raw)?;
            let key = blessings.public_key().ok_or_else(|| {
                Error::new(ErrorKind::HandshakeFailure, "registration blessing set is empty")
            })?;
            let sig = sr.channel_binding().ok_or_else(|| {
                Error::new(
                    ErrorKind::HandshakeFailure,
                    "registration carries no channel binding signature",
                )
            })?;
            if !verify_binding(&key, binding, sig) {
                return Err(Error::new(
                    ErrorKind::HandshakeFailure,
                    "registration channel binding does not verify",
                ));
            }
            inner.principal.verify_peer(&blessings)
        }
        None => Vec::new(),
    };

    if !inner.cfg.allowlist.is_empty()
        && !inner.cfg.allowlist.iter().any(|p| p.matches_any(&names))
    {
        return Err(Error::new(
            ErrorKind::AuthorizationDenied,
            format!(
                "authorization error: blessings [{}] may not register routes",
                names.join(",")
            ),
        ));
    }
    Ok(names)
}

async fn handle_registration(
    inner: &Arc<ProxyInner>,
    mut conn: BoxedConn,
    sr: SetupRoute,
    binding: &[u8; 32],
) -> Result<()> {
    let rid: RoutingId = sr
        .route
        .parse()
        .map_err(|_| Error::new(ErrorKind::RouteNotFound, format!("bad route {:?}", sr.route)))?;

    let names = match authorize_registration(inner, &sr, binding) {
        Ok(names) => names,
        Err(err) => {
            let _ = Message::CloseVc {
                vci: DEFAULT_VCI,
                reason: err.message().to_string(),
            }
            .write_to(&mut conn)
            .await;
            return Err(err);
        }
    };

    let (claim_tx, mut claim_rx) = mpsc::channel::<Claim>(1);
    inner
        .routes
        .write()
        .insert(rid, RouteEntry { claim: claim_tx });
    debug!(rid = %rid, names = names.join(","), "route registered");

    // The endpoint external clients dial: our address with the server's
    // routing id appended to the route list.
    let mut assigned = inner.endpoint.read().clone();
    assigned.routes.push(rid.to_string());
    assigned.rid = rid;
    assigned.blessing_names = names;
    Message::ProxyResponse {
        endpoints: vec![assigned.to_string()],
    }
    .write_to(&mut conn)
    .await?;

    // Park until a client claims this registration, probing liveness.
    let (mut read_half, mut write_half) = tokio::io::split(conn);
    let mut probe = tokio::time::interval(inner.cfg.health_interval);
    loop {
        tokio::select! {
            claim = claim_rx.recv() => match claim {
                Some(Claim { conn: client, setup_vc }) => {
                    let mut server = read_half.unsplit(write_half);
                    Message::SetupVc(setup_vc).write_to(&mut server).await?;
                    debug!(rid = %rid, "relay attached");
                    relay(client, server).await;
                    return Ok(());
                }
                None => {
                    inner.routes.write().remove(&rid);
                    return Ok(());
                }
            },
            frame = RawFrame::read_from(&mut read_half) => {
                // A parked server has nothing to say; tolerate probes only.
                let probe_only = match frame {
                    Ok(Some(f)) => matches!(f.decode(), Ok(Message::HealthCheck { .. })),
                    _ => false,
                };
                if !probe_only {
                    inner.routes.write().remove(&rid);
                    debug!(rid = %rid, "registration dropped");
                    return Ok(());
                }
            },
            _ = probe.tick() => {
                if (Message::HealthCheck { vci: DEFAULT_VCI })
                    .write_to(&mut write_half)
                    .await
                    .is_err()
                {
                    inner.routes.write().remove(&rid);
                    return Ok(());
                }
            }
        }
    }
}

async fn handle_client(
    inner: &Arc<ProxyInner>,
    mut conn: BoxedConn,
    sv: SetupVc,
) -> Result<()> {
    let refuse = |reason: String| Error::new(ErrorKind::RouteNotFound, reason);

    let outcome = route_claim(inner, &sv);
    match outcome {
        Ok((entry, rewritten)) => {
            match entry.claim.send(Claim { conn, setup_vc: rewritten }).await {
                Ok(()) => Ok(()),
                Err(send_err) => {
                    // The registration vanished between lookup and claim.
                    let Claim { conn: mut client, .. } = send_err.0;
                    let reason = "proxy route not found: registration gone".to_string();
                    let _ = Message::CloseVc { vci: DEFAULT_VCI, reason: reason.clone() }
                        .write_to(&mut client)
                        .await;
                    Err(refuse(reason))
                }
            }
        }
        Err(err) => {
            let _ = Message::CloseVc {
                vci: DEFAULT_VCI,
                reason: err.message().to_string(),
            }
            .write_to(&mut conn)
            .await;
            Err(err)
        }
    }
}

/// Look up the client's first route element and claim the registration,
/// returning the rewritten routing `SetupVc` (that element popped).
fn route_claim(inner: &ProxyInner, sv: &SetupVc) -> Result<(RouteEntry, SetupVc)> {
    let target: Endpoint = sv.remote_endpoint.parse().map_err(|_| {
        Error::new(
            ErrorKind::RouteNotFound,
            format!("proxy route not found: bad endpoint {:?}", sv.remote_endpoint),
        )
    })?;
    let first = target.routes.first().ok_or_else(|| {
        Error::new(
            ErrorKind::RouteNotFound,
            format!("proxy route not found: endpoint {} has no routes", target),
        )
    })?;
    let rid: RoutingId = first.parse().map_err(|_| {
        Error::new(
            ErrorKind::RouteNotFound,
            format!("proxy route not found: bad routing id {:?}", first),
        )
    })?;

    // Claiming consumes the registration: the relay owns the server's
    // connection from here on. Servers re-register to stay reachable.
    let entry = inner.routes.write().remove(&rid).ok_or_else(|| {
        Error::new(
            ErrorKind::RouteNotFound,
            format!("proxy route not found: {}", rid),
        )
    })?;

    let mut rewritten_ep = target;
    rewritten_ep.routes.remove(0);
    let rewritten = SetupVc {
        local_endpoint: sv.local_endpoint.clone(),
        remote_endpoint: rewritten_ep.to_string(),
        counters: sv.counters.clone(),
        options: sv.options.clone(),
    };
    Ok((entry, rewritten))
}

/// Forward frames verbatim in both directions. Each direction's pump
/// closes the opposite side with "peer disconnected" when its reader
/// ends; payloads are never decrypted, only frame boundaries are parsed.
async fn relay(a: BoxedConn, b: BoxedConn) {
    let (read_a, write_a) = tokio::io::split(a);
    let (read_b, write_b) = tokio::io::split(b);
    tokio::join!(pump(read_a, write_b), pump(read_b, write_a));
}

async fn pump(
    mut from: tokio::io::ReadHalf<BoxedConn>,
    mut to: tokio::io::WriteHalf<BoxedConn>,
) {
    loop {
        match RawFrame::read_from(&mut from).await {
            Ok(Some(frame)) => {
                if to.write_all(&frame.encode()).await.is_err() {
                    break;
                }
            }
            Ok(None) | Err(_) => {
                let _ = Message::CloseVc {
                    vci: DEFAULT_VCI,
                    reason: "peer disconnected".to_string(),
                }
                .write_to(&mut to)
                .await;
                let _ = to.shutdown().await;
                break;
            }
        }
    }
}

/// Dial-side of [`Proxy::chain`]: register with the upstream, adopt the
/// endpoint it assigns, then treat relayed routing requests as client
/// arrivals.
async fn chain_loop(inner: &Arc<ProxyInner>, mut conn: BoxedConn) -> Result<()> {
    let config = &inner.cfg.config;
    let my_setup = Message::Setup(Setup {
        versions: config.versions,
        options: Vec::new(),
    });
    let my_body = my_setup.encode_body().freeze().to_vec();
    my_setup.write_to(&mut conn).await?;

    let frame = RawFrame::read_from(&mut conn).await?.ok_or_else(|| {
        Error::new(ErrorKind::HandshakeFailure, "upstream closed before Setup")
    })?;
    let peer_body = frame.body.to_vec();
    match frame.decode()? {
        Message::Setup(setup) => {
            config.versions.common(&setup.versions)?;
        }
        other => {
            return Err(Error::new(
                ErrorKind::HandshakeFailure,
                format!("expected Setup from upstream, got message tag {}", other.tag()),
            ))
        }
    }
    let binding = channel_binding(&my_body, &peer_body);

    Message::MultiProxyRequest.write_to(&mut conn).await?;
    let own_rid = inner.endpoint.read().rid;
    let mut options = Vec::new();
    if !inner.principal.blessings().is_empty() {
        options.push(RouteOption::PeerBlessings(
            inner.principal.blessings().encode(),
        ));
        options.push(RouteOption::ChannelBinding(
            inner.principal.sign_binding(&binding).to_vec(),
        ));
    }
    Message::SetupRoute(SetupRoute {
        route: own_rid.to_string(),
        options,
    })
    .write_to(&mut conn)
    .await?;

    match Message::read_from(&mut conn).await? {
        Some(Message::ProxyResponse { endpoints }) => {
            if let Some(ep) = endpoints.first().and_then(|s| s.parse::<Endpoint>().ok()) {
                // Servers registering here now advertise the upstream's
                // address with our route prepended.
                *inner.endpoint.write() = ep;
            }
        }
        Some(Message::CloseVc { reason, .. }) => {
            return Err(Error::new(
                ErrorKind::VcClosed,
                format!("upstream refused chain: {}", reason),
            ))
        }
        _ => {
            return Err(Error::new(
                ErrorKind::HandshakeFailure,
                "upstream sent no ProxyResponse",
            ))
        }
    }

    // Park on the upstream until it relays a client to us.
    loop {
        match RawFrame::read_from(&mut conn).await? {
            Some(frame) => match frame.decode()? {
                Message::HealthCheck { .. } => continue,
                Message::SetupVc(sv) => return handle_client(inner, conn, sv).await,
                other => {
                    return Err(Error::new(
                        ErrorKind::UnrecognizedMessage,
                        format!("unexpected message tag {} from upstream", other.tag()),
                    ))
                }
            },
            None => return Err(Error::new(ErrorKind::VcClosed, "peer disconnected")),
        }
    }
}
