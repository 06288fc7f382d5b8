//! Virtual circuits: one multiplexed, authenticated channel per
//! connection pair.
//!
//! A VC owns the flow table and two long-running tasks: a reader that
//! decodes and dispatches inbound frames, and a sender that drains the
//! buffered queue and is the connection's single writer. The handshake
//! runs before the tasks start: `Setup` exchange (versions, key
//! material), key derivation, then `SetupVc` exchange (endpoints,
//! blessings bound to the handshake transcript). Teardown is top-down:
//! closing the VC fails the listener and every flow, drains the queue and
//! stops both tasks.

use std::collections::HashMap;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tracing::{debug, trace};

use crate::bqueue::Bqueue;
use crate::config::{Config, SecurityLevel};
use crate::crypto::{channel_binding, null_pair, session_pair, KeyExchange, Opener, Sealer};
use crate::endpoint::Endpoint;
use crate::error::{Error, ErrorKind, Result};
use crate::flow::{Flow, FlowParams};
use crate::iobuf::IobufPool;
use crate::listener::Listener;
use crate::message::{
    Counter, Message, RawFrame, Setup, SetupOption, SetupVc, SetupVcOption, DATA_FLAG_CLOSE,
};
use crate::security::{
    decode_discharges, encode_discharges, verify_binding, Blessings, Discharge, Principal,
    ServerAuthorizer,
};
use crate::transport::BoxedConn;
use crate::version::Version;

/// The VC identifier a dialer assigns on a fresh connection. One VC per
/// underlying connection is the default, so the first id is all we use.
pub const DEFAULT_VCI: u32 = 1;

/// Reserved flow id for connection-shared control traffic; never handed
/// to user flows.
pub const SHARED_FLOW_FID: u32 = 1;

/// Commands consumed by the VC's sender task. `Data` payloads submitted
/// here are sealed by the sender, like queue batches.
#[derive(Debug)]
pub(crate) enum SenderCmd {
    Send(Message),
    Shutdown,
}

/// Options for dialing a VC.
#[derive(Default)]
pub struct DialOpts {
    pub config: Config,
    /// Policy applied to the server's verified blessing names.
    pub authorizer: Option<Arc<dyn ServerAuthorizer>>,
}

enum Status {
    Ready,
    Closed(Error),
}

struct VcInner {
    vci: u32,
    dialed: bool,
    version: Version,
    config: Config,
    local_endpoint: Endpoint,
    remote_endpoint: Mutex<Option<Endpoint>>,

    pool: IobufPool,
    queue: Bqueue,
    ctrl: mpsc::UnboundedSender<SenderCmd>,

    flows: Mutex<HashMap<u32, Flow>>,
    next_fid: AtomicU32,
    listener: Mutex<Option<Arc<crate::listener::ListenerShared>>>,

    status: Mutex<Status>,
    closed_tx: watch::Sender<bool>,

    local_blessings: Blessings,
    remote_blessings: Blessings,
    remote_discharges: Vec<Discharge>,
}

/// A virtual circuit. Clones share the same circuit.
#[derive(Clone)]
pub struct Vc {
    inner: Arc<VcInner>,
}

struct HandshakeOutcome {
    dialed: bool,
    version: Version,
    config: Config,
    sealer: Box<dyn Sealer>,
    opener: Box<dyn Opener>,
    local_endpoint: Endpoint,
    remote_endpoint: Option<Endpoint>,
    local_blessings: Blessings,
    remote_blessings: Blessings,
    remote_discharges: Vec<Discharge>,
}

impl Vc {
    /// Dial a VC over a freshly established connection. Runs the whole
    /// handshake under `config.handshake_timeout`; on success the circuit
    /// is `Ready` and [`Vc::connect`] may open flows.
    pub async fn dial(
        mut conn: BoxedConn,
        principal: &Principal,
        local_endpoint: Endpoint,
        remote_endpoint: Endpoint,
        opts: DialOpts,
    ) -> Result<Vc> {
        remote_endpoint.validate_for_dial()?;
        let deadline = opts.config.handshake_timeout;
        match timeout(
            deadline,
            handshake_dial(&mut conn, principal, &local_endpoint, &remote_endpoint, &opts),
        )
        .await
        {
            Ok(Ok(outcome)) => Ok(Vc::start(conn, outcome)),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(Error::new(ErrorKind::Timeout, "handshake timed out")),
        }
    }

    /// Accept a VC on a connection a peer just dialed.
    pub async fn accept(
        mut conn: BoxedConn,
        principal: &Principal,
        local_endpoint: Endpoint,
        config: Config,
    ) -> Result<Vc> {
        let deadline = config.handshake_timeout;
        match timeout(
            deadline,
            handshake_accept(&mut conn, principal, &local_endpoint, &config),
        )
        .await
        {
            Ok(Ok(outcome)) => Ok(Vc::start(conn, outcome)),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(Error::new(ErrorKind::Timeout, "handshake timed out")),
        }
    }

    fn start(conn: BoxedConn, outcome: HandshakeOutcome) -> Vc {
        let (read_half, write_half) = tokio::io::split(conn);
        let (ctrl_tx, ctrl_rx) = mpsc::unbounded_channel();
        let (closed_tx, closed_rx) = watch::channel(false);

        let inner = Arc::new(VcInner {
            vci: DEFAULT_VCI,
            dialed: outcome.dialed,
            version: outcome.version,
            config: outcome.config,
            local_endpoint: outcome.local_endpoint,
            remote_endpoint: Mutex::new(outcome.remote_endpoint),
            pool: IobufPool::default(),
            queue: Bqueue::new(),
            ctrl: ctrl_tx,
            flows: Mutex::new(HashMap::new()),
            // Dialer-opened flows are even, acceptor-opened odd; fid 1 is
            // the reserved shared flow.
            next_fid: AtomicU32::new(if outcome.dialed { 2 } else { 3 }),
            listener: Mutex::new(None),
            status: Mutex::new(Status::Ready),
            closed_tx,
            local_blessings: outcome.local_blessings,
            remote_blessings: outcome.remote_blessings,
            remote_discharges: outcome.remote_discharges,
        });

        debug!(
            vci = inner.vci,
            dialed = inner.dialed,
            version = inner.version,
            "vc ready"
        );

        tokio::spawn(reader_loop(
            inner.clone(),
            read_half,
            outcome.opener,
            closed_rx,
        ));
        tokio::spawn(sender_loop(
            inner.clone(),
            write_half,
            outcome.sealer,
            ctrl_rx,
        ));

        Vc { inner }
    }

    /// Open a fresh flow towards the peer. The flow starts with no send
    /// credit; its first write waits for the peer's initial grant.
    pub fn connect(&self) -> Result<Flow> {
        let inner = &self.inner;
        if let Status::Closed(err) = &*inner.status.lock() {
            return Err(Error::new(
                ErrorKind::VcClosed,
                format!("vc closed: {}", err.message()),
            ));
        }

        let fid = inner.next_fid.fetch_add(2, Ordering::Relaxed);
        let flow = inner.new_flow(fid, 0);
        inner.flows.lock().insert(fid, flow.clone());

        let _ = inner.ctrl.send(SenderCmd::Send(Message::OpenFlow {
            vci: inner.vci,
            fid,
            initial_credit: inner.config.default_flow_credit,
        }));

        // Re-check: a close racing with us must not leave a live flow.
        if let Status::Closed(err) = &*inner.status.lock() {
            inner.flows.lock().remove(&fid);
            flow.fail(err.clone(), true);
            return Err(Error::new(
                ErrorKind::VcClosed,
                format!("vc closed: {}", err.message()),
            ));
        }
        trace!(vci = inner.vci, fid, "flow opened");
        Ok(flow)
    }

    /// Create the VC's listener. May be called at most once.
    pub fn listen(&self) -> Result<Listener> {
        let inner = &self.inner;
        if let Status::Closed(err) = &*inner.status.lock() {
            return Err(Error::new(
                ErrorKind::VcClosed,
                format!("vc closed: {}", err.message()),
            ));
        }
        let mut slot = inner.listener.lock();
        if slot.is_some() {
            return Err(Error::new(
                ErrorKind::FlowClosed,
                "listen already called on this vc",
            ));
        }
        let (listener, shared) = Listener::new();
        *slot = Some(shared);
        Ok(listener)
    }

    /// Tear down every flow with `reason` and notify the peer. Idempotent.
    pub fn close(&self, reason: &str) {
        self.inner
            .close_with(Error::new(ErrorKind::VcClosed, reason), true, true);
    }

    pub fn is_closed(&self) -> bool {
        matches!(&*self.inner.status.lock(), Status::Closed(_))
    }

    /// The close reason, once closed.
    pub fn close_reason(&self) -> Option<Error> {
        match &*self.inner.status.lock() {
            Status::Closed(err) => Some(err.clone()),
            Status::Ready => None,
        }
    }

    /// Wait for the VC to close and return the reason.
    pub async fn closed(&self) -> Error {
        let mut rx = self.inner.closed_tx.subscribe();
        loop {
            if let Some(err) = self.close_reason() {
                return err;
            }
            if rx.changed().await.is_err() {
                // Sender kept alive by inner; unreachable in practice.
                return Error::new(ErrorKind::VcClosed, "vc closed");
            }
        }
    }

    pub fn vci(&self) -> u32 {
        self.inner.vci
    }

    pub fn is_dialed(&self) -> bool {
        self.inner.dialed
    }

    /// The negotiated protocol version.
    pub fn version(&self) -> Version {
        self.inner.version
    }

    pub fn local_endpoint(&self) -> Endpoint {
        self.inner.local_endpoint.clone()
    }

    /// The endpoint the peer claimed during the handshake.
    pub fn remote_endpoint(&self) -> Option<Endpoint> {
        self.inner.remote_endpoint.lock().clone()
    }

    pub fn local_blessings(&self) -> &Blessings {
        &self.inner.local_blessings
    }

    pub fn remote_blessings(&self) -> &Blessings {
        &self.inner.remote_blessings
    }

    pub fn remote_discharges(&self) -> &[Discharge] {
        &self.inner.remote_discharges
    }
}

impl std::fmt::Debug for Vc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vc")
            .field("vci", &self.inner.vci)
            .field("dialed", &self.inner.dialed)
            .field("version", &self.inner.version)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl VcInner {
    fn new_flow(&self, fid: u32, initial_credit: u32) -> Flow {
        let cap = (self.config.default_flow_credit as usize).max(self.config.drr_quantum * 4);
        Flow::new(FlowParams {
            fid,
            vci: self.vci,
            writer: self.queue.writer(fid, self.config.drr_quantum, cap),
            pool: self.pool.clone(),
            ctrl: self.ctrl.clone(),
            window: self.config.default_flow_credit,
            initial_credit,
            local_blessings: self.local_blessings.clone(),
            remote_blessings: self.remote_blessings.clone(),
            remote_discharges: self.remote_discharges.clone(),
        })
    }

    /// Move to `Closed` and tear everything down. An orderly close lets
    /// flow reads drain to end-of-stream; otherwise `err` surfaces on
    /// reads too. `notify_peer` controls whether a `CloseVc` goes out.
    fn close_with(&self, err: Error, orderly: bool, notify_peer: bool) {
        {
            let mut status = self.status.lock();
            if matches!(*status, Status::Closed(_)) {
                return;
            }
            *status = Status::Closed(err.clone());
        }
        debug!(vci = self.vci, reason = err.message(), "vc closing");

        let listener = self.listener.lock().clone();
        if let Some(shared) = listener {
            shared.fail(err.clone());
        }

        let flows: Vec<Flow> = self.flows.lock().drain().map(|(_, f)| f).collect();
        for flow in flows {
            flow.fail(err.clone(), orderly);
        }

        if notify_peer {
            let _ = self.ctrl.send(SenderCmd::Send(Message::CloseVc {
                vci: self.vci,
                reason: err.message().to_string(),
            }));
        }
        let _ = self.ctrl.send(SenderCmd::Shutdown);
        self.queue.close();
        let _ = self.closed_tx.send(true);
    }
}

// ---------------------------------------------------------------------------
// Handshake
// ---------------------------------------------------------------------------

async fn read_handshake_frame(conn: &mut BoxedConn, expect: &str) -> Result<Message> {
    match RawFrame::read_from(conn).await? {
        Some(frame) => match frame.decode()? {
            Message::CloseVc { reason, .. } => Err(Error::new(
                ErrorKind::VcClosed,
                format!("closed by peer: {}", reason),
            )),
            msg => Ok(msg),
        },
        None => Err(Error::new(
            ErrorKind::HandshakeFailure,
            format!("connection closed while waiting for {}", expect),
        )),
    }
}

async fn read_setup(conn: &mut BoxedConn) -> Result<(Setup, Vec<u8>)> {
    match RawFrame::read_from(conn).await? {
        Some(frame) => {
            let body = frame.body.to_vec();
            match frame.decode()? {
                Message::Setup(setup) => Ok((setup, body)),
                Message::CloseVc { reason, .. } => Err(Error::new(
                    ErrorKind::VcClosed,
                    format!("closed by peer: {}", reason),
                )),
                other => Err(Error::new(
                    ErrorKind::HandshakeFailure,
                    format!("expected Setup, got message tag {}", other.tag()),
                )),
            }
        }
        None => Err(Error::new(
            ErrorKind::HandshakeFailure,
            "connection closed while waiting for Setup",
        )),
    }
}

async fn read_setup_vc(conn: &mut BoxedConn) -> Result<SetupVc> {
    match read_handshake_frame(conn, "SetupVc").await? {
        Message::SetupVc(vc) => Ok(vc),
        other => Err(Error::new(
            ErrorKind::HandshakeFailure,
            format!("expected SetupVc, got message tag {}", other.tag()),
        )),
    }
}

fn local_setup(config: &Config) -> (Message, Option<KeyExchange>) {
    let mut options = Vec::new();
    let kx = match config.security {
        SecurityLevel::Confidential => {
            let kx = KeyExchange::new();
            options.push(SetupOption::DhPublicKey(kx.public_key().to_vec()));
            options.push(SetupOption::Nonce(kx.nonce().to_vec()));
            Some(kx)
        }
        SecurityLevel::None => None,
    };
    (
        Message::Setup(Setup {
            versions: config.versions,
            options,
        }),
        kx,
    )
}

fn derive_ciphers(
    kx: KeyExchange,
    peer: &Setup,
    dialer_nonce: &[u8],
    acceptor_nonce: &[u8],
    version: Version,
    dialed: bool,
) -> Result<(Box<dyn Sealer>, Box<dyn Opener>)> {
    let peer_key = peer.dh_public_key().ok_or_else(|| {
        Error::new(
            ErrorKind::HandshakeFailure,
            "peer offered no session key; confidentiality unavailable",
        )
    })?;
    let (tx, rx) = kx.derive(peer_key, dialer_nonce, acceptor_nonce, version, dialed)?;
    Ok(session_pair(tx, rx))
}

fn blessed_setup_vc_options(principal: &Principal, binding: &[u8; 32]) -> Vec<SetupVcOption> {
    vec![
        SetupVcOption::Blessings(principal.blessings().encode()),
        SetupVcOption::Discharges(encode_discharges(&[])),
        SetupVcOption::ChannelBinding(principal.sign_binding(binding).to_vec()),
    ]
}

/// Validate the peer's `SetupVc`: decode blessings, check the channel
/// binding signature against the blessing key, and collect the names the
/// local principal recognizes.
fn verify_peer_setup_vc(
    principal: &Principal,
    setup_vc: &SetupVc,
    binding: &[u8; 32],
) -> Result<(Blessings, Vec<Discharge>, Vec<String>)> {
    let raw = setup_vc.blessings().ok_or_else(|| {
        Error::new(ErrorKind::HandshakeFailure, "peer presented no blessings")
    })?;
    let blessings = Blessings::decode(raw)?;
    let key = blessings
        .public_key()
        .ok_or_else(|| Error::new(ErrorKind::HandshakeFailure, "peer blessing set is empty"))?;
    let sig = setup_vc.channel_binding().ok_or_else(|| {
        Error::new(
            ErrorKind::HandshakeFailure,
            "peer sent no channel binding signature",
        )
    })?;
    if !verify_binding(&key, binding, sig) {
        return Err(Error::new(
            ErrorKind::HandshakeFailure,
            "channel binding signature does not verify",
        ));
    }
    let names = principal.verify_peer(&blessings);
    let discharges = match setup_vc.discharges() {
        Some(raw) => decode_discharges(raw)?,
        None => Vec::new(),
    };
    Ok((blessings, discharges, names))
}

async fn handshake_dial(
    conn: &mut BoxedConn,
    principal: &Principal,
    local_endpoint: &Endpoint,
    remote_endpoint: &Endpoint,
    opts: &DialOpts,
) -> Result<HandshakeOutcome> {
    let config = &opts.config;
    let (my_setup, kx) = local_setup(config);
    let my_body = my_setup.encode_body().freeze().to_vec();
    if let Err(write_err) = my_setup.write_to(conn).await {
        // The peer may have already refused and closed (a proxy with no
        // matching route does); surface its stated reason if one is
        // waiting in the receive buffer.
        return Err(match read_setup(conn).await {
            Err(peer_err) if peer_err.kind() == ErrorKind::VcClosed => peer_err,
            _ => write_err,
        });
    }

    let (peer_setup, peer_body) = read_setup(conn).await?;
    let version = config.versions.common(&peer_setup.versions)?;
    let binding = channel_binding(&my_body, &peer_body);

    let (sealer, opener, options, local_blessings) = match kx {
        Some(kx) => {
            let my_nonce = kx.nonce();
            let peer_nonce = peer_setup.nonce().ok_or_else(|| {
                Error::new(ErrorKind::HandshakeFailure, "peer offered no setup nonce")
            })?;
            let peer_nonce = peer_nonce.to_vec();
            let (sealer, opener) =
                derive_ciphers(kx, &peer_setup, &my_nonce, &peer_nonce, version, true)?;
            (
                sealer,
                opener,
                blessed_setup_vc_options(principal, &binding),
                principal.blessings().clone(),
            )
        }
        None => {
            let (sealer, opener) = null_pair();
            (sealer, opener, Vec::new(), Blessings::none())
        }
    };

    Message::SetupVc(SetupVc {
        local_endpoint: local_endpoint.to_string(),
        remote_endpoint: remote_endpoint.to_string(),
        counters: Vec::new(),
        options,
    })
    .write_to(conn)
    .await?;

    let peer_vc = read_setup_vc(conn).await?;
    let (remote_blessings, remote_discharges) = match config.security {
        SecurityLevel::Confidential => {
            let (blessings, discharges, names) =
                verify_peer_setup_vc(principal, &peer_vc, &binding)?;
            if let Some(authorizer) = &opts.authorizer {
                authorizer.authorize(&names)?;
            }
            (blessings, discharges)
        }
        SecurityLevel::None => (Blessings::none(), Vec::new()),
    };

    let claimed: Option<Endpoint> = peer_vc.local_endpoint.parse().ok();
    Ok(HandshakeOutcome {
        dialed: true,
        version,
        config: config.clone(),
        sealer,
        opener,
        local_endpoint: local_endpoint.clone(),
        remote_endpoint: claimed.or_else(|| Some(remote_endpoint.clone())),
        local_blessings,
        remote_blessings,
        remote_discharges,
    })
}

async fn handshake_accept(
    conn: &mut BoxedConn,
    principal: &Principal,
    local_endpoint: &Endpoint,
    config: &Config,
) -> Result<HandshakeOutcome> {
    let (peer_setup, peer_body) = read_setup(conn).await?;

    // Send our Setup before judging versions so a mismatching dialer
    // still learns our range and can report the mismatch itself.
    let (my_setup, kx) = local_setup(config);
    let my_body = my_setup.encode_body().freeze().to_vec();
    my_setup.write_to(conn).await?;

    let version = config.versions.common(&peer_setup.versions)?;
    let binding = channel_binding(&peer_body, &my_body);

    let (sealer, opener, options, local_blessings) = match kx {
        Some(kx) => {
            let my_nonce = kx.nonce();
            let peer_nonce = peer_setup.nonce().ok_or_else(|| {
                Error::new(ErrorKind::HandshakeFailure, "peer offered no setup nonce")
            })?;
            let peer_nonce = peer_nonce.to_vec();
            let (sealer, opener) =
                derive_ciphers(kx, &peer_setup, &peer_nonce, &my_nonce, version, false)?;
            (
                sealer,
                opener,
                blessed_setup_vc_options(principal, &binding),
                principal.blessings().clone(),
            )
        }
        None => {
            let (sealer, opener) = null_pair();
            (sealer, opener, Vec::new(), Blessings::none())
        }
    };

    // The dialer's SetupVc arrives first; ours answers it.
    let peer_vc = read_setup_vc(conn).await?;
    let (remote_blessings, remote_discharges) = match config.security {
        SecurityLevel::Confidential => {
            let (blessings, discharges, _names) =
                verify_peer_setup_vc(principal, &peer_vc, &binding)?;
            (blessings, discharges)
        }
        SecurityLevel::None => (Blessings::none(), Vec::new()),
    };

    Message::SetupVc(SetupVc {
        local_endpoint: local_endpoint.to_string(),
        remote_endpoint: peer_vc.local_endpoint.clone(),
        counters: Vec::new(),
        options,
    })
    .write_to(conn)
    .await?;

    let claimed: Option<Endpoint> = peer_vc.local_endpoint.parse().ok();
    Ok(HandshakeOutcome {
        dialed: false,
        version,
        config: config.clone(),
        sealer,
        opener,
        local_endpoint: local_endpoint.clone(),
        remote_endpoint: claimed,
        local_blessings,
        remote_blessings,
        remote_discharges,
    })
}

// ---------------------------------------------------------------------------
// Long-running tasks
// ---------------------------------------------------------------------------

async fn reader_loop(
    inner: Arc<VcInner>,
    mut read_half: ReadHalf<BoxedConn>,
    mut opener: Box<dyn Opener>,
    mut closed_rx: watch::Receiver<bool>,
) {
    loop {
        let frame = tokio::select! {
            biased;
            _ = closed_rx.changed() => break,
            frame = RawFrame::read_from(&mut read_half) => frame,
        };
        match frame {
            Ok(Some(frame)) => match handle_frame(&inner, &mut opener, frame).await {
                Ok(ControlFlow::Continue(())) => {}
                Ok(ControlFlow::Break(())) => break,
                Err(err) => {
                    inner.close_with(err, false, true);
                    break;
                }
            },
            Ok(None) => {
                inner.close_with(
                    Error::new(ErrorKind::VcClosed, "peer disconnected"),
                    false,
                    false,
                );
                break;
            }
            Err(err) => {
                inner.close_with(err, false, false);
                break;
            }
        }
    }
}

async fn handle_frame(
    inner: &Arc<VcInner>,
    opener: &mut Box<dyn Opener>,
    frame: RawFrame,
) -> Result<ControlFlow<()>> {
    match frame.decode()? {
        Message::Data {
            vci,
            fid,
            flags,
            payload,
        } => {
            if vci != inner.vci {
                return Ok(ControlFlow::Continue(()));
            }
            // MAC failures are fatal: the peer is treated as compromised
            // for this connection.
            let plaintext = opener.open(&payload)?;
            let flow = inner.flows.lock().get(&fid).cloned();
            let Some(flow) = flow else {
                trace!(vci, fid, "data for unknown flow dropped");
                return Ok(ControlFlow::Continue(()));
            };
            for chunk in plaintext.chunks(inner.pool.block_size().max(1)) {
                let mut block = inner.pool.alloc().await;
                block.put(chunk);
                flow.push_data(block.freeze());
            }
            if flags & DATA_FLAG_CLOSE != 0 {
                flow.push_close();
                inner.flows.lock().remove(&fid);
            }
        }
        Message::OpenFlow {
            vci,
            fid,
            initial_credit,
        } => {
            if vci != inner.vci {
                return Ok(ControlFlow::Continue(()));
            }
            if fid == SHARED_FLOW_FID || inner.flows.lock().contains_key(&fid) {
                return Err(Error::new(
                    ErrorKind::UnrecognizedMessage,
                    format!("open of reserved or duplicate flow id {}", fid),
                ));
            }
            let listener = inner.listener.lock().clone();
            let Some(shared) = listener else {
                return Err(Error::new(
                    ErrorKind::UnrecognizedMessage,
                    format!("flow {} opened on a vc that never listened", fid),
                ));
            };
            if shared.is_closed() {
                // Refuse: a close marker for the never-accepted flow.
                let _ = inner.ctrl.send(SenderCmd::Send(Message::Data {
                    vci: inner.vci,
                    fid,
                    flags: DATA_FLAG_CLOSE,
                    payload: Bytes::new(),
                }));
                return Ok(ControlFlow::Continue(()));
            }

            let flow = inner.new_flow(fid, initial_credit);
            inner.flows.lock().insert(fid, flow.clone());
            // Grant our receive window before the application ever sees
            // the flow, so the opener's first write is not stalled on
            // Accept.
            let _ = inner.ctrl.send(SenderCmd::Send(Message::AddReceiveBuffers {
                counters: vec![Counter {
                    vci: inner.vci,
                    fid,
                    bytes: inner.config.default_flow_credit,
                }],
            }));
            if !shared.deliver(flow.clone()) {
                inner.flows.lock().remove(&fid);
                flow.fail(Error::new(ErrorKind::FlowClosed, "listener closed"), true);
                let _ = inner.ctrl.send(SenderCmd::Send(Message::Data {
                    vci: inner.vci,
                    fid,
                    flags: DATA_FLAG_CLOSE,
                    payload: Bytes::new(),
                }));
            } else {
                trace!(vci, fid, initial_credit, "flow accepted");
            }
        }
        Message::AddReceiveBuffers { counters } => {
            for c in counters {
                if c.vci != inner.vci {
                    continue;
                }
                let flow = inner.flows.lock().get(&c.fid).cloned();
                if let Some(flow) = flow {
                    flow.add_credit(c.bytes);
                }
            }
        }
        Message::CloseVc { reason, .. } => {
            inner.close_with(
                Error::new(ErrorKind::VcClosed, format!("closed by peer: {}", reason)),
                true,
                false,
            );
            return Ok(ControlFlow::Break(()));
        }
        Message::HealthCheck { .. } => {
            // Liveness is signalled by the connection staying readable;
            // probes carry no reply.
        }
        other => {
            return Err(Error::new(
                ErrorKind::UnrecognizedMessage,
                format!("unexpected message tag {} after handshake", other.tag()),
            ));
        }
    }
    Ok(ControlFlow::Continue(()))
}

async fn sender_loop(
    inner: Arc<VcInner>,
    mut write_half: WriteHalf<BoxedConn>,
    mut sealer: Box<dyn Sealer>,
    mut ctrl_rx: mpsc::UnboundedReceiver<SenderCmd>,
) {
    loop {
        tokio::select! {
            biased;
            cmd = ctrl_rx.recv() => match cmd {
                Some(SenderCmd::Send(msg)) => {
                    if let Err(err) = send_sealed(&mut write_half, &mut sealer, msg).await {
                        inner.close_with(err, false, false);
                        break;
                    }
                }
                Some(SenderCmd::Shutdown) | None => break,
            },
            batch = inner.queue.next() => match batch {
                Some(batch) => {
                    let mut plaintext = Vec::with_capacity(batch.payload_len());
                    for slice in &batch.slices {
                        plaintext.extend_from_slice(slice);
                    }
                    let msg = Message::Data {
                        vci: inner.vci,
                        fid: batch.fid,
                        flags: if batch.finished { DATA_FLAG_CLOSE } else { 0 },
                        payload: Bytes::from(plaintext),
                    };
                    if let Err(err) = send_sealed(&mut write_half, &mut sealer, msg).await {
                        inner.close_with(err, false, false);
                        break;
                    }
                }
                None => {
                    // Queue closed by teardown: flush remaining control
                    // messages (CloseVc in particular) and stop.
                    while let Ok(cmd) = ctrl_rx.try_recv() {
                        match cmd {
                            SenderCmd::Send(msg) => {
                                let _ = send_sealed(&mut write_half, &mut sealer, msg).await;
                            }
                            SenderCmd::Shutdown => break,
                        }
                    }
                    break;
                }
            }
        }
    }
    let _ = write_half.shutdown().await;
}

/// Seal `Data` payloads with the session cipher, then write. All other
/// messages pass through unchanged.
async fn send_sealed(
    write_half: &mut WriteHalf<BoxedConn>,
    sealer: &mut Box<dyn Sealer>,
    msg: Message,
) -> Result<()> {
    let msg = match msg {
        Message::Data {
            vci,
            fid,
            flags,
            payload,
        } => Message::Data {
            vci,
            fid,
            flags,
            payload: Bytes::from(sealer.seal(&payload)?),
        },
        other => other,
    };
    msg.write_to(write_half).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::PatternAuthorizer;

    fn pair() -> (BoxedConn, BoxedConn) {
        let (a, b) = tokio::io::duplex(1 << 16);
        (Box::new(a), Box::new(b))
    }

    fn endpoint(name: &str) -> Endpoint {
        Endpoint::new("tcp", format!("{}:0", name), crate::rid::RoutingId::random())
    }

    struct Peers {
        root: Principal,
        client: Principal,
        server: Principal,
    }

    fn blessed_peers() -> Peers {
        let root = Principal::self_blessed("root");
        let mut client = Principal::unblessed();
        client
            .adopt_blessings(root.bless(client.public_key(), "client"))
            .unwrap();
        client.add_root(root.public_key());
        let mut server = Principal::unblessed();
        server
            .adopt_blessings(root.bless(server.public_key(), "server"))
            .unwrap();
        server.add_root(root.public_key());
        Peers {
            root,
            client,
            server,
        }
    }

    async fn dial_accept(
        client_cfg: Config,
        server_cfg: Config,
        authorizer: Option<Arc<dyn ServerAuthorizer>>,
    ) -> (Result<Vc>, Result<Vc>, Peers) {
        let peers = blessed_peers();
        let (conn_c, conn_s) = pair();
        let server_ep = endpoint("server");
        let client_ep = endpoint("client");

        let dial = Vc::dial(
            conn_c,
            &peers.client,
            client_ep,
            server_ep.clone(),
            DialOpts {
                config: client_cfg,
                authorizer,
            },
        );
        let accept = Vc::accept(conn_s, &peers.server, server_ep, server_cfg);
        let (dialed, accepted) = tokio::join!(dial, accept);
        (dialed, accepted, peers)
    }

    #[tokio::test]
    async fn secure_handshake_exchanges_blessings() {
        let (dialed, accepted, peers) =
            dial_accept(Config::default(), Config::default(), None).await;
        let client_vc = dialed.unwrap();
        let server_vc = accepted.unwrap();

        assert_eq!(client_vc.version(), 7);
        assert_eq!(client_vc.remote_blessings().names(), vec!["root/server"]);
        assert_eq!(server_vc.remote_blessings().names(), vec!["root/client"]);
        assert_eq!(
            client_vc.local_blessings().public_key().unwrap(),
            peers.client.public_key()
        );
        let _ = peers.root;
    }

    #[tokio::test]
    async fn insecure_handshake_has_no_blessings() {
        let (dialed, accepted, _) = dial_accept(Config::insecure(), Config::insecure(), None).await;
        let client_vc = dialed.unwrap();
        let server_vc = accepted.unwrap();
        assert!(client_vc.remote_blessings().is_empty());
        assert!(server_vc.remote_blessings().is_empty());
    }

    #[tokio::test]
    async fn version_mismatch_fails_both_sides() {
        let mut client_cfg = Config::default();
        client_cfg.versions = crate::version::VersionRange::new(9, 9);
        let mut server_cfg = Config::default();
        server_cfg.versions = crate::version::VersionRange::new(1, 7);

        let (dialed, accepted, _) = dial_accept(client_cfg, server_cfg, None).await;
        let derr = dialed.unwrap_err();
        assert_eq!(derr.kind(), ErrorKind::VersionMismatch);
        assert!(derr.to_string().contains("version mismatch"));
        assert_eq!(accepted.unwrap_err().kind(), ErrorKind::VersionMismatch);
    }

    #[tokio::test]
    async fn authorizer_rejection_fails_dial() {
        let authorizer: Arc<dyn ServerAuthorizer> = Arc::new(PatternAuthorizer {
            allowed: vec!["root/other".parse().unwrap()],
        });
        let (dialed, _accepted, _) =
            dial_accept(Config::default(), Config::default(), Some(authorizer)).await;
        let err = dialed.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AuthorizationDenied);
        assert!(err.to_string().contains("authorization error"));
    }

    #[tokio::test]
    async fn connect_after_close_reports_reason() {
        let (dialed, accepted, _) = dial_accept(Config::insecure(), Config::insecure(), None).await;
        let client_vc = dialed.unwrap();
        let _server_vc = accepted.unwrap();

        client_vc.close("maintenance window");
        let err = client_vc.connect().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::VcClosed);
        assert!(err.to_string().contains("maintenance window"));
    }

    #[tokio::test]
    async fn listen_twice_is_refused() {
        let (dialed, accepted, _) = dial_accept(Config::insecure(), Config::insecure(), None).await;
        let _client_vc = dialed.unwrap();
        let server_vc = accepted.unwrap();

        let _listener = server_vc.listen().unwrap();
        assert!(server_vc.listen().is_err());
    }

    #[tokio::test]
    async fn echo_over_secure_flow() {
        let (dialed, accepted, _) = dial_accept(Config::default(), Config::default(), None).await;
        let client_vc = dialed.unwrap();
        let server_vc = accepted.unwrap();

        let listener = server_vc.listen().unwrap();
        tokio::spawn(async move {
            let flow = listener.accept().await.unwrap();
            let mut buf = [0u8; 10];
            flow.read_exact(&mut buf).await.unwrap();
            flow.write(&buf).await.unwrap();
        });

        let flow = client_vc.connect().unwrap();
        flow.write(b"HELLO_WRLD").await.unwrap();
        let mut echoed = [0u8; 10];
        flow.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"HELLO_WRLD");
    }

    #[tokio::test]
    async fn open_without_listener_fails_connection() {
        let (dialed, accepted, _) = dial_accept(Config::insecure(), Config::insecure(), None).await;
        let client_vc = dialed.unwrap();
        let server_vc = accepted.unwrap();

        // Server never listens; opening a flow is a protocol violation
        // that fails the whole connection.
        let _flow = client_vc.connect().unwrap();
        let err = server_vc.closed().await;
        assert_eq!(err.kind(), ErrorKind::UnrecognizedMessage);
    }
}
