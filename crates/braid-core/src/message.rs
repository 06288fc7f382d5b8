//! Wire message vocabulary and framing.
//!
//! Every message travels as `<1-byte tag><varint length><body>`. Body fields
//! are little-endian; strings are length-prefixed UTF-8; byte strings are
//! varint-length-prefixed. Option lists are `(tag, bytes)` pairs so unknown
//! *option* tags can be skipped, while an unknown *message* tag fails the
//! connection and is not retryable.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, ErrorKind, Result};
use crate::version::VersionRange;

/// Maximum varint length in bytes.
const MAX_VARINT_LEN: usize = 10;

/// Upper bound on a message body. Anything larger is a framing error.
pub const MAX_BODY_LEN: usize = 1 << 20;

/// Credit deltas are bounded to 28 bits.
pub const MAX_CREDIT_DELTA: u32 = (1 << 28) - 1;

/// `Data.flags` bit 0: the sender is closing its side of the flow.
pub const DATA_FLAG_CLOSE: u8 = 0x01;

mod tag {
    pub const SETUP: u8 = 0;
    pub const SETUP_VC: u8 = 1;
    pub const OPEN_FLOW: u8 = 2;
    pub const DATA: u8 = 3;
    pub const ADD_RECEIVE_BUFFERS: u8 = 4;
    pub const CLOSE_VC: u8 = 5;
    pub const HEALTH_CHECK: u8 = 6;
    pub const SETUP_ROUTE: u8 = 7;
    pub const MULTI_PROXY_REQUEST: u8 = 8;
    pub const PROXY_RESPONSE: u8 = 9;
}

/// One `(vci, fid, bytes)` credit triple.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Counter {
    pub vci: u32,
    pub fid: u32,
    pub bytes: u32,
}

/// Options carried in a `Setup` body.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SetupOption {
    /// Naming scope the peer wants to be reached under.
    PeerNaming(String),
    /// X25519 public key for session key agreement.
    DhPublicKey(Vec<u8>),
    /// Fresh per-connection nonce mixed into key derivation.
    Nonce(Vec<u8>),
    /// Unknown option, preserved for forwarding.
    Unknown(u8, Vec<u8>),
}

const SETUP_OPT_PEER_NAMING: u8 = 1;
const SETUP_OPT_DH_PUBKEY: u8 = 2;
const SETUP_OPT_NONCE: u8 = 3;

/// Options carried in a `SetupVc` body.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SetupVcOption {
    /// Encoded blessing chains of the sender.
    Blessings(Vec<u8>),
    /// Encoded discharges accompanying the blessings.
    Discharges(Vec<u8>),
    /// Signature over the channel binding, made with the blessing key.
    ChannelBinding(Vec<u8>),
    Unknown(u8, Vec<u8>),
}

const SETUPVC_OPT_BLESSINGS: u8 = 1;
const SETUPVC_OPT_DISCHARGES: u8 = 2;
const SETUPVC_OPT_CHANNEL_BINDING: u8 = 3;

/// Options carried in a `SetupRoute` body.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RouteOption {
    PeerNaming(String),
    /// Encoded blessing chains of the registering server.
    PeerBlessings(Vec<u8>),
    /// Signature over the registration channel binding.
    ChannelBinding(Vec<u8>),
    Unknown(u8, Vec<u8>),
}

const ROUTE_OPT_PEER_NAMING: u8 = 1;
const ROUTE_OPT_PEER_BLESSINGS: u8 = 2;
const ROUTE_OPT_CHANNEL_BINDING: u8 = 3;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Setup {
    pub versions: VersionRange,
    pub options: Vec<SetupOption>,
}

impl Setup {
    pub fn dh_public_key(&self) -> Option<&[u8]> {
        self.options.iter().find_map(|o| match o {
            SetupOption::DhPublicKey(k) => Some(k.as_slice()),
            _ => None,
        })
    }

    pub fn nonce(&self) -> Option<&[u8]> {
        self.options.iter().find_map(|o| match o {
            SetupOption::Nonce(n) => Some(n.as_slice()),
            _ => None,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SetupVc {
    /// Endpoint string of the sender.
    pub local_endpoint: String,
    /// Endpoint string the sender believes it is talking to; its route
    /// list drives proxy relaying.
    pub remote_endpoint: String,
    pub counters: Vec<Counter>,
    pub options: Vec<SetupVcOption>,
}

impl SetupVc {
    pub fn blessings(&self) -> Option<&[u8]> {
        self.options.iter().find_map(|o| match o {
            SetupVcOption::Blessings(b) => Some(b.as_slice()),
            _ => None,
        })
    }

    pub fn discharges(&self) -> Option<&[u8]> {
        self.options.iter().find_map(|o| match o {
            SetupVcOption::Discharges(d) => Some(d.as_slice()),
            _ => None,
        })
    }

    pub fn channel_binding(&self) -> Option<&[u8]> {
        self.options.iter().find_map(|o| match o {
            SetupVcOption::ChannelBinding(s) => Some(s.as_slice()),
            _ => None,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SetupRoute {
    /// Routing id (hex) the sender registers itself under.
    pub route: String,
    pub options: Vec<RouteOption>,
}

impl SetupRoute {
    pub fn peer_blessings(&self) -> Option<&[u8]> {
        self.options.iter().find_map(|o| match o {
            RouteOption::PeerBlessings(b) => Some(b.as_slice()),
            _ => None,
        })
    }

    pub fn channel_binding(&self) -> Option<&[u8]> {
        self.options.iter().find_map(|o| match o {
            RouteOption::ChannelBinding(s) => Some(s.as_slice()),
            _ => None,
        })
    }
}

/// The complete wire vocabulary.
#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    Setup(Setup),
    SetupVc(SetupVc),
    OpenFlow {
        vci: u32,
        fid: u32,
        initial_credit: u32,
    },
    Data {
        vci: u32,
        fid: u32,
        flags: u8,
        payload: Bytes,
    },
    AddReceiveBuffers {
        counters: Vec<Counter>,
    },
    CloseVc {
        vci: u32,
        reason: String,
    },
    HealthCheck {
        vci: u32,
    },
    SetupRoute(SetupRoute),
    MultiProxyRequest,
    ProxyResponse {
        endpoints: Vec<String>,
    },
}

// ---------------------------------------------------------------------------
// Primitive encoders
// ---------------------------------------------------------------------------

pub(crate) fn put_varint(buf: &mut BytesMut, mut value: u64) {
    loop {
        let byte = (value & 0x7F) as u8;
        value >>= 7;
        if value == 0 {
            buf.put_u8(byte);
            return;
        }
        buf.put_u8(byte | 0x80);
    }
}

pub(crate) fn put_bytes(buf: &mut BytesMut, b: &[u8]) {
    put_varint(buf, b.len() as u64);
    buf.put_slice(b);
}

pub(crate) fn put_string(buf: &mut BytesMut, s: &str) {
    put_bytes(buf, s.as_bytes());
}

fn put_counters(buf: &mut BytesMut, counters: &[Counter]) {
    put_varint(buf, counters.len() as u64);
    for c in counters {
        buf.put_u32_le(c.vci);
        buf.put_u32_le(c.fid);
        buf.put_u32_le(c.bytes);
    }
}

// ---------------------------------------------------------------------------
// Primitive decoders over a Bytes cursor
// ---------------------------------------------------------------------------

pub(crate) fn malformed(what: &str) -> Error {
    Error::new(ErrorKind::UnrecognizedMessage, format!("malformed {}", what))
}

pub(crate) fn get_u8(buf: &mut Bytes, what: &str) -> Result<u8> {
    if buf.remaining() < 1 {
        return Err(malformed(what));
    }
    Ok(buf.get_u8())
}

pub(crate) fn get_u16_le(buf: &mut Bytes, what: &str) -> Result<u16> {
    if buf.remaining() < 2 {
        return Err(malformed(what));
    }
    Ok(buf.get_u16_le())
}

pub(crate) fn get_u32_le(buf: &mut Bytes, what: &str) -> Result<u32> {
    if buf.remaining() < 4 {
        return Err(malformed(what));
    }
    Ok(buf.get_u32_le())
}

pub(crate) fn get_varint(buf: &mut Bytes, what: &str) -> Result<u64> {
    let mut value: u64 = 0;
    let mut shift: u32 = 0;
    for _ in 0..MAX_VARINT_LEN {
        let byte = get_u8(buf, what)?;
        value |= ((byte & 0x7F) as u64) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
    }
    Err(malformed(what))
}

pub(crate) fn get_bytes(buf: &mut Bytes, what: &str) -> Result<Bytes> {
    let len = get_varint(buf, what)? as usize;
    if buf.remaining() < len {
        return Err(malformed(what));
    }
    Ok(buf.split_to(len))
}

pub(crate) fn get_string(buf: &mut Bytes, what: &str) -> Result<String> {
    let raw = get_bytes(buf, what)?;
    String::from_utf8(raw.to_vec()).map_err(|_| malformed(what))
}

fn get_counters(buf: &mut Bytes) -> Result<Vec<Counter>> {
    let n = get_varint(buf, "counter list")? as usize;
    if n > MAX_BODY_LEN / 12 {
        return Err(malformed("counter list"));
    }
    let mut counters = Vec::with_capacity(n);
    for _ in 0..n {
        let c = Counter {
            vci: get_u32_le(buf, "counter")?,
            fid: get_u32_le(buf, "counter")?,
            bytes: get_u32_le(buf, "counter")?,
        };
        if c.bytes > MAX_CREDIT_DELTA {
            return Err(Error::new(
                ErrorKind::UnrecognizedMessage,
                format!("credit delta {} exceeds 28-bit bound", c.bytes),
            ));
        }
        counters.push(c);
    }
    Ok(counters)
}

fn put_options<T>(buf: &mut BytesMut, options: &[T], encode: impl Fn(&T) -> (u8, Vec<u8>)) {
    put_varint(buf, options.len() as u64);
    for opt in options {
        let (tag, body) = encode(opt);
        buf.put_u8(tag);
        put_bytes(buf, &body);
    }
}

fn get_options<T>(buf: &mut Bytes, decode: impl Fn(u8, Bytes) -> Result<T>) -> Result<Vec<T>> {
    let n = get_varint(buf, "option list")? as usize;
    if n > 64 {
        return Err(malformed("option list"));
    }
    let mut options = Vec::with_capacity(n);
    for _ in 0..n {
        let tag = get_u8(buf, "option tag")?;
        let body = get_bytes(buf, "option body")?;
        options.push(decode(tag, body)?);
    }
    Ok(options)
}

// ---------------------------------------------------------------------------
// Frames
// ---------------------------------------------------------------------------

/// A framed message as read off the wire: the tag byte plus the raw body.
///
/// The proxy forwards these verbatim; the VC decodes them into [`Message`]s.
#[derive(Clone, Debug, PartialEq)]
pub struct RawFrame {
    pub tag: u8,
    pub body: Bytes,
}

impl RawFrame {
    /// Read one frame. Returns `None` on a clean EOF before the tag byte;
    /// an EOF mid-frame is a framing error.
    pub async fn read_from<R: AsyncRead + Unpin>(r: &mut R) -> Result<Option<RawFrame>> {
        let mut tag = [0u8; 1];
        match r.read_exact(&mut tag).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        let len = read_varint(r).await? as usize;
        if len > MAX_BODY_LEN {
            return Err(Error::new(
                ErrorKind::UnrecognizedMessage,
                format!("frame body of {} bytes exceeds limit", len),
            ));
        }

        let mut body = vec![0u8; len];
        r.read_exact(&mut body).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                malformed("frame: stream ended mid-body")
            } else {
                e.into()
            }
        })?;
        Ok(Some(RawFrame {
            tag: tag[0],
            body: Bytes::from(body),
        }))
    }

    /// The full wire form: tag, varint length, body.
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(1 + MAX_VARINT_LEN + self.body.len());
        buf.put_u8(self.tag);
        put_varint(&mut buf, self.body.len() as u64);
        buf.put_slice(&self.body);
        buf
    }

    pub async fn write_to<W: AsyncWrite + Unpin>(&self, w: &mut W) -> Result<()> {
        w.write_all(&self.encode()).await?;
        Ok(())
    }

    /// Decode the body according to the tag.
    pub fn decode(self) -> Result<Message> {
        Message::decode(self.tag, self.body)
    }
}

/// Read a varint length prefix. EOF mid-varint is a framing error.
async fn read_varint<R: AsyncRead + Unpin>(r: &mut R) -> Result<u64> {
    let mut value: u64 = 0;
    let mut shift: u32 = 0;
    for _ in 0..MAX_VARINT_LEN {
        let mut byte = [0u8; 1];
        r.read_exact(&mut byte).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                malformed("frame: stream ended mid-length")
            } else {
                Error::from(e)
            }
        })?;
        value |= ((byte[0] & 0x7F) as u64) << shift;
        if byte[0] & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
    }
    Err(malformed("frame length: varint exceeded 10 bytes"))
}

impl Message {
    /// Encode to the framed wire form.
    pub fn encode(&self) -> BytesMut {
        RawFrame {
            tag: self.tag(),
            body: self.encode_body().freeze(),
        }
        .encode()
    }

    pub async fn write_to<W: AsyncWrite + Unpin>(&self, w: &mut W) -> Result<()> {
        w.write_all(&self.encode()).await?;
        Ok(())
    }

    /// Read and decode one message. `None` on clean EOF.
    pub async fn read_from<R: AsyncRead + Unpin>(r: &mut R) -> Result<Option<Message>> {
        match RawFrame::read_from(r).await? {
            Some(frame) => Ok(Some(frame.decode()?)),
            None => Ok(None),
        }
    }

    pub fn tag(&self) -> u8 {
        match self {
            Message::Setup(_) => tag::SETUP,
            Message::SetupVc(_) => tag::SETUP_VC,
            Message::OpenFlow { .. } => tag::OPEN_FLOW,
            Message::Data { .. } => tag::DATA,
            Message::AddReceiveBuffers { .. } => tag::ADD_RECEIVE_BUFFERS,
            Message::CloseVc { .. } => tag::CLOSE_VC,
            Message::HealthCheck { .. } => tag::HEALTH_CHECK,
            Message::SetupRoute(_) => tag::SETUP_ROUTE,
            Message::MultiProxyRequest => tag::MULTI_PROXY_REQUEST,
            Message::ProxyResponse { .. } => tag::PROXY_RESPONSE,
        }
    }

    /// Encode just the body (no tag, no length prefix).
    pub fn encode_body(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        match self {
            Message::Setup(s) => {
                buf.put_u16_le(s.versions.min);
                buf.put_u16_le(s.versions.max);
                put_options(&mut buf, &s.options, |o| match o {
                    SetupOption::PeerNaming(s) => (SETUP_OPT_PEER_NAMING, s.as_bytes().to_vec()),
                    SetupOption::DhPublicKey(k) => (SETUP_OPT_DH_PUBKEY, k.clone()),
                    SetupOption::Nonce(n) => (SETUP_OPT_NONCE, n.clone()),
                    SetupOption::Unknown(t, b) => (*t, b.clone()),
                });
            }
            Message::SetupVc(s) => {
                put_string(&mut buf, &s.local_endpoint);
                put_string(&mut buf, &s.remote_endpoint);
                put_counters(&mut buf, &s.counters);
                put_options(&mut buf, &s.options, |o| match o {
                    SetupVcOption::Blessings(b) => (SETUPVC_OPT_BLESSINGS, b.clone()),
                    SetupVcOption::Discharges(d) => (SETUPVC_OPT_DISCHARGES, d.clone()),
                    SetupVcOption::ChannelBinding(s) => (SETUPVC_OPT_CHANNEL_BINDING, s.clone()),
                    SetupVcOption::Unknown(t, b) => (*t, b.clone()),
                });
            }
            Message::OpenFlow {
                vci,
                fid,
                initial_credit,
            } => {
                buf.put_u32_le(*vci);
                buf.put_u32_le(*fid);
                buf.put_u32_le(*initial_credit);
            }
            Message::Data {
                vci,
                fid,
                flags,
                payload,
            } => {
                buf.put_u32_le(*vci);
                buf.put_u32_le(*fid);
                buf.put_u8(*flags);
                buf.put_slice(payload);
            }
            Message::AddReceiveBuffers { counters } => {
                put_counters(&mut buf, counters);
            }
            Message::CloseVc { vci, reason } => {
                buf.put_u32_le(*vci);
                put_string(&mut buf, reason);
            }
            Message::HealthCheck { vci } => {
                buf.put_u32_le(*vci);
            }
            Message::SetupRoute(s) => {
                put_string(&mut buf, &s.route);
                put_options(&mut buf, &s.options, |o| match o {
                    RouteOption::PeerNaming(s) => (ROUTE_OPT_PEER_NAMING, s.as_bytes().to_vec()),
                    RouteOption::PeerBlessings(b) => (ROUTE_OPT_PEER_BLESSINGS, b.clone()),
                    RouteOption::ChannelBinding(s) => (ROUTE_OPT_CHANNEL_BINDING, s.clone()),
                    RouteOption::Unknown(t, b) => (*t, b.clone()),
                });
            }
            Message::MultiProxyRequest => {}
            Message::ProxyResponse { endpoints } => {
                put_varint(&mut buf, endpoints.len() as u64);
                for ep in endpoints {
                    put_string(&mut buf, ep);
                }
            }
        }
        buf
    }

    /// Decode a message body. Unknown tags are fatal for the connection.
    pub fn decode(tag_byte: u8, mut body: Bytes) -> Result<Message> {
        let msg = match tag_byte {
            tag::SETUP => {
                let min = get_u16_le(&mut body, "Setup.versions")?;
                let max = get_u16_le(&mut body, "Setup.versions")?;
                let options = get_options(&mut body, |t, b| {
                    Ok(match t {
                        SETUP_OPT_PEER_NAMING => SetupOption::PeerNaming(
                            String::from_utf8(b.to_vec())
                                .map_err(|_| malformed("Setup.peer-naming"))?,
                        ),
                        SETUP_OPT_DH_PUBKEY => SetupOption::DhPublicKey(b.to_vec()),
                        SETUP_OPT_NONCE => SetupOption::Nonce(b.to_vec()),
                        _ => SetupOption::Unknown(t, b.to_vec()),
                    })
                })?;
                Message::Setup(Setup {
                    versions: VersionRange::new(min, max),
                    options,
                })
            }
            tag::SETUP_VC => {
                let local_endpoint = get_string(&mut body, "SetupVc.local-endpoint")?;
                let remote_endpoint = get_string(&mut body, "SetupVc.remote-endpoint")?;
                let counters = get_counters(&mut body)?;
                let options = get_options(&mut body, |t, b| {
                    Ok(match t {
                        SETUPVC_OPT_BLESSINGS => SetupVcOption::Blessings(b.to_vec()),
                        SETUPVC_OPT_DISCHARGES => SetupVcOption::Discharges(b.to_vec()),
                        SETUPVC_OPT_CHANNEL_BINDING => SetupVcOption::ChannelBinding(b.to_vec()),
                        _ => SetupVcOption::Unknown(t, b.to_vec()),
                    })
                })?;
                Message::SetupVc(SetupVc {
                    local_endpoint,
                    remote_endpoint,
                    counters,
                    options,
                })
            }
            tag::OPEN_FLOW => Message::OpenFlow {
                vci: get_u32_le(&mut body, "OpenFlow.vci")?,
                fid: get_u32_le(&mut body, "OpenFlow.fid")?,
                initial_credit: get_u32_le(&mut body, "OpenFlow.initial-credit")?,
            },
            tag::DATA => {
                let vci = get_u32_le(&mut body, "Data.vci")?;
                let fid = get_u32_le(&mut body, "Data.fid")?;
                let flags = get_u8(&mut body, "Data.flags")?;
                Message::Data {
                    vci,
                    fid,
                    flags,
                    payload: body,
                }
            }
            tag::ADD_RECEIVE_BUFFERS => Message::AddReceiveBuffers {
                counters: get_counters(&mut body)?,
            },
            tag::CLOSE_VC => Message::CloseVc {
                vci: get_u32_le(&mut body, "CloseVc.vci")?,
                reason: get_string(&mut body, "CloseVc.reason")?,
            },
            tag::HEALTH_CHECK => Message::HealthCheck {
                vci: get_u32_le(&mut body, "HealthCheck.vci")?,
            },
            tag::SETUP_ROUTE => {
                let route = get_string(&mut body, "SetupRoute.route")?;
                let options = get_options(&mut body, |t, b| {
                    Ok(match t {
                        ROUTE_OPT_PEER_NAMING => RouteOption::PeerNaming(
                            String::from_utf8(b.to_vec())
                                .map_err(|_| malformed("SetupRoute.peer-naming"))?,
                        ),
                        ROUTE_OPT_PEER_BLESSINGS => RouteOption::PeerBlessings(b.to_vec()),
                        ROUTE_OPT_CHANNEL_BINDING => RouteOption::ChannelBinding(b.to_vec()),
                        _ => RouteOption::Unknown(t, b.to_vec()),
                    })
                })?;
                Message::SetupRoute(SetupRoute { route, options })
            }
            tag::MULTI_PROXY_REQUEST => Message::MultiProxyRequest,
            tag::PROXY_RESPONSE => {
                let n = get_varint(&mut body, "ProxyResponse.endpoints")? as usize;
                if n > 64 {
                    return Err(malformed("ProxyResponse.endpoints"));
                }
                let mut endpoints = Vec::with_capacity(n);
                for _ in 0..n {
                    endpoints.push(get_string(&mut body, "ProxyResponse.endpoint")?);
                }
                Message::ProxyResponse { endpoints }
            }
            other => {
                return Err(Error::new(
                    ErrorKind::UnrecognizedMessage,
                    format!("unknown message tag {}", other),
                ))
            }
        };
        Ok(msg)
    }
}
