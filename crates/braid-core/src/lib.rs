//! braid-core: a secure multiplexed stream transport.
//!
//! One reliable byte-pipe becomes many independently flow-controlled,
//! mutually authenticated flows between endpoints named by routing ids.
//! The TCP and WebSocket adaptors live in `braid-transport-tcp` and
//! `braid-transport-websocket`; the routing proxy in `braid-proxy`.

mod bqueue;
mod config;
mod crypto;
mod endpoint;
mod error;
mod flow;
mod iobuf;
mod listener;
mod message;
mod rid;
mod route;
mod security;
mod transport;
mod vc;
mod version;

pub use bqueue::*;
pub use config::*;
pub use crypto::*;
pub use endpoint::*;
pub use error::*;
pub use flow::*;
pub use iobuf::*;
pub use listener::*;
pub use message::*;
pub use rid::*;
pub use route::*;
pub use security::*;
pub use transport::*;
pub use vc::*;
pub use version::*;
