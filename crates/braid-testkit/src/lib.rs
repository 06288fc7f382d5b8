//! Shared fixtures for braid tests: blessed principal triples, in-memory
//! connections and listeners, and echo acceptors.

use std::sync::Arc;

use futures_util::FutureExt;
use rand::RngCore;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use braid_core::{BoxedConn, ConnListener, Error, ErrorKind, Flow, Principal, Vc};

/// Install a fmt subscriber honoring `RUST_LOG`; safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// A root principal plus a client and a server it has blessed, each
/// trusting the root.
pub struct TestPrincipals {
    pub root: Principal,
    pub client: Principal,
    pub server: Principal,
}

/// `root` blesses `client` as `root/client` and `server` as `root/server`.
pub fn principals() -> TestPrincipals {
    let root = Principal::self_blessed("root");

    let mut client = Principal::unblessed();
    client
        .adopt_blessings(root.bless(client.public_key(), "client"))
        .expect("blessing minted for client key");
    client.add_root(root.public_key());

    let mut server = Principal::unblessed();
    server
        .adopt_blessings(root.bless(server.public_key(), "server"))
        .expect("blessing minted for server key");
    server.add_root(root.public_key());

    TestPrincipals {
        root,
        client,
        server,
    }
}

/// An in-memory connection pair, like a loopback TCP link.
pub fn conn_pair() -> (BoxedConn, BoxedConn) {
    let (a, b) = tokio::io::duplex(1 << 16);
    (Box::new(a), Box::new(b))
}

/// An in-memory `ConnListener`: connections pushed into the returned
/// sender come out of `accept`.
pub fn mem_listener(address: &str) -> (ConnListener, mpsc::UnboundedSender<BoxedConn>) {
    let (tx, rx) = mpsc::unbounded_channel::<BoxedConn>();
    let rx = Arc::new(tokio::sync::Mutex::new(rx));
    let listener = ConnListener::new(address, move || {
        let rx = rx.clone();
        async move {
            rx.lock().await.recv().await.ok_or_else(|| {
                Error::new(ErrorKind::TransientIo, "in-memory listener closed")
            })
        }
        .boxed()
    });
    (listener, tx)
}

/// Random payload bytes for data-integrity tests.
pub fn random_bytes(len: usize) -> Vec<u8> {
    let mut data = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut data);
    data
}

/// Echo every byte of one flow back to its writer until end of stream.
pub async fn echo_flow(flow: Flow) {
    let mut buf = vec![0u8; 8192];
    loop {
        match flow.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if flow.write(&buf[..n]).await.is_err() {
                    break;
                }
            }
        }
    }
    flow.close();
}

/// Listen on `vc` and echo every accepted flow until the VC closes.
pub fn spawn_echo_acceptor(vc: &Vc) -> JoinHandle<()> {
    let listener = vc.listen().expect("echo acceptor needs the vc listener");
    tokio::spawn(async move {
        while let Ok(flow) = listener.accept().await {
            tokio::spawn(echo_flow(flow));
        }
    })
}
