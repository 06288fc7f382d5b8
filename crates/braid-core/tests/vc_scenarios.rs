//! End-to-end scenarios for VCs over in-memory connections.
//!
//! These exercise the full stack: handshake, session encryption, flow
//! multiplexing, credit-based flow control and teardown.

use std::sync::Arc;
use std::time::Duration;

use braid_core::{
    Config, DialOpts, Endpoint, Error, ErrorKind, RoutingId, ServerAuthorizer, Vc, VersionRange,
};
use braid_testkit::{conn_pair, init_tracing, principals, random_bytes, spawn_echo_acceptor};

fn endpoint(name: &str) -> Endpoint {
    Endpoint::new("tcp", format!("{}:0", name), RoutingId::random())
}

/// Dial and accept over an in-memory pair, echoing on the server side.
async fn connected(
    client_cfg: Config,
    server_cfg: Config,
    authorizer: Option<Arc<dyn ServerAuthorizer>>,
) -> (Result<Vc, Error>, Result<Vc, Error>) {
    let peers = principals();
    let (conn_c, conn_s) = conn_pair();
    let server_ep = endpoint("server");

    let dial = Vc::dial(
        conn_c,
        &peers.client,
        endpoint("client"),
        server_ep.clone(),
        DialOpts {
            config: client_cfg,
            authorizer,
        },
    );
    let accept = Vc::accept(conn_s, &peers.server, server_ep, server_cfg);
    tokio::join!(dial, accept)
}

#[tokio::test]
async fn insecure_echo() {
    init_tracing();
    let (dialed, accepted) = connected(Config::insecure(), Config::insecure(), None).await;
    let client_vc = dialed.unwrap();
    let server_vc = accepted.unwrap();
    spawn_echo_acceptor(&server_vc);

    let flow = client_vc.connect().unwrap();
    flow.write(b"HELLO_WRLD").await.unwrap();
    let mut echoed = [0u8; 10];
    flow.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"HELLO_WRLD");

    // No credentials are exchanged in plaintext mode.
    assert!(flow.remote_blessings().is_empty());
    assert!(flow.remote_blessings().names().is_empty());
}

#[tokio::test]
async fn secure_handshake_exposes_peer_blessings() {
    init_tracing();
    let peers = principals();
    let (conn_c, conn_s) = conn_pair();
    let server_ep = endpoint("server");

    let (dialed, accepted) = tokio::join!(
        Vc::dial(
            conn_c,
            &peers.client,
            endpoint("client"),
            server_ep.clone(),
            DialOpts::default(),
        ),
        Vc::accept(conn_s, &peers.server, server_ep, Config::default()),
    );
    let client_vc = dialed.unwrap();
    let server_vc = accepted.unwrap();
    spawn_echo_acceptor(&server_vc);

    let flow = client_vc.connect().unwrap();
    assert_eq!(
        flow.remote_blessings().names(),
        peers.server.blessings().names()
    );
    assert_eq!(
        flow.local_blessings().public_key().unwrap(),
        peers.client.public_key()
    );
}

#[tokio::test]
async fn authorization_denial_creates_no_flow() {
    init_tracing();
    let authorizer: Arc<dyn ServerAuthorizer> =
        Arc::new(|_names: &[String]| -> braid_core::Result<()> {
            Err(Error::new(
                ErrorKind::AuthorizationDenied,
                "authorization error: policy says no",
            ))
        });
    let (dialed, _accepted) =
        connected(Config::default(), Config::default(), Some(authorizer)).await;
    let err = dialed.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AuthorizationDenied);
    assert!(err.to_string().contains("authorization error"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn ten_concurrent_flows_echo_correctly() {
    init_tracing();
    let (dialed, accepted) = connected(Config::default(), Config::default(), None).await;
    let client_vc = dialed.unwrap();
    let server_vc = accepted.unwrap();
    spawn_echo_acceptor(&server_vc);

    let mut tasks = Vec::new();
    for _ in 0..10 {
        let flow = client_vc.connect().unwrap();
        tasks.push(tokio::spawn(async move {
            let data = random_bytes(160 * 1024);
            let writer = {
                let flow = flow.clone();
                let data = data.clone();
                tokio::spawn(async move { flow.write(&data).await })
            };
            let mut echoed = vec![0u8; data.len()];
            flow.read_exact(&mut echoed).await.unwrap();
            writer.await.unwrap().unwrap();
            assert_eq!(echoed, data);
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }
}

#[tokio::test]
async fn flow_control_bounds_outstanding_bytes() {
    init_tracing();
    let mut cfg = Config::insecure();
    cfg.default_flow_credit = 4096;
    let (dialed, accepted) = connected(cfg.clone(), cfg, None).await;
    let client_vc = dialed.unwrap();
    let server_vc = accepted.unwrap();

    let listener = server_vc.listen().unwrap();
    let total: usize = 64 * 1024;

    let reader = tokio::spawn(async move {
        let flow = listener.accept().await.unwrap();
        let mut received = Vec::with_capacity(total);
        let mut buf = [0u8; 1024];
        loop {
            // The receiver's unread backlog can never exceed the window
            // it granted.
            assert!(flow.queued_bytes() <= 4096, "window exceeded");
            let n = flow.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            received.extend_from_slice(&buf[..n]);
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        received
    });

    let data = random_bytes(total);
    let flow = client_vc.connect().unwrap();
    flow.write(&data).await.unwrap();
    flow.close();

    let received = reader.await.unwrap();
    assert_eq!(received, data);
}

#[tokio::test]
async fn post_close_rejects_connect_and_accept() {
    init_tracing();
    let (dialed, accepted) = connected(Config::insecure(), Config::insecure(), None).await;
    let client_vc = dialed.unwrap();
    let server_vc = accepted.unwrap();

    let listener = server_vc.listen().unwrap();
    server_vc.close("scheduled maintenance");

    let err = server_vc.connect().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::VcClosed);
    assert!(err.to_string().contains("scheduled maintenance"));

    let err = listener.accept().await.unwrap_err();
    assert!(err.to_string().contains("scheduled maintenance"));

    // The peer observes the close reason too.
    let err = client_vc.closed().await;
    assert!(err.to_string().contains("scheduled maintenance"));
    let err = client_vc.connect().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::VcClosed);
}

#[tokio::test]
async fn version_mismatch_fails_handshake() {
    init_tracing();
    let mut client_cfg = Config::default();
    client_cfg.versions = VersionRange::new(9, 9);
    let mut server_cfg = Config::default();
    server_cfg.versions = VersionRange::new(1, 7);

    let (dialed, accepted) = connected(client_cfg, server_cfg, None).await;
    let derr = dialed.unwrap_err();
    assert_eq!(derr.kind(), ErrorKind::VersionMismatch);
    assert!(derr.to_string().contains("version mismatch"));
    assert!(accepted.is_err());
}

#[tokio::test]
async fn closing_one_flow_leaves_others_running() {
    init_tracing();
    let (dialed, accepted) = connected(Config::default(), Config::default(), None).await;
    let client_vc = dialed.unwrap();
    let server_vc = accepted.unwrap();
    spawn_echo_acceptor(&server_vc);

    let doomed = client_vc.connect().unwrap();
    let survivor = client_vc.connect().unwrap();

    doomed.write(b"bye").await.unwrap();
    let mut drained = [0u8; 3];
    doomed.read_exact(&mut drained).await.unwrap();
    doomed.close();
    assert!(doomed.write(b"more").await.is_err());

    survivor.write(b"still here").await.unwrap();
    let mut echoed = [0u8; 10];
    survivor.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"still here");
}
