//! Proxy relay scenarios over in-memory connections.

use std::time::Duration;

use braid_core::{
    await_relay, dial_via_proxy, register_with_proxy, Config, DialOpts, Endpoint, ErrorKind,
    Principal, RoutingId, Vc,
};
use braid_proxy::{Proxy, ProxyConfig};
use braid_testkit::{conn_pair, init_tracing, principals, spawn_echo_acceptor};

fn proxy_principal(root: &Principal) -> Principal {
    let mut p = Principal::self_blessed("proxy");
    p.add_root(root.public_key());
    p
}

fn quick_health() -> ProxyConfig {
    ProxyConfig {
        health_interval: Duration::from_millis(200),
        ..ProxyConfig::default()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn relay_echo_blessings_and_proxy_death() {
    init_tracing();
    let peers = principals();
    let proxy = Proxy::new(
        proxy_principal(&peers.root),
        Endpoint::new("tcp", "proxy.example:0", RoutingId::random()),
        quick_health(),
    );
    let (listener, conn_tx) = braid_testkit::mem_listener("proxy.example:0");
    proxy.serve(listener);

    // Server registers its routing id.
    let server_rid = RoutingId::random();
    let (mut sconn, pconn) = conn_pair();
    conn_tx.send(pconn).unwrap();
    let reg = register_with_proxy(&mut sconn, &Config::default(), &peers.server, server_rid)
        .await
        .unwrap();
    let assigned: Endpoint = reg.endpoints[0].parse().unwrap();
    assert_eq!(assigned.routes, vec![server_rid.to_string()]);
    assert_eq!(assigned.rid, server_rid);
    assert_eq!(assigned.blessing_names, vec!["root/server".to_string()]);
    assert!(proxy.is_registered(server_rid));

    let server_principal = peers.server;
    let server_ep = Endpoint::new("tcp", "server.example:0", server_rid);
    let server_task = tokio::spawn(async move {
        await_relay(&mut sconn).await.unwrap();
        let vc = Vc::accept(sconn, &server_principal, server_ep, Config::default())
            .await
            .unwrap();
        spawn_echo_acceptor(&vc);
        vc.closed().await
    });

    // Client reaches the server through the proxy by routing id.
    let (mut cconn, pconn) = conn_pair();
    conn_tx.send(pconn).unwrap();
    dial_via_proxy(&mut cconn, &Config::default(), &assigned)
        .await
        .unwrap();
    let client_vc = Vc::dial(
        cconn,
        &peers.client,
        Endpoint::new("tcp", "client.example:0", RoutingId::random()),
        assigned.clone(),
        DialOpts::default(),
    )
    .await
    .unwrap();

    // End-to-end identity: the client sees the server's blessings, never
    // the proxy's.
    assert_eq!(client_vc.remote_blessings().names(), vec!["root/server"]);

    let flow = client_vc.connect().unwrap();
    flow.write(b"HELLO_WRLD").await.unwrap();
    let mut echoed = [0u8; 10];
    flow.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"HELLO_WRLD");

    // The relay consumed the registration.
    assert!(!proxy.is_registered(server_rid));

    // Killing the proxy mid-flow closes both ends.
    proxy.shutdown();
    let client_err = client_vc.closed().await;
    assert!(client_err.to_string().contains("peer disconnected"));
    let server_err = server_task.await.unwrap();
    assert!(server_err.to_string().contains("peer disconnected"));
}

#[tokio::test]
async fn unknown_route_is_refused() {
    init_tracing();
    let peers = principals();
    let proxy = Proxy::new(
        proxy_principal(&peers.root),
        Endpoint::new("tcp", "proxy.example:0", RoutingId::random()),
        quick_health(),
    );
    let (listener, conn_tx) = braid_testkit::mem_listener("proxy.example:0");
    proxy.serve(listener);

    let mut target = Endpoint::new("tcp", "proxy.example:0", RoutingId::random());
    target.routes = vec![RoutingId::random().to_string()];

    let (mut cconn, pconn) = conn_pair();
    conn_tx.send(pconn).unwrap();
    dial_via_proxy(&mut cconn, &Config::default(), &target)
        .await
        .unwrap();
    let err = Vc::dial(
        cconn,
        &peers.client,
        Endpoint::new("tcp", "client.example:0", RoutingId::random()),
        target.clone(),
        DialOpts::default(),
    )
    .await
    .unwrap_err();
    assert!(err.to_string().contains("route not found"));

    proxy.shutdown();
}

#[tokio::test]
async fn allowlist_rejects_unlisted_servers() {
    init_tracing();
    let peers = principals();
    let cfg = ProxyConfig {
        allowlist: vec!["root/privileged".parse().unwrap()],
        ..quick_health()
    };
    let proxy = Proxy::new(
        proxy_principal(&peers.root),
        Endpoint::new("tcp", "proxy.example:0", RoutingId::random()),
        cfg,
    );
    let (listener, conn_tx) = braid_testkit::mem_listener("proxy.example:0");
    proxy.serve(listener);

    let (mut sconn, pconn) = conn_pair();
    conn_tx.send(pconn).unwrap();
    let err = register_with_proxy(
        &mut sconn,
        &Config::default(),
        &peers.server,
        RoutingId::random(),
    )
    .await
    .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::VcClosed);
    assert!(err.to_string().contains("authorization error"));

    proxy.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn chained_proxies_relay_transparently() {
    init_tracing();
    let peers = principals();

    let proxy_a = Proxy::new(
        proxy_principal(&peers.root),
        Endpoint::new("tcp", "a.example:0", RoutingId::random()),
        quick_health(),
    );
    let (listener_a, conn_tx_a) = braid_testkit::mem_listener("a.example:0");
    proxy_a.serve(listener_a);

    let b_rid = RoutingId::random();
    let proxy_b = Proxy::new(
        proxy_principal(&peers.root),
        Endpoint::new("tcp", "b.example:0", b_rid),
        quick_health(),
    );
    let (listener_b, conn_tx_b) = braid_testkit::mem_listener("b.example:0");
    proxy_b.serve(listener_b);

    // B extends its reach through A.
    let (bconn, pconn) = conn_pair();
    conn_tx_a.send(pconn).unwrap();
    proxy_b.chain(bconn);
    // The chain updates B's advertised endpoint once A responds.
    for _ in 0..100 {
        if !proxy_b.endpoint().routes.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(proxy_b.endpoint().routes, vec![b_rid.to_string()]);

    // Server registers at B; the assigned endpoint routes through A then B.
    let server_rid = RoutingId::random();
    let (mut sconn, pconn) = conn_pair();
    conn_tx_b.send(pconn).unwrap();
    let reg = register_with_proxy(&mut sconn, &Config::default(), &peers.server, server_rid)
        .await
        .unwrap();
    let assigned: Endpoint = reg.endpoints[0].parse().unwrap();
    assert_eq!(
        assigned.routes,
        vec![b_rid.to_string(), server_rid.to_string()]
    );

    let server_principal = peers.server;
    let server_ep = Endpoint::new("tcp", "server.example:0", server_rid);
    let server_task = tokio::spawn(async move {
        await_relay(&mut sconn).await.unwrap();
        let vc = Vc::accept(sconn, &server_principal, server_ep, Config::default())
            .await
            .unwrap();
        spawn_echo_acceptor(&vc);
        vc.closed().await
    });

    // Client dials A; the request hops A -> B -> server.
    let (mut cconn, pconn) = conn_pair();
    conn_tx_a.send(pconn).unwrap();
    dial_via_proxy(&mut cconn, &Config::default(), &assigned)
        .await
        .unwrap();
    let client_vc = Vc::dial(
        cconn,
        &peers.client,
        Endpoint::new("tcp", "client.example:0", RoutingId::random()),
        assigned.clone(),
        DialOpts::default(),
    )
    .await
    .unwrap();

    assert_eq!(client_vc.remote_blessings().names(), vec!["root/server"]);
    let flow = client_vc.connect().unwrap();
    flow.write(b"across two hops").await.unwrap();
    let mut echoed = [0u8; 15];
    flow.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"across two hops");

    proxy_a.shutdown();
    proxy_b.shutdown();
    let _ = server_task.await;
}
