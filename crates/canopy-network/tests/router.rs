//! Integration tests: routers exchanging typed messages.

use std::time::Duration;

use canopy_network::{
    processor_fn, Address, KeyPair, LocalNetwork, Message, NetworkError, Packet, Router,
    RouterConfig, ServerIdentity,
};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Ping {
    seq: u32,
}

impl Message for Ping {
    const NAME: &'static str = "Ping";
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_env_filter("warn").try_init();
}

async fn local_router(net: &LocalNetwork, seed: u64) -> Router {
    let si = ServerIdentity::new(KeyPair::from_seed(seed).public, Address::local("127.0.0.1", 0));
    Router::bind(si, RouterConfig::new().local_network(net.clone()))
        .await
        .unwrap()
}

async fn tcp_router(seed: u64) -> Router {
    let si = ServerIdentity::new(KeyPair::from_seed(seed).public, Address::tcp("127.0.0.1", 0));
    Router::bind(si, RouterConfig::new()).await.unwrap()
}

/// Register a processor that forwards every inbound packet to a channel.
fn collect(router: &Router) -> mpsc::UnboundedReceiver<Packet> {
    let (tx, rx) = mpsc::unbounded_channel();
    router.register::<Ping>(processor_fn(move |p| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(p);
        }
    }));
    rx
}

async fn next(rx: &mut mpsc::UnboundedReceiver<Packet>) -> Packet {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("recv timed out")
        .expect("channel closed")
}

#[tokio::test]
async fn local_routers_exchange_messages() {
    init_tracing();
    let net = LocalNetwork::new();
    let a = local_router(&net, 1).await;
    let b = local_router(&net, 2).await;
    assert_ne!(a.address(), b.address());
    let mut rx = collect(&b);
    a.start();
    b.start();

    a.send(b.server_identity(), &Ping { seq: 7 }).await.unwrap();
    let packet = next(&mut rx).await;
    assert_eq!(packet.server_identity, *a.server_identity());
    assert_eq!(packet.decode::<Ping>().unwrap(), Ping { seq: 7 });
    assert!(a.tx() > 0);
    assert_eq!(a.tx(), b.rx());
}

#[tokio::test]
async fn tcp_routers_exchange_messages() {
    init_tracing();
    let a = tcp_router(1).await;
    let b = tcp_router(2).await;
    assert_ne!(b.address().port(), 0);
    let mut rx_a = collect(&a);
    let mut rx_b = collect(&b);
    a.start();
    b.start();

    a.send(b.server_identity(), &Ping { seq: 1 }).await.unwrap();
    let packet = next(&mut rx_b).await;
    assert_eq!(packet.server_identity.id, a.server_identity().id);

    b.send(&packet.server_identity, &Ping { seq: 2 }).await.unwrap();
    let reply = next(&mut rx_a).await;
    assert_eq!(reply.decode::<Ping>().unwrap().seq, 2);

    a.close().await;
    b.close().await;
}

#[tokio::test]
async fn order_is_kept_per_sender() {
    init_tracing();
    let a = tcp_router(3).await;
    let b = tcp_router(4).await;
    let mut rx = collect(&b);
    b.start();

    for seq in 0..50 {
        a.send(b.server_identity(), &Ping { seq }).await.unwrap();
    }
    for seq in 0..50 {
        assert_eq!(next(&mut rx).await.decode::<Ping>().unwrap().seq, seq);
    }
    assert_eq!(a.connections().await, 1);
}

#[tokio::test]
async fn self_send_skips_the_network() {
    init_tracing();
    let net = LocalNetwork::new();
    let a = local_router(&net, 5).await;
    let mut rx = collect(&a);
    a.start();

    a.send(a.server_identity(), &Ping { seq: 9 }).await.unwrap();
    assert_eq!(next(&mut rx).await.decode::<Ping>().unwrap().seq, 9);
    assert_eq!(a.tx(), 0);
    assert_eq!(a.connections().await, 0);
}

#[tokio::test]
async fn send_to_unknown_local_address_fails() {
    init_tracing();
    let net = LocalNetwork::new();
    let a = local_router(&net, 6).await;
    let ghost = ServerIdentity::new(KeyPair::from_seed(99).public, Address::local("127.0.0.1", 9999));
    assert!(matches!(
        a.send(&ghost, &Ping { seq: 0 }).await,
        Err(NetworkError::Connect { .. })
    ));
}

#[tokio::test]
async fn closed_router_refuses_and_unregisters() {
    init_tracing();
    let net = LocalNetwork::new();
    let a = local_router(&net, 7).await;
    let b = local_router(&net, 8).await;
    a.start();
    b.start();

    b.close().await;
    assert!(!net.is_listening(b.address()));
    assert!(a.send(b.server_identity(), &Ping { seq: 0 }).await.is_err());

    a.close().await;
    assert!(matches!(
        a.send(b.server_identity(), &Ping { seq: 0 }).await,
        Err(NetworkError::Shutdown)
    ));
}

#[tokio::test]
async fn unsupported_conn_type_rejected() {
    let si = ServerIdentity::new(KeyPair::from_seed(1).public, "tls://127.0.0.1:0".parse().unwrap());
    assert!(matches!(
        Router::bind(si, RouterConfig::new()).await,
        Err(NetworkError::UnsupportedConnType(_))
    ));
}

#[tokio::test]
async fn unreachable_peer_does_not_stall_other_sends() {
    init_tracing();
    let si = ServerIdentity::new(KeyPair::from_seed(11).public, Address::tcp("127.0.0.1", 0));
    let a = Router::bind(si, RouterConfig::new().connect_timeout(Duration::from_secs(2)))
        .await
        .unwrap();
    let b = tcp_router(12).await;
    let mut rx = collect(&b);
    a.start();
    b.start();

    // Documentation range: the dial either hangs until the timeout or fails fast.
    let void = ServerIdentity::new(KeyPair::from_seed(13).public, Address::tcp("192.0.2.1", 9));
    let stalled = {
        let a = a.clone();
        tokio::spawn(async move { a.send(&void, &Ping { seq: 0 }).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    tokio::time::timeout(Duration::from_secs(1), a.send(b.server_identity(), &Ping { seq: 1 }))
        .await
        .expect("send to a live peer waited on the unreachable one")
        .unwrap();
    assert_eq!(next(&mut rx).await.decode::<Ping>().unwrap().seq, 1);

    let result = tokio::time::timeout(Duration::from_secs(5), stalled)
        .await
        .expect("dial outlived its timeout")
        .unwrap();
    assert!(matches!(result, Err(NetworkError::Connect { .. })));
    assert_eq!(a.connections().await, 1);

    a.close().await;
    b.close().await;
}
