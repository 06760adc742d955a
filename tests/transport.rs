use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use lattice_node::crypto::KeyPair;
use lattice_node::network_params::NetworkParams;
use lattice_node::rate_limiter::{BandwidthLimiter, BandwidthLimiterConfig};
use lattice_node::stats::{StatDetail, StatType, Stats};
use lattice_node::transport::{TcpListener, TcpListenerConfig, TcpSocketConfig};

fn listener_fixture(
    config: TcpListenerConfig,
) -> (Arc<TcpListener>, Arc<Stats>) {
    let params = NetworkParams::dev();
    let stats = Arc::new(Stats::new());
    let mut network = params.network;
    // Generous handshake window so raw test sockets are not reaped mid-test
    network.handshake_timeout = Duration::from_secs(60);
    let listener = TcpListener::new(
        config,
        TcpSocketConfig {
            checkup_interval: Duration::from_millis(100),
            ..Default::default()
        },
        network,
        KeyPair::generate(),
        Arc::new(BandwidthLimiter::new(BandwidthLimiterConfig::default())),
        stats.clone(),
    );
    (listener, stats)
}

async fn wait_until_async(deadline: Duration, mut predicate: impl FnMut() -> bool) {
    let start = Instant::now();
    while !predicate() {
        assert!(start.elapsed() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn listener_enforces_max_inbound_connections() {
    let (listener, stats) = listener_fixture(TcpListenerConfig {
        max_inbound_connections: 2,
        // Loopback connections all share one IP, keep those caps out of the way
        max_peers_per_ip: 0,
        max_peers_per_subnetwork: 0,
        ..Default::default()
    });
    listener.start().await.unwrap();
    let addr: SocketAddr = (Ipv4Addr::LOCALHOST, listener.port().unwrap()).into();

    let first = tokio::net::TcpStream::connect(addr).await.unwrap();
    let second = tokio::net::TcpStream::connect(addr).await.unwrap();
    wait_until_async(Duration::from_secs(5), || {
        stats.count(StatType::TcpListener, StatDetail::AcceptSuccess) == 2
    })
    .await;

    // Third connection is accepted at syscall level, then dropped immediately
    let third = tokio::net::TcpStream::connect(addr).await.unwrap();
    wait_until_async(Duration::from_secs(5), || {
        stats.count(StatType::TcpListenerRejected, StatDetail::MaxInbound) == 1
    })
    .await;
    assert_eq!(stats.count(StatType::TcpListener, StatDetail::AcceptSuccess), 2);

    // The rejected stream observes EOF
    third.readable().await.unwrap();
    let mut buffer = [0u8; 64];
    loop {
        match third.try_read(&mut buffer) {
            Ok(0) => break,
            Ok(_) => continue,
            Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            Err(_) => break,
        }
    }

    // Freeing one slot admits exactly one more connection
    drop(first);
    wait_until_async(Duration::from_secs(5), || listener.inbound_count() < 2).await;

    let _fourth = tokio::net::TcpStream::connect(addr).await.unwrap();
    wait_until_async(Duration::from_secs(5), || {
        stats.count(StatType::TcpListener, StatDetail::AcceptSuccess) == 3
    })
    .await;
    let _fifth = tokio::net::TcpStream::connect(addr).await.unwrap();
    wait_until_async(Duration::from_secs(5), || {
        stats.count(StatType::TcpListenerRejected, StatDetail::MaxInbound) == 2
    })
    .await;
    assert_eq!(stats.count(StatType::TcpListener, StatDetail::AcceptSuccess), 3);

    drop(second);
    listener.stop();
}

#[tokio::test]
async fn listener_enforces_per_ip_cap() {
    let (listener, stats) = listener_fixture(TcpListenerConfig {
        max_inbound_connections: 16,
        max_peers_per_ip: 1,
        max_peers_per_subnetwork: 0,
        ..Default::default()
    });
    listener.start().await.unwrap();
    let addr: SocketAddr = (Ipv4Addr::LOCALHOST, listener.port().unwrap()).into();

    let _first = tokio::net::TcpStream::connect(addr).await.unwrap();
    wait_until_async(Duration::from_secs(5), || {
        stats.count(StatType::TcpListener, StatDetail::AcceptSuccess) == 1
    })
    .await;

    let _second = tokio::net::TcpStream::connect(addr).await.unwrap();
    wait_until_async(Duration::from_secs(5), || {
        stats.count(StatType::TcpListenerRejected, StatDetail::MaxPerIp) == 1
    })
    .await;
    assert_eq!(stats.count(StatType::TcpListener, StatDetail::AcceptSuccess), 1);

    listener.stop();
}

#[tokio::test]
async fn handshake_establishes_node_ids_both_ways() {
    let (server, server_stats) = listener_fixture(TcpListenerConfig::default());
    let (client, _client_stats) = listener_fixture(TcpListenerConfig::default());
    server.start().await.unwrap();
    client.start().await.unwrap();

    let accepted = Arc::new(AtomicUsize::new(0));
    {
        let accepted = accepted.clone();
        server.connection_accepted.add(move |_channel| {
            accepted.fetch_add(1, Ordering::SeqCst);
        });
    }

    let addr: SocketAddr = (Ipv4Addr::LOCALHOST, server.port().unwrap()).into();
    let channel = client.connect(addr).await.unwrap();

    wait_until_async(Duration::from_secs(5), || {
        accepted.load(Ordering::SeqCst) == 1
    })
    .await;
    assert_eq!(
        server_stats.count(StatType::Handshake, StatDetail::ResponseAccepted),
        1
    );

    // The server learned the client's node id
    let realtime = server.realtime_channels();
    assert_eq!(realtime.len(), 1);
    assert_eq!(realtime[0].node_id(), Some(client.node_id()));
    assert!(channel.alive());

    client.stop();
    server.stop();
}

#[tokio::test]
async fn handshake_rejects_unanswered_connections() {
    let params = NetworkParams::dev();
    let stats = Arc::new(Stats::new());
    let mut network = params.network;
    network.handshake_timeout = Duration::from_millis(300);
    let listener = TcpListener::new(
        TcpListenerConfig::default(),
        TcpSocketConfig::default(),
        network,
        KeyPair::generate(),
        Arc::new(BandwidthLimiter::new(BandwidthLimiterConfig::default())),
        stats.clone(),
    );
    listener.start().await.unwrap();
    let addr: SocketAddr = (Ipv4Addr::LOCALHOST, listener.port().unwrap()).into();

    // Connect and stay silent: the handshake must time out
    let _stream = tokio::net::TcpStream::connect(addr).await.unwrap();
    wait_until_async(Duration::from_secs(5), || listener.realtime_channels().is_empty()).await;
    wait_until_async(Duration::from_secs(5), || {
        stats.count(StatType::Handshake, StatDetail::CookieIssued) == 1
    })
    .await;
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(listener.realtime_channels().is_empty());
    assert_eq!(
        stats.count(StatType::Handshake, StatDetail::ResponseAccepted),
        0
    );

    listener.stop();
}
