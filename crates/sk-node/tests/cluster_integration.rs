//! Cluster integration tests
//!
//! Runs two nodes on loopback, pointed at each other with unicast beacon
//! targets, and checks they find each other and settle on one link.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

use sk_core::config::{NodeConfig, ReservedPort, CLUSTER_SERVICE};
use sk_core::error::SkError;
use sk_core::ipc::NodeEvent;
use sk_core::time::current_time_millis;
use sk_core::types::{LinkState, MachineId, MachineStatus};
use sk_node::DiscoveryCoordinator;
use sk_protocol::{
    ClusterCodec, ClusterMessage, ErrorCode, ErrorPayload, MachineAdvert, MessageType,
    Registration, PROTOCOL_VERSION,
};

/// Two distinct free UDP ports on loopback
fn free_udp_ports() -> (u16, u16) {
    let a = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    let b = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    (a.local_addr().unwrap().port(), b.local_addr().unwrap().port())
}

fn node_config(id: &str, beacon_port: u16, peer_beacon_port: u16) -> NodeConfig {
    let mut config = NodeConfig::default();
    config.node.machine_id = Some(id.into());
    config.node.advertise_ip = Some("127.0.0.1".into());

    config.discovery.beacon_port = beacon_port;
    config.discovery.bind_address = "127.0.0.1".into();
    config.discovery.multicast_group = None;
    config.discovery.broadcast = false;
    config.discovery.subnet_broadcast = false;
    config.discovery.targets = vec![format!("127.0.0.1:{}", peer_beacon_port)];
    config.discovery.interval = Duration::from_millis(200);
    config.discovery.silence_window = Duration::from_secs(3);
    config.discovery.sweep_interval = Duration::from_millis(200);
    config.discovery.discover_window = Duration::from_millis(500);

    config.cluster.bind_address = "127.0.0.1".into();
    config.cluster.port = 0;
    config.cluster.heartbeat_interval = Duration::from_millis(300);
    config.cluster.backoff.initial = Duration::from_millis(100);
    config.cluster.backoff.max = Duration::from_secs(1);
    config
}

fn pair() -> (Arc<DiscoveryCoordinator>, Arc<DiscoveryCoordinator>) {
    let (pa, pb) = free_udp_ports();
    let a = DiscoveryCoordinator::new(node_config("m-aaa", pa, pb)).unwrap();
    let b = DiscoveryCoordinator::new(node_config("m-bbb", pb, pa)).unwrap();
    (a, b)
}

/// Poll `check` until it holds or `limit` passes
async fn eventually<F: Fn() -> bool>(limit: Duration, check: F) -> bool {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    check()
}

fn open_link_count(node: &DiscoveryCoordinator) -> usize {
    node.links()
        .iter()
        .filter(|l| l.state == LinkState::Established || l.state == LinkState::Degraded)
        .count()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_two_nodes_discover_and_link() {
    let (a, b) = pair();
    a.start().await.unwrap();
    b.start().await.unwrap();

    let id_a = MachineId::new("m-aaa");
    let id_b = MachineId::new("m-bbb");

    assert!(
        eventually(Duration::from_secs(5), || {
            a.state().links.established_for(&id_b).is_some()
                && b.state().links.established_for(&id_a).is_some()
        })
        .await,
        "nodes never linked"
    );

    let peers = a.list_peers();
    assert_eq!(peers.len(), 2);
    let remote = peers.iter().find(|p| !p.is_local).unwrap();
    assert_eq!(remote.descriptor.machine_id, id_b);
    assert_eq!(remote.descriptor.status, MachineStatus::Online);
    assert_eq!(remote.descriptor.primary_ip, "127.0.0.1");
    assert_eq!(remote.link_state, LinkState::Established);

    a.stop().await;
    b.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_mutual_dial_settles_on_one_link() {
    let (a, b) = pair();
    a.start().await.unwrap();
    b.start().await.unwrap();

    assert!(
        eventually(Duration::from_secs(5), || {
            open_link_count(&a) == 1 && open_link_count(&b) == 1 && a.links().len() == 1
                && b.links().len() == 1
        })
        .await,
        "duplicate links never resolved: a={:?} b={:?}",
        a.links(),
        b.links()
    );

    // Both ends hold the same connection, seen from opposite directions
    let la = a.links().remove(0);
    let lb = b.links().remove(0);
    assert_ne!(la.direction, lb.direction);
    assert_eq!(la.machine_id.as_deref(), Some("m-bbb"));
    assert_eq!(lb.machine_id.as_deref(), Some("m-aaa"));

    a.stop().await;
    b.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_messages_flow_over_link() {
    let (a, b) = pair();
    a.start().await.unwrap();
    b.start().await.unwrap();

    let id_a = MachineId::new("m-aaa");
    let id_b = MachineId::new("m-bbb");
    assert!(
        eventually(Duration::from_secs(5), || {
            a.state().links.established_for(&id_b).is_some()
                && b.state().links.established_for(&id_a).is_some()
        })
        .await
    );

    let mut events = b.state().subscribe();
    a.send_to(
        &id_b,
        MessageType::TaskCoordination,
        serde_json::json!({"task": "build"}),
    )
    .await
    .unwrap();

    let received = tokio::time::timeout(Duration::from_secs(3), async {
        loop {
            if let Ok(NodeEvent::TaskCoordination { machine_id, payload }) = events.recv().await {
                return (machine_id, payload);
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(received.0, "m-aaa");
    assert_eq!(received.1["task"], "build");

    a.ping(&id_b).await.unwrap();
    assert!(
        eventually(Duration::from_secs(3), || {
            a.links().iter().any(|l| l.rtt_ms.is_some())
        })
        .await
    );

    a.stop().await;
    b.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_peer_goes_offline_after_stop() {
    let (a, b) = pair();
    a.start().await.unwrap();
    b.start().await.unwrap();

    let id_b = MachineId::new("m-bbb");
    assert!(
        eventually(Duration::from_secs(5), || {
            a.state().links.established_for(&id_b).is_some()
        })
        .await
    );

    b.stop().await;

    assert!(
        eventually(Duration::from_secs(6), || {
            a.state()
                .registry
                .get(&id_b)
                .map(|d| d.status == MachineStatus::Offline)
                .unwrap_or(false)
        })
        .await,
        "peer never expired"
    );
    assert!(a.list_peers().iter().all(|p| p.is_local));

    a.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stop_is_prompt_and_idempotent() {
    let (a, b) = pair();
    a.start().await.unwrap();
    b.start().await.unwrap();

    let id_b = MachineId::new("m-bbb");
    eventually(Duration::from_secs(5), || {
        a.state().links.established_for(&id_b).is_some()
    })
    .await;

    let started = Instant::now();
    a.stop().await;
    assert!(started.elapsed() < Duration::from_secs(2) + Duration::from_millis(500));
    assert!(!a.is_running());
    assert!(a.state().links.is_empty());

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn test_discover_now_requires_start() {
    let (a, _b) = pair();
    assert!(matches!(a.discover_now().await, Err(SkError::NotRunning)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_discover_now_reports_new_peer() {
    let (a, b) = pair();
    a.start().await.unwrap();

    // b comes up while a is listening; its first beacon lands in the window
    let b_start = {
        let b = Arc::clone(&b);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            b.start().await.unwrap();
        })
    };

    let found = a.discover_now().await.unwrap();
    b_start.await.unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].descriptor.machine_id.as_str(), "m-bbb");

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn test_start_is_idempotent() {
    let (a, _b) = pair();
    a.start().await.unwrap();
    let addr = a.cluster_addr().unwrap();
    a.start().await.unwrap();
    assert_eq!(a.cluster_addr(), Some(addr));
    assert_eq!(a.status().cluster_port, addr.port());
    a.stop().await;
}

/// Node whose cluster port is reserved for the cluster service, the way
/// 8080 is in the default table
fn reserved_port_node() -> (Arc<DiscoveryCoordinator>, u16) {
    let (beacon, unused) = free_udp_ports();
    let port = {
        let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        l.local_addr().unwrap().port()
    };

    let mut config = node_config("m-aaa", beacon, unused);
    config.cluster.port = port;
    for reserved in &mut config.ports.reserved {
        if reserved.service == CLUSTER_SERVICE {
            *reserved = ReservedPort::new(port, CLUSTER_SERVICE);
        }
    }
    (DiscoveryCoordinator::new(config).unwrap(), port)
}

fn advertises(node: &DiscoveryCoordinator, service: &str) -> bool {
    let local = node.state().local_id().clone();
    node.state()
        .registry
        .get(&local)
        .map(|d| d.services.iter().any(|s| s.name == service))
        .unwrap_or(false)
}

#[tokio::test]
async fn test_stop_gives_back_reserved_cluster_port() {
    let (node, port) = reserved_port_node();
    node.start().await.unwrap();

    let claims = node.state().ports.active_claims();
    assert_eq!(claims.len(), 1);
    assert_eq!(claims[0].port, port);
    assert!(advertises(&node, CLUSTER_SERVICE));

    let mut events = node.state().subscribe();
    node.stop().await;

    assert!(node.state().ports.active_claims().is_empty());
    assert!(!advertises(&node, CLUSTER_SERVICE));
    // Still reserved: stopping frees the claim, not the reservation
    assert_eq!(node.state().ports.reserved_owner(port), Some(CLUSTER_SERVICE));

    let mut released = false;
    while let Ok(event) = events.try_recv() {
        if let NodeEvent::PortReleased { port: p, service } = event {
            assert_eq!(p, port);
            assert_eq!(service, CLUSTER_SERVICE);
            released = true;
        }
    }
    assert!(released, "no PortReleased event");
}

#[tokio::test]
async fn test_failed_start_gives_back_cluster_port() {
    let (node, _port) = reserved_port_node();
    // Occupy the beacon port without address reuse so the listener fails
    let beacon_port = node.state().config.discovery.beacon_port;
    let _blocker = std::net::UdpSocket::bind(("127.0.0.1", beacon_port)).unwrap();

    assert!(node.start().await.is_err());
    assert!(!node.is_running());
    assert!(node.state().ports.active_claims().is_empty());
}

#[tokio::test]
async fn test_concurrent_starts_claim_once() {
    let (node, port) = reserved_port_node();
    let mut events = node.state().subscribe();

    let (first, second) = tokio::join!(node.start(), node.start());
    first.unwrap();
    second.unwrap();
    assert!(node.is_running());

    let mut claimed = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, NodeEvent::PortClaimed(ref a) if a.port == port) {
            claimed += 1;
        }
    }
    assert_eq!(claimed, 1);

    node.stop().await;
    assert!(node.state().ports.active_claims().is_empty());
}

// ============================================================================
// Link behaviour against a hand-driven peer
// ============================================================================

type RawLink = Framed<TcpStream, ClusterCodec>;

const RAW_ID: &str = "m-raw";

/// Started node with nobody else around. Heartbeat 200ms, so a link
/// degrades after 400ms of silence.
async fn lone_node(handshake_timeout: Duration) -> Arc<DiscoveryCoordinator> {
    let (beacon, unused) = free_udp_ports();
    let mut config = node_config("m-aaa", beacon, unused);
    config.cluster.heartbeat_interval = Duration::from_millis(200);
    config.cluster.handshake_timeout = handshake_timeout;
    let node = DiscoveryCoordinator::new(config).unwrap();
    node.start().await.unwrap();
    node
}

fn raw_advert() -> MachineAdvert {
    MachineAdvert {
        machine_id: RAW_ID.into(),
        hostname: "raw-host".into(),
        primary_ip: "127.0.0.1".into(),
        services: vec![],
        // Not dialable, so the node never tries to reconnect to it
        cluster_port: 0,
        capabilities: None,
    }
}

async fn connect_raw(node: &DiscoveryCoordinator) -> RawLink {
    let stream = TcpStream::connect(node.cluster_addr().unwrap()).await.unwrap();
    Framed::new(stream, ClusterCodec::new())
}

/// Next frame, or `None` once the node hangs up
async fn next_frame(link: &mut RawLink) -> Option<ClusterMessage> {
    match tokio::time::timeout(Duration::from_secs(3), link.next()).await {
        Ok(Some(Ok(message))) => Some(message),
        Ok(_) => None,
        Err(_) => panic!("node neither sent nor closed within 3s"),
    }
}

async fn register_raw(link: &mut RawLink, registration: Registration) {
    let hello = ClusterMessage::registration(RAW_ID, &registration, current_time_millis()).unwrap();
    link.send(hello).await.unwrap();
    let theirs = next_frame(link).await.expect("node closed before registering");
    assert_eq!(theirs.kind, MessageType::Registration);
}

fn raw_link_state(node: &DiscoveryCoordinator) -> LinkState {
    node.state().links.best_state_for(&MachineId::new(RAW_ID))
}

fn raw_status(node: &DiscoveryCoordinator) -> Option<MachineStatus> {
    node.state()
        .registry
        .get(&MachineId::new(RAW_ID))
        .map(|d| d.status)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_silent_link_degrades_and_recovers() {
    let node = lone_node(Duration::from_secs(5)).await;
    let mut raw = connect_raw(&node).await;
    register_raw(&mut raw, Registration::new(raw_advert())).await;

    assert!(eventually(Duration::from_secs(2), || raw_link_state(&node) == LinkState::Established).await);
    assert_eq!(raw_status(&node), Some(MachineStatus::Online));

    // Silence past twice the heartbeat interval
    assert!(
        eventually(Duration::from_secs(2), || raw_link_state(&node) == LinkState::Degraded).await,
        "link never degraded"
    );
    assert_eq!(raw_status(&node), Some(MachineStatus::Degraded));

    // Any traffic brings it back
    raw.send(ClusterMessage::heartbeat(RAW_ID, current_time_millis()))
        .await
        .unwrap();
    assert!(
        eventually(Duration::from_secs(2), || raw_link_state(&node) == LinkState::Established).await,
        "link never recovered"
    );
    assert_eq!(raw_status(&node), Some(MachineStatus::Online));

    node.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_closing_degraded_link_clears_degraded_status() {
    let node = lone_node(Duration::from_secs(5)).await;
    let mut raw = connect_raw(&node).await;
    register_raw(&mut raw, Registration::new(raw_advert())).await;

    assert!(eventually(Duration::from_secs(3), || raw_link_state(&node) == LinkState::Degraded).await);
    assert_eq!(raw_status(&node), Some(MachineStatus::Degraded));

    drop(raw);
    assert!(
        eventually(Duration::from_secs(2), || raw_link_state(&node) == LinkState::Disconnected).await
    );
    // Still within its silence window, so present, but no longer degraded
    assert_eq!(raw_status(&node), Some(MachineStatus::Online));

    node.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_handshake_timeout_closes_link() {
    let node = lone_node(Duration::from_millis(300)).await;
    let mut raw = connect_raw(&node).await;

    // The node introduces itself, then gives up waiting for us
    let hello = next_frame(&mut raw).await.unwrap();
    assert_eq!(hello.kind, MessageType::Registration);

    let started = Instant::now();
    assert!(next_frame(&mut raw).await.is_none());
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(eventually(Duration::from_secs(1), || node.links().is_empty()).await);
    assert_eq!(raw_status(&node), None);

    node.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_registration_with_other_protocol_version_refused() {
    let node = lone_node(Duration::from_secs(5)).await;
    let mut raw = connect_raw(&node).await;

    let mut registration = Registration::new(raw_advert());
    registration.protocol_version = PROTOCOL_VERSION + 1;
    let hello = ClusterMessage::registration(RAW_ID, &registration, current_time_millis()).unwrap();
    raw.send(hello).await.unwrap();

    let theirs = next_frame(&mut raw).await.unwrap();
    assert_eq!(theirs.kind, MessageType::Registration);

    let refusal = next_frame(&mut raw).await.expect("expected an error frame");
    assert_eq!(refusal.kind, MessageType::Error);
    let payload: ErrorPayload = refusal.decode_payload().unwrap();
    assert_eq!(payload.code, ErrorCode::VersionMismatch);

    assert!(next_frame(&mut raw).await.is_none());
    assert_eq!(raw_status(&node), None);
    assert_ne!(raw_link_state(&node), LinkState::Established);

    node.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_reconnect_stops_once_peer_offline() {
    let (a, b) = pair();
    a.start().await.unwrap();
    b.start().await.unwrap();

    let id_b = MachineId::new("m-bbb");
    assert!(
        eventually(Duration::from_secs(5), || {
            a.state().links.established_for(&id_b).is_some()
        })
        .await
    );

    // a sees the link drop while b is still in its registry
    b.stop().await;
    assert!(
        eventually(Duration::from_secs(2), || a.is_reconnecting(&id_b)).await,
        "no reconnect scheduled"
    );
    assert!(a.state().links.established_for(&id_b).is_none());

    // Silence window 3s, back-off capped at 1s
    assert!(
        eventually(Duration::from_secs(6), || !a.is_reconnecting(&id_b)).await,
        "reconnect never gave up"
    );
    assert_eq!(
        a.state().registry.get(&id_b).map(|d| d.status),
        Some(MachineStatus::Offline)
    );

    a.stop().await;
}
