//! Integration tests for the broker core
//!
//! Exercises two muxes over real sockets: handshake, routing, ingress
//! policy, auto-connect and the framing edge cases. TLS is left off so
//! the tests drive the tunnels over plain TCP, which the mux supports
//! for loopback wiring.

use async_trait::async_trait;
use meshbridge::links::Links;
use meshbridge::mux::{MeshIdentity, Mux, MuxOptions, Tun, TunnelError};
use meshbridge::net::CidrList;
use meshbridge::protocol::{
    read_frame, write_frame, ExtensionSet, Hello, PACKET_TYPE_DATA, PACKET_TYPE_HELLO,
};
use meshbridge::reconcile::{Reconciler, Responsible};
use meshbridge::store::{EventKind, LinkSpec, LinkStatus, LinkStore, StoreError, StoreEvent};
use meshbridge::transport::PeerIdentity;
use meshbridge::BUFFER_SIZE;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

/// Collects packets the mux would deliver to its tun device.
struct RecordingTun(Mutex<Vec<Vec<u8>>>);

impl RecordingTun {
    fn new() -> Arc<Self> {
        Arc::new(Self(Mutex::new(Vec::new())))
    }

    fn packets(&self) -> Vec<Vec<u8>> {
        self.0.lock().unwrap().clone()
    }
}

impl Tun for RecordingTun {
    fn write(&self, packet: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().push(packet.to_vec());
        Ok(packet.len())
    }
}

/// Records auto-connect registrations and status updates.
#[derive(Default)]
struct MemoryStore {
    registered: Mutex<Vec<LinkSpec>>,
    statuses: Mutex<Vec<(String, LinkStatus)>>,
}

#[async_trait]
impl LinkStore for MemoryStore {
    async fn register_link(&self, spec: LinkSpec) -> Result<(), StoreError> {
        self.registered.lock().unwrap().push(spec);
        Ok(())
    }

    async fn update_status(&self, name: &str, status: LinkStatus) -> Result<(), StoreError> {
        self.statuses.lock().unwrap().push((name.into(), status));
        Ok(())
    }
}

struct Node {
    mux: Arc<Mux>,
    tun: Arc<RecordingTun>,
    store: Arc<MemoryStore>,
}

fn node(cluster: &str, service: &str, auto_connect: bool, allow_anonymous: bool) -> Node {
    let service_cidr = service.parse().ok();
    let mut local = CidrList::new();
    if let Some(cidr) = service_cidr {
        local.add(cidr);
    }
    let tun = RecordingTun::new();
    let store = Arc::new(MemoryStore::default());
    let mux = Mux::new(MuxOptions {
        identity: MeshIdentity {
            cluster_address: cluster.parse().unwrap(),
            port: 8088,
            local,
        },
        links: Arc::new(Links::new(8088, service_cidr)),
        tun: tun.clone(),
        extensions: ExtensionSet::new(),
        tls: None,
        store: Some(store.clone()),
        sink: None,
        auto_connect,
        allow_anonymous,
        dial_budget: Duration::from_secs(5),
    });
    Node { mux, tun, store }
}

async fn listen(mux: &Arc<Mux>) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(mux.clone().listen(listener));
    port
}

fn link_spec(name: &str, cluster: &str, endpoint: &str, egress: &[&str]) -> LinkSpec {
    LinkSpec {
        name: name.into(),
        cluster_address: cluster.into(),
        endpoint: endpoint.into(),
        egress: egress.iter().map(|s| s.to_string()).collect(),
        ..Default::default()
    }
}

fn ipv4_packet(src: [u8; 4], dst: [u8; 4]) -> Vec<u8> {
    let mut packet = vec![0u8; 28];
    packet[0] = 0x45;
    let total = packet.len() as u16;
    packet[2..4].copy_from_slice(&total.to_be_bytes());
    packet[9] = 17;
    packet[12..16].copy_from_slice(&src);
    packet[16..20].copy_from_slice(&dst);
    packet
}

/// Dial A -> B and return both sides settled.
async fn connect(a: &Node, b: &Node, egress_for_b: &[&str]) {
    let b_port = listen(&b.mux).await;
    let b_link = a
        .mux
        .links()
        .put(&link_spec(
            "b",
            "192.168.0.12/24",
            &format!("127.0.0.1:{}", b_port),
            egress_for_b,
        ))
        .unwrap();
    b.mux
        .links()
        .put(&link_spec("a", "192.168.0.11/24", "none", &[]))
        .unwrap();

    let tunnel = a.mux.assure_tunnel(&b_link).await.unwrap();
    assert_eq!(
        tunnel.cluster_cidr(),
        Some("192.168.0.12/24".parse().unwrap())
    );
    // Give B's accept path time to register its side
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(b.mux.tunnel_count(), 1);
}

/// S1: successful handshake, routing by egress CIDR.
#[tokio::test]
async fn test_handshake_and_egress_routing() {
    let a = node("192.168.0.11/24", "100.64.0.0/20", false, false);
    let b = node("192.168.0.12/24", "100.64.16.0/20", false, false);
    connect(&a, &b, &["100.64.16.0/20"]).await;

    // 100.64.16.1 lies in B's egress, so A routes it to the B tunnel
    let via = a.mux.route_for_ip("100.64.16.1".parse().unwrap());
    assert!(via.is_some());
    // The peer cluster address routes there as well
    assert!(a
        .mux
        .route_for_ip("192.168.0.12".parse().unwrap())
        .is_some());
    // Unrelated addresses route nowhere
    assert!(a.mux.route_for_ip("100.64.32.1".parse().unwrap()).is_none());

    // assure_tunnel is idempotent: same tunnel, no second dial
    let b_link = a.mux.links().get("b").unwrap();
    let again = a.mux.assure_tunnel(&b_link).await.unwrap();
    assert!(Arc::ptr_eq(&via.unwrap(), &again));
    assert_eq!(a.mux.tunnel_count(), 1);
}

/// S2: cluster address mismatch aborts the handshake.
#[tokio::test]
async fn test_cluster_address_mismatch() {
    let a = node("192.168.0.11/24", "100.64.0.0/20", false, false);
    let b = node("192.168.0.13/24", "100.64.16.0/20", false, false);
    let b_port = listen(&b.mux).await;

    // A expects .12 but B advertises .13
    let wrong = a
        .mux
        .links()
        .put(&link_spec(
            "b",
            "192.168.0.12/24",
            &format!("127.0.0.1:{}", b_port),
            &[],
        ))
        .unwrap();
    b.mux
        .links()
        .put(&link_spec("a", "192.168.0.11/24", "none", &[]))
        .unwrap();

    match a.mux.assure_tunnel(&wrong).await {
        Err(TunnelError::ClusterAddressMismatch { got, expected }) => {
            assert_eq!(got, "192.168.0.13".parse::<IpAddr>().unwrap());
            assert_eq!(expected, "192.168.0.12".parse::<IpAddr>().unwrap());
        }
        other => panic!("expected mismatch, got {:?}", other.map(|_| ())),
    }
    // No tunnel registered on A
    assert_eq!(a.mux.tunnel_count(), 0);
    assert!(a.mux.route_for_ip("192.168.0.12".parse().unwrap()).is_none());
}

/// S3: ingress policy evaluation on inbound packets.
#[tokio::test]
async fn test_ingress_policy_drops() {
    let a = node("192.168.0.11/24", "100.64.0.0/20", false, false);
    let b = node("192.168.0.12/24", "100.64.16.0/20", false, false);
    let a_port = listen(&a.mux).await;

    // A's policy for B: allow 100.64.16.0/28 except 100.64.16.5
    let a_side_link = LinkSpec {
        ingress: vec!["100.64.16.0/28".into(), "!100.64.16.5/32".into()],
        ..link_spec("b", "192.168.0.12/24", "none", &[])
    };
    a.mux.links().put(&a_side_link).unwrap();
    let to_a = b
        .mux
        .links()
        .put(&link_spec(
            "a",
            "192.168.0.11/24",
            &format!("127.0.0.1:{}", a_port),
            &[],
        ))
        .unwrap();

    let tunnel = b.mux.assure_tunnel(&to_a).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Denied destination
    tunnel
        .write_packet(
            PACKET_TYPE_DATA,
            &ipv4_packet([192, 168, 0, 12], [100, 64, 16, 5]),
        )
        .await
        .unwrap();
    // Admitted destination
    tunnel
        .write_packet(
            PACKET_TYPE_DATA,
            &ipv4_packet([192, 168, 0, 12], [100, 64, 16, 3]),
        )
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    let delivered = a.tun.packets();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0][16..20], [100, 64, 16, 3]);
}

/// S4: an oversize frame kills the connection with a buffer error.
#[tokio::test]
async fn test_oversize_frame() {
    let a = node("192.168.0.11/24", "100.64.0.0/20", false, false);
    a.mux
        .links()
        .put(&link_spec("peer", "192.168.0.12/24", "none", &[]))
        .unwrap();
    let port = listen(&a.mux).await;

    let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let mut hello = Hello::new();
    hello.set_cluster_cidr("192.168.0.12/24".parse().unwrap());
    hello.set_port(8088);
    write_frame(&mut client, PACKET_TYPE_HELLO, &hello.encode())
        .await
        .unwrap();
    let mut buf = vec![0u8; BUFFER_SIZE];
    read_frame(&mut client, &mut buf).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(a.mux.tunnel_count(), 1);

    // Declared length 65535 exceeds the receive buffer (17000)
    client.write_all(&[0xff, 0xff, PACKET_TYPE_DATA]).await.unwrap();
    client.write_all(&[0u8; 1024]).await.unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    // The receiver closed and unregistered the tunnel
    assert_eq!(a.mux.tunnel_count(), 0);
}

/// S5: unknown frame types are skipped, not fatal.
#[tokio::test]
async fn test_unknown_frame_type_skipped() {
    let a = node("192.168.0.11/24", "100.64.0.0/20", false, false);
    a.mux
        .links()
        .put(&link_spec("peer", "192.168.0.12/24", "none", &[]))
        .unwrap();
    let port = listen(&a.mux).await;

    let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let mut hello = Hello::new();
    hello.set_cluster_cidr("192.168.0.12/24".parse().unwrap());
    write_frame(&mut client, PACKET_TYPE_HELLO, &hello.encode())
        .await
        .unwrap();
    let mut buf = vec![0u8; BUFFER_SIZE];
    read_frame(&mut client, &mut buf).await.unwrap();

    // Destinations inside A's service network pass the unset-policy check
    let first = ipv4_packet([192, 168, 0, 12], [100, 64, 0, 1]);
    let second = ipv4_packet([192, 168, 0, 12], [100, 64, 0, 2]);
    write_frame(&mut client, PACKET_TYPE_DATA, &first).await.unwrap();
    write_frame(&mut client, 7, &[0, 0, 0, 0]).await.unwrap();
    write_frame(&mut client, PACKET_TYPE_DATA, &second).await.unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    // Both data frames delivered in order, connection still up
    assert_eq!(a.tun.packets().len(), 2);
    assert_eq!(a.mux.tunnel_count(), 1);
}

/// S6: auto-connect synthesizes a link for an authenticated unknown peer.
#[tokio::test]
async fn test_auto_connect() {
    let a = node("192.168.0.11/24", "100.64.0.0/20", true, false);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accept_mux = a.mux.clone();
    let accepted = tokio::spawn(async move {
        let (stream, peer) = listener.accept().await.unwrap();
        // Identity as the TLS layer would have extracted it from the
        // client certificate
        accept_mux
            .serve_incoming(
                stream,
                peer.to_string(),
                Some(PeerIdentity {
                    common_name: "x.example".into(),
                }),
            )
            .await
    });

    let mut client = TcpStream::connect(addr).await.unwrap();
    let mut hello = Hello::new();
    hello.set_cluster_cidr("192.168.0.20/24".parse().unwrap());
    hello.set_port(8088);
    hello.set_cidr("100.64.48.0/20".parse().unwrap());
    write_frame(&mut client, PACKET_TYPE_HELLO, &hello.encode())
        .await
        .unwrap();
    let mut buf = vec![0u8; BUFFER_SIZE];
    let (ty, n) = read_frame(&mut client, &mut buf).await.unwrap();
    assert_eq!(ty, PACKET_TYPE_HELLO);
    let a_hello = Hello::decode(&buf[..n]).unwrap();
    assert_eq!(a_hello.cluster_cidr, "192.168.0.11/24".parse().unwrap());

    accepted.await.unwrap().unwrap();

    // The link was synthesized from CN and hello
    let link = a.mux.links().get("x.example").unwrap();
    assert_eq!(link.cluster_address, "192.168.0.20/24".parse().unwrap());
    assert_eq!(link.endpoint, "x.example:8088");
    assert_eq!(link.service_cidr, Some("100.64.48.0/20".parse().unwrap()));
    // ... registered with the store ...
    assert_eq!(a.store.registered.lock().unwrap().len(), 1);
    // ... and the tunnel is live
    assert!(a.mux.route_for_ip("192.168.0.20".parse().unwrap()).is_some());
}

/// An unknown peer without auto-connect is rejected.
#[tokio::test]
async fn test_unknown_peer_rejected() {
    let a = node("192.168.0.11/24", "100.64.0.0/20", false, false);
    let port = listen(&a.mux).await;

    let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let mut hello = Hello::new();
    hello.set_cluster_cidr("192.168.0.20/24".parse().unwrap());
    write_frame(&mut client, PACKET_TYPE_HELLO, &hello.encode())
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(a.mux.tunnel_count(), 0);
    assert!(a.mux.links().get("x.example").is_none());
}

/// Frames written concurrently hit the wire whole and in write order per
/// writer.
#[tokio::test]
async fn test_concurrent_writes_never_interleave() {
    let a = node("192.168.0.11/24", "100.64.0.0/20", false, false);
    let b = node("192.168.0.12/24", "100.64.16.0/20", false, false);
    connect(&a, &b, &[]).await;

    let tunnel = a.mux.route_for_ip("192.168.0.12".parse().unwrap()).unwrap();

    let mut writers = Vec::new();
    for writer_id in 0u8..8 {
        let tunnel = tunnel.clone();
        writers.push(tokio::spawn(async move {
            for seq in 0u8..20 {
                // Uniform fill per frame lets the receiver detect tearing
                let mut packet = vec![writer_id * 20 + seq; 64];
                packet[0] = 0x60; // uninspected non-IPv4 payload
                tunnel.write_packet(PACKET_TYPE_DATA, &packet).await.unwrap();
            }
        }));
    }
    for writer in writers {
        writer.await.unwrap();
    }

    tokio::time::sleep(Duration::from_millis(300)).await;
    let delivered = b.tun.packets();
    assert_eq!(delivered.len(), 160);
    for packet in delivered {
        assert_eq!(packet.len(), 64);
        // All payload bytes after the version byte are identical
        assert!(packet[1..].iter().all(|&b| b == packet[1]));
    }
}

/// The reconciler dials served links fed from store events.
#[tokio::test]
async fn test_reconciler_establishes_tunnel() {
    let a = node("192.168.0.11/24", "100.64.0.0/20", false, false);
    let b = node("192.168.0.12/24", "100.64.16.0/20", false, false);
    let b_port = listen(&b.mux).await;
    b.mux
        .links()
        .put(&link_spec("a", "192.168.0.11/24", "none", &[]))
        .unwrap();

    let reconciler = Reconciler::new(
        a.mux.clone(),
        Some(a.store.clone()),
        Responsible::parse("all"),
        4,
    );
    let (tx, rx) = mpsc::channel(8);
    tokio::spawn(reconciler.clone().run(rx));

    tx.send(StoreEvent {
        kind: EventKind::Added,
        spec: link_spec(
            "b",
            "192.168.0.12/24",
            &format!("127.0.0.1:{}", b_port),
            &["100.64.16.0/20"],
        ),
    })
    .await
    .unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(a.mux.route_for_ip("192.168.0.12".parse().unwrap()).is_some());
    let statuses = a.store.statuses.lock().unwrap().clone();
    assert!(statuses
        .iter()
        .any(|(name, s)| name == "b" && s.state == meshbridge::store::STATE_UP));

    // Deleting the link drops the tunnel and cancels the task
    tx.send(StoreEvent {
        kind: EventKind::Deleted,
        spec: LinkSpec {
            name: "b".into(),
            ..Default::default()
        },
    })
    .await
    .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(a.mux.route_for_ip("192.168.0.12".parse().unwrap()).is_none());
    assert_eq!(reconciler.task_count(), 0);
    reconciler.close();
}

/// Anonymous hellos only pass when explicitly allowed.
#[tokio::test]
async fn test_anonymous_inbound_gated() {
    // Gate closed
    let strict = node("192.168.0.11/24", "100.64.0.0/20", false, false);
    let port = listen(&strict.mux).await;
    let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    write_frame(&mut client, PACKET_TYPE_HELLO, &Hello::new().encode())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(strict.mux.tunnel_count(), 0);

    // Gate open
    let lenient = node("192.168.0.11/24", "100.64.0.0/20", false, true);
    let port = listen(&lenient.mux).await;
    let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    write_frame(&mut client, PACKET_TYPE_HELLO, &Hello::new().encode())
        .await
        .unwrap();
    let mut buf = vec![0u8; BUFFER_SIZE];
    let (ty, _) = read_frame(&mut client, &mut buf).await.unwrap();
    assert_eq!(ty, PACKET_TYPE_HELLO);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(lenient.mux.tunnel_count(), 1);
}

/// Mux shutdown closes all tunnels and stops the listener.
#[tokio::test]
async fn test_mux_shutdown() {
    let a = node("192.168.0.11/24", "100.64.0.0/20", false, false);
    let b = node("192.168.0.12/24", "100.64.16.0/20", false, false);
    connect(&a, &b, &[]).await;

    let tunnel = a.mux.route_for_ip("192.168.0.12".parse().unwrap()).unwrap();
    a.mux.close();
    a.mux.close();
    assert!(a.mux.is_closed());
    assert_eq!(a.mux.tunnel_count(), 0);
    assert!(tunnel.is_closed());

    let b_link = a.mux.links().get("b").unwrap();
    assert!(matches!(
        a.mux.assure_tunnel(&b_link).await,
        Err(TunnelError::Closed)
    ));
}
