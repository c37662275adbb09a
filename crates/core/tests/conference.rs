//! Integration tests: several local peers on loopback pairing over real
//! TCP control channels and UDP sockets, with the recording media engine
//! standing in for a media framework.
//!
//! Discovery is disabled and pairings are dialled explicitly so that the
//! tests do not depend on multicast routing of the host.

use std::io::Read;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpStream, UdpSocket};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;
use meshcall::config::DiscoveryConfig;
use meshcall::graph::{Endpoint, GraphState, NodeKind, NodeSpec, Prop, RtpSourceEndpoint};
use meshcall::protocol::message::{ControlMessage, write_message};
use meshcall::protocol::WireOffer;
use meshcall::session::{PortQuad, ReportPorts};
use meshcall::{
    Config, GraphEvent, LocalPeer, LocalState, Medium, Notification, PeerHandle, PeerInfo,
    RecordingEngine, RemoteState,
};

const LOOPBACK: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

struct TestPeer {
    handle: PeerHandle,
    engine: RecordingEngine,
    notes: Receiver<Notification>,
}

impl TestPeer {
    fn start() -> Self {
        Self::start_with(|peer| peer)
    }

    fn start_with(customize: impl FnOnce(LocalPeer) -> LocalPeer) -> Self {
        let config = Config {
            address: Some(LOOPBACK),
            control_port: 0,
            discovery: DiscoveryConfig {
                enabled: false,
                ..DiscoveryConfig::default()
            },
            ..Config::default()
        };
        let engine = RecordingEngine::new();
        let (tx, notes) = crossbeam_channel::unbounded();
        let handle = customize(LocalPeer::new(config).engine(engine.clone()).notifications(tx))
            .start()
            .expect("local peer starts");
        Self {
            handle,
            engine,
            notes,
        }
    }

    fn peers(&self) -> Vec<PeerInfo> {
        self.handle.snapshot().expect("reactor alive").peers
    }

    /// This peer's record of `other`.
    fn peer_for(&self, other: &TestPeer) -> PeerInfo {
        self.peers()
            .into_iter()
            .find(|p| p.control_addr == other.handle.control_addr())
            .expect("peer connected")
    }

    fn wait_peers(&self, count: usize) {
        assert!(
            wait_until(|| {
                let peers = self.peers();
                peers.len() == count && peers.iter().all(|p| p.state == RemoteState::Connected)
            }),
            "expected {count} connected peers, have {:?}",
            self.peers()
        );
    }

    fn wait_note(&self, matches: impl Fn(&Notification) -> bool) -> Notification {
        let deadline = Instant::now() + Duration::from_secs(5);
        while let Some(left) = deadline.checked_duration_since(Instant::now()) {
            match self.notes.recv_timeout(left) {
                Ok(note) if matches(&note) => return note,
                Ok(_) => continue,
                Err(_) => break,
            }
        }
        panic!("expected notification did not arrive");
    }
}

fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    condition()
}

fn pair(a: &TestPeer, b: &TestPeer) {
    let before_a = a.peers().len();
    let before_b = b.peers().len();
    a.handle.connect(b.handle.control_addr()).unwrap();
    a.wait_peers(before_a + 1);
    b.wait_peers(before_b + 1);
}

fn receive_graph(peer: &TestPeer, info: &PeerInfo) -> meshcall::GraphId {
    peer.engine
        .graph_by_name(&format!("recv-{}", info.id))
        .expect("receive graph exists")
        .0
}

#[test]
fn two_peers_pair_and_exchange_ports() {
    let a = TestPeer::start();
    let b = TestPeer::start();
    pair(&a, &b);

    let b_at_a = a.peer_for(&b);
    let a_at_b = b.peer_for(&a);

    for info in [&b_at_a, &a_at_b] {
        let mut ports = info.recv_ports.to_array().to_vec();
        ports.sort_unstable();
        ports.dedup();
        assert_eq!(ports.len(), 4, "recv ports must be distinct: {:?}", info.recv_ports);
    }
    // What one side binds is what the other sends to.
    for medium in Medium::ALL {
        assert_eq!(b_at_a.send_ports.rtp(medium), a_at_b.recv_ports.rtp(medium));
        assert_eq!(b_at_a.send_ports.rtcp(medium), a_at_b.recv_ports.rtcp(medium));
        assert_eq!(b_at_a.send_ports.rr(medium), b.handle.report_ports().get(medium));
    }

    let snapshot = a.handle.snapshot().unwrap();
    assert!(snapshot.transmitting);
    assert!(snapshot.state.contains(LocalState::STARTED));
    assert!(snapshot.state.contains(LocalState::READY));
    assert!(matches!(
        a.wait_note(|n| matches!(n, Notification::PeerConnected(_))),
        Notification::PeerConnected(info) if info.control_addr == b.handle.control_addr()
    ));
}

#[test]
fn disconnect_keeps_playback_running() {
    let a = TestPeer::start();
    let b = TestPeer::start();
    pair(&a, &b);
    let b_at_a = a.peer_for(&b);
    let a_at_b = b.peer_for(&a);

    a.handle.disconnect(b_at_a.id).unwrap();
    a.wait_peers(0);
    b.wait_peers(0);

    for peer in [&a, &b] {
        let (_, playback) = peer.engine.graph_by_name("playback").expect("playback graph");
        assert_eq!(playback.state, GraphState::Playing);
        assert!(playback.children.is_empty());
        let snapshot = peer.handle.snapshot().unwrap();
        assert!(!snapshot.transmitting);
        assert_eq!(snapshot.state, LocalState::READY);
        assert!(peer.engine.graph_by_name("transmit").is_none());
    }

    // All eight receive sockets are free again.
    for port in b_at_a.recv_ports.to_array().into_iter().chain(a_at_b.recv_ports.to_array()) {
        UdpSocket::bind((LOOPBACK, port)).unwrap_or_else(|e| panic!("port {port} still bound: {e}"));
    }
    assert!(a.handle.disconnect(b_at_a.id).is_err());
}

#[test]
fn reconnect_rebuilds_transmit() {
    let a = TestPeer::start();
    let b = TestPeer::start();
    pair(&a, &b);
    let first = a.peer_for(&b);
    a.handle.disconnect(first.id).unwrap();
    a.wait_peers(0);
    b.wait_peers(0);

    pair(&b, &a);
    let second = a.peer_for(&b);
    assert_ne!(first.id, second.id);
    assert!(a.handle.snapshot().unwrap().transmitting);
    let (_, transmit) = a.engine.graph_by_name("transmit").expect("transmit rebuilt");
    assert_eq!(transmit.state, GraphState::Playing);
    assert!(transmit.system_clock);
}

#[test]
fn receiver_reports_target_advertised_report_port() {
    let a = TestPeer::start();
    let b = TestPeer::start();
    pair(&a, &b);
    let b_at_a = a.peer_for(&b);

    for medium in Medium::ALL {
        // A's RR for B leaves from the socket B's SRs arrive on...
        let rr = a
            .engine
            .node(&format!("recv-{medium}-rr-sink-{}", b_at_a.id))
            .expect("rr sink");
        assert_eq!(
            rr.spec.get("socket").and_then(Prop::socket_port),
            Some(b_at_a.recv_ports.rtcp(medium))
        );
        // ...towards the report port B advertised,
        let report = b.handle.report_ports().get(medium);
        assert_eq!(rr.destinations, vec![SocketAddr::new(LOOPBACK, report)]);

        // which is the socket B's SRs to A are sent from.
        let sr = b.engine.node(&format!("{medium}-rtcp-sink")).expect("sr sink");
        assert_eq!(sr.spec.get("socket").and_then(Prop::socket_port), Some(report));
        assert!(sr
            .destinations
            .contains(&SocketAddr::new(LOOPBACK, b_at_a.recv_ports.rtcp(medium))));
    }
}

#[test]
fn malformed_offer_is_rejected_without_a_peer() {
    let a = TestPeer::start();
    let mut stream = TcpStream::connect(a.handle.control_addr()).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();

    let offer = WireOffer {
        address: Some(LOOPBACK),
        control_port: Some(7000),
        audio_caps: None,
        video_caps: Some("image/jpeg".into()),
        recv_ports: Some(PortQuad {
            audio_rtp: 7001,
            audio_rtcp: 7002,
            video_rtp: 7003,
            video_rtcp: 7004,
        }),
        report_ports: Some(ReportPorts {
            audio: 7005,
            video: 7006,
        }),
    };
    write_message(&mut stream, &ControlMessage::Offer(offer)).unwrap();

    // The responder closes without answering.
    let mut buf = [0u8; 16];
    let closed = matches!(stream.read(&mut buf), Ok(0) | Err(_));
    assert!(closed, "control socket should be closed");

    let note = a.wait_note(|n| matches!(n, Notification::NegotiationFailed { .. }));
    let Notification::NegotiationFailed { error, .. } = note else {
        unreachable!()
    };
    assert!(error.contains("audio_caps"), "unexpected error: {error}");
    assert!(a.peers().is_empty());
    assert!(a.engine.graph_by_name("transmit").is_none());
}

#[test]
fn unknown_session_drops_only_that_peer() {
    let a = TestPeer::start();
    let b = TestPeer::start();
    let c = TestPeer::start();
    pair(&a, &b);
    pair(&a, &c);
    let b_at_a = a.peer_for(&b);
    let c_at_a = a.peer_for(&c);

    // C's audio starts flowing and gets linked.
    let c_rtpbin = format!("recv-rtpbin-{}", c_at_a.id);
    let c_audio: RtpSourceEndpoint = "recv_rtp_src_0_4242_96".parse().unwrap();
    a.engine.emit(GraphEvent::EndpointAppeared {
        graph: receive_graph(&a, &c_at_a),
        node: c_rtpbin.clone(),
        endpoint: c_audio,
    });
    let c_depay = Endpoint::sink(format!("recv-audio-depay-{}", c_at_a.id));
    assert!(wait_until(|| a
        .engine
        .is_linked(&Endpoint::new(c_rtpbin.as_str(), c_audio.to_string()), &c_depay)));

    // B sends on a session that does not exist.
    a.engine.emit(GraphEvent::EndpointAppeared {
        graph: receive_graph(&a, &b_at_a),
        node: format!("recv-rtpbin-{}", b_at_a.id),
        endpoint: "recv_rtp_src_2_1111_96".parse().unwrap(),
    });
    a.wait_peers(1);
    b.wait_peers(0);

    let note = a.wait_note(|n| matches!(n, Notification::PeerDisconnected { .. }));
    let Notification::PeerDisconnected { peer, reason, .. } = note else {
        unreachable!()
    };
    assert_eq!(peer, b_at_a.id);
    assert!(reason.contains("protocol violation"), "unexpected reason: {reason}");

    assert_eq!(a.peers()[0].id, c_at_a.id);
    assert!(a.engine.node(&format!("recv-rtpbin-{}", b_at_a.id)).is_none());
    assert!(!a.engine.links_from(&format!("playback-audio-bridge-{}", c_at_a.id)).is_empty());
    assert!(a.engine.is_linked(&Endpoint::new(c_rtpbin.as_str(), c_audio.to_string()), &c_depay));
    assert!(a.handle.snapshot().unwrap().transmitting);
}

#[test]
fn transmit_failure_stops_sending_until_restart() {
    let a = TestPeer::start();
    let b = TestPeer::start();
    pair(&a, &b);

    let (transmit, _) = a.engine.graph_by_name("transmit").unwrap();
    a.engine.emit(GraphEvent::ProcessingError {
        graph: transmit,
        node: "audio-capture".into(),
        message: "device disappeared".into(),
        debug: None,
    });
    assert!(wait_until(|| !a.handle.snapshot().unwrap().transmitting));
    assert_eq!(a.peers().len(), 1, "peers survive a transmit failure");

    a.handle.restart_transmit().unwrap();
    let snapshot = a.handle.snapshot().unwrap();
    assert!(snapshot.transmitting);
    assert!(snapshot.state.contains(LocalState::STARTED));
}

#[test]
fn stopping_a_peer_says_bye() {
    let a = TestPeer::start();
    let b = TestPeer::start();
    pair(&a, &b);

    a.handle.stop();
    b.wait_peers(0);
    let note = b.wait_note(|n| matches!(n, Notification::PeerDisconnected { .. }));
    assert!(matches!(note, Notification::PeerDisconnected { reason, .. } if reason == "bye received"));
}

#[test]
fn clashing_video_sink_fails_only_the_new_peer() {
    let a = TestPeer::start_with(|peer| {
        peer.video_sink(|_| Some(NodeSpec::new("widget-sink", NodeKind::Custom("gtksink".into()))))
    });
    let b = TestPeer::start();
    let c = TestPeer::start();
    pair(&a, &b);

    a.handle.connect(c.handle.control_addr()).unwrap();
    let note = a.wait_note(|n| matches!(n, Notification::NegotiationFailed { .. }));
    assert!(matches!(
        note,
        Notification::NegotiationFailed { remote: Some(remote), .. } if remote == c.handle.control_addr()
    ));
    c.wait_peers(0);

    let peers = a.peers();
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].control_addr, b.handle.control_addr());
    assert!(a.engine.is_linked(
        &Endpoint::src(format!("playback-video-bridge-{}", peers[0].id)),
        &Endpoint::sink("widget-sink")
    ));
    assert!(a.handle.snapshot().unwrap().transmitting);
}

/// Whether `sender`'s record of the receiver targets the ports `receiver`'s
/// record of the sender was bound on.
fn sends_to(sender: &PeerInfo, receiver: &PeerInfo) -> bool {
    Medium::ALL.into_iter().all(|m| {
        sender.send_ports.rtp(m) == receiver.recv_ports.rtp(m)
            && sender.send_ports.rtcp(m) == receiver.recv_ports.rtcp(m)
    })
}

#[test]
fn simultaneous_mutual_connect_settles_on_one_pairing() {
    for _ in 0..5 {
        let a = TestPeer::start();
        let b = TestPeer::start();
        a.handle.connect(b.handle.control_addr()).unwrap();
        b.handle.connect(a.handle.control_addr()).unwrap();

        // Both sides hold the same connection: what each receives on is
        // what the other sends to.
        let agreed = || {
            let (at_a, at_b) = (a.peers(), b.peers());
            at_a.len() == 1
                && at_b.len() == 1
                && at_a[0].state == RemoteState::Connected
                && at_b[0].state == RemoteState::Connected
                && sends_to(&at_a[0], &at_b[0])
                && sends_to(&at_b[0], &at_a[0])
        };
        assert!(wait_until(agreed), "a={:?} b={:?}", a.peers(), b.peers());
        thread::sleep(Duration::from_millis(300));
        assert!(agreed(), "pairing lost: a={:?} b={:?}", a.peers(), b.peers());
    }
}

#[test]
fn failing_receive_graph_drops_only_that_peer() {
    let a = TestPeer::start();
    let b = TestPeer::start();
    let c = TestPeer::start();
    pair(&a, &b);
    pair(&a, &c);
    let b_at_a = a.peer_for(&b);
    let c_at_a = a.peer_for(&c);

    a.engine.emit(GraphEvent::ProcessingError {
        graph: receive_graph(&a, &b_at_a),
        node: format!("recv-video-decoder-{}", b_at_a.id),
        message: "corrupt frame".into(),
        debug: None,
    });
    a.wait_peers(1);
    b.wait_peers(0);

    assert_eq!(a.peers()[0].id, c_at_a.id);
    assert!(a.engine.graph_by_name(&format!("recv-{}", b_at_a.id)).is_none());
    assert!(a.engine.graph_by_name(&format!("recv-{}", c_at_a.id)).is_some());
    let (_, playback) = a.engine.graph_by_name("playback").unwrap();
    assert_eq!(playback.state, GraphState::Playing);
    assert_eq!(playback.children.len(), 2, "only C's two bins remain");
    assert!(a.handle.snapshot().unwrap().transmitting);
}
