use std::collections::HashMap;
use std::io::Write;
use std::net::{IpAddr, Shutdown, SocketAddr, TcpStream};

use crate::config::MediaConfig;
use crate::error::{Error, Result};
use crate::graph::{
    Endpoint, GraphBuilder, GraphId, GraphKind, GraphState, MediaEngine, NodeKind, NodeSpec, Prop,
    RtpSourceEndpoint,
};
use crate::media::{Capabilities, Medium, RTP_JPEG_CAPS, RTP_OPUS_CAPS};
use crate::protocol::Negotiated;
use crate::protocol::message::{ControlMessage, write_message};
use crate::session::bridge::{self, Bridge};
use crate::session::local::{PlaybackGraph, destroy};
use crate::session::{PeerId, PeerInfo, PortQuad, RemoteState, SendPorts, SendTarget};
use crate::transport::FlowSockets;

/// One connected remote peer: its negotiated parameters, the four sockets
/// we receive it on, its receive graph, its bridge into playback and the
/// control stream.
///
/// Construction order is fixed: sockets are bound during negotiation, then
/// [`build_receive`](Self::build_receive), then
/// [`bridge_into`](Self::bridge_into), then [`activate`](Self::activate).
/// [`teardown`](Self::teardown) reverses it.
#[derive(Debug)]
pub struct RemotePeer {
    id: PeerId,
    control_addr: SocketAddr,
    address: IpAddr,
    caps: Capabilities,
    recv_ports: PortQuad,
    send_ports: SendPorts,
    sockets: Option<FlowSockets>,
    stream: TcpStream,
    receive: Option<GraphId>,
    bridge: Option<Bridge>,
    /// Session-node endpoint currently feeding each depayloader.
    linked: HashMap<Medium, Endpoint>,
    state: RemoteState,
}

impl RemotePeer {
    pub fn new(negotiated: Negotiated) -> Self {
        let Negotiated {
            id,
            remote,
            sockets,
            stream,
            ..
        } = negotiated;
        Self {
            id,
            control_addr: remote.control_addr(),
            address: remote.address,
            caps: remote.caps,
            recv_ports: sockets.ports(),
            send_ports: SendPorts::new(remote.recv_ports, remote.report_ports),
            sockets: Some(sockets),
            stream,
            receive: None,
            bridge: None,
            linked: HashMap::new(),
            state: RemoteState::Negotiated,
        }
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn control_addr(&self) -> SocketAddr {
        self.control_addr
    }

    pub fn target(&self) -> SendTarget {
        SendTarget {
            address: self.address,
            ports: self.send_ports,
        }
    }

    pub fn info(&self) -> PeerInfo {
        PeerInfo {
            id: self.id,
            control_addr: self.control_addr,
            address: self.address,
            caps: self.caps.clone(),
            recv_ports: self.recv_ports,
            send_ports: self.send_ports,
            state: self.state,
        }
    }

    pub fn receive_graph(&self) -> Option<GraphId> {
        self.receive
    }

    /// Every graph this peer owns: its receive pipeline and its playback bins.
    pub fn graphs(&self) -> Vec<GraphId> {
        let mut graphs: Vec<GraphId> = self.receive.into_iter().collect();
        if let Some(bridge) = &self.bridge {
            graphs.extend(bridge.graphs());
        }
        graphs
    }

    fn node(&self, role: &str) -> String {
        format!("recv-{role}-{}", self.id)
    }

    pub fn rtpbin_name(&self) -> String {
        self.node("rtpbin")
    }

    fn depay_name(&self, medium: Medium) -> String {
        self.node(&format!("{medium}-depay"))
    }

    /// Name of the node sending our receiver reports for `medium`.
    pub fn rr_sink_name(&self, medium: Medium) -> String {
        self.node(&format!("{medium}-rr-sink"))
    }

    /// Build the receive graph on the sockets bound during negotiation.
    ///
    /// The decoded-stream endpoints of the session node only appear once
    /// traffic arrives; see [`link_endpoint`](Self::link_endpoint).
    pub fn build_receive(&mut self, engine: &mut dyn MediaEngine, media: &MediaConfig) -> Result<GraphId> {
        assert!(
            self.recv_ports.all_valid(),
            "receive graph for peer {} built with unbound ports {:?}",
            self.id,
            self.recv_ports
        );
        let sockets = self.sockets.as_ref().ok_or(Error::PeerNotFound(self.id))?;

        let graph = engine.create_graph(&format!("recv-{}", self.id), GraphKind::Pipeline)?;
        let rtpbin = self.rtpbin_name();
        let mut b = GraphBuilder::new(engine, graph);
        b.add(
            NodeSpec::new(rtpbin.as_str(), NodeKind::RtpSession)
                .prop("latency", Prop::UInt(media.rtp_latency_ms.into()))
                .prop("drop-on-latency", Prop::Bool(true)),
        );

        for medium in Medium::ALL {
            let session = medium.session();
            let rtp_src = self.node(&format!("{medium}-rtp-src"));
            let rtcp_src = self.node(&format!("{medium}-rtcp-src"));
            let rr_sink = self.rr_sink_name(medium);
            let depay = self.depay_name(medium);
            let decoder = self.node(&format!("{medium}-decoder"));
            let bridge_sink = bridge::sink_name(medium, self.id);
            let rtcp_socket = sockets.rtcp(medium).socket();

            let (caps, depay_kind, decoder_kind) = match medium {
                Medium::Audio => (RTP_OPUS_CAPS, NodeKind::OpusDepayloader, NodeKind::OpusDecoder),
                Medium::Video => (RTP_JPEG_CAPS, NodeKind::JpegDepayloader, NodeKind::JpegDecoder),
            };
            let mut rtp = NodeSpec::new(rtp_src.as_str(), NodeKind::UdpSource)
                .prop("socket", Prop::Socket(sockets.rtp(medium).socket()))
                .prop("caps", Prop::Caps(caps.to_string()));
            if medium == Medium::Video {
                rtp = rtp.prop("buffer-size", Prop::Int(media.video_recv_buffer as i64));
            }

            // Receiver reports leave through the socket sender reports arrive
            // on, towards the port the sender advertised for them.
            let rr_dest = SocketAddr::new(self.address, self.send_ports.rr(medium));

            b.add(rtp)
                .add(NodeSpec::new(depay.as_str(), depay_kind))
                .add(NodeSpec::new(decoder.as_str(), decoder_kind))
                .add(NodeSpec::new(bridge_sink.as_str(), NodeKind::BridgeSink))
                .add(NodeSpec::new(rtcp_src.as_str(), NodeKind::UdpSource).prop("socket", Prop::Socket(rtcp_socket.clone())))
                .add(
                    NodeSpec::new(rr_sink.as_str(), NodeKind::UdpSink)
                        .prop("socket", Prop::Socket(rtcp_socket))
                        .prop("clients", Prop::Destinations(vec![rr_dest]))
                        .prop("sync", Prop::Bool(false))
                        .prop("async", Prop::Bool(false)),
                )
                .chain(&[depay.as_str(), decoder.as_str(), bridge_sink.as_str()])
                .link(
                    Endpoint::src(rtp_src.as_str()),
                    Endpoint::new(rtpbin.as_str(), format!("recv_rtp_sink_{session}")),
                )
                .link(
                    Endpoint::src(rtcp_src.as_str()),
                    Endpoint::new(rtpbin.as_str(), format!("recv_rtcp_sink_{session}")),
                )
                .link(
                    Endpoint::new(rtpbin.as_str(), format!("send_rtcp_src_{session}")),
                    Endpoint::sink(rr_sink.as_str()),
                );
        }

        self.receive = Some(graph);
        engine.use_system_clock(graph)?;
        tracing::debug!(peer = %self.id, %graph, ports = ?self.recv_ports, "receive graph built");
        Ok(graph)
    }

    /// Wire this peer's decoded output into the shared playback graph.
    pub fn bridge_into(
        &mut self,
        engine: &mut dyn MediaEngine,
        playback: &PlaybackGraph,
        video_sink: Option<NodeSpec>,
    ) -> Result<()> {
        self.bridge = Some(Bridge::connect(engine, playback, self.id, video_sink)?);
        Ok(())
    }

    /// Start the receive graph.
    pub fn activate(&mut self, engine: &mut dyn MediaEngine) -> Result<()> {
        let graph = self.receive.ok_or(Error::PeerNotFound(self.id))?;
        engine.set_state(graph, GraphState::Playing)?;
        self.state = RemoteState::Connected;
        Ok(())
    }

    /// Connect a newly exposed decoded-stream endpoint to its decode branch.
    ///
    /// The session number selects the branch. Anything outside the fixed
    /// audio/video numbering, or a payload type that does not belong to the
    /// medium, is a [`Error::ProtocolViolation`]. A new SSRC for a medium
    /// (the sender rebuilt its transmit graph) replaces the previous link.
    pub fn link_endpoint(
        &mut self,
        engine: &mut dyn MediaEngine,
        node: &str,
        endpoint: RtpSourceEndpoint,
    ) -> Result<()> {
        let medium = Medium::from_session(endpoint.session).ok_or_else(|| Error::ProtocolViolation {
            peer: self.id,
            reason: format!("stream {endpoint} uses unknown session {}", endpoint.session),
        })?;
        if endpoint.payload_type != medium.payload_type() {
            return Err(Error::ProtocolViolation {
                peer: self.id,
                reason: format!(
                    "{medium} stream {endpoint} has payload type {}, expected {}",
                    endpoint.payload_type,
                    medium.payload_type()
                ),
            });
        }
        let rtpbin = self.rtpbin_name();
        if node != rtpbin {
            tracing::debug!(peer = %self.id, %node, "endpoint on a node without a decode branch");
            return Ok(());
        }

        let src = Endpoint::new(rtpbin, endpoint.to_string());
        let dst = Endpoint::sink(self.depay_name(medium));
        if let Some(previous) = self.linked.get(&medium) {
            if *previous == src {
                return Ok(());
            }
            if let Err(e) = engine.unlink(previous, &dst) {
                tracing::debug!(peer = %self.id, endpoint = %previous, error = %e, "stale endpoint already gone");
            }
        }

        let graph = self.receive.ok_or(Error::PeerNotFound(self.id))?;
        GraphBuilder::new(engine, graph).link(src.clone(), dst);
        tracing::info!(peer = %self.id, %medium, ssrc = endpoint.ssrc, "media stream linked");
        self.linked.insert(medium, src);
        Ok(())
    }

    /// Release everything this peer holds, in order: receive graph, playback
    /// bins and mixer input, sockets, then the control stream (after a `bye`
    /// when `notify` is set).
    pub fn teardown(mut self, engine: &mut dyn MediaEngine, playback: &PlaybackGraph, notify: bool) {
        if let Some(graph) = self.receive.take() {
            destroy(engine, graph);
        }
        if let Some(mut bridge) = self.bridge.take() {
            bridge.disconnect(engine, playback);
        }
        drop(self.sockets.take());

        if notify {
            if let Err(e) = write_message(&mut self.stream, &ControlMessage::Bye) {
                tracing::debug!(peer = %self.id, error = %e, "bye not delivered");
            }
            let _ = self.stream.flush();
        }
        let _ = self.stream.shutdown(Shutdown::Both);
        tracing::debug!(peer = %self.id, control = %self.control_addr, "peer torn down");
    }
}
