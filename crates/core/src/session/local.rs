use std::net::IpAddr;

use crate::config::MediaConfig;
use crate::error::{Error, Result};
use crate::graph::{Endpoint, GraphBuilder, GraphId, GraphKind, GraphState, MediaEngine, NodeKind, NodeSpec, Prop};
use crate::media::{Medium, VIDEO_CAPS};
use crate::session::{LocalState, ReportPorts, SendTarget};
use crate::transport::{BoundSocket, Flow, PortAllocator};

const PLAYBACK_MIXER: &str = "playback-mixer";
const PLAYBACK_OUTPUT: &str = "playback-audio-output";
const TRANSMIT_RTPBIN: &str = "transmit-rtpbin";

/// Name of the transmit graph's RTP sink for `medium`.
pub fn rtp_sink_name(medium: Medium) -> String {
    format!("{medium}-rtp-sink")
}

/// Name of the transmit graph's RTCP sender-report sink for `medium`.
pub fn rtcp_sink_name(medium: Medium) -> String {
    format!("{medium}-rtcp-sink")
}

/// The shared playback graph: an audio mixer feeding the audio output.
///
/// Built once, before any remote peer exists, with the system clock and a
/// zero time origin. Per-peer bins are attached to it by the bridge and
/// removed again without ever changing its state.
#[derive(Debug)]
pub struct PlaybackGraph {
    graph: GraphId,
}

impl PlaybackGraph {
    pub fn build(engine: &mut dyn MediaEngine, media: &MediaConfig) -> Result<Self> {
        let graph = engine.create_graph("playback", GraphKind::Pipeline)?;
        GraphBuilder::new(engine, graph)
            .add(NodeSpec::new(PLAYBACK_MIXER, NodeKind::AudioMixer))
            .add(
                NodeSpec::new(PLAYBACK_OUTPUT, NodeKind::AudioOutput)
                    .prop("buffer-time", Prop::Int(media.audio_buffer_time_us)),
            )
            .chain(&[PLAYBACK_MIXER, PLAYBACK_OUTPUT]);

        engine.use_system_clock(graph)?;
        engine.set_state(graph, GraphState::Playing)?;
        tracing::debug!(%graph, "playback graph running");
        Ok(Self { graph })
    }

    pub fn graph(&self) -> GraphId {
        self.graph
    }

    pub fn mixer(&self) -> &'static str {
        PLAYBACK_MIXER
    }
}

/// The local peer's session: state flags, shared report sockets, the
/// playback graph and the (re)buildable transmit graph.
pub struct LocalSession {
    state: LocalState,
    media: MediaConfig,
    video_device: Option<String>,
    audio_report: BoundSocket,
    video_report: BoundSocket,
    playback: PlaybackGraph,
    transmit: Option<GraphId>,
}

impl LocalSession {
    /// Bind the report sockets and start playback. Leaves the session READY.
    pub fn new(
        engine: &mut dyn MediaEngine,
        allocator: &PortAllocator,
        address: IpAddr,
        media: &MediaConfig,
        video_device: Option<String>,
    ) -> Result<Self> {
        let audio_report = allocator.bind_flow(address, None, Flow::AudioRtcp)?;
        let video_report = allocator.bind_flow(address, None, Flow::VideoRtcp)?;
        let playback = PlaybackGraph::build(engine, media)?;

        let mut state = LocalState::NULL;
        state.insert(LocalState::READY);
        Ok(Self {
            state,
            media: media.clone(),
            video_device,
            audio_report,
            video_report,
            playback,
            transmit: None,
        })
    }

    pub fn state(&self) -> LocalState {
        self.state
    }

    pub fn playback(&self) -> &PlaybackGraph {
        &self.playback
    }

    pub fn transmit_graph(&self) -> Option<GraphId> {
        self.transmit
    }

    pub fn report_ports(&self) -> ReportPorts {
        ReportPorts {
            audio: self.audio_report.port(),
            video: self.video_report.port(),
        }
    }

    fn report(&self, medium: Medium) -> &BoundSocket {
        match medium {
            Medium::Audio => &self.audio_report,
            Medium::Video => &self.video_report,
        }
    }

    /// Build the transmit graph addressed to `targets` and start it.
    ///
    /// A no-op while STARTED with a live graph. From READY the graph is
    /// (re)built from scratch. Fails from NULL.
    pub fn setup_transmit(&mut self, engine: &mut dyn MediaEngine, targets: &[SendTarget]) -> Result<GraphId> {
        if !self.state.contains(LocalState::READY) {
            return Err(Error::InvalidState {
                operation: "setup_transmit",
                state: self.state,
            });
        }
        if let Some(graph) = self.transmit
            && self.state.contains(LocalState::STARTED)
        {
            return Ok(graph);
        }
        if let Some(stale) = self.transmit.take() {
            destroy(engine, stale);
        }

        let graph = engine.create_graph("transmit", GraphKind::Pipeline)?;
        if let Err(e) = self.build_transmit(engine, graph, targets) {
            destroy(engine, graph);
            return Err(e);
        }

        self.transmit = Some(graph);
        self.state.insert(LocalState::STARTED);
        tracing::info!(%graph, peers = targets.len(), state = %self.state, "transmitting");
        Ok(graph)
    }

    fn build_transmit(&self, engine: &mut dyn MediaEngine, graph: GraphId, targets: &[SendTarget]) -> Result<()> {
        let media = &self.media;
        let mut b = GraphBuilder::new(engine, graph);
        b.add(
            NodeSpec::new(TRANSMIT_RTPBIN, NodeKind::RtpSession)
                .prop("latency", Prop::UInt(media.rtp_latency_ms.into())),
        );

        // Capture and encode.
        b.add(
            NodeSpec::new("audio-capture", NodeKind::AudioCapture)
                .prop("latency-time", Prop::Int(media.audio_latency_time_us))
                .prop("provide-clock", Prop::Bool(false)),
        )
        .add(
            NodeSpec::new("audio-capture-caps", NodeKind::CapsFilter)
                .prop("caps", Prop::Caps(media.raw_audio_caps.clone())),
        )
        .add(
            NodeSpec::new("audio-encoder", NodeKind::OpusEncoder)
                .prop("frame-size", Prop::Int(media.opus_frame_size_ms.into())),
        )
        .add(NodeSpec::new("audio-payloader", NodeKind::OpusPayloader))
        .chain(&["audio-capture", "audio-capture-caps", "audio-encoder", "audio-payloader"]);

        match &self.video_device {
            Some(device) => {
                b.add(NodeSpec::new(
                    "video-capture",
                    NodeKind::VideoCapture {
                        device: device.clone(),
                    },
                ))
                .add(
                    NodeSpec::new("video-capture-caps", NodeKind::CapsFilter)
                        .prop("caps", Prop::Caps(VIDEO_CAPS.to_string())),
                )
                .add(NodeSpec::new("video-encoder", NodeKind::Queue));
            }
            None => {
                b.add(
                    NodeSpec::new("video-capture", NodeKind::TestVideoSource)
                        .prop("is-live", Prop::Bool(true)),
                )
                .add(
                    NodeSpec::new("video-capture-caps", NodeKind::CapsFilter)
                        .prop("caps", Prop::Caps(media.raw_video_caps.clone())),
                )
                .add(
                    NodeSpec::new("video-encoder", NodeKind::JpegEncoder)
                        .prop("quality", Prop::Int(media.jpeg_quality.into())),
                );
            }
        }
        b.add(NodeSpec::new("video-payloader", NodeKind::JpegPayloader))
            .chain(&["video-capture", "video-capture-caps", "video-encoder", "video-payloader"]);

        // Per medium: RTP out, RTCP SR out and RTCP RR in, all through the
        // shared RTP session node. SR and RR share the report socket.
        for medium in Medium::ALL {
            let session = medium.session();
            let rtp_queue = format!("{medium}-rtp-queue");
            let rtp_sink = rtp_sink_name(medium);
            let rtcp_queue = format!("{medium}-rtcp-queue");
            let rtcp_sink = rtcp_sink_name(medium);
            let rr_source = format!("{medium}-rr-source");
            let report = self.report(medium).socket();

            let mut rtp = NodeSpec::new(rtp_sink.as_str(), NodeKind::UdpSink)
                .prop("clients", Prop::Destinations(targets.iter().map(|t| t.rtp(medium)).collect()));
            if medium == Medium::Video {
                rtp = rtp.prop("buffer-size", Prop::Int(media.video_send_buffer as i64));
            }

            b.add(NodeSpec::new(rtp_queue.as_str(), NodeKind::Queue))
                .add(rtp)
                .add(NodeSpec::new(rtcp_queue.as_str(), NodeKind::Queue))
                .add(
                    NodeSpec::new(rtcp_sink.as_str(), NodeKind::UdpSink)
                        .prop("socket", Prop::Socket(report.clone()))
                        .prop("clients", Prop::Destinations(targets.iter().map(|t| t.rtcp(medium)).collect()))
                        .prop("sync", Prop::Bool(false))
                        .prop("async", Prop::Bool(false)),
                )
                .add(NodeSpec::new(rr_source.as_str(), NodeKind::UdpSource).prop("socket", Prop::Socket(report)))
                .link(
                    Endpoint::src(format!("{medium}-payloader")),
                    Endpoint::new(TRANSMIT_RTPBIN, format!("send_rtp_sink_{session}")),
                )
                .link(
                    Endpoint::new(TRANSMIT_RTPBIN, format!("send_rtp_src_{session}")),
                    Endpoint::sink(rtp_queue.as_str()),
                )
                .chain(&[rtp_queue.as_str(), rtp_sink.as_str()])
                .link(
                    Endpoint::new(TRANSMIT_RTPBIN, format!("send_rtcp_src_{session}")),
                    Endpoint::sink(rtcp_queue.as_str()),
                )
                .chain(&[rtcp_queue.as_str(), rtcp_sink.as_str()])
                .link(
                    Endpoint::src(rr_source.as_str()),
                    Endpoint::new(TRANSMIT_RTPBIN, format!("recv_rtcp_sink_{session}")),
                );
        }

        engine.use_system_clock(graph)?;
        engine.set_state(graph, GraphState::Playing)
    }

    /// Start sending to one more peer on the running transmit graph.
    pub fn add_target(&mut self, engine: &mut dyn MediaEngine, target: &SendTarget) -> Result<()> {
        if self.transmit.is_none() {
            return Err(Error::InvalidState {
                operation: "add_target",
                state: self.state,
            });
        }
        for medium in Medium::ALL {
            engine.add_destination(&rtp_sink_name(medium), target.rtp(medium))?;
            engine.add_destination(&rtcp_sink_name(medium), target.rtcp(medium))?;
        }
        tracing::debug!(peer = %target.address, "transmit destination added");
        Ok(())
    }

    /// Stop sending to a peer. Harmless when not transmitting.
    pub fn remove_target(&mut self, engine: &mut dyn MediaEngine, target: &SendTarget) {
        if self.transmit.is_none() {
            return;
        }
        for medium in Medium::ALL {
            for (sink, dest) in [
                (rtp_sink_name(medium), target.rtp(medium)),
                (rtcp_sink_name(medium), target.rtcp(medium)),
            ] {
                if let Err(e) = engine.remove_destination(&sink, dest) {
                    tracing::warn!(node = %sink, %dest, error = %e, "cannot remove destination");
                }
            }
        }
    }

    /// Tear the transmit graph down and drop back to READY.
    pub fn stop_transmit(&mut self, engine: &mut dyn MediaEngine) {
        if let Some(graph) = self.transmit.take() {
            destroy(engine, graph);
            tracing::info!(%graph, "transmit stopped");
        }
        self.state.remove(LocalState::STARTED);
    }

    /// Stop everything. The session is NULL afterwards.
    pub fn shutdown(&mut self, engine: &mut dyn MediaEngine) {
        self.stop_transmit(engine);
        destroy(engine, self.playback.graph);
        self.state = LocalState::NULL;
    }
}

/// Stop and drop a graph, logging instead of failing.
pub(crate) fn destroy(engine: &mut dyn MediaEngine, graph: GraphId) {
    if let Err(e) = engine.set_state(graph, GraphState::Null) {
        tracing::warn!(%graph, error = %e, "cannot stop graph");
    }
    if let Err(e) = engine.destroy_graph(graph) {
        tracing::warn!(%graph, error = %e, "cannot destroy graph");
    }
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, SocketAddr};

    use super::*;
    use crate::graph::RecordingEngine;
    use crate::session::SendPorts;

    const LOOPBACK: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    fn session(engine: &mut RecordingEngine, device: Option<String>) -> LocalSession {
        let allocator = PortAllocator::new(&MediaConfig::default());
        LocalSession::new(engine, &allocator, LOOPBACK, &MediaConfig::default(), device).unwrap()
    }

    fn target(last: u8, base: u16) -> SendTarget {
        SendTarget {
            address: IpAddr::V4(Ipv4Addr::new(10, 0, 0, last)),
            ports: SendPorts {
                audio_rtp: base,
                audio_rtcp: base + 1,
                audio_rr: base + 2,
                video_rtp: base + 3,
                video_rtcp: base + 4,
                video_rr: base + 5,
            },
        }
    }

    #[test]
    fn playback_runs_on_the_system_clock() {
        let mut engine = RecordingEngine::new();
        let local = session(&mut engine, None);
        let record = engine.graph(local.playback().graph()).unwrap();
        assert_eq!(record.state, GraphState::Playing);
        assert!(record.system_clock);
        assert!(engine.is_linked(&Endpoint::src(PLAYBACK_MIXER), &Endpoint::sink(PLAYBACK_OUTPUT)));
        assert_eq!(local.state(), LocalState::READY);
    }

    #[test]
    fn transmit_targets_every_peer() {
        let mut engine = RecordingEngine::new();
        let mut local = session(&mut engine, None);
        let (a, b) = (target(2, 6000), target(3, 7000));

        let graph = local.setup_transmit(&mut engine, &[a, b]).unwrap();
        assert!(local.state().contains(LocalState::STARTED));
        assert!(local.state().contains(LocalState::READY));
        assert!(engine.graph(graph).unwrap().system_clock);

        let dests = engine.destinations("audio-rtp-sink");
        assert_eq!(dests, vec![a.rtp(Medium::Audio), b.rtp(Medium::Audio)]);
        let sr: Vec<SocketAddr> = engine.destinations("video-rtcp-sink");
        assert_eq!(sr, vec![a.rtcp(Medium::Video), b.rtcp(Medium::Video)]);

        // SR sink and RR source share the advertised report socket.
        let sink = engine.node("audio-rtcp-sink").unwrap();
        let source = engine.node("audio-rr-source").unwrap();
        assert_eq!(sink.spec.get("socket"), source.spec.get("socket"));
        assert_eq!(
            source.spec.get("socket").and_then(Prop::socket_port),
            Some(local.report_ports().audio)
        );
    }

    #[test]
    fn test_pattern_without_device() {
        let mut engine = RecordingEngine::new();
        let mut local = session(&mut engine, None);
        local.setup_transmit(&mut engine, &[target(2, 6000)]).unwrap();
        assert_eq!(engine.node("video-capture").unwrap().spec.kind, NodeKind::TestVideoSource);
        assert_eq!(engine.node("video-encoder").unwrap().spec.kind, NodeKind::JpegEncoder);

        let mut engine = RecordingEngine::new();
        let mut local = session(&mut engine, Some("/dev/video0".into()));
        local.setup_transmit(&mut engine, &[target(2, 6000)]).unwrap();
        assert_eq!(
            engine.node("video-capture").unwrap().spec.kind,
            NodeKind::VideoCapture {
                device: "/dev/video0".into()
            }
        );
    }

    #[test]
    fn setup_is_idempotent_while_started() {
        let mut engine = RecordingEngine::new();
        let mut local = session(&mut engine, None);
        let first = local.setup_transmit(&mut engine, &[target(2, 6000)]).unwrap();
        let again = local.setup_transmit(&mut engine, &[target(2, 6000)]).unwrap();
        assert_eq!(first, again);
    }

    #[test]
    fn rebuild_after_stop() {
        let mut engine = RecordingEngine::new();
        let mut local = session(&mut engine, None);
        let first = local.setup_transmit(&mut engine, &[target(2, 6000)]).unwrap();
        local.stop_transmit(&mut engine);
        assert_eq!(local.state(), LocalState::READY);
        assert!(engine.graph(first).is_none());

        let second = local.setup_transmit(&mut engine, &[target(3, 7000)]).unwrap();
        assert_ne!(first, second);
        assert_eq!(engine.destinations("audio-rtp-sink"), vec![target(3, 7000).rtp(Medium::Audio)]);
    }

    #[test]
    fn destinations_follow_peers() {
        let mut engine = RecordingEngine::new();
        let mut local = session(&mut engine, None);
        let (a, b) = (target(2, 6000), target(3, 7000));
        assert!(local.add_target(&mut engine, &a).is_err());

        local.setup_transmit(&mut engine, &[a]).unwrap();
        local.add_target(&mut engine, &b).unwrap();
        local.remove_target(&mut engine, &a);
        assert_eq!(engine.destinations("video-rtp-sink"), vec![b.rtp(Medium::Video)]);
        assert_eq!(engine.destinations("audio-rtcp-sink"), vec![b.rtcp(Medium::Audio)]);
    }

    #[test]
    fn null_session_refuses_transmit() {
        let mut engine = RecordingEngine::new();
        let mut local = session(&mut engine, None);
        local.shutdown(&mut engine);
        assert!(local.state().is_null());
        assert!(matches!(
            local.setup_transmit(&mut engine, &[target(2, 6000)]),
            Err(Error::InvalidState { .. })
        ));
        assert_eq!(engine.graph_count(), 0);
    }
}
