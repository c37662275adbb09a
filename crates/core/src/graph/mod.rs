//! Declarative boundary to the media-graph execution engine.
//!
//! The core never touches media data. It describes graphs of typed
//! processing nodes, connects their stream endpoints, asks the engine to
//! move graphs between lifecycle states, and reacts to two kinds of
//! asynchronous [`GraphEvent`]s:
//!
//! - [`GraphEvent::ProcessingError`]: a node failed while running.
//! - [`GraphEvent::EndpointAppeared`]: an RTP session node exposed a decoded
//!   stream endpoint because packets for that session started to arrive.
//!
//! ## Graph shapes built by the core
//!
//! ```text
//! transmit:  capture ! encode ! pay ! rtpsession ! udpsink (RTP, every peer)
//!                                      rtpsession ! udpsink (RTCP SR, every peer)
//!                            udpsrc (RTCP RR) ! rtpsession
//!
//! receive:   udpsrc (RTP)  ! rtpsession ~> depay ! decode ! bridge-sink
//!            udpsrc (RTCP) ! rtpsession ! udpsink (RTCP RR, same socket)
//!
//! playback:  [bridge-source] ! mixer ! audio-output
//!            [bridge-source ! video-output]           (one bin per peer)
//! ```
//!
//! `~>` marks the dynamic link made on [`GraphEvent::EndpointAppeared`].
//! Implementations: [`memory::RecordingEngine`] (in-process, records calls)
//! and the GStreamer adapter in the `meshcall-gst` crate.

pub mod memory;

use std::fmt;
use std::net::{SocketAddr, UdpSocket};
use std::str::FromStr;
use std::sync::Arc;

use crate::error::{Error, Result};

pub use memory::RecordingEngine;

/// Engine-assigned identifier of a pipeline or bin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GraphId(pub u64);

impl fmt::Display for GraphId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "graph#{}", self.0)
    }
}

/// Top-level pipeline (owns a clock and a bus) or a bin nested inside one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphKind {
    Pipeline,
    Bin,
}

/// Lifecycle state of a graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum GraphState {
    Null,
    Ready,
    Paused,
    Playing,
}

/// Typed processing node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeKind {
    /// RTP session manager multiplexing sessions 0 (audio) and 1 (video).
    RtpSession,
    UdpSource,
    /// UDP sink with a dynamic list of destinations.
    UdpSink,
    Queue,
    CapsFilter,
    AudioCapture,
    VideoCapture { device: String },
    TestVideoSource,
    OpusEncoder,
    OpusDecoder,
    OpusPayloader,
    OpusDepayloader,
    JpegEncoder,
    JpegDecoder,
    JpegPayloader,
    JpegDepayloader,
    AudioMixer,
    AudioOutput,
    VideoOutput,
    /// Producer half of a cross-graph bridge, lives in the receive graph.
    BridgeSink,
    /// Consumer half of a cross-graph bridge, lives in the playback graph.
    BridgeSource,
    /// Engine-specific node chosen by the caller (e.g. a custom video sink).
    Custom(String),
}

/// Node parameter value.
#[derive(Debug, Clone)]
pub enum Prop {
    Bool(bool),
    Int(i64),
    UInt(u64),
    Str(String),
    /// Capability descriptor string.
    Caps(String),
    /// Pre-bound socket the node must use instead of binding its own.
    Socket(Arc<UdpSocket>),
    /// Initial destinations of a [`NodeKind::UdpSink`].
    Destinations(Vec<SocketAddr>),
    /// Name of the [`NodeKind::BridgeSink`] a [`NodeKind::BridgeSource`] pulls from.
    BridgePeer(String),
}

impl Prop {
    /// Local port of a [`Prop::Socket`], for diagnostics and tests.
    pub fn socket_port(&self) -> Option<u16> {
        match self {
            Prop::Socket(socket) => socket.local_addr().ok().map(|a| a.port()),
            _ => None,
        }
    }
}

impl PartialEq for Prop {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Prop::Bool(a), Prop::Bool(b)) => a == b,
            (Prop::Int(a), Prop::Int(b)) => a == b,
            (Prop::UInt(a), Prop::UInt(b)) => a == b,
            (Prop::Str(a), Prop::Str(b)) | (Prop::Caps(a), Prop::Caps(b)) => a == b,
            (Prop::Socket(a), Prop::Socket(b)) => Arc::ptr_eq(a, b),
            (Prop::Destinations(a), Prop::Destinations(b)) => a == b,
            (Prop::BridgePeer(a), Prop::BridgePeer(b)) => a == b,
            _ => false,
        }
    }
}

/// A node to add to a graph. Names are unique across the whole engine.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeSpec {
    pub name: String,
    pub kind: NodeKind,
    pub props: Vec<(&'static str, Prop)>,
}

impl NodeSpec {
    pub fn new(name: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            name: name.into(),
            kind,
            props: Vec::new(),
        }
    }

    pub fn prop(mut self, key: &'static str, value: Prop) -> Self {
        self.props.push((key, value));
        self
    }

    pub fn get(&self, key: &str) -> Option<&Prop> {
        self.props.iter().find(|(k, _)| *k == key).map(|(_, v)| v)
    }
}

/// A stream connection point: `node:pad`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub node: String,
    pub pad: String,
}

impl Endpoint {
    pub fn new(node: impl Into<String>, pad: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            pad: pad.into(),
        }
    }

    pub fn src(node: impl Into<String>) -> Self {
        Self::new(node, "src")
    }

    pub fn sink(node: impl Into<String>) -> Self {
        Self::new(node, "sink")
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.node, self.pad)
    }
}

/// Decoded-stream endpoint exposed by an RTP session node once traffic for a
/// session arrives. Engines name it `recv_rtp_src_<session>_<ssrc>_<pt>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RtpSourceEndpoint {
    pub session: u32,
    pub ssrc: u32,
    pub payload_type: u8,
}

const RTP_SOURCE_PREFIX: &str = "recv_rtp_src_";

impl fmt::Display for RtpSourceEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{RTP_SOURCE_PREFIX}{}_{}_{}",
            self.session, self.ssrc, self.payload_type
        )
    }
}

impl FromStr for RtpSourceEndpoint {
    type Err = Error;

    fn from_str(name: &str) -> Result<Self> {
        let invalid = || Error::Engine(format!("not an RTP source endpoint: {name}"));
        let rest = name.strip_prefix(RTP_SOURCE_PREFIX).ok_or_else(invalid)?;
        let mut parts = rest.split('_');
        let session = parts.next().and_then(|s| s.parse().ok()).ok_or_else(invalid)?;
        let ssrc = parts.next().and_then(|s| s.parse().ok()).ok_or_else(invalid)?;
        let payload_type = parts.next().and_then(|s| s.parse().ok()).ok_or_else(invalid)?;
        if parts.next().is_some() {
            return Err(invalid());
        }
        Ok(Self {
            session,
            ssrc,
            payload_type,
        })
    }
}

/// Asynchronous notification from the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum GraphEvent {
    /// A node of `graph` failed; the graph no longer processes data.
    ProcessingError {
        graph: GraphId,
        node: String,
        message: String,
        debug: Option<String>,
    },
    /// `node` of `graph` exposed a new decoded-stream endpoint.
    EndpointAppeared {
        graph: GraphId,
        node: String,
        endpoint: RtpSourceEndpoint,
    },
}

impl GraphEvent {
    pub fn graph(&self) -> GraphId {
        match self {
            GraphEvent::ProcessingError { graph, .. } | GraphEvent::EndpointAppeared { graph, .. } => {
                *graph
            }
        }
    }
}

/// Callback through which an engine delivers [`GraphEvent`]s. May be called
/// from any engine thread.
pub type GraphEventSink = Arc<dyn Fn(GraphEvent) + Send + Sync>;

/// Media-graph execution engine.
///
/// All calls are made from the single reactor thread. Graph execution
/// itself is scheduled by the engine and is opaque to the core.
pub trait MediaEngine: Send {
    /// Install the callback for asynchronous events. Called once, before any graph exists.
    fn set_event_sink(&mut self, sink: GraphEventSink);

    fn create_graph(&mut self, name: &str, kind: GraphKind) -> Result<GraphId>;

    fn add_node(&mut self, graph: GraphId, node: NodeSpec) -> Result<()>;

    /// Connect two endpoints. The nodes may live in different bins of one pipeline.
    fn link(&mut self, src: &Endpoint, dst: &Endpoint) -> Result<()>;

    fn unlink(&mut self, src: &Endpoint, dst: &Endpoint) -> Result<()>;

    /// Select the system clock and pin the graph's time origin to zero so that
    /// every graph started by this process reports comparable timestamps.
    fn use_system_clock(&mut self, graph: GraphId) -> Result<()>;

    fn set_state(&mut self, graph: GraphId, state: GraphState) -> Result<()>;

    /// Request a new endpoint from a template such as `sink_%u`. Returns its name.
    fn request_endpoint(&mut self, node: &str, template: &str) -> Result<String>;

    fn release_endpoint(&mut self, node: &str, endpoint: &str) -> Result<()>;

    /// Add a destination to a running [`NodeKind::UdpSink`].
    fn add_destination(&mut self, node: &str, dest: SocketAddr) -> Result<()>;

    fn remove_destination(&mut self, node: &str, dest: SocketAddr) -> Result<()>;

    /// Nest `child` (a bin) inside `parent`. The child keeps its own state
    /// until [`set_state`](Self::set_state) is called on it.
    fn attach(&mut self, parent: GraphId, child: GraphId) -> Result<()>;

    fn detach(&mut self, parent: GraphId, child: GraphId) -> Result<()>;

    /// Stop and drop a graph with all its nodes, releasing any sockets they hold.
    fn destroy_graph(&mut self, graph: GraphId) -> Result<()>;
}

/// Thin helper around a [`MediaEngine`] for building one graph.
///
/// Failure to add or link nodes whose shapes are fixed by this crate is a
/// contract breach, not a runtime condition, so those calls panic.
pub struct GraphBuilder<'a> {
    engine: &'a mut dyn MediaEngine,
    graph: GraphId,
}

impl<'a> GraphBuilder<'a> {
    pub fn new(engine: &'a mut dyn MediaEngine, graph: GraphId) -> Self {
        Self { engine, graph }
    }

    pub fn graph(&self) -> GraphId {
        self.graph
    }

    pub fn add(&mut self, node: NodeSpec) -> &mut Self {
        let name = node.name.clone();
        if let Err(e) = self.engine.add_node(self.graph, node) {
            panic!("cannot add node {name} to {}: {e}", self.graph);
        }
        self
    }

    /// Link `src:src` to `dst:sink` for each consecutive pair.
    pub fn chain(&mut self, names: &[&str]) -> &mut Self {
        for pair in names.windows(2) {
            self.link(Endpoint::src(pair[0]), Endpoint::sink(pair[1]));
        }
        self
    }

    pub fn link(&mut self, src: Endpoint, dst: Endpoint) -> &mut Self {
        if let Err(e) = self.engine.link(&src, &dst) {
            panic!("cannot link {src} -> {dst}: {e}");
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_rtp_source_endpoint() {
        let ep: RtpSourceEndpoint = "recv_rtp_src_1_3735928559_26".parse().unwrap();
        assert_eq!(ep.session, 1);
        assert_eq!(ep.ssrc, 0xDEAD_BEEF);
        assert_eq!(ep.payload_type, 26);
        assert_eq!(ep.to_string(), "recv_rtp_src_1_3735928559_26");
    }

    #[test]
    fn parse_rejects_other_endpoints() {
        assert!("send_rtp_src_0".parse::<RtpSourceEndpoint>().is_err());
        assert!("recv_rtp_src_0_12".parse::<RtpSourceEndpoint>().is_err());
        assert!("recv_rtp_src_0_12_96_7".parse::<RtpSourceEndpoint>().is_err());
        assert!("recv_rtp_src_x_12_96".parse::<RtpSourceEndpoint>().is_err());
    }

    #[test]
    fn node_spec_props() {
        let spec = NodeSpec::new("q", NodeKind::Queue)
            .prop("sync", Prop::Bool(false))
            .prop("caps", Prop::Caps("audio/x-raw".into()));
        assert_eq!(spec.get("sync"), Some(&Prop::Bool(false)));
        assert!(spec.get("missing").is_none());
    }
}
