use std::collections::HashMap;
use std::fmt::Display;
use std::net::{SocketAddr, UdpSocket};
use std::os::fd::OwnedFd;
use std::str::FromStr;
use std::sync::Arc;

use gst::prelude::*;
use parking_lot::Mutex;

use meshcall::graph::{
    Endpoint, GraphEvent, GraphEventSink, GraphId, GraphKind, GraphState, MediaEngine, NodeKind,
    NodeSpec, Prop, RtpSourceEndpoint,
};
use meshcall::{Error, Result};

fn factory(kind: &NodeKind) -> &str {
    match kind {
        NodeKind::RtpSession => "rtpbin",
        NodeKind::UdpSource => "udpsrc",
        NodeKind::UdpSink => "multiudpsink",
        NodeKind::Queue => "queue",
        NodeKind::CapsFilter => "capsfilter",
        NodeKind::AudioCapture => "pulsesrc",
        NodeKind::VideoCapture { .. } => "v4l2src",
        NodeKind::TestVideoSource => "videotestsrc",
        NodeKind::OpusEncoder => "opusenc",
        NodeKind::OpusDecoder => "opusdec",
        NodeKind::OpusPayloader => "rtpopuspay",
        NodeKind::OpusDepayloader => "rtpopusdepay",
        NodeKind::JpegEncoder => "jpegenc",
        NodeKind::JpegDecoder => "jpegdec",
        NodeKind::JpegPayloader => "rtpjpegpay",
        NodeKind::JpegDepayloader => "rtpjpegdepay",
        NodeKind::AudioMixer => "audiomixer",
        NodeKind::AudioOutput => "pulsesink",
        NodeKind::VideoOutput => "glimagesink",
        NodeKind::BridgeSink => "proxysink",
        NodeKind::BridgeSource => "proxysrc",
        NodeKind::Custom(factory) => factory.as_str(),
    }
}

fn fail(context: impl Display) -> Error {
    Error::Engine(context.to_string())
}

/// State shared with GStreamer streaming and bus threads.
#[derive(Default)]
struct Shared {
    sink: Option<GraphEventSink>,
    /// Graph names, for attributing bus errors to the innermost graph.
    graphs: HashMap<String, GraphId>,
    /// Dynamic session pads held blocked until the core links them.
    blocked: HashMap<(String, String), gst::PadProbeId>,
}

fn emit(shared: &Mutex<Shared>, event: GraphEvent) {
    let sink = shared.lock().sink.clone();
    match sink {
        Some(sink) => sink(event),
        None => tracing::warn!(?event, "graph event dropped, no sink installed"),
    }
}

/// Walk up from the failing element to the first registered graph.
fn attribute(shared: &Mutex<Shared>, src: Option<&gst::Object>, pipeline: GraphId) -> GraphId {
    let shared = shared.lock();
    let mut current = src.and_then(|s| s.parent());
    while let Some(object) = current {
        if let Some(id) = shared.graphs.get(object.name().as_str()) {
            return *id;
        }
        current = object.parent();
    }
    pipeline
}

/// Duplicate a bound socket into a `GSocket` the element may close freely.
fn gio_socket(socket: &UdpSocket) -> Result<gio::Socket> {
    let fd = OwnedFd::from(socket.try_clone()?);
    // SAFETY: `fd` is a fresh duplicate owned solely by the new GSocket.
    let socket = unsafe { gio::Socket::from_fd(fd) };
    socket.map_err(fail)
}

/// [`MediaEngine`] backed by GStreamer pipelines.
pub struct GstEngine {
    next_graph: u64,
    graphs: HashMap<GraphId, gst::Bin>,
    nodes: HashMap<String, (GraphId, gst::Element)>,
    shared: Arc<Mutex<Shared>>,
}

impl GstEngine {
    /// Initialise GStreamer. Safe to call more than once per process.
    pub fn new() -> Result<Self> {
        gst::init().map_err(fail)?;
        let (major, minor, micro, _) = gst::version();
        tracing::info!(version = %format!("{major}.{minor}.{micro}"), "GStreamer initialised");
        Ok(Self {
            next_graph: 0,
            graphs: HashMap::new(),
            nodes: HashMap::new(),
            shared: Arc::new(Mutex::new(Shared::default())),
        })
    }

    fn graph(&self, id: GraphId) -> Result<&gst::Bin> {
        self.graphs.get(&id).ok_or_else(|| fail(format!("unknown {id}")))
    }

    fn element(&self, name: &str) -> Result<&gst::Element> {
        self.nodes
            .get(name)
            .map(|(_, element)| element)
            .ok_or_else(|| fail(format!("unknown node {name}")))
    }

    fn pad(&self, endpoint: &Endpoint) -> Result<gst::Pad> {
        let element = self.element(&endpoint.node)?;
        element
            .static_pad(&endpoint.pad)
            .or_else(|| element.request_pad_simple(&endpoint.pad))
            .ok_or_else(|| fail(format!("no endpoint {endpoint}")))
    }

    fn watch_bus(&self, pipeline: &gst::Pipeline, id: GraphId) -> Result<()> {
        let bus = pipeline
            .bus()
            .ok_or_else(|| fail(format!("{} has no bus", pipeline.name())))?;
        let shared = self.shared.clone();
        bus.set_sync_handler(move |_, message| {
            if let gst::MessageView::Error(err) = message.view() {
                let graph = attribute(&shared, err.src(), id);
                emit(
                    &shared,
                    GraphEvent::ProcessingError {
                        graph,
                        node: err.src().map(|s| s.name().to_string()).unwrap_or_default(),
                        message: err.error().to_string(),
                        debug: err.debug().map(|d| d.to_string()),
                    },
                );
            }
            gst::BusSyncReply::Drop
        });
        Ok(())
    }

    /// Report decoded-stream pads of an RTP session node, blocked so no
    /// data is pushed into an unlinked pad before the core reacts.
    fn watch_pads(&self, element: &gst::Element, graph: GraphId) {
        let shared = self.shared.clone();
        element.connect_pad_added(move |element, pad| {
            let pad_name = pad.name();
            let Ok(endpoint) = pad_name.parse::<RtpSourceEndpoint>() else {
                return;
            };
            let node = element.name().to_string();
            if let Some(probe) =
                pad.add_probe(gst::PadProbeType::BLOCK_DOWNSTREAM, |_, _| gst::PadProbeReturn::Ok)
            {
                shared.lock().blocked.insert((node.clone(), pad_name.to_string()), probe);
            }
            tracing::debug!(%node, pad = %pad_name, "session pad appeared");
            emit(
                &shared,
                GraphEvent::EndpointAppeared {
                    graph,
                    node,
                    endpoint,
                },
            );
        });
    }

    fn apply(&self, element: &gst::Element, key: &str, value: &Prop) -> Result<()> {
        if element.find_property(key).is_none() {
            return Err(fail(format!("{} has no property {key}", element.name())));
        }
        match value {
            Prop::Bool(v) => element.set_property_from_str(key, &v.to_string()),
            Prop::Int(v) => element.set_property_from_str(key, &v.to_string()),
            Prop::UInt(v) => element.set_property_from_str(key, &v.to_string()),
            Prop::Str(v) => element.set_property_from_str(key, v),
            Prop::Caps(caps) => {
                let caps = gst::Caps::from_str(caps).map_err(fail)?;
                element.set_property(key, caps);
            }
            Prop::Socket(socket) => element.set_property(key, gio_socket(socket)?),
            Prop::Destinations(dests) => {
                let clients: Vec<String> = dests.iter().map(SocketAddr::to_string).collect();
                element.set_property_from_str(key, &clients.join(","));
            }
            Prop::BridgePeer(peer) => element.set_property(key, self.element(peer)?.clone()),
        }
        Ok(())
    }
}

impl MediaEngine for GstEngine {
    fn set_event_sink(&mut self, sink: GraphEventSink) {
        self.shared.lock().sink = Some(sink);
    }

    fn create_graph(&mut self, name: &str, kind: GraphKind) -> Result<GraphId> {
        self.next_graph += 1;
        let id = GraphId(self.next_graph);
        let bin = match kind {
            GraphKind::Pipeline => {
                let pipeline = gst::Pipeline::with_name(name);
                self.watch_bus(&pipeline, id)?;
                pipeline.upcast::<gst::Bin>()
            }
            GraphKind::Bin => gst::Bin::with_name(name),
        };
        self.shared.lock().graphs.insert(name.to_string(), id);
        self.graphs.insert(id, bin);
        Ok(id)
    }

    fn add_node(&mut self, graph: GraphId, node: NodeSpec) -> Result<()> {
        let bin = self.graph(graph)?.clone();
        if self.nodes.contains_key(&node.name) {
            return Err(fail(format!("duplicate node name {}", node.name)));
        }
        let element = gst::ElementFactory::make(factory(&node.kind))
            .name(node.name.as_str())
            .build()
            .map_err(|e| fail(format!("{}: {e}", node.name)))?;
        if let NodeKind::VideoCapture { device } = &node.kind {
            element.set_property_from_str("device", device);
        }
        for (key, value) in &node.props {
            self.apply(&element, key, value)?;
        }
        bin.add(&element).map_err(fail)?;
        if node.kind == NodeKind::RtpSession {
            self.watch_pads(&element, graph);
        }
        self.nodes.insert(node.name, (graph, element));
        Ok(())
    }

    fn link(&mut self, src: &Endpoint, dst: &Endpoint) -> Result<()> {
        let src_pad = self.pad(src)?;
        let dst_pad = self.pad(dst)?;
        src_pad
            .link(&dst_pad)
            .map_err(|e| fail(format!("{src} -> {dst}: {e:?}")))?;
        let blocked = self.shared.lock().blocked.remove(&(src.node.clone(), src.pad.clone()));
        if let Some(probe) = blocked {
            src_pad.remove_probe(probe);
        }
        Ok(())
    }

    fn unlink(&mut self, src: &Endpoint, dst: &Endpoint) -> Result<()> {
        let src_pad = self.pad(src)?;
        let dst_pad = self.pad(dst)?;
        src_pad.unlink(&dst_pad).map_err(fail)
    }

    fn use_system_clock(&mut self, graph: GraphId) -> Result<()> {
        let pipeline = self
            .graph(graph)?
            .downcast_ref::<gst::Pipeline>()
            .ok_or_else(|| fail(format!("{graph} is not a pipeline")))?;
        pipeline.use_clock(Some(&gst::SystemClock::obtain()));
        pipeline.set_base_time(gst::ClockTime::ZERO);
        pipeline.set_start_time(gst::ClockTime::NONE);
        Ok(())
    }

    fn set_state(&mut self, graph: GraphId, state: GraphState) -> Result<()> {
        let state = match state {
            GraphState::Null => gst::State::Null,
            GraphState::Ready => gst::State::Ready,
            GraphState::Paused => gst::State::Paused,
            GraphState::Playing => gst::State::Playing,
        };
        self.graph(graph)?
            .set_state(state)
            .map_err(|e| fail(format!("{graph} -> {state:?}: {e}")))?;
        Ok(())
    }

    fn request_endpoint(&mut self, node: &str, template: &str) -> Result<String> {
        let pad = self
            .element(node)?
            .request_pad_simple(template)
            .ok_or_else(|| fail(format!("{node} refused {template}")))?;
        Ok(pad.name().to_string())
    }

    fn release_endpoint(&mut self, node: &str, endpoint: &str) -> Result<()> {
        let element = self.element(node)?;
        let pad = element
            .static_pad(endpoint)
            .ok_or_else(|| fail(format!("no endpoint {node}:{endpoint}")))?;
        element.release_request_pad(&pad);
        Ok(())
    }

    fn add_destination(&mut self, node: &str, dest: SocketAddr) -> Result<()> {
        let element = self.element(node)?;
        if element.find_property("clients").is_none() {
            return Err(fail(format!("{node} is not a UDP sink")));
        }
        element.emit_by_name::<()>("add", &[&dest.ip().to_string(), &i32::from(dest.port())]);
        Ok(())
    }

    fn remove_destination(&mut self, node: &str, dest: SocketAddr) -> Result<()> {
        let element = self.element(node)?;
        element.emit_by_name::<()>("remove", &[&dest.ip().to_string(), &i32::from(dest.port())]);
        Ok(())
    }

    fn attach(&mut self, parent: GraphId, child: GraphId) -> Result<()> {
        let child = self.graph(child)?.clone();
        self.graph(parent)?.add(&child).map_err(fail)
    }

    fn detach(&mut self, parent: GraphId, child: GraphId) -> Result<()> {
        let child = self.graph(child)?.clone();
        self.graph(parent)?.remove(&child).map_err(fail)
    }

    fn destroy_graph(&mut self, graph: GraphId) -> Result<()> {
        let bin = self.graph(graph)?.clone();
        if let Err(e) = bin.set_state(gst::State::Null) {
            tracing::warn!(%graph, error = %e, "graph did not stop cleanly");
        }
        if let Some(parent) = bin.parent().and_then(|p| p.downcast::<gst::Bin>().ok()) {
            parent.remove(&bin).map_err(fail)?;
        }
        if let Some(pipeline) = bin.downcast_ref::<gst::Pipeline>()
            && let Some(bus) = pipeline.bus()
        {
            bus.unset_sync_handler();
        }

        let doomed: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, (_, element))| element.has_as_ancestor(&bin))
            .map(|(name, _)| name.clone())
            .collect();
        for name in &doomed {
            self.nodes.remove(name);
        }
        let graphs: Vec<GraphId> = self
            .graphs
            .iter()
            .filter(|(id, b)| **id == graph || b.has_as_ancestor(&bin))
            .map(|(id, _)| *id)
            .collect();

        let mut shared = self.shared.lock();
        shared.blocked.retain(|(node, _), _| !doomed.contains(node));
        for id in graphs {
            if let Some(removed) = self.graphs.remove(&id) {
                shared.graphs.remove(removed.name().as_str());
            }
        }
        tracing::debug!(%graph, nodes = doomed.len(), "graph destroyed");
        Ok(())
    }
}
