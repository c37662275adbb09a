//! In-process [`MediaEngine`] that records every declarative call.
//!
//! Nothing is executed: graphs are bookkeeping records. The engine enforces
//! the structural rules a real engine would (unique node names, links only
//! between existing nodes of the same pipeline, destinations only on UDP
//! sinks) and lets callers inject [`GraphEvent`]s through [`RecordingEngine::emit`].
//! Cloning yields another handle to the same state, so a test can hand one
//! clone to a [`LocalPeer`](crate::LocalPeer) and inspect through another.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;

use super::{
    Endpoint, GraphEvent, GraphEventSink, GraphId, GraphKind, GraphState, MediaEngine, NodeKind,
    NodeSpec, Prop,
};
use crate::error::{Error, Result};

/// Recorded state of one graph.
#[derive(Debug, Clone, PartialEq)]
pub struct GraphRecord {
    pub name: String,
    pub kind: GraphKind,
    pub state: GraphState,
    pub system_clock: bool,
    pub parent: Option<GraphId>,
    pub children: Vec<GraphId>,
}

/// Recorded state of one node.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeRecord {
    pub graph: GraphId,
    pub spec: NodeSpec,
    /// Endpoints currently requested from this node.
    pub requested: Vec<String>,
    /// Current destinations when the node is a UDP sink.
    pub destinations: Vec<SocketAddr>,
    next_request: u32,
}

#[derive(Default)]
struct Inner {
    next_graph: u64,
    sink: Option<GraphEventSink>,
    graphs: BTreeMap<GraphId, GraphRecord>,
    nodes: HashMap<String, NodeRecord>,
    links: Vec<(Endpoint, Endpoint)>,
}

impl Inner {
    fn graph_mut(&mut self, id: GraphId) -> Result<&mut GraphRecord> {
        self.graphs
            .get_mut(&id)
            .ok_or_else(|| Error::Engine(format!("unknown {id}")))
    }

    fn node_mut(&mut self, name: &str) -> Result<&mut NodeRecord> {
        self.nodes
            .get_mut(name)
            .ok_or_else(|| Error::Engine(format!("unknown node {name}")))
    }

    fn root(&self, mut id: GraphId) -> GraphId {
        while let Some(parent) = self.graphs.get(&id).and_then(|g| g.parent) {
            id = parent;
        }
        id
    }

    fn descendants(&self, id: GraphId) -> Vec<GraphId> {
        let mut out = vec![id];
        let mut i = 0;
        while i < out.len() {
            if let Some(g) = self.graphs.get(&out[i]) {
                out.extend(g.children.iter().copied());
            }
            i += 1;
        }
        out
    }

    fn set_state_recursive(&mut self, id: GraphId, state: GraphState) {
        for g in self.descendants(id) {
            if let Some(record) = self.graphs.get_mut(&g) {
                record.state = state;
            }
        }
    }
}

/// Recording media engine. See the module documentation.
#[derive(Clone, Default)]
pub struct RecordingEngine {
    inner: Arc<Mutex<Inner>>,
}

impl RecordingEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver an event to the installed sink, as an engine thread would.
    pub fn emit(&self, event: GraphEvent) {
        let sink = self.inner.lock().sink.clone();
        match sink {
            Some(sink) => sink(event),
            None => tracing::warn!(?event, "event emitted before a sink was installed"),
        }
    }

    pub fn graph(&self, id: GraphId) -> Option<GraphRecord> {
        self.inner.lock().graphs.get(&id).cloned()
    }

    /// Look up a live graph by name.
    pub fn graph_by_name(&self, name: &str) -> Option<(GraphId, GraphRecord)> {
        self.inner
            .lock()
            .graphs
            .iter()
            .find(|(_, g)| g.name == name)
            .map(|(id, g)| (*id, g.clone()))
    }

    pub fn graph_count(&self) -> usize {
        self.inner.lock().graphs.len()
    }

    pub fn node(&self, name: &str) -> Option<NodeRecord> {
        self.inner.lock().nodes.get(name).cloned()
    }

    /// Names of every live node, sorted.
    pub fn node_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.lock().nodes.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn links(&self) -> Vec<(Endpoint, Endpoint)> {
        self.inner.lock().links.clone()
    }

    pub fn is_linked(&self, src: &Endpoint, dst: &Endpoint) -> bool {
        self.inner
            .lock()
            .links
            .iter()
            .any(|(s, d)| s == src && d == dst)
    }

    /// Endpoints linked downstream of `node`.
    pub fn links_from(&self, node: &str) -> Vec<Endpoint> {
        self.inner
            .lock()
            .links
            .iter()
            .filter(|(s, _)| s.node == node)
            .map(|(_, d)| d.clone())
            .collect()
    }

    pub fn destinations(&self, node: &str) -> Vec<SocketAddr> {
        self.node(node).map(|n| n.destinations).unwrap_or_default()
    }
}

impl MediaEngine for RecordingEngine {
    fn set_event_sink(&mut self, sink: GraphEventSink) {
        self.inner.lock().sink = Some(sink);
    }

    fn create_graph(&mut self, name: &str, kind: GraphKind) -> Result<GraphId> {
        let mut inner = self.inner.lock();
        inner.next_graph += 1;
        let id = GraphId(inner.next_graph);
        inner.graphs.insert(
            id,
            GraphRecord {
                name: name.to_string(),
                kind,
                state: GraphState::Null,
                system_clock: false,
                parent: None,
                children: Vec::new(),
            },
        );
        tracing::trace!(graph = %id, name, ?kind, "graph created");
        Ok(id)
    }

    fn add_node(&mut self, graph: GraphId, node: NodeSpec) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.graph_mut(graph)?;
        if inner.nodes.contains_key(&node.name) {
            return Err(Error::Engine(format!("duplicate node name {}", node.name)));
        }
        let destinations = match node.get("clients") {
            Some(Prop::Destinations(dests)) => dests.clone(),
            _ => Vec::new(),
        };
        inner.nodes.insert(
            node.name.clone(),
            NodeRecord {
                graph,
                spec: node,
                requested: Vec::new(),
                destinations,
                next_request: 0,
            },
        );
        Ok(())
    }

    fn link(&mut self, src: &Endpoint, dst: &Endpoint) -> Result<()> {
        let mut inner = self.inner.lock();
        let src_graph = inner.node_mut(&src.node)?.graph;
        let dst_graph = inner.node_mut(&dst.node)?.graph;
        if inner.root(src_graph) != inner.root(dst_graph) {
            return Err(Error::Engine(format!(
                "{src} and {dst} live in different pipelines"
            )));
        }
        if inner.links.iter().any(|(s, d)| s == src || d == dst) {
            return Err(Error::Engine(format!("{src} or {dst} is already linked")));
        }
        inner.links.push((src.clone(), dst.clone()));
        Ok(())
    }

    fn unlink(&mut self, src: &Endpoint, dst: &Endpoint) -> Result<()> {
        let mut inner = self.inner.lock();
        let before = inner.links.len();
        inner.links.retain(|(s, d)| !(s == src && d == dst));
        if inner.links.len() == before {
            return Err(Error::Engine(format!("{src} is not linked to {dst}")));
        }
        Ok(())
    }

    fn use_system_clock(&mut self, graph: GraphId) -> Result<()> {
        self.inner.lock().graph_mut(graph)?.system_clock = true;
        Ok(())
    }

    fn set_state(&mut self, graph: GraphId, state: GraphState) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.graph_mut(graph)?;
        inner.set_state_recursive(graph, state);
        Ok(())
    }

    fn request_endpoint(&mut self, node: &str, template: &str) -> Result<String> {
        let mut inner = self.inner.lock();
        let record = inner.node_mut(node)?;
        if !template.contains("%u") {
            return Err(Error::Engine(format!("{template} is not a request template")));
        }
        let name = template.replace("%u", &record.next_request.to_string());
        record.next_request += 1;
        record.requested.push(name.clone());
        Ok(name)
    }

    fn release_endpoint(&mut self, node: &str, endpoint: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        let record = inner.node_mut(node)?;
        let before = record.requested.len();
        record.requested.retain(|e| e != endpoint);
        if record.requested.len() == before {
            return Err(Error::Engine(format!("{node}:{endpoint} was not requested")));
        }
        let released = Endpoint::new(node, endpoint);
        inner.links.retain(|(s, d)| *s != released && *d != released);
        Ok(())
    }

    fn add_destination(&mut self, node: &str, dest: SocketAddr) -> Result<()> {
        let mut inner = self.inner.lock();
        let record = inner.node_mut(node)?;
        if record.spec.kind != NodeKind::UdpSink {
            return Err(Error::Engine(format!("{node} is not a UDP sink")));
        }
        if !record.destinations.contains(&dest) {
            record.destinations.push(dest);
        }
        Ok(())
    }

    fn remove_destination(&mut self, node: &str, dest: SocketAddr) -> Result<()> {
        let mut inner = self.inner.lock();
        let record = inner.node_mut(node)?;
        record.destinations.retain(|d| *d != dest);
        Ok(())
    }

    fn attach(&mut self, parent: GraphId, child: GraphId) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.graph_mut(parent)?;
        let record = inner.graph_mut(child)?;
        if record.parent.is_some() {
            return Err(Error::Engine(format!("{child} already has a parent")));
        }
        record.parent = Some(parent);
        inner.graph_mut(parent)?.children.push(child);
        Ok(())
    }

    fn detach(&mut self, parent: GraphId, child: GraphId) -> Result<()> {
        let mut inner = self.inner.lock();
        let record = inner.graph_mut(child)?;
        if record.parent != Some(parent) {
            return Err(Error::Engine(format!("{child} is not a child of {parent}")));
        }
        record.parent = None;
        inner.graph_mut(parent)?.children.retain(|c| *c != child);

        // Links crossing the bin boundary do not survive removal.
        let members = inner.descendants(child);
        let inside: Vec<String> = inner
            .nodes
            .iter()
            .filter(|(_, n)| members.contains(&n.graph))
            .map(|(name, _)| name.clone())
            .collect();
        inner
            .links
            .retain(|(s, d)| inside.contains(&s.node) == inside.contains(&d.node));
        Ok(())
    }

    fn destroy_graph(&mut self, graph: GraphId) -> Result<()> {
        let mut inner = self.inner.lock();
        let parent = inner.graph_mut(graph)?.parent;
        if let Some(parent) = parent {
            inner.graph_mut(parent)?.children.retain(|c| *c != graph);
        }
        let doomed = inner.descendants(graph);
        let names: Vec<String> = inner
            .nodes
            .iter()
            .filter(|(_, n)| doomed.contains(&n.graph))
            .map(|(name, _)| name.clone())
            .collect();
        for name in &names {
            inner.nodes.remove(name);
        }
        inner
            .links
            .retain(|(s, d)| !names.contains(&s.node) && !names.contains(&d.node));
        for id in doomed {
            inner.graphs.remove(&id);
        }
        tracing::trace!(%graph, nodes = names.len(), "graph destroyed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::net::UdpSocket;

    use super::*;

    fn engine_with_pipeline() -> (RecordingEngine, GraphId) {
        let mut engine = RecordingEngine::new();
        let pipeline = engine.create_graph("p", GraphKind::Pipeline).unwrap();
        (engine, pipeline)
    }

    #[test]
    fn duplicate_node_names_are_rejected() {
        let (mut engine, p) = engine_with_pipeline();
        engine.add_node(p, NodeSpec::new("q", NodeKind::Queue)).unwrap();
        assert!(engine.add_node(p, NodeSpec::new("q", NodeKind::Queue)).is_err());
    }

    #[test]
    fn links_require_a_shared_pipeline() {
        let (mut engine, p) = engine_with_pipeline();
        let other = engine.create_graph("other", GraphKind::Pipeline).unwrap();
        engine.add_node(p, NodeSpec::new("a", NodeKind::Queue)).unwrap();
        engine.add_node(other, NodeSpec::new("b", NodeKind::Queue)).unwrap();
        assert!(engine.link(&Endpoint::src("a"), &Endpoint::sink("b")).is_err());

        let bin = engine.create_graph("bin", GraphKind::Bin).unwrap();
        engine.add_node(bin, NodeSpec::new("c", NodeKind::Queue)).unwrap();
        engine.attach(p, bin).unwrap();
        engine.link(&Endpoint::src("a"), &Endpoint::sink("c")).unwrap();
    }

    #[test]
    fn released_endpoint_drops_its_link() {
        let (mut engine, p) = engine_with_pipeline();
        engine.add_node(p, NodeSpec::new("src", NodeKind::Queue)).unwrap();
        engine.add_node(p, NodeSpec::new("mix", NodeKind::AudioMixer)).unwrap();
        let pad = engine.request_endpoint("mix", "sink_%u").unwrap();
        assert_eq!(pad, "sink_0");
        assert_eq!(engine.request_endpoint("mix", "sink_%u").unwrap(), "sink_1");

        let dst = Endpoint::new("mix", pad.clone());
        engine.link(&Endpoint::src("src"), &dst).unwrap();
        engine.release_endpoint("mix", &pad).unwrap();
        assert!(!engine.is_linked(&Endpoint::src("src"), &dst));
        assert_eq!(engine.node("mix").unwrap().requested, vec!["sink_1".to_string()]);
    }

    #[test]
    fn attached_bin_keeps_state_and_detach_cuts_links() {
        let (mut engine, p) = engine_with_pipeline();
        engine.add_node(p, NodeSpec::new("mix", NodeKind::AudioMixer)).unwrap();
        engine.set_state(p, GraphState::Playing).unwrap();

        let bin = engine.create_graph("bin", GraphKind::Bin).unwrap();
        engine.add_node(bin, NodeSpec::new("bsrc", NodeKind::BridgeSource)).unwrap();
        engine.attach(p, bin).unwrap();
        assert_eq!(engine.graph(bin).unwrap().state, GraphState::Null);
        engine.set_state(bin, GraphState::Playing).unwrap();

        engine.link(&Endpoint::src("bsrc"), &Endpoint::new("mix", "sink_0")).unwrap();
        engine.detach(p, bin).unwrap();
        assert!(engine.links().is_empty());
        assert!(engine.graph(p).unwrap().children.is_empty());
    }

    #[test]
    fn destroy_releases_sockets() {
        let (mut engine, p) = engine_with_pipeline();
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").unwrap());
        let weak = Arc::downgrade(&socket);
        engine
            .add_node(
                p,
                NodeSpec::new("udpsrc", NodeKind::UdpSource).prop("socket", Prop::Socket(socket)),
            )
            .unwrap();
        assert!(weak.upgrade().is_some());
        engine.destroy_graph(p).unwrap();
        assert!(weak.upgrade().is_none());
        assert_eq!(engine.graph_count(), 0);
    }

    #[test]
    fn destinations_only_on_udp_sinks() {
        let (mut engine, p) = engine_with_pipeline();
        let dest: SocketAddr = "10.0.0.2:6000".parse().unwrap();
        engine
            .add_node(
                p,
                NodeSpec::new("sink", NodeKind::UdpSink)
                    .prop("clients", Prop::Destinations(vec![dest])),
            )
            .unwrap();
        engine.add_node(p, NodeSpec::new("q", NodeKind::Queue)).unwrap();

        let extra: SocketAddr = "10.0.0.3:6000".parse().unwrap();
        engine.add_destination("sink", extra).unwrap();
        assert_eq!(engine.destinations("sink"), vec![dest, extra]);
        engine.remove_destination("sink", dest).unwrap();
        assert_eq!(engine.destinations("sink"), vec![extra]);
        assert!(engine.add_destination("q", extra).is_err());
    }

    #[test]
    fn emit_reaches_installed_sink() {
        let mut engine = RecordingEngine::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        engine.set_event_sink(Arc::new(move |ev| s.lock().push(ev)));
        engine.emit(GraphEvent::ProcessingError {
            graph: GraphId(1),
            node: "n".into(),
            message: "boom".into(),
            debug: None,
        });
        assert_eq!(seen.lock().len(), 1);
    }
}
