//! Routing of asynchronous graph events to the component owning the graph.
//!
//! Engines report events from their own threads. [`forward`] turns each one
//! into a message on the reactor's channel; the reactor then asks the
//! [`EventMonitor`] who owns the graph. A processing error is contained to
//! its owner: a failing receive graph removes only that peer, a failing
//! transmit graph only stops transmission.

use std::collections::HashMap;
use std::fmt;

use crossbeam_channel::Sender;

use crate::graph::{GraphEvent, GraphEventSink, GraphId};
use crate::session::PeerId;

/// Component a graph belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GraphOwner {
    Playback,
    Transmit,
    Peer(PeerId),
}

impl fmt::Display for GraphOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GraphOwner::Playback => f.write_str("playback"),
            GraphOwner::Transmit => f.write_str("transmit"),
            GraphOwner::Peer(id) => write!(f, "peer {id}"),
        }
    }
}

/// An event together with its owner.
#[derive(Debug, Clone, PartialEq)]
pub struct Routed {
    pub owner: GraphOwner,
    pub event: GraphEvent,
}

#[derive(Debug, Default)]
pub struct EventMonitor {
    owners: HashMap<GraphId, GraphOwner>,
}

impl EventMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn watch(&mut self, graph: GraphId, owner: GraphOwner) {
        self.owners.insert(graph, owner);
    }

    pub fn unwatch(&mut self, graph: GraphId) {
        self.owners.remove(&graph);
    }

    /// Forget every graph of `owner`.
    pub fn unwatch_owner(&mut self, owner: GraphOwner) {
        self.owners.retain(|_, o| *o != owner);
    }

    pub fn owner(&self, graph: GraphId) -> Option<GraphOwner> {
        self.owners.get(&graph).copied()
    }

    /// Attribute `event` to its owner. Events for graphs nobody watches
    /// (late events from torn-down graphs) are dropped.
    pub fn route(&self, event: GraphEvent) -> Option<Routed> {
        let Some(owner) = self.owner(event.graph()) else {
            tracing::debug!(graph = %event.graph(), "event for unwatched graph dropped");
            return None;
        };
        if let GraphEvent::ProcessingError {
            node,
            message,
            debug: detail,
            ..
        } = &event
        {
            let detail = detail.as_deref().unwrap_or("");
            tracing::error!(%owner, %node, %message, detail, "graph processing error");
        }
        Some(Routed { owner, event })
    }
}

/// Event sink that forwards every event into `tx`.
pub fn forward<T>(tx: Sender<T>) -> GraphEventSink
where
    T: From<GraphEvent> + Send + 'static,
{
    std::sync::Arc::new(move |event: GraphEvent| {
        if tx.send(T::from(event)).is_err() {
            tracing::trace!("graph event after reactor exit");
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn error(graph: u64) -> GraphEvent {
        GraphEvent::ProcessingError {
            graph: GraphId(graph),
            node: "udpsrc".into(),
            message: "socket closed".into(),
            debug: None,
        }
    }

    #[test]
    fn routes_to_owner() {
        let peer = PeerId::next();
        let mut monitor = EventMonitor::new();
        monitor.watch(GraphId(1), GraphOwner::Transmit);
        monitor.watch(GraphId(2), GraphOwner::Peer(peer));
        monitor.watch(GraphId(3), GraphOwner::Peer(peer));

        assert_eq!(monitor.route(error(1)).unwrap().owner, GraphOwner::Transmit);
        assert_eq!(monitor.route(error(3)).unwrap().owner, GraphOwner::Peer(peer));
        assert!(monitor.route(error(9)).is_none());

        monitor.unwatch_owner(GraphOwner::Peer(peer));
        assert!(monitor.route(error(2)).is_none());
        assert!(monitor.route(error(1)).is_some());
    }

    #[test]
    fn forward_sends_into_channel() {
        let (tx, rx) = crossbeam_channel::unbounded::<GraphEvent>();
        let sink = forward(tx);
        sink(error(4));
        assert_eq!(rx.try_recv().unwrap().graph(), GraphId(4));
        drop(rx);
        sink(error(5));
    }

    #[test]
    fn error_with_detail_is_routed_intact() {
        let mut monitor = EventMonitor::new();
        monitor.watch(GraphId(4), GraphOwner::Playback);
        let event = GraphEvent::ProcessingError {
            graph: GraphId(4),
            node: "pulsesink".into(),
            message: "device lost".into(),
            debug: Some("pa_stream_write failed".into()),
        };
        let routed = monitor.route(event).unwrap();
        assert_eq!(routed.owner, GraphOwner::Playback);
        assert!(matches!(
            routed.event,
            GraphEvent::ProcessingError { debug: Some(ref d), .. } if d == "pa_stream_write failed"
        ));
    }
}
