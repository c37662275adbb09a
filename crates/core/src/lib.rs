//! Peer discovery and media-session orchestration for LAN audio/video
//! conferencing.
//!
//! A [`LocalPeer`] finds other peers over multicast ([`discovery`]),
//! negotiates capabilities and ports with each over a TCP control channel
//! ([`protocol`]), binds the receive sockets ([`transport`]), and drives a
//! media engine ([`graph`]) to build one shared playback graph, one
//! transmit graph addressed to every peer, and one receive graph per peer
//! bridged into playback ([`session`]).

pub mod config;
pub mod discovery;
pub mod error;
pub mod graph;
pub mod media;
pub mod monitor;
pub mod peer;
pub mod protocol;
pub mod session;
pub mod transport;

pub use config::Config;
pub use error::{Error, NegotiationErrorKind, Result};
pub use graph::{GraphEvent, GraphId, MediaEngine, NodeKind, NodeSpec, RecordingEngine};
pub use media::{Capabilities, Medium};
pub use monitor::GraphOwner;
pub use peer::{LocalPeer, Notification, PeerHandle, Snapshot, VideoSinkFactory};
pub use session::{LocalState, PeerId, PeerInfo, RemoteState};
