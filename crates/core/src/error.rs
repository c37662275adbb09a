//! Error types for the conferencing core.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};

use crate::session::PeerId;

/// Errors that can occur in the conferencing core.
///
/// Variants map to specific failure modes across the stack:
///
/// - **Allocator**: [`Bind`](Self::Bind): a media or control socket could
///   not be bound. Abandon the affected peer, never the whole process.
/// - **Discovery**: [`Join`](Self::Join): no interface could join the
///   multicast group. Failures on individual interfaces are only logged.
/// - **Control channel**: [`Negotiation`](Self::Negotiation): refused,
///   timed-out or malformed capability/port exchange.
/// - **Remote session**: [`ProtocolViolation`](Self::ProtocolViolation):
///   traffic that does not fit the fixed audio/video session numbering.
/// - **Media graphs**: [`Graph`](Self::Graph) and [`Engine`](Self::Engine).
/// - **Lifecycle**: [`NotStarted`](Self::NotStarted),
///   [`AlreadyRunning`](Self::AlreadyRunning),
///   [`InvalidState`](Self::InvalidState),
///   [`PeerNotFound`](Self::PeerNotFound).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Underlying I/O or socket error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A UDP or TCP socket could not be bound to the requested address.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// The multicast group could not be joined on any interface.
    #[error("could not join multicast group {group} on any interface")]
    Join { group: Ipv4Addr },

    /// The control-channel exchange with a candidate peer failed.
    #[error("negotiation with {peer} failed: {kind}")]
    Negotiation {
        peer: SocketAddr,
        kind: NegotiationErrorKind,
    },

    /// A connected peer produced traffic outside the agreed stream layout.
    #[error("protocol violation by peer {peer}: {reason}")]
    ProtocolViolation { peer: PeerId, reason: String },

    /// A media graph reported a processing failure.
    #[error("processing error in {node}: {message}")]
    Graph { node: String, message: String },

    /// The media engine rejected a declarative graph call.
    #[error("media engine error: {0}")]
    Engine(String),

    /// The configuration is unusable.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The local peer has not been started, or its reactor has exited.
    #[error("local peer not started")]
    NotStarted,

    /// [`LocalPeer::start`](crate::LocalPeer::start) was called twice.
    #[error("local peer already running")]
    AlreadyRunning,

    /// The requested transition is not allowed from the current local state.
    #[error("invalid local state for {operation}: {state}")]
    InvalidState {
        operation: &'static str,
        state: crate::session::LocalState,
    },

    /// No connected peer with this identifier.
    #[error("peer not found: {0}")]
    PeerNotFound(PeerId),
}

/// Specific kind of control-channel negotiation failure.
#[derive(Debug)]
pub enum NegotiationErrorKind {
    /// The TCP connection was refused or reset.
    Refused(std::io::ErrorKind),
    /// Connecting or reading did not complete in time.
    Timeout,
    /// The remote side closed the connection mid-exchange.
    Closed,
    /// A frame announced more bytes than the configured maximum.
    TooLarge(usize),
    /// The frame body was not a valid control message.
    Malformed(String),
    /// A mandatory offer/answer field was absent.
    MissingField(&'static str),
    /// A well-formed message arrived at the wrong point of the exchange.
    UnexpectedMessage(String),
}

impl NegotiationErrorKind {
    /// Classify an I/O error raised while talking to the remote peer.
    pub fn from_io(err: &std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::TimedOut | ErrorKind::WouldBlock => Self::Timeout,
            ErrorKind::UnexpectedEof => Self::Closed,
            kind => Self::Refused(kind),
        }
    }
}

impl fmt::Display for NegotiationErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Refused(kind) => write!(f, "connection failed ({kind})"),
            Self::Timeout => write!(f, "timed out"),
            Self::Closed => write!(f, "connection closed"),
            Self::TooLarge(len) => write!(f, "message too large ({len} bytes)"),
            Self::Malformed(reason) => write!(f, "malformed message: {reason}"),
            Self::MissingField(field) => write!(f, "missing field `{field}`"),
            Self::UnexpectedMessage(kind) => write!(f, "unexpected `{kind}` message"),
        }
    }
}

/// Convenience alias for `Result<T, Error>`.
pub type Result<T> = std::result::Result<T, Error>;
