//! Peer-to-peer wire protocols.
//!
//! Two channels carry everything a pairing needs before media flows:
//!
//! | Channel | Transport | Content | Module |
//! |---------|-----------|---------|--------|
//! | Discovery | UDP multicast + unicast reply | [`Announcement`] JSON datagram | [`announce`] |
//! | Control | TCP, one connection per pairing | length-prefixed [`ControlMessage`] JSON | [`message`] |
//!
//! ## Control exchange
//!
//! ```text
//! initiator                               responder
//!    | -- offer  {addr, caps, recv_ports, report_ports} --> |  bind 4 ports
//!    | <-- answer {addr, caps, recv_ports, report_ports} -- |
//!    |            ... media flows over UDP ...              |
//!    | <------------------- bye -------------------------> |  either side
//! ```
//!
//! The initiator binds its four receive ports before sending the offer; the
//! responder binds after validating it. A malformed or incomplete message
//! closes the connection without creating a peer.

pub mod announce;
pub mod handler;
pub mod message;

pub use announce::{AnnounceKind, Announcement};
pub use handler::{Negotiated, Negotiator};
pub use message::{ControlMessage, Offer, WireOffer};
