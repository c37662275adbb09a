//! Sockets: media flows and the control channel.
//!
//! - **UDP** ([`udp`]): the [`PortAllocator`] binds one socket per inbound
//!   media flow (four per connected peer) plus the two shared report
//!   sockets of the transmit graph. Sockets are handed to the media engine
//!   pre-bound, so port ownership is decided here and never by the engine.
//!
//! - **TCP** ([`tcp`]): the control-channel listener and a bounded
//!   [`WorkerPool`]. Control reads are blocking; one worker serves one
//!   connection so a slow peer never stalls another.

pub mod tcp;
pub mod udp;

pub use tcp::{Job, JobQueue, WorkerPool};
pub use udp::{BoundSocket, Flow, FlowSockets, PortAllocator};
