//! Local and remote peer sessions.
//!
//! A *session* is an opaque handle to a constructed media graph plus the
//! sockets it owns. This module holds the shared data model; the graph
//! orchestration lives in the submodules:
//!
//! - [`local`]: the long-lived playback graph and the transmit graph.
//! - [`remote`]: one receive graph per connected peer.
//! - [`bridge`]: the producer/consumer pair joining a receive graph to playback.
//!
//! ## Local state machine
//!
//! ```text
//! NULL --playback built--> READY --first peer--> READY|STARTED
//!                            ^                        |
//!                            +---last peer / error----+
//! ```
//!
//! READY stays set while transmitting so that the transmit graph can be
//! rebuilt without passing through NULL.
//!
//! ## Ports
//!
//! Per pairing each side binds four receive ports ([`PortQuad`]) and
//! advertises its two shared report ports ([`ReportPorts`]). The six
//! numbers learnt from the remote form its [`SendPorts`].

pub mod bridge;
pub mod local;
pub mod remote;

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::media::{Capabilities, Medium};

pub use bridge::Bridge;
pub use local::{LocalSession, PlaybackGraph};
pub use remote::RemotePeer;

static PEER_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier of a connected remote peer.
///
/// Used as the suffix of every node name built for that peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(u64);

impl PeerId {
    /// Allocate the next identifier.
    pub fn next() -> Self {
        PeerId(PEER_COUNTER.fetch_add(1, Ordering::SeqCst))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Local peer lifecycle flags. READY and STARTED may be set together.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct LocalState(u8);

impl LocalState {
    pub const NULL: LocalState = LocalState(0);
    pub const READY: LocalState = LocalState(1 << 0);
    pub const STARTED: LocalState = LocalState(1 << 1);

    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Whether every flag of `other` is set. `NULL` is contained in every state.
    pub fn contains(self, other: LocalState) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: LocalState) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: LocalState) {
        self.0 &= !other.0;
    }
}

impl fmt::Display for LocalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            return f.write_str("NULL");
        }
        let mut first = true;
        for (flag, name) in [(Self::READY, "READY"), (Self::STARTED, "STARTED")] {
            if self.contains(flag) {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for LocalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LocalState({self})")
    }
}

/// Lifecycle of a remote peer record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteState {
    /// Receive graph built, not yet bridged and running.
    Negotiated,
    /// Receive graph running and bridged into playback.
    Connected,
}

/// The four locally bound receive ports of one pairing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortQuad {
    pub audio_rtp: u16,
    pub audio_rtcp: u16,
    pub video_rtp: u16,
    pub video_rtcp: u16,
}

impl PortQuad {
    pub fn rtp(&self, medium: Medium) -> u16 {
        match medium {
            Medium::Audio => self.audio_rtp,
            Medium::Video => self.video_rtp,
        }
    }

    pub fn rtcp(&self, medium: Medium) -> u16 {
        match medium {
            Medium::Audio => self.audio_rtcp,
            Medium::Video => self.video_rtcp,
        }
    }

    pub fn to_array(&self) -> [u16; 4] {
        [self.audio_rtp, self.audio_rtcp, self.video_rtp, self.video_rtcp]
    }

    pub fn all_valid(&self) -> bool {
        self.to_array().iter().all(|p| *p > 0)
    }
}

/// Ports on which a peer's transmit graph reads RTCP receiver reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReportPorts {
    pub audio: u16,
    pub video: u16,
}

impl ReportPorts {
    pub fn get(&self, medium: Medium) -> u16 {
        match medium {
            Medium::Audio => self.audio,
            Medium::Video => self.video,
        }
    }
}

/// Remote ports we send to: its receive quad plus its report ports.
///
/// | Index | Field | Carries |
/// |-------|-------|---------|
/// | 0 | `audio_rtp` | audio RTP |
/// | 1 | `audio_rtcp` | audio RTCP sender reports |
/// | 2 | `audio_rr` | audio RTCP receiver reports |
/// | 3 | `video_rtp` | video RTP |
/// | 4 | `video_rtcp` | video RTCP sender reports |
/// | 5 | `video_rr` | video RTCP receiver reports |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SendPorts {
    pub audio_rtp: u16,
    pub audio_rtcp: u16,
    pub audio_rr: u16,
    pub video_rtp: u16,
    pub video_rtcp: u16,
    pub video_rr: u16,
}

impl SendPorts {
    pub fn new(recv: PortQuad, report: ReportPorts) -> Self {
        Self {
            audio_rtp: recv.audio_rtp,
            audio_rtcp: recv.audio_rtcp,
            audio_rr: report.audio,
            video_rtp: recv.video_rtp,
            video_rtcp: recv.video_rtcp,
            video_rr: report.video,
        }
    }

    pub fn rtp(&self, medium: Medium) -> u16 {
        match medium {
            Medium::Audio => self.audio_rtp,
            Medium::Video => self.video_rtp,
        }
    }

    /// Where our sender reports go.
    pub fn rtcp(&self, medium: Medium) -> u16 {
        match medium {
            Medium::Audio => self.audio_rtcp,
            Medium::Video => self.video_rtcp,
        }
    }

    /// Where our receiver reports go.
    pub fn rr(&self, medium: Medium) -> u16 {
        match medium {
            Medium::Audio => self.audio_rr,
            Medium::Video => self.video_rr,
        }
    }

    pub fn to_array(&self) -> [u16; 6] {
        [
            self.audio_rtp,
            self.audio_rtcp,
            self.audio_rr,
            self.video_rtp,
            self.video_rtcp,
            self.video_rr,
        ]
    }
}

/// Where the transmit graph sends to for one peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SendTarget {
    pub address: IpAddr,
    pub ports: SendPorts,
}

impl SendTarget {
    pub fn rtp(&self, medium: Medium) -> SocketAddr {
        SocketAddr::new(self.address, self.ports.rtp(medium))
    }

    pub fn rtcp(&self, medium: Medium) -> SocketAddr {
        SocketAddr::new(self.address, self.ports.rtcp(medium))
    }
}

/// Read-only view of a connected remote peer.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerInfo {
    pub id: PeerId,
    /// Advertised control-channel address; identifies the peer across announcements.
    pub control_addr: SocketAddr,
    pub address: IpAddr,
    pub caps: Capabilities,
    pub recv_ports: PortQuad,
    pub send_ports: SendPorts,
    pub state: RemoteState,
}

impl PeerInfo {
    pub fn target(&self) -> SendTarget {
        SendTarget {
            address: self.address,
            ports: self.send_ports,
        }
    }
}
