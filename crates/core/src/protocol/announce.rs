use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize};

use crate::media::Capabilities;

/// Largest discovery datagram we accept.
pub const MAX_DATAGRAM: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnnounceKind {
    /// Multicast on startup.
    Hello,
    /// Unicast answer to a `hello`, so late joiners learn about us.
    Reply,
    /// Multicast on orderly shutdown.
    Goodbye,
}

/// Presence datagram exchanged over multicast discovery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Announcement {
    /// Random per-process id; lets a peer ignore its own looped-back datagrams.
    pub instance: u64,
    pub kind: AnnounceKind,
    pub address: IpAddr,
    pub control_port: u16,
    pub caps: Capabilities,
}

impl Announcement {
    pub fn control_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.control_port)
    }

    pub fn with_kind(&self, kind: AnnounceKind) -> Self {
        Self {
            kind,
            ..self.clone()
        }
    }

    pub fn encode(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn decode(datagram: &[u8]) -> Option<Self> {
        serde_json::from_slice(datagram).ok()
    }
}

/// Whether the local side dials the control connection to `remote`.
///
/// Both sides evaluate the same rule on each other's announcements, so
/// exactly one of them initiates.
pub fn should_initiate(local: SocketAddr, remote: SocketAddr) -> bool {
    local < remote
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hello() -> Announcement {
        Announcement {
            instance: 7,
            kind: AnnounceKind::Hello,
            address: "10.0.0.5".parse().unwrap(),
            control_port: 9001,
            caps: Capabilities::default(),
        }
    }

    #[test]
    fn datagram_format() {
        let datagram = hello().encode().unwrap();
        assert!(!datagram.is_empty() && datagram.len() <= MAX_DATAGRAM);
        let json: serde_json::Value = serde_json::from_slice(&datagram).unwrap();
        assert_eq!(json["kind"], "hello");
        assert_eq!(json["address"], "10.0.0.5");
        assert_eq!(json["control_port"], 9001);
        assert_eq!(Announcement::decode(&datagram), Some(hello()));
    }

    #[test]
    fn junk_datagrams_are_ignored() {
        assert_eq!(Announcement::decode(b"\x00\x01"), None);
        assert_eq!(Announcement::decode(br#"{"kind":"hello"}"#), None);
    }

    #[test]
    fn exactly_one_side_initiates() {
        let a: SocketAddr = "10.0.0.5:9001".parse().unwrap();
        let b: SocketAddr = "10.0.0.5:9002".parse().unwrap();
        assert!(should_initiate(a, b));
        assert!(!should_initiate(b, a));
        assert!(!should_initiate(a, a));
    }
}
