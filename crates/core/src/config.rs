//! Runtime configuration.
//!
//! Every tunable that a conferencing peer needs (ports, multicast group,
//! worker pool size, socket buffer sizes, RTP latency, codec settings) lives
//! here and is passed down at construction time. Nothing below this module
//! reads process-wide constants.

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default TCP port for the control channel.
pub const DEFAULT_CONTROL_PORT: u16 = 5000;
/// Default UDP port for multicast discovery.
pub const DEFAULT_DISCOVERY_PORT: u16 = 5000;
/// Default administratively-scoped multicast group for discovery.
pub const DEFAULT_MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 42, 99);

/// Top-level configuration of a local peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Address to bind and advertise. Detected from the routing table when `None`.
    pub address: Option<IpAddr>,
    /// TCP port of the control-channel listener. `0` picks an ephemeral port.
    pub control_port: u16,
    /// Interfaces to join the discovery group on. Empty means all IPv4 interfaces.
    pub interfaces: Vec<String>,
    /// Capture device path (e.g. `/dev/video0`). A test pattern is sent when `None`.
    pub video_device: Option<String>,
    pub discovery: DiscoveryConfig,
    pub control: ControlConfig,
    pub media: MediaConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            address: None,
            control_port: DEFAULT_CONTROL_PORT,
            interfaces: Vec::new(),
            video_device: None,
            discovery: DiscoveryConfig::default(),
            control: ControlConfig::default(),
            media: MediaConfig::default(),
        }
    }
}

impl Config {
    /// Reject values that would make startup fail in confusing ways later.
    pub fn validate(&self) -> Result<()> {
        if !self.discovery.group.is_multicast() {
            return Err(Error::Config(format!(
                "discovery group {} is not a multicast address",
                self.discovery.group
            )));
        }
        if self.control.backlog <= 0 {
            return Err(Error::Config("control backlog must be positive".into()));
        }
        if self.control.workers == 0 {
            return Err(Error::Config("control worker pool must not be empty".into()));
        }
        if self.control.max_message_bytes < 256 {
            return Err(Error::Config("control max_message_bytes is too small".into()));
        }
        if self.media.video_send_buffer == 0 || self.media.video_recv_buffer == 0 {
            return Err(Error::Config("video socket buffer sizes must be non-zero".into()));
        }
        if let Some(IpAddr::V6(addr)) = self.address {
            return Err(Error::Config(format!("IPv6 address {addr} is not supported")));
        }
        Ok(())
    }
}

/// Multicast discovery settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Disable to rely solely on explicit `connect` calls.
    pub enabled: bool,
    pub group: Ipv4Addr,
    pub port: u16,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            group: DEFAULT_MULTICAST_GROUP,
            port: DEFAULT_DISCOVERY_PORT,
        }
    }
}

/// Control-channel listener and negotiation settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    /// Listen backlog, sized for the expected number of peers.
    pub backlog: i32,
    /// Size of the blocking worker pool. Each connected peer holds one worker.
    pub workers: usize,
    pub connect_timeout_ms: u64,
    /// Read timeout while an offer/answer exchange is in flight.
    pub read_timeout_ms: u64,
    pub max_message_bytes: usize,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            backlog: 10,
            workers: 16,
            connect_timeout_ms: 3000,
            read_timeout_ms: 5000,
            max_message_bytes: 64 * 1024,
        }
    }
}

impl ControlConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

/// Media graph tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    /// Jitter-buffer latency of the RTP session nodes.
    pub rtp_latency_ms: u32,
    /// Kernel send buffer for video RTP. OS defaults are often smaller than
    /// one compressed HD frame, which silently drops packets.
    pub video_send_buffer: usize,
    /// Kernel receive buffer for video RTP sockets.
    pub video_recv_buffer: usize,
    /// Audio output buffer. Below 50ms audio artefacts appear.
    pub audio_buffer_time_us: i64,
    pub audio_latency_time_us: i64,
    pub opus_frame_size_ms: u32,
    /// Quality of the JPEG encoder used for the test-pattern source.
    pub jpeg_quality: u32,
    /// Raw audio format captured before encoding.
    pub raw_audio_caps: String,
    /// Raw video format produced by the test-pattern source.
    pub raw_video_caps: String,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            rtp_latency_ms: 10,
            video_send_buffer: 2 * 1024 * 1024,
            video_recv_buffer: 2 * 1024 * 1024,
            audio_buffer_time_us: 50_000,
            audio_latency_time_us: 5_000,
            opus_frame_size_ms: 10,
            jpeg_quality: 30,
            raw_audio_caps: "audio/x-raw, format=S16LE, channels=2, rate=48000".to_string(),
            raw_video_caps: "video/x-raw, width=1280, height=720, framerate=30/1".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn partial_json_uses_defaults() {
        let json = r#"{
            "control_port": 9001,
            "interfaces": ["eth0"],
            "media": {"rtp_latency_ms": 40}
        }"#;

        let cfg: Config = serde_json::from_str(json).expect("valid partial config");
        assert_eq!(cfg.control_port, 9001);
        assert_eq!(cfg.interfaces, vec!["eth0".to_string()]);
        assert_eq!(cfg.media.rtp_latency_ms, 40);
        assert_eq!(cfg.media.video_recv_buffer, 2 * 1024 * 1024);
        assert_eq!(cfg.control.backlog, 10);
        assert!(cfg.discovery.enabled);
    }

    #[test]
    fn rejects_unicast_group() {
        let mut cfg = Config::default();
        cfg.discovery.group = Ipv4Addr::new(10, 0, 0, 1);
        assert!(matches!(cfg.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn rejects_empty_worker_pool() {
        let mut cfg = Config::default();
        cfg.control.workers = 0;
        assert!(matches!(cfg.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn rejects_ipv6_address() {
        let cfg = Config {
            address: Some("::1".parse().unwrap()),
            ..Config::default()
        };
        assert!(matches!(cfg.validate(), Err(Error::Config(_))));
    }
}
