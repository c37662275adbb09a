//! Media stream layout shared by every peer.
//!
//! A pairing between two peers always carries exactly two media, each in
//! its own logical RTP session:
//!
//! | Medium | Session | Codec | RTP payload |
//! |--------|---------|-------|-------------|
//! | Audio  | 0       | Opus, 48 kHz stereo | 96, clock 48000 |
//! | Video  | 1       | JPEG  | 26, clock 90000 |
//!
//! Both the RTP and the RTCP flow of a medium use that medium's session
//! number. The numbering is part of the protocol version and never changes.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Capability descriptor for the audio we send.
pub const AUDIO_CAPS: &str = "audio/x-opus, channels=2, rate=48000";
/// Capability descriptor for the video we send.
pub const VIDEO_CAPS: &str = "image/jpeg, width=1280, height=720, framerate=30/1";

/// RTP caps set on the audio receive source.
pub const RTP_OPUS_CAPS: &str =
    "application/x-rtp, media=audio, clock-rate=48000, encoding-name=OPUS, payload=96";
/// RTP caps set on the video receive source. The depayloader picks up
/// width/height/framerate from the stream, so they can change mid-call.
pub const RTP_JPEG_CAPS: &str =
    "application/x-rtp, media=video, clock-rate=90000, encoding-name=JPEG, payload=26";

/// One of the two media of a pairing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Medium {
    Audio,
    Video,
}

impl Medium {
    pub const ALL: [Medium; 2] = [Medium::Audio, Medium::Video];

    /// Logical RTP session number of this medium.
    pub fn session(self) -> u32 {
        match self {
            Medium::Audio => 0,
            Medium::Video => 1,
        }
    }

    /// Map a session number back to its medium. Anything but 0 and 1 is foreign.
    pub fn from_session(session: u32) -> Option<Self> {
        match session {
            0 => Some(Medium::Audio),
            1 => Some(Medium::Video),
            _ => None,
        }
    }

    /// RTP payload type this medium is always sent with.
    pub fn payload_type(self) -> u8 {
        match self {
            Medium::Audio => 96,
            Medium::Video => 26,
        }
    }

    /// Prefix used in node names.
    pub fn prefix(self) -> &'static str {
        match self {
            Medium::Audio => "audio",
            Medium::Video => "video",
        }
    }
}

impl fmt::Display for Medium {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

/// Audio/video capability descriptors advertised by a peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub audio: String,
    pub video: String,
}

impl Capabilities {
    pub fn new(audio: impl Into<String>, video: impl Into<String>) -> Self {
        Self {
            audio: audio.into(),
            video: video.into(),
        }
    }
}

impl Default for Capabilities {
    fn default() -> Self {
        Self::new(AUDIO_CAPS, VIDEO_CAPS)
    }
}
