use std::io::{Read, Write};
use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize};

use crate::error::NegotiationErrorKind;
use crate::media::Capabilities;
use crate::session::{PortQuad, ReportPorts};

/// A message on the control channel.
///
/// Framed as a 4-byte big-endian length followed by a JSON object whose
/// `type` field selects the variant:
///
/// ```text
/// 00 00 00 b4 {"type":"offer","address":"10.0.0.2","control_port":5000,
///              "audio_caps":"audio/x-opus, …","video_caps":"image/jpeg, …",
///              "recv_ports":{"audio_rtp":40002,…},"report_ports":{…}}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ControlMessage {
    Offer(WireOffer),
    Answer(WireOffer),
    Bye,
}

impl ControlMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ControlMessage::Offer(_) => "offer",
            ControlMessage::Answer(_) => "answer",
            ControlMessage::Bye => "bye",
        }
    }
}

/// Offer/answer body as it appears on the wire.
///
/// Every field is optional here so that a missing one is reported by name
/// from [`WireOffer::validate`] instead of as an opaque parse failure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WireOffer {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<IpAddr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub control_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_caps: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video_caps: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recv_ports: Option<PortQuad>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report_ports: Option<ReportPorts>,
}

impl WireOffer {
    /// Check that every mandatory field is present and every port is usable.
    pub fn validate(self) -> Result<Offer, NegotiationErrorKind> {
        use NegotiationErrorKind::{Malformed, MissingField};

        let offer = Offer {
            address: self.address.ok_or(MissingField("address"))?,
            control_port: self.control_port.ok_or(MissingField("control_port"))?,
            caps: Capabilities {
                audio: self.audio_caps.ok_or(MissingField("audio_caps"))?,
                video: self.video_caps.ok_or(MissingField("video_caps"))?,
            },
            recv_ports: self.recv_ports.ok_or(MissingField("recv_ports"))?,
            report_ports: self.report_ports.ok_or(MissingField("report_ports"))?,
        };

        if offer.caps.audio.trim().is_empty() || offer.caps.video.trim().is_empty() {
            return Err(Malformed("empty capability descriptor".into()));
        }
        if offer.control_port == 0
            || !offer.recv_ports.all_valid()
            || offer.report_ports.audio == 0
            || offer.report_ports.video == 0
        {
            return Err(Malformed("port 0 advertised".into()));
        }
        if offer.address.is_unspecified() {
            return Err(Malformed(format!("unusable address {}", offer.address)));
        }
        Ok(offer)
    }
}

/// A validated offer or answer.
#[derive(Debug, Clone, PartialEq)]
pub struct Offer {
    pub address: IpAddr,
    pub control_port: u16,
    pub caps: Capabilities,
    pub recv_ports: PortQuad,
    pub report_ports: ReportPorts,
}

impl Offer {
    /// Address of the sender's control-channel listener.
    pub fn control_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.control_port)
    }
}

impl From<&Offer> for WireOffer {
    fn from(offer: &Offer) -> Self {
        WireOffer {
            address: Some(offer.address),
            control_port: Some(offer.control_port),
            audio_caps: Some(offer.caps.audio.clone()),
            video_caps: Some(offer.caps.video.clone()),
            recv_ports: Some(offer.recv_ports),
            report_ports: Some(offer.report_ports),
        }
    }
}

/// Write one length-prefixed message.
pub fn write_message<W: Write>(writer: &mut W, msg: &ControlMessage) -> std::io::Result<()> {
    let body = serde_json::to_vec(msg)?;
    let len = u32::try_from(body.len())
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "message too large"))?;
    writer.write_all(&len.to_be_bytes())?;
    writer.write_all(&body)?;
    writer.flush()
}

/// Read one length-prefixed message of at most `max_len` body bytes.
pub fn read_message<R: Read>(reader: &mut R, max_len: usize) -> Result<ControlMessage, NegotiationErrorKind> {
    let mut len_buf = [0u8; 4];
    reader
        .read_exact(&mut len_buf)
        .map_err(|e| NegotiationErrorKind::from_io(&e))?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_len {
        return Err(NegotiationErrorKind::TooLarge(len));
    }

    let mut body = vec![0u8; len];
    reader
        .read_exact(&mut body)
        .map_err(|e| NegotiationErrorKind::from_io(&e))?;
    serde_json::from_slice(&body).map_err(|e| NegotiationErrorKind::Malformed(e.to_string()))
}
