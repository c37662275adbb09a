use std::net::{IpAddr, SocketAddr, TcpStream};

use crate::config::ControlConfig;
use crate::error::{Error, NegotiationErrorKind, Result};
use crate::media::Capabilities;
use crate::protocol::message::{ControlMessage, Offer, WireOffer, read_message, write_message};
use crate::session::{PeerId, PortQuad, ReportPorts};
use crate::transport::{FlowSockets, PortAllocator};

/// Result of a successful offer/answer exchange.
///
/// Holds everything a remote peer record is built from: the peer's
/// validated offer, our four freshly bound receive sockets and the control
/// stream, which stays open for the lifetime of the pairing.
#[derive(Debug)]
pub struct Negotiated {
    pub id: PeerId,
    pub remote: Offer,
    pub sockets: FlowSockets,
    pub stream: TcpStream,
    /// Whether we dialled the connection.
    pub initiated: bool,
}

/// Runs the control-channel exchange on a worker thread.
///
/// Shared by every worker; the allocator is the only mutable state it
/// touches and is internally synchronized.
pub struct Negotiator {
    address: IpAddr,
    control_port: u16,
    caps: Capabilities,
    report_ports: ReportPorts,
    allocator: PortAllocator,
    config: ControlConfig,
}

impl Negotiator {
    pub fn new(
        address: IpAddr,
        control_port: u16,
        caps: Capabilities,
        report_ports: ReportPorts,
        allocator: PortAllocator,
        config: ControlConfig,
    ) -> Self {
        Self {
            address,
            control_port,
            caps,
            report_ports,
            allocator,
            config,
        }
    }

    fn offer(&self, recv_ports: PortQuad) -> WireOffer {
        WireOffer::from(&Offer {
            address: self.address,
            control_port: self.control_port,
            caps: self.caps.clone(),
            recv_ports,
            report_ports: self.report_ports,
        })
    }

    fn prepare(&self, stream: &TcpStream, peer: SocketAddr) -> Result<()> {
        let fail = |e: std::io::Error| Error::Negotiation {
            peer,
            kind: NegotiationErrorKind::from_io(&e),
        };
        stream.set_nodelay(true).map_err(fail)?;
        stream.set_read_timeout(Some(self.config.read_timeout())).map_err(fail)?;
        stream.set_write_timeout(Some(self.config.read_timeout())).map_err(fail)
    }

    /// Dial `remote` and run the exchange as initiator.
    pub fn initiate(&self, remote: SocketAddr) -> Result<Negotiated> {
        let fail = |kind| Error::Negotiation { peer: remote, kind };

        let mut stream = TcpStream::connect_timeout(&remote, self.config.connect_timeout())
            .map_err(|e| fail(NegotiationErrorKind::from_io(&e)))?;
        self.prepare(&stream, remote)?;

        let sockets = self.allocator.bind_quad(self.address)?;
        write_message(&mut stream, &ControlMessage::Offer(self.offer(sockets.ports())))
            .map_err(|e| fail(NegotiationErrorKind::from_io(&e)))?;
        tracing::debug!(peer = %remote, ports = ?sockets.ports(), "offer sent");

        let answer = match read_message(&mut stream, self.config.max_message_bytes).map_err(fail)? {
            ControlMessage::Answer(answer) => answer,
            other => {
                return Err(fail(NegotiationErrorKind::UnexpectedMessage(
                    other.kind().to_string(),
                )));
            }
        };
        let offer = answer.validate().map_err(fail)?;
        stream.set_read_timeout(None)?;

        tracing::debug!(peer = %remote, ports = ?offer.recv_ports, "answer received");
        Ok(Negotiated {
            id: PeerId::next(),
            remote: offer,
            sockets,
            stream,
            initiated: true,
        })
    }

    /// Run the exchange as responder on an accepted connection.
    ///
    /// Our receive ports are bound only once the offer is known to be valid.
    pub fn respond(&self, mut stream: TcpStream) -> Result<Negotiated> {
        let peer = stream.peer_addr()?;
        let fail = |kind| Error::Negotiation { peer, kind };
        self.prepare(&stream, peer)?;

        let offer = match read_message(&mut stream, self.config.max_message_bytes).map_err(fail)? {
            ControlMessage::Offer(offer) => offer,
            other => {
                return Err(fail(NegotiationErrorKind::UnexpectedMessage(
                    other.kind().to_string(),
                )));
            }
        };
        let offer = offer.validate().map_err(fail)?;
        tracing::debug!(%peer, control = %offer.control_addr(), "offer received");

        let sockets = self.allocator.bind_quad(self.address)?;
        write_message(&mut stream, &ControlMessage::Answer(self.offer(sockets.ports())))
            .map_err(|e| fail(NegotiationErrorKind::from_io(&e)))?;
        stream.set_read_timeout(None)?;

        tracing::debug!(%peer, ports = ?sockets.ports(), "answer sent");
        Ok(Negotiated {
            id: PeerId::next(),
            remote: offer,
            sockets,
            stream,
            initiated: false,
        })
    }
}
