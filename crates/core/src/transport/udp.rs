use std::collections::HashSet;
use std::io;
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::sync::Arc;

use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};

use crate::config::MediaConfig;
use crate::error::{Error, Result};
use crate::media::Medium;
use crate::session::PortQuad;

/// One of the four inbound media flows of a pairing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Flow {
    AudioRtp,
    AudioRtcp,
    VideoRtp,
    VideoRtcp,
}

impl Flow {
    pub fn medium(self) -> Medium {
        match self {
            Flow::AudioRtp | Flow::AudioRtcp => Medium::Audio,
            Flow::VideoRtp | Flow::VideoRtcp => Medium::Video,
        }
    }

    /// RTCP flow of a medium.
    pub fn rtcp(medium: Medium) -> Flow {
        match medium {
            Medium::Audio => Flow::AudioRtcp,
            Medium::Video => Flow::VideoRtcp,
        }
    }
}

/// Binds the UDP sockets of media flows and tracks which ports are live.
///
/// The allocator knows nothing about peers or protocols. It guarantees that
/// no port it handed out is handed out again until the owning
/// [`BoundSocket`] is dropped.
#[derive(Clone)]
pub struct PortAllocator {
    live: Arc<Mutex<HashSet<u16>>>,
    video_send_buffer: usize,
    video_recv_buffer: usize,
}

impl PortAllocator {
    pub fn new(media: &MediaConfig) -> Self {
        Self {
            live: Arc::new(Mutex::new(HashSet::new())),
            video_send_buffer: media.video_send_buffer,
            video_recv_buffer: media.video_recv_buffer,
        }
    }

    /// Bind one flow to `preferred`, or to an ephemeral port when `None`.
    ///
    /// Video flows get enlarged kernel buffers before binding.
    pub fn bind_flow(&self, address: IpAddr, preferred: Option<u16>, flow: Flow) -> Result<BoundSocket> {
        let addr = SocketAddr::new(address, preferred.unwrap_or(0));
        let bind_err = |source: io::Error| Error::Bind { addr, source };

        if let Some(port) = preferred
            && self.live.lock().contains(&port)
        {
            return Err(bind_err(io::ErrorKind::AddrInUse.into()));
        }

        let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))
            .map_err(bind_err)?;
        if flow.medium() == Medium::Video {
            self.size_buffers(&socket).map_err(bind_err)?;
        }
        socket.bind(&addr.into()).map_err(bind_err)?;

        let socket: UdpSocket = socket.into();
        let port = socket.local_addr().map_err(bind_err)?.port();
        if !self.live.lock().insert(port) {
            return Err(bind_err(io::ErrorKind::AddrInUse.into()));
        }
        tracing::trace!(%address, port, ?flow, "flow bound");

        Ok(BoundSocket {
            socket: Arc::new(socket),
            port,
            flow,
            live: self.live.clone(),
        })
    }

    /// Bind all four receive flows of one pairing on ephemeral ports.
    ///
    /// On the first failure the flows bound so far are released.
    pub fn bind_quad(&self, address: IpAddr) -> Result<FlowSockets> {
        Ok(FlowSockets {
            audio_rtp: self.bind_flow(address, None, Flow::AudioRtp)?,
            audio_rtcp: self.bind_flow(address, None, Flow::AudioRtcp)?,
            video_rtp: self.bind_flow(address, None, Flow::VideoRtp)?,
            video_rtcp: self.bind_flow(address, None, Flow::VideoRtcp)?,
        })
    }

    /// Ports currently held by live sockets, sorted.
    pub fn live_ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self.live.lock().iter().copied().collect();
        ports.sort_unstable();
        ports
    }

    fn size_buffers(&self, socket: &Socket) -> io::Result<()> {
        socket.set_recv_buffer_size(self.video_recv_buffer)?;
        socket.set_send_buffer_size(self.video_send_buffer)?;

        // The kernel silently clamps to its configured maximum.
        let actual = socket.recv_buffer_size()?;
        if actual < self.video_recv_buffer {
            tracing::warn!(
                requested = self.video_recv_buffer,
                actual,
                "video receive buffer clamped by the kernel; large frames may be dropped"
            );
        }
        Ok(())
    }
}

/// A bound UDP socket owned by one flow. Dropping it frees the port.
///
/// Media graph nodes may hold clones of [`socket`](Self::socket); the OS
/// socket closes once the last of them is gone.
pub struct BoundSocket {
    socket: Arc<UdpSocket>,
    port: u16,
    flow: Flow,
    live: Arc<Mutex<HashSet<u16>>>,
}

impl BoundSocket {
    pub fn socket(&self) -> Arc<UdpSocket> {
        self.socket.clone()
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn flow(&self) -> Flow {
        self.flow
    }
}

impl std::fmt::Debug for BoundSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundSocket")
            .field("port", &self.port)
            .field("flow", &self.flow)
            .finish()
    }
}

impl Drop for BoundSocket {
    fn drop(&mut self) {
        self.live.lock().remove(&self.port);
        tracing::trace!(port = self.port, flow = ?self.flow, "flow released");
    }
}

/// The four receive sockets of one pairing.
#[derive(Debug)]
pub struct FlowSockets {
    pub audio_rtp: BoundSocket,
    pub audio_rtcp: BoundSocket,
    pub video_rtp: BoundSocket,
    pub video_rtcp: BoundSocket,
}

impl FlowSockets {
    pub fn ports(&self) -> PortQuad {
        PortQuad {
            audio_rtp: self.audio_rtp.port,
            audio_rtcp: self.audio_rtcp.port,
            video_rtp: self.video_rtp.port,
            video_rtcp: self.video_rtcp.port,
        }
    }

    pub fn rtp(&self, medium: Medium) -> &BoundSocket {
        match medium {
            Medium::Audio => &self.audio_rtp,
            Medium::Video => &self.video_rtp,
        }
    }

    pub fn rtcp(&self, medium: Medium) -> &BoundSocket {
        match medium {
            Medium::Audio => &self.audio_rtcp,
            Medium::Video => &self.video_rtcp,
        }
    }
}
