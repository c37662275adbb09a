//! Multicast peer discovery.
//!
//! One UDP socket, bound to the well-known discovery port, joins the
//! discovery group on every requested interface (all IPv4 interfaces when
//! none are named). Joining is attempted per interface: an interface that
//! cannot join is logged and dropped, and startup fails only when no
//! interface joined at all. In that case the socket is closed before the
//! error is returned.
//!
//! A receiver thread decodes [`Announcement`]s and hands them, with the
//! sender's address, to a callback. Our own looped-back datagrams are
//! recognized by their instance id and skipped.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};

use crate::config::DiscoveryConfig;
use crate::error::{Error, Result};
use crate::protocol::announce::{Announcement, MAX_DATAGRAM};

/// A named IPv4 interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interface {
    pub name: String,
    pub addr: Ipv4Addr,
}

/// Resolve interface names to their IPv4 addresses.
///
/// An empty request selects every IPv4 interface. Unknown names are
/// dropped with a warning.
pub fn resolve_interfaces(requested: &[String]) -> Vec<Interface> {
    let available: Vec<Interface> = match local_ip_address::list_afinet_netifas() {
        Ok(list) => list
            .into_iter()
            .filter_map(|(name, ip)| match ip {
                IpAddr::V4(addr) => Some(Interface { name, addr }),
                IpAddr::V6(_) => None,
            })
            .collect(),
        Err(e) => {
            tracing::warn!(error = %e, "cannot enumerate network interfaces");
            Vec::new()
        }
    };

    if requested.is_empty() {
        if available.is_empty() {
            // Let the kernel pick the interface.
            return vec![Interface {
                name: "default".to_string(),
                addr: Ipv4Addr::UNSPECIFIED,
            }];
        }
        return available;
    }

    requested
        .iter()
        .filter_map(|name| {
            let found = available.iter().find(|i| &i.name == name).cloned();
            if found.is_none() {
                tracing::warn!(interface = %name, "no IPv4 address on interface, skipping");
            }
            found
        })
        .collect()
}

/// Attempt `join` on each candidate independently and return those that
/// succeeded. Failures are logged, never propagated.
pub fn join_interfaces<F>(candidates: Vec<Interface>, mut join: F) -> Vec<Interface>
where
    F: FnMut(&Interface) -> io::Result<()>,
{
    candidates
        .into_iter()
        .filter(|iface| match join(iface) {
            Ok(()) => {
                tracing::info!(interface = %iface.name, addr = %iface.addr, "joined discovery group");
                true
            }
            Err(e) => {
                tracing::warn!(interface = %iface.name, error = %e, "cannot join discovery group, dropping interface");
                false
            }
        })
        .collect()
}

/// Outgoing side of discovery as the local peer drives it.
pub trait Announcer: Send {
    /// Multicast to the group; returns how many interfaces it left through.
    fn announce(&self, announcement: &Announcement) -> usize;

    /// Unicast to one peer.
    fn reply_to(&self, target: SocketAddr, announcement: &Announcement) -> Result<()>;

    fn stop(&mut self);
}

/// Callback invoked on the receiver thread for every foreign announcement.
pub type AnnouncementHandler = Box<dyn Fn(Announcement, SocketAddr) + Send>;

/// Running discovery service. Dropping it stops the receiver thread.
pub struct DiscoveryService {
    socket: Arc<UdpSocket>,
    group: SocketAddrV4,
    joined: Vec<Interface>,
    running: Arc<AtomicBool>,
    receiver: Option<JoinHandle<()>>,
}

impl DiscoveryService {
    /// Bind the discovery port, join the group and start receiving.
    ///
    /// Fails with [`Error::Join`] when no interface could join.
    pub fn start(
        config: &DiscoveryConfig,
        interfaces: &[String],
        instance: u64,
        handler: AnnouncementHandler,
    ) -> Result<Self> {
        let bind_addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.port));
        let bind_err = |source| Error::Bind {
            addr: bind_addr,
            source,
        };

        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).map_err(bind_err)?;
        socket.set_reuse_address(true).map_err(bind_err)?;
        #[cfg(unix)]
        socket.set_reuse_port(true).map_err(bind_err)?;
        socket.bind(&bind_addr.into()).map_err(bind_err)?;
        socket.set_multicast_loop_v4(true)?;
        socket.set_read_timeout(Some(Duration::from_millis(200)))?;

        let group = config.group;
        let joined = join_interfaces(resolve_interfaces(interfaces), |iface| {
            socket.join_multicast_v4(&group, &iface.addr)
        });
        if joined.is_empty() {
            return Err(Error::Join { group });
        }

        let socket = Arc::new(UdpSocket::from(socket));
        let running = Arc::new(AtomicBool::new(true));
        let receiver = {
            let socket = socket.clone();
            let running = running.clone();
            thread::Builder::new()
                .name("discovery".into())
                .spawn(move || receive_loop(&socket, instance, &handler, &running))?
        };

        tracing::info!(%group, port = config.port, interfaces = joined.len(), "discovery started");
        Ok(Self {
            socket,
            group: SocketAddrV4::new(group, config.port),
            joined,
            running,
            receiver: Some(receiver),
        })
    }

    /// Interfaces on which the group was joined. Never empty.
    pub fn interfaces(&self) -> &[Interface] {
        &self.joined
    }

    /// Multicast `announcement` out of every joined interface.
    ///
    /// Returns the number of interfaces the datagram left through.
    pub fn announce(&self, announcement: &Announcement) -> usize {
        let datagram = match announcement.encode() {
            Ok(datagram) => datagram,
            Err(e) => {
                tracing::error!(kind = ?announcement.kind, error = %e, "cannot encode announcement");
                return 0;
            }
        };
        let socket = socket2::SockRef::from(&*self.socket);
        let mut sent = 0;
        for iface in &self.joined {
            let result = socket
                .set_multicast_if_v4(&iface.addr)
                .and_then(|()| self.socket.send_to(&datagram, self.group));
            match result {
                Ok(_) => sent += 1,
                Err(e) => {
                    tracing::warn!(interface = %iface.name, error = %e, "announcement not sent")
                }
            }
        }
        tracing::debug!(kind = ?announcement.kind, sent, "announced");
        sent
    }

    /// Unicast `announcement` to a single peer.
    pub fn reply_to(&self, target: SocketAddr, announcement: &Announcement) -> Result<()> {
        let datagram = announcement.encode().map_err(io::Error::from)?;
        self.socket.send_to(&datagram, target)?;
        Ok(())
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.receiver.take() {
            let _ = handle.join();
        }
    }
}

impl Announcer for DiscoveryService {
    fn announce(&self, announcement: &Announcement) -> usize {
        DiscoveryService::announce(self, announcement)
    }

    fn reply_to(&self, target: SocketAddr, announcement: &Announcement) -> Result<()> {
        DiscoveryService::reply_to(self, target, announcement)
    }

    fn stop(&mut self) {
        DiscoveryService::stop(self);
    }
}

impl Drop for DiscoveryService {
    fn drop(&mut self) {
        self.stop();
    }
}

fn receive_loop(socket: &UdpSocket, instance: u64, handler: &AnnouncementHandler, running: &AtomicBool) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    while running.load(Ordering::SeqCst) {
        match socket.recv_from(&mut buf) {
            Ok((len, from)) => match Announcement::decode(&buf[..len]) {
                Some(ann) if ann.instance == instance => {}
                Some(ann) => {
                    tracing::trace!(%from, kind = ?ann.kind, "announcement received");
                    handler(ann, from);
                }
                None => tracing::debug!(%from, len, "ignoring malformed discovery datagram"),
            },
            Err(ref e)
                if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {}
            Err(e) => {
                if running.load(Ordering::SeqCst) {
                    tracing::warn!(error = %e, "discovery receive error");
                }
            }
        }
    }
    tracing::debug!("discovery receiver exited");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iface(name: &str, last: u8) -> Interface {
        Interface {
            name: name.to_string(),
            addr: Ipv4Addr::new(10, 0, 0, last),
        }
    }

    #[test]
    fn partial_join_keeps_working_interfaces() {
        let candidates = vec![iface("eth0", 1), iface("wlan0", 2), iface("eth1", 3)];
        let joined = join_interfaces(candidates.clone(), |i| {
            if i.name == "wlan0" {
                Err(io::Error::from(io::ErrorKind::AddrNotAvailable))
            } else {
                Ok(())
            }
        });
        assert_eq!(joined, vec![iface("eth0", 1), iface("eth1", 3)]);
        assert!(joined.iter().all(|j| candidates.contains(j)));
    }

    #[test]
    fn no_joinable_interface_yields_empty_set() {
        let joined = join_interfaces(vec![iface("eth0", 1)], |_| {
            Err(io::Error::from(io::ErrorKind::PermissionDenied))
        });
        assert!(joined.is_empty());
    }

    #[test]
    fn unknown_interface_is_dropped() {
        let resolved = resolve_interfaces(&["definitely-not-an-iface0".to_string()]);
        assert!(resolved.is_empty());
    }

    #[test]
    fn failed_start_releases_the_port() {
        let port = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let config = DiscoveryConfig {
            enabled: true,
            group: crate::config::DEFAULT_MULTICAST_GROUP,
            port,
        };

        let err = DiscoveryService::start(
            &config,
            &["definitely-not-an-iface0".to_string()],
            1,
            Box::new(|_, _| {}),
        )
        .err()
        .expect("start must fail");
        assert!(matches!(err, Error::Join { group } if group == config.group));

        // Bound without SO_REUSEADDR: only succeeds if nothing holds the port.
        UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port)).expect("discovery port released");
    }
}
