//! The local peer: startup, the reactor and the front-end handle.
//!
//! ```text
//!   discovery thread ──┐
//!   accept thread ─────┼─ Job ──> control workers ──┐
//!   engine threads ────┼──────────────────────────── ┼──> Event ──> reactor
//!   PeerHandle ────────┘                            ┘        (owns engine,
//!                                                              sessions, peers)
//! ```
//!
//! Startup runs synchronously in [`LocalPeer::start`] so that every
//! startup-fatal failure (control listener bind, multicast join on no
//! interface) reaches the caller. Afterwards one reactor thread owns the
//! media engine, the local session and every remote peer, and is the only
//! place any of them is mutated. Control workers block on their own
//! connection and talk to the reactor only through [`Event`]s.

use std::collections::{HashMap, HashSet};
use std::io;
use std::net::{IpAddr, SocketAddr, TcpStream, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender};
use rand::Rng;

use crate::config::{Config, MediaConfig};
use crate::discovery::{Announcer, DiscoveryService, Interface};
use crate::error::{Error, NegotiationErrorKind, Result};
use crate::graph::{GraphEvent, MediaEngine, NodeSpec};
use crate::media::Capabilities;
use crate::monitor::{self, EventMonitor, GraphOwner, Routed};
use crate::protocol::announce::should_initiate;
use crate::protocol::message::{ControlMessage, read_message};
use crate::protocol::{AnnounceKind, Announcement, Negotiated, Negotiator};
use crate::session::{LocalSession, LocalState, PeerId, PeerInfo, RemotePeer, ReportPorts, SendTarget};
use crate::transport::tcp::{self, accept_loop};
use crate::transport::{Job, JobQueue, PortAllocator, WorkerPool};

/// Builds the node a peer's decoded video is rendered into.
pub type VideoSinkFactory = Arc<dyn Fn(&PeerInfo) -> Option<NodeSpec> + Send + Sync>;

/// Something the front-end may want to show.
#[derive(Debug, Clone)]
pub enum Notification {
    PeerConnected(PeerInfo),
    PeerDisconnected {
        peer: PeerId,
        control_addr: SocketAddr,
        reason: String,
    },
    /// A graph stopped processing. Peer graphs are torn down, a failed
    /// transmit graph is stopped until the next connection or
    /// [`PeerHandle::restart_transmit`].
    GraphFailed {
        owner: GraphOwner,
        node: String,
        message: String,
    },
    NegotiationFailed {
        remote: Option<SocketAddr>,
        error: String,
    },
}

/// Point-in-time view of the local peer.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub state: LocalState,
    /// Connected peers, oldest first.
    pub peers: Vec<PeerInfo>,
    pub transmitting: bool,
}

enum Command {
    Connect(SocketAddr, Sender<Result<()>>),
    Disconnect(PeerId, Sender<Result<()>>),
    RestartTransmit(Sender<Result<()>>),
    Snapshot(Sender<Snapshot>),
    Shutdown,
}

enum Event {
    Announcement(Announcement, SocketAddr),
    Negotiated(Box<Negotiated>),
    NegotiationFailed { remote: Option<SocketAddr>, error: Error },
    /// A connected peer's control stream ended.
    Disconnected { peer: PeerId, reason: String },
    Graph(GraphEvent),
    Command(Command),
}

impl From<GraphEvent> for Event {
    fn from(event: GraphEvent) -> Self {
        Event::Graph(event)
    }
}

/// Configures and starts the local peer.
///
/// ```no_run
/// use meshcall::{Config, LocalPeer, RecordingEngine};
///
/// let mut peer = LocalPeer::new(Config::default()).engine(RecordingEngine::new());
/// let handle = peer.start()?;
/// println!("listening on {}", handle.control_addr());
/// handle.stop();
/// # Ok::<(), meshcall::Error>(())
/// ```
pub struct LocalPeer {
    config: Config,
    engine: Option<Box<dyn MediaEngine>>,
    video_sink: Option<VideoSinkFactory>,
    notifications: Option<Sender<Notification>>,
    started: bool,
}

impl LocalPeer {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            engine: None,
            video_sink: None,
            notifications: None,
            started: false,
        }
    }

    pub fn engine(mut self, engine: impl MediaEngine + 'static) -> Self {
        self.engine = Some(Box::new(engine));
        self
    }

    /// Render each peer's video into the node returned by `factory`, or the
    /// default video output when it returns `None`.
    pub fn video_sink<F>(mut self, factory: F) -> Self
    where
        F: Fn(&PeerInfo) -> Option<NodeSpec> + Send + Sync + 'static,
    {
        self.video_sink = Some(Arc::new(factory));
        self
    }

    pub fn notifications(mut self, tx: Sender<Notification>) -> Self {
        self.notifications = Some(tx);
        self
    }

    /// Bring the peer up.
    ///
    /// Binds the report sockets and the control listener, starts playback,
    /// joins discovery and announces ourselves. Fails without leaving
    /// anything bound.
    pub fn start(&mut self) -> Result<PeerHandle> {
        if self.started {
            return Err(Error::AlreadyRunning);
        }
        self.config.validate()?;
        let mut engine = self
            .engine
            .take()
            .ok_or_else(|| Error::Config("no media engine configured".into()))?;
        self.started = true;

        let config = self.config.clone();
        let address = resolve_address(&config)?;
        let allocator = PortAllocator::new(&config.media);
        let (events_tx, events_rx) = crossbeam_channel::unbounded::<Event>();
        engine.set_event_sink(monitor::forward(events_tx.clone()));

        let mut session = LocalSession::new(
            engine.as_mut(),
            &allocator,
            address,
            &config.media,
            config.video_device.clone(),
        )?;

        let listener = tcp::bind_listener(SocketAddr::new(address, config.control_port), config.control.backlog)
            .and_then(|listener| Ok((listener.local_addr()?, listener)));
        let (control_addr, listener) = match listener {
            Ok(bound) => bound,
            Err(e) => {
                session.shutdown(engine.as_mut());
                return Err(e);
            }
        };

        let instance = rand::rng().random::<u64>();
        let announcement = Announcement {
            instance,
            kind: AnnounceKind::Hello,
            address,
            control_port: control_addr.port(),
            caps: Capabilities::default(),
        };

        let discovery = if config.discovery.enabled {
            let tx = events_tx.clone();
            let started = DiscoveryService::start(
                &config.discovery,
                &config.interfaces,
                instance,
                Box::new(move |ann, from| {
                    let _ = tx.send(Event::Announcement(ann, from));
                }),
            );
            match started {
                Ok(service) => Some(service),
                Err(e) => {
                    session.shutdown(engine.as_mut());
                    return Err(e);
                }
            }
        } else {
            tracing::info!("discovery disabled");
            None
        };
        let interfaces = discovery
            .as_ref()
            .map(|d| d.interfaces().to_vec())
            .unwrap_or_default();

        let negotiator = Negotiator::new(
            address,
            control_addr.port(),
            announcement.caps.clone(),
            session.report_ports(),
            allocator,
            config.control.clone(),
        );
        let pool = {
            let tx = events_tx.clone();
            let max_message = config.control.max_message_bytes;
            WorkerPool::spawn(config.control.workers, move |job| {
                run_job(&negotiator, job, &tx, max_message)
            })
        };

        let running = Arc::new(AtomicBool::new(true));
        let acceptor = {
            let queue = pool.queue();
            let running = running.clone();
            thread::Builder::new()
                .name("control-accept".into())
                .spawn(move || accept_loop(listener, queue, running))?
        };

        let report_ports = session.report_ports();
        let reactor = Reactor {
            engine,
            session,
            media: config.media.clone(),
            monitor: EventMonitor::new(),
            peers: HashMap::new(),
            pending: HashSet::new(),
            queue: pool.queue(),
            discovery: discovery.map(|d| Box::new(d) as Box<dyn Announcer>),
            announcement,
            control_addr,
            video_sink: self.video_sink.clone(),
            notify: self.notifications.clone(),
        };
        let reactor = thread::Builder::new()
            .name("reactor".into())
            .spawn(move || reactor.run(events_rx))?;

        tracing::info!(
            %control_addr,
            workers = pool.size(),
            audio_report = report_ports.audio,
            video_report = report_ports.video,
            "local peer started"
        );
        Ok(PeerHandle {
            control_addr,
            report_ports,
            interfaces,
            events: events_tx,
            running,
            acceptor: Some(acceptor),
            reactor: Some(reactor),
            _pool: pool,
        })
    }
}

/// Address to bind and advertise: configured, else the primary LAN address.
fn resolve_address(config: &Config) -> Result<IpAddr> {
    if let Some(address) = config.address {
        return Ok(address);
    }
    match local_ip_address::local_ip() {
        Ok(address) => Ok(address),
        Err(e) => {
            tracing::debug!(error = %e, "interface lookup failed, asking the routing table");
            let probe = UdpSocket::bind("0.0.0.0:0")?;
            probe.connect("8.8.8.8:80")?;
            Ok(probe.local_addr()?.ip())
        }
    }
}

/// Body of a control worker: negotiate, hand the result to the reactor,
/// then watch the control stream until the pairing ends.
fn run_job(negotiator: &Negotiator, job: Job, events: &Sender<Event>, max_message: usize) {
    let (remote, result) = match job {
        Job::Accepted(stream) => (stream.peer_addr().ok(), negotiator.respond(stream)),
        Job::Connect(addr) => (Some(addr), negotiator.initiate(addr)),
    };
    let negotiated = match result {
        Ok(negotiated) => negotiated,
        Err(error) => {
            let _ = events.send(Event::NegotiationFailed { remote, error });
            return;
        }
    };

    let peer = negotiated.id;
    let watch = negotiated.stream.try_clone();
    if events.send(Event::Negotiated(Box::new(negotiated))).is_err() {
        return;
    }
    let reason = match watch {
        Ok(stream) => watch_stream(stream, max_message),
        Err(e) => {
            tracing::warn!(%peer, error = %e, "cannot watch control stream");
            return;
        }
    };
    let _ = events.send(Event::Disconnected { peer, reason });
}

fn watch_stream(mut stream: TcpStream, max_message: usize) -> String {
    loop {
        match read_message(&mut stream, max_message) {
            Ok(ControlMessage::Bye) => return "bye received".into(),
            Ok(other) => tracing::debug!(kind = other.kind(), "ignoring control message after negotiation"),
            Err(NegotiationErrorKind::Closed) => return "control connection closed".into(),
            Err(e) => return format!("control connection failed: {e}"),
        }
    }
}

struct Reactor {
    engine: Box<dyn MediaEngine>,
    session: LocalSession,
    media: MediaConfig,
    monitor: EventMonitor,
    peers: HashMap<PeerId, RemotePeer>,
    /// Control addresses we are currently dialling.
    pending: HashSet<SocketAddr>,
    queue: JobQueue,
    discovery: Option<Box<dyn Announcer>>,
    announcement: Announcement,
    control_addr: SocketAddr,
    video_sink: Option<VideoSinkFactory>,
    notify: Option<Sender<Notification>>,
}

impl Reactor {
    fn run(mut self, events: Receiver<Event>) {
        self.monitor.watch(self.session.playback().graph(), GraphOwner::Playback);
        if let Some(discovery) = &self.discovery {
            discovery.announce(&self.announcement);
        }

        for event in events.iter() {
            match event {
                Event::Announcement(ann, from) => self.on_announcement(ann, from),
                Event::Negotiated(negotiated) => self.on_negotiated(*negotiated),
                Event::NegotiationFailed { remote, error } => {
                    if let Some(remote) = remote {
                        self.pending.remove(&remote);
                    }
                    tracing::warn!(remote = ?remote, %error, "negotiation failed");
                    self.send(Notification::NegotiationFailed {
                        remote,
                        error: error.to_string(),
                    });
                }
                Event::Disconnected { peer, reason } => {
                    self.remove_peer(peer, &reason, false);
                }
                Event::Graph(event) => self.on_graph_event(event),
                Event::Command(Command::Shutdown) => break,
                Event::Command(command) => self.on_command(command),
            }
        }
        self.shutdown();
    }

    fn send(&self, notification: Notification) {
        if let Some(tx) = &self.notify {
            let _ = tx.send(notification);
        }
    }

    fn find(&self, control_addr: SocketAddr) -> Option<PeerId> {
        self.peers
            .values()
            .find(|p| p.control_addr() == control_addr)
            .map(RemotePeer::id)
    }

    fn on_announcement(&mut self, ann: Announcement, from: SocketAddr) {
        let remote = ann.control_addr();
        match ann.kind {
            AnnounceKind::Hello | AnnounceKind::Reply => {
                if ann.kind == AnnounceKind::Hello
                    && let Some(discovery) = &self.discovery
                {
                    let reply = self.announcement.with_kind(AnnounceKind::Reply);
                    if let Err(e) = discovery.reply_to(from, &reply) {
                        tracing::warn!(%from, error = %e, "discovery reply not sent");
                    }
                }
                if self.find(remote).is_some() || self.pending.contains(&remote) {
                    return;
                }
                if !should_initiate(self.control_addr, remote) {
                    tracing::debug!(peer = %remote, "waiting for peer to connect");
                    return;
                }
                self.dial(remote);
            }
            AnnounceKind::Goodbye => {
                self.pending.remove(&remote);
                if let Some(id) = self.find(remote) {
                    self.remove_peer(id, "goodbye received", false);
                }
            }
        }
    }

    fn dial(&mut self, remote: SocketAddr) -> bool {
        if !self.queue.submit(Job::Connect(remote)) {
            return false;
        }
        self.pending.insert(remote);
        tracing::info!(peer = %remote, "connecting");
        true
    }

    /// When both sides dialled each other, both keep the connection the
    /// side with the lower control address dialled; the other one is
    /// closed with a `bye`, whichever order they completed in.
    fn on_negotiated(&mut self, negotiated: Negotiated) {
        let control = negotiated.remote.control_addr();
        self.pending.remove(&control);
        let preferred = negotiated.initiated == should_initiate(self.control_addr, control);
        let peer = RemotePeer::new(negotiated);
        let id = peer.id();

        let replaces = self.find(control);
        if let Some(existing) = replaces
            && !preferred
        {
            tracing::info!(%id, %existing, peer = %control, "duplicate pairing dropped");
            peer.teardown(self.engine.as_mut(), self.session.playback(), true);
            return;
        }

        match self.bring_up(peer) {
            Ok(info) => {
                tracing::info!(%id, peer = %control, ports = ?info.recv_ports, "peer connected");
                self.send(Notification::PeerConnected(info));
                if let Some(existing) = replaces {
                    self.remove_peer(existing, "replaced by a duplicate pairing", true);
                }
            }
            Err(error) => {
                tracing::warn!(%id, peer = %control, %error, "peer setup failed");
                self.send(Notification::NegotiationFailed {
                    remote: Some(control),
                    error: error.to_string(),
                });
            }
        }
    }

    /// Receive graph, bridge, activation, transmit, in that order. On
    /// failure the peer is torn down and nothing of it stays registered.
    fn bring_up(&mut self, mut peer: RemotePeer) -> Result<PeerInfo> {
        let id = peer.id();
        let owner = GraphOwner::Peer(id);
        let result = (|| {
            let graph = peer.build_receive(self.engine.as_mut(), &self.media)?;
            self.monitor.watch(graph, owner);
            let sink = self.video_sink.as_ref().and_then(|factory| factory(&peer.info()));
            peer.bridge_into(self.engine.as_mut(), self.session.playback(), sink)?;
            for graph in peer.graphs() {
                self.monitor.watch(graph, owner);
            }
            peer.activate(self.engine.as_mut())
        })();
        if let Err(e) = result {
            self.monitor.unwatch_owner(owner);
            peer.teardown(self.engine.as_mut(), self.session.playback(), true);
            return Err(e);
        }

        self.start_sending_to(peer.target());
        let info = peer.info();
        self.peers.insert(id, peer);
        Ok(info)
    }

    /// Add `target` to the running transmit graph, or build the graph for
    /// every connected peer plus `target`.
    fn start_sending_to(&mut self, target: SendTarget) {
        let result = if self.session.transmit_graph().is_some() {
            self.session.add_target(self.engine.as_mut(), &target)
        } else {
            let mut targets: Vec<SendTarget> = self.peers.values().map(RemotePeer::target).collect();
            targets.push(target);
            self.build_transmit(&targets)
        };
        if let Err(e) = result {
            tracing::error!(peer = %target.address, error = %e, "cannot transmit to peer");
            self.send(Notification::GraphFailed {
                owner: GraphOwner::Transmit,
                node: "transmit".into(),
                message: e.to_string(),
            });
        }
    }

    fn build_transmit(&mut self, targets: &[SendTarget]) -> Result<()> {
        let graph = self.session.setup_transmit(self.engine.as_mut(), targets)?;
        self.monitor.watch(graph, GraphOwner::Transmit);
        Ok(())
    }

    fn stop_transmit(&mut self) {
        self.monitor.unwatch_owner(GraphOwner::Transmit);
        self.session.stop_transmit(self.engine.as_mut());
    }

    /// Tear `id` down completely. Returns whether it was connected.
    fn remove_peer(&mut self, id: PeerId, reason: &str, send_bye: bool) -> bool {
        let Some(peer) = self.peers.remove(&id) else {
            return false;
        };
        self.monitor.unwatch_owner(GraphOwner::Peer(id));
        self.session.remove_target(self.engine.as_mut(), &peer.target());
        let control_addr = peer.control_addr();
        peer.teardown(self.engine.as_mut(), self.session.playback(), send_bye);
        if self.peers.is_empty() {
            self.stop_transmit();
        }

        tracing::info!(%id, peer = %control_addr, reason, "peer disconnected");
        self.send(Notification::PeerDisconnected {
            peer: id,
            control_addr,
            reason: reason.to_string(),
        });
        true
    }

    fn on_graph_event(&mut self, event: GraphEvent) {
        let Some(Routed { owner, event }) = self.monitor.route(event) else {
            return;
        };
        match event {
            GraphEvent::EndpointAppeared { node, endpoint, .. } => {
                let GraphOwner::Peer(id) = owner else {
                    tracing::debug!(%owner, %node, "endpoint outside a receive graph ignored");
                    return;
                };
                let Some(peer) = self.peers.get_mut(&id) else {
                    return;
                };
                if let Err(e) = peer.link_endpoint(self.engine.as_mut(), &node, endpoint) {
                    tracing::error!(%id, error = %e, "dropping peer");
                    self.remove_peer(id, &e.to_string(), true);
                }
            }
            GraphEvent::ProcessingError { node, message, .. } => {
                self.send(Notification::GraphFailed {
                    owner,
                    node: node.clone(),
                    message: message.clone(),
                });
                match owner {
                    GraphOwner::Transmit => self.stop_transmit(),
                    GraphOwner::Playback => {}
                    GraphOwner::Peer(id) => {
                        let reason = Error::Graph { node, message }.to_string();
                        self.remove_peer(id, &reason, true);
                    }
                }
            }
        }
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Connect(remote, reply) => {
                let result = if self.find(remote).is_some() || self.pending.contains(&remote) {
                    Ok(())
                } else if self.dial(remote) {
                    Ok(())
                } else {
                    Err(Error::Negotiation {
                        peer: remote,
                        kind: NegotiationErrorKind::Refused(io::ErrorKind::WouldBlock),
                    })
                };
                let _ = reply.send(result);
            }
            Command::Disconnect(id, reply) => {
                let result = if self.remove_peer(id, "disconnected locally", true) {
                    Ok(())
                } else {
                    Err(Error::PeerNotFound(id))
                };
                let _ = reply.send(result);
            }
            Command::RestartTransmit(reply) => {
                self.stop_transmit();
                let targets: Vec<SendTarget> = self.peers.values().map(RemotePeer::target).collect();
                let result = if targets.is_empty() {
                    Ok(())
                } else {
                    self.build_transmit(&targets)
                };
                let _ = reply.send(result);
            }
            Command::Snapshot(reply) => {
                let mut peers: Vec<PeerInfo> = self.peers.values().map(RemotePeer::info).collect();
                peers.sort_by_key(|p| p.id);
                let _ = reply.send(Snapshot {
                    state: self.session.state(),
                    peers,
                    transmitting: self.session.transmit_graph().is_some(),
                });
            }
            Command::Shutdown => {}
        }
    }

    fn shutdown(&mut self) {
        let ids: Vec<PeerId> = self.peers.keys().copied().collect();
        for id in ids {
            self.remove_peer(id, "shutting down", true);
        }
        if let Some(mut discovery) = self.discovery.take() {
            discovery.announce(&self.announcement.with_kind(AnnounceKind::Goodbye));
            discovery.stop();
        }
        self.session.shutdown(self.engine.as_mut());
        tracing::info!(control_addr = %self.control_addr, "local peer stopped");
    }
}

/// Handle to a running local peer. Dropping it stops the peer.
pub struct PeerHandle {
    control_addr: SocketAddr,
    report_ports: ReportPorts,
    interfaces: Vec<Interface>,
    events: Sender<Event>,
    running: Arc<AtomicBool>,
    acceptor: Option<JoinHandle<()>>,
    reactor: Option<JoinHandle<()>>,
    _pool: WorkerPool,
}

impl PeerHandle {
    pub fn control_addr(&self) -> SocketAddr {
        self.control_addr
    }

    pub fn address(&self) -> IpAddr {
        self.control_addr.ip()
    }

    pub fn report_ports(&self) -> ReportPorts {
        self.report_ports
    }

    /// Interfaces discovery joined. Empty when discovery is disabled.
    pub fn interfaces(&self) -> &[Interface] {
        &self.interfaces
    }

    fn request<T>(&self, command: impl FnOnce(Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = crossbeam_channel::bounded(1);
        self.events
            .send(Event::Command(command(tx)))
            .map_err(|_| Error::NotStarted)?;
        rx.recv().map_err(|_| Error::NotStarted)
    }

    /// Dial a peer's control address, bypassing discovery. Returns once the
    /// attempt is queued; the outcome arrives as a [`Notification`].
    pub fn connect(&self, remote: SocketAddr) -> Result<()> {
        self.request(|tx| Command::Connect(remote, tx))?
    }

    pub fn disconnect(&self, peer: PeerId) -> Result<()> {
        self.request(|tx| Command::Disconnect(peer, tx))?
    }

    /// Rebuild the transmit graph for every connected peer.
    pub fn restart_transmit(&self) -> Result<()> {
        self.request(Command::RestartTransmit)?
    }

    pub fn snapshot(&self) -> Result<Snapshot> {
        self.request(Command::Snapshot)
    }

    /// Say goodbye, tear every peer down and wait for the reactor to exit.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(acceptor) = self.acceptor.take() {
            let _ = acceptor.join();
        }
        if let Some(reactor) = self.reactor.take() {
            let _ = self.events.send(Event::Command(Command::Shutdown));
            let _ = reactor.join();
        }
    }
}

impl Drop for PeerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}
