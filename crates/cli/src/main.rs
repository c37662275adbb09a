use std::io;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::process;
use std::thread;

use clap::Parser;
use meshcall::{Config, LocalPeer, MediaEngine, Notification};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "meshcall", about = "LAN multi-party audio/video conferencing peer")]
struct Args {
    /// Interface to join the discovery group on (repeatable; default: all)
    #[arg(long = "interface", short = 'i')]
    interfaces: Vec<String>,

    /// Control-channel TCP port
    #[arg(long, short)]
    port: Option<u16>,

    /// Local address to bind and advertise
    #[arg(long, short)]
    address: Option<IpAddr>,

    /// Video capture device (default: test pattern)
    #[arg(long, short)]
    device: Option<String>,

    /// TOML configuration file; command-line options take precedence
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Do not join the discovery group
    #[arg(long)]
    no_discovery: bool,

    /// Control address of a peer to dial at startup (repeatable)
    #[arg(long, value_name = "HOST:PORT")]
    connect: Vec<SocketAddr>,
}

impl Args {
    fn load_config(&self) -> Result<Config, String> {
        let mut config = match &self.config {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .map_err(|e| format!("cannot read {}: {e}", path.display()))?;
                toml::from_str(&text).map_err(|e| format!("cannot parse {}: {e}", path.display()))?
            }
            None => Config::default(),
        };
        if !self.interfaces.is_empty() {
            config.interfaces = self.interfaces.clone();
        }
        if let Some(port) = self.port {
            config.control_port = port;
        }
        if self.address.is_some() {
            config.address = self.address;
        }
        if self.device.is_some() {
            config.video_device = self.device.clone();
        }
        if self.no_discovery {
            config.discovery.enabled = false;
        }
        Ok(config)
    }
}

#[cfg(feature = "gstreamer")]
fn engine() -> Result<impl MediaEngine + 'static, String> {
    meshcall_gst::GstEngine::new().map_err(|e| e.to_string())
}

#[cfg(not(feature = "gstreamer"))]
fn engine() -> Result<impl MediaEngine + 'static, String> {
    tracing::warn!("built without the `gstreamer` feature: media graphs are recorded, not run");
    Ok(meshcall::RecordingEngine::new())
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let config = match args.load_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Invalid configuration: {e}");
            process::exit(1);
        }
    };
    let engine = match engine() {
        Ok(engine) => engine,
        Err(e) => {
            eprintln!("Failed to initialise media engine: {e}");
            process::exit(1);
        }
    };

    let (tx, rx) = crossbeam_channel::unbounded();
    let mut peer = LocalPeer::new(config).engine(engine).notifications(tx);
    let handle = match peer.start() {
        Ok(handle) => handle,
        Err(e) => {
            eprintln!("Failed to start: {e}");
            process::exit(1);
        }
    };

    thread::spawn(move || {
        for note in rx {
            match note {
                Notification::PeerConnected(info) => {
                    println!("+ peer {} at {} connected", info.id, info.control_addr)
                }
                Notification::PeerDisconnected {
                    peer,
                    control_addr,
                    reason,
                } => println!("- peer {peer} at {control_addr} left: {reason}"),
                Notification::GraphFailed { owner, node, message } => {
                    println!("! {owner} failed in {node}: {message}")
                }
                Notification::NegotiationFailed { remote, error } => match remote {
                    Some(remote) => println!("! pairing with {remote} failed: {error}"),
                    None => println!("! pairing failed: {error}"),
                },
            }
        }
    });

    for remote in &args.connect {
        if let Err(e) = handle.connect(*remote) {
            eprintln!("Cannot connect to {remote}: {e}");
        }
    }

    let joined: Vec<&str> = handle.interfaces().iter().map(|i| i.name.as_str()).collect();
    println!(
        "Listening on {} (discovery on [{}]), press Enter to stop",
        handle.control_addr(),
        joined.join(", ")
    );
    let mut input = String::new();
    if let Err(e) = io::stdin().read_line(&mut input) {
        tracing::warn!(error = %e, "stdin unavailable, stopping");
    }

    handle.stop();
}
