use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, TrySendError};
use socket2::{Domain, Protocol, Socket, Type};

use crate::error::{Error, Result};

/// Bind the control-channel listener with an explicit backlog.
///
/// The listener is non-blocking so that [`accept_loop`] can poll its
/// `running` flag.
pub fn bind_listener(addr: SocketAddr, backlog: i32) -> Result<TcpListener> {
    let bind_err = |source| Error::Bind { addr, source };
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(bind_err)?;
    socket.set_reuse_address(true).map_err(bind_err)?;
    socket.bind(&addr.into()).map_err(bind_err)?;
    socket.listen(backlog).map_err(bind_err)?;
    socket.set_nonblocking(true).map_err(bind_err)?;
    Ok(socket.into())
}

/// Unit of work for a control-channel worker.
#[derive(Debug)]
pub enum Job {
    /// An inbound connection: we are the responder.
    Accepted(TcpStream),
    /// Dial a candidate peer's control address: we are the initiator.
    Connect(SocketAddr),
}

/// Cloneable submission side of a [`WorkerPool`].
#[derive(Clone)]
pub struct JobQueue {
    tx: Sender<Job>,
}

impl JobQueue {
    /// Queue a job without blocking. Returns `false` when every worker is
    /// busy and the queue is full; the job is dropped.
    pub fn submit(&self, job: Job) -> bool {
        match self.tx.try_send(job) {
            Ok(()) => true,
            Err(TrySendError::Full(job)) => {
                tracing::warn!(?job, "control worker pool saturated, dropping job");
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }
}

/// Bounded pool of blocking control-channel workers.
///
/// Negotiation reads block, so each connection occupies one worker for its
/// lifetime. The queue holds at most one pending job per worker.
pub struct WorkerPool {
    queue: JobQueue,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn spawn<F>(workers: usize, handler: F) -> Self
    where
        F: Fn(Job) + Send + Sync + 'static,
    {
        let (tx, rx) = crossbeam_channel::bounded::<Job>(workers);
        let handler = Arc::new(handler);
        let handles = (0..workers)
            .map(|i| {
                let rx: Receiver<Job> = rx.clone();
                let handler = handler.clone();
                thread::Builder::new()
                    .name(format!("control-worker-{i}"))
                    .spawn(move || {
                        for job in rx.iter() {
                            handler(job);
                        }
                    })
            })
            .filter_map(|spawned| match spawned {
                Ok(handle) => Some(handle),
                Err(e) => {
                    tracing::warn!(error = %e, "failed to spawn control worker");
                    None
                }
            })
            .collect();

        Self {
            queue: JobQueue { tx },
            handles,
        }
    }

    pub fn queue(&self) -> JobQueue {
        self.queue.clone()
    }

    pub fn size(&self) -> usize {
        self.handles.len()
    }
}

/// Non-blocking TCP accept loop.
///
/// Checks the `running` flag between accepts with a 50ms poll interval
/// so that shutdown can terminate it promptly. Accepted streams go to the
/// worker pool; nothing here blocks on a peer.
pub fn accept_loop(listener: TcpListener, queue: JobQueue, running: Arc<AtomicBool>) {
    while running.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, peer_addr)) => {
                if stream.set_nonblocking(false).is_err() {
                    continue;
                }
                tracing::debug!(%peer_addr, "control connection accepted");
                if !queue.submit(Job::Accepted(stream)) {
                    tracing::warn!(%peer_addr, "control connection rejected");
                }
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(50));
            }
            Err(e) => {
                if running.load(Ordering::SeqCst) {
                    tracing::warn!(error = %e, "TCP accept error");
                }
            }
        }
    }
    tracing::debug!("accept loop exited");
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;
    use std::sync::atomic::AtomicUsize;

    use super::*;

    #[test]
    fn listener_reports_bind_error() {
        let taken = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let addr = taken.local_addr().unwrap();
        // SO_REUSEADDR does not allow two listeners on one port.
        let err = bind_listener(addr, 10).unwrap_err();
        assert!(matches!(err, Error::Bind { addr: a, .. } if a == addr));
    }

    #[test]
    fn accepted_streams_reach_workers() {
        let listener = bind_listener((Ipv4Addr::LOCALHOST, 0).into(), 10).unwrap();
        let addr = listener.local_addr().unwrap();

        let (done_tx, done_rx) = crossbeam_channel::unbounded();
        let pool = WorkerPool::spawn(2, move |job| {
            if let Job::Accepted(stream) = job {
                let _ = done_tx.send(stream.peer_addr().is_ok());
            }
        });
        assert_eq!(pool.size(), 2);

        let running = Arc::new(AtomicBool::new(true));
        let r = running.clone();
        let queue = pool.queue();
        let accept = thread::spawn(move || accept_loop(listener, queue, r));

        let _client = TcpStream::connect(addr).unwrap();
        assert_eq!(done_rx.recv_timeout(Duration::from_secs(5)), Ok(true));

        running.store(false, Ordering::SeqCst);
        accept.join().unwrap();
    }

    #[test]
    fn saturated_pool_drops_jobs() {
        let (release_tx, release_rx) = crossbeam_channel::bounded::<()>(0);
        let started = Arc::new(AtomicUsize::new(0));
        let s = started.clone();
        let pool = WorkerPool::spawn(1, move |_| {
            s.fetch_add(1, Ordering::SeqCst);
            let _ = release_rx.recv();
        });
        let queue = pool.queue();
        let target: SocketAddr = "127.0.0.1:9".parse().unwrap();

        assert!(queue.submit(Job::Connect(target)));
        while started.load(Ordering::SeqCst) == 0 {
            thread::sleep(Duration::from_millis(5));
        }
        // One busy worker, one queued job, then the queue is full.
        assert!(queue.submit(Job::Connect(target)));
        assert!(!queue.submit(Job::Connect(target)));

        release_tx.send(()).unwrap();
        release_tx.send(()).unwrap();
    }
}
