use std::collections::HashMap;
use std::io::{ErrorKind, Read};
use std::net::{Shutdown, SocketAddr};
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use mio::net::{TcpListener, TcpStream};
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token, Waker};
use tokio_util::codec::Decoder;
use tracing::{debug, info, warn};

use protocol::{FrameCodec, FRAME_SIZE};

use crate::config::ServerConfig;
use crate::dispatcher::{Dispatcher, Task};
use crate::error::{PoolError, ServerError};
use crate::inbox::Inboxes;
use crate::registry::{ConnId, Connection, Registry};
use crate::thread_pool::ThreadPool;

const LISTENER: Token = Token(0);
const WAKER: Token = Token(1);
const FIRST_CONN_TOKEN: usize = 2;

// frames taken from one connection per readiness event before yielding
const READ_BUDGET: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Listening,
    Running,
    ShuttingDown,
    Destroyed,
}

/// Asks a running event loop to stop. Cloneable and safe to trigger from any
/// thread, e.g. a signal watcher.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    requested: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.requested.store(true, Ordering::SeqCst);
        if let Err(e) = self.waker.wake() {
            warn!("unable to wake event loop: {}", e);
        }
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }
}

// reactor side view of a connection, the read half plus reassembly buffer
struct Peer {
    stream: Arc<TcpStream>,
    buf: BytesMut,
}

/// The relay: a single threaded readiness loop that accepts and reads, plus
/// a worker pool that runs the dispatcher against the shared registry.
pub struct Server {
    state: ServerState,
    config: ServerConfig,
    pool: ThreadPool<ConnId>,
    inboxes: Arc<Inboxes<Task>>,
    registry: Arc<Registry>,
    listener: Option<TcpListener>,
    poll: Option<Poll>,
    shutdown: ShutdownHandle,
    peers: HashMap<Token, Peer>,
    codec: FrameCodec,
    next_token: usize,
    local_addr: SocketAddr,
}

impl Server {
    /// Starts the pool, binds and registers the listening socket. Either the
    /// whole server comes up or nothing stays allocated.
    pub fn bind(config: ServerConfig) -> Result<Server, ServerError> {
        if config.events_capacity == 0 {
            return Err(ServerError::BadParam("events capacity must be positive"))
        }

        let registry = Arc::new(Registry::new());
        let inboxes = Arc::new(Inboxes::new());
        let dispatcher = Dispatcher::new(&registry);

        // workers are handed a connection id and drain that connection's inbox
        let pool = ThreadPool::new(config.workers, config.queue_hint, {
            let inboxes = Arc::clone(&inboxes);
            move |id: ConnId| inboxes.drain(id, |task| dispatcher.dispatch(task))
        })?;
        debug!("pool ready with {} workers", pool.size());

        let (listener, poll, waker, local_addr) = match Server::listen(&config) {
            Ok(parts) => parts,
            Err(e) => {
                pool.shutdown();
                return Err(e)
            }
        };

        info!("server listening on {}", local_addr);

        Ok(Server {
            state: ServerState::Listening,
            config,
            pool,
            inboxes,
            registry,
            listener: Some(listener),
            poll: Some(poll),
            shutdown: ShutdownHandle {
                requested: Arc::new(AtomicBool::new(false)),
                waker,
            },
            peers: HashMap::new(),
            codec: FrameCodec,
            next_token: FIRST_CONN_TOKEN,
            local_addr,
        })
    }

    // mio's bind sets SO_REUSEADDR and O_NONBLOCK and listens with a fixed backlog
    fn listen(config: &ServerConfig) -> Result<(TcpListener, Poll, Arc<Waker>, SocketAddr), ServerError> {
        let mut listener = TcpListener::bind(config.addr).map_err(ServerError::init("bind listening socket"))?;
        let local_addr = listener.local_addr().map_err(ServerError::init("read listening address"))?;

        let poll = Poll::new().map_err(ServerError::init("create poll"))?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)
            .map_err(ServerError::init("register listening socket"))?;
        let waker = Waker::new(poll.registry(), WAKER).map_err(ServerError::init("create waker"))?;

        Ok((listener, poll, Arc::new(waker), local_addr))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn registry(&self) -> Arc<Registry> {
        Arc::clone(&self.registry)
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    /// Runs the event loop until a `ShutdownHandle` fires.
    pub fn run(&mut self) -> Result<(), ServerError> {
        if self.state == ServerState::Destroyed {
            return Err(ServerError::Destroyed)
        }

        let mut events = Events::with_capacity(self.config.events_capacity);
        self.state = ServerState::Running;

        while !self.shutdown.is_requested() {
            let Some(poll) = self.poll.as_mut() else { break };

            if let Err(e) = poll.poll(&mut events, None) {
                if e.kind() == ErrorKind::Interrupted {
                    continue
                }
                self.state = ServerState::ShuttingDown;
                return Err(ServerError::Runtime(e))
            }

            for event in events.iter() {
                match event.token() {
                    LISTENER => self.accept_connections(),
                    WAKER => debug!("event loop woken"),
                    token => self.read_connection(token),
                }
            }
        }

        self.state = ServerState::ShuttingDown;
        info!("event loop stopped");
        Ok(())
    }

    // edge triggered, so accept until the backlog is empty
    fn accept_connections(&mut self) {
        let (Some(listener), Some(poll)) = (self.listener.as_ref(), self.poll.as_ref()) else {
            return
        };

        loop {
            let (stream, addr) = match listener.accept() {
                Ok(accepted) => accepted,
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("accept failed: {}", e);
                    break
                }
            };

            let token = Token(self.next_token);
            self.next_token += 1;
            let id = ConnId(token.0);

            // accepted sockets come back non-blocking from mio
            let stream = Arc::new(stream);
            let fd = stream.as_raw_fd();

            if let Err(e) = poll.registry().register(&mut SourceFd(&fd), token, Interest::READABLE) {
                warn!("unable to watch {} from {}: {}", id, addr, e);
                let _ = stream.shutdown(Shutdown::Both);
                continue
            }

            if let Err(e) = self.registry.add(Connection::new(id, addr, Arc::clone(&stream))) {
                warn!("unable to add {} from {}: {}", id, addr, e);
                let _ = poll.registry().deregister(&mut SourceFd(&fd));
                let _ = stream.shutdown(Shutdown::Both);
                continue
            }

            self.peers.insert(token, Peer {
                stream,
                buf: BytesMut::with_capacity(FRAME_SIZE),
            });

            info!("accepted {} from {}", id, addr);
        }
    }

    // read at most one frame's worth at a time and queue each block as it completes
    fn read_connection(&mut self, token: Token) {
        let id = ConnId(token.0);

        let Some(peer) = self.peers.get_mut(&token) else {
            debug!("readiness for closed {}", id);
            return
        };

        let mut closed = false;
        let mut frames = 0;
        let mut chunk = [0u8; FRAME_SIZE];

        loop {
            if frames == READ_BUDGET {
                // edge triggered, re-arming makes the next poll report what is left
                if let Some(poll) = self.poll.as_ref() {
                    let fd = peer.stream.as_raw_fd();
                    if let Err(e) = poll.registry().reregister(&mut SourceFd(&fd), token, Interest::READABLE) {
                        warn!("unable to re-arm {}: {}", id, e);
                        closed = true;
                    }
                }
                break
            }

            // the buffer never holds more than one partial block
            let want = FRAME_SIZE - peer.buf.len();
            match (&*peer.stream).read(&mut chunk[..want]) {
                Ok(0) => {
                    closed = true;
                    break
                }
                Ok(n) => peer.buf.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("read from {} failed: {}", id, e);
                    closed = true;
                    break
                }
            }

            let task = match self.codec.decode(&mut peer.buf) {
                Ok(Some(frame)) => {
                    debug!("{} sent {} ({} bytes)", id, frame.kind(), frame.len());
                    Task::from_frame(id, frame)
                }
                Ok(None) => continue,
                Err(error) => Task::Reject { id, error },
            };
            frames += 1;

            if let Err(e) = enqueue(&self.inboxes, &self.pool, task) {
                warn!("task from {} dropped: {}", id, e);
            }
        }

        if closed {
            self.close_connection(token);
        }
    }

    fn close_connection(&mut self, token: Token) {
        let id = ConnId(token.0);
        let Some(peer) = self.peers.remove(&token) else { return };

        if let Some(poll) = self.poll.as_ref() {
            let fd = peer.stream.as_raw_fd();
            if let Err(e) = poll.registry().deregister(&mut SourceFd(&fd)) {
                debug!("deregister of {} failed: {}", id, e);
            }
        }
        let _ = peer.stream.shutdown(Shutdown::Both);

        info!("{} disconnected", id);

        // removal and the offline notice happen on a worker, after any
        // frames still queued for this connection
        if let Err(e) = enqueue(&self.inboxes, &self.pool, Task::Close { id }) {
            warn!("close of {} not queued ({}), removing inline", id, e);
            self.registry.remove(id);
        }
    }

    /// Tears everything down: stops accepting, joins the pool, closes every
    /// connection, then drops the listening socket and the poll handle.
    /// Calling it again is a no-op.
    pub fn destroy(&mut self) -> Result<(), ServerError> {
        if self.state == ServerState::Destroyed {
            debug!("server already destroyed");
            return Ok(())
        }
        self.state = ServerState::ShuttingDown;

        if let (Some(poll), Some(listener)) = (self.poll.as_ref(), self.listener.as_mut()) {
            if let Err(e) = poll.registry().deregister(listener) {
                debug!("deregister of listener failed: {}", e);
            }
        }

        // no worker can touch the registry once the pool is joined
        self.pool.shutdown();

        let dropped = self.inboxes.clear();
        if dropped > 0 {
            debug!("{} queued tasks dropped", dropped);
        }

        for conn in self.registry.drain() {
            conn.close();
            debug!("closed {}", conn.id());
        }
        self.peers.clear();

        self.listener = None;
        self.poll = None;
        self.state = ServerState::Destroyed;

        info!("server destroyed");
        Ok(())
    }
}

// Queues `task` in its connection's inbox and wakes a worker if none is
// draining that inbox yet.
fn enqueue(inboxes: &Inboxes<Task>, pool: &ThreadPool<ConnId>, task: Task) -> Result<(), PoolError> {
    let id = task.id();

    let schedule = match task {
        Task::Close { .. } => inboxes.push_last(id, task)?,
        _ => inboxes.push(id, task)?,
    };

    if schedule {
        if let Err(e) = pool.submit(id) {
            inboxes.discard(id);
            return Err(e)
        }
    }

    Ok(())
}

impl Drop for Server {
    fn drop(&mut self) {
        let _ = self.destroy();
    }
}
