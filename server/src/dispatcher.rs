use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, info, warn};

use protocol::{Frame, FrameError, Kind};

use crate::registry::{ConnId, Registry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presence {
    Online,
    Offline,
}

impl Presence {
    fn kind(self) -> Kind {
        match self {
            Presence::Online => Kind::Online,
            Presence::Offline => Kind::Offline,
        }
    }

    fn word(self) -> &'static str {
        match self {
            Presence::Online => "online",
            Presence::Offline => "offline",
        }
    }
}

// Work handed from the reactor to the pool, one variant per kind of handling
#[derive(Debug)]
pub enum Task {
    Register { id: ConnId, name: Bytes },
    Plain { id: ConnId, text: Bytes },
    Presence { id: ConnId, presence: Presence },
    Close { id: ConnId },
    Reject { id: ConnId, error: FrameError },
}

impl Task {
    pub fn from_frame(id: ConnId, frame: Frame) -> Task {
        match frame.kind() {
            Kind::Register => Task::Register { id, name: frame.payload().clone() },
            Kind::Plain => Task::Plain { id, text: frame.payload().clone() },
            Kind::Online => Task::Presence { id, presence: Presence::Online },
            Kind::Offline => Task::Presence { id, presence: Presence::Offline },
        }
    }

    pub fn id(&self) -> ConnId {
        match self {
            Task::Register { id, .. }
            | Task::Plain { id, .. }
            | Task::Presence { id, .. }
            | Task::Close { id }
            | Task::Reject { id, .. } => *id,
        }
    }
}

/// Runs on pool workers: applies a task to the shared registry and fans out
/// whatever it produces.
pub struct Dispatcher {
    registry: Arc<Registry>,
}

impl Dispatcher {
    pub fn new(registry: &Arc<Registry>) -> Self {
        Dispatcher {
            registry: Arc::clone(registry),
        }
    }

    pub fn dispatch(&self, task: Task) {
        debug!("dispatching {:?}", &task);

        match task {
            Task::Register { id, name } => self.register(id, &name),
            Task::Plain { id, text } => self.relay(id, &text),
            Task::Presence { id, presence } => self.announce(id, presence),
            Task::Close { id } => self.close(id),
            Task::Reject { id, error } => {
                // protocol violation, nothing is broadcast and the connection stays up
                warn!("protocol violation from {}: {}", id, error);
            }
        }
    }

    fn register(&self, id: ConnId, name: &[u8]) {
        let name = String::from_utf8_lossy(name);
        let name = name.trim();

        if name.is_empty() {
            warn!("empty register name from {}", id);
            return
        }

        // the name is set once, a later REGISTER is not a rename
        match self.registry.find(id, |c| match c.name() {
            Some(existing) => Err(existing.to_owned()),
            None => {
                c.set_name(name);
                Ok(c.display_name().to_owned())
            }
        }) {
            Some(Ok(stored)) => info!("{} registered as {}", id, stored),
            Some(Err(existing)) => warn!("{} already registered as {}, ignoring {:?}", id, existing, name),
            None => debug!("register from departed connection {}", id),
        }
    }

    // "[name] text"
    fn relay(&self, id: ConnId, text: &[u8]) {
        let Some(name) = self.registry.find(id, |c| c.display_name().to_owned()) else {
            debug!("dropping message from departed connection {}", id);
            return
        };

        let mut line = format!("[{}] ", name);
        line.push_str(&String::from_utf8_lossy(text));

        self.broadcast_except(id, &Frame::plain(&line));
    }

    // presence text always comes from the stored name, never from the client's payload
    fn announce(&self, id: ConnId, presence: Presence) {
        let Some(name) = self.registry.find(id, |c| {
            c.set_offline_announced(presence == Presence::Offline);
            c.display_name().to_owned()
        }) else {
            debug!("dropping {} from departed connection {}", presence.word(), id);
            return
        };

        self.broadcast_except(id, &presence_frame(&name, presence));
    }

    fn close(&self, id: ConnId) {
        let Some(conn) = self.registry.remove(id) else {
            debug!("close of unknown connection {}", id);
            return
        };

        info!("{} ({}) removed", id, conn.addr());
        conn.close();

        // a registered client that left without saying so is announced once here
        if let Some(name) = conn.name() {
            if !conn.offline_announced() {
                self.broadcast_except(id, &presence_frame(name, Presence::Offline));
            }
        }
    }

    /// Sends `frame` to every registered peer except `origin`. A failed send
    /// only affects that peer. Returns the number of peers reached.
    pub fn broadcast_except(&self, origin: ConnId, frame: &Frame) -> usize {
        let block = frame.to_block();
        let mut delivered = 0;

        let visited = self.registry.for_each_except(origin, |c| match c.send(&block) {
            Ok(()) => delivered += 1,
            Err(e) => warn!("send to {} failed: {}", c.id(), e),
        });

        debug!("{} from {} delivered to {}/{}", frame.kind(), origin, delivered, visited);
        delivered
    }
}

fn presence_frame(name: &str, presence: Presence) -> Frame {
    let line = format!("[{}] {}", name, presence.word());
    Frame::new(presence.kind(), protocol::truncate_utf8(&line, protocol::PAYLOAD_CAPACITY))
}
