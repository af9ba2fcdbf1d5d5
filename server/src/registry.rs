use std::fmt;
use std::io::{self, ErrorKind, Write};
use std::net::{Shutdown, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use mio::net::TcpStream;
use tracing::debug;

use protocol::{truncate_utf8, NAME_CAPACITY};

use crate::error::RegistryError;

const ANONYMOUS: &str = "anonymous";

// a peer whose socket buffer stays full this long is skipped for the frame
const SEND_STALL_LIMIT: u32 = 200;
const SEND_STALL_BACKOFF: Duration = Duration::from_millis(1);

/// Identifies one accepted connection for its whole lifetime. Derived from the
/// reactor token the socket is registered under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(pub usize);

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Server side record of one client.
#[derive(Debug)]
pub struct Connection {
    id: ConnId,
    addr: SocketAddr,
    stream: Arc<TcpStream>,
    name: Option<String>,
    offline_announced: bool,
}

impl Connection {
    pub fn new(id: ConnId, addr: SocketAddr, stream: Arc<TcpStream>) -> Self {
        Connection {
            id,
            addr,
            stream,
            name: None,
            offline_announced: false,
        }
    }

    pub fn id(&self) -> ConnId {
        self.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(ANONYMOUS)
    }

    // the registry entry owns identity from here on, capped at NAME_CAPACITY bytes
    pub fn set_name(&mut self, name: &str) {
        self.name = Some(truncate_utf8(name, NAME_CAPACITY).to_owned());
    }

    pub fn is_registered(&self) -> bool {
        self.name.is_some()
    }

    pub fn set_offline_announced(&mut self, announced: bool) {
        self.offline_announced = announced;
    }

    pub fn offline_announced(&self) -> bool {
        self.offline_announced
    }

    /// Writes one whole block to the peer. The socket is non-blocking, so a
    /// full send buffer is waited out briefly rather than leaving half a block
    /// on the wire.
    pub fn send(&self, block: &[u8]) -> io::Result<()> {
        let mut written = 0;
        let mut stalls = 0;

        while written < block.len() {
            match (&*self.stream).write(&block[written..]) {
                Ok(0) => return Err(io::Error::new(ErrorKind::WriteZero, "peer accepted no bytes")),
                Ok(n) => written += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    stalls += 1;
                    if stalls > SEND_STALL_LIMIT {
                        return Err(e)
                    }
                    thread::sleep(SEND_STALL_BACKOFF);
                }
                Err(e) => return Err(e),
            }
        }

        Ok(())
    }

    pub fn close(&self) {
        if let Err(e) = self.stream.shutdown(Shutdown::Both) {
            debug!("shutdown of {} failed: {}", self.id, e);
        }
    }
}

/// Live connections in insertion order, behind one lock.
///
/// `add`, `find`, `remove` and `for_each_except` all take the same lock, so
/// the registry is linearizable under concurrent workers and the count is
/// always the number of live entries.
#[derive(Debug, Default)]
pub struct Registry {
    conns: Mutex<Vec<Connection>>,
}

impl Registry {
    pub fn new() -> Self {
        Registry::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Connection>> {
        self.conns.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add(&self, conn: Connection) -> Result<(), RegistryError> {
        let mut conns = self.lock();

        if conns.iter().any(|c| c.id == conn.id) {
            return Err(RegistryError::Duplicate(conn.id))
        }
        conns.try_reserve(1).map_err(|_| RegistryError::OutOfMemory)?;
        conns.push(conn);

        Ok(())
    }

    /// Runs `f` on the matching connection while holding the lock.
    pub fn find<R>(&self, id: ConnId, f: impl FnOnce(&mut Connection) -> R) -> Option<R> {
        self.lock().iter_mut().find(|c| c.id == id).map(f)
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, id: ConnId) -> bool {
        self.lock().iter().any(|c| c.id == id)
    }

    // not-found is a plain None, callers carry on
    pub fn remove(&self, id: ConnId) -> Option<Connection> {
        let mut conns = self.lock();
        let pos = conns.iter().position(|c| c.id == id)?;
        Some(conns.remove(pos))
    }

    /// Visits every live connection other than `except`, in insertion order,
    /// with the lock held for the whole pass. Returns how many were visited.
    pub fn for_each_except(&self, except: ConnId, mut visit: impl FnMut(&Connection)) -> usize {
        let conns = self.lock();
        let mut visited = 0;

        for c in conns.iter().filter(|c| c.id != except) {
            visit(c);
            visited += 1;
        }

        visited
    }

    #[cfg(test)]
    pub(crate) fn ids(&self) -> Vec<ConnId> {
        self.lock().iter().map(|c| c.id).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Empties the registry, handing the records back for teardown.
    pub fn drain(&self) -> Vec<Connection> {
        std::mem::take(&mut *self.lock())
    }
}
