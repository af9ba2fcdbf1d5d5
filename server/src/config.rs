use std::net::{Ipv4Addr, SocketAddr};

use protocol::SERVER_PORT;

const POOL_WORKERS: usize = 5;
const POOL_QUEUE_HINT: usize = 10;
const EVENTS_CAPACITY: usize = 10;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub addr: SocketAddr,
    pub workers: usize,
    // pre-sizes the task queue, it is not a bound
    pub queue_hint: usize,
    // readiness events fetched per poll
    pub events_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, SERVER_PORT)),
            workers: POOL_WORKERS,
            queue_hint: POOL_QUEUE_HINT,
            events_capacity: EVENTS_CAPACITY,
        }
    }
}

impl ServerConfig {
    pub fn with_addr(mut self, addr: SocketAddr) -> Self {
        self.addr = addr;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }
}
