use std::io;

use thiserror::Error;

use crate::registry::ConnId;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("bad parameter: {0}")]
    BadParam(&'static str),

    #[error("unable to start worker: {0}")]
    Spawn(#[source] io::Error),

    #[error("out of memory queueing task")]
    OutOfMemory,

    #[error("pool is shut down")]
    ShutDown,
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("connection {0} already registered")]
    Duplicate(ConnId),

    #[error("out of memory adding connection")]
    OutOfMemory,
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("bad parameter: {0}")]
    BadParam(&'static str),

    #[error("thread pool: {0}")]
    Pool(#[from] PoolError),

    // socket create / bind / listen / readiness registration
    #[error("{context}: {source}")]
    Init {
        context: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("event loop: {0}")]
    Runtime(#[source] io::Error),

    #[error("server already destroyed")]
    Destroyed,
}

impl ServerError {
    pub(crate) fn init(context: &'static str) -> impl FnOnce(io::Error) -> ServerError {
        move |source| ServerError::Init { context, source }
    }
}
