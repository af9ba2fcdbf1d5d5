pub mod config;
pub mod error;

// concurrency
pub mod thread_pool;
pub mod inbox;
pub mod registry;

// relay
pub mod dispatcher;
pub mod server;

pub use config::ServerConfig;
pub use error::{PoolError, RegistryError, ServerError};
pub use server::{Server, ServerState, ShutdownHandle};
