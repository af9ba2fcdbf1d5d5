use std::io;

use tokio::select;
use tokio::signal;

use tracing_subscriber::fmt;
use tracing::{info, error, Level};

use server::{Server, ServerConfig, ServerError};

#[tokio::main]
async fn main() -> Result<(), ServerError> {
    fmt()
        .compact()
        .with_max_level(Level::INFO)
        .init();

    let mut server = Server::bind(ServerConfig::default())?;
    let shutdown = server.shutdown_handle();

    // the reactor is a plain blocking loop, keep it off the async workers
    let mut reactor = tokio::task::spawn_blocking(move || {
        let outcome = server.run();
        server.destroy()?;
        outcome
    });

    let joined = select! {
        res = &mut reactor => res,
        _ = signal::ctrl_c() => {
            info!("interrupt received, shutting down");
            shutdown.shutdown();
            reactor.await
        }
    };

    match joined {
        Ok(outcome) => outcome,
        Err(e) => {
            error!("reactor thread failed: {}", e);
            Err(ServerError::Runtime(io::Error::new(io::ErrorKind::Other, e)))
        }
    }
}
