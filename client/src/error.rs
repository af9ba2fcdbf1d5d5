use std::io;

use thiserror::Error;

use protocol::{FrameError, Kind};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("bad parameter: {0}")]
    BadParam(&'static str),

    #[error("unable to connect to server: {0}")]
    Connect(#[source] io::Error),

    #[error("unable to send to server: {0}")]
    Send(#[source] FrameError),

    #[error("unable to receive from server: {0}")]
    Receive(#[source] FrameError),

    // the server relays plain text and presence only
    #[error("unexpected {0} frame from server")]
    Protocol(Kind),
}
