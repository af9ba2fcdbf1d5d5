use tokio::net::{tcp, TcpStream, ToSocketAddrs};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_stream::StreamExt; // provides next on top of FramedRead
use futures::SinkExt; // provides send/close on top of FramedWrite

use tracing::{info, debug, warn};

use protocol::{Frame, FrameCodec, Kind, NAME_CAPACITY};

use crate::error::ClientError;

// What the relay tells us, text already formatted server side e.g. "[bob] online"
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    Message(String),
    Online(String),
    Offline(String),
}

impl TryFrom<Frame> for Notice {
    type Error = ClientError;

    fn try_from(frame: Frame) -> Result<Self, Self::Error> {
        match frame.kind() {
            Kind::Plain => Ok(Notice::Message(frame.text())),
            Kind::Online => Ok(Notice::Online(frame.text())),
            Kind::Offline => Ok(Notice::Offline(frame.text())),
            kind => Err(ClientError::Protocol(kind)),
        }
    }
}

/// Connects to the relay and splits the socket so reads and writes can run
/// on separate tasks.
pub async fn connect<A: ToSocketAddrs>(addr: A) -> Result<(ClientReader, ClientWriter), ClientError> {
    let stream = TcpStream::connect(addr).await.map_err(ClientError::Connect)?;

    if let Ok(peer) = stream.peer_addr() {
        info!("client connected to server {:?}", peer);
    }

    let (client_read, client_write) = stream.into_split();

    let reader = ClientReader { fr: FramedRead::new(client_read, FrameCodec) };
    let writer = ClientWriter { fw: FramedWrite::new(client_write, FrameCodec) };

    Ok((reader, writer))
}

pub struct ClientWriter {
    fw: FramedWrite<tcp::OwnedWriteHalf, FrameCodec>,
}

impl ClientWriter {
    pub async fn register(&mut self, name: &str) -> Result<(), ClientError> {
        let name = name.trim();

        if name.is_empty() {
            return Err(ClientError::BadParam("user name is empty"))
        }
        if name.len() > NAME_CAPACITY {
            return Err(ClientError::BadParam("user name too long"))
        }

        self.send(Frame::register(name)).await?;
        debug!("client registered with user name: {}", name);
        Ok(())
    }

    // text past the payload capacity is cut here, the server never sees it
    pub async fn send_plain(&mut self, text: &str) -> Result<(), ClientError> {
        self.send(Frame::plain(text)).await
    }

    pub async fn send_online(&mut self) -> Result<(), ClientError> {
        self.send(Frame::online()).await
    }

    pub async fn send_offline(&mut self) -> Result<(), ClientError> {
        self.send(Frame::offline()).await
    }

    // flush and shut down the write side
    pub async fn close(mut self) -> Result<(), ClientError> {
        self.fw.close().await.map_err(ClientError::Send)
    }

    async fn send(&mut self, frame: Frame) -> Result<(), ClientError> {
        self.fw.send(frame).await.map_err(ClientError::Send)
    }
}

pub struct ClientReader {
    fr: FramedRead<tcp::OwnedReadHalf, FrameCodec>,
}

impl ClientReader {
    /// Next notice from the relay, `None` once the server has closed.
    pub async fn recv(&mut self) -> Result<Option<Notice>, ClientError> {
        match self.fr.next().await {
            Some(Ok(frame)) => Notice::try_from(frame).map(Some),
            Some(Err(e)) => Err(ClientError::Receive(e)),
            None => Ok(None),
        }
    }

    /// Feeds every notice to `on_notice` until the server closes. Unexpected
    /// frame kinds are skipped.
    pub async fn receive_loop<F: FnMut(Notice)>(&mut self, mut on_notice: F) -> Result<(), ClientError> {
        loop {
            match self.recv().await {
                Ok(Some(notice)) => on_notice(notice),
                Ok(None) => {
                    info!("server closed connection");
                    return Ok(())
                }
                Err(ClientError::Protocol(kind)) => warn!("ignoring {} frame from server", kind),
                Err(e) => return Err(e),
            }
        }
    }
}
