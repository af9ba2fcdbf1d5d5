use std::io::{ErrorKind, Read, Write};
use std::net::{Ipv4Addr, SocketAddr, TcpStream};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::BytesMut;
use tokio_util::codec::Decoder;

use protocol::{Frame, FrameCodec, Kind, FRAME_SIZE};
use server::registry::Registry;
use server::{Server, ServerConfig, ServerError, ShutdownHandle};

const QUIET: Duration = Duration::from_millis(300);

// A relay on an ephemeral loopback port with the default worker pool.
// Frames from one connection are handled in the order they were sent.
struct Relay {
    addr: SocketAddr,
    registry: Arc<Registry>,
    handle: ShutdownHandle,
    thread: Option<JoinHandle<Result<(), ServerError>>>,
}

impl Relay {
    fn start() -> Relay {
        let config = ServerConfig::default()
            .with_addr(SocketAddr::from((Ipv4Addr::LOCALHOST, 0)));
        let mut server = Server::bind(config).unwrap();

        let addr = server.local_addr();
        let registry = server.registry();
        let handle = server.shutdown_handle();

        let thread = thread::spawn(move || {
            server.run()?;
            server.destroy()?;
            server.destroy()
        });

        Relay { addr, registry, handle, thread: Some(thread) }
    }

    fn connect(&self) -> TcpStream {
        let s = TcpStream::connect(self.addr).unwrap();
        s.set_read_timeout(Some(QUIET)).unwrap();
        s
    }

    fn wait_for(&self, live: usize) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while self.registry.len() != live {
            assert!(Instant::now() < deadline, "registry never reached {} connections", live);
            thread::sleep(Duration::from_millis(5));
        }
    }

    fn stop(&mut self) -> Result<(), ServerError> {
        self.handle.shutdown();
        match self.thread.take() {
            Some(t) => t.join().unwrap(),
            None => Ok(()),
        }
    }
}

impl Drop for Relay {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

fn send(s: &mut TcpStream, frame: &Frame) {
    s.write_all(&frame.to_block()).unwrap();
}

fn recv(s: &mut TcpStream) -> Option<Frame> {
    let mut block = vec![0u8; FRAME_SIZE];
    match s.read_exact(&mut block) {
        Ok(()) => FrameCodec.decode(&mut BytesMut::from(&block[..])).unwrap(),
        Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => None,
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => None,
        Err(e) => panic!("read failed: {}", e),
    }
}

fn raw_block(tag: u8, length: u32) -> Vec<u8> {
    let mut block = vec![0u8; FRAME_SIZE];
    block[..4].copy_from_slice(&(u32::from(tag) | (length << 8)).to_le_bytes());
    block
}

#[test]
fn plain_message_reaches_everyone_but_sender() {
    let relay = Relay::start();
    let mut a = relay.connect();
    let mut b = relay.connect();
    let mut c = relay.connect();
    relay.wait_for(3);

    send(&mut a, &Frame::register("alice"));
    send(&mut b, &Frame::register("bob"));
    send(&mut c, &Frame::register("carol"));
    send(&mut a, &Frame::plain("hi"));

    for peer in [&mut b, &mut c] {
        let f = recv(peer).unwrap();
        assert_eq!(f.kind(), Kind::Plain);
        assert_eq!(f.text(), "[alice] hi");
    }
    assert!(recv(&mut a).is_none());
}

#[test]
fn closing_registered_client_announces_offline_once() {
    let relay = Relay::start();
    let mut a = relay.connect();
    let mut c = relay.connect();
    let mut b = relay.connect();
    relay.wait_for(3);

    send(&mut b, &Frame::register("bob"));
    drop(b);
    relay.wait_for(2);

    for peer in [&mut a, &mut c] {
        let f = recv(peer).unwrap();
        assert_eq!(f.kind(), Kind::Offline);
        assert_eq!(f.text(), "[bob] offline");
        assert!(recv(peer).is_none());
    }
}

#[test]
fn explicit_offline_then_close_is_announced_once() {
    let relay = Relay::start();
    let mut a = relay.connect();
    let mut b = relay.connect();
    relay.wait_for(2);

    send(&mut b, &Frame::register("bob"));
    send(&mut b, &Frame::online());
    send(&mut b, &Frame::offline());
    drop(b);
    relay.wait_for(1);

    assert_eq!(recv(&mut a).unwrap().text(), "[bob] online");
    assert_eq!(recv(&mut a).unwrap().text(), "[bob] offline");
    assert!(recv(&mut a).is_none());
}

#[test]
fn unknown_kind_is_ignored_and_connection_survives() {
    let relay = Relay::start();
    let mut a = relay.connect();
    let mut b = relay.connect();
    relay.wait_for(2);

    a.write_all(&raw_block(9, 0)).unwrap();
    assert!(recv(&mut b).is_none());

    send(&mut a, &Frame::register("alice"));
    send(&mut a, &Frame::plain("after"));
    assert_eq!(recv(&mut b).unwrap().text(), "[alice] after");
    assert_eq!(relay.registry.len(), 2);
}

#[test]
fn oversized_length_is_rejected() {
    let relay = Relay::start();
    let mut a = relay.connect();
    let mut b = relay.connect();
    relay.wait_for(2);

    a.write_all(&raw_block(0, FRAME_SIZE as u32)).unwrap();
    send(&mut a, &Frame::plain("ok"));

    assert_eq!(recv(&mut b).unwrap().text(), "[anonymous] ok");
    assert!(recv(&mut b).is_none());
}

#[test]
fn frames_split_across_writes_are_reassembled() {
    let relay = Relay::start();
    let mut a = relay.connect();
    let mut b = relay.connect();
    relay.wait_for(2);

    let mut bytes = Frame::register("alice").to_block().to_vec();
    bytes.extend_from_slice(&Frame::plain("pieces").to_block());

    for piece in bytes.chunks(300) {
        a.write_all(piece).unwrap();
        a.flush().unwrap();
        thread::sleep(Duration::from_millis(10));
    }

    assert_eq!(recv(&mut b).unwrap().text(), "[alice] pieces");
}

#[test]
fn shutdown_closes_clients_and_destroy_is_idempotent() {
    let mut relay = Relay::start();
    let mut a = relay.connect();
    relay.wait_for(1);

    relay.stop().unwrap();
    assert!(relay.registry.is_empty());

    let mut buf = [0u8; 16];
    a.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    assert_eq!(a.read(&mut buf).unwrap(), 0);
}

#[test]
fn frames_from_one_connection_keep_their_order() {
    let relay = Relay::start();
    let mut watcher = relay.connect();
    relay.wait_for(1);

    for round in 0..30 {
        let name = format!("n{}", round);
        let mut c = relay.connect();
        send(&mut c, &Frame::register(&name));
        send(&mut c, &Frame::online());
        send(&mut c, &Frame::plain("bye"));
        drop(c);

        assert_eq!(recv(&mut watcher).unwrap().text(), format!("[{}] online", name));
        assert_eq!(recv(&mut watcher).unwrap().text(), format!("[{}] bye", name));
        assert_eq!(recv(&mut watcher).unwrap().text(), format!("[{}] offline", name));
    }

    relay.wait_for(1);
    assert!(recv(&mut watcher).is_none());
}

#[test]
fn concurrent_chat_delivers_each_message_once() {
    const TALKERS: usize = 4;
    const MESSAGES: usize = 20;
    const CHURN: usize = 5;

    let relay = Relay::start();
    let mut talkers: Vec<TcpStream> = (0..TALKERS).map(|_| relay.connect()).collect();
    relay.wait_for(TALKERS);

    for (i, s) in talkers.iter_mut().enumerate() {
        send(s, &Frame::register(&format!("t{}", i)));
    }

    // every other talker's messages plus one online and one offline per churner
    let expected = (TALKERS - 1) * MESSAGES + CHURN * 2;

    let readers: Vec<_> = talkers
        .iter()
        .map(|s| {
            let mut s = s.try_clone().unwrap();
            s.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
            thread::spawn(move || {
                (0..expected)
                    .map(|n| recv(&mut s).unwrap_or_else(|| panic!("frame {} of {} never came", n, expected)).text())
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let writers: Vec<_> = talkers
        .into_iter()
        .map(|mut s| {
            thread::spawn(move || {
                for n in 0..MESSAGES {
                    send(&mut s, &Frame::plain(&n.to_string()));
                }
                s
            })
        })
        .collect();

    // peers joining and leaving while the talkers chat
    for k in 0..CHURN {
        let mut c = relay.connect();
        send(&mut c, &Frame::register(&format!("churn{}", k)));
        send(&mut c, &Frame::online());
        drop(c);
    }

    let mut talkers: Vec<TcpStream> = writers.into_iter().map(|w| w.join().unwrap()).collect();

    for (i, reader) in readers.into_iter().enumerate() {
        let lines = reader.join().unwrap();

        for j in (0..TALKERS).filter(|&j| j != i) {
            let prefix = format!("[t{}] ", j);
            let got: Vec<&str> = lines.iter().filter_map(|l| l.strip_prefix(prefix.as_str())).collect();
            let want: Vec<String> = (0..MESSAGES).map(|n| n.to_string()).collect();
            assert_eq!(got, want, "talker {} as seen by talker {}", j, i);
        }

        for k in 0..CHURN {
            let prefix = format!("[churn{}] ", k);
            let got: Vec<&str> = lines.iter().filter_map(|l| l.strip_prefix(prefix.as_str())).collect();
            assert_eq!(got, vec!["online", "offline"], "churner {} as seen by talker {}", k, i);
        }
    }

    relay.wait_for(TALKERS);
    for s in talkers.iter_mut() {
        s.set_read_timeout(Some(QUIET)).unwrap();
        assert!(recv(s).is_none());
    }
}
