//! Control-plane handshake and heartbeat.
//!
//! A process-pair protocol independent of voice replication, used to
//! discover peers and verify protocol-version compatibility before relying
//! on a replication link. Wire format: one command byte, followed by a
//! fixed payload (`Handshake`/`HandshakeAck` carry two little-endian u16
//! fields: protocol version and revision).

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{info, warn};

pub const PROTOCOL_VERSION: u16 = 1;
pub const PROTOCOL_REVISION: u16 = 0;

/// Unique identifier for an accepted peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Handshake = 1,
    HandshakeAck = 2,
    Ping = 3,
    Pong = 4,
    Goodbye = 5,
    GoodbyeAck = 6,
}

impl Command {
    fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Command::Handshake),
            2 => Some(Command::HandshakeAck),
            3 => Some(Command::Ping),
            4 => Some(Command::Pong),
            5 => Some(Command::Goodbye),
            6 => Some(Command::GoodbyeAck),
            _ => None,
        }
    }
}

fn write_command(stream: &TcpStream, cmd: Command) -> io::Result<()> {
    (&mut &*stream).write_all(&[cmd as u8])
}

fn write_handshake(stream: &TcpStream, cmd: Command, version: u16, revision: u16) -> io::Result<()> {
    let mut buf = [0u8; 5];
    buf[0] = cmd as u8;
    buf[1..3].copy_from_slice(&version.to_le_bytes());
    buf[3..5].copy_from_slice(&revision.to_le_bytes());
    (&mut &*stream).write_all(&buf)
}

fn read_version_pair(stream: &mut impl Read) -> io::Result<(u16, u16)> {
    let mut buf = [0u8; 4];
    stream.read_exact(&mut buf)?;
    Ok((
        u16::from_le_bytes([buf[0], buf[1]]),
        u16::from_le_bytes([buf[2], buf[3]]),
    ))
}

struct Peer {
    stream: TcpStream,
    connected: bool,
}

/// Server side: accepts connections on a bootstrap thread and spawns one
/// reader thread per accepted client.
pub struct ControlServer {
    peers: Arc<Mutex<HashMap<PeerId, Peer>>>,
    pong_rx: Mutex<Receiver<PeerId>>,
    stop: Arc<AtomicBool>,
    accept_thread: Option<JoinHandle<()>>,
    reader_threads: Arc<Mutex<Vec<JoinHandle<()>>>>,
    local_port: u16,
}

impl ControlServer {
    /// Bind the control port and start accepting.
    pub fn bind(port: u16) -> io::Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", port))?;
        Self::from_listener(listener)
    }

    /// Start serving on an already-bound listener (the winning role probe
    /// is reused directly as the control listener).
    pub fn from_listener(listener: TcpListener) -> io::Result<Self> {
        listener.set_nonblocking(true)?;
        let local_port = listener.local_addr()?.port();

        let peers: Arc<Mutex<HashMap<PeerId, Peer>>> = Arc::new(Mutex::new(HashMap::new()));
        let (pong_tx, pong_rx) = mpsc::channel();
        let stop = Arc::new(AtomicBool::new(false));
        let reader_threads: Arc<Mutex<Vec<JoinHandle<()>>>> = Arc::new(Mutex::new(Vec::new()));

        let accept_peers = peers.clone();
        let accept_stop = stop.clone();
        let accept_readers = reader_threads.clone();
        let accept_thread = thread::Builder::new()
            .name("control-accept".into())
            .spawn(move || {
                accept_loop(listener, accept_peers, pong_tx, accept_stop, accept_readers);
            })?;

        info!("control server listening on port {}", local_port);

        Ok(Self {
            peers,
            pong_rx: Mutex::new(pong_rx),
            stop,
            accept_thread: Some(accept_thread),
            reader_threads,
            local_port,
        })
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// Number of peers that completed the handshake.
    pub fn connected_count(&self) -> usize {
        self.peers
            .lock()
            .map(|p| p.values().filter(|c| c.connected).count())
            .unwrap_or(0)
    }

    /// Wait until at least `count` peers are connected or the timeout
    /// elapses. Returns the connected count either way (partial results,
    /// never an indefinite block).
    pub fn wait_for_connections(&self, count: usize, timeout: Duration) -> usize {
        let deadline = Instant::now() + timeout;
        loop {
            let connected = self.connected_count();
            if connected >= count || Instant::now() >= deadline {
                return connected;
            }
            thread::sleep(Duration::from_millis(5));
        }
    }

    /// Ping every connected peer and report which replied within the
    /// timeout. Never blocks indefinitely on an unresponsive peer.
    pub fn ping(&self, timeout: Duration) -> Vec<PeerId> {
        let Ok(rx) = self.pong_rx.lock() else {
            return Vec::new();
        };
        // Discard pongs left over from earlier rounds.
        while rx.try_recv().is_ok() {}

        let targets: Vec<PeerId> = {
            let Ok(mut peers) = self.peers.lock() else {
                return Vec::new();
            };
            let mut sent = Vec::new();
            for (&id, peer) in peers.iter_mut() {
                if !peer.connected {
                    continue;
                }
                match write_command(&peer.stream, Command::Ping) {
                    Ok(()) => sent.push(id),
                    Err(e) => warn!("ping to {:?} failed: {}", id, e),
                }
            }
            sent
        };

        let deadline = Instant::now() + timeout;
        let mut replied = Vec::new();
        while replied.len() < targets.len() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            match rx.recv_timeout(deadline - now) {
                Ok(id) => {
                    if targets.contains(&id) && !replied.contains(&id) {
                        replied.push(id);
                    }
                }
                Err(_) => break,
            }
        }
        replied
    }

    /// Send Goodbye to every peer, close their connections, and stop
    /// accepting. Joins every reader thread; the stream shutdown is what
    /// unparks readers blocked in a read.
    pub fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Ok(peers) = self.peers.lock() {
            for peer in peers.values() {
                let _ = write_command(&peer.stream, Command::Goodbye);
                let _ = peer.stream.shutdown(std::net::Shutdown::Both);
            }
        }
        if let Some(t) = self.accept_thread.take() {
            let _ = t.join();
        }
        if let Ok(mut readers) = self.reader_threads.lock() {
            for t in readers.drain(..) {
                let _ = t.join();
            }
        }
    }
}

impl Drop for ControlServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn accept_loop(
    listener: TcpListener,
    peers: Arc<Mutex<HashMap<PeerId, Peer>>>,
    pong_tx: Sender<PeerId>,
    stop: Arc<AtomicBool>,
    reader_threads: Arc<Mutex<Vec<JoinHandle<()>>>>,
) {
    let next_id = AtomicU64::new(0);
    while !stop.load(Ordering::Acquire) {
        match listener.accept() {
            Ok((stream, addr)) => {
                let id = PeerId(next_id.fetch_add(1, Ordering::Relaxed));
                info!("control peer {:?} connecting from {}", id, addr);

                let read_stream = match stream.try_clone() {
                    Ok(s) => s,
                    Err(e) => {
                        warn!("failed to clone control stream: {}", e);
                        continue;
                    }
                };

                if let Ok(mut map) = peers.lock() {
                    map.insert(
                        id,
                        Peer {
                            stream,
                            connected: false,
                        },
                    );
                }

                let peers = peers.clone();
                let pong_tx = pong_tx.clone();
                let spawned = thread::Builder::new()
                    .name(format!("control-peer-{}", id.0))
                    .spawn(move || {
                        peer_reader_loop(id, read_stream, peers, pong_tx);
                    });
                match spawned {
                    Ok(handle) => {
                        if let Ok(mut readers) = reader_threads.lock() {
                            readers.push(handle);
                        }
                    }
                    Err(e) => warn!("failed to spawn control reader: {}", e),
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(10));
            }
            Err(e) => {
                warn!("control accept error: {}", e);
                break;
            }
        }
    }
}

fn peer_reader_loop(
    id: PeerId,
    mut stream: TcpStream,
    peers: Arc<Mutex<HashMap<PeerId, Peer>>>,
    pong_tx: Sender<PeerId>,
) {
    loop {
        let mut byte = [0u8; 1];
        if stream.read_exact(&mut byte).is_err() {
            break;
        }
        let Some(cmd) = Command::from_byte(byte[0]) else {
            warn!("peer {:?} sent unknown command {}, dropping byte", id, byte[0]);
            continue;
        };
        match cmd {
            Command::Handshake => {
                let Ok((version, revision)) = read_version_pair(&mut stream) else {
                    break;
                };
                if version != PROTOCOL_VERSION {
                    warn!(
                        "peer {:?} version mismatch: theirs {}.{}, ours {}.{}",
                        id, version, revision, PROTOCOL_VERSION, PROTOCOL_REVISION
                    );
                    break;
                }
                let acked = peers.lock().ok().and_then(|mut map| {
                    map.get_mut(&id).map(|peer| {
                        peer.connected = true;
                        write_handshake(
                            &peer.stream,
                            Command::HandshakeAck,
                            PROTOCOL_VERSION,
                            PROTOCOL_REVISION,
                        )
                    })
                });
                match acked {
                    Some(Ok(())) => info!("peer {:?} handshake complete", id),
                    _ => break,
                }
            }
            Command::Ping => {
                let sent = peers
                    .lock()
                    .ok()
                    .and_then(|map| map.get(&id).map(|p| write_command(&p.stream, Command::Pong)));
                if !matches!(sent, Some(Ok(()))) {
                    break;
                }
            }
            Command::Pong => {
                if pong_tx.send(id).is_err() {
                    break;
                }
            }
            Command::Goodbye => {
                if let Ok(map) = peers.lock() {
                    if let Some(p) = map.get(&id) {
                        let _ = write_command(&p.stream, Command::GoodbyeAck);
                    }
                }
                break;
            }
            Command::HandshakeAck | Command::GoodbyeAck => {
                // Client-side responses; a server receiving one ignores it.
            }
        }
    }

    if let Ok(mut map) = peers.lock() {
        map.remove(&id);
    }
    info!("control peer {:?} reader exiting", id);
}

/// Client side: connects, performs the handshake synchronously, then loops
/// reading on a background thread.
pub struct ControlClient {
    stream: TcpStream,
    pong_rx: Mutex<Receiver<()>>,
    disconnected: Arc<AtomicBool>,
    reader: Option<JoinHandle<()>>,
}

impl ControlClient {
    pub fn connect(addr: &str) -> io::Result<Self> {
        let stream = TcpStream::connect(addr)?;
        write_handshake(&stream, Command::Handshake, PROTOCOL_VERSION, PROTOCOL_REVISION)?;

        // Synchronous handshake: the first byte back must be the ack,
        // within a bounded wait.
        stream.set_read_timeout(Some(Duration::from_secs(2)))?;
        let mut read_stream = stream.try_clone()?;
        let mut byte = [0u8; 1];
        read_stream.read_exact(&mut byte)?;
        if Command::from_byte(byte[0]) != Some(Command::HandshakeAck) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "expected HandshakeAck",
            ));
        }
        let (version, revision) = read_version_pair(&mut read_stream)?;
        if version != PROTOCOL_VERSION {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("protocol version mismatch: server {}.{}", version, revision),
            ));
        }

        stream.set_read_timeout(None)?;
        info!("control handshake complete with {}", addr);

        let (pong_tx, pong_rx) = mpsc::channel();
        let disconnected = Arc::new(AtomicBool::new(false));
        let reader_stream = stream.try_clone()?;
        let reader_flag = disconnected.clone();
        let reader = thread::Builder::new()
            .name("control-client".into())
            .spawn(move || {
                client_reader_loop(reader_stream, pong_tx, reader_flag);
            })?;

        Ok(Self {
            stream,
            pong_rx: Mutex::new(pong_rx),
            disconnected,
            reader: Some(reader),
        })
    }

    /// Ping the server; true if a Pong arrived within the timeout.
    pub fn ping(&self, timeout: Duration) -> bool {
        let Ok(rx) = self.pong_rx.lock() else {
            return false;
        };
        while rx.try_recv().is_ok() {}
        if write_command(&self.stream, Command::Ping).is_err() {
            return false;
        }
        rx.recv_timeout(timeout).is_ok()
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::Acquire)
    }

    /// Send Goodbye and drop the connection.
    pub fn disconnect(mut self) -> io::Result<()> {
        write_command(&self.stream, Command::Goodbye)?;
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
        if let Some(t) = self.reader.take() {
            let _ = t.join();
        }
        Ok(())
    }
}

fn client_reader_loop(mut stream: TcpStream, pong_tx: Sender<()>, disconnected: Arc<AtomicBool>) {
    loop {
        let mut byte = [0u8; 1];
        if stream.read_exact(&mut byte).is_err() {
            break;
        }
        match Command::from_byte(byte[0]) {
            Some(Command::Ping) => {
                if write_command(&stream, Command::Pong).is_err() {
                    break;
                }
            }
            Some(Command::Pong) => {
                if pong_tx.send(()).is_err() {
                    break;
                }
            }
            Some(Command::Goodbye) => {
                let _ = write_command(&stream, Command::GoodbyeAck);
                break;
            }
            Some(Command::GoodbyeAck) => break,
            Some(Command::Handshake) | Some(Command::HandshakeAck) => {
                // Handshake already completed; skip the version payload if
                // a stray one arrives.
                let mut skip = [0u8; 4];
                if stream.read_exact(&mut skip).is_err() {
                    break;
                }
            }
            None => {
                warn!("server sent unknown control byte {}", byte[0]);
            }
        }
    }
    disconnected.store(true, Ordering::Release);
    info!("control client reader exiting");
}
