use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use claims_proto::MAX_FRAME_BYTES;
use crossbeam_channel::{bounded, unbounded, Receiver, Sender, TrySendError};

use crate::ids::PlayerId;

/// Something that happened on a player connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkEvent {
    Connected(PlayerId),
    Frame(PlayerId, Vec<u8>),
    Disconnected(PlayerId),
}

/// Frames a connection may have waiting for its writer thread before the
/// player is considered stalled and dropped.
pub const OUTBOUND_QUEUE_FRAMES: usize = 256;

struct Connection {
    frames: Sender<Vec<u8>>,
    stream: TcpStream,
}

impl Connection {
    fn close(self) {
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
    }
}

type Clients = Arc<Mutex<HashMap<PlayerId, Connection>>>;

/// Accepts player connections; every connection gets a fresh player id.
pub struct PlayerServer {
    clients: Clients,
    events: Receiver<NetworkEvent>,
    local_addr: SocketAddr,
}

impl PlayerServer {
    /// Bound address; differs from the requested one when port 0 was asked for.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn events(&self) -> &Receiver<NetworkEvent> {
        &self.events
    }

    /// Hands one frame to the player's writer thread without blocking.
    ///
    /// Returns false when the player is unknown or was dropped because its
    /// outbound queue is full or its writer has stopped.
    pub fn send(&self, player: PlayerId, frame: Vec<u8>) -> bool {
        let mut guard = self.clients.lock().expect("clients mutex poisoned");
        let Some(connection) = guard.get(&player) else {
            return false;
        };
        let reason = match connection.frames.try_send(frame) {
            Ok(()) => return true,
            Err(TrySendError::Full(_)) => "outbound queue full",
            Err(TrySendError::Disconnected(_)) => "writer stopped",
        };
        log::warn!("Dropping player connection {}: {}", player, reason);
        if let Some(connection) = guard.remove(&player) {
            connection.close();
        }
        false
    }

    pub fn connected(&self) -> usize {
        self.clients.lock().expect("clients mutex poisoned").len()
    }
}

pub fn start_player_server(bind_addr: SocketAddr) -> Option<PlayerServer> {
    let listener = match TcpListener::bind(bind_addr) {
        Ok(listener) => listener,
        Err(err) => {
            log::warn!(
                "Player server bind failed at {}: {}. Networking disabled.",
                bind_addr,
                err
            );
            return None;
        }
    };
    if let Err(err) = listener.set_nonblocking(true) {
        log::warn!("Player server could not be made nonblocking: {}", err);
        return None;
    }
    let local_addr = listener.local_addr().unwrap_or(bind_addr);

    let (sender, events) = unbounded::<NetworkEvent>();
    let clients: Clients = Arc::new(Mutex::new(HashMap::new()));
    let accept_clients = Arc::clone(&clients);

    thread::spawn(move || loop {
        match listener.accept() {
            Ok((stream, addr)) => {
                let player = PlayerId::random();
                log::info!("Player {} connected from {}", player, addr);
                if let Err(err) = stream.set_nodelay(true) {
                    log::warn!("Failed to set TCP_NODELAY: {}", err);
                }
                if let Err(err) = stream.set_nonblocking(false) {
                    log::warn!("Failed to set blocking mode for {}: {}", addr, err);
                }
                let (reader, writer) = match (stream.try_clone(), stream.try_clone()) {
                    (Ok(reader), Ok(writer)) => (reader, writer),
                    (Err(err), _) | (_, Err(err)) => {
                        log::error!("Failed to clone stream for {}: {}", addr, err);
                        continue;
                    }
                };
                let (frames, outbound) = bounded::<Vec<u8>>(OUTBOUND_QUEUE_FRAMES);
                accept_clients
                    .lock()
                    .expect("clients mutex poisoned")
                    .insert(player, Connection { frames, stream });
                if sender.send(NetworkEvent::Connected(player)).is_err() {
                    break;
                }
                thread::spawn(move || write_player_frames(player, writer, outbound));
                let sender = sender.clone();
                let clients = Arc::clone(&accept_clients);
                thread::spawn(move || read_player_frames(player, reader, sender, clients));
            }
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(50));
            }
            Err(err) => {
                log::error!("Error accepting player connection: {}", err);
                thread::sleep(Duration::from_millis(200));
            }
        }
    });

    Some(PlayerServer {
        clients,
        events,
        local_addr,
    })
}

fn read_player_frames(
    player: PlayerId,
    mut stream: TcpStream,
    sender: Sender<NetworkEvent>,
    clients: Clients,
) {
    loop {
        match read_frame(&mut stream) {
            Ok(frame) => {
                if sender.send(NetworkEvent::Frame(player, frame)).is_err() {
                    break;
                }
            }
            Err(err) => {
                if err.kind() != io::ErrorKind::UnexpectedEof {
                    log::warn!("Player {} read error: {}", player, err);
                }
                break;
            }
        }
    }
    if let Some(connection) = clients.lock().expect("clients mutex poisoned").remove(&player) {
        connection.close();
    }
    let _ = sender.send(NetworkEvent::Disconnected(player));
}

fn write_player_frames(player: PlayerId, mut stream: TcpStream, outbound: Receiver<Vec<u8>>) {
    for frame in outbound {
        if let Err(err) = write_frame(&mut stream, &frame) {
            log::warn!("Player {} write error: {}", player, err);
            break;
        }
    }
    // wakes the reader so the disconnect is reported
    let _ = stream.shutdown(std::net::Shutdown::Both);
}

/// Writes `frame` with a little-endian u32 length prefix.
pub fn write_frame(stream: &mut impl Write, frame: &[u8]) -> io::Result<()> {
    let len = frame.len() as u32;
    let mut buffer = Vec::with_capacity(4 + frame.len());
    buffer.extend_from_slice(&len.to_le_bytes());
    buffer.extend_from_slice(frame);
    stream.write_all(&buffer)
}

/// Reads one length-prefixed frame, refusing frames over the protocol limit.
pub fn read_frame(stream: &mut impl Read) -> io::Result<Vec<u8>> {
    let mut len = [0u8; 4];
    stream.read_exact(&mut len)?;
    let len = u32::from_le_bytes(len) as usize;
    if len > MAX_FRAME_BYTES {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds {MAX_FRAME_BYTES}"),
        ));
    }
    let mut frame = vec![0u8; len];
    stream.read_exact(&mut frame)?;
    Ok(frame)
}
