//! A single peer connection: handshake, message framing, and the per-peer
//! choke/interest/request state machine. Each `Peer` runs as its own tokio
//! task, exchanging `PeerEvent`/`PeerCommand` with the scheduler over mpsc
//! channels rather than sharing mutable state.

use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{interval, timeout, Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};

use super::bitfield::Bitfield;
use super::inventory::BlockRequest;
use super::message::Message;

pub type PeerId = [u8; 20];

/// Maximum frame length we'll allocate a buffer for. A `piece` message at the
/// default 16 KiB block size plus a few bytes of header is nowhere near this;
/// anything claiming to be bigger is either corrupt or hostile.
const MAX_FRAME_LEN: u32 = 1 << 17;

const KEEPALIVE_IDLE: Duration = Duration::from_secs(90);
const PEER_TIMEOUT: Duration = Duration::from_secs(120);
const REQUEST_DEADLINE: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("handshake mismatch: {0}")]
    HandshakeMismatch(String),
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("frame length {0} exceeds maximum")]
    OversizeFrame(u32),
    #[error("peer sent no data for {0:?}")]
    PeerIdle(Duration),
}

/// Commands the scheduler sends down to a peer task.
#[derive(Debug)]
pub enum PeerCommand {
    Request(BlockRequest),
    Cancel(BlockRequest),
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    SendHave(u32),
    Shutdown,
}

/// Events a peer task reports back up to the scheduler.
#[derive(Debug)]
pub enum PeerEvent {
    Connected { peer_id: PeerId, bitfield: Bitfield },
    BitfieldUpdated(Bitfield),
    Block { index: u32, begin: u32, block: Vec<u8> },
    /// Requests lost to a `choke`; the connection is still alive.
    Choked(Vec<BlockRequest>),
    Unchoked,
    Interested,
    NotInterested,
    /// Requests past their deadline; the peer connection is still alive.
    RequestsExpired(Vec<BlockRequest>),
    Disconnected { returned: Vec<BlockRequest> },
}

pub struct HandshakeInfo {
    pub info_hash: [u8; 20],
    pub peer_id: PeerId,
}

const PROTOCOL: &[u8] = b"BitTorrent protocol";

/// Performs the 68-byte handshake on an already-connected stream, as either
/// the dialing or accepting side; the wire exchange is identical.
pub async fn handshake(
    stream: &mut TcpStream,
    info_hash: &[u8; 20],
    our_peer_id: &PeerId,
) -> Result<PeerId, PeerError> {
    let mut out = Vec::with_capacity(68);
    out.push(PROTOCOL.len() as u8);
    out.extend_from_slice(PROTOCOL);
    out.extend_from_slice(&[0u8; 8]);
    out.extend_from_slice(info_hash);
    out.extend_from_slice(our_peer_id);
    stream.write_all(&out).await?;

    let mut header = [0u8; 68];
    stream.read_exact(&mut header).await?;

    let plen = header[0] as usize;
    if plen != PROTOCOL.len() || &header[1..1 + plen] != PROTOCOL {
        return Err(PeerError::HandshakeMismatch("unexpected protocol string".into()));
    }
    let their_info_hash = &header[28..48];
    if their_info_hash != info_hash {
        return Err(PeerError::HandshakeMismatch("info_hash mismatch".into()));
    }
    let mut their_peer_id = [0u8; 20];
    their_peer_id.copy_from_slice(&header[48..68]);
    Ok(their_peer_id)
}

/// Reads and writes length-prefixed frames on top of a handshaked stream,
/// bridging to the scheduler over `events`/`commands`. Runs until the peer
/// disconnects, times out, or the scheduler sends `Shutdown`.
pub struct PeerConnection {
    stream: TcpStream,
    piece_count: usize,
    am_choking: bool,
    am_interested: bool,
    peer_choking: bool,
    peer_interested: bool,
    outstanding: Vec<(BlockRequest, Instant)>,
    received_any_message: bool,
}

impl PeerConnection {
    pub fn new(stream: TcpStream, piece_count: usize) -> Self {
        Self {
            stream,
            piece_count,
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
            outstanding: Vec::new(),
            received_any_message: false,
        }
    }

    pub fn am_interested(&self) -> bool {
        self.am_interested
    }

    pub fn peer_choking(&self) -> bool {
        self.peer_choking
    }

    async fn send(&mut self, message: &Message) -> Result<(), PeerError> {
        self.stream.write_all(&message.to_bytes()).await?;
        Ok(())
    }

    async fn read_frame(&mut self) -> Result<Message, PeerError> {
        let mut len_buf = [0u8; 4];
        self.stream.read_exact(&mut len_buf).await?;
        let len = u32::from_be_bytes(len_buf);
        if len == 0 {
            return Ok(Message::KeepAlive);
        }
        if len > MAX_FRAME_LEN {
            return Err(PeerError::OversizeFrame(len));
        }
        let mut payload = vec![0u8; len as usize];
        self.stream.read_exact(&mut payload).await?;
        Message::from_payload(&payload).map_err(|e| PeerError::ProtocolViolation(e.to_string()))
    }

    /// Runs the connection's event loop until disconnection or shutdown.
    /// `our_bitfield` is sent immediately after the caller has already
    /// completed the handshake.
    pub async fn run(
        mut self,
        our_bitfield: Bitfield,
        events: mpsc::Sender<PeerEvent>,
        mut commands: mpsc::Receiver<PeerCommand>,
    ) {
        if !our_bitfield.to_wire_bytes().iter().all(|&b| b == 0) {
            if let Err(err) = self.send(&Message::Bitfield(our_bitfield.to_wire_bytes())).await {
                warn!(error = %err, "failed to send initial bitfield");
                let _ = events.send(PeerEvent::Disconnected { returned: self.outstanding() }).await;
                return;
            }
        }

        let mut peer_bitfield = Bitfield::empty(self.piece_count);
        let mut keepalive_ticker = interval(KEEPALIVE_IDLE);
        keepalive_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_recv = Instant::now();

        loop {
            tokio::select! {
                frame = timeout(PEER_TIMEOUT, self.read_frame()) => {
                    match frame {
                        Ok(Ok(message)) => {
                            last_recv = Instant::now();
                            if let Some(outcome) = self.handle_message(message, &mut peer_bitfield, &events).await {
                                if outcome.is_err() {
                                    break;
                                }
                            }
                        }
                        Ok(Err(err)) => {
                            debug!(error = %err, "peer connection read failed");
                            break;
                        }
                        Err(_) => {
                            debug!("peer idle past timeout");
                            break;
                        }
                    }
                    self.expire_stale_requests(&events).await;
                }
                _ = keepalive_ticker.tick() => {
                    if last_recv.elapsed() >= PEER_TIMEOUT {
                        warn!("peer sent nothing for {:?}, disconnecting", PEER_TIMEOUT);
                        break;
                    }
                    if self.send(&Message::KeepAlive).await.is_err() {
                        break;
                    }
                }
                command = commands.recv() => {
                    match command {
                        Some(PeerCommand::Shutdown) | None => break,
                        Some(cmd) => {
                            if self.handle_command(cmd).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            }
        }

        let _ = events.send(PeerEvent::Disconnected { returned: self.outstanding() }).await;
    }

    async fn handle_message(
        &mut self,
        message: Message,
        peer_bitfield: &mut Bitfield,
        events: &mpsc::Sender<PeerEvent>,
    ) -> Option<Result<(), PeerError>> {
        match message {
            Message::KeepAlive => {}
            Message::Choke => {
                self.peer_choking = true;
                let returned = self.outstanding();
                self.outstanding.clear();
                let _ = events.send(PeerEvent::Choked(returned)).await;
            }
            Message::Unchoke => {
                self.peer_choking = false;
                let _ = events.send(PeerEvent::Unchoked).await;
            }
            Message::Interested => {
                self.peer_interested = true;
                let _ = events.send(PeerEvent::Interested).await;
            }
            Message::NotInterested => {
                self.peer_interested = false;
                let _ = events.send(PeerEvent::NotInterested).await;
            }
            Message::Have(index) => {
                peer_bitfield.set(index as usize);
                let _ = events.send(PeerEvent::BitfieldUpdated(peer_bitfield.clone())).await;
            }
            Message::Bitfield(bytes) => {
                if self.received_any_message {
                    warn!("bitfield received after other messages, protocol violation");
                    return Some(Err(PeerError::ProtocolViolation(
                        "bitfield must be the first message".into(),
                    )));
                }
                match Bitfield::from_wire_bytes(bytes, self.piece_count) {
                    Ok(bf) => {
                        *peer_bitfield = bf.clone();
                        let _ = events.send(PeerEvent::BitfieldUpdated(bf)).await;
                    }
                    Err(err) => {
                        return Some(Err(PeerError::ProtocolViolation(err.to_string())));
                    }
                }
            }
            Message::Request { .. } | Message::Cancel { .. } => {
                trace!("ignoring upload-path request/cancel, seeding is out of scope");
            }
            Message::Piece { index, begin, block } => {
                self.outstanding.retain(|(r, _)| !(r.piece == index as usize && r.offset == begin));
                let _ = events.send(PeerEvent::Block { index, begin, block }).await;
            }
            Message::Port(_) | Message::Unknown(_) => {}
        }
        self.received_any_message = true;
        Some(Ok(()))
    }

    async fn handle_command(&mut self, command: PeerCommand) -> Result<(), PeerError> {
        match command {
            PeerCommand::Request(req) => {
                self.send(&Message::Request {
                    index: req.piece as u32,
                    begin: req.offset,
                    length: req.length,
                })
                .await?;
                self.outstanding.push((req, Instant::now()));
            }
            PeerCommand::Cancel(req) => {
                self.outstanding.retain(|(r, _)| *r != req);
                self.send(&Message::Cancel {
                    index: req.piece as u32,
                    begin: req.offset,
                    length: req.length,
                })
                .await?;
            }
            PeerCommand::Choke => {
                self.am_choking = true;
                self.send(&Message::Choke).await?;
            }
            PeerCommand::Unchoke => {
                self.am_choking = false;
                self.send(&Message::Unchoke).await?;
            }
            PeerCommand::Interested => {
                self.am_interested = true;
                self.send(&Message::Interested).await?;
            }
            PeerCommand::NotInterested => {
                self.am_interested = false;
                self.send(&Message::NotInterested).await?;
            }
            PeerCommand::SendHave(index) => {
                self.send(&Message::Have(index)).await?;
            }
            PeerCommand::Shutdown => {}
        }
        Ok(())
    }

    async fn expire_stale_requests(&mut self, events: &mpsc::Sender<PeerEvent>) {
        let now = Instant::now();
        let (expired, kept): (Vec<_>, Vec<_>) = self
            .outstanding
            .drain(..)
            .partition(|(_, sent_at)| now.duration_since(*sent_at) >= REQUEST_DEADLINE);
        self.outstanding = kept;
        if !expired.is_empty() {
            let returned: Vec<BlockRequest> = expired.into_iter().map(|(r, _)| r).collect();
            debug!(count = returned.len(), "requests past deadline, returning to pool");
            let _ = events.send(PeerEvent::RequestsExpired(returned)).await;
        }
    }

    fn outstanding(&self) -> Vec<BlockRequest> {
        self.outstanding.iter().map(|(r, _)| *r).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn handshake_round_trips_over_loopback() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let info_hash = [7u8; 20];
        let our_id = [1u8; 20];
        let their_id = [2u8; 20];

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            handshake(&mut stream, &info_hash, &their_id).await.unwrap()
        });

        let mut client_stream = TcpStream::connect(addr).await.unwrap();
        let got_their_id = handshake(&mut client_stream, &info_hash, &our_id).await.unwrap();
        let got_our_id = server.await.unwrap();

        assert_eq!(got_their_id, their_id);
        assert_eq!(got_our_id, our_id);
    }

    #[tokio::test]
    async fn handshake_rejects_info_hash_mismatch() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let _ = handshake(&mut stream, &[9u8; 20], &[2u8; 20]).await;
        });

        let mut client_stream = TcpStream::connect(addr).await.unwrap();
        let result = handshake(&mut client_stream, &[1u8; 20], &[1u8; 20]).await;
        assert!(matches!(result, Err(PeerError::HandshakeMismatch(_))) || result.is_err());
        let _ = server.await;
    }

    #[tokio::test]
    async fn choke_returns_outstanding_requests_and_notifies_scheduler() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move { listener.accept().await.unwrap().0 });
        let client_stream = TcpStream::connect(addr).await.unwrap();
        let _server_stream = accept.await.unwrap();

        let mut conn = PeerConnection::new(client_stream, 4);
        let (events_tx, mut events_rx) = mpsc::channel(8);
        let mut peer_bitfield = Bitfield::empty(4);

        let req = BlockRequest { piece: 0, offset: 0, length: 16384 };
        conn.handle_command(PeerCommand::Request(req)).await.unwrap();
        assert_eq!(conn.outstanding(), vec![req]);

        conn.handle_message(Message::Choke, &mut peer_bitfield, &events_tx).await;
        assert!(conn.outstanding().is_empty(), "outstanding requests must be cleared on choke");

        match events_rx.try_recv().unwrap() {
            PeerEvent::Choked(returned) => assert_eq!(returned, vec![req]),
            other => panic!("expected Choked, got {other:?}"),
        }
    }
}
