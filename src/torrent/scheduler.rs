//! The swarm scheduler: owns the piece inventory, the on-disk writer, the
//! tracker client, and every live peer connection. Peers are plain tokio
//! tasks talking to this loop over mpsc channels — there is no shared mutex
//! here, only messages in and commands out.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::bitfield::Bitfield;
use super::inventory::{BlockOutcome, Inventory, Progress};
use super::metainfo::Metainfo;
use super::peer::{self, PeerCommand, PeerConnection, PeerError, PeerEvent, PeerId};
use super::tracker::{AnnounceRequest, Event as TrackerEvent, TrackerClient, TrackerError};
use super::writer::PieceWriter;

/// Connection cap across the whole swarm.
pub const MAX_PEERS: usize = 30;
/// Outstanding block requests allowed per peer at once.
pub const DEFAULT_PIPELINE_DEPTH: usize = 5;
const MIN_PIPELINE_DEPTH: usize = 1;
const MAX_PIPELINE_DEPTH: usize = 50;
/// How long a peer address that failed to connect is kept out of the
/// candidate queue before being retried.
const DIAL_COOLDOWN: Duration = Duration::from_secs(300);
/// Budget for the final `stopped` announce during shutdown.
const STOP_ANNOUNCE_BUDGET: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    pub max_peers: usize,
    pub pipeline_depth: usize,
    pub listen_port: u16,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_peers: MAX_PEERS,
            pipeline_depth: DEFAULT_PIPELINE_DEPTH,
            listen_port: 6881,
        }
    }
}

impl SchedulerConfig {
    pub fn clamp_pipeline_depth(mut self) -> Self {
        self.pipeline_depth = self.pipeline_depth.clamp(MIN_PIPELINE_DEPTH, MAX_PIPELINE_DEPTH);
        self
    }
}

struct ConnectedPeer {
    commands: mpsc::Sender<PeerCommand>,
    bitfield: Bitfield,
    peer_choking: bool,
    am_interested: bool,
    outstanding: usize,
}

enum Inbound {
    Peer(SocketAddr, PeerEvent),
    Announce,
    StatusTick,
}

/// A 2-second-rolling view of swarm state, published for `Client::progress`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SwarmStatus {
    pub connected_peers: usize,
    pub download_rate_bps: u64,
    pub next_reannounce_in: Duration,
}

const STATUS_TICK: Duration = Duration::from_secs(2);

pub struct Scheduler {
    metainfo: Arc<Metainfo>,
    inventory: Inventory,
    writer: Arc<PieceWriter>,
    tracker: TrackerClient,
    our_peer_id: PeerId,
    config: SchedulerConfig,
    peers: HashMap<SocketAddr, ConnectedPeer>,
    candidates: VecDeque<SocketAddr>,
    known: HashSet<SocketAddr>,
    cooldown_until: HashMap<SocketAddr, Instant>,
    downloaded: u64,
    uploaded: u64,
    announced_completed: bool,
    status_tx: watch::Sender<SwarmStatus>,
    progress_tx: watch::Sender<Progress>,
    last_status_downloaded: u64,
    next_announce_at: Instant,
}

impl Scheduler {
    pub fn new(
        metainfo: Arc<Metainfo>,
        writer: Arc<PieceWriter>,
        our_peer_id: PeerId,
        config: SchedulerConfig,
    ) -> (Self, watch::Receiver<SwarmStatus>) {
        let inventory = Inventory::new(metainfo.clone());
        let tracker = TrackerClient::new(metainfo.tracker_tiers());
        let (status_tx, status_rx) = watch::channel(SwarmStatus::default());
        let (progress_tx, _) = watch::channel(inventory.progress());
        let scheduler = Self {
            metainfo,
            inventory,
            writer,
            tracker,
            our_peer_id,
            config: config.clamp_pipeline_depth(),
            peers: HashMap::new(),
            candidates: VecDeque::new(),
            known: HashSet::new(),
            cooldown_until: HashMap::new(),
            downloaded: 0,
            uploaded: 0,
            announced_completed: false,
            status_tx,
            progress_tx,
            last_status_downloaded: 0,
            next_announce_at: Instant::now(),
        };
        (scheduler, status_rx)
    }

    pub fn progress(&self) -> Progress {
        self.inventory.progress()
    }

    pub fn progress_watch(&self) -> watch::Receiver<Progress> {
        self.progress_tx.subscribe()
    }

    fn publish_status(&mut self) {
        let rate = (self.downloaded.saturating_sub(self.last_status_downloaded)) / STATUS_TICK.as_secs().max(1);
        self.last_status_downloaded = self.downloaded;
        let _ = self.status_tx.send(SwarmStatus {
            connected_peers: self.peers.len(),
            download_rate_bps: rate,
            next_reannounce_in: self.next_announce_at.saturating_duration_since(Instant::now()),
        });
        let _ = self.progress_tx.send(self.inventory.progress());
    }

    /// Drives the download to completion, or until `shutdown` is signaled.
    /// Announces `started`, connects peers as they become available,
    /// requests and verifies pieces, and always announces `stopped` on the
    /// way out. Returns once every piece is written and finalized (or
    /// shutdown was requested), or propagates the first unrecoverable error.
    pub async fn run_until(&mut self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let (event_tx, mut event_rx) = mpsc::channel::<(SocketAddr, PeerEvent)>(256);

        let announce = self.announce(TrackerEvent::Started).await?;
        self.merge_candidates(announce.peers);
        let reannounce_period = Duration::from_secs(announce.interval.clamp(30, 3600));
        self.next_announce_at = Instant::now() + reannounce_period;
        let mut announce_interval = tokio::time::interval(reannounce_period);
        announce_interval.tick().await; // first tick fires immediately; consume it
        let mut status_interval = tokio::time::interval(STATUS_TICK);
        status_interval.tick().await;

        let mut rejected: Option<anyhow::Error> = None;

        loop {
            if self.inventory.is_complete() || *shutdown.borrow() || rejected.is_some() {
                break;
            }
            self.dial_candidates(event_tx.clone());

            let next = tokio::select! {
                event = event_rx.recv() => event.map(|(addr, ev)| Inbound::Peer(addr, ev)),
                _ = announce_interval.tick() => Some(Inbound::Announce),
                _ = status_interval.tick() => Some(Inbound::StatusTick),
                _ = shutdown.changed() => None,
            };

            match next {
                Some(Inbound::Peer(addr, event)) => self.handle_peer_event(addr, event).await,
                Some(Inbound::Announce) => {
                    self.next_announce_at = Instant::now() + reannounce_period;
                    match self.announce(TrackerEvent::None).await {
                        Ok(response) => self.merge_candidates(response.peers),
                        Err(err) if is_tracker_rejected(&err) => {
                            warn!(error = %err, "tracker rejected reannounce, aborting torrent");
                            rejected = Some(err);
                        }
                        Err(err) => {
                            warn!(error = %err, "reannounce failed, will retry on next interval");
                        }
                    }
                }
                Some(Inbound::StatusTick) => {
                    self.publish_status();
                    self.requeue_cooled_down();
                }
                None => break,
            }
        }

        if self.inventory.is_complete() {
            self.writer.finalize().await?;
            if !self.announced_completed {
                let _ = self.announce(TrackerEvent::Completed).await;
                self.announced_completed = true;
            }
            info!("download complete");
        } else {
            debug!("shutdown requested before completion");
        }
        let _ = tokio::time::timeout(STOP_ANNOUNCE_BUDGET, self.announce(TrackerEvent::Stopped)).await;

        if let Some(err) = rejected {
            return Err(err);
        }
        Ok(())
    }

    async fn announce(&mut self, event: TrackerEvent) -> anyhow::Result<super::tracker::AnnounceResponse> {
        let progress = self.inventory.progress();
        let left = progress.bytes_total - progress.bytes_complete;
        let req = AnnounceRequest {
            info_hash: &self.metainfo.info_hash,
            peer_id: &self.our_peer_id,
            port: self.config.listen_port,
            uploaded: self.uploaded,
            downloaded: self.downloaded,
            left,
            event,
        };
        Ok(self.tracker.announce(&req).await?)
    }

    fn merge_candidates(&mut self, peers: Vec<super::tracker::PeerAddr>) {
        for p in peers {
            let addr = SocketAddr::new(p.ip, p.port);
            if self.known.insert(addr) {
                self.candidates.push_back(addr);
            }
        }
    }

    /// Moves addresses whose dial cooldown has elapsed back into the
    /// candidate queue, so a peer that disconnected or failed to connect
    /// once is retried rather than permanently excluded.
    fn requeue_cooled_down(&mut self) {
        let now = Instant::now();
        let ready: Vec<SocketAddr> = self
            .cooldown_until
            .iter()
            .filter(|(addr, &until)| now >= until && !self.peers.contains_key(addr))
            .map(|(addr, _)| *addr)
            .collect();
        for addr in ready {
            self.cooldown_until.remove(&addr);
            if !self.candidates.contains(&addr) {
                self.candidates.push_back(addr);
            }
        }
    }

    fn dial_candidates(&mut self, event_tx: mpsc::Sender<(SocketAddr, PeerEvent)>) {
        let now = Instant::now();
        let mut remaining = VecDeque::new();
        while let Some(addr) = self.candidates.pop_front() {
            if self.peers.len() >= self.config.max_peers {
                remaining.push_back(addr);
                continue;
            }
            if let Some(&until) = self.cooldown_until.get(&addr) {
                if now < until {
                    remaining.push_back(addr);
                    continue;
                }
            }
            if self.peers.contains_key(&addr) {
                continue;
            }
            self.spawn_dial(addr, event_tx.clone());
        }
        self.candidates = remaining;
    }

    fn spawn_dial(&mut self, addr: SocketAddr, event_tx: mpsc::Sender<(SocketAddr, PeerEvent)>) {
        let info_hash = self.metainfo.info_hash;
        let our_peer_id = self.our_peer_id;
        let piece_count = self.inventory.total_pieces();
        let our_bitfield = self.our_bitfield();
        let (cmd_tx, cmd_rx) = mpsc::channel::<PeerCommand>(32);

        self.peers.insert(
            addr,
            ConnectedPeer {
                commands: cmd_tx,
                bitfield: Bitfield::empty(piece_count),
                peer_choking: true,
                am_interested: false,
                outstanding: 0,
            },
        );
        self.cooldown_until.insert(addr, Instant::now() + DIAL_COOLDOWN);

        tokio::spawn(async move {
            match dial_and_run(addr, info_hash, our_peer_id, piece_count, our_bitfield, event_tx.clone(), cmd_rx).await
            {
                Ok(()) => {}
                Err(err) => {
                    debug!(%addr, error = %err, "peer dial failed");
                    let _ = event_tx.send((addr, PeerEvent::Disconnected { returned: vec![] })).await;
                }
            }
        });
    }

    fn our_bitfield(&self) -> Bitfield {
        let mut bf = Bitfield::empty(self.inventory.total_pieces());
        for i in 0..self.inventory.total_pieces() {
            if self.inventory.have(i) {
                bf.set(i);
            }
        }
        bf
    }

    async fn handle_peer_event(&mut self, addr: SocketAddr, event: PeerEvent) {
        match event {
            PeerEvent::Connected { bitfield, .. } => {
                if let Some(peer) = self.peers.get_mut(&addr) {
                    peer.bitfield = bitfield;
                }
                self.maybe_request_more(addr).await;
            }
            PeerEvent::BitfieldUpdated(bitfield) => {
                if let Some(peer) = self.peers.get_mut(&addr) {
                    peer.bitfield = bitfield;
                }
                self.maybe_request_more(addr).await;
            }
            PeerEvent::Unchoked => {
                if let Some(peer) = self.peers.get_mut(&addr) {
                    peer.peer_choking = false;
                }
                self.maybe_request_more(addr).await;
            }
            PeerEvent::Choked(returned) => {
                if let Some(peer) = self.peers.get_mut(&addr) {
                    peer.peer_choking = true;
                    peer.outstanding = peer.outstanding.saturating_sub(returned.len());
                }
                self.inventory.cancel(&returned);
            }
            PeerEvent::Interested | PeerEvent::NotInterested => {
                // No upload path in this client; nothing to do beyond bookkeeping.
            }
            PeerEvent::Block { index, begin, block } => {
                self.on_block(addr, index, begin, block).await;
            }
            PeerEvent::RequestsExpired(requests) => {
                self.inventory.cancel(&requests);
                if let Some(peer) = self.peers.get_mut(&addr) {
                    peer.outstanding = peer.outstanding.saturating_sub(requests.len());
                }
                self.maybe_request_more(addr).await;
            }
            PeerEvent::Disconnected { returned } => {
                self.inventory.cancel(&returned);
                self.peers.remove(&addr);
                debug!(%addr, "peer disconnected");
            }
        }
    }

    async fn on_block(&mut self, addr: SocketAddr, index: u32, begin: u32, block: Vec<u8>) {
        if let Some(peer) = self.peers.get_mut(&addr) {
            peer.outstanding = peer.outstanding.saturating_sub(1);
        }
        self.downloaded += block.len() as u64;
        let outcome = self.inventory.on_block(index as usize, begin, &block);
        match outcome {
            BlockOutcome::PieceCompleted(piece, bytes) => {
                info!(piece, "piece complete");
                if let Err(err) = self.writer.write_piece(&self.metainfo, piece, bytes).await {
                    warn!(piece, error = %err, "failed to write completed piece");
                }
                self.broadcast_have(piece as u32).await;
                let _ = self.progress_tx.send(self.inventory.progress());
            }
            BlockOutcome::HashMismatch(piece) => {
                warn!(piece, "discarding piece, hash mismatch");
            }
            BlockOutcome::Accepted | BlockOutcome::Stale => {}
        }
        self.maybe_request_more(addr).await;
    }

    async fn broadcast_have(&mut self, piece: u32) {
        for peer in self.peers.values() {
            let _ = peer.commands.send(PeerCommand::SendHave(piece)).await;
        }
    }

    async fn maybe_request_more(&mut self, addr: SocketAddr) {
        let Some(peer) = self.peers.get(&addr) else { return };
        let bitfield = peer.bitfield.clone();
        let wants_anything = (0..bitfield.piece_count()).any(|i| bitfield.has(i) && !self.inventory.have(i));

        if let Some(peer) = self.peers.get_mut(&addr) {
            if wants_anything && !peer.am_interested {
                peer.am_interested = true;
                let _ = peer.commands.send(PeerCommand::Interested).await;
            } else if !wants_anything && peer.am_interested {
                peer.am_interested = false;
                let _ = peer.commands.send(PeerCommand::NotInterested).await;
            }
        }

        let Some(peer) = self.peers.get(&addr) else { return };
        if peer.peer_choking {
            return;
        }
        let depth = self.config.pipeline_depth;
        let mut to_send = Vec::new();
        let mut outstanding = peer.outstanding;
        while outstanding < depth {
            match self.inventory.next_request(&bitfield) {
                Some(req) => {
                    to_send.push(req);
                    outstanding += 1;
                }
                None => break,
            }
        }
        if to_send.is_empty() {
            return;
        }
        if let Some(peer) = self.peers.get_mut(&addr) {
            peer.outstanding += to_send.len();
            for req in to_send {
                let _ = peer.commands.send(PeerCommand::Request(req)).await;
            }
        }
    }
}

fn is_tracker_rejected(err: &anyhow::Error) -> bool {
    matches!(err.downcast_ref::<TrackerError>(), Some(TrackerError::TrackerRejected(_)))
}

async fn dial_and_run(
    addr: SocketAddr,
    info_hash: [u8; 20],
    our_peer_id: PeerId,
    piece_count: usize,
    our_bitfield: Bitfield,
    event_tx: mpsc::Sender<(SocketAddr, PeerEvent)>,
    cmd_rx: mpsc::Receiver<PeerCommand>,
) -> Result<(), PeerError> {
    let mut stream = TcpStream::connect(addr).await?;
    let their_peer_id = peer::handshake(&mut stream, &info_hash, &our_peer_id).await?;

    let connection = PeerConnection::new(stream, piece_count);
    let _ = event_tx
        .send((addr, PeerEvent::Connected { peer_id: their_peer_id, bitfield: Bitfield::empty(piece_count) }))
        .await;

    let events_for_peer = event_tx.clone();
    let (inner_tx, mut inner_rx) = mpsc::channel(256);
    tokio::spawn(async move {
        while let Some(event) = inner_rx.recv().await {
            if events_for_peer.send((addr, event)).await.is_err() {
                break;
            }
        }
    });

    connection.run(our_bitfield, inner_tx, cmd_rx).await;
    Ok(())
}
