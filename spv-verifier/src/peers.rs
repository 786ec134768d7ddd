use std::time::{Duration, Instant};

use log::{debug, trace, warn};
use serde::{Deserialize, Serialize};
use spv_types::{ExtendedHeader, Header};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::time;

use crate::config::Config;
use crate::engine::StopSignal;
use crate::error::PeerError;

pub type PeerId = usize;

/// Depth of each inbound peer queue. Notifications beyond it are dropped at
/// the transport's end, which is safe: any later tip notification
/// re-triggers extension.
const QUEUE_DEPTH: usize = 32;

/// A header as peers announce it: the wire fields plus the height the peer
/// claims for it. Hex hashes are in display byte order.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct HeaderRecord {
    #[serde(flatten)]
    pub header: Header,
    pub block_height: u64,
}

impl HeaderRecord {
    pub fn into_extended(self) -> ExtendedHeader {
        ExtendedHeader::from_header(self.header, self.block_height)
    }
}

/// Requests the engine asks a peer transport to put on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerRequest {
    /// `blockchain.block.get_header(height)`.
    GetHeader { height: u64 },
}

/// The error object of a peer's response record.
#[derive(Debug, Clone, thiserror::Error)]
#[error("peer error response: {0}")]
pub struct RpcError(pub String);

/// Reply on a peer's `get_header` queue.
pub type HeaderReply = Result<HeaderRecord, RpcError>;

/// The transport half of a registered peer. A transport task owns the
/// socket, reads requests from `requests`, and pushes decoded
/// `blockchain.headers.subscribe` notifications into `tips` and
/// `blockchain.block.get_header` replies into `headers`.
pub struct PeerChannels {
    pub requests: mpsc::UnboundedReceiver<PeerRequest>,
    pub tips: mpsc::Sender<HeaderRecord>,
    pub headers: mpsc::Sender<HeaderReply>,
}

struct Peer {
    name: String,
    requests: mpsc::UnboundedSender<PeerRequest>,
    tips: mpsc::Receiver<HeaderRecord>,
    headers: mpsc::Receiver<HeaderReply>,
    flagged_until: Option<Instant>,
    dead: bool,
}

impl Peer {
    fn is_active(&self) -> bool {
        !self.dead && self.flagged_until.map_or(true, |until| Instant::now() >= until)
    }
}

/// Round-robin multiplexer over the registered peers. Owned by the verifier
/// task; the queues are single-producer single-consumer by construction.
pub struct PeerPool {
    peers: Vec<Peer>,
    cursor: usize,
    poll_interval: Duration,
    request_timeout: Duration,
    request_retries: u32,
    cooldown: Duration,
}

impl PeerPool {
    pub fn new(config: &Config) -> Self {
        Self {
            peers: Vec::new(),
            cursor: 0,
            poll_interval: Duration::from_secs(config.poll_interval_secs),
            request_timeout: Duration::from_secs(config.request_timeout_secs),
            request_retries: config.request_retries,
            cooldown: Duration::from_secs(config.peer_cooldown_secs),
        }
    }

    /// Registers a peer, handing back the channel ends its transport task
    /// drives.
    pub fn register(&mut self, name: impl Into<String>) -> PeerChannels {
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (tip_tx, tip_rx) = mpsc::channel(QUEUE_DEPTH);
        let (header_tx, header_rx) = mpsc::channel(QUEUE_DEPTH);

        let name = name.into();
        debug!(target: "verifier", "registered peer {name}");
        self.peers.push(Peer {
            name,
            requests: request_tx,
            tips: tip_rx,
            headers: header_rx,
            flagged_until: None,
            dead: false,
        });

        PeerChannels {
            requests: request_rx,
            tips: tip_tx,
            headers: header_tx,
        }
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn name(&self, peer: PeerId) -> &str {
        &self.peers[peer].name
    }

    /// Non-blocking scan across the active peers' tip queues, sleeping
    /// between rounds; weakly fair by rotating the scan start. Returns
    /// `None` once the engine is stopping.
    pub async fn next_tip(&mut self, stop: &StopSignal) -> Option<(PeerId, HeaderRecord)> {
        loop {
            if stop.is_stopped() {
                return None;
            }

            let count = self.peers.len();
            for offset in 0..count {
                let idx = (self.cursor + offset) % count;
                if !self.peers[idx].is_active() {
                    continue;
                }
                match self.peers[idx].tips.try_recv() {
                    Ok(record) => {
                        self.cursor = (idx + 1) % count;
                        return Some((idx, record));
                    }
                    Err(TryRecvError::Empty) => {}
                    Err(TryRecvError::Disconnected) => {
                        warn!(target: "verifier", "peer {} went away", self.peers[idx].name);
                        self.peers[idx].dead = true;
                    }
                }
            }

            time::sleep(self.poll_interval).await;
        }
    }

    /// Sends a `get_header` request and polls the reply queue at the
    /// configured granularity, skipping server error records, until a reply
    /// arrives or the retry budget is spent.
    pub async fn fetch_header(
        &mut self,
        peer: PeerId,
        height: u64,
        stop: &StopSignal,
    ) -> Result<HeaderRecord, PeerError> {
        let request_timeout = self.request_timeout;
        let request_retries = self.request_retries;
        let entry = &mut self.peers[peer];

        debug!(target: "verifier", "requesting header {height} from {}", entry.name);
        if entry.requests.send(PeerRequest::GetHeader { height }).is_err() {
            entry.dead = true;
            return Err(PeerError::Disconnected);
        }

        for _ in 0..request_retries {
            if stop.is_stopped() {
                return Err(PeerError::Stopped);
            }
            match time::timeout(request_timeout, entry.headers.recv()).await {
                Ok(Some(Ok(record))) => return Ok(record),
                Ok(Some(Err(rpc))) => {
                    warn!(target: "verifier", "{} answered with an error: {rpc}", entry.name);
                }
                Ok(None) => {
                    entry.dead = true;
                    return Err(PeerError::Disconnected);
                }
                Err(_) => {
                    trace!(target: "verifier", "header {height} still pending from {}", entry.name);
                }
            }
        }
        Err(PeerError::Timeout)
    }

    /// Puts a peer on cooldown; scans skip it until the cooldown lapses.
    pub fn flag(&mut self, peer: PeerId) {
        let cooldown = self.cooldown;
        let entry = &mut self.peers[peer];
        entry.flagged_until = Some(Instant::now() + cooldown);
        warn!(target: "verifier", "flagged peer {} for {cooldown:?}", entry.name);
    }
}
