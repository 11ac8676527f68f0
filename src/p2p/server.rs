//! The TCP transport: an accept loop, one reader and one writer task per
//! peer, and a concurrent peer map.
//!
//! Outgoing messages are enqueued per peer with a priority; a 50 ms batch
//! timer coalesces the queue and writes the drained frames back-to-back.
//! Within one peer's stream, ordering is preserved among equal-priority
//! messages. Incoming frames are deframed, decompressed and handed to the
//! dispatch handler; a transport error ends the reader and removes the peer.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::io::BufReader;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::time;
use tracing::{debug, info, warn};

use super::codec::{self, Message};
use super::priority::{Priority, PriorityQueue};
use crate::errors::{ChainResult, TransportError};

/// Coalescing window for outbound batches.
pub const BATCH_INTERVAL: Duration = Duration::from_millis(50);
/// Probes sent by one latency measurement.
pub const LATENCY_PROBES: u64 = 10;
/// Spacing between latency probes.
pub const PROBE_SPACING: Duration = Duration::from_millis(100);

/// Dispatch target for inbound peer messages.
pub trait MessageHandler: Send + Sync + 'static {
    fn handle(&self, server: &P2pServer, peer_id: &str, message: Message);
}

struct PeerEntry {
    sender: mpsc::UnboundedSender<(Message, Priority)>,
    outstanding_ping: Option<(u64, Instant)>,
    rtt: Option<Duration>,
}

#[derive(Default)]
pub struct P2pServer {
    peers: RwLock<HashMap<String, PeerEntry>>,
}

impl P2pServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.read().len()
    }

    pub fn peer_ids(&self) -> Vec<String> {
        self.peers.read().keys().cloned().collect()
    }

    pub fn peer_rtt(&self, peer_id: &str) -> Option<Duration> {
        self.peers.read().get(peer_id).and_then(|peer| peer.rtt)
    }

    /// Queue a message for one peer. Returns false if the peer is gone.
    pub fn send_to(&self, peer_id: &str, message: Message, priority: Priority) -> bool {
        let peers = self.peers.read();
        match peers.get(peer_id) {
            Some(peer) => peer.sender.send((message, priority)).is_ok(),
            None => false,
        }
    }

    /// Queue a message for every connected peer.
    pub fn broadcast(&self, message: Message, priority: Priority) {
        let peers = self.peers.read();
        for peer in peers.values() {
            let _ = peer.sender.send((message.clone(), priority));
        }
    }

    pub fn broadcast_block(&self, block: crate::types::Block) {
        self.broadcast(Message::NewBlock { block }, Priority::High);
    }

    pub fn broadcast_transaction(&self, transaction: crate::types::Transaction) {
        self.broadcast(Message::NewTransaction { transaction }, Priority::Normal);
    }

    /// Measure a peer's round-trip latency with a burst of spaced pings;
    /// the last pong observed updates the recorded RTT.
    pub fn probe_latency(self: &Arc<Self>, peer_id: String) {
        let server = Arc::clone(self);
        tokio::spawn(async move {
            for nonce in 0..LATENCY_PROBES {
                {
                    let mut peers = server.peers.write();
                    let Some(peer) = peers.get_mut(&peer_id) else {
                        return;
                    };
                    peer.outstanding_ping = Some((nonce, Instant::now()));
                }
                if !server.send_to(&peer_id, Message::Ping { nonce }, Priority::High) {
                    return;
                }
                time::sleep(PROBE_SPACING).await;
            }
        });
    }

    /// Accept connections until shutdown. Each connection gets a reader and
    /// a writer task; the reader removes the peer when it exits.
    pub async fn run(
        self: Arc<Self>,
        listener: TcpListener,
        handler: Arc<dyn MessageHandler>,
        mut shutdown: watch::Receiver<bool>,
    ) -> ChainResult<()> {
        info!(addr = %listener.local_addr()?, "p2p listener started");
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("p2p listener stopping");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => {
                            let peer_id = addr.to_string();
                            self.clone().spawn_peer(stream, peer_id, handler.clone(), shutdown.clone());
                        }
                        Err(err) => warn!(%err, "accept failed"),
                    }
                }
            }
        }
    }

    /// Dial a remote peer and attach it to the peer map. Returns the peer id.
    pub async fn connect(
        self: &Arc<Self>,
        addr: &str,
        handler: Arc<dyn MessageHandler>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<String, TransportError> {
        let stream = TcpStream::connect(addr).await?;
        let peer_id = addr.to_string();
        self.clone()
            .spawn_peer(stream, peer_id.clone(), handler, shutdown);
        Ok(peer_id)
    }

    fn spawn_peer(
        self: Arc<Self>,
        stream: TcpStream,
        peer_id: String,
        handler: Arc<dyn MessageHandler>,
        shutdown: watch::Receiver<bool>,
    ) {
        let (read_half, write_half) = stream.into_split();
        let (sender, receiver) = mpsc::unbounded_channel();
        self.peers.write().insert(
            peer_id.clone(),
            PeerEntry {
                sender,
                outstanding_ping: None,
                rtt: None,
            },
        );
        debug!(peer = %peer_id, "peer connected");

        tokio::spawn(write_loop(write_half, receiver, shutdown.clone()));

        let server = Arc::clone(&self);
        tokio::spawn(async move {
            let mut reader = BufReader::new(read_half);
            let mut shutdown = shutdown;
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    incoming = codec::read_message(&mut reader) => {
                        match incoming {
                            Ok(message) => server.dispatch(&peer_id, message, handler.as_ref()),
                            Err(err) => {
                                debug!(peer = %peer_id, %err, "peer reader closing");
                                break;
                            }
                        }
                    }
                }
            }
            server.peers.write().remove(&peer_id);
            info!(peer = %peer_id, "peer disconnected");
        });
    }

    fn dispatch(&self, peer_id: &str, message: Message, handler: &dyn MessageHandler) {
        match &message {
            Message::Ping { nonce } => {
                self.send_to(peer_id, Message::Pong { nonce: *nonce }, Priority::High);
            }
            Message::Pong { nonce } => {
                let mut peers = self.peers.write();
                if let Some(peer) = peers.get_mut(peer_id) {
                    if let Some((expected, sent_at)) = peer.outstanding_ping.take() {
                        if expected == *nonce {
                            peer.rtt = Some(sent_at.elapsed());
                        }
                    }
                }
            }
            _ => {}
        }
        handler.handle(self, peer_id, message);
    }
}

/// Per-peer writer: enqueue into the priority queue as messages arrive and
/// flush the drained batch every 50 ms, frames written back-to-back.
async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut receiver: mpsc::UnboundedReceiver<(Message, Priority)>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut queue = PriorityQueue::new();
    let mut ticker = time::interval(BATCH_INTERVAL);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            queued = receiver.recv() => {
                match queued {
                    Some((message, priority)) => queue.push(message, priority),
                    None => break,
                }
            }
            _ = ticker.tick() => {
                if queue.is_empty() {
                    continue;
                }
                for message in queue.drain() {
                    let frame = match codec::encode_frame(&message) {
                        Ok(frame) => frame,
                        Err(err) => {
                            warn!(%err, "dropping unencodable message");
                            continue;
                        }
                    };
                    if let Err(err) = codec::write_frame(&mut writer, &frame).await {
                        debug!(%err, "peer writer closing");
                        return;
                    }
                }
            }
        }
    }
    // Flush whatever is still queued before closing.
    for message in queue.drain() {
        if let Ok(frame) = codec::encode_frame(&message) {
            let _ = codec::write_frame(&mut writer, &frame).await;
        }
    }
}
