//! Peer registry and non-blocking fan-out.
//!
//! Every connected peer owns a bounded outbound queue drained by its writer
//! task. Messages are encoded once and the same frame (`Arc<Vec<u8>>`) is
//! pushed into every queue with `try_send`, so a slow peer never stalls the
//! sender. A peer whose queue is full or closed is treated as dead: it is
//! removed and everyone left is told with a `Remove`.
//!
//! ```text
//!   sequencer / session task
//!            │  encode once
//!            ▼
//!     PeerRegistry::broadcast ──try_send──► [queue 1] ──► writer 1
//!                               ├─────────► [queue 2] ──► writer 2
//!                               └─────────► [queue 3] ──► writer 3
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU16, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use log::{debug, error, info};
use tokio::sync::{mpsc, Notify, RwLock};

use crate::frame::encode_frame;
use crate::ot::Operation;
use crate::presence::{PeerLocation, PeerTable};
use crate::protocol::{ClientId, Message, PeerInfo, PeerSnapshot, ProtocolError};

/// A pre-encoded frame shared by every recipient.
pub type Frame = Arc<Vec<u8>>;

/// Hands out client ids in increasing order, starting at 1.
#[derive(Debug)]
pub struct IdSequence {
    next: AtomicU16,
}

impl IdSequence {
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    pub fn starting_at(first: u16) -> Self {
        Self {
            next: AtomicU16::new(first),
        }
    }

    /// Next unused id, or `None` once the 4-digit space is exhausted.
    pub fn next_id(&self) -> Option<ClientId> {
        self.next
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                (n <= ClientId::MAX).then_some(n + 1)
            })
            .ok()
            .and_then(ClientId::new)
    }
}

impl Default for IdSequence {
    fn default() -> Self {
        Self::new()
    }
}

/// A connection slot, held from authentication until the session ends.
/// Dropping it frees the slot for the next handshake.
#[derive(Debug)]
pub struct Reservation<'a> {
    slots: &'a AtomicUsize,
    id: ClientId,
}

impl Reservation<'_> {
    pub fn id(&self) -> ClientId {
        self.id
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        self.slots.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Registry side of a connected peer.
#[derive(Debug)]
pub struct PeerHandle {
    pub info: PeerInfo,
    tx: mpsc::Sender<Frame>,
    closed: Arc<Notify>,
}

impl PeerHandle {
    /// `closed` is notified when the peer is dropped, so its reader can stop.
    pub fn new(info: PeerInfo, tx: mpsc::Sender<Frame>, closed: Arc<Notify>) -> Self {
        Self { info, tx, closed }
    }

    pub fn id(&self) -> ClientId {
        self.info.id
    }

    /// True once the peer's writer has gone away.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Queue a frame without waiting. False means the peer is dead.
    fn try_send(&self, frame: Frame) -> bool {
        match self.tx.try_send(frame) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!("peer {}: outbound queue full", self.info.id);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

/// Counters for monitoring fan-out health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub frames_sent: u64,
    pub peers_dropped: u64,
    pub active_peers: usize,
}

/// Lock-free counters; read through [`PeerRegistry::stats`].
#[derive(Debug, Default)]
struct AtomicRegistryStats {
    frames_sent: AtomicU64,
    peers_dropped: AtomicU64,
}

#[derive(Debug, Default)]
struct Peers {
    handles: HashMap<ClientId, PeerHandle>,
    presence: PeerTable,
}

/// All connected peers, their outbound queues and their positions.
#[derive(Debug)]
pub struct PeerRegistry {
    peers: RwLock<Peers>,
    ids: IdSequence,
    max_peers: usize,
    /// Slots taken by sessions, registered or still joining.
    reserved: AtomicUsize,
    /// Document length as of the last accepted operation, for clamping
    /// positions reported outside the sequencer.
    doc_len: AtomicUsize,
    stats: AtomicRegistryStats,
}

impl PeerRegistry {
    pub fn new(max_peers: usize) -> Self {
        Self::with_ids(max_peers, IdSequence::new())
    }

    pub fn with_ids(max_peers: usize, ids: IdSequence) -> Self {
        Self {
            peers: RwLock::new(Peers::default()),
            ids,
            max_peers,
            reserved: AtomicUsize::new(0),
            doc_len: AtomicUsize::new(0),
            stats: AtomicRegistryStats::default(),
        }
    }

    /// Reserve a slot and an id for a newly authenticated connection, or
    /// `None` when every slot is taken or the ids have run out. Sessions
    /// still between handshake and join hold a slot too.
    pub fn reserve(&self) -> Option<Reservation<'_>> {
        self.reserved
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.max_peers).then_some(n + 1)
            })
            .ok()?;
        match self.ids.next_id() {
            Some(id) => Some(Reservation {
                slots: &self.reserved,
                id,
            }),
            None => {
                self.reserved.fetch_sub(1, Ordering::AcqRel);
                None
            }
        }
    }

    /// Slots currently held.
    pub fn reserved(&self) -> usize {
        self.reserved.load(Ordering::Acquire)
    }

    pub fn doc_len(&self) -> usize {
        self.doc_len.load(Ordering::Acquire)
    }

    pub fn set_doc_len(&self, len: usize) {
        self.doc_len.store(len, Ordering::Release);
    }

    pub async fn len(&self) -> usize {
        self.peers.read().await.handles.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn contains(&self, id: ClientId) -> bool {
        self.peers.read().await.handles.contains_key(&id)
    }

    pub async fn ids(&self) -> Vec<ClientId> {
        self.peers.read().await.handles.keys().copied().collect()
    }

    /// Peers ordered by id.
    pub async fn peer_infos(&self) -> Vec<PeerInfo> {
        let peers = self.peers.read().await;
        let mut infos: Vec<PeerInfo> = peers.handles.values().map(|h| h.info.clone()).collect();
        infos.sort_by_key(|info| info.id);
        infos
    }

    pub async fn register(&self, handle: PeerHandle) {
        let mut peers = self.peers.write().await;
        info!("peer {} ({}) joined", handle.info.id, handle.info.name);
        peers.presence.insert(handle.info.clone());
        peers.handles.insert(handle.id(), handle);
    }

    /// Queue a message for one peer. A dead peer is dropped.
    pub async fn send_to(&self, id: ClientId, msg: &Message) -> Result<bool, ProtocolError> {
        let frame: Frame = Arc::new(encode_frame(msg)?);
        let delivered = {
            let peers = self.peers.read().await;
            peers.handles.get(&id).map(|handle| handle.try_send(frame))
        };
        match delivered {
            Some(true) => {
                self.stats.frames_sent.fetch_add(1, Ordering::Relaxed);
                Ok(true)
            }
            Some(false) => {
                self.drop_peer(id).await;
                Ok(false)
            }
            None => Ok(false),
        }
    }

    /// Queue a message for every peer except `except`. Peers that cannot
    /// take it are dropped. Returns how many peers received it.
    pub async fn broadcast(
        &self,
        msg: &Message,
        except: Option<ClientId>,
    ) -> Result<usize, ProtocolError> {
        let frame: Frame = Arc::new(encode_frame(msg)?);
        let mut peers = self.peers.write().await;
        let (delivered, dead) = self.fan_out(&peers, &frame, except);
        if !dead.is_empty() {
            self.drop_locked(&mut peers, dead);
        }
        Ok(delivered)
    }

    fn fan_out(&self, peers: &Peers, frame: &Frame, except: Option<ClientId>) -> (usize, Vec<ClientId>) {
        let mut delivered = 0;
        let mut dead = Vec::new();
        for (id, handle) in &peers.handles {
            if Some(*id) == except {
                continue;
            }
            if handle.try_send(frame.clone()) {
                delivered += 1;
            } else {
                dead.push(*id);
            }
        }
        self.stats
            .frames_sent
            .fetch_add(delivered as u64, Ordering::Relaxed);
        (delivered, dead)
    }

    /// Remove a peer, wake its reader and tell everyone left. Peers that die
    /// while being told are removed the same way. Idempotent; returns every
    /// id actually removed.
    pub async fn drop_peer(&self, id: ClientId) -> Vec<ClientId> {
        let mut peers = self.peers.write().await;
        self.drop_locked(&mut peers, vec![id])
    }

    /// Drop every peer, e.g. on shutdown.
    pub async fn drop_all(&self) -> Vec<ClientId> {
        let mut peers = self.peers.write().await;
        let all = peers.handles.keys().copied().collect();
        self.drop_locked(&mut peers, all)
    }

    fn drop_locked(&self, peers: &mut Peers, mut pending: Vec<ClientId>) -> Vec<ClientId> {
        let mut removed = Vec::new();
        while let Some(id) = pending.pop() {
            let Some(handle) = peers.handles.remove(&id) else {
                continue;
            };
            peers.presence.remove(id);
            handle.closed.notify_one();
            removed.push(id);
            self.stats.peers_dropped.fetch_add(1, Ordering::Relaxed);
            info!("peer {} ({}) left", id, handle.info.name);

            let frame = match encode_frame(&Message::remove(id)) {
                Ok(frame) => Arc::new(frame),
                Err(e) => {
                    error!("failed to encode remove for {id}: {e}");
                    continue;
                }
            };
            let (_, dead) = self.fan_out(peers, &frame, None);
            pending.extend(dead);
        }
        removed
    }

    // ── presence ──────────────────────────────────────────────────

    pub async fn set_mark(&self, id: ClientId, index: usize) -> bool {
        let doc_len = self.doc_len();
        self.peers.write().await.presence.set_mark(id, index, doc_len)
    }

    pub async fn select(&self, id: ClientId, start: usize, end: usize) -> bool {
        let doc_len = self.doc_len();
        self.peers
            .write()
            .await
            .presence
            .select(id, start, end, doc_len)
    }

    /// Record an accepted operation: shift positions and the cached length.
    pub async fn apply_operation(&self, author: ClientId, op: &Operation) {
        let new_len = op.target_len();
        self.peers
            .write()
            .await
            .presence
            .apply_operation(author, op, new_len);
        self.set_doc_len(new_len);
    }

    pub async fn location(&self, id: ClientId) -> Option<PeerLocation> {
        self.peers.read().await.presence.location(id)
    }

    pub async fn presence_snapshot(&self) -> Vec<PeerSnapshot> {
        self.peers.read().await.presence.snapshot()
    }

    pub async fn stats(&self) -> RegistryStats {
        RegistryStats {
            frames_sent: self.stats.frames_sent.load(Ordering::Relaxed),
            peers_dropped: self.stats.peers_dropped.load(Ordering::Relaxed),
            active_peers: self.len().await,
        }
    }
}
