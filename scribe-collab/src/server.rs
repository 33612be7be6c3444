//! TCP collaboration server.
//!
//! Architecture:
//! ```text
//! Client A ──► session A ──┐  Submit / Join / GetAll   ┌──────────────┐
//!                          ├─────────────────────────► │  sequencer   │
//! Client B ──► session B ──┘     (bounded mpsc)        │  task        │
//!                 │                                    │  (document,  │
//!                 │ SetMark / Select / Evaluate        │   log)       │
//!                 ▼                                    └──────┬───────┘
//!           PeerRegistry::broadcast ◄─────────────────────────┘
//!                 │   one encoded frame, try_send per peer
//!       ┌─────────┼─────────┐
//!       ▼         ▼         ▼
//!   writer A  writer B  writer C
//! ```
//!
//! Each connection authenticates, receives an id, announces itself with a
//! `Connect`, and is then joined by the sequencer task, which is the only
//! place the document changes. Operations are folded, applied and fanned
//! out from there, so every peer sees them in the same order. Presence and
//! evaluation traffic is not sequenced and goes straight to the registry.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, trace, warn};
use serde::Deserialize;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex, Notify};

use crate::auth;
use crate::broadcast::{Frame, PeerHandle, PeerRegistry, Reservation};
use crate::frame::{FrameReader, MAX_FRAME_LEN};
use crate::ot::Operation;
use crate::protocol::{ClientId, Message, MessageKind, PeerInfo, ProtocolError, Revision};
use crate::sequencer::Sequencer;

/// Server configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Shared session secret; clients present its SHA-256
    pub password: String,
    /// Maximum simultaneously connected peers
    pub max_peers: usize,
    /// Outbound frames buffered per peer before it is considered dead
    pub outbound_capacity: usize,
    /// Requests buffered in front of the sequencer task
    pub sequencer_capacity: usize,
    /// Largest frame accepted from a client
    pub max_frame_len: usize,
    /// Time allowed for the password and connect exchange
    pub handshake_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            password: String::new(),
            max_peers: 100,
            outbound_capacity: 256,
            sequencer_capacity: 1024,
            max_frame_len: 16 * 1024 * 1024,
            handshake_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

impl ServerConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_peers == 0 || self.max_peers > ClientId::MAX as usize {
            return Err(ConfigError::Invalid(format!(
                "max_peers must be between 1 and {}",
                ClientId::MAX
            )));
        }
        if self.outbound_capacity == 0 || self.sequencer_capacity == 0 {
            return Err(ConfigError::Invalid("queue capacities must be non-zero".into()));
        }
        if self.max_frame_len == 0 || self.max_frame_len > MAX_FRAME_LEN {
            return Err(ConfigError::Invalid(format!(
                "max_frame_len must be between 1 and {MAX_FRAME_LEN}"
            )));
        }
        Ok(())
    }

    fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    /// A newcomer is sent one `Connect` per peer plus a `SetAll` before its
    /// writer has a chance to drain, so its queue must hold at least that.
    fn peer_queue_capacity(&self) -> usize {
        self.outbound_capacity.max(self.max_peers + 2)
    }
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("handshake timed out")]
    HandshakeTimeout,
    #[error("sequencer task stopped")]
    SequencerStopped,
    #[error("server is already running")]
    AlreadyRunning,
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub rejected_handshakes: u64,
    pub total_messages: u64,
    pub accepted_operations: u64,
    pub rejected_operations: u64,
    pub stale_operations: u64,
    pub revision: Revision,
    /// Operations the sequencer still keeps for transforming late edits.
    pub history_len: u64,
    pub active_peers: usize,
    pub frames_sent: u64,
}

#[derive(Debug, Default)]
struct AtomicServerStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    rejected_handshakes: AtomicU64,
    total_messages: AtomicU64,
    accepted_operations: AtomicU64,
    rejected_operations: AtomicU64,
    stale_operations: AtomicU64,
    revision: AtomicU64,
    history_len: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Work for the sequencer task.
#[derive(Debug)]
enum SequencerRequest {
    Join {
        handle: PeerHandle,
    },
    Submit {
        client: ClientId,
        revision: Revision,
        operation: Operation,
    },
    GetAll {
        client: ClientId,
    },
    /// The client adopted a full snapshot at `revision`.
    Synced {
        client: ClientId,
        revision: Revision,
    },
    Leave {
        client: ClientId,
    },
}

/// State shared by every task of one server.
struct Shared {
    config: ServerConfig,
    password_hash: String,
    registry: PeerRegistry,
    requests: mpsc::Sender<SequencerRequest>,
    stats: AtomicServerStats,
}

/// The collaboration server.
pub struct SyncServer {
    shared: Arc<Shared>,
    /// Taken by the first `run`.
    requests_rx: Mutex<Option<mpsc::Receiver<SequencerRequest>>>,
}

impl SyncServer {
    pub fn new(config: ServerConfig) -> Self {
        let (requests, requests_rx) = mpsc::channel(config.sequencer_capacity.max(1));
        let shared = Shared {
            password_hash: auth::hash_password(&config.password),
            registry: PeerRegistry::new(config.max_peers),
            requests,
            stats: AtomicServerStats::default(),
            config,
        };
        Self {
            shared: Arc::new(shared),
            requests_rx: Mutex::new(Some(requests_rx)),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    pub fn config(&self) -> &ServerConfig {
        &self.shared.config
    }

    pub fn bind_addr(&self) -> &str {
        &self.shared.config.bind_addr
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.shared.config.bind_addr).await?;
        self.run_with_listener(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn run_with_listener(&self, listener: TcpListener) -> Result<(), ServerError> {
        let requests_rx = self
            .requests_rx
            .lock()
            .await
            .take()
            .ok_or(ServerError::AlreadyRunning)?;
        tokio::spawn(run_sequencer(self.shared.clone(), requests_rx));

        info!("Scribe server listening on {}", listener.local_addr()?);
        loop {
            let (stream, addr) = listener.accept().await?;
            debug!("New TCP connection from {addr}");
            let shared = self.shared.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(shared, stream, addr).await {
                    warn!("Connection from {addr} ended: {e}");
                }
            });
        }
    }

    /// Tell every peer the session is over and disconnect them.
    pub async fn shutdown(&self, reason: &str) {
        let registry = &self.shared.registry;
        if let Err(e) = registry.broadcast(&Message::kill(reason), None).await {
            error!("Failed to broadcast kill: {e}");
        }
        let dropped = registry.drop_all().await;
        info!("Shut down, disconnected {} peers", dropped.len());
    }

    pub async fn stats(&self) -> ServerStats {
        let stats = &self.shared.stats;
        let registry = self.shared.registry.stats().await;
        ServerStats {
            total_connections: stats.total_connections.load(Ordering::Relaxed),
            active_connections: stats.active_connections.load(Ordering::Relaxed),
            rejected_handshakes: stats.rejected_handshakes.load(Ordering::Relaxed),
            total_messages: stats.total_messages.load(Ordering::Relaxed),
            accepted_operations: stats.accepted_operations.load(Ordering::Relaxed),
            rejected_operations: stats.rejected_operations.load(Ordering::Relaxed),
            stale_operations: stats.stale_operations.load(Ordering::Relaxed),
            revision: stats.revision.load(Ordering::Relaxed),
            history_len: stats.history_len.load(Ordering::Relaxed),
            active_peers: registry.active_peers,
            frames_sent: registry.frames_sent,
        }
    }

    /// Peers currently registered, ordered by id.
    pub async fn peers(&self) -> Vec<PeerInfo> {
        self.shared.registry.peer_infos().await
    }
}

// ── sequencer task ────────────────────────────────────────────────

async fn run_sequencer(shared: Arc<Shared>, mut requests: mpsc::Receiver<SequencerRequest>) {
    let mut sequencer = Sequencer::new();
    while let Some(request) = requests.recv().await {
        let result = match request {
            SequencerRequest::Join { handle } => join(&shared, &mut sequencer, handle).await,
            SequencerRequest::Submit {
                client,
                revision,
                operation,
            } => submit(&shared, &mut sequencer, client, revision, operation).await,
            SequencerRequest::GetAll { client } => {
                let (document, revision) = sequencer.snapshot();
                let peers = shared.registry.presence_snapshot().await;
                shared
                    .registry
                    .send_to(client, &Message::set_all(document, revision, peers))
                    .await
                    .map(|_| ())
            }
            SequencerRequest::Synced { client, revision } => {
                trace!("Peer {client}: synced at revision {revision}");
                sequencer.confirm(client, revision);
                sequencer.compact(shared.registry.ids().await);
                Ok(())
            }
            SequencerRequest::Leave { client } => {
                sequencer.forget(client);
                sequencer.compact(shared.registry.ids().await);
                Ok(())
            }
        };
        if let Err(e) = result {
            error!("Sequencer failed to deliver a message: {e}");
        }
        shared
            .stats
            .history_len
            .store(sequencer.log_len() as u64, Ordering::Relaxed);
    }
    debug!("Sequencer task stopped");
}

async fn join(
    shared: &Shared,
    sequencer: &mut Sequencer,
    handle: PeerHandle,
) -> Result<(), ProtocolError> {
    let registry = &shared.registry;
    if handle.is_closed() {
        debug!("Peer {} left before joining", handle.id());
        return Ok(());
    }
    let id = handle.id();
    let info = handle.info.clone();

    registry.broadcast(&Message::connect(&info), None).await?;
    let existing = registry.peer_infos().await;
    registry.register(handle).await;
    for peer in &existing {
        registry.send_to(id, &Message::connect(peer)).await?;
    }

    sequencer.join(id);
    let (document, revision) = sequencer.snapshot();
    let peers = registry.presence_snapshot().await;
    registry
        .broadcast(&Message::set_all(document, revision, peers), None)
        .await?;
    sequencer.compact(registry.ids().await);
    Ok(())
}

async fn submit(
    shared: &Shared,
    sequencer: &mut Sequencer,
    client: ClientId,
    revision: Revision,
    operation: Operation,
) -> Result<(), ProtocolError> {
    let registry = &shared.registry;
    if !registry.contains(client).await {
        debug!("Dropping operation from departed peer {client}");
        return Ok(());
    }

    match sequencer.receive(client, revision, operation) {
        Ok(Some(accepted)) => {
            bump(&shared.stats.accepted_operations);
            shared
                .stats
                .revision
                .store(accepted.revision, Ordering::Relaxed);
            debug!(
                "Peer {client}: operation based on {revision} accepted as revision {}",
                accepted.revision
            );
            registry
                .apply_operation(accepted.author, &accepted.operation)
                .await;
            let msg = Message::operation(accepted.author, accepted.operation, accepted.revision);
            registry.broadcast(&msg, None).await?;
        }
        Ok(None) => {
            bump(&shared.stats.stale_operations);
            warn!("Peer {client}: stale operation based on {revision} ignored");
        }
        Err(e) => {
            bump(&shared.stats.rejected_operations);
            error!("Peer {client}: {e}");
            registry.send_to(client, &Message::kill(e.to_string())).await?;
            registry.drop_peer(client).await;
        }
    }
    Ok(())
}

// ── connections ───────────────────────────────────────────────────

async fn handle_connection(
    shared: Arc<Shared>,
    stream: TcpStream,
    addr: SocketAddr,
) -> Result<(), ServerError> {
    bump(&shared.stats.total_connections);
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = FrameReader::new(read_half, shared.config.max_frame_len);

    let Some((info, slot)) = handshake(&shared, &mut reader, &mut write_half, addr).await? else {
        bump(&shared.stats.rejected_handshakes);
        // best effort: the peer may already be gone
        let _ = write_half.shutdown().await;
        return Ok(());
    };
    let id = info.id;

    let (tx, rx) = mpsc::channel(shared.config.peer_queue_capacity());
    let closed = Arc::new(Notify::new());
    tokio::spawn(write_loop(write_half, rx, closed.clone(), id));

    shared
        .requests
        .send(SequencerRequest::Join {
            handle: PeerHandle::new(info, tx, closed.clone()),
        })
        .await
        .map_err(|_| ServerError::SequencerStopped)?;

    shared.stats.active_connections.fetch_add(1, Ordering::Relaxed);
    let result = read_loop(&shared, id, &mut reader, &closed).await;
    shared.stats.active_connections.fetch_sub(1, Ordering::Relaxed);
    shared.registry.drop_peer(id).await;
    if shared
        .requests
        .send(SequencerRequest::Leave { client: id })
        .await
        .is_err()
    {
        debug!("Peer {id}: sequencer already stopped");
    }
    drop(slot);
    result
}

/// Password, id reply, connect. `Ok(None)` means the client was refused
/// and has been told so. The returned slot must outlive the session.
async fn handshake<'a>(
    shared: &'a Shared,
    reader: &mut FrameReader<OwnedReadHalf>,
    writer: &mut OwnedWriteHalf,
    addr: SocketAddr,
) -> Result<Option<(PeerInfo, Reservation<'a>)>, ServerError> {
    let timeout = shared.config.handshake_timeout();

    let msg = tokio::time::timeout(timeout, reader.expect_message())
        .await
        .map_err(|_| ServerError::HandshakeTimeout)??;
    let actual = msg.kind.name();
    let MessageKind::Password { hash } = msg.kind else {
        writer.write_all(&auth::encode_id_reply(None)).await?;
        return Err(ProtocolError::UnexpectedMessage {
            expected: "password",
            actual,
        }
        .into());
    };
    if !auth::verify(&shared.password_hash, &hash) {
        warn!("Rejected {addr}: wrong password");
        writer.write_all(&auth::encode_id_reply(None)).await?;
        return Ok(None);
    }
    let Some(slot) = shared.registry.reserve() else {
        warn!("Rejected {addr}: server full or out of client ids");
        writer.write_all(&auth::encode_id_reply(None)).await?;
        return Ok(None);
    };
    let id = slot.id();
    writer.write_all(&auth::encode_id_reply(Some(id))).await?;

    let msg = tokio::time::timeout(timeout, reader.expect_message())
        .await
        .map_err(|_| ServerError::HandshakeTimeout)??;
    let actual = msg.kind.name();
    let MessageKind::Connect { name, host, port } = msg.kind else {
        return Err(ProtocolError::UnexpectedMessage {
            expected: "connect",
            actual,
        }
        .into());
    };
    let info = PeerInfo {
        id,
        name,
        host: if host.is_empty() {
            addr.ip().to_string()
        } else {
            host
        },
        port: if port == 0 { addr.port() } else { port },
    };
    Ok(Some((info, slot)))
}

async fn read_loop(
    shared: &Shared,
    id: ClientId,
    reader: &mut FrameReader<OwnedReadHalf>,
    closed: &Notify,
) -> Result<(), ServerError> {
    let registry = &shared.registry;
    loop {
        let msg = tokio::select! {
            msg = reader.next_message() => msg?,
            _ = closed.notified() => {
                debug!("Peer {id}: session closed by server");
                return Ok(());
            }
        };
        let Some(msg) = msg else {
            debug!("Peer {id}: connection closed");
            return Ok(());
        };
        bump(&shared.stats.total_messages);
        if msg.src_id != id {
            trace!("Peer {id}: overriding claimed src_id {}", msg.src_id);
        }

        match msg.kind {
            MessageKind::Operation {
                operation,
                revision,
            } => {
                shared
                    .requests
                    .send(SequencerRequest::Submit {
                        client: id,
                        revision,
                        operation,
                    })
                    .await
                    .map_err(|_| ServerError::SequencerStopped)?;
            }
            MessageKind::SetMark { index } => {
                trace!("Peer {id}: mark at {index}");
                if registry.set_mark(id, index).await {
                    registry
                        .broadcast(&Message::set_mark(id, index), Some(id))
                        .await?;
                }
            }
            MessageKind::Select { start, end } => {
                trace!("Peer {id}: selection {start}..{end}");
                if registry.select(id, start, end).await {
                    registry
                        .broadcast(&Message::select(id, start, end), Some(id))
                        .await?;
                }
            }
            kind @ (MessageKind::EvaluateBlock { .. }
            | MessageKind::EvaluateString { .. }
            | MessageKind::Console { .. }) => {
                let except = (!kind.echoes_to_origin()).then_some(id);
                registry.broadcast(&Message::new(id, kind), except).await?;
            }
            MessageKind::Synced { revision } => {
                shared
                    .requests
                    .send(SequencerRequest::Synced {
                        client: id,
                        revision,
                    })
                    .await
                    .map_err(|_| ServerError::SequencerStopped)?;
            }
            MessageKind::GetAll => {
                shared
                    .requests
                    .send(SequencerRequest::GetAll { client: id })
                    .await
                    .map_err(|_| ServerError::SequencerStopped)?;
            }
            MessageKind::Remove => {
                debug!("Peer {id}: said goodbye");
                return Ok(());
            }
            kind @ (MessageKind::Connect { .. }
            | MessageKind::SetAll { .. }
            | MessageKind::Password { .. }
            | MessageKind::Kill { .. }) => {
                warn!("Peer {id}: ignoring unexpected {} message", kind.name());
            }
        }
    }
}

/// Drain a peer's queue to its socket. Ends when the registry drops the
/// peer (queue closed and drained) or the socket fails.
async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut frames: mpsc::Receiver<Frame>,
    closed: Arc<Notify>,
    id: ClientId,
) {
    while let Some(frame) = frames.recv().await {
        if let Err(e) = writer.write_all(&frame).await {
            debug!("Peer {id}: write failed: {e}");
            closed.notify_one();
            return;
        }
    }
    let _ = writer.shutdown().await;
}
