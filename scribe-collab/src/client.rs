//! Collaboration client.
//!
//! Provides:
//! - Handshake (password, id, connect) and the initial snapshot
//! - Local edits reconciled against the server's order
//! - Cursor and selection updates, best effort
//! - Evaluation and console relay
//!
//! [`Replica`] is the synchronous core and can be driven without a socket;
//! [`SyncClient`] wraps it with a reader task, a writer task and an event
//! channel.

use std::sync::Arc;

use log::{debug, error, info, warn};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::auth::{self, ID_REPLY_LEN};
use crate::frame::{encode_frame, write_message, FrameReader};
use crate::ot::{OtError, Operation};
use crate::presence::{PeerLocation, PeerTable};
use crate::protocol::{ClientId, Message, MessageKind, PeerInfo, ProtocolError, Revision};
use crate::reconcile::{PendingState, ReconcileError, Reconciler};

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server address, `host:port`
    pub server_addr: String,
    /// Display name announced to other peers
    pub name: String,
    /// Shared session secret
    pub password: String,
    /// Frames buffered per outbound queue
    pub outbound_capacity: usize,
    /// Events buffered for the application
    pub event_capacity: usize,
    /// Largest frame accepted from the server
    pub max_frame_len: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_addr: "127.0.0.1:9090".to_string(),
            name: "anonymous".to_string(),
            password: String::new(),
            outbound_capacity: 256,
            event_capacity: 1024,
            max_frame_len: 16 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Reconcile(#[from] ReconcileError),
    #[error(transparent)]
    Ot(#[from] OtError),
    #[error("server rejected the password")]
    Rejected,
    #[error("not connected")]
    NotConnected,
}

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Disconnected,
}

/// A request to run code, as relayed by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Evaluation {
    /// A range of the shared document, with its text in the local replica.
    Block {
        start: usize,
        end: usize,
        text: String,
    },
    String {
        code: String,
    },
}

/// Events emitted by the sync client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// Handshake done and first snapshot applied
    Connected { id: ClientId, revision: Revision },
    PeerJoined(PeerInfo),
    PeerLeft(ClientId),
    /// Another peer's edit, already applied to the replica
    RemoteOperation {
        author: ClientId,
        operation: Operation,
        revision: Revision,
    },
    /// The server sequenced our in-flight edit
    Acknowledged { revision: Revision },
    PeerMoved {
        id: ClientId,
        location: PeerLocation,
    },
    /// The replica was replaced by a server snapshot
    DocumentReset { revision: Revision },
    Evaluate {
        author: ClientId,
        evaluation: Evaluation,
    },
    Console { author: ClientId, text: String },
    /// The server ended the session
    Killed(String),
    Disconnected,
}

/// Result of feeding one server message to a [`Replica`].
#[derive(Debug, Default)]
pub struct Handled {
    pub events: Vec<SyncEvent>,
    /// Message to send back, e.g. the buffered edit after an ack.
    pub reply: Option<Message>,
}

impl Handled {
    fn event(event: SyncEvent) -> Self {
        Self {
            events: vec![event],
            reply: None,
        }
    }
}

/// Chars `start..end` of `doc`, clamped and order-insensitive.
fn char_range(doc: &str, start: usize, end: usize) -> String {
    let (start, end) = if start <= end { (start, end) } else { (end, start) };
    doc.chars().skip(start).take(end - start).collect()
}

/// Local copy of the shared document and everything needed to keep it in
/// step with the server.
#[derive(Debug, Clone)]
pub struct Replica {
    id: ClientId,
    document: String,
    doc_len: usize,
    reconciler: Reconciler,
    peers: PeerTable,
}

impl Replica {
    pub fn new(id: ClientId) -> Self {
        Self {
            id,
            document: String::new(),
            doc_len: 0,
            reconciler: Reconciler::new(0),
            peers: PeerTable::new(),
        }
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn document(&self) -> &str {
        &self.document
    }

    /// Document length in chars.
    pub fn document_len(&self) -> usize {
        self.doc_len
    }

    pub fn revision(&self) -> Revision {
        self.reconciler.revision()
    }

    pub fn pending(&self) -> &PendingState {
        self.reconciler.state()
    }

    pub fn peers(&self) -> &PeerTable {
        &self.peers
    }

    fn set_document(&mut self, document: String) {
        self.doc_len = document.chars().count();
        self.document = document;
    }

    /// Apply an edit made locally. Returns the message to send, if the
    /// edit can go out now rather than wait behind one in flight.
    pub fn apply_local_edit(&mut self, op: Operation) -> Result<Option<Message>, ClientError> {
        let next = op.apply(&self.document)?;
        let send = self.reconciler.local_edit(op.clone())?;
        self.set_document(next);
        self.peers.apply_operation(self.id, &op, self.doc_len);
        Ok(send.map(|op| Message::operation(self.id, op, self.revision())))
    }

    /// Move our own cursor, returning the message announcing it.
    pub fn set_mark(&mut self, index: usize) -> Message {
        let index = index.min(self.doc_len);
        self.peers.set_mark(self.id, index, self.doc_len);
        Message::set_mark(self.id, index)
    }

    pub fn select(&mut self, start: usize, end: usize) -> Message {
        let (start, end) = (start.min(self.doc_len), end.min(self.doc_len));
        self.peers.select(self.id, start, end, self.doc_len);
        Message::select(self.id, start, end)
    }

    /// Feed one message from the server.
    pub fn handle(&mut self, msg: Message) -> Result<Handled, ClientError> {
        let src = msg.src_id;
        let handled = match msg.kind {
            MessageKind::Operation {
                operation: _,
                revision,
            } if src == self.id => {
                let reply = self
                    .reconciler
                    .acknowledge(revision)?
                    .map(|op| Message::operation(self.id, op, revision));
                Handled {
                    events: vec![SyncEvent::Acknowledged { revision }],
                    reply,
                }
            }
            MessageKind::Operation {
                operation,
                revision,
            } => {
                let op = self.reconciler.remote(operation, revision)?;
                let next = op.apply(&self.document)?;
                self.set_document(next);
                self.peers.apply_operation(src, &op, self.doc_len);
                Handled::event(SyncEvent::RemoteOperation {
                    author: src,
                    operation: op,
                    revision,
                })
            }
            MessageKind::Connect { name, host, port } => {
                let info = PeerInfo {
                    id: src,
                    name,
                    host,
                    port,
                };
                self.peers.insert(info.clone());
                Handled::event(SyncEvent::PeerJoined(info))
            }
            MessageKind::Remove => {
                self.peers.remove(src);
                Handled::event(SyncEvent::PeerLeft(src))
            }
            MessageKind::SetMark { index } => {
                self.peers.set_mark(src, index, self.doc_len);
                self.moved(src)
            }
            MessageKind::Select { start, end } => {
                self.peers.select(src, start, end, self.doc_len);
                self.moved(src)
            }
            MessageKind::SetAll {
                document,
                revision,
                peers,
            } => {
                self.resync(document, revision);
                self.peers.restore(&peers);
                self.peers.clamp(self.doc_len);
                // lets the server release history older than the snapshot
                Handled {
                    events: vec![SyncEvent::DocumentReset { revision }],
                    reply: Some(Message::synced(self.id, revision)),
                }
            }
            MessageKind::EvaluateBlock { start, end } => {
                let text = char_range(&self.document, start, end);
                Handled::event(SyncEvent::Evaluate {
                    author: src,
                    evaluation: Evaluation::Block { start, end, text },
                })
            }
            MessageKind::EvaluateString { code } => Handled::event(SyncEvent::Evaluate {
                author: src,
                evaluation: Evaluation::String { code },
            }),
            MessageKind::Console { text } => {
                Handled::event(SyncEvent::Console { author: src, text })
            }
            MessageKind::Kill { reason } => Handled::event(SyncEvent::Killed(reason)),
            kind @ (MessageKind::GetAll
            | MessageKind::Password { .. }
            | MessageKind::Synced { .. }) => {
                warn!("ignoring unexpected {} message from the server", kind.name());
                Handled::default()
            }
        };
        Ok(handled)
    }

    fn moved(&self, id: ClientId) -> Handled {
        match self.peers.location(id) {
            Some(location) => Handled::event(SyncEvent::PeerMoved { id, location }),
            None => Handled::default(),
        }
    }

    /// Take a snapshot, replaying pending edits on top. Everything the
    /// snapshot contains was sequenced before them, so they still apply;
    /// if they don't, they are dropped.
    fn resync(&mut self, document: String, revision: Revision) {
        let state = self.reconciler.state();
        let replayed = state
            .outstanding()
            .into_iter()
            .chain(state.buffer())
            .try_fold(document.clone(), |doc, op| op.apply(&doc));
        match replayed {
            Ok(doc) => {
                self.set_document(doc);
                self.reconciler.resync(revision);
            }
            Err(e) => {
                warn!("pending edits do not fit snapshot at revision {revision}, dropping them: {e}");
                self.set_document(document);
                self.reconciler.reset(revision);
            }
        }
    }
}

type Outbound = mpsc::Sender<Vec<u8>>;

fn emit(events: &mpsc::Sender<SyncEvent>, event: SyncEvent) {
    if let Err(mpsc::error::TrySendError::Full(event)) = events.try_send(event) {
        warn!("event queue full, dropping {event:?}");
    }
}

/// The sync client.
///
/// Manages a TCP connection to the collaboration server. Operations and
/// evaluation requests go through a reliable queue; cursor updates go
/// through a lossy one and are dropped when it is full.
pub struct SyncClient {
    info: PeerInfo,
    replica: Arc<Mutex<Replica>>,
    state: Arc<RwLock<ConnectionState>>,
    reliable: Outbound,
    lossy: Outbound,
    event_rx: Option<mpsc::Receiver<SyncEvent>>,
    reader_task: JoinHandle<()>,
}

impl SyncClient {
    /// Connect, authenticate and wait for the first snapshot.
    ///
    /// Spawns background tasks for reading and writing frames.
    pub async fn connect(config: ClientConfig) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(&config.server_addr).await?;
        let local = stream.local_addr()?;
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = FrameReader::new(read_half, config.max_frame_len);

        let hash = auth::hash_password(&config.password);
        write_message(&mut write_half, &Message::password(hash)).await?;
        let mut reply = [0u8; ID_REPLY_LEN];
        reader.get_mut().read_exact(&mut reply).await?;
        let id = auth::decode_id_reply(&reply)?.ok_or(ClientError::Rejected)?;

        let info = PeerInfo {
            id,
            name: config.name.clone(),
            host: local.ip().to_string(),
            port: local.port(),
        };
        write_message(&mut write_half, &Message::connect(&info)).await?;

        // existing peers are announced first, then the snapshot
        let mut replica = Replica::new(id);
        let mut early = Vec::new();
        loop {
            let msg = reader.expect_message().await?;
            let snapshot = matches!(msg.kind, MessageKind::SetAll { .. });
            early.extend(replica.handle(msg)?.events);
            if snapshot {
                break;
            }
        }
        info!("Connected to {} as {id} at revision {}", config.server_addr, replica.revision());

        let capacity = config.outbound_capacity.max(1);
        let (reliable, reliable_rx) = mpsc::channel(capacity);
        let (lossy, lossy_rx) = mpsc::channel(capacity);
        let (event_tx, event_rx) = mpsc::channel(config.event_capacity.max(1));

        emit(
            &event_tx,
            SyncEvent::Connected {
                id,
                revision: replica.revision(),
            },
        );
        for event in early {
            emit(&event_tx, event);
        }

        let replica = Arc::new(Mutex::new(replica));
        let state = Arc::new(RwLock::new(ConnectionState::Connected));
        tokio::spawn(write_loop(write_half, reliable_rx, lossy_rx));
        let reader_task = tokio::spawn(read_loop(
            reader,
            replica.clone(),
            state.clone(),
            reliable.clone(),
            event_tx,
        ));

        Ok(Self {
            info,
            replica,
            state,
            reliable,
            lossy,
            event_rx: Some(event_rx),
            reader_task,
        })
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    pub fn id(&self) -> ClientId {
        self.info.id
    }

    pub fn peer_info(&self) -> &PeerInfo {
        &self.info
    }

    async fn send_reliable(&self, msg: &Message) -> Result<(), ClientError> {
        let frame = encode_frame(msg)?;
        self.reliable
            .send(frame)
            .await
            .map_err(|_| ClientError::NotConnected)
    }

    fn send_lossy(&self, msg: &Message) -> Result<(), ClientError> {
        let frame = encode_frame(msg)?;
        match self.lossy.try_send(frame) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("outbound queue full, dropping {} update", msg.kind.name());
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(ClientError::NotConnected),
        }
    }

    async fn ensure_connected(&self) -> Result<(), ClientError> {
        match *self.state.read().await {
            ConnectionState::Connected => Ok(()),
            ConnectionState::Disconnected => Err(ClientError::NotConnected),
        }
    }

    /// Apply a local edit to the replica and send it when possible.
    pub async fn apply_local_edit(&self, op: Operation) -> Result<(), ClientError> {
        self.ensure_connected().await?;
        let outgoing = self.replica.lock().await.apply_local_edit(op)?;
        if let Some(msg) = outgoing {
            self.send_reliable(&msg).await?;
        }
        Ok(())
    }

    /// Replace `deleted` chars at `offset` with `text`.
    pub async fn replace(&self, offset: usize, deleted: usize, text: &str) -> Result<(), ClientError> {
        self.ensure_connected().await?;
        let outgoing = {
            let mut replica = self.replica.lock().await;
            let op = Operation::from_change(replica.document_len(), offset, deleted, text)?;
            replica.apply_local_edit(op)?
        };
        if let Some(msg) = outgoing {
            self.send_reliable(&msg).await?;
        }
        Ok(())
    }

    pub async fn set_mark(&self, index: usize) -> Result<(), ClientError> {
        self.ensure_connected().await?;
        let msg = self.replica.lock().await.set_mark(index);
        self.send_lossy(&msg)
    }

    pub async fn select(&self, start: usize, end: usize) -> Result<(), ClientError> {
        self.ensure_connected().await?;
        let msg = self.replica.lock().await.select(start, end);
        self.send_lossy(&msg)
    }

    /// Ask every peer, this one included, to evaluate a document range.
    pub async fn evaluate_block(&self, start: usize, end: usize) -> Result<(), ClientError> {
        self.send_reliable(&Message::evaluate_block(self.id(), start, end))
            .await
    }

    pub async fn evaluate_string(&self, code: &str) -> Result<(), ClientError> {
        self.send_reliable(&Message::evaluate_string(self.id(), code))
            .await
    }

    /// Relay output from the execution backend to the other peers.
    pub async fn console(&self, text: &str) -> Result<(), ClientError> {
        self.send_reliable(&Message::console(self.id(), text)).await
    }

    /// Ask the server for a fresh snapshot.
    pub async fn request_resync(&self) -> Result<(), ClientError> {
        self.send_reliable(&Message::get_all(self.id())).await
    }

    pub async fn document(&self) -> String {
        self.replica.lock().await.document().to_string()
    }

    pub async fn revision(&self) -> Revision {
        self.replica.lock().await.revision()
    }

    /// True when no local edit is waiting for the server.
    pub async fn is_synchronized(&self) -> bool {
        self.replica.lock().await.pending().is_synchronized()
    }

    pub async fn peer_position(&self, id: ClientId) -> Option<usize> {
        self.replica.lock().await.peers().cursor(id)
    }

    pub async fn peer_location(&self, id: ClientId) -> Option<PeerLocation> {
        self.replica.lock().await.peers().location(id)
    }

    /// Known peers, this one included, ordered by id.
    pub async fn peers(&self) -> Vec<PeerInfo> {
        let replica = self.replica.lock().await;
        let peers = replica.peers();
        peers.ids().filter_map(|id| peers.info(id).cloned()).collect()
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Say goodbye and close the connection. Frames already queued are
    /// still written.
    pub async fn disconnect(self) -> Result<(), ClientError> {
        if self.connection_state().await == ConnectionState::Connected {
            self.send_reliable(&Message::remove(self.id())).await?;
        }
        Ok(())
    }
}

impl Drop for SyncClient {
    fn drop(&mut self) {
        // the reader holds a reliable sender; stopping it lets the writer
        // drain and close
        self.reader_task.abort();
    }
}

async fn read_loop(
    mut reader: FrameReader<OwnedReadHalf>,
    replica: Arc<Mutex<Replica>>,
    state: Arc<RwLock<ConnectionState>>,
    reliable: Outbound,
    events: mpsc::Sender<SyncEvent>,
) {
    loop {
        let msg = match reader.next_message().await {
            Ok(Some(msg)) => msg,
            Ok(None) => {
                info!("Server closed the connection");
                break;
            }
            Err(e) => {
                warn!("Connection lost: {e}");
                break;
            }
        };

        let handled = replica.lock().await.handle(msg);
        let Handled {
            events: emitted,
            reply,
        } = match handled {
            Ok(handled) => handled,
            Err(e) => {
                error!("Replica diverged from the server: {e}");
                break;
            }
        };

        if let Some(reply) = reply {
            queue_reply(&reliable, &reply);
        }
        for event in emitted {
            emit(&events, event);
        }
    }

    *state.write().await = ConnectionState::Disconnected;
    emit(&events, SyncEvent::Disconnected);
}

/// Queue a reply from the reader without blocking it.
fn queue_reply(reliable: &Outbound, reply: &Message) {
    let frame = match encode_frame(reply) {
        Ok(frame) => frame,
        Err(e) => {
            error!("Failed to encode {}: {e}", reply.kind.name());
            return;
        }
    };
    match reliable.try_send(frame) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(frame)) => {
            let reliable = reliable.clone();
            tokio::spawn(async move {
                let _ = reliable.send(frame).await;
            });
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            debug!("Writer gone, dropping {}", reply.kind.name());
        }
    }
}

/// Drain both outbound queues to the socket, reliable traffic first.
async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut reliable: mpsc::Receiver<Vec<u8>>,
    mut lossy: mpsc::Receiver<Vec<u8>>,
) {
    loop {
        let frame = tokio::select! {
            biased;
            Some(frame) = reliable.recv() => frame,
            Some(frame) = lossy.recv() => frame,
            else => break,
        };
        if let Err(e) = writer.write_all(&frame).await {
            debug!("Write failed: {e}");
            return;
        }
    }
    let _ = writer.shutdown().await;
}
