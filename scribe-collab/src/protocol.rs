//! Message types for the collaboration protocol.
//!
//! Every message is a JSON record `{ "src_id": …, "type": …, …fields }`
//! carried in a length-prefixed frame (see [`crate::frame`]):
//!
//! ```text
//! ┌──────────────────────┬──────────────────────────────────────────┐
//! │ length (8 ASCII dig.)│ {"src_id":3,"type":"operation",…}        │
//! └──────────────────────┴──────────────────────────────────────────┘
//! ```
//!
//! Messages are built once, encoded once, and never mutated afterwards; the
//! server shares a single encoded frame between all recipients.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ot::Operation;

/// Number of operations the server has accepted for the document.
pub type Revision = u64;

/// Server-assigned peer id.
///
/// Ids fit in four decimal digits so the handshake reply is a fixed
/// 4-byte field. Id 0 is reserved for the server itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u16", into = "u16")]
pub struct ClientId(u16);

impl ClientId {
    /// Origin of server-generated messages. Also stamped on the password
    /// message, which is sent before the client has an id.
    pub const SERVER: ClientId = ClientId(0);
    pub const MAX: u16 = 9999;

    pub fn new(raw: u16) -> Option<Self> {
        (raw <= Self::MAX).then_some(Self(raw))
    }

    pub fn get(self) -> u16 {
        self.0
    }
}

impl TryFrom<u16> for ClientId {
    type Error = String;

    fn try_from(raw: u16) -> Result<Self, Self::Error> {
        Self::new(raw).ok_or_else(|| format!("client id {raw} exceeds {}", Self::MAX))
    }
}

impl From<ClientId> for u16 {
    fn from(id: ClientId) -> Self {
        id.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}", self.0)
    }
}

/// Peer identity announced in a `Connect` message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub id: ClientId,
    pub name: String,
    pub host: String,
    pub port: u16,
}

/// A peer's state as carried in a full resync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerSnapshot {
    pub id: ClientId,
    pub name: String,
    pub cursor: usize,
    pub selection: Option<(usize, usize)>,
}

/// Type-specific part of a [`Message`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageKind {
    /// A peer joined.
    Connect { name: String, host: String, port: u16 },
    /// An edit. From a client, `revision` is the base it was made against;
    /// from the server, the revision the document reached by applying it.
    Operation { operation: Operation, revision: Revision },
    /// Cursor moved without an edit.
    SetMark { index: usize },
    /// Selection changed.
    Select { start: usize, end: usize },
    /// A peer disconnected.
    Remove,
    /// Full-state resync: document, revision and every peer's location.
    SetAll {
        document: String,
        revision: Revision,
        peers: Vec<PeerSnapshot>,
    },
    /// Ask the server for a private `SetAll`.
    GetAll,
    /// A client adopted the `SetAll` at `revision`; history before it is no
    /// longer needed on its behalf.
    Synced { revision: Revision },
    /// Evaluate the text between two offsets.
    EvaluateBlock { start: usize, end: usize },
    /// Evaluate a literal string.
    EvaluateString { code: String },
    /// Output from the execution backend.
    Console { text: String },
    /// Handshake credential (hex SHA-256 of the shared secret).
    Password { hash: String },
    /// Server-initiated termination.
    Kill { reason: String },
}

impl MessageKind {
    /// Whether the server echoes this message back to its originator.
    ///
    /// Operations come back as the acknowledgement; evaluations come back
    /// so every peer runs them in the same order.
    pub fn echoes_to_origin(&self) -> bool {
        matches!(
            self,
            MessageKind::Operation { .. }
                | MessageKind::EvaluateBlock { .. }
                | MessageKind::EvaluateString { .. }
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            MessageKind::Connect { .. } => "connect",
            MessageKind::Operation { .. } => "operation",
            MessageKind::SetMark { .. } => "set_mark",
            MessageKind::Select { .. } => "select",
            MessageKind::Remove => "remove",
            MessageKind::SetAll { .. } => "set_all",
            MessageKind::GetAll => "get_all",
            MessageKind::Synced { .. } => "synced",
            MessageKind::EvaluateBlock { .. } => "evaluate_block",
            MessageKind::EvaluateString { .. } => "evaluate_string",
            MessageKind::Console { .. } => "console",
            MessageKind::Password { .. } => "password",
            MessageKind::Kill { .. } => "kill",
        }
    }
}

/// Top-level protocol message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub src_id: ClientId,
    #[serde(flatten)]
    pub kind: MessageKind,
}

impl Message {
    pub fn new(src_id: ClientId, kind: MessageKind) -> Self {
        Self { src_id, kind }
    }

    pub fn connect(info: &PeerInfo) -> Self {
        Self::new(
            info.id,
            MessageKind::Connect {
                name: info.name.clone(),
                host: info.host.clone(),
                port: info.port,
            },
        )
    }

    pub fn operation(src_id: ClientId, operation: Operation, revision: Revision) -> Self {
        Self::new(src_id, MessageKind::Operation { operation, revision })
    }

    pub fn set_mark(src_id: ClientId, index: usize) -> Self {
        Self::new(src_id, MessageKind::SetMark { index })
    }

    pub fn select(src_id: ClientId, start: usize, end: usize) -> Self {
        Self::new(src_id, MessageKind::Select { start, end })
    }

    pub fn remove(src_id: ClientId) -> Self {
        Self::new(src_id, MessageKind::Remove)
    }

    pub fn set_all(document: String, revision: Revision, peers: Vec<PeerSnapshot>) -> Self {
        Self::new(
            ClientId::SERVER,
            MessageKind::SetAll {
                document,
                revision,
                peers,
            },
        )
    }

    pub fn get_all(src_id: ClientId) -> Self {
        Self::new(src_id, MessageKind::GetAll)
    }

    pub fn synced(src_id: ClientId, revision: Revision) -> Self {
        Self::new(src_id, MessageKind::Synced { revision })
    }

    pub fn evaluate_block(src_id: ClientId, start: usize, end: usize) -> Self {
        Self::new(src_id, MessageKind::EvaluateBlock { start, end })
    }

    pub fn evaluate_string(src_id: ClientId, code: impl Into<String>) -> Self {
        Self::new(src_id, MessageKind::EvaluateString { code: code.into() })
    }

    pub fn console(src_id: ClientId, text: impl Into<String>) -> Self {
        Self::new(src_id, MessageKind::Console { text: text.into() })
    }

    pub fn password(hash: impl Into<String>) -> Self {
        Self::new(ClientId::SERVER, MessageKind::Password { hash: hash.into() })
    }

    pub fn kill(reason: impl Into<String>) -> Self {
        Self::new(ClientId::SERVER, MessageKind::Kill { reason: reason.into() })
    }

    /// Serialize the record (without the length prefix).
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(self).map_err(ProtocolError::Encode)
    }

    /// Deserialize a record (without the length prefix).
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        serde_json::from_slice(bytes).map_err(ProtocolError::Decode)
    }
}

/// Protocol errors.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("failed to encode message: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("failed to decode message: {0}")]
    Decode(#[source] serde_json::Error),
    #[error("malformed length prefix {0:?}")]
    MalformedPrefix(String),
    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: usize, max: usize },
    #[error("connection closed mid-frame with {0} bytes buffered")]
    Truncated(usize),
    #[error("connection closed")]
    ConnectionClosed,
    #[error("invalid client id reply {0:?}")]
    InvalidIdReply(String),
    #[error("expected {expected} message, got {actual}")]
    UnexpectedMessage {
        expected: &'static str,
        actual: &'static str,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
