//! # scribe-collab: Real-time collaborative text editing
//!
//! Several peers edit one plain-text document over TCP. A central server
//! imposes a single order on edits; clients keep editing locally and
//! reconcile with that order using operational transformation.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐    length-prefixed   ┌─────────────┐
//! │ SyncClient  │ ◄──────────────────► │ SyncServer  │
//! │ (per user)  │      JSON frames     │ (central)   │
//! └──────┬──────┘                      └──────┬──────┘
//!        │                                    │
//!        ▼                                    ▼
//! ┌─────────────┐                      ┌─────────────┐
//! │ Replica     │                      │ Sequencer   │
//! │ Reconciler  │                      │ (authority) │
//! └─────────────┘                      └──────┬──────┘
//!                                             │
//!                                     ┌───────┴───────┐
//!                                     │ PeerRegistry  │
//!                                     │ (fan-out)     │
//!                                     └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`ot`]: Operation algebra: apply, compose, transform, invert
//! - [`reconcile`]: Client state machine for in-flight and buffered edits
//! - [`sequencer`]: Server-side ordering against the operation log
//! - [`protocol`]: Message types (JSON records)
//! - [`frame`]: 8-digit length-prefix framing
//! - [`auth`]: Password hash and id reply of the handshake
//! - [`presence`]: Peer cursors and selections
//! - [`broadcast`]: Peer registry with non-blocking fan-out
//! - [`server`]: TCP server
//! - [`client`]: TCP client

pub mod auth;
pub mod broadcast;
pub mod client;
pub mod frame;
pub mod ot;
pub mod presence;
pub mod protocol;
pub mod reconcile;
pub mod sequencer;
pub mod server;

// Re-exports for convenience
pub use broadcast::{IdSequence, PeerRegistry, RegistryStats, Reservation};
pub use client::{
    ClientConfig, ClientError, ConnectionState, Evaluation, Replica, SyncClient, SyncEvent,
};
pub use ot::{Component, OtError, Operation};
pub use presence::{PeerLocation, PeerTable};
pub use protocol::{
    ClientId, Message, MessageKind, PeerInfo, PeerSnapshot, ProtocolError, Revision,
};
pub use reconcile::{PendingState, ReconcileError, Reconciler};
pub use sequencer::{Accepted, Sequencer, SequencerError};
pub use server::{ConfigError, ServerConfig, ServerError, ServerStats, SyncServer};
