//! Client-side reconciliation of local edits with the server's order.
//!
//! A client keeps at most one operation in flight. Edits made while it
//! waits are composed into a single buffer, sent once the in-flight one is
//! acknowledged. Remote operations are transformed past both before being
//! applied locally.
//!
//! ```text
//!                 LocalEdit / Send
//!  Synchronized ───────────────────► AwaitingConfirm(o)
//!       ▲                                 │      ▲
//!       │ Ack                   LocalEdit │      │ Ack / Send(b)
//!       └─────────────────────────────────┘      │
//!                                         ▼      │
//!                                AwaitingWithBuffer(o, b)
//! ```

use thiserror::Error;

use crate::ot::{OtError, Operation};
use crate::protocol::Revision;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ReconcileError {
    #[error("acknowledgement received with no operation in flight")]
    UnexpectedAck,
    #[error(transparent)]
    Ot(#[from] OtError),
}

pub type Result<T> = std::result::Result<T, ReconcileError>;

/// Where the client stands relative to the server.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum PendingState {
    #[default]
    Synchronized,
    AwaitingConfirm {
        outstanding: Operation,
    },
    AwaitingWithBuffer {
        outstanding: Operation,
        buffer: Operation,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    LocalEdit(Operation),
    Remote(Operation),
    Ack,
}

/// What the caller must do after a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    None,
    /// Send this operation to the server.
    Send(Operation),
    /// Apply this (transformed) remote operation to the local document.
    Apply(Operation),
}

impl PendingState {
    /// Compute the next state. `self` is left untouched so a failed
    /// transition keeps the old state.
    pub fn transition(&self, event: Event) -> Result<(PendingState, Effect)> {
        use PendingState::*;

        let next = match (self, event) {
            (Synchronized, Event::LocalEdit(op)) => (
                AwaitingConfirm {
                    outstanding: op.clone(),
                },
                Effect::Send(op),
            ),
            (Synchronized, Event::Remote(op)) => (Synchronized, Effect::Apply(op)),
            (Synchronized, Event::Ack) => return Err(ReconcileError::UnexpectedAck),

            (AwaitingConfirm { outstanding }, Event::LocalEdit(op)) => (
                AwaitingWithBuffer {
                    outstanding: outstanding.clone(),
                    buffer: op,
                },
                Effect::None,
            ),
            (AwaitingConfirm { outstanding }, Event::Remote(op)) => {
                // the server sequenced `op` first, so it goes first
                let (remote, outstanding) = Operation::transform(&op, outstanding)?;
                (AwaitingConfirm { outstanding }, Effect::Apply(remote))
            }
            (AwaitingConfirm { .. }, Event::Ack) => (Synchronized, Effect::None),

            (AwaitingWithBuffer { outstanding, buffer }, Event::LocalEdit(op)) => (
                AwaitingWithBuffer {
                    outstanding: outstanding.clone(),
                    buffer: buffer.clone().compose(op)?,
                },
                Effect::None,
            ),
            (AwaitingWithBuffer { outstanding, buffer }, Event::Remote(op)) => {
                let (remote, outstanding) = Operation::transform(&op, outstanding)?;
                let (remote, buffer) = Operation::transform(&remote, buffer)?;
                (
                    AwaitingWithBuffer {
                        outstanding,
                        buffer,
                    },
                    Effect::Apply(remote),
                )
            }
            (AwaitingWithBuffer { buffer, .. }, Event::Ack) => (
                AwaitingConfirm {
                    outstanding: buffer.clone(),
                },
                Effect::Send(buffer.clone()),
            ),
        };
        Ok(next)
    }

    pub fn outstanding(&self) -> Option<&Operation> {
        match self {
            PendingState::Synchronized => None,
            PendingState::AwaitingConfirm { outstanding }
            | PendingState::AwaitingWithBuffer { outstanding, .. } => Some(outstanding),
        }
    }

    pub fn buffer(&self) -> Option<&Operation> {
        match self {
            PendingState::AwaitingWithBuffer { buffer, .. } => Some(buffer),
            _ => None,
        }
    }

    pub fn is_synchronized(&self) -> bool {
        matches!(self, PendingState::Synchronized)
    }
}

/// [`PendingState`] plus the last revision the client has seen from the
/// server. Every operation handed back for sending is based on that
/// revision.
#[derive(Debug, Clone, Default)]
pub struct Reconciler {
    state: PendingState,
    revision: Revision,
}

impl Reconciler {
    pub fn new(revision: Revision) -> Self {
        Self {
            state: PendingState::Synchronized,
            revision,
        }
    }

    pub fn state(&self) -> &PendingState {
        &self.state
    }

    pub fn revision(&self) -> Revision {
        self.revision
    }

    fn step(&mut self, event: Event) -> Result<Effect> {
        let (next, effect) = self.state.transition(event)?;
        self.state = next;
        Ok(effect)
    }

    /// Record a local edit. Returns the operation to send, if the client
    /// was idle.
    pub fn local_edit(&mut self, op: Operation) -> Result<Option<Operation>> {
        match self.step(Event::LocalEdit(op))? {
            Effect::Send(op) => Ok(Some(op)),
            _ => Ok(None),
        }
    }

    /// Feed an operation another client made, sequenced by the server at
    /// `revision`. Returns the operation to apply locally.
    pub fn remote(&mut self, op: Operation, revision: Revision) -> Result<Operation> {
        let effect = self.step(Event::Remote(op))?;
        self.revision = revision;
        match effect {
            Effect::Apply(op) => Ok(op),
            // remote events always yield Apply
            Effect::None | Effect::Send(_) => Err(ReconcileError::UnexpectedAck),
        }
    }

    /// The server echoed our in-flight operation back at `revision`.
    /// Returns the buffered operation to send next, if any.
    pub fn acknowledge(&mut self, revision: Revision) -> Result<Option<Operation>> {
        let effect = self.step(Event::Ack)?;
        self.revision = revision;
        match effect {
            Effect::Send(op) => Ok(Some(op)),
            _ => Ok(None),
        }
    }

    /// Jump to a server snapshot. Pending edits stay pending.
    pub fn resync(&mut self, revision: Revision) {
        self.revision = revision;
    }

    /// Abandon pending edits, e.g. when they no longer fit a snapshot.
    pub fn reset(&mut self, revision: Revision) {
        self.state = PendingState::Synchronized;
        self.revision = revision;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn insert_at(len: usize, at: usize, text: &str) -> Operation {
        Operation::from_change(len, at, 0, text).unwrap()
    }

    #[test]
    fn test_local_edit_when_synchronized_sends() {
        let mut rec = Reconciler::new(0);
        let op = insert_at(0, 0, "a");
        assert_eq!(rec.local_edit(op.clone()).unwrap(), Some(op.clone()));
        assert_eq!(rec.state().outstanding(), Some(&op));
    }

    #[test]
    fn test_second_edit_is_buffered_and_composed() {
        let mut rec = Reconciler::new(0);
        rec.local_edit(insert_at(0, 0, "a")).unwrap();
        assert_eq!(rec.local_edit(insert_at(1, 1, "b")).unwrap(), None);
        assert_eq!(rec.local_edit(insert_at(2, 2, "c")).unwrap(), None);

        let buffer = rec.state().buffer().unwrap().clone();
        assert_eq!(buffer.apply("a").unwrap(), "abc");
    }

    #[test]
    fn test_ack_sends_buffer() {
        let mut rec = Reconciler::new(0);
        rec.local_edit(insert_at(0, 0, "a")).unwrap();
        let b = insert_at(1, 1, "b");
        rec.local_edit(b.clone()).unwrap();

        assert_eq!(rec.acknowledge(1).unwrap(), Some(b.clone()));
        assert_eq!(rec.revision(), 1);
        assert_eq!(rec.state().outstanding(), Some(&b));

        assert_eq!(rec.acknowledge(2).unwrap(), None);
        assert!(rec.state().is_synchronized());
    }

    #[test]
    fn test_unexpected_ack_keeps_state() {
        let mut rec = Reconciler::new(4);
        assert_eq!(rec.acknowledge(5), Err(ReconcileError::UnexpectedAck));
        assert!(rec.state().is_synchronized());
        assert_eq!(rec.revision(), 4);
    }

    #[test]
    fn test_remote_while_synchronized_applies_verbatim() {
        let mut rec = Reconciler::new(0);
        let op = insert_at(5, 0, "X");
        assert_eq!(rec.remote(op.clone(), 1).unwrap(), op);
        assert_eq!(rec.revision(), 1);
    }

    #[test]
    fn test_remote_transforms_past_outstanding() {
        // local "hello" -> "helloY", server first sequences "Xhello"
        let doc = "hello";
        let mut rec = Reconciler::new(0);
        let local = insert_at(5, 5, "Y");
        rec.local_edit(local.clone()).unwrap();
        let mine = local.apply(doc).unwrap();

        let remote = rec.remote(insert_at(5, 0, "X"), 1).unwrap();
        assert_eq!(remote.apply(&mine).unwrap(), "XhelloY");

        // the outstanding op now targets the server's document
        let outstanding = rec.state().outstanding().unwrap();
        assert_eq!(outstanding.apply("Xhello").unwrap(), "XhelloY");
    }

    #[test]
    fn test_remote_transforms_past_outstanding_and_buffer() {
        let doc = "abc";
        let mut rec = Reconciler::new(0);
        let first = insert_at(3, 3, "1");
        let second = insert_at(4, 4, "2");
        rec.local_edit(first.clone()).unwrap();
        rec.local_edit(second.clone()).unwrap();
        let mine = second.apply(&first.apply(doc).unwrap()).unwrap();
        assert_eq!(mine, "abc12");

        let remote = rec.remote(Operation::from_change(3, 0, 1, "").unwrap(), 1).unwrap();
        assert_eq!(remote.apply(&mine).unwrap(), "bc12");

        let server_doc = "bc";
        let outstanding = rec.state().outstanding().unwrap().clone();
        let buffer = rec.state().buffer().unwrap().clone();
        let after = buffer
            .apply(&outstanding.apply(server_doc).unwrap())
            .unwrap();
        assert_eq!(after, "bc12");
    }

    #[test]
    fn test_failed_transition_leaves_state() {
        let state = PendingState::AwaitingConfirm {
            outstanding: insert_at(3, 0, "x"),
        };
        // remote op built for a different base length
        let result = state.transition(Event::Remote(insert_at(7, 0, "y")));
        assert!(matches!(result, Err(ReconcileError::Ot(_))));
        assert!(state.outstanding().is_some());
    }

    #[test]
    fn test_resync_keeps_pending() {
        let mut rec = Reconciler::new(0);
        rec.local_edit(insert_at(0, 0, "a")).unwrap();
        rec.resync(9);
        assert_eq!(rec.revision(), 9);
        assert!(rec.state().outstanding().is_some());

        rec.reset(10);
        assert!(rec.state().is_synchronized());
        assert_eq!(rec.revision(), 10);
    }
}
