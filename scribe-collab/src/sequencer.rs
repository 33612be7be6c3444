//! Server-side total ordering of operations.
//!
//! The sequencer owns the canonical document. Each incoming operation names
//! the revision it was made against; it is transformed past every operation
//! the server accepted since then, applied, and logged. The log only needs
//! to reach back as far as the oldest revision a connected client can still
//! base an edit on, so it is compacted on every full resync.

use std::collections::{HashMap, HashSet, VecDeque};

use log::debug;
use thiserror::Error;

use crate::ot::{OtError, Operation};
use crate::protocol::{ClientId, Revision};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SequencerError {
    #[error("incompatible operation: {0}")]
    IncompatibleOperation(#[from] OtError),
    #[error("operation based on revision {base}, server is at {current}")]
    FutureRevision { base: Revision, current: Revision },
    #[error("operation based on revision {base}, history starts at {oldest}")]
    HistoryUnavailable { base: Revision, oldest: Revision },
}

pub type Result<T> = std::result::Result<T, SequencerError>;

#[derive(Debug, Clone)]
struct LogEntry {
    author: ClientId,
    operation: Operation,
}

/// An operation the sequencer accepted, ready to broadcast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Accepted {
    pub author: ClientId,
    /// Transformed against everything sequenced before it.
    pub operation: Operation,
    /// Revision the document reached by applying it.
    pub revision: Revision,
}

#[derive(Debug, Default)]
pub struct Sequencer {
    document: String,
    doc_len: usize,
    revision: Revision,
    /// Operations `log_start..revision`, oldest first.
    log: VecDeque<LogEntry>,
    last_base: HashMap<ClientId, Revision>,
    /// Lowest revision each client may still base an edit on.
    floors: HashMap<ClientId, Revision>,
}

impl Sequencer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing document at revision 0.
    pub fn with_document(document: impl Into<String>) -> Self {
        let document = document.into();
        Self {
            doc_len: document.chars().count(),
            document,
            ..Self::default()
        }
    }

    pub fn document(&self) -> &str {
        &self.document
    }

    /// Document length in chars.
    pub fn document_len(&self) -> usize {
        self.doc_len
    }

    pub fn revision(&self) -> Revision {
        self.revision
    }

    /// Oldest revision an incoming operation may still be based on.
    pub fn log_start(&self) -> Revision {
        self.revision - self.log.len() as Revision
    }

    pub fn log_len(&self) -> usize {
        self.log.len()
    }

    pub fn snapshot(&self) -> (String, Revision) {
        (self.document.clone(), self.revision)
    }

    /// Sequence an operation `client` made against `base`.
    ///
    /// Returns `Ok(None)` for a stale or duplicate submission: a client's
    /// bases strictly increase, so anything at or below the last one seen
    /// was already handled. On error the document and revision are
    /// unchanged.
    pub fn receive(
        &mut self,
        client: ClientId,
        base: Revision,
        operation: Operation,
    ) -> Result<Option<Accepted>> {
        if self.last_base.get(&client).is_some_and(|last| *last >= base) {
            debug!("client {client}: ignoring stale operation based on {base}");
            return Ok(None);
        }
        if base > self.revision {
            return Err(SequencerError::FutureRevision {
                base,
                current: self.revision,
            });
        }
        let oldest = self.log_start();
        if base < oldest {
            return Err(SequencerError::HistoryUnavailable { base, oldest });
        }

        let mut operation = operation;
        for entry in self.log.iter().skip((base - oldest) as usize) {
            let (_, folded) = Operation::transform(&entry.operation, &operation)?;
            operation = folded;
        }

        self.document = operation.apply(&self.document)?;
        self.doc_len = operation.target_len();
        self.log.push_back(LogEntry {
            author: client,
            operation: operation.clone(),
        });
        self.revision += 1;
        self.last_base.insert(client, base);
        // its next edit waits for the ack, so it is based on this revision
        self.floors.insert(client, self.revision);

        Ok(Some(Accepted {
            author: client,
            operation,
            revision: self.revision,
        }))
    }

    /// A client was just handed a snapshot at the current revision.
    pub fn join(&mut self, client: ClientId) {
        self.floors.insert(client, self.revision);
    }

    /// A client reports the revision of the snapshot it adopted. Anything
    /// it had in flight arrived before this report, so its later edits are
    /// based on `revision` or newer.
    pub fn confirm(&mut self, client: ClientId, revision: Revision) {
        let revision = revision.min(self.revision);
        if let Some(floor) = self.floors.get_mut(&client) {
            *floor = (*floor).max(revision);
        }
    }

    /// Drop bookkeeping for a client that left.
    pub fn forget(&mut self, client: ClientId) {
        self.floors.remove(&client);
        self.last_base.remove(&client);
    }

    /// Drop log entries no connected client can still base an edit on.
    ///
    /// A client's floor is raised when it joins, when one of its edits is
    /// accepted and when it confirms a snapshot; the log keeps everything
    /// from the lowest floor over `connected`. Bookkeeping for clients no
    /// longer connected is dropped too.
    pub fn compact<I>(&mut self, connected: I)
    where
        I: IntoIterator<Item = ClientId>,
    {
        let connected: HashSet<ClientId> = connected.into_iter().collect();
        self.floors.retain(|id, _| connected.contains(id));
        self.last_base.retain(|id, _| connected.contains(id));

        let keep_from = connected
            .iter()
            .map(|id| self.floors.get(id).copied().unwrap_or(self.revision))
            .min()
            .unwrap_or(self.revision);

        let oldest = self.log_start();
        let drop = keep_from.saturating_sub(oldest).min(self.log.len() as Revision);
        self.log.drain(..drop as usize);
        if drop > 0 {
            debug!("compacted {drop} log entries, history starts at {}", self.log_start());
        }
    }
}
