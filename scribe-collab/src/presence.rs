//! Peer presence: who is connected and where their cursor sits.
//!
//! Positions are char offsets into the shared document. They move in two
//! ways: explicitly (`SetMark` / `Select`) or implicitly, when an accepted
//! operation shifts the text under them.
//!
//! ```text
//!   before:  h e l l o w o r l d        peer cursor at 5
//!                ▲                       (edit offset 2)
//!   insert "abcd" at 2
//!   after:   h e a b c d l l o w o r l d  peer cursor at 9
//! ```

use std::collections::BTreeMap;

use crate::ot::Operation;
use crate::protocol::{ClientId, PeerInfo, PeerSnapshot};

/// Cursor and optional selection of one peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PeerLocation {
    pub cursor: usize,
    /// Ordered `(start, end)`, never empty.
    pub selection: Option<(usize, usize)>,
}

#[derive(Debug, Clone)]
struct PeerEntry {
    info: PeerInfo,
    location: PeerLocation,
}

/// Shift a position for an edit at `offset` that changed the length by
/// `delta`. Positions before the edit stay; positions after it move but
/// never land before the edit itself.
fn shift(pos: usize, offset: usize, delta: isize, new_len: usize) -> usize {
    let moved = if pos >= offset {
        (pos as isize + delta).max(offset as isize) as usize
    } else {
        pos
    };
    moved.min(new_len)
}

fn normalize_selection(start: usize, end: usize) -> Option<(usize, usize)> {
    let (start, end) = if start <= end { (start, end) } else { (end, start) };
    (start != end).then_some((start, end))
}

/// Every known peer, ordered by id.
#[derive(Debug, Clone, Default)]
pub struct PeerTable {
    peers: BTreeMap<ClientId, PeerEntry>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, info: PeerInfo) {
        self.peers.insert(
            info.id,
            PeerEntry {
                info,
                location: PeerLocation::default(),
            },
        );
    }

    pub fn remove(&mut self, id: ClientId) -> Option<PeerInfo> {
        self.peers.remove(&id).map(|entry| entry.info)
    }

    pub fn contains(&self, id: ClientId) -> bool {
        self.peers.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn info(&self, id: ClientId) -> Option<&PeerInfo> {
        self.peers.get(&id).map(|entry| &entry.info)
    }

    pub fn ids(&self) -> impl Iterator<Item = ClientId> + '_ {
        self.peers.keys().copied()
    }

    pub fn cursor(&self, id: ClientId) -> Option<usize> {
        self.location(id).map(|loc| loc.cursor)
    }

    pub fn location(&self, id: ClientId) -> Option<PeerLocation> {
        self.peers.get(&id).map(|entry| entry.location)
    }

    /// Move a peer's cursor, clamped to the document. Clears its selection.
    /// Returns false for an unknown peer.
    pub fn set_mark(&mut self, id: ClientId, index: usize, doc_len: usize) -> bool {
        let Some(entry) = self.peers.get_mut(&id) else {
            return false;
        };
        entry.location = PeerLocation {
            cursor: index.min(doc_len),
            selection: None,
        };
        true
    }

    /// Set a peer's selection. Reversed bounds are swapped; the cursor
    /// follows the `end` the peer reported.
    pub fn select(&mut self, id: ClientId, start: usize, end: usize, doc_len: usize) -> bool {
        let Some(entry) = self.peers.get_mut(&id) else {
            return false;
        };
        let (start, end) = (start.min(doc_len), end.min(doc_len));
        entry.location = PeerLocation {
            cursor: end,
            selection: normalize_selection(start, end),
        };
        true
    }

    /// Adjust every position for an operation `author` made. `new_len` is
    /// the document length after the operation.
    pub fn apply_operation(&mut self, author: ClientId, op: &Operation, new_len: usize) {
        let Some(offset) = op.edit_offset() else {
            return;
        };
        let delta = op.delta();

        for (id, entry) in self.peers.iter_mut() {
            let loc = &mut entry.location;
            if *id == author {
                loc.cursor = (offset + delta.max(0) as usize).min(new_len);
                loc.selection = None;
                continue;
            }
            loc.cursor = shift(loc.cursor, offset, delta, new_len);
            loc.selection = loc.selection.and_then(|(start, end)| {
                normalize_selection(
                    shift(start, offset, delta, new_len),
                    shift(end, offset, delta, new_len),
                )
            });
        }
    }

    /// Clamp every position after the document was replaced wholesale.
    pub fn clamp(&mut self, doc_len: usize) {
        for entry in self.peers.values_mut() {
            let loc = &mut entry.location;
            loc.cursor = loc.cursor.min(doc_len);
            loc.selection = loc
                .selection
                .and_then(|(start, end)| normalize_selection(start.min(doc_len), end.min(doc_len)));
        }
    }

    pub fn snapshot(&self) -> Vec<PeerSnapshot> {
        self.peers
            .values()
            .map(|entry| PeerSnapshot {
                id: entry.info.id,
                name: entry.info.name.clone(),
                cursor: entry.location.cursor,
                selection: entry.location.selection,
            })
            .collect()
    }

    /// Replace the table with a server snapshot. Host and port are not part
    /// of a snapshot, so they are kept for peers already known.
    pub fn restore(&mut self, peers: &[PeerSnapshot]) {
        let mut restored = BTreeMap::new();
        for snap in peers {
            let info = match self.peers.remove(&snap.id) {
                Some(entry) => PeerInfo {
                    name: snap.name.clone(),
                    ..entry.info
                },
                None => PeerInfo {
                    id: snap.id,
                    name: snap.name.clone(),
                    host: String::new(),
                    port: 0,
                },
            };
            restored.insert(
                snap.id,
                PeerEntry {
                    info,
                    location: PeerLocation {
                        cursor: snap.cursor,
                        selection: snap.selection,
                    },
                },
            );
        }
        self.peers = restored;
    }
}
