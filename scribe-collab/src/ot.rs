//! Operational transformation over plain text.
//!
//! An [`Operation`] is a sequence of [`Component`]s walked left to right
//! against a document:
//!
//! - **Retain(n)** keeps `n` characters
//! - **Insert(s)** inserts `s` at the current position
//! - **Delete(n)** removes `n` characters
//!
//! Lengths are counted in `char`s. Every operation knows the document length
//! it expects (`base_len`) and the length it produces (`target_len`), and
//! refuses to touch a document of any other length.
//!
//! ```text
//!            a                       b'
//!   doc ──────────► doc·a ──────────────────► doc·a·b'
//!    │                                            ║
//!    │       b                       a'           ║
//!    └────────────► doc·b ──────────────────► doc·b·a'
//! ```
//!
//! [`Operation::transform`] takes two operations issued against the same
//! document and returns `(a', b')` so that both paths above end at the same
//! text. When both sides insert at the same offset, the insert of the first
//! argument is placed first; callers pass the operation that was sequenced
//! earlier as the first argument.
//!
//! Reference: Ellis & Gibbs, "Concurrency Control in Groupware Systems" (1989)

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, OtError>;

/// Errors raised by the operation algebra.
///
/// All of them mean an operation was paired with a document (or another
/// operation) it was not built for.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum OtError {
    #[error("operation expects a document of {expected} chars, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },
    #[error("cannot compose: first operation produces {left_target} chars, second expects {right_base}")]
    ComposeMismatch {
        left_target: usize,
        right_base: usize,
    },
    #[error("cannot transform operations over different base lengths ({left} vs {right})")]
    TransformMismatch { left: usize, right: usize },
    #[error("change at {offset} removing {deleted} chars is out of bounds for length {len}")]
    ChangeOutOfBounds {
        offset: usize,
        deleted: usize,
        len: usize,
    },
    #[error("operation lengths overflow")]
    LengthOverflow,
}

/// One step of an [`Operation`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Component {
    /// Keep n characters.
    Retain(usize),
    /// Insert text at the current position.
    Insert(String),
    /// Remove n characters.
    Delete(usize),
}

impl Component {
    /// Length in chars: consumed for retain/delete, produced for insert.
    pub fn len_chars(&self) -> usize {
        match self {
            Component::Retain(n) | Component::Delete(n) => *n,
            Component::Insert(s) => s.chars().count(),
        }
    }
}

/// An edit to a text document.
///
/// Built with the chaining helpers and normalised as it is built: adjacent
/// components of the same kind merge, zero-length components vanish, and an
/// insert next to a delete always comes first.
///
/// ```ignore
/// let op = Operation::new().retain(2).insert("XY").delete(1).retain(2);
/// assert_eq!(op.apply("hello")?, "heXYlo");
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Component>", into = "Vec<Component>")]
pub struct Operation {
    components: Vec<Component>,
    /// Document length this operation applies to.
    base_len: usize,
    /// Document length after applying.
    target_len: usize,
}

/// Decoded components come off the wire; their lengths are summed with
/// overflow checks before anything is built.
impl TryFrom<Vec<Component>> for Operation {
    type Error = OtError;

    fn try_from(components: Vec<Component>) -> Result<Self> {
        let (mut base, mut target) = (0usize, 0usize);
        for component in &components {
            let n = component.len_chars();
            let (b, t) = match component {
                Component::Retain(_) => (n, n),
                Component::Delete(_) => (n, 0),
                Component::Insert(_) => (0, n),
            };
            base = base.checked_add(b).ok_or(OtError::LengthOverflow)?;
            target = target.checked_add(t).ok_or(OtError::LengthOverflow)?;
        }

        let mut op = Operation::with_capacity(components.len());
        for component in components {
            op.push(component);
        }
        Ok(op)
    }
}

impl From<Operation> for Vec<Component> {
    fn from(op: Operation) -> Self {
        op.components
    }
}

impl Operation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            components: Vec::with_capacity(capacity),
            base_len: 0,
            target_len: 0,
        }
    }

    /// The identity operation for a document of `len` chars.
    pub fn identity(len: usize) -> Self {
        Self::new().retain(len)
    }

    /// Replace `deleted` chars at `offset` with `inserted`, in a document of
    /// `doc_len` chars.
    pub fn from_change(doc_len: usize, offset: usize, deleted: usize, inserted: &str) -> Result<Self> {
        let end = offset.checked_add(deleted).filter(|end| *end <= doc_len);
        let Some(end) = end else {
            return Err(OtError::ChangeOutOfBounds {
                offset,
                deleted,
                len: doc_len,
            });
        };
        Ok(Self::new()
            .retain(offset)
            .insert(inserted)
            .delete(deleted)
            .retain(doc_len - end))
    }

    pub fn retain(mut self, n: usize) -> Self {
        self.push_retain(n);
        self
    }

    pub fn insert(mut self, text: &str) -> Self {
        self.push_insert(text);
        self
    }

    pub fn delete(mut self, n: usize) -> Self {
        self.push_delete(n);
        self
    }

    pub fn components(&self) -> &[Component] {
        &self.components
    }

    pub fn base_len(&self) -> usize {
        self.base_len
    }

    pub fn target_len(&self) -> usize {
        self.target_len
    }

    /// True when applying this operation leaves any document unchanged.
    pub fn is_noop(&self) -> bool {
        self.components
            .iter()
            .all(|c| matches!(c, Component::Retain(_)))
    }

    /// Net change in document length: inserted chars minus deleted chars.
    pub fn delta(&self) -> isize {
        self.target_len as isize - self.base_len as isize
    }

    /// Offset of the first insert or delete, or `None` for a no-op.
    pub fn edit_offset(&self) -> Option<usize> {
        let mut pos = 0;
        for component in &self.components {
            match component {
                Component::Retain(n) => pos += n,
                Component::Insert(_) | Component::Delete(_) => return Some(pos),
            }
        }
        None
    }

    fn push(&mut self, component: Component) {
        match component {
            Component::Retain(n) => self.push_retain(n),
            Component::Insert(s) => self.push_insert(&s),
            Component::Delete(n) => self.push_delete(n),
        }
    }

    fn push_retain(&mut self, n: usize) {
        if n == 0 {
            return;
        }
        self.base_len += n;
        self.target_len += n;
        if let Some(Component::Retain(count)) = self.components.last_mut() {
            *count += n;
        } else {
            self.components.push(Component::Retain(n));
        }
    }

    fn push_delete(&mut self, n: usize) {
        if n == 0 {
            return;
        }
        self.base_len += n;
        if let Some(Component::Delete(count)) = self.components.last_mut() {
            *count += n;
        } else {
            self.components.push(Component::Delete(n));
        }
    }

    fn push_insert(&mut self, text: &str) {
        use Component::*;

        if text.is_empty() {
            return;
        }
        self.target_len += text.chars().count();

        let new_last = match self.components.as_mut_slice() {
            [.., Insert(prev)] | [.., Insert(prev), Delete(_)] => {
                prev.push_str(text);
                return;
            }
            // keep inserts ahead of deletes at the same position
            [.., last @ Delete(_)] => std::mem::replace(last, Insert(text.to_owned())),
            _ => Insert(text.to_owned()),
        };
        self.components.push(new_last);
    }

    fn ensure_len(&self, actual: usize) -> Result<()> {
        if actual != self.base_len {
            return Err(OtError::LengthMismatch {
                expected: self.base_len,
                actual,
            });
        }
        Ok(())
    }

    /// Apply to `doc`, returning the edited text.
    ///
    /// Fails without producing anything if `doc` is not exactly
    /// `base_len` chars long.
    pub fn apply(&self, doc: &str) -> Result<String> {
        self.ensure_len(doc.chars().count())?;

        let mut out = String::with_capacity(doc.len());
        let mut chars = doc.chars();
        for component in &self.components {
            match component {
                Component::Retain(n) => out.extend(chars.by_ref().take(*n)),
                Component::Delete(n) => chars.by_ref().take(*n).for_each(drop),
                Component::Insert(s) => out.push_str(s),
            }
        }
        Ok(out)
    }

    /// The operation that undoes this one. `original` is the document this
    /// operation was applied to.
    pub fn invert(&self, original: &str) -> Result<Self> {
        self.ensure_len(original.chars().count())?;

        let mut inverse = Self::with_capacity(self.components.len());
        let mut chars = original.chars();
        for component in &self.components {
            match component {
                Component::Retain(n) => {
                    chars.by_ref().take(*n).for_each(drop);
                    inverse.push_retain(*n);
                }
                Component::Delete(n) => {
                    let removed: String = chars.by_ref().take(*n).collect();
                    inverse.push_insert(&removed);
                }
                Component::Insert(s) => inverse.push_delete(s.chars().count()),
            }
        }
        Ok(inverse)
    }

    /// Fold `other` (which applies to the output of `self`) into a single
    /// operation equivalent to applying both in sequence.
    pub fn compose(self, other: Operation) -> Result<Self> {
        use Component::*;

        let (left_target, right_base) = (self.target_len, other.base_len);
        if left_target != right_base {
            return Err(OtError::ComposeMismatch {
                left_target,
                right_base,
            });
        }

        let mut composed = Self::with_capacity(self.components.len() + other.components.len());
        let mut iter_a = self.components.into_iter();
        let mut iter_b = other.components.into_iter();
        let mut head_a = iter_a.next();
        let mut head_b = iter_b.next();

        loop {
            match (head_a, head_b) {
                (None, None) => break,
                // deletions in A never reach B
                (Some(Delete(n)), b) => {
                    composed.push_delete(n);
                    head_a = iter_a.next();
                    head_b = b;
                }
                // insertions in B consume nothing from A
                (a, Some(Insert(s))) => {
                    composed.push_insert(&s);
                    head_a = a;
                    head_b = iter_b.next();
                }
                (None, Some(_)) | (Some(_), None) => {
                    return Err(OtError::ComposeMismatch {
                        left_target,
                        right_base,
                    });
                }
                (Some(Retain(i)), Some(Retain(j))) => {
                    let n = i.min(j);
                    composed.push_retain(n);
                    head_a = advance(Retain(i), n, &mut iter_a);
                    head_b = advance(Retain(j), n, &mut iter_b);
                }
                (Some(Retain(i)), Some(Delete(j))) => {
                    let n = i.min(j);
                    composed.push_delete(n);
                    head_a = advance(Retain(i), n, &mut iter_a);
                    head_b = advance(Delete(j), n, &mut iter_b);
                }
                (Some(Insert(s)), Some(Retain(j))) => {
                    let len = s.chars().count();
                    match len.cmp(&j) {
                        Ordering::Less => {
                            composed.push_insert(&s);
                            head_a = iter_a.next();
                            head_b = Some(Retain(j - len));
                        }
                        Ordering::Equal => {
                            composed.push_insert(&s);
                            head_a = iter_a.next();
                            head_b = iter_b.next();
                        }
                        Ordering::Greater => {
                            let (kept, rest) = split_chars(&s, j);
                            composed.push_insert(kept);
                            head_a = Some(Insert(rest.to_owned()));
                            head_b = iter_b.next();
                        }
                    }
                }
                // B deletes text that A inserted: both vanish
                (Some(Insert(s)), Some(Delete(j))) => {
                    let len = s.chars().count();
                    match len.cmp(&j) {
                        Ordering::Less => {
                            head_a = iter_a.next();
                            head_b = Some(Delete(j - len));
                        }
                        Ordering::Equal => {
                            head_a = iter_a.next();
                            head_b = iter_b.next();
                        }
                        Ordering::Greater => {
                            let (_, rest) = split_chars(&s, j);
                            head_a = Some(Insert(rest.to_owned()));
                            head_b = iter_b.next();
                        }
                    }
                }
            }
        }

        Ok(composed)
    }

    /// Transform two operations issued against the same document.
    ///
    /// Returns `(a', b')` with `b'.apply(a.apply(d)) == a'.apply(b.apply(d))`.
    /// Inserts at the same offset are ordered `a` first.
    pub fn transform(a: &Operation, b: &Operation) -> Result<(Operation, Operation)> {
        use Component::*;

        if a.base_len != b.base_len {
            return Err(OtError::TransformMismatch {
                left: a.base_len,
                right: b.base_len,
            });
        }

        let mut a_prime = Self::with_capacity(a.components.len());
        let mut b_prime = Self::with_capacity(b.components.len());
        let mut iter_a = a.components.iter().cloned();
        let mut iter_b = b.components.iter().cloned();
        let mut head_a = iter_a.next();
        let mut head_b = iter_b.next();

        loop {
            match (head_a, head_b) {
                (None, None) => break,
                // a's insert wins the tie
                (Some(Insert(s)), b) => {
                    b_prime.push_retain(s.chars().count());
                    a_prime.push_insert(&s);
                    head_a = iter_a.next();
                    head_b = b;
                }
                (a, Some(Insert(s))) => {
                    a_prime.push_retain(s.chars().count());
                    b_prime.push_insert(&s);
                    head_a = a;
                    head_b = iter_b.next();
                }
                (None, Some(_)) | (Some(_), None) => {
                    return Err(OtError::TransformMismatch {
                        left: a.base_len,
                        right: b.base_len,
                    });
                }
                (Some(Retain(i)), Some(Retain(j))) => {
                    let n = i.min(j);
                    a_prime.push_retain(n);
                    b_prime.push_retain(n);
                    head_a = advance(Retain(i), n, &mut iter_a);
                    head_b = advance(Retain(j), n, &mut iter_b);
                }
                // both removed the same text
                (Some(Delete(i)), Some(Delete(j))) => {
                    let n = i.min(j);
                    head_a = advance(Delete(i), n, &mut iter_a);
                    head_b = advance(Delete(j), n, &mut iter_b);
                }
                (Some(Delete(i)), Some(Retain(j))) => {
                    let n = i.min(j);
                    a_prime.push_delete(n);
                    head_a = advance(Delete(i), n, &mut iter_a);
                    head_b = advance(Retain(j), n, &mut iter_b);
                }
                (Some(Retain(i)), Some(Delete(j))) => {
                    let n = i.min(j);
                    b_prime.push_delete(n);
                    head_a = advance(Retain(i), n, &mut iter_a);
                    head_b = advance(Delete(j), n, &mut iter_b);
                }
            }
        }

        Ok((a_prime, b_prime))
    }
}

/// Consume `taken` chars from a retain/delete head, pulling the next
/// component once it is used up.
fn advance(
    head: Component,
    taken: usize,
    rest: &mut impl Iterator<Item = Component>,
) -> Option<Component> {
    match head {
        Component::Retain(n) if n > taken => Some(Component::Retain(n - taken)),
        Component::Delete(n) if n > taken => Some(Component::Delete(n - taken)),
        _ => rest.next(),
    }
}

/// Split after the first `n` chars.
fn split_chars(s: &str, n: usize) -> (&str, &str) {
    let at = s.char_indices().nth(n).map_or(s.len(), |(i, _)| i);
    s.split_at(at)
}
