//! Edit operations over a single text document.
//!
//! An [`Operation`] describes one edit. Offsets are always relative to the
//! document as it was before the operation is applied, and are counted in
//! Unicode scalar values rather than bytes so that every site agrees on them
//! regardless of how it stores text.

use crate::compose;
use crate::error::{OtError, OtResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// An edit over a single text document.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Operation {
    /// Identity edit.
    ///
    /// Produced when an operation is fully absorbed by a concurrent one, and
    /// used on its own to advance vector time without touching the text.
    NoOp,

    /// Insert `text` before the character at `offset`.
    Insert { offset: usize, text: String },

    /// Remove the characters of `text`, starting at `offset`.
    ///
    /// The removed text is carried so the operation can be inverted and
    /// composed, and so a mismatching document is detected on apply.
    Delete { offset: usize, text: String },

    /// Two edits applied left to right.
    ///
    /// `right` is positioned against the document produced by `left`.
    Split {
        left: Box<Operation>,
        right: Box<Operation>,
    },
}

impl Operation {
    /// Create an insert operation.
    pub fn insert(offset: usize, text: impl Into<String>) -> Self {
        Operation::Insert {
            offset,
            text: text.into(),
        }
    }

    /// Create a delete operation.
    pub fn delete(offset: usize, text: impl Into<String>) -> Self {
        Operation::Delete {
            offset,
            text: text.into(),
        }
    }

    /// Combine two sequential operations.
    ///
    /// Children without effect are dropped, and pairs that fold into a
    /// single insert or delete are compacted. Anything else becomes a
    /// [`Operation::Split`].
    pub fn split(left: Operation, right: Operation) -> Self {
        if left.is_noop() {
            return right;
        }
        if right.is_noop() {
            return left;
        }
        compose::merge(&left, &right).unwrap_or_else(|| Operation::Split {
            left: Box::new(left),
            right: Box::new(right),
        })
    }

    /// Returns true if applying this operation leaves every document unchanged.
    pub fn is_noop(&self) -> bool {
        match self {
            Operation::NoOp => true,
            Operation::Insert { text, .. } | Operation::Delete { text, .. } => text.is_empty(),
            Operation::Split { left, right } => left.is_noop() && right.is_noop(),
        }
    }

    /// Net change in document length, in characters.
    pub fn char_delta(&self) -> isize {
        match self {
            Operation::NoOp => 0,
            Operation::Insert { text, .. } => char_len(text) as isize,
            Operation::Delete { text, .. } => -(char_len(text) as isize),
            Operation::Split { left, right } => left.char_delta() + right.char_delta(),
        }
    }

    /// Flatten into the primitive operations applied, in order.
    pub fn primitives(&self) -> Vec<&Operation> {
        let mut out = Vec::new();
        self.collect_primitives(&mut out);
        out
    }

    fn collect_primitives<'a>(&'a self, out: &mut Vec<&'a Operation>) {
        match self {
            Operation::Split { left, right } => {
                left.collect_primitives(out);
                right.collect_primitives(out);
            }
            other => out.push(other),
        }
    }

    /// The operation that undoes this one.
    pub fn invert(&self) -> Operation {
        match self {
            Operation::NoOp => Operation::NoOp,
            Operation::Insert { offset, text } => Operation::delete(*offset, text.clone()),
            Operation::Delete { offset, text } => Operation::insert(*offset, text.clone()),
            Operation::Split { left, right } => Operation::Split {
                left: Box::new(right.invert()),
                right: Box::new(left.invert()),
            },
        }
    }

    /// Apply this operation to `doc`, returning the edited text.
    ///
    /// # Errors
    ///
    /// Returns [`OtError::OffsetOutOfBounds`] if the operation reaches past the
    /// end of `doc`, and [`OtError::ContentMismatch`] if a delete names text
    /// other than what `doc` holds.
    pub fn apply(&self, doc: &str) -> OtResult<String> {
        match self {
            Operation::NoOp => Ok(doc.to_owned()),
            Operation::Insert { offset, text } => {
                let at = byte_offset(doc, *offset)?;
                let mut out = String::with_capacity(doc.len() + text.len());
                out.push_str(&doc[..at]);
                out.push_str(text);
                out.push_str(&doc[at..]);
                Ok(out)
            }
            Operation::Delete { offset, text } => {
                let start = byte_offset(doc, *offset)?;
                let end = byte_offset(doc, offset + char_len(text))?;
                let found = &doc[start..end];
                if found != text {
                    return Err(OtError::ContentMismatch {
                        offset: *offset,
                        expected: text.clone(),
                        found: found.to_owned(),
                    });
                }
                let mut out = String::with_capacity(doc.len() - found.len());
                out.push_str(&doc[..start]);
                out.push_str(&doc[end..]);
                Ok(out)
            }
            Operation::Split { left, right } => right.apply(&left.apply(doc)?),
        }
    }
}

impl Default for Operation {
    fn default() -> Self {
        Operation::NoOp
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::NoOp => write!(f, "NoOp"),
            Operation::Insert { offset, text } => write!(f, "Insert({}, {:?})", offset, text),
            Operation::Delete { offset, text } => write!(f, "Delete({}, {:?})", offset, text),
            Operation::Split { left, right } => write!(f, "Split({}, {})", left, right),
        }
    }
}

/// Number of characters in `text`.
pub fn char_len(text: &str) -> usize {
    text.chars().count()
}

/// Split `text` into the first `at` characters and the rest.
pub(crate) fn split_chars(text: &str, at: usize) -> (&str, &str) {
    let byte = text
        .char_indices()
        .nth(at)
        .map(|(i, _)| i)
        .unwrap_or(text.len());
    text.split_at(byte)
}

fn byte_offset(doc: &str, offset: usize) -> OtResult<usize> {
    doc.char_indices()
        .map(|(i, _)| i)
        .chain(std::iter::once(doc.len()))
        .nth(offset)
        .ok_or_else(|| OtError::OffsetOutOfBounds {
            offset,
            len: char_len(doc),
        })
}
