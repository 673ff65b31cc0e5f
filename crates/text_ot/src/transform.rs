//! Inclusion transformation between two concurrent operations.
//!
//! Given `a` and `b` generated against the same document, [`transform`]
//! returns `(a', b')` such that applying `a` then `b'` produces the same text
//! as applying `b` then `a'`.

use crate::operation::{char_len, split_chars, Operation};

/// Which side wins when two inserts land on the same offset.
///
/// Both sites must agree on the answer, so callers derive it from something
/// every site knows, such as the originating participant ids.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Priority {
    /// The first operand's text is placed first.
    Left,
    /// The second operand's text is placed first.
    Right,
}

impl Priority {
    /// The priority seen from the other operand.
    pub fn flip(self) -> Self {
        match self {
            Priority::Left => Priority::Right,
            Priority::Right => Priority::Left,
        }
    }
}

/// Transform two concurrent operations against each other.
///
/// Returns `(a', b')` where `a'` is `a` rewritten to apply after `b`, and `b'`
/// is `b` rewritten to apply after `a`.
///
/// Inserts and deletes with empty text still carry an offset, so they are
/// shifted like any other edit. Only [`Operation::NoOp`] passes through as is.
pub fn transform(a: &Operation, b: &Operation, priority: Priority) -> (Operation, Operation) {
    match (a, b) {
        (Operation::NoOp, _) | (_, Operation::NoOp) => (a.clone(), b.clone()),
        (Operation::Split { left, right }, _) => {
            let (left, b) = transform(left, b, priority);
            let (right, b) = transform(right, &b, priority);
            (Operation::split(left, right), b)
        }
        (_, Operation::Split { left, right }) => {
            let (a, left) = transform(a, left, priority);
            let (a, right) = transform(&a, right, priority);
            (a, Operation::split(left, right))
        }
        (
            Operation::Insert { offset: p1, text: t1 },
            Operation::Insert { offset: p2, text: t2 },
        ) => {
            let a_first = p1 < p2 || (p1 == p2 && priority == Priority::Left);
            if a_first {
                (a.clone(), Operation::insert(p2 + char_len(t1), t2.clone()))
            } else {
                (Operation::insert(p1 + char_len(t2), t1.clone()), b.clone())
            }
        }
        (Operation::Insert { offset, text }, Operation::Delete { offset: d, text: s }) => {
            insert_delete(*offset, text, *d, s)
        }
        (Operation::Delete { offset: d, text: s }, Operation::Insert { offset, text }) => {
            let (ins, del) = insert_delete(*offset, text, *d, s);
            (del, ins)
        }
        (
            Operation::Delete { offset: p1, text: s1 },
            Operation::Delete { offset: p2, text: s2 },
        ) => (
            delete_after_delete(*p1, s1, *p2, s2),
            delete_after_delete(*p2, s2, *p1, s1),
        ),
    }
}

/// Transform an insert and a delete against each other, returning
/// `(insert', delete')`.
fn insert_delete(pos: usize, text: &str, del: usize, removed: &str) -> (Operation, Operation) {
    let ins_len = char_len(text);
    let del_len = char_len(removed);

    if pos <= del {
        return (
            Operation::insert(pos, text),
            Operation::delete(del + ins_len, removed),
        );
    }
    if pos >= del + del_len {
        return (
            Operation::insert(pos - del_len, text),
            Operation::delete(del, removed),
        );
    }

    // The insert lands strictly inside the deleted range: keep the inserted
    // text and delete around it.
    let (head, tail) = split_chars(removed, pos - del);
    (
        Operation::insert(del, text),
        Operation::split(
            Operation::delete(del, head),
            Operation::delete(del + ins_len, tail),
        ),
    )
}

/// Rewrite the delete `(p1, s1)` to apply after the concurrent delete `(p2, s2)`.
fn delete_after_delete(p1: usize, s1: &str, p2: usize, s2: &str) -> Operation {
    let len1 = char_len(s1);
    let len2 = char_len(s2);

    if p1 + len1 <= p2 {
        return Operation::delete(p1, s1);
    }
    if p2 + len2 <= p1 {
        return Operation::delete(p1 - len2, s1);
    }

    // Overlap: keep only the characters the other delete did not remove.
    let before = p2.saturating_sub(p1).min(len1);
    let after = (p2 + len2).saturating_sub(p1).min(len1);
    let (head, rest) = split_chars(s1, before);
    let (_, tail) = split_chars(rest, after - before);

    let mut remaining = String::with_capacity(head.len() + tail.len());
    remaining.push_str(head);
    remaining.push_str(tail);
    if remaining.is_empty() {
        Operation::NoOp
    } else {
        Operation::delete(p1.min(p2), remaining)
    }
}
