//! Sequential composition of operations, used to compact history.

use crate::operation::{char_len, split_chars, Operation};

/// Compose `a` followed by `b` into a single operation.
///
/// Applying the result is equivalent to applying `a` and then `b`. Adjacent
/// primitives are folded together where possible, so a run of typed
/// characters collapses into one insert and a run of backspaces into one
/// delete.
pub fn compose(a: &Operation, b: &Operation) -> Operation {
    let mut folded: Vec<Operation> = Vec::new();
    for op in a.primitives().into_iter().chain(b.primitives()) {
        if op.is_noop() {
            continue;
        }
        match folded.last().and_then(|last| merge(last, op)) {
            Some(merged) => {
                folded.pop();
                if !merged.is_noop() {
                    folded.push(merged);
                }
            }
            None => folded.push(op.clone()),
        }
    }

    folded
        .into_iter()
        .reduce(|left, right| Operation::Split {
            left: Box::new(left),
            right: Box::new(right),
        })
        .unwrap_or(Operation::NoOp)
}

/// Fold two sequential primitives into one, if they touch.
///
/// Returns `None` when the pair cannot be expressed as a single primitive.
pub(crate) fn merge(a: &Operation, b: &Operation) -> Option<Operation> {
    if a.is_noop() {
        return Some(b.clone());
    }
    if b.is_noop() {
        return Some(a.clone());
    }

    match (a, b) {
        (
            Operation::Insert { offset: p1, text: t1 },
            Operation::Insert { offset: p2, text: t2 },
        ) if *p2 >= *p1 && *p2 <= p1 + char_len(t1) => {
            let (head, tail) = split_chars(t1, p2 - p1);
            Some(Operation::insert(*p1, format!("{head}{t2}{tail}")))
        }
        (
            Operation::Delete { offset: p1, text: s1 },
            Operation::Delete { offset: p2, text: s2 },
        ) => {
            if p1 == p2 {
                Some(Operation::delete(*p1, format!("{s1}{s2}")))
            } else if p2 + char_len(s2) == *p1 {
                Some(Operation::delete(*p2, format!("{s2}{s1}")))
            } else {
                None
            }
        }
        (
            Operation::Insert { offset: p1, text: t1 },
            Operation::Delete { offset: p2, text: s2 },
        ) if *p2 >= *p1 && p2 + char_len(s2) <= p1 + char_len(t1) => {
            let (head, rest) = split_chars(t1, p2 - p1);
            let (removed, tail) = split_chars(rest, char_len(s2));
            if removed != s2 {
                return None;
            }
            let remaining = format!("{head}{tail}");
            if remaining.is_empty() {
                Some(Operation::NoOp)
            } else {
                Some(Operation::insert(*p1, remaining))
            }
        }
        _ => None,
    }
}
