//! Vector timestamp for one (document, peer) pair.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Two monotonically increasing counters kept by each side of a
/// (document, peer) pair.
///
/// - `local`: operations this site has generated and sent to the peer.
/// - `remote`: operations this site has received from the peer and applied.
///
/// A request stamped `(local, remote)` by its sender is causally ready at the
/// receiver when `local` equals the receiver's own `remote` count. The
/// sender's `remote` tells the receiver how many of its own operations the
/// sender had seen, which is what lets it discard acknowledged history.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Timestamp {
    pub local: u64,
    pub remote: u64,
}

impl Timestamp {
    /// The state of a freshly joined or resynchronized pair.
    pub const ZERO: Timestamp = Timestamp { local: 0, remote: 0 };

    pub fn new(local: u64, remote: u64) -> Self {
        Self { local, remote }
    }

    /// Count one more generated operation.
    pub fn incremented_local(self) -> Self {
        Self {
            local: self.local + 1,
            remote: self.remote,
        }
    }

    /// Count one more received operation.
    pub fn incremented_remote(self) -> Self {
        Self {
            local: self.local,
            remote: self.remote + 1,
        }
    }

    /// The same timestamp seen from the other side of the pair.
    pub fn mirrored(self) -> Self {
        Self {
            local: self.remote,
            remote: self.local,
        }
    }

    /// True if neither counter of `self` is behind `other`.
    pub fn dominates(&self, other: &Timestamp) -> bool {
        self.local >= other.local && self.remote >= other.remote
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({},{})", self.local, self.remote)
    }
}
