//! One side of a Jupiter (document, peer) pair.

use super::JupiterError;
use crate::clock::Timestamp;
use crate::ids::{DocumentId, ParticipantId};
use crate::request::Request;
use std::collections::{BTreeMap, VecDeque};
use text_ot::{transform, Operation, Priority};
use tracing::{debug, trace};

/// Consistency state for one (document, peer) pair.
///
/// Participants hold one of these per document for their link to the host.
/// The host holds one per participant per document, as the proxy for that
/// participant.
#[derive(Debug, Clone)]
pub struct JupiterClient {
    document: DocumentId,
    time: Timestamp,
    /// Sent requests the peer has not acknowledged, oldest first. Their
    /// operations are kept transformed against everything received since,
    /// so they always describe the effect on the current document.
    outgoing: VecDeque<Request>,
    /// Requests that arrived ahead of a predecessor, keyed by their local stamp.
    pending: BTreeMap<u64, Request>,
    /// Highest acknowledgement seen so far.
    acknowledged: u64,
    max_pending: usize,
}

impl JupiterClient {
    pub fn new(document: DocumentId, max_pending: usize) -> Self {
        Self {
            document,
            time: Timestamp::ZERO,
            outgoing: VecDeque::new(),
            pending: BTreeMap::new(),
            acknowledged: 0,
            max_pending,
        }
    }

    pub fn document(&self) -> &DocumentId {
        &self.document
    }

    pub fn timestamp(&self) -> Timestamp {
        self.time
    }

    /// Number of sent requests still waiting for acknowledgement.
    pub fn unacknowledged(&self) -> usize {
        self.outgoing.len()
    }

    /// Number of received requests waiting for a predecessor.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Stamp a local operation for transmission to the peer.
    ///
    /// The operation must already be applied (or about to be applied) to this
    /// site's copy of the document. Never blocks; any number of local
    /// operations may be generated before the peer answers.
    pub fn generate_local(&mut self, origin: ParticipantId, operation: Operation) -> Request {
        let request = Request::new(origin, self.document.clone(), self.time, operation);
        self.outgoing.push_back(request.clone());
        self.time = self.time.incremented_local();
        trace!(document = %self.document, time = %self.time, "generated local request");
        request
    }

    /// Integrate a request received from the peer.
    ///
    /// Returns the request with its operation transformed so it applies to
    /// this site's current document, or `None` if it arrived ahead of a
    /// predecessor and was parked. Parked requests are released by
    /// [`next_ready`](Self::next_ready).
    pub fn receive_remote(&mut self, request: Request) -> Result<Option<Request>, JupiterError> {
        let got = request.timestamp.local;
        let expected = self.time.remote;

        if got < expected {
            return Err(JupiterError::CausalityViolation {
                expected_local: expected,
                got_local: got,
            });
        }
        if got > expected {
            if self.pending.contains_key(&got) {
                debug!(document = %self.document, local = got, "duplicate parked request dropped");
                return Ok(None);
            }
            if self.pending.len() >= self.max_pending {
                return Err(JupiterError::PendingOverflow {
                    limit: self.max_pending,
                });
            }
            debug!(document = %self.document, expected, got, "request parked until predecessor arrives");
            self.pending.insert(got, request);
            return Ok(None);
        }

        self.integrate(request).map(Some)
    }

    /// Integrate the parked request that has become ready, if any.
    pub fn next_ready(&mut self) -> Option<Result<Request, JupiterError>> {
        let request = self.pending.remove(&self.time.remote)?;
        Some(self.integrate(request))
    }

    /// Return to the state of a freshly joined pair at `timestamp`, dropping
    /// all history.
    pub fn reset_to(&mut self, timestamp: Timestamp) {
        self.time = timestamp;
        self.outgoing.clear();
        self.pending.clear();
        self.acknowledged = timestamp.local;
    }

    /// Return to `(0,0)` with no history.
    pub fn reset(&mut self) {
        self.reset_to(Timestamp::ZERO);
    }

    fn integrate(&mut self, request: Request) -> Result<Request, JupiterError> {
        let acked = request.timestamp.remote;
        if acked > self.time.local {
            return Err(JupiterError::AcknowledgesUnsent {
                remote: acked,
                local: self.time.local,
            });
        }
        if acked < self.acknowledged {
            return Err(JupiterError::AlreadyAcknowledged {
                remote: acked,
                oldest: self.acknowledged,
            });
        }

        self.acknowledged = acked;
        while self
            .outgoing
            .front()
            .is_some_and(|sent| sent.timestamp.local < acked)
        {
            self.outgoing.pop_front();
        }

        let mut operation = request.operation.clone();
        for sent in self.outgoing.iter_mut() {
            let priority = if request.origin <= sent.origin {
                Priority::Left
            } else {
                Priority::Right
            };
            let (incoming, rewritten) = transform(&operation, &sent.operation, priority);
            *sent = sent.with_operation(rewritten);
            operation = incoming;
        }

        self.time = self.time.incremented_remote();
        trace!(document = %self.document, time = %self.time, "integrated remote request");
        Ok(request.with_operation(operation))
    }
}
