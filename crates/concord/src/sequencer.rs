//! Activity sequencer: ordered, gap-free delivery over an unordered transport.
//!
//! Every unit of collaboration data sent from one site to another is wrapped in
//! an [`Envelope`] carrying a per-stream sequence number. Streams are
//! point-to-point (sender → recipient) and numbered from 1. The receiving
//! side delivers envelopes in sequence order, buffers the ones that arrive
//! early, and asks the sender to retransmit a range that stays missing for
//! longer than the gap timeout. If the sender no longer holds part of that
//! range it answers with a [`LostRange`], and the receiver skips past it.

use crate::config::SequencerConfig;
use crate::ids::ParticipantId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use tracing::{debug, warn};

/// A payload stamped with its position in the sender's stream.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope<P> {
    pub sender: ParticipantId,
    pub sequence: u64,
    pub payload: P,
}

/// Ask a sender to resend part of its stream.
///
/// `sender` is the site asking; the range `from_seq..=to_seq` refers to the
/// stream the recipient of this request sends to it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetransmitRequest {
    pub sender: ParticipantId,
    pub from_seq: u64,
    pub to_seq: u64,
}

/// Tells a receiver that part of a stream can no longer be retransmitted.
///
/// `sender` owns the stream; `from_seq..=to_seq` will never arrive.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LostRange {
    pub sender: ParticipantId,
    pub from_seq: u64,
    pub to_seq: u64,
}

/// A sender's answer to a [`RetransmitRequest`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Retransmission<P> {
    /// Requested envelopes still in history.
    pub envelopes: Vec<Envelope<P>>,
    /// The part of the request already evicted from history.
    pub lost: Option<LostRange>,
}

/// Outcome of receiving one envelope.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Received<P> {
    /// Payloads now deliverable, in send order.
    pub delivered: Vec<P>,
    /// A retransmission to request from the envelope's sender.
    pub retransmit: Option<RetransmitRequest>,
}

impl<P> Default for Received<P> {
    fn default() -> Self {
        Self {
            delivered: Vec::new(),
            retransmit: None,
        }
    }
}

#[derive(Clone, Debug)]
struct OutboundStream<P> {
    next: u64,
    history: VecDeque<Envelope<P>>,
}

impl<P> Default for OutboundStream<P> {
    fn default() -> Self {
        Self {
            next: 1,
            history: VecDeque::new(),
        }
    }
}

#[derive(Clone, Debug)]
struct InboundStream<P> {
    expected: u64,
    buffered: BTreeMap<u64, P>,
    gap_since_ms: Option<u64>,
}

impl<P> Default for InboundStream<P> {
    fn default() -> Self {
        Self {
            expected: 1,
            buffered: BTreeMap::new(),
            gap_since_ms: None,
        }
    }
}

impl<P> InboundStream<P> {
    /// The missing range in front of the first buffered envelope.
    fn missing(&self) -> Option<(u64, u64)> {
        let first = *self.buffered.keys().next()?;
        Some((self.expected, first - 1))
    }
}

/// Sequencing state for every stream touching one site.
#[derive(Clone, Debug)]
pub struct ActivitySequencer<P> {
    local: ParticipantId,
    config: SequencerConfig,
    outbound: HashMap<ParticipantId, OutboundStream<P>>,
    inbound: HashMap<ParticipantId, InboundStream<P>>,
}

impl<P: Clone> ActivitySequencer<P> {
    pub fn new(local: ParticipantId, config: SequencerConfig) -> Self {
        Self {
            local,
            config,
            outbound: HashMap::new(),
            inbound: HashMap::new(),
        }
    }

    pub fn local(&self) -> &ParticipantId {
        &self.local
    }

    /// Stamp `payload` with the next sequence number of the stream to `to`.
    ///
    /// The envelope is kept for retransmission until `history_limit` newer
    /// envelopes have been sent on the same stream.
    pub fn send(&mut self, to: &ParticipantId, payload: P) -> Envelope<P> {
        let stream = self.outbound.entry(to.clone()).or_default();
        let envelope = Envelope {
            sender: self.local.clone(),
            sequence: stream.next,
            payload,
        };
        stream.next += 1;
        stream.history.push_back(envelope.clone());
        while stream.history.len() > self.config.history_limit {
            stream.history.pop_front();
        }
        envelope
    }

    /// Accept an envelope from the transport.
    pub fn receive(&mut self, envelope: Envelope<P>, now_ms: u64) -> Received<P> {
        let max_buffered = self.config.max_buffered;
        let gap_timeout_ms = self.config.gap_timeout_ms;
        let sender = envelope.sender.clone();
        let stream = self.inbound.entry(sender.clone()).or_default();
        let seq = envelope.sequence;
        let mut received = Received::default();

        if seq < stream.expected || stream.buffered.contains_key(&seq) {
            debug!(%sender, seq, "duplicate envelope dropped");
            return received;
        }

        if seq > stream.expected {
            if stream.buffered.len() >= max_buffered {
                warn!(%sender, seq, limit = max_buffered, "gap buffer full, envelope dropped");
                received.retransmit = Some(RetransmitRequest {
                    sender: self.local.clone(),
                    from_seq: stream.expected,
                    to_seq: seq,
                });
                stream.gap_since_ms = Some(now_ms);
                return received;
            }

            stream.buffered.insert(seq, envelope.payload);
            let since = *stream.gap_since_ms.get_or_insert(now_ms);
            if now_ms.saturating_sub(since) >= gap_timeout_ms {
                if let Some((from_seq, to_seq)) = stream.missing() {
                    warn!(%sender, from_seq, to_seq, "gap timed out, requesting retransmit");
                    received.retransmit = Some(RetransmitRequest {
                        sender: self.local.clone(),
                        from_seq,
                        to_seq,
                    });
                    stream.gap_since_ms = Some(now_ms);
                }
            }
            return received;
        }

        received.delivered.push(envelope.payload);
        stream.expected += 1;
        while let Some(payload) = stream.buffered.remove(&stream.expected) {
            received.delivered.push(payload);
            stream.expected += 1;
        }
        stream.gap_since_ms = if stream.buffered.is_empty() {
            None
        } else {
            Some(now_ms)
        };
        received
    }

    /// Request retransmission for every gap open longer than the timeout.
    ///
    /// Returns `(sender, request)` pairs; each request goes to its sender.
    pub fn poll_gaps(&mut self, now_ms: u64) -> Vec<(ParticipantId, RetransmitRequest)> {
        let mut requests = Vec::new();
        for (sender, stream) in self.inbound.iter_mut() {
            let Some(since) = stream.gap_since_ms else {
                continue;
            };
            if now_ms.saturating_sub(since) < self.config.gap_timeout_ms {
                continue;
            }
            if let Some((from_seq, to_seq)) = stream.missing() {
                warn!(%sender, from_seq, to_seq, "gap timed out, requesting retransmit");
                requests.push((
                    sender.clone(),
                    RetransmitRequest {
                        sender: self.local.clone(),
                        from_seq,
                        to_seq,
                    },
                ));
                stream.gap_since_ms = Some(now_ms);
            }
        }
        requests.sort_by(|a, b| a.0.cmp(&b.0));
        requests
    }

    /// Answer a retransmission request from history.
    ///
    /// Whatever part of the range was already evicted is reported as lost.
    pub fn retransmit(&self, request: &RetransmitRequest) -> Retransmission<P> {
        let Some(stream) = self.outbound.get(&request.sender) else {
            warn!(peer = %request.sender, "retransmit requested for unknown stream");
            return Retransmission {
                envelopes: Vec::new(),
                lost: None,
            };
        };
        let oldest = stream.history.front().map_or(stream.next, |e| e.sequence);
        let lost = (request.from_seq < oldest && request.from_seq <= request.to_seq).then(|| {
            let to_seq = request.to_seq.min(oldest - 1);
            warn!(
                peer = %request.sender,
                from_seq = request.from_seq,
                to_seq,
                "retransmit range evicted from history"
            );
            LostRange {
                sender: self.local.clone(),
                from_seq: request.from_seq,
                to_seq,
            }
        });
        let envelopes = stream
            .history
            .iter()
            .filter(|e| e.sequence >= request.from_seq && e.sequence <= request.to_seq)
            .cloned()
            .collect();
        Retransmission { envelopes, lost }
    }

    /// Skip a range its sender reported lost.
    ///
    /// Returns `None` if the stream is not waiting on that range, otherwise
    /// the buffered payloads the skip made deliverable.
    pub fn skip_lost(&mut self, lost: &LostRange, now_ms: u64) -> Option<Vec<P>> {
        let stream = self.inbound.entry(lost.sender.clone()).or_default();
        if stream.expected < lost.from_seq || stream.expected > lost.to_seq {
            debug!(sender = %lost.sender, from_seq = lost.from_seq, to_seq = lost.to_seq, "lost range not awaited");
            return None;
        }
        warn!(
            sender = %lost.sender,
            from_seq = stream.expected,
            to_seq = lost.to_seq,
            "skipping lost envelopes"
        );

        stream.expected = lost.to_seq + 1;
        stream.buffered = stream.buffered.split_off(&stream.expected);
        let mut delivered = Vec::new();
        while let Some(payload) = stream.buffered.remove(&stream.expected) {
            delivered.push(payload);
            stream.expected += 1;
        }
        stream.gap_since_ms = if stream.buffered.is_empty() {
            None
        } else {
            Some(now_ms)
        };
        Some(delivered)
    }

    /// Drop both directions of the streams with a departed peer.
    pub fn forget_peer(&mut self, peer: &ParticipantId) {
        self.outbound.remove(peer);
        self.inbound.remove(peer);
    }

    /// Next sequence number expected from `sender`.
    pub fn expected_from(&self, sender: &ParticipantId) -> u64 {
        self.inbound.get(sender).map_or(1, |s| s.expected)
    }

    /// Number of early envelopes buffered from `sender`.
    pub fn buffered_from(&self, sender: &ParticipantId) -> usize {
        self.inbound.get(sender).map_or(0, |s| s.buffered.len())
    }
}
