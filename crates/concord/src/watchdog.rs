//! Consistency watchdog.
//!
//! Participants periodically report a [`Checksum`] per open document. The host
//! compares each report against its own copy and starts a full resync for the
//! (document, peer) pair when they disagree. Reports are only compared when
//! both sides are at causally equivalent points; anything else is stale or,
//! if the vector times cannot be reconciled, treated as inconsistent.

use crate::checksum::{Checksum, ContentDigest};
use crate::clock::Timestamp;
use crate::config::WatchdogConfig;
use crate::ids::{DocumentId, ParticipantId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use tracing::{debug, info, warn};

/// Why a (document, peer) pair was found inconsistent.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum InconsistencyReason {
    /// The peer reported that it has no copy of the document.
    Missing,
    /// The peer's content differs at the same vector time.
    Mismatch {
        expected: ContentDigest,
        found: ContentDigest,
    },
    /// The peer's vector time claims operations the host never produced.
    Irreconcilable { reported: Timestamp, host: Timestamp },
    /// The peer's edit stream broke the consistency protocol.
    Protocol { detail: String },
    /// Messages between host and peer were lost for good.
    StreamLost { from_seq: u64, to_seq: u64 },
}

impl fmt::Display for InconsistencyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InconsistencyReason::Missing => write!(f, "document missing at peer"),
            InconsistencyReason::Mismatch { expected, found } => write!(
                f,
                "content mismatch: expected {:016x}/{}, found {:016x}/{}",
                expected.hash, expected.length, found.hash, found.length
            ),
            InconsistencyReason::Irreconcilable { reported, host } => {
                write!(f, "irreconcilable timestamps: peer {reported}, host {host}")
            }
            InconsistencyReason::Protocol { detail } => write!(f, "protocol violation: {detail}"),
            InconsistencyReason::StreamLost { from_seq, to_seq } => {
                write!(f, "messages {from_seq}..={to_seq} lost")
            }
        }
    }
}

/// Result of comparing one report.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Verdict {
    Consistent,
    /// Taken at a different point in the edit stream; proves nothing.
    Stale,
    Inconsistent(InconsistencyReason),
}

/// A recorded inconsistency.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Inconsistency {
    pub document: DocumentId,
    pub peer: ParticipantId,
    pub reason: InconsistencyReason,
    pub detected_at: DateTime<Utc>,
}

/// Participant-side report throttling.
#[derive(Debug, Clone)]
pub struct ChecksumReporter {
    config: WatchdogConfig,
    last: HashMap<DocumentId, (Checksum, u32)>,
}

impl ChecksumReporter {
    pub fn new(config: WatchdogConfig) -> Self {
        Self {
            config,
            last: HashMap::new(),
        }
    }

    /// Decide whether `record` should be sent.
    ///
    /// A record identical to the previous one for its document is skipped,
    /// up to `max_suppressed` times in a row. Missing records always go out.
    pub fn report(&mut self, record: Checksum) -> Option<Checksum> {
        if record.is_missing() {
            self.last.remove(&record.document);
            return Some(record);
        }
        if self.config.suppress_unchanged {
            if let Some((previous, suppressed)) = self.last.get_mut(&record.document) {
                if *previous == record && *suppressed < self.config.max_suppressed {
                    *suppressed += 1;
                    return None;
                }
            }
        }
        self.last.insert(record.document.clone(), (record.clone(), 0));
        Some(record)
    }

    pub fn forget(&mut self, document: &DocumentId) {
        self.last.remove(document);
    }
}

/// Host-side comparison and resync bookkeeping.
#[derive(Debug, Clone)]
pub struct ConsistencyWatchdog {
    config: WatchdogConfig,
    in_flight: HashMap<(DocumentId, ParticipantId), u64>,
    history: VecDeque<Inconsistency>,
    detected: u64,
}

impl ConsistencyWatchdog {
    pub fn new(config: WatchdogConfig) -> Self {
        Self {
            config,
            in_flight: HashMap::new(),
            history: VecDeque::new(),
            detected: 0,
        }
    }

    /// Compare a peer's report with the host's copy.
    ///
    /// `host` is the host's digest of the document and `proxy` the host's
    /// vector time for the pair. The peer's timestamp `(l, r)` is mirrored
    /// against `proxy`: the copies are comparable only when the host has
    /// applied exactly `l` of the peer's operations and sent it exactly `r`.
    pub fn compare(record: &Checksum, host: &ContentDigest, proxy: Timestamp) -> Verdict {
        if record.is_missing() {
            return Verdict::Inconsistent(InconsistencyReason::Missing);
        }

        if let Some(reported) = record.timestamp {
            if reported.remote > proxy.local || reported.local < proxy.remote {
                return Verdict::Inconsistent(InconsistencyReason::Irreconcilable {
                    reported,
                    host: proxy,
                });
            }
            if reported != proxy.mirrored() {
                return Verdict::Stale;
            }
        }

        let found = record.digest();
        if found == *host {
            Verdict::Consistent
        } else {
            Verdict::Inconsistent(InconsistencyReason::Mismatch {
                expected: *host,
                found,
            })
        }
    }

    /// Record an inconsistency and start a resync for it.
    ///
    /// Returns false, without recording anything, if a resync for the pair
    /// is already in flight.
    pub fn escalate(
        &mut self,
        document: &DocumentId,
        peer: &ParticipantId,
        reason: InconsistencyReason,
        now_ms: u64,
    ) -> bool {
        if !self.begin_resync(document, peer, now_ms) {
            debug!(%document, %peer, %reason, "resync already in flight");
            return false;
        }
        warn!(%document, %peer, %reason, "inconsistency detected");
        self.detected += 1;
        if self.config.history_limit == 0 {
            return true;
        }
        if self.history.len() == self.config.history_limit {
            self.history.pop_front();
        }
        self.history.push_back(Inconsistency {
            document: document.clone(),
            peer: peer.clone(),
            reason,
            detected_at: Utc::now(),
        });
        true
    }

    /// Mark a resync in flight. Returns false if one already is.
    pub fn begin_resync(&mut self, document: &DocumentId, peer: &ParticipantId, now_ms: u64) -> bool {
        let key = (document.clone(), peer.clone());
        if self.in_flight.contains_key(&key) {
            return false;
        }
        self.in_flight.insert(key, now_ms);
        true
    }

    /// Mark a resync as confirmed by the peer.
    pub fn complete(&mut self, document: &DocumentId, peer: &ParticipantId) -> bool {
        let done = self
            .in_flight
            .remove(&(document.clone(), peer.clone()))
            .is_some();
        if done {
            info!(%document, %peer, "resync complete");
        }
        done
    }

    /// Drop an in-flight resync whose confirmation may never arrive.
    pub fn abandon(&mut self, document: &DocumentId, peer: &ParticipantId) {
        if self.in_flight.remove(&(document.clone(), peer.clone())).is_some() {
            debug!(%document, %peer, "resync abandoned");
        }
    }

    pub fn is_resyncing(&self, document: &DocumentId, peer: &ParticipantId) -> bool {
        self.in_flight
            .contains_key(&(document.clone(), peer.clone()))
    }

    /// Give up on resyncs unconfirmed for longer than the timeout.
    pub fn expire(&mut self, now_ms: u64) -> Vec<(DocumentId, ParticipantId)> {
        let timeout = self.config.resync_timeout_ms;
        let mut expired: Vec<_> = self
            .in_flight
            .iter()
            .filter(|(_, started)| now_ms.saturating_sub(**started) >= timeout)
            .map(|(key, _)| key.clone())
            .collect();
        expired.sort();
        for key in &expired {
            self.in_flight.remove(key);
            warn!(document = %key.0, peer = %key.1, "resync timed out");
        }
        expired
    }

    /// Drop every in-flight resync involving `peer`.
    pub fn forget_peer(&mut self, peer: &ParticipantId) {
        self.in_flight.retain(|(_, p), _| p != peer);
    }

    /// Drop every in-flight resync for `document`.
    pub fn forget_document(&mut self, document: &DocumentId) {
        self.in_flight.retain(|(d, _), _| d != document);
    }

    /// The most recent inconsistencies, oldest first, at most
    /// `history_limit` of them.
    pub fn history(&self) -> &VecDeque<Inconsistency> {
        &self.history
    }

    /// Inconsistencies detected over the watchdog's lifetime.
    pub fn detected(&self) -> u64 {
        self.detected
    }
}
