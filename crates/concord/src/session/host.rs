//! The host side of a session.

use super::{retransmission_events, SessionError, SessionEvent};
use crate::checksum::{digest, Checksum};
use crate::clock::Timestamp;
use crate::config::CollabConfig;
use crate::ids::{DocumentId, ParticipantId, SessionId};
use crate::jupiter::{Applied, JupiterServer};
use crate::message::{Message, Packet};
use crate::request::Request;
use crate::sequencer::{ActivitySequencer, LostRange};
use crate::watchdog::{ConsistencyWatchdog, InconsistencyReason, Verdict};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use text_ot::Operation;
use tracing::{debug, info, trace, warn};

#[derive(Debug, Clone)]
struct HostDocument {
    server: JupiterServer,
    /// Resync generation per participant.
    generations: HashMap<ParticipantId, u32>,
}

impl HostDocument {
    fn generation(&self, peer: &ParticipantId) -> u32 {
        self.generations.get(peer).copied().unwrap_or(0)
    }
}

/// The arbitration authority of a session.
///
/// Owns one [`JupiterServer`] per shared document and relays every accepted
/// operation to the other participants. Every participant is a member of
/// every shared document.
#[derive(Debug, Clone)]
pub struct HostSession {
    session: SessionId,
    host: ParticipantId,
    config: CollabConfig,
    members: BTreeSet<ParticipantId>,
    documents: BTreeMap<DocumentId, HostDocument>,
    /// Last generation of pairs whose document was unshared or whose
    /// participant left. A participant may still hold the document at that
    /// generation, so the next snapshot for the pair must carry a higher one.
    retired_generations: HashMap<(DocumentId, ParticipantId), u32>,
    sequencer: ActivitySequencer<Message>,
    watchdog: ConsistencyWatchdog,
}

impl HostSession {
    pub fn new(session: SessionId, host: ParticipantId, config: CollabConfig) -> Self {
        let sequencer = ActivitySequencer::new(host.clone(), config.sequencer.clone());
        let watchdog = ConsistencyWatchdog::new(config.watchdog.clone());
        Self {
            session,
            host,
            config,
            members: BTreeSet::new(),
            documents: BTreeMap::new(),
            retired_generations: HashMap::new(),
            sequencer,
            watchdog,
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session
    }

    pub fn host_id(&self) -> &ParticipantId {
        &self.host
    }

    pub fn participants(&self) -> impl Iterator<Item = &ParticipantId> {
        self.members.iter()
    }

    pub fn documents(&self) -> impl Iterator<Item = &DocumentId> {
        self.documents.keys()
    }

    /// The host's authoritative copy of a document.
    pub fn content(&self, document: &DocumentId) -> Option<&str> {
        self.documents.get(document).map(|d| d.server.content())
    }

    pub fn timestamp_of(&self, document: &DocumentId, peer: &ParticipantId) -> Option<Timestamp> {
        self.documents.get(document)?.server.timestamp_of(peer)
    }

    pub fn generation_of(&self, document: &DocumentId, peer: &ParticipantId) -> Option<u32> {
        let doc = self.documents.get(document)?;
        doc.generations.contains_key(peer).then(|| doc.generation(peer))
    }

    pub fn watchdog(&self) -> &ConsistencyWatchdog {
        &self.watchdog
    }

    /// Start sharing a document. Every current participant is sent a snapshot.
    pub fn share_document(
        &mut self,
        document: DocumentId,
        content: impl Into<String>,
        now_ms: u64,
    ) -> Result<Vec<SessionEvent>, SessionError> {
        if self.documents.contains_key(&document) {
            return Err(SessionError::AlreadyShared(document));
        }

        let mut server = JupiterServer::new(
            document.clone(),
            self.host.clone(),
            content,
            self.config.jupiter.max_pending_requests,
        );
        let mut generations = HashMap::new();
        for peer in &self.members {
            server.add_participant(peer.clone());
            let floor = self
                .retired_generations
                .remove(&(document.clone(), peer.clone()))
                .unwrap_or(0);
            generations.insert(peer.clone(), floor);
        }
        self.documents
            .insert(document.clone(), HostDocument { server, generations });
        info!(session = %self.session, %document, "document shared");

        let members: Vec<_> = self.members.iter().cloned().collect();
        let mut events = Vec::new();
        for peer in members {
            if self.watchdog.begin_resync(&document, &peer, now_ms) {
                events.extend(self.send_snapshot(&document, &peer));
            }
        }
        Ok(events)
    }

    /// Stop sharing a document, dropping its consistency state.
    ///
    /// Generations are remembered, so sharing the document again supersedes
    /// whatever copy the participants kept.
    pub fn unshare_document(&mut self, document: &DocumentId) -> Result<(), SessionError> {
        let doc = self
            .documents
            .remove(document)
            .ok_or_else(|| SessionError::UnknownDocument(document.clone()))?;
        for (peer, generation) in doc.generations {
            self.retired_generations.insert((document.clone(), peer), generation);
        }
        self.watchdog.forget_document(document);
        info!(session = %self.session, %document, "document unshared");
        Ok(())
    }

    /// Admit a participant. It is sent a snapshot of every shared document.
    pub fn add_participant(&mut self, peer: ParticipantId, now_ms: u64) -> Vec<SessionEvent> {
        if !self.members.insert(peer.clone()) {
            debug!(session = %self.session, %peer, "participant already joined");
            return Vec::new();
        }
        info!(session = %self.session, %peer, "participant joined");

        let documents: Vec<_> = self.documents.keys().cloned().collect();
        let mut events = Vec::new();
        for document in documents {
            if let Some(doc) = self.documents.get_mut(&document) {
                doc.server.add_participant(peer.clone());
                let floor = self
                    .retired_generations
                    .remove(&(document.clone(), peer.clone()))
                    .unwrap_or(0);
                doc.generations.insert(peer.clone(), floor);
            }
            if self.watchdog.begin_resync(&document, &peer, now_ms) {
                events.extend(self.send_snapshot(&document, &peer));
            }
        }
        events
    }

    /// Remove a participant from every document at once.
    ///
    /// Anything still queued for the participant is dropped with its state.
    pub fn remove_participant(&mut self, peer: &ParticipantId) -> bool {
        if !self.members.remove(peer) {
            return false;
        }
        for (document, doc) in self.documents.iter_mut() {
            doc.server.remove_participant(peer);
            if let Some(generation) = doc.generations.remove(peer) {
                self.retired_generations
                    .insert((document.clone(), peer.clone()), generation);
            }
        }
        self.sequencer.forget_peer(peer);
        self.watchdog.forget_peer(peer);
        info!(session = %self.session, %peer, "participant left");
        true
    }

    /// Push a fresh snapshot to `peer`, unless one is already in flight.
    pub fn resync(
        &mut self,
        document: &DocumentId,
        peer: &ParticipantId,
        now_ms: u64,
    ) -> Result<Vec<SessionEvent>, SessionError> {
        let doc = self
            .documents
            .get(document)
            .ok_or_else(|| SessionError::UnknownDocument(document.clone()))?;
        if !doc.generations.contains_key(peer) {
            return Err(SessionError::UnknownParticipant(peer.clone()));
        }
        if !self.watchdog.begin_resync(document, peer, now_ms) {
            return Ok(Vec::new());
        }
        Ok(self.send_snapshot(document, peer))
    }

    /// Accept an edit already made to the host's own editor.
    pub fn local_edit(
        &mut self,
        document: &DocumentId,
        operation: Operation,
    ) -> Result<Vec<SessionEvent>, SessionError> {
        let doc = self
            .documents
            .get_mut(document)
            .ok_or_else(|| SessionError::UnknownDocument(document.clone()))?;
        let applied = doc.server.generate_local(operation)?;
        Ok(self.relay(document, applied))
    }

    /// Handle a packet from a participant.
    pub fn receive(&mut self, from: &ParticipantId, packet: Packet, now_ms: u64) -> Vec<SessionEvent> {
        if !self.members.contains(from) {
            warn!(session = %self.session, %from, "packet from non-member dropped");
            return Vec::new();
        }

        match packet {
            Packet::Retransmit(request) => {
                if request.sender != *from {
                    warn!(%from, claimed = %request.sender, "retransmit request with wrong sender dropped");
                    return Vec::new();
                }
                let resent = self.sequencer.retransmit(&request);
                let lost_here = resent.lost.clone();
                let mut events = retransmission_events(from, resent);
                // The participant skips the range; only a snapshot can replace it.
                if let Some(lost) = lost_here {
                    events.extend(self.stream_lost(from, &lost, now_ms));
                }
                events
            }
            Packet::Lost(lost) => {
                if lost.sender != *from {
                    warn!(%from, claimed = %lost.sender, "lost-range notice with wrong sender dropped");
                    return Vec::new();
                }
                let Some(delivered) = self.sequencer.skip_lost(&lost, now_ms) else {
                    return Vec::new();
                };
                let mut events = self.stream_lost(from, &lost, now_ms);
                for message in delivered {
                    events.extend(self.handle_message(from, message, now_ms));
                }
                events
            }
            Packet::Sequenced(envelope) => {
                if envelope.sender != *from {
                    warn!(%from, claimed = %envelope.sender, "envelope with wrong sender dropped");
                    return Vec::new();
                }
                let received = self.sequencer.receive(envelope, now_ms);
                let mut events = Vec::new();
                if let Some(request) = received.retransmit {
                    events.push(SessionEvent::Transmit {
                        to: from.clone(),
                        packet: Packet::Retransmit(request),
                    });
                }
                for message in received.delivered {
                    events.extend(self.handle_message(from, message, now_ms));
                }
                events
            }
        }
    }

    /// Periodic work: retransmit requests for stale gaps, resync expiry.
    pub fn tick(&mut self, now_ms: u64) -> Vec<SessionEvent> {
        self.watchdog.expire(now_ms);
        self.sequencer
            .poll_gaps(now_ms)
            .into_iter()
            .map(|(to, request)| SessionEvent::Transmit {
                to,
                packet: Packet::Retransmit(request),
            })
            .collect()
    }

    fn handle_message(&mut self, from: &ParticipantId, message: Message, now_ms: u64) -> Vec<SessionEvent> {
        match message {
            Message::EditRequest {
                session,
                generation,
                request,
            } => {
                if session != self.session {
                    warn!(%from, %session, "edit for another session dropped");
                    return Vec::new();
                }
                self.handle_edit(from, generation, request, now_ms)
            }
            Message::Checksum {
                generation,
                checksum,
            } => self.handle_checksum(from, generation, checksum, now_ms),
            Message::ResyncComplete {
                document,
                generation,
            } => {
                let current = self
                    .documents
                    .get(&document)
                    .map(|doc| doc.generation(from));
                if current != Some(generation) {
                    debug!(%from, %document, generation, "stale resync confirmation ignored");
                    return Vec::new();
                }
                if self.watchdog.complete(&document, from) {
                    vec![SessionEvent::ResyncComplete {
                        document,
                        peer: from.clone(),
                    }]
                } else {
                    Vec::new()
                }
            }
            Message::ResyncSnapshot { document, .. } => {
                warn!(%from, %document, "snapshot from participant dropped");
                Vec::new()
            }
        }
    }

    fn handle_edit(
        &mut self,
        from: &ParticipantId,
        generation: u32,
        request: Request,
        now_ms: u64,
    ) -> Vec<SessionEvent> {
        let document = request.document.clone();
        let Some(doc) = self.documents.get_mut(&document) else {
            warn!(%from, %document, "edit for unshared document dropped");
            return Vec::new();
        };
        if generation != doc.generation(from) {
            debug!(%from, %document, generation, "edit from before resync dropped");
            return Vec::new();
        }
        if request.origin != *from {
            warn!(%from, origin = %request.origin, "edit with forged origin dropped");
            return Vec::new();
        }

        let delivery = match doc.server.receive(from, request) {
            Ok(delivery) => delivery,
            Err(e) => {
                warn!(%from, %document, error = %e, "edit rejected");
                return Vec::new();
            }
        };

        let mut events = Vec::new();
        for applied in delivery.applied {
            events.push(SessionEvent::OperationReady {
                document: document.clone(),
                operation: applied.operation.clone(),
            });
            events.extend(self.relay(&document, applied));
        }
        if let Some(error) = delivery.failure {
            let reason = InconsistencyReason::Protocol {
                detail: error.to_string(),
            };
            events.extend(self.escalate(&document, from, reason, now_ms));
        }
        events
    }

    fn handle_checksum(
        &mut self,
        from: &ParticipantId,
        generation: u32,
        checksum: Checksum,
        now_ms: u64,
    ) -> Vec<SessionEvent> {
        let document = checksum.document.clone();
        let Some(doc) = self.documents.get(&document) else {
            debug!(%from, %document, "checksum for unshared document ignored");
            return Vec::new();
        };
        if checksum.sender != *from {
            warn!(%from, sender = %checksum.sender, "checksum with wrong sender dropped");
            return Vec::new();
        }
        // A missing copy is missing whatever generation it was reported in.
        if !checksum.is_missing() && generation != doc.generation(from) {
            debug!(%from, %document, generation, "checksum from before resync ignored");
            return Vec::new();
        }
        let Some(proxy) = doc.server.timestamp_of(from) else {
            return Vec::new();
        };

        let host = digest(doc.server.content());
        match ConsistencyWatchdog::compare(&checksum, &host, proxy) {
            Verdict::Consistent => {
                trace!(%from, %document, "checksum consistent");
                Vec::new()
            }
            Verdict::Stale => {
                debug!(%from, %document, reported = ?checksum.timestamp, host = %proxy, "stale checksum ignored");
                Vec::new()
            }
            Verdict::Inconsistent(reason) => self.escalate(&document, from, reason, now_ms),
        }
    }

    /// Resync every document with `peer` after part of a stream between
    /// them was lost, whatever resync was already in flight.
    fn stream_lost(&mut self, peer: &ParticipantId, lost: &LostRange, now_ms: u64) -> Vec<SessionEvent> {
        let documents: Vec<_> = self
            .documents
            .iter()
            .filter(|(_, doc)| doc.generations.contains_key(peer))
            .map(|(document, _)| document.clone())
            .collect();
        let mut events = Vec::new();
        for document in documents {
            self.watchdog.abandon(&document, peer);
            let reason = InconsistencyReason::StreamLost {
                from_seq: lost.from_seq,
                to_seq: lost.to_seq,
            };
            events.extend(self.escalate(&document, peer, reason, now_ms));
        }
        events
    }

    fn escalate(
        &mut self,
        document: &DocumentId,
        peer: &ParticipantId,
        reason: InconsistencyReason,
        now_ms: u64,
    ) -> Vec<SessionEvent> {
        if !self.watchdog.escalate(document, peer, reason.clone(), now_ms) {
            return Vec::new();
        }
        let mut events = vec![SessionEvent::InconsistencyDetected {
            document: document.clone(),
            peer: peer.clone(),
            reason,
        }];
        events.extend(self.send_snapshot(document, peer));
        events
    }

    /// Reset the pair and push the host's content under a new generation.
    fn send_snapshot(&mut self, document: &DocumentId, peer: &ParticipantId) -> Vec<SessionEvent> {
        let Some(doc) = self.documents.get_mut(document) else {
            return Vec::new();
        };
        if doc.server.reset_participant(peer).is_err() {
            return Vec::new();
        }
        let generation = doc.generation(peer) + 1;
        doc.generations.insert(peer.clone(), generation);
        let content = doc.server.content().to_owned();

        info!(session = %self.session, %document, %peer, generation, "sending snapshot");
        let message = Message::ResyncSnapshot {
            document: document.clone(),
            content,
            reset_timestamp: Timestamp::ZERO,
            generation,
        };
        vec![self.transmit(peer, message)]
    }

    fn relay(&mut self, document: &DocumentId, applied: Applied) -> Vec<SessionEvent> {
        let Some(doc) = self.documents.get(document) else {
            return Vec::new();
        };
        let outgoing: Vec<_> = applied
            .relays
            .into_iter()
            .map(|relay| {
                let message = Message::EditRequest {
                    session: self.session.clone(),
                    generation: doc.generation(&relay.to),
                    request: relay.request,
                };
                (relay.to, message)
            })
            .collect();
        outgoing
            .into_iter()
            .map(|(to, message)| self.transmit(&to, message))
            .collect()
    }

    fn transmit(&mut self, to: &ParticipantId, message: Message) -> SessionEvent {
        let envelope = self.sequencer.send(to, message);
        SessionEvent::Transmit {
            to: to.clone(),
            packet: Packet::Sequenced(envelope),
        }
    }
}
