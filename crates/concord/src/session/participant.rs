//! The participant side of a session.

use super::{retransmission_events, SessionError, SessionEvent};
use crate::checksum::Checksum;
use crate::clock::Timestamp;
use crate::config::CollabConfig;
use crate::ids::{DocumentId, ParticipantId, SessionId};
use crate::jupiter::{JupiterClient, JupiterError};
use crate::message::{Message, Packet};
use crate::request::Request;
use crate::sequencer::ActivitySequencer;
use crate::watchdog::ChecksumReporter;
use std::collections::BTreeMap;
use text_ot::Operation;
use tracing::{debug, error, info, warn};

/// Whether a participant's copy of a document can be edited.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DocumentState {
    /// Known to exist but no snapshot received yet.
    Missing,
    Active,
    /// Hit a protocol or apply failure; waiting for a snapshot.
    Broken,
}

#[derive(Debug, Clone)]
struct ParticipantDocument {
    client: JupiterClient,
    generation: u32,
    state: DocumentState,
}

/// A non-host site.
///
/// Talks only to the host. Its copy of each document lives in the editor;
/// the session tracks the consistency state beside it.
#[derive(Debug, Clone)]
pub struct ParticipantSession {
    session: SessionId,
    local: ParticipantId,
    host: ParticipantId,
    config: CollabConfig,
    documents: BTreeMap<DocumentId, ParticipantDocument>,
    sequencer: ActivitySequencer<Message>,
    reporter: ChecksumReporter,
}

impl ParticipantSession {
    pub fn new(session: SessionId, local: ParticipantId, host: ParticipantId, config: CollabConfig) -> Self {
        let sequencer = ActivitySequencer::new(local.clone(), config.sequencer.clone());
        let reporter = ChecksumReporter::new(config.watchdog.clone());
        Self {
            session,
            local,
            host,
            config,
            documents: BTreeMap::new(),
            sequencer,
            reporter,
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session
    }

    pub fn local_id(&self) -> &ParticipantId {
        &self.local
    }

    pub fn host_id(&self) -> &ParticipantId {
        &self.host
    }

    pub fn documents(&self) -> impl Iterator<Item = &DocumentId> {
        self.documents.keys()
    }

    pub fn document_state(&self, document: &DocumentId) -> Option<DocumentState> {
        self.documents.get(document).map(|d| d.state)
    }

    pub fn is_broken(&self, document: &DocumentId) -> bool {
        self.document_state(document) == Some(DocumentState::Broken)
    }

    pub fn timestamp(&self, document: &DocumentId) -> Option<Timestamp> {
        self.documents.get(document).map(|d| d.client.timestamp())
    }

    pub fn generation(&self, document: &DocumentId) -> Option<u32> {
        self.documents.get(document).map(|d| d.generation)
    }

    /// Register a document the host shares that has not arrived yet.
    ///
    /// Checksums for it report the document as missing, which makes the host
    /// send a snapshot.
    pub fn expect_document(&mut self, document: DocumentId) {
        let max_pending = self.config.jupiter.max_pending_requests;
        self.documents
            .entry(document.clone())
            .or_insert_with(|| ParticipantDocument {
                client: JupiterClient::new(document, max_pending),
                generation: 0,
                state: DocumentState::Missing,
            });
    }

    /// Stop tracking a document.
    pub fn close_document(&mut self, document: &DocumentId) -> bool {
        self.reporter.forget(document);
        self.documents.remove(document).is_some()
    }

    /// Send an edit already made to the local editor.
    pub fn local_edit(
        &mut self,
        document: &DocumentId,
        operation: Operation,
    ) -> Result<Vec<SessionEvent>, SessionError> {
        let doc = self
            .documents
            .get_mut(document)
            .ok_or_else(|| SessionError::UnknownDocument(document.clone()))?;
        match doc.state {
            DocumentState::Missing => return Err(SessionError::DocumentMissing(document.clone())),
            DocumentState::Broken => return Err(SessionError::DocumentBroken(document.clone())),
            DocumentState::Active => {}
        }

        let request = doc.client.generate_local(self.local.clone(), operation);
        let message = Message::EditRequest {
            session: self.session.clone(),
            generation: doc.generation,
            request,
        };
        Ok(vec![self.transmit(message)])
    }

    /// Handle a packet from the host.
    pub fn receive(&mut self, from: &ParticipantId, packet: Packet, now_ms: u64) -> Vec<SessionEvent> {
        if *from != self.host {
            warn!(%from, "packet from non-host dropped");
            return Vec::new();
        }

        match packet {
            Packet::Retransmit(request) => {
                if request.sender != self.host {
                    return Vec::new();
                }
                // The host resyncs every document once it skips the range.
                retransmission_events(&self.host, self.sequencer.retransmit(&request))
            }
            Packet::Lost(lost) => {
                if lost.sender != self.host {
                    warn!(claimed = %lost.sender, "lost-range notice with wrong sender dropped");
                    return Vec::new();
                }
                let Some(delivered) = self.sequencer.skip_lost(&lost, now_ms) else {
                    return Vec::new();
                };
                let documents: Vec<_> = self.documents.keys().cloned().collect();
                let mut events = Vec::new();
                for document in documents {
                    let reason = format!("messages {}..={} from host lost", lost.from_seq, lost.to_seq);
                    events.extend(self.break_document(&document, reason));
                }
                for message in delivered {
                    events.extend(self.handle_message(message));
                }
                events
            }
            Packet::Sequenced(envelope) => {
                if envelope.sender != self.host {
                    warn!(claimed = %envelope.sender, "envelope with wrong sender dropped");
                    return Vec::new();
                }
                let received = self.sequencer.receive(envelope, now_ms);
                let mut events = Vec::new();
                if let Some(request) = received.retransmit {
                    events.push(SessionEvent::Transmit {
                        to: self.host.clone(),
                        packet: Packet::Retransmit(request),
                    });
                }
                for message in received.delivered {
                    events.extend(self.handle_message(message));
                }
                events
            }
        }
    }

    /// Report the state of a document to the host.
    ///
    /// `content` is the editor's copy, or `None` if it has none. The report is
    /// skipped if it repeats the previous one.
    pub fn checksum(&mut self, document: &DocumentId, content: Option<&str>) -> Vec<SessionEvent> {
        let Some(doc) = self.documents.get(document) else {
            return Vec::new();
        };
        let record = match (doc.state, content) {
            (DocumentState::Active, Some(content)) => Checksum::new(
                document.clone(),
                self.local.clone(),
                Some(content),
                Some(doc.client.timestamp()),
            ),
            _ => Checksum::missing(document.clone(), self.local.clone()),
        };
        let generation = doc.generation;

        match self.reporter.report(record) {
            Some(checksum) => vec![self.transmit(Message::Checksum {
                generation,
                checksum,
            })],
            None => Vec::new(),
        }
    }

    /// Periodic work: retransmit requests for stale gaps.
    pub fn tick(&mut self, now_ms: u64) -> Vec<SessionEvent> {
        self.sequencer
            .poll_gaps(now_ms)
            .into_iter()
            .map(|(to, request)| SessionEvent::Transmit {
                to,
                packet: Packet::Retransmit(request),
            })
            .collect()
    }

    /// Mark a document broken after the editor failed to apply an operation.
    pub fn document_failed(&mut self, document: &DocumentId, reason: String) -> Vec<SessionEvent> {
        self.break_document(document, reason)
    }

    fn handle_message(&mut self, message: Message) -> Vec<SessionEvent> {
        match message {
            Message::EditRequest {
                session,
                generation,
                request,
            } => {
                if session != self.session {
                    warn!(%session, "edit for another session dropped");
                    return Vec::new();
                }
                self.handle_edit(generation, request)
            }
            Message::ResyncSnapshot {
                document,
                content,
                reset_timestamp,
                generation,
            } => self.apply_snapshot(document, content, reset_timestamp, generation),
            Message::Checksum { checksum, .. } => {
                warn!(document = %checksum.document, "checksum from host dropped");
                Vec::new()
            }
            Message::ResyncComplete { document, .. } => {
                warn!(%document, "resync confirmation from host dropped");
                Vec::new()
            }
        }
    }

    fn handle_edit(&mut self, generation: u32, request: Request) -> Vec<SessionEvent> {
        let document = request.document.clone();
        let Some(doc) = self.documents.get_mut(&document) else {
            warn!(%document, "edit for unknown document dropped");
            return Vec::new();
        };
        if doc.state != DocumentState::Active {
            debug!(%document, state = ?doc.state, "edit for inactive document dropped");
            return Vec::new();
        }
        if generation != doc.generation {
            debug!(%document, generation, current = doc.generation, "edit from another generation dropped");
            return Vec::new();
        }

        let mut events = Vec::new();
        let mut next = match doc.client.receive_remote(request) {
            Ok(ready) => ready.map(Ok),
            Err(e) => Some(Err(e)),
        };
        let mut failure: Option<JupiterError> = None;
        while let Some(result) = next {
            match result {
                Ok(ready) => events.push(SessionEvent::OperationReady {
                    document: document.clone(),
                    operation: ready.operation,
                }),
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
            next = doc.client.next_ready();
        }

        if let Some(e) = failure {
            events.extend(self.break_document(&document, e.to_string()));
        }
        events
    }

    fn apply_snapshot(
        &mut self,
        document: DocumentId,
        content: String,
        reset_timestamp: Timestamp,
        generation: u32,
    ) -> Vec<SessionEvent> {
        self.expect_document(document.clone());
        let Some(doc) = self.documents.get_mut(&document) else {
            return Vec::new();
        };
        if generation < doc.generation {
            debug!(%document, generation, current = doc.generation, "stale snapshot dropped");
            return Vec::new();
        }

        doc.client.reset_to(reset_timestamp.mirrored());
        doc.generation = generation;
        doc.state = DocumentState::Active;
        self.reporter.forget(&document);
        info!(%document, generation, "snapshot applied");

        let confirm = self.transmit(Message::ResyncComplete {
            document: document.clone(),
            generation,
        });
        vec![
            SessionEvent::SnapshotApplied {
                document: document.clone(),
                content,
            },
            confirm,
            SessionEvent::ResyncComplete {
                document,
                peer: self.host.clone(),
            },
        ]
    }

    fn break_document(&mut self, document: &DocumentId, reason: String) -> Vec<SessionEvent> {
        let Some(doc) = self.documents.get_mut(document) else {
            return Vec::new();
        };
        if doc.state == DocumentState::Broken {
            return Vec::new();
        }
        error!(%document, %reason, "document broken, awaiting resync");
        doc.state = DocumentState::Broken;

        let mut events = vec![SessionEvent::DocumentBroken {
            document: document.clone(),
            reason,
        }];
        events.extend(self.checksum(document, None));
        events
    }

    fn transmit(&mut self, message: Message) -> SessionEvent {
        let envelope = self.sequencer.send(&self.host, message);
        SessionEvent::Transmit {
            to: self.host.clone(),
            packet: Packet::Sequenced(envelope),
        }
    }
}
