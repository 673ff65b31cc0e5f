//! In-memory network of one host and several participants.
//!
//! Packets wait in `in_flight` until a test delivers them, in any order it
//! likes. Editors are plain strings updated from session events exactly as the
//! runtime would update them.

#![allow(dead_code)]

use concord::{
    CollabConfig, DocumentId, Editor, Envelope, HostSession, MemoryEditor, Message, Operation,
    Packet, ParticipantId, ParticipantSession, SessionEvent,
};
use std::collections::{BTreeMap, HashMap};

pub const HOST: &str = "host";

pub struct InFlight {
    pub from: ParticipantId,
    pub to: ParticipantId,
    pub packet: Packet,
}

pub struct Network {
    pub host: HostSession,
    pub host_editor: MemoryEditor,
    pub participants: BTreeMap<ParticipantId, (ParticipantSession, MemoryEditor)>,
    pub in_flight: Vec<InFlight>,
    /// Every event other than transmissions, with the site that produced it.
    pub log: Vec<(ParticipantId, SessionEvent)>,
    /// Highest sequence number sent on each (from, to) stream.
    pub last_seq: HashMap<(ParticipantId, ParticipantId), u64>,
    pub config: CollabConfig,
    pub now_ms: u64,
}

impl Network {
    pub fn new() -> Self {
        Self::with_config(CollabConfig::default())
    }

    pub fn with_config(config: CollabConfig) -> Self {
        Self {
            host: HostSession::new("session".into(), HOST.into(), config.clone()),
            host_editor: MemoryEditor::new(),
            participants: BTreeMap::new(),
            in_flight: Vec::new(),
            log: Vec::new(),
            last_seq: HashMap::new(),
            config,
            now_ms: 0,
        }
    }

    pub fn share(&mut self, document: &str, content: &str) {
        let doc = DocumentId::from(document);
        self.host_editor.replace(&doc, content.to_string());
        let events = self.host.share_document(doc, content, self.now_ms).unwrap();
        self.route_host(events);
    }

    pub fn unshare(&mut self, document: &str) {
        self.host.unshare_document(&DocumentId::from(document)).unwrap();
    }

    pub fn join(&mut self, peer: &str) {
        let id = ParticipantId::from(peer);
        let session = ParticipantSession::new(
            "session".into(),
            id.clone(),
            HOST.into(),
            self.config.clone(),
        );
        self.participants
            .insert(id.clone(), (session, MemoryEditor::new()));
        let events = self.host.add_participant(id, self.now_ms);
        self.route_host(events);
    }

    pub fn host_edit(&mut self, document: &str, make: impl FnOnce(&str) -> Operation) {
        let doc = DocumentId::from(document);
        let op = make(self.host_editor.get(&doc).unwrap());
        self.host_editor.apply(&doc, &op).unwrap();
        let events = self.host.local_edit(&doc, op).unwrap();
        self.route_host(events);
    }

    pub fn edit(&mut self, peer: &str, document: &str, make: impl FnOnce(&str) -> Operation) {
        let id = ParticipantId::from(peer);
        let doc = DocumentId::from(document);
        let (session, editor) = self.participants.get_mut(&id).unwrap();
        let op = make(editor.get(&doc).unwrap());
        editor.apply(&doc, &op).unwrap();
        let events = session.local_edit(&doc, op).unwrap();
        self.route_participant(&id, events);
    }

    /// Report checksums for every document a participant tracks.
    pub fn audit(&mut self, peer: &str) {
        let id = ParticipantId::from(peer);
        let (session, editor) = self.participants.get_mut(&id).unwrap();
        let documents: Vec<_> = session.documents().cloned().collect();
        let mut events = Vec::new();
        for doc in documents {
            events.extend(session.checksum(&doc, editor.get(&doc)));
        }
        self.route_participant(&id, events);
    }

    pub fn tick(&mut self, now_ms: u64) {
        self.now_ms = now_ms;
        let events = self.host.tick(now_ms);
        self.route_host(events);
        let ids: Vec<_> = self.participants.keys().cloned().collect();
        for id in ids {
            let (session, _) = self.participants.get_mut(&id).unwrap();
            let events = session.tick(now_ms);
            self.route_participant(&id, events);
        }
    }

    pub fn deliver(&mut self, index: usize) {
        let InFlight { from, to, packet } = self.in_flight.remove(index);
        self.inject(&from, &to, packet);
    }

    /// Deliver a packet that did not come from `in_flight`.
    pub fn inject(&mut self, from: &ParticipantId, to: &ParticipantId, packet: Packet) {
        if to.as_str() == HOST {
            let events = self.host.receive(from, packet, self.now_ms);
            self.route_host(events);
        } else if let Some((session, _)) = self.participants.get_mut(to) {
            let events = session.receive(from, packet, self.now_ms);
            self.route_participant(to, events);
        }
    }

    pub fn deliver_all(&mut self) {
        while !self.in_flight.is_empty() {
            self.deliver(0);
        }
    }

    /// Deliver everything, picking the next packet from `choices`.
    pub fn deliver_all_shuffled(&mut self, choices: &[usize]) {
        let mut i = 0;
        while !self.in_flight.is_empty() {
            let pick = choices.get(i).copied().unwrap_or(0) % self.in_flight.len();
            self.deliver(pick);
            i += 1;
        }
    }

    pub fn content(&self, peer: &str, document: &str) -> Option<String> {
        let doc = DocumentId::from(document);
        if peer == HOST {
            return self.host_editor.get(&doc).map(str::to_string);
        }
        let (_, editor) = self.participants.get(&ParticipantId::from(peer))?;
        editor.get(&doc).map(str::to_string)
    }

    /// Every editor's copy of `document`, host first.
    pub fn all_contents(&self, document: &str) -> Vec<Option<String>> {
        let mut contents = vec![self.content(HOST, document)];
        for id in self.participants.keys() {
            contents.push(self.content(id.as_str(), document));
        }
        contents
    }

    pub fn count_events(&self, predicate: impl Fn(&SessionEvent) -> bool) -> usize {
        self.log.iter().filter(|(_, e)| predicate(e)).count()
    }

    pub fn count_in_flight(&self, predicate: impl Fn(&InFlight) -> bool) -> usize {
        self.in_flight.iter().filter(|p| predicate(p)).count()
    }

    /// Rewrite the message carried by an in-flight packet.
    pub fn tamper(&mut self, index: usize, f: impl FnOnce(&mut Message)) {
        if let Packet::Sequenced(envelope) = &mut self.in_flight[index].packet {
            f(&mut envelope.payload);
        }
    }

    /// Build the next sequenced packet on the host → `peer` stream.
    ///
    /// The host's own sequencer does not see it, so the next real packet on
    /// that stream is dropped as a duplicate.
    pub fn forge_from_host(&mut self, peer: &str, message: Message) -> Packet {
        let key = (ParticipantId::from(HOST), ParticipantId::from(peer));
        let seq = self.last_seq.entry(key).or_insert(0);
        *seq += 1;
        Packet::Sequenced(Envelope {
            sender: HOST.into(),
            sequence: *seq,
            payload: message,
        })
    }

    fn route_host(&mut self, events: Vec<SessionEvent>) {
        for event in events {
            match event {
                SessionEvent::Transmit { to, packet } => {
                    self.push(HOST.into(), to, packet);
                }
                other => {
                    match &other {
                        SessionEvent::OperationReady {
                            document,
                            operation,
                        } => self.host_editor.apply(document, operation).unwrap(),
                        SessionEvent::SnapshotApplied { document, content } => {
                            self.host_editor.replace(document, content.clone())
                        }
                        _ => {}
                    }
                    self.log.push((HOST.into(), other));
                }
            }
        }
    }

    fn route_participant(&mut self, id: &ParticipantId, events: Vec<SessionEvent>) {
        let mut queue: std::collections::VecDeque<_> = events.into();
        while let Some(event) = queue.pop_front() {
            match event {
                SessionEvent::Transmit { to, packet } => self.push(id.clone(), to, packet),
                other => {
                    let (session, editor) = self.participants.get_mut(id).unwrap();
                    match &other {
                        SessionEvent::OperationReady {
                            document,
                            operation,
                        } => {
                            if let Err(e) = editor.apply(document, operation) {
                                queue.extend(session.document_failed(document, e.to_string()));
                            }
                        }
                        SessionEvent::SnapshotApplied { document, content } => {
                            editor.replace(document, content.clone())
                        }
                        _ => {}
                    }
                    self.log.push((id.clone(), other));
                }
            }
        }
    }

    fn push(&mut self, from: ParticipantId, to: ParticipantId, packet: Packet) {
        if let Packet::Sequenced(envelope) = &packet {
            let seq = self.last_seq.entry((from.clone(), to.clone())).or_insert(0);
            *seq = (*seq).max(envelope.sequence);
        }
        self.in_flight.push(InFlight { from, to, packet });
    }
}

/// Clamp raw random numbers to a valid edit of `content`.
///
/// A delete with empty `text` removes nothing.
pub fn random_edit(content: &str, insert: bool, pos: usize, len: usize, text: &str) -> Operation {
    let chars = content.chars().count();
    let pos = pos % (chars + 1);
    if !insert && text.is_empty() {
        return Operation::delete(pos, "");
    }
    if insert || chars == 0 || pos == chars {
        Operation::insert(pos, text)
    } else {
        let count = (len % (chars - pos)) + 1;
        let removed: String = content.chars().skip(pos).take(count).collect();
        Operation::delete(pos, removed)
    }
}
