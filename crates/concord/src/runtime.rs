//! Tokio runtime for a session.
//!
//! [`spawn_session`] moves a session and its editor into one task. Everything
//! that touches them, whether local edits, delivered packets, timer ticks or
//! checksum audits, is serialized through that task's command channel, so the
//! transform-and-append steps of the protocol never interleave.
//!
//! Local edits are expressed as closures that build the operation from the
//! editor's current content inside the task. An edit computed from a stale
//! view of the document can therefore never reach the protocol.

use crate::config::CollabConfig;
use crate::error::{CollabError, CollabResult};
use crate::ids::{DocumentId, ParticipantId};
use crate::message::Packet;
use crate::session::{HostSession, ParticipantSession, SessionError, SessionEvent};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use text_ot::{Operation, OtError};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, warn};

/// The local copy of every document, as the editor holds it.
pub trait Editor: Send + 'static {
    fn content(&self, document: &DocumentId) -> Option<String>;

    fn apply(&mut self, document: &DocumentId, operation: &Operation) -> Result<(), OtError>;

    /// Replace a document wholesale, creating it if needed.
    fn replace(&mut self, document: &DocumentId, content: String);
}

/// Fire-and-forget packet delivery to a peer.
pub trait Transport: Send + Sync + 'static {
    fn send(&self, to: &ParticipantId, packet: Packet);
}

/// The calls the runtime makes on a host or participant session.
pub trait SessionCore: Send + 'static {
    fn local_edit(
        &mut self,
        document: &DocumentId,
        operation: Operation,
    ) -> Result<Vec<SessionEvent>, SessionError>;

    fn receive(&mut self, from: &ParticipantId, packet: Packet, now_ms: u64) -> Vec<SessionEvent>;

    fn tick(&mut self, now_ms: u64) -> Vec<SessionEvent>;

    /// Compare the editor's copies against the session's view.
    fn audit(&mut self, editor: &dyn Editor) -> Vec<SessionEvent>;

    /// The editor could not apply an operation the session produced.
    fn document_failed(&mut self, document: &DocumentId, error: OtError) -> Vec<SessionEvent>;
}

impl SessionCore for HostSession {
    fn local_edit(
        &mut self,
        document: &DocumentId,
        operation: Operation,
    ) -> Result<Vec<SessionEvent>, SessionError> {
        HostSession::local_edit(self, document, operation)
    }

    fn receive(&mut self, from: &ParticipantId, packet: Packet, now_ms: u64) -> Vec<SessionEvent> {
        HostSession::receive(self, from, packet, now_ms)
    }

    fn tick(&mut self, now_ms: u64) -> Vec<SessionEvent> {
        HostSession::tick(self, now_ms)
    }

    /// The host's materialized copy is authoritative; an editor that drifted
    /// from it is overwritten.
    fn audit(&mut self, editor: &dyn Editor) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        for document in self.documents() {
            let Some(content) = self.content(document) else {
                continue;
            };
            if editor.content(document).as_deref() != Some(content) {
                warn!(%document, "host editor drifted from session copy, restoring");
                events.push(SessionEvent::SnapshotApplied {
                    document: document.clone(),
                    content: content.to_owned(),
                });
            }
        }
        events
    }

    fn document_failed(&mut self, document: &DocumentId, error: OtError) -> Vec<SessionEvent> {
        error!(%document, %error, "host editor rejected an operation, restoring");
        self.content(document)
            .map(|content| SessionEvent::SnapshotApplied {
                document: document.clone(),
                content: content.to_owned(),
            })
            .into_iter()
            .collect()
    }
}

impl SessionCore for ParticipantSession {
    fn local_edit(
        &mut self,
        document: &DocumentId,
        operation: Operation,
    ) -> Result<Vec<SessionEvent>, SessionError> {
        ParticipantSession::local_edit(self, document, operation)
    }

    fn receive(&mut self, from: &ParticipantId, packet: Packet, now_ms: u64) -> Vec<SessionEvent> {
        ParticipantSession::receive(self, from, packet, now_ms)
    }

    fn tick(&mut self, now_ms: u64) -> Vec<SessionEvent> {
        ParticipantSession::tick(self, now_ms)
    }

    /// Report a checksum for every tracked document.
    fn audit(&mut self, editor: &dyn Editor) -> Vec<SessionEvent> {
        let documents: Vec<_> = self.documents().cloned().collect();
        documents
            .iter()
            .flat_map(|document| {
                let content = editor.content(document);
                self.checksum(document, content.as_deref())
            })
            .collect()
    }

    fn document_failed(&mut self, document: &DocumentId, error: OtError) -> Vec<SessionEvent> {
        ParticipantSession::document_failed(self, document, error.to_string())
    }
}

/// An [`Editor`] keeping documents as plain strings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryEditor {
    documents: BTreeMap<DocumentId, String>,
}

impl MemoryEditor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_document(mut self, document: DocumentId, content: impl Into<String>) -> Self {
        self.documents.insert(document, content.into());
        self
    }

    pub fn get(&self, document: &DocumentId) -> Option<&str> {
        self.documents.get(document).map(String::as_str)
    }
}

impl Editor for MemoryEditor {
    fn content(&self, document: &DocumentId) -> Option<String> {
        self.documents.get(document).cloned()
    }

    fn apply(&mut self, document: &DocumentId, operation: &Operation) -> Result<(), OtError> {
        let current = self.documents.entry(document.clone()).or_default();
        *current = operation.apply(current)?;
        Ok(())
    }

    fn replace(&mut self, document: &DocumentId, content: String) {
        self.documents.insert(document.clone(), content);
    }
}

type EditFn = Box<dyn FnOnce(&str) -> Option<Operation> + Send>;
type ExecFn<S, E> = Box<dyn FnOnce(&mut S, &mut E, u64) -> Vec<SessionEvent> + Send>;

enum Command<S, E> {
    Edit {
        document: DocumentId,
        make: EditFn,
        reply: oneshot::Sender<CollabResult<Option<Operation>>>,
    },
    Deliver {
        from: ParticipantId,
        packet: Packet,
    },
    Exec(ExecFn<S, E>),
    Shutdown,
}

/// Handle for sending commands to a running session.
pub struct SessionHandle<S, E> {
    commands: mpsc::UnboundedSender<Command<S, E>>,
}

impl<S, E> Clone for SessionHandle<S, E> {
    fn clone(&self) -> Self {
        Self {
            commands: self.commands.clone(),
        }
    }
}

impl<S: SessionCore, E: Editor> SessionHandle<S, E> {
    /// Make a local edit.
    ///
    /// `make` receives the document's current content and returns the
    /// operation to apply, or `None` to skip. Returns the operation applied.
    pub async fn edit<F>(&self, document: DocumentId, make: F) -> CollabResult<Option<Operation>>
    where
        F: FnOnce(&str) -> Option<Operation> + Send + 'static,
    {
        let (reply, response) = oneshot::channel();
        self.send(Command::Edit {
            document,
            make: Box::new(make),
            reply,
        })?;
        response.await.map_err(|_| CollabError::RuntimeClosed)?
    }

    /// Hand over a packet received from the transport.
    pub fn deliver(&self, from: ParticipantId, packet: Packet) -> CollabResult<()> {
        self.send(Command::Deliver { from, packet })
    }

    /// Run `f` inside the session task. The events it returns are dispatched
    /// like any others.
    pub fn exec<F>(&self, f: F) -> CollabResult<()>
    where
        F: FnOnce(&mut S, &mut E, u64) -> Vec<SessionEvent> + Send + 'static,
    {
        self.send(Command::Exec(Box::new(f)))
    }

    /// Read from the session and editor inside the session task.
    pub async fn query<R, F>(&self, f: F) -> CollabResult<R>
    where
        F: FnOnce(&S, &E) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (reply, response) = oneshot::channel();
        self.exec(move |session, editor, _| {
            let _ = reply.send(f(&*session, &*editor));
            Vec::new()
        })?;
        response.await.map_err(|_| CollabError::RuntimeClosed)
    }

    /// Ask the session task to stop.
    pub fn shutdown(&self) -> CollabResult<()> {
        self.send(Command::Shutdown)
    }

    fn send(&self, command: Command<S, E>) -> CollabResult<()> {
        self.commands
            .send(command)
            .map_err(|_| CollabError::RuntimeClosed)
    }
}

/// Run `session` and `editor` in a new task.
///
/// Returns the command handle, the stream of events other than transmissions
/// (those go straight to `transport`), and the task handle, which yields the
/// session and editor back once the task stops.
pub fn spawn_session<S: SessionCore, E: Editor>(
    session: S,
    editor: E,
    transport: Arc<dyn Transport>,
    config: &CollabConfig,
) -> (
    SessionHandle<S, E>,
    mpsc::UnboundedReceiver<SessionEvent>,
    JoinHandle<(S, E)>,
) {
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let actor = SessionActor {
        session,
        editor,
        transport,
        events: events_tx,
        started: Instant::now(),
    };
    let tick_every = Duration::from_millis(config.sequencer.tick_interval_ms.max(1));
    let audit_every = Duration::from_millis(config.watchdog.interval_ms.max(1));
    let task = tokio::spawn(actor.run(commands_rx, tick_every, audit_every));
    (
        SessionHandle {
            commands: commands_tx,
        },
        events_rx,
        task,
    )
}

struct SessionActor<S, E> {
    session: S,
    editor: E,
    transport: Arc<dyn Transport>,
    events: mpsc::UnboundedSender<SessionEvent>,
    started: Instant,
}

impl<S: SessionCore, E: Editor> SessionActor<S, E> {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command<S, E>>,
        tick_every: Duration,
        audit_every: Duration,
    ) -> (S, E) {
        let mut ticks = interval(tick_every);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut audits = interval(audit_every);
        audits.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(Command::Edit { document, make, reply }) => {
                        let result = self.local_edit(&document, make);
                        let _ = reply.send(result);
                    }
                    Some(Command::Deliver { from, packet }) => {
                        let now = self.now_ms();
                        let events = self.session.receive(&from, packet, now);
                        self.dispatch(events);
                    }
                    Some(Command::Exec(f)) => {
                        let now = self.now_ms();
                        let events = f(&mut self.session, &mut self.editor, now);
                        self.dispatch(events);
                    }
                },
                _ = ticks.tick() => {
                    let now = self.now_ms();
                    let events = self.session.tick(now);
                    self.dispatch(events);
                }
                _ = audits.tick() => {
                    let events = self.session.audit(&self.editor);
                    self.dispatch(events);
                }
            }
        }

        debug!("session task stopped");
        (self.session, self.editor)
    }

    fn now_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    fn local_edit(&mut self, document: &DocumentId, make: EditFn) -> CollabResult<Option<Operation>> {
        let content = self
            .editor
            .content(document)
            .ok_or_else(|| SessionError::UnknownDocument(document.clone()))?;
        let Some(operation) = make(&content) else {
            return Ok(None);
        };

        self.editor.apply(document, &operation)?;
        match self.session.local_edit(document, operation.clone()) {
            Ok(events) => {
                self.dispatch(events);
                Ok(Some(operation))
            }
            Err(e) => {
                if let Err(undo) = self.editor.apply(document, &operation.invert()) {
                    error!(%document, error = %undo, "failed to revert rejected edit");
                }
                Err(e.into())
            }
        }
    }

    /// Route events: transmissions to the transport, document changes to the
    /// editor, and everything except transmissions to the event stream.
    fn dispatch(&mut self, events: Vec<SessionEvent>) {
        let mut queue = VecDeque::from(events);
        while let Some(event) = queue.pop_front() {
            if let SessionEvent::Transmit { to, packet } = event {
                self.transport.send(&to, packet);
                continue;
            }

            match &event {
                SessionEvent::OperationReady {
                    document,
                    operation,
                } => {
                    if let Err(e) = self.editor.apply(document, operation) {
                        queue.extend(self.session.document_failed(document, e));
                    }
                }
                SessionEvent::SnapshotApplied { document, content } => {
                    self.editor.replace(document, content.clone());
                }
                _ => {}
            }
            // The receiver may have been dropped; events are advisory.
            let _ = self.events.send(event);
        }
    }
}
