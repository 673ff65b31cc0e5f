//! Host and participant session state machines.
//!
//! A session ties the protocol pieces together for one site: the activity
//! sequencer beneath, a Jupiter pair per shared document above it, and the
//! consistency watchdog alongside. Sessions do no I/O. Every call returns the
//! [`SessionEvent`]s it produced, including the packets to transmit, and
//! time is passed in by the caller.

pub mod event;
pub mod host;
pub mod participant;

pub use event::SessionEvent;
pub use host::HostSession;
pub use participant::{DocumentState, ParticipantSession};

use crate::ids::{DocumentId, ParticipantId};
use crate::jupiter::JupiterError;
use crate::message::{Message, Packet};
use crate::sequencer::Retransmission;
use thiserror::Error;

/// Errors returned to local callers of a session.
///
/// Problems with remote input are never returned; they are handled inside
/// the session and surface as events.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("unknown document: {0}")]
    UnknownDocument(DocumentId),

    #[error("document already shared: {0}")]
    AlreadyShared(DocumentId),

    #[error("unknown participant: {0}")]
    UnknownParticipant(ParticipantId),

    #[error("document not yet received: {0}")]
    DocumentMissing(DocumentId),

    #[error("document is broken and awaiting resync: {0}")]
    DocumentBroken(DocumentId),

    #[error(transparent)]
    Jupiter(#[from] JupiterError),
}

/// Transmit events for a retransmission, lost-range notice first.
fn retransmission_events(to: &ParticipantId, resent: Retransmission<Message>) -> Vec<SessionEvent> {
    let notice = resent.lost.map(Packet::Lost);
    notice
        .into_iter()
        .chain(resent.envelopes.into_iter().map(Packet::Sequenced))
        .map(|packet| SessionEvent::Transmit {
            to: to.clone(),
            packet,
        })
        .collect()
}
