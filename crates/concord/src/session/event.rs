use crate::ids::{DocumentId, ParticipantId};
use crate::message::Packet;
use crate::watchdog::InconsistencyReason;
use text_ot::Operation;

/// Something a session call produced for the outside world.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionEvent {
    /// Hand `packet` to the transport for `to`.
    Transmit { to: ParticipantId, packet: Packet },

    /// A remote operation, transformed and ready for the local editor.
    OperationReady {
        document: DocumentId,
        operation: Operation,
    },

    /// The local copy of `document` must be replaced by `content`.
    SnapshotApplied { document: DocumentId, content: String },

    /// The host found a (document, peer) pair diverged and started a resync.
    InconsistencyDetected {
        document: DocumentId,
        peer: ParticipantId,
        reason: InconsistencyReason,
    },

    /// A resync of the (document, peer) pair finished.
    ResyncComplete {
        document: DocumentId,
        peer: ParticipantId,
    },

    /// The local copy can no longer be trusted; edits are refused until the
    /// host sends a snapshot.
    DocumentBroken { document: DocumentId, reason: String },
}

impl SessionEvent {
    pub fn is_transmit(&self) -> bool {
        matches!(self, SessionEvent::Transmit { .. })
    }
}
