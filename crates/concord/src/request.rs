//! Timestamped operations exchanged by the consistency protocol.

use crate::clock::Timestamp;
use crate::ids::{DocumentId, ParticipantId};
use serde::{Deserialize, Serialize};
use text_ot::Operation;

/// An operation plus the routing data the consistency protocol needs.
///
/// Requests are values: rewriting the operation or the timestamp produces a
/// new request rather than changing one already handed out.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    /// The participant whose edit this is. Relays keep the original author.
    pub origin: ParticipantId,
    pub document: DocumentId,
    pub timestamp: Timestamp,
    pub operation: Operation,
}

impl Request {
    pub fn new(
        origin: ParticipantId,
        document: DocumentId,
        timestamp: Timestamp,
        operation: Operation,
    ) -> Self {
        Self {
            origin,
            document,
            timestamp,
            operation,
        }
    }

    /// The same request carrying a different operation.
    pub fn with_operation(&self, operation: Operation) -> Self {
        Self {
            operation,
            ..self.clone()
        }
    }

    /// The same request carrying a different timestamp.
    pub fn with_timestamp(&self, timestamp: Timestamp) -> Self {
        Self {
            timestamp,
            ..self.clone()
        }
    }
}
