//! Host-side arbitration for one shared document.

use super::{JupiterClient, JupiterError};
use crate::clock::Timestamp;
use crate::ids::{DocumentId, ParticipantId};
use crate::request::Request;
use std::collections::BTreeMap;
use text_ot::Operation;
use tracing::{debug, info};

/// A request the server originated toward one participant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relay {
    pub to: ParticipantId,
    pub request: Request,
}

/// One operation accepted into the document's total order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Applied {
    pub origin: ParticipantId,
    /// The operation as applied to the server's copy of the document.
    pub operation: Operation,
    /// The same operation, stamped for each other participant.
    pub relays: Vec<Relay>,
}

/// Result of feeding one request from a participant to the server.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Delivery {
    /// Operations accepted, in order. A single request can release parked
    /// predecessors, so there may be more than one.
    pub applied: Vec<Applied>,
    /// Set if the participant's stream hit a protocol violation. Operations
    /// accepted before the violation stay in `applied`.
    pub failure: Option<JupiterError>,
}

/// The arbitration authority for one shared document.
///
/// Holds a [`JupiterClient`] per participant, acting as that participant's
/// peer. Every accepted operation is applied to the server's own copy of the
/// document and pushed through every other participant's client, which
/// stamps it as a new request from the server.
#[derive(Debug, Clone)]
pub struct JupiterServer {
    document: DocumentId,
    host: ParticipantId,
    content: String,
    proxies: BTreeMap<ParticipantId, JupiterClient>,
    operations: u64,
    max_pending: usize,
}

impl JupiterServer {
    pub fn new(
        document: DocumentId,
        host: ParticipantId,
        content: impl Into<String>,
        max_pending: usize,
    ) -> Self {
        Self {
            document,
            host,
            content: content.into(),
            proxies: BTreeMap::new(),
            operations: 0,
            max_pending,
        }
    }

    pub fn document(&self) -> &DocumentId {
        &self.document
    }

    /// The server's materialized copy of the document.
    pub fn content(&self) -> &str {
        &self.content
    }

    /// Number of operations accepted into the total order.
    pub fn operation_count(&self) -> u64 {
        self.operations
    }

    pub fn participants(&self) -> impl Iterator<Item = &ParticipantId> {
        self.proxies.keys()
    }

    pub fn timestamp_of(&self, peer: &ParticipantId) -> Option<Timestamp> {
        self.proxies.get(peer).map(JupiterClient::timestamp)
    }

    /// Start tracking a participant at `(0,0)`.
    ///
    /// The participant must start from a snapshot of [`content`](Self::content)
    /// taken now. An existing entry is reset.
    pub fn add_participant(&mut self, peer: ParticipantId) {
        info!(document = %self.document, %peer, "participant added to document");
        self.proxies
            .insert(peer, JupiterClient::new(self.document.clone(), self.max_pending));
    }

    /// Drop a participant and its unacknowledged history.
    pub fn remove_participant(&mut self, peer: &ParticipantId) -> bool {
        let removed = self.proxies.remove(peer).is_some();
        if removed {
            info!(document = %self.document, %peer, "participant removed from document");
        }
        removed
    }

    /// Reset a participant's pair to `(0,0)` ahead of a snapshot.
    pub fn reset_participant(&mut self, peer: &ParticipantId) -> Result<(), JupiterError> {
        let proxy = self
            .proxies
            .get_mut(peer)
            .ok_or_else(|| JupiterError::UnknownParticipant(peer.clone()))?;
        proxy.reset();
        Ok(())
    }

    /// Feed a request received from `from`.
    ///
    /// # Errors
    ///
    /// Only [`JupiterError::UnknownParticipant`] is returned as an error.
    /// Protocol violations on a known participant's stream are reported in
    /// [`Delivery::failure`].
    pub fn receive(&mut self, from: &ParticipantId, request: Request) -> Result<Delivery, JupiterError> {
        let proxy = self
            .proxies
            .get_mut(from)
            .ok_or_else(|| JupiterError::UnknownParticipant(from.clone()))?;

        let mut delivery = Delivery::default();
        let first = match proxy.receive_remote(request) {
            Ok(ready) => ready,
            Err(e) => {
                delivery.failure = Some(e);
                return Ok(delivery);
            }
        };

        let mut next = first.map(Ok);
        while let Some(result) = next {
            match result.and_then(|ready| self.commit(ready.origin, ready.operation)) {
                Ok(applied) => delivery.applied.push(applied),
                Err(e) => {
                    delivery.failure = Some(e);
                    break;
                }
            }
            next = self.proxies.get_mut(from).and_then(JupiterClient::next_ready);
        }
        Ok(delivery)
    }

    /// Accept an edit made on the host's own copy of the document.
    pub fn generate_local(&mut self, operation: Operation) -> Result<Applied, JupiterError> {
        let host = self.host.clone();
        self.commit(host, operation)
    }

    fn commit(&mut self, origin: ParticipantId, operation: Operation) -> Result<Applied, JupiterError> {
        self.content = operation.apply(&self.content)?;
        self.operations += 1;

        let relays = self
            .proxies
            .iter_mut()
            .filter(|(peer, _)| **peer != origin)
            .map(|(peer, proxy)| Relay {
                to: peer.clone(),
                request: proxy.generate_local(origin.clone(), operation.clone()),
            })
            .collect();

        debug!(
            document = %self.document,
            %origin,
            operations = self.operations,
            "operation committed"
        );
        Ok(Applied {
            origin,
            operation,
            relays,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server(content: &str) -> JupiterServer {
        let mut server = JupiterServer::new("doc".into(), "host".into(), content, 16);
        server.add_participant("alice".into());
        server.add_participant("bob".into());
        server
    }

    #[test]
    fn test_relays_to_everyone_but_origin() {
        let mut s = server("");
        let request = Request::new("alice".into(), "doc".into(), Timestamp::ZERO, Operation::insert(0, "hi"));
        let delivery = s.receive(&"alice".into(), request).unwrap();

        assert!(delivery.failure.is_none());
        assert_eq!(delivery.applied.len(), 1);
        let relays = &delivery.applied[0].relays;
        assert_eq!(relays.len(), 1);
        assert_eq!(relays[0].to, ParticipantId::from("bob"));
        assert_eq!(relays[0].request.origin, ParticipantId::from("alice"));
        assert_eq!(relays[0].request.timestamp, Timestamp::ZERO);

        assert_eq!(s.content(), "hi");
        assert_eq!(s.timestamp_of(&"alice".into()), Some(Timestamp::new(0, 1)));
        assert_eq!(s.timestamp_of(&"bob".into()), Some(Timestamp::new(1, 0)));
    }

    #[test]
    fn test_host_edit_relays_to_all() {
        let mut s = server("abc");
        let applied = s.generate_local(Operation::delete(0, "a")).unwrap();
        assert_eq!(applied.relays.len(), 2);
        assert_eq!(s.content(), "bc");
        assert_eq!(s.operation_count(), 1);
    }

    #[test]
    fn test_concurrent_requests_are_transformed() {
        let mut s = server("0123456789");
        let del = Request::new("alice".into(), "doc".into(), Timestamp::ZERO, Operation::delete(2, "234"));
        let ins = Request::new("bob".into(), "doc".into(), Timestamp::ZERO, Operation::insert(3, "X"));

        s.receive(&"alice".into(), del).unwrap();
        let delivery = s.receive(&"bob".into(), ins).unwrap();
        assert_eq!(delivery.applied[0].operation, Operation::insert(2, "X"));
        assert_eq!(s.content(), "01X56789");
    }

    #[test]
    fn test_empty_insert_after_concurrent_wipe() {
        let mut s = server("abcde");
        s.generate_local(Operation::delete(0, "abcde")).unwrap();
        let request = Request::new("alice".into(), "doc".into(), Timestamp::ZERO, Operation::insert(5, ""));
        let delivery = s.receive(&"alice".into(), request).unwrap();

        assert!(delivery.failure.is_none());
        assert_eq!(delivery.applied[0].operation, Operation::insert(0, ""));
        assert_eq!(s.content(), "");
        assert_eq!(s.timestamp_of(&"alice".into()), Some(Timestamp::new(1, 1)));
    }

    #[test]
    fn test_unknown_participant() {
        let mut s = server("");
        let request = Request::new("mallory".into(), "doc".into(), Timestamp::ZERO, Operation::NoOp);
        assert_eq!(
            s.receive(&"mallory".into(), request).unwrap_err(),
            JupiterError::UnknownParticipant("mallory".into())
        );
    }

    #[test]
    fn test_bad_operation_is_reported_as_failure() {
        let mut s = server("ab");
        let request = Request::new("alice".into(), "doc".into(), Timestamp::ZERO, Operation::delete(0, "zz"));
        let delivery = s.receive(&"alice".into(), request).unwrap();
        assert!(delivery.applied.is_empty());
        assert!(matches!(delivery.failure, Some(JupiterError::Transform(_))));
        assert_eq!(s.content(), "ab");
    }

    #[test]
    fn test_removed_participant_gets_no_relays() {
        let mut s = server("");
        assert!(s.remove_participant(&"bob".into()));
        let applied = s.generate_local(Operation::insert(0, "x")).unwrap();
        assert_eq!(applied.relays.len(), 1);
        assert_eq!(s.participants().count(), 1);
    }
}
