//! Wire messages and their JSON encoding.
//!
//! Every [`Message`] travels inside a sequenced [`Envelope`]. Retransmission
//! requests and lost-range notices travel outside the sequence, so they are
//! never stuck behind the gap they concern.

use crate::checksum::Checksum;
use crate::clock::Timestamp;
use crate::ids::{DocumentId, SessionId};
use crate::request::Request;
use crate::sequencer::{Envelope, LostRange, RetransmitRequest};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while encoding or decoding packets.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("failed to encode packet: {0}")]
    Encode(String),

    #[error("failed to decode packet: {0}")]
    Decode(String),
}

/// A unit of collaboration data.
///
/// `generation` counts resyncs of the (document, peer) pair. A message from an
/// older generation was produced against state a snapshot has since replaced.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Message {
    EditRequest {
        session: SessionId,
        generation: u32,
        request: Request,
    },
    Checksum {
        generation: u32,
        checksum: Checksum,
    },
    /// Full content pushed by the host; replaces the receiver's copy.
    ResyncSnapshot {
        document: DocumentId,
        content: String,
        reset_timestamp: Timestamp,
        generation: u32,
    },
    /// Sent by a participant once it has applied a snapshot.
    ResyncComplete {
        document: DocumentId,
        generation: u32,
    },
}

impl Message {
    /// The document this message concerns.
    pub fn document(&self) -> &DocumentId {
        match self {
            Message::EditRequest { request, .. } => &request.document,
            Message::Checksum { checksum, .. } => &checksum.document,
            Message::ResyncSnapshot { document, .. } | Message::ResyncComplete { document, .. } => {
                document
            }
        }
    }

    pub fn generation(&self) -> u32 {
        match self {
            Message::EditRequest { generation, .. }
            | Message::Checksum { generation, .. }
            | Message::ResyncSnapshot { generation, .. }
            | Message::ResyncComplete { generation, .. } => *generation,
        }
    }
}

/// What actually crosses the transport.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "packet", content = "body", rename_all = "camelCase")]
pub enum Packet {
    Sequenced(Envelope<Message>),
    Retransmit(RetransmitRequest),
    Lost(LostRange),
}

impl Packet {
    pub fn to_json(&self) -> Result<String, CodecError> {
        serde_json::to_string(self).map_err(|e| CodecError::Encode(e.to_string()))
    }

    pub fn from_json(json: &str) -> Result<Self, CodecError> {
        serde_json::from_str(json).map_err(|e| CodecError::Decode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use text_ot::Operation;

    fn edit() -> Message {
        Message::EditRequest {
            session: "s1".into(),
            generation: 2,
            request: Request::new(
                "alice".into(),
                "doc".into(),
                Timestamp::new(1, 0),
                Operation::insert(0, "hi"),
            ),
        }
    }

    #[test]
    fn test_packet_json_round_trip() {
        let packet = Packet::Sequenced(Envelope {
            sender: "alice".into(),
            sequence: 7,
            payload: edit(),
        });
        let json = packet.to_json().unwrap();
        assert_eq!(Packet::from_json(&json).unwrap(), packet);
    }

    #[test]
    fn test_message_tagging() {
        let json = serde_json::to_value(Message::ResyncSnapshot {
            document: "doc".into(),
            content: "abc".into(),
            reset_timestamp: Timestamp::ZERO,
            generation: 1,
        })
        .unwrap();
        assert_eq!(json["type"], "resyncSnapshot");
        assert_eq!(json["resetTimestamp"]["local"], 0);
    }

    #[test]
    fn test_retransmit_packet_shape() {
        let packet = Packet::Retransmit(RetransmitRequest {
            sender: "bob".into(),
            from_seq: 3,
            to_seq: 5,
        });
        let json: serde_json::Value = serde_json::from_str(&packet.to_json().unwrap()).unwrap();
        assert_eq!(json["packet"], "retransmit");
        assert_eq!(json["body"]["fromSeq"], 3);
    }

    #[test]
    fn test_accessors() {
        let message = edit();
        assert_eq!(message.document(), &DocumentId::from("doc"));
        assert_eq!(message.generation(), 2);
    }

    #[test]
    fn test_garbage_is_a_decode_error() {
        assert!(matches!(
            Packet::from_json("{\"packet\":\"nope\"}"),
            Err(CodecError::Decode(_))
        ));
    }
}
