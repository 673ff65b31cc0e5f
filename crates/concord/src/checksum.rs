//! Content checksums exchanged by the consistency watchdog.

use crate::clock::Timestamp;
use crate::ids::{DocumentId, ParticipantId};
use serde::{Deserialize, Serialize};
use text_ot::char_len;

/// Length reported for a document the reporting site does not have.
pub const MISSING_LENGTH: i64 = -1;

/// Hash and length of a document's content.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentDigest {
    pub hash: u64,
    /// Length in characters, or [`MISSING_LENGTH`].
    pub length: i64,
}

impl ContentDigest {
    pub const MISSING: ContentDigest = ContentDigest {
        hash: 0,
        length: MISSING_LENGTH,
    };

    pub fn is_missing(&self) -> bool {
        self.length == MISSING_LENGTH
    }
}

/// Digest `content`: the first 8 bytes of its blake3 hash, little-endian, and
/// its length in characters.
pub fn digest(content: &str) -> ContentDigest {
    let hash = blake3::hash(content.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&hash.as_bytes()[..8]);
    ContentDigest {
        hash: u64::from_le_bytes(prefix),
        length: char_len(content) as i64,
    }
}

/// A site's claim about its copy of a document.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checksum {
    pub document: DocumentId,
    pub sender: ParticipantId,
    pub hash: u64,
    pub length: i64,
    /// The sender's vector time for the document when the digest was taken.
    pub timestamp: Option<Timestamp>,
}

impl Checksum {
    /// Build a record from the reporting site's content, or a missing record
    /// if it has none.
    pub fn new(
        document: DocumentId,
        sender: ParticipantId,
        content: Option<&str>,
        timestamp: Option<Timestamp>,
    ) -> Self {
        match content {
            Some(content) => Self::from_digest(document, sender, digest(content), timestamp),
            None => Self::missing(document, sender),
        }
    }

    pub fn from_digest(
        document: DocumentId,
        sender: ParticipantId,
        digest: ContentDigest,
        timestamp: Option<Timestamp>,
    ) -> Self {
        Self {
            document,
            sender,
            hash: digest.hash,
            length: digest.length,
            timestamp,
        }
    }

    /// A record saying the sender has no copy of the document.
    pub fn missing(document: DocumentId, sender: ParticipantId) -> Self {
        Self::from_digest(document, sender, ContentDigest::MISSING, None)
    }

    pub fn digest(&self) -> ContentDigest {
        ContentDigest {
            hash: self.hash,
            length: self.length,
        }
    }

    pub fn is_missing(&self) -> bool {
        self.length == MISSING_LENGTH
    }
}
