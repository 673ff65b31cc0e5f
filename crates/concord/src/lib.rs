//! Consistency control for collaborative plain-text editing.
//!
//! Sites edit optimistically and exchange operations through a single host,
//! which arbitrates a total order per document:
//!
//! - `jupiter`: the Jupiter protocol, a client per (document, peer) pair and
//!   a per-document server holding one client per participant
//! - `sequencer`: per-stream sequence numbers, gap buffering and retransmission
//! - `checksum` / `watchdog`: periodic content audits and resynchronization
//! - `session`: host and participant state machines tying the above together
//! - `runtime`: a tokio task driving a session against an editor and transport
//!
//! The operation algebra itself lives in the `text_ot` crate.

pub mod checksum;
pub mod clock;
pub mod config;
pub mod error;
pub mod ids;
pub mod jupiter;
pub mod message;
pub mod request;
pub mod runtime;
pub mod sequencer;
pub mod session;
pub mod watchdog;

pub use checksum::{digest, Checksum, ContentDigest, MISSING_LENGTH};
pub use clock::Timestamp;
pub use config::{CollabConfig, ConfigError, JupiterConfig, SequencerConfig, WatchdogConfig};
pub use error::{CollabError, CollabResult};
pub use ids::{DocumentId, ParticipantId, SessionId};
pub use jupiter::{JupiterClient, JupiterError, JupiterServer};
pub use message::{CodecError, Message, Packet};
pub use request::Request;
pub use runtime::{spawn_session, Editor, MemoryEditor, SessionCore, SessionHandle, Transport};
pub use sequencer::{ActivitySequencer, Envelope, LostRange, Retransmission, RetransmitRequest};
pub use session::{DocumentState, HostSession, ParticipantSession, SessionError, SessionEvent};
pub use watchdog::{ChecksumReporter, ConsistencyWatchdog, Inconsistency, InconsistencyReason, Verdict};

pub use text_ot::{Operation, OtError};
