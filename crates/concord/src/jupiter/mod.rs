//! Jupiter consistency protocol.
//!
//! Every (document, peer) pair runs a two-site protocol: each side keeps a
//! [`Timestamp`](crate::clock::Timestamp) and the history of operations it
//! sent that the other side has not acknowledged yet. The host runs one
//! [`JupiterClient`] per participant inside a [`JupiterServer`] and relays
//! every operation it accepts to all other participants, so participants
//! never transform against each other directly.

pub mod client;
pub mod server;

pub use client::JupiterClient;
pub use server::{Applied, Delivery, JupiterServer, Relay};

use crate::ids::ParticipantId;
use text_ot::OtError;
use thiserror::Error;

/// Protocol violations detected while integrating a remote request.
///
/// None of these are retried: the affected (document, peer) pair has to be
/// resynchronized from a full snapshot.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JupiterError {
    /// The request claims a position in the sender's stream that was already
    /// integrated.
    #[error("causality violation: expected request {expected_local} from peer, got {got_local}")]
    CausalityViolation { expected_local: u64, got_local: u64 },

    /// The request acknowledges operations this site never sent.
    #[error("request acknowledges {remote} operations but only {local} were sent")]
    AcknowledgesUnsent { remote: u64, local: u64 },

    /// The request acknowledges fewer operations than an earlier request did.
    #[error("request acknowledges {remote} operations, below the {oldest} already acknowledged")]
    AlreadyAcknowledged { remote: u64, oldest: u64 },

    /// Too many out-of-order requests are waiting for their predecessors.
    #[error("more than {limit} requests are waiting for predecessors")]
    PendingOverflow { limit: usize },

    /// The request names a participant with no state for this document.
    #[error("unknown participant: {0}")]
    UnknownParticipant(ParticipantId),

    /// A transformed operation does not fit the materialized document.
    #[error("operation does not apply: {0}")]
    Transform(#[from] OtError),
}
