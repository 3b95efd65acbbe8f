//! The wire envelope carried by forwarding transports.

use serde::{Deserialize, Serialize};

use crate::error::{BallotError, ProtocolErrorKind};
use crate::vote::Vote;

/// Message kind for a forwarded vote. The envelope carries an explicit kind
/// so the channel can grow other message types without breaking old sinks.
pub const VOTE_FORWARD_KIND: &str = "voteForward";

/// Envelope carrying one serialized vote across a forwarding transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardingMessage {
    pub kind: String,
    pub vote: Vote,
}

impl ForwardingMessage {
    /// Wrap a vote for forwarding.
    pub fn vote(vote: Vote) -> Self {
        Self {
            kind: VOTE_FORWARD_KIND.to_string(),
            vote,
        }
    }

    /// Serialize for the transport.
    pub fn to_bytes(&self) -> Result<Vec<u8>, BallotError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Deserialize an inbound transport payload, rejecting unknown kinds.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, BallotError> {
        let message: ForwardingMessage =
            serde_json::from_slice(bytes).map_err(|e| BallotError::Protocol {
                kind: ProtocolErrorKind::InvalidMessageFormat {
                    message: format!("invalid forwarding message: {}", e),
                },
            })?;

        if message.kind != VOTE_FORWARD_KIND {
            return Err(BallotError::Protocol {
                kind: ProtocolErrorKind::InvalidMessageFormat {
                    message: format!("unknown forwarding message kind '{}'", message.kind),
                },
            });
        }

        Ok(message)
    }
}
