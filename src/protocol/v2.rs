//! Token-authenticated (v2) envelope codec.
//!
//! The client sends one framed JSON envelope naming a voting site, carrying
//! the vote payload as a raw JSON string, and a signature computed as
//! HMAC-SHA256 over `challenge ‖ payload` with the site's shared secret.
//! Keeping the payload as an opaque string means the signature covers the
//! exact bytes the client produced, not a re-serialization.

use ring::hmac;
use serde::{Deserialize, Serialize};

use crate::crypto::TokenStore;
use crate::error::{BallotError, ProtocolErrorKind};
use crate::vote::Vote;

/// The signed envelope sent by a v2 client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct V2Envelope {
    /// Claimed voting site identifier, used to select the verification key.
    pub service: String,
    /// Vote payload as the exact JSON string the signature covers.
    pub payload: String,
    /// Hex-encoded HMAC-SHA256 tag over `challenge ‖ payload`.
    pub signature: String,
}

/// Parse a frame body into an envelope.
pub fn decode_envelope(body: &[u8]) -> Result<V2Envelope, BallotError> {
    serde_json::from_slice(body).map_err(|e| BallotError::Protocol {
        kind: ProtocolErrorKind::InvalidMessageFormat {
            message: format!("invalid envelope JSON: {}", e),
        },
    })
}

/// Verify an envelope's signature against this session's challenge.
///
/// An unknown site and a bad signature are distinct errors locally, but the
/// session layer answers both with the same uniform error frame so a remote
/// peer cannot enumerate which sites are configured.
pub fn verify_envelope(
    envelope: &V2Envelope,
    challenge: &str,
    tokens: &TokenStore,
) -> Result<(), BallotError> {
    let key = tokens.key_for(&envelope.service).ok_or(BallotError::Protocol {
        kind: ProtocolErrorKind::UnknownToken,
    })?;

    let signature = hex::decode(&envelope.signature).map_err(|_| BallotError::Protocol {
        kind: ProtocolErrorKind::SignatureVerification,
    })?;

    let mut message = Vec::with_capacity(challenge.len() + envelope.payload.len());
    message.extend_from_slice(challenge.as_bytes());
    message.extend_from_slice(envelope.payload.as_bytes());

    // ring's verify is constant-time.
    hmac::verify(key, &message, &signature).map_err(|_| BallotError::Protocol {
        kind: ProtocolErrorKind::SignatureVerification,
    })
}

/// Parse the payload of an already-verified envelope into a vote.
///
/// A valid signature only proves origin; the schema can still be wrong,
/// which is a `MalformedVote`.
pub fn parse_payload(envelope: &V2Envelope) -> Result<Vote, BallotError> {
    serde_json::from_str(&envelope.payload).map_err(|e| BallotError::Protocol {
        kind: ProtocolErrorKind::MalformedVote {
            message: format!("invalid vote payload: {}", e),
        },
    })
}

/// Build and sign an envelope. This is the client half of the protocol,
/// used by tests and vote submission tooling.
pub fn sign_envelope(
    service: impl Into<String>,
    payload: impl Into<String>,
    challenge: &str,
    key: &hmac::Key,
) -> V2Envelope {
    let payload = payload.into();

    let mut message = Vec::with_capacity(challenge.len() + payload.len());
    message.extend_from_slice(challenge.as_bytes());
    message.extend_from_slice(payload.as_bytes());
    let tag = hmac::sign(key, &message);

    V2Envelope {
        service: service.into(),
        payload,
        signature: hex::encode(tag.as_ref()),
    }
}

/// The framed acknowledgment body sent after a successfully decoded vote.
pub fn ack_ok() -> &'static [u8] {
    br#"{"status":"ok"}"#
}

/// The uniform error body. Deliberately carries no cause so failures are
/// indistinguishable to the peer; details go to local logs only.
pub fn ack_error() -> &'static [u8] {
    br#"{"status":"error"}"#
}
