//! Wire protocol module.
//!
//! Two structurally different formats are served on the same listening
//! port:
//!
//! - **v1 (legacy)**: greeting line, then one RSA-encrypted block holding a
//!   newline-separated plaintext vote. No reply.
//! - **v2 (token-authenticated)**: challenge in the greeting, then a framed
//!   JSON envelope signed with HMAC-SHA256 over `challenge ‖ payload`,
//!   answered with a framed acknowledgment.
//!
//! Both are one-shot: one vote per connection, then close. The session
//! layer decides which codec applies by peeking at the first client bytes
//! (v2 frames open with a magic the legacy block format never produces).

mod v1;
mod v2;
mod wire;

pub use v1::{decode_v1_block, encode_v1_block};
pub use v2::{ack_error, ack_ok, decode_envelope, parse_payload, sign_envelope, verify_envelope, V2Envelope};
pub use wire::{read_frame_body, write_frame, DEFAULT_MAX_FRAME_SIZE, V2_MAGIC};

use std::net::SocketAddr;

use rand::distributions::Alphanumeric;
use rand::Rng;

use crate::error::BallotError;
use crate::vote::Vote;

/// Protocol marker literal. Appears in the greeting line and as the first
/// field of every v1 plaintext block. Kept for compatibility with deployed
/// voting sites.
pub const PROTOCOL_MARKER: &str = "VOTIFIER";

/// Version string advertised in the greeting line.
pub const PROTOCOL_VERSION_STRING: &str = "2";

/// Length of the per-connection challenge string in characters.
pub const CHALLENGE_LEN: usize = 32;

/// How a vote arrived at the local handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolVersion {
    /// Decoded from a legacy RSA block.
    V1,
    /// Decoded from a token-authenticated v2 envelope.
    V2,
    /// Relayed from another server through the forwarding layer.
    Forwarded,
}

impl std::fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolVersion::V1 => write!(f, "v1"),
            ProtocolVersion::V2 => write!(f, "v2"),
            ProtocolVersion::Forwarded => write!(f, "forwarded"),
        }
    }
}

/// Generate a fresh random challenge for one connection.
///
/// Challenges are never reused or persisted; binding them into the signed
/// bytes is what defeats replay of a captured v2 payload.
pub fn new_challenge() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(CHALLENGE_LEN)
        .map(char::from)
        .collect()
}

/// The greeting line written to every freshly accepted connection.
///
/// Legacy clients read this as `marker version`; v2 clients additionally
/// take the third token as their session challenge. One line serves both
/// handshakes.
pub fn greeting(challenge: &str) -> String {
    format!("{} {} {}\n", PROTOCOL_MARKER, PROTOCOL_VERSION_STRING, challenge)
}

/// Consumer boundary for decoded votes and terminal session errors.
///
/// Implementations are invoked concurrently from many session tasks and
/// must not block for long: expensive work belongs in the implementor's own
/// scheduling domain (a task queue, a platform dispatcher), not in the
/// calling session task.
pub trait VoteHandler: Send + Sync {
    /// A vote was decoded (or relayed). `remote` is `None` for votes that
    /// arrived through the forwarding layer rather than a direct connection.
    fn on_vote_received(&self, vote: Vote, version: ProtocolVersion, remote: Option<SocketAddr>);

    /// A session ended in error. `vote_delivered` is true when a vote was
    /// already decoded and reported before the failure, so implementations
    /// can calibrate log severity.
    fn on_error(&self, error: &BallotError, vote_delivered: bool, remote: SocketAddr);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_greeting_shape() {
        let challenge = new_challenge();
        let line = greeting(&challenge);
        assert!(line.ends_with('\n'));

        let fields: Vec<&str> = line.trim_end().split(' ').collect();
        assert_eq!(fields, vec![PROTOCOL_MARKER, PROTOCOL_VERSION_STRING, challenge.as_str()]);
    }

    #[test]
    fn test_challenges_are_fresh() {
        let a = new_challenge();
        let b = new_challenge();
        assert_eq!(a.len(), CHALLENGE_LEN);
        assert_ne!(a, b);
    }
}
