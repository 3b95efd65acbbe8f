//! Legacy (v1) block codec.
//!
//! The client encrypts a newline-separated plaintext vote with the server's
//! published RSA public key and sends exactly one modulus-sized ciphertext
//! block. Possession of the public key is the only "authentication" the
//! format has; that weakness is preserved as-is for compatibility with
//! deployed voting sites.

use rsa::{Pkcs1v15Encrypt, RsaPublicKey};

use crate::crypto::KeyPair;
use crate::error::{BallotError, ProtocolErrorKind};
use crate::vote::Vote;

use super::PROTOCOL_MARKER;

/// Number of newline-separated fields in a v1 plaintext block:
/// marker, service name, username, address, timestamp.
const V1_FIELD_COUNT: usize = 5;

/// Decrypt and parse one v1 ciphertext block into a vote.
pub fn decode_v1_block(keys: &KeyPair, ciphertext: &[u8]) -> Result<Vote, BallotError> {
    let plaintext = keys
        .private()
        .decrypt(Pkcs1v15Encrypt, ciphertext)
        .map_err(|_| BallotError::Protocol {
            kind: ProtocolErrorKind::Decryption,
        })?;

    parse_plaintext(&plaintext)
}

/// Encrypt a vote into a v1 ciphertext block for the given public key.
///
/// This is the client half of the legacy protocol, used by tests and vote
/// submission tooling.
pub fn encode_v1_block(public: &RsaPublicKey, vote: &Vote) -> Result<Vec<u8>, BallotError> {
    let plaintext = format!(
        "{}\n{}\n{}\n{}\n{}",
        PROTOCOL_MARKER, vote.service_name, vote.username, vote.address, vote.timestamp
    );

    let mut rng = rand::thread_rng();
    public
        .encrypt(&mut rng, Pkcs1v15Encrypt, plaintext.as_bytes())
        .map_err(|e| BallotError::Protocol {
            kind: ProtocolErrorKind::MalformedVote {
                message: format!("vote does not fit in one block: {}", e),
            },
        })
}

fn parse_plaintext(plaintext: &[u8]) -> Result<Vote, BallotError> {
    let text = std::str::from_utf8(plaintext).map_err(|_| malformed("plaintext is not UTF-8"))?;

    // Some site implementations terminate the block with a trailing newline;
    // tolerate exactly one.
    let text = text.strip_suffix('\n').unwrap_or(text);

    let fields: Vec<&str> = text.split('\n').collect();
    if fields.len() != V1_FIELD_COUNT {
        return Err(malformed(&format!(
            "expected {} newline-separated fields, got {}",
            V1_FIELD_COUNT,
            fields.len()
        )));
    }

    if fields[0] != PROTOCOL_MARKER {
        return Err(malformed("missing protocol marker"));
    }

    Ok(Vote::new(fields[1], fields[2], fields[3], fields[4]))
}

fn malformed(message: &str) -> BallotError {
    BallotError::Protocol {
        kind: ProtocolErrorKind::MalformedVote {
            message: message.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;

    fn test_keys() -> KeyPair {
        KeyPair::generate(512).unwrap()
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let keys = test_keys();
        let vote = Vote::new("alpha", "Steve", "1.2.3.4", "1700000000");

        let block = encode_v1_block(keys.public(), &vote).unwrap();
        assert_eq!(block.len(), keys.block_size());

        let decoded = decode_v1_block(&keys, &block).unwrap();
        assert_eq!(decoded, vote);
    }

    #[test]
    fn test_plaintext_with_trailing_newline() {
        let vote = parse_plaintext(b"VOTIFIER\nalpha\nSteve\n1.2.3.4\n1700000000\n").unwrap();
        assert_eq!(vote.username, "Steve");
    }

    #[test]
    fn test_wrong_key_is_decryption_error() {
        let keys = test_keys();
        let other = test_keys();
        let vote = Vote::new("alpha", "Steve", "1.2.3.4", "1700000000");

        let block = encode_v1_block(other.public(), &vote).unwrap();
        let result = decode_v1_block(&keys, &block);
        assert!(matches!(
            result,
            Err(BallotError::Protocol {
                kind: ProtocolErrorKind::Decryption
            })
        ));
    }

    #[test]
    fn test_corrupted_block_is_decryption_error() {
        let keys = test_keys();
        let vote = Vote::new("alpha", "Steve", "1.2.3.4", "1700000000");

        let mut block = encode_v1_block(keys.public(), &vote).unwrap();
        block[10] ^= 0x01;

        let result = decode_v1_block(&keys, &block);
        assert!(matches!(
            result,
            Err(BallotError::Protocol {
                kind: ProtocolErrorKind::Decryption
            })
        ));
    }

    #[test]
    fn test_wrong_field_count_is_malformed() {
        assert!(matches!(
            parse_plaintext(b"VOTIFIER\nalpha\nSteve\n1.2.3.4"),
            Err(BallotError::Protocol {
                kind: ProtocolErrorKind::MalformedVote { .. }
            })
        ));
        assert!(matches!(
            parse_plaintext(b"VOTIFIER\nalpha\nSteve\n1.2.3.4\n17\nextra"),
            Err(BallotError::Protocol {
                kind: ProtocolErrorKind::MalformedVote { .. }
            })
        ));
    }

    #[test]
    fn test_wrong_marker_is_malformed() {
        let result = parse_plaintext(b"NOTAVOTE\nalpha\nSteve\n1.2.3.4\n1700000000");
        assert!(matches!(
            result,
            Err(BallotError::Protocol {
                kind: ProtocolErrorKind::MalformedVote { .. }
            })
        ));
    }
}
