//! Shared-secret tokens for the token-authenticated (v2) protocol.

use std::collections::HashMap;

use rand::distributions::Alphanumeric;
use rand::Rng;
use ring::hmac;

use crate::error::{BallotError, CryptoErrorKind};

/// Length of generated tokens in characters. 32 alphanumeric characters
/// carry roughly 190 bits of entropy, comfortably above the 128-bit floor.
pub const TOKEN_LEN: usize = 32;

/// Generate a new random printable token string.
pub fn new_token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(TOKEN_LEN)
        .map(char::from)
        .collect()
}

/// Convert a configured token string into the HMAC-SHA256 key used to
/// verify v2 signatures.
///
/// Rejects empty tokens and tokens containing non-printable or non-ASCII
/// characters; those are almost always a mangled config file.
pub fn derive_key(token: &str) -> Result<hmac::Key, BallotError> {
    if token.is_empty() {
        return Err(BallotError::Crypto {
            kind: CryptoErrorKind::InvalidToken {
                message: "token is empty".to_string(),
            },
        });
    }

    if !token.chars().all(|c| c.is_ascii_graphic()) {
        return Err(BallotError::Crypto {
            kind: CryptoErrorKind::InvalidToken {
                message: "token contains non-printable or non-ASCII characters".to_string(),
            },
        });
    }

    Ok(hmac::Key::new(hmac::HMAC_SHA256, token.as_bytes()))
}

/// Read-only mapping from voting site name to its HMAC key.
///
/// Built once at startup from configuration and shared across all sessions;
/// it is never mutated afterwards, only replaced wholesale on reload.
#[derive(Debug)]
pub struct TokenStore {
    keys: HashMap<String, hmac::Key>,
}

impl TokenStore {
    /// Build a store from configured `site name -> token string` pairs.
    pub fn from_config(tokens: &HashMap<String, String>) -> Result<Self, BallotError> {
        let mut keys = HashMap::with_capacity(tokens.len());
        for (service, token) in tokens {
            let key = derive_key(token).map_err(|e| match e {
                BallotError::Crypto {
                    kind: CryptoErrorKind::InvalidToken { message },
                } => BallotError::Crypto {
                    kind: CryptoErrorKind::InvalidToken {
                        message: format!("token for service '{}': {}", service, message),
                    },
                },
                other => other,
            })?;
            keys.insert(service.clone(), key);
        }
        Ok(Self { keys })
    }

    /// Create an empty store.
    pub fn empty() -> Self {
        Self {
            keys: HashMap::new(),
        }
    }

    /// Insert a key for a site. Only used while assembling the store at
    /// startup; the store is read-only once shared.
    pub fn insert(&mut self, service: impl Into<String>, key: hmac::Key) {
        self.keys.insert(service.into(), key);
    }

    /// Look up the key for a claimed site name (case-sensitive).
    pub fn key_for(&self, service: &str) -> Option<&hmac::Key> {
        self.keys.get(service)
    }

    /// Number of configured sites.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Whether no sites are configured.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_token_shape() {
        let token = new_token();
        assert_eq!(token.len(), TOKEN_LEN);
        assert!(token.chars().all(|c| c.is_ascii_alphanumeric()));

        // Two draws colliding would mean the rng is broken.
        assert_ne!(token, new_token());
    }

    #[test]
    fn test_derive_key_accepts_printable_tokens() {
        assert!(derive_key("tok123").is_ok());
        assert!(derive_key(&new_token()).is_ok());
    }

    #[test]
    fn test_derive_key_rejects_bad_input() {
        assert!(matches!(
            derive_key(""),
            Err(BallotError::Crypto {
                kind: CryptoErrorKind::InvalidToken { .. }
            })
        ));
        assert!(matches!(
            derive_key("has space"),
            Err(BallotError::Crypto {
                kind: CryptoErrorKind::InvalidToken { .. }
            })
        ));
        assert!(matches!(
            derive_key("non-ascii-é"),
            Err(BallotError::Crypto {
                kind: CryptoErrorKind::InvalidToken { .. }
            })
        ));
    }

    #[test]
    fn test_store_lookup_is_case_sensitive() {
        let mut tokens = HashMap::new();
        tokens.insert("Alpha".to_string(), "tok123".to_string());

        let store = TokenStore::from_config(&tokens).unwrap();
        assert!(store.key_for("Alpha").is_some());
        assert!(store.key_for("alpha").is_none());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_store_surfaces_offending_service() {
        let mut tokens = HashMap::new();
        tokens.insert("beta".to_string(), "".to_string());

        let err = TokenStore::from_config(&tokens).unwrap_err();
        assert!(err.to_string().contains("beta"));
    }
}
