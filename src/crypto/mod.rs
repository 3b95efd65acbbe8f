//! Cryptographic primitives.
//!
//! The legacy (v1) protocol authenticates nothing beyond possession of the
//! server's published RSA public key; the v2 protocol uses per-site shared
//! secrets with HMAC-SHA256. Both kinds of key material are loaded once at
//! startup and read-only afterwards.

mod keypair;
mod token;

pub use keypair::{KeyPair, DEFAULT_KEY_BITS, PRIVATE_KEY_FILE, PUBLIC_KEY_FILE};
pub use token::{derive_key, new_token, TokenStore, TOKEN_LEN};
