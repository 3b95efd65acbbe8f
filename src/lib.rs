//! ballotd library
//!
//! Core functionality for the ballotd vote notification daemon: the
//! dual-version wire protocol (legacy RSA blocks and token-authenticated
//! HMAC envelopes), the TCP vote listener, and the forwarding relay that
//! fans validated votes out to downstream consumers with cache-backed
//! retry.

pub mod config;
pub mod crypto;
pub mod error;
pub mod forwarding;
pub mod protocol;
pub mod server;
pub mod vote;
