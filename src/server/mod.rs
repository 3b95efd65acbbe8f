//! Vote protocol server.
//!
//! Accepts inbound TCP connections, runs one session per connection, and
//! dispatches decoded votes to the configured [`crate::protocol::VoteHandler`].

mod listener;
mod session;

pub use listener::{ConnectionMetrics, VoteListener};
