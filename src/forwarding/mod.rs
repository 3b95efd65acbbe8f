//! Forwarding relay.
//!
//! Relays validated votes from the server that decoded them to downstream
//! consumers. The relay core is transport-agnostic: a **source** serializes
//! votes onto a [`ForwardingTransport`] and a **sink** subscribes and
//! re-dispatches them to the local vote handler. Two bindings are provided:
//! an in-process named-channel broker and a Redis pub/sub broker.
//!
//! Forwarding failures never surface to the submitting client; undeliverable
//! messages go to a per-backend [`VoteCache`] and are flushed at a bounded
//! rate when the backend reconnects.

mod cache;
mod channel;
mod message;
mod redis;
mod sink;
mod source;

pub use cache::VoteCache;
pub use channel::InProcessBroker;
pub use message::ForwardingMessage;
pub use self::redis::RedisBroker;
pub use sink::ForwardingSink;
pub use source::CachingForwardingSource;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};

use crate::error::BallotError;

/// Connectivity change on a transport, used to drive cache flushes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A target became reachable (a subscriber appeared, a broker
    /// connection was re-established).
    TargetConnected(String),
    /// A target became unreachable.
    TargetDisconnected(String),
}

/// Narrow publish/subscribe capability the relay is built on.
///
/// `publish` must report an unreachable target as
/// [`crate::error::ForwardingErrorKind::TargetUnreachable`] so the source
/// can queue the message instead of dropping it.
#[async_trait]
pub trait ForwardingTransport: Send + Sync + 'static {
    /// Publish a message to a named target or channel.
    async fn publish(&self, target: &str, payload: &[u8]) -> Result<(), BallotError>;

    /// Subscribe to a named target or channel. Messages arrive on the
    /// returned receiver until the transport closes.
    async fn subscribe(&self, target: &str) -> Result<mpsc::Receiver<Vec<u8>>, BallotError>;

    /// Stream of connectivity events for cache flushing.
    fn events(&self) -> broadcast::Receiver<TransportEvent>;
}
