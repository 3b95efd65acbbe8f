//! In-process named-channel broker.
//!
//! Low-latency transport for consumers living in the same process group.
//! A target is reachable while it has at least one live subscriber;
//! publishing to a target nobody is listening on reports it unreachable so
//! the source can queue the message.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use crate::error::{BallotError, ForwardingErrorKind};

use super::{ForwardingTransport, TransportEvent};

const CHANNEL_CAPACITY: usize = 64;
const EVENT_CAPACITY: usize = 16;

/// Process-wide pub/sub registry of named channels.
pub struct InProcessBroker {
    channels: Mutex<HashMap<String, broadcast::Sender<Vec<u8>>>>,
    events: broadcast::Sender<TransportEvent>,
}

impl InProcessBroker {
    /// Create a new broker.
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Arc::new(Self {
            channels: Mutex::new(HashMap::new()),
            events,
        })
    }

    fn sender_for(&self, target: &str) -> broadcast::Sender<Vec<u8>> {
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        channels
            .entry(target.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }

    fn live_sender(&self, target: &str) -> Option<broadcast::Sender<Vec<u8>>> {
        let channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        channels
            .get(target)
            .filter(|sender| sender.receiver_count() > 0)
            .cloned()
    }
}

#[async_trait]
impl ForwardingTransport for InProcessBroker {
    async fn publish(&self, target: &str, payload: &[u8]) -> Result<(), BallotError> {
        let unreachable = || BallotError::Forwarding {
            kind: ForwardingErrorKind::TargetUnreachable {
                target: target.to_string(),
            },
        };

        let sender = self.live_sender(target).ok_or_else(unreachable)?;
        sender.send(payload.to_vec()).map_err(|_| unreachable())?;
        Ok(())
    }

    async fn subscribe(&self, target: &str) -> Result<mpsc::Receiver<Vec<u8>>, BallotError> {
        let sender = self.sender_for(target);
        let mut inbound = sender.subscribe();
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);

        let events = self.events.clone();
        let target_name = target.to_string();
        tokio::spawn(async move {
            loop {
                match inbound.recv().await {
                    Ok(bytes) => {
                        if tx.send(bytes).await.is_err() {
                            break; // subscriber dropped its receiver
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(target = %target_name, missed = missed, "Slow subscriber dropped messages");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!(target = %target_name, "Subscriber gone");
            let _ = events.send(TransportEvent::TargetDisconnected(target_name.clone()));
        });

        // The new subscriber makes the target reachable.
        let _ = self.events.send(TransportEvent::TargetConnected(target.to_string()));
        Ok(rx)
    }

    fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_without_subscriber_is_unreachable() {
        let broker = InProcessBroker::new();
        let result = broker.publish("lobby", b"payload").await;
        assert!(result.unwrap_err().is_target_unreachable());
    }

    #[tokio::test]
    async fn test_publish_reaches_subscriber() {
        let broker = InProcessBroker::new();
        let mut rx = broker.subscribe("lobby").await.unwrap();

        broker.publish("lobby", b"payload").await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), b"payload");
    }

    #[tokio::test]
    async fn test_subscribe_fires_connected_event() {
        let broker = InProcessBroker::new();
        let mut events = broker.events();

        let _rx = broker.subscribe("lobby").await.unwrap();
        assert_eq!(
            events.recv().await.unwrap(),
            TransportEvent::TargetConnected("lobby".to_string())
        );
    }

    #[tokio::test]
    async fn test_targets_are_independent() {
        let broker = InProcessBroker::new();
        let mut lobby = broker.subscribe("lobby").await.unwrap();
        let _survival = broker.subscribe("survival").await.unwrap();

        broker.publish("lobby", b"for lobby").await.unwrap();
        assert_eq!(lobby.recv().await.unwrap(), b"for lobby");
    }
}
