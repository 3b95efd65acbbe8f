//! Redis pub/sub broker binding.
//!
//! Network-wide transport for consumers on other hosts. Each forwarding
//! channel maps to one Redis pub/sub channel; a lost broker connection
//! makes every known channel unreachable until the reconnect probe brings
//! it back, at which point `TargetConnected` events drive cache flushing.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::MultiplexedConnection;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{BallotError, ForwardingErrorKind};

use super::{ForwardingTransport, TransportEvent};

const CHANNEL_CAPACITY: usize = 64;
const EVENT_CAPACITY: usize = 16;

/// Redis-backed publish/subscribe transport.
pub struct RedisBroker {
    client: redis::Client,
    publish_conn: tokio::sync::Mutex<Option<MultiplexedConnection>>,
    known_targets: Mutex<HashSet<String>>,
    /// Channels whose last publish found no subscriber (or failed). Used to
    /// emit exactly one disconnect/reconnect event per transition.
    down_targets: Mutex<HashSet<String>>,
    events: broadcast::Sender<TransportEvent>,
}

impl RedisBroker {
    /// Create a broker for the given connection URL. The first connection
    /// is established lazily on use.
    pub fn connect(url: &str) -> Result<Arc<Self>, BallotError> {
        let client = redis::Client::open(url).map_err(|e| broker_error(&e))?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Arc::new(Self {
            client,
            publish_conn: tokio::sync::Mutex::new(None),
            known_targets: Mutex::new(HashSet::new()),
            down_targets: Mutex::new(HashSet::new()),
            events,
        }))
    }

    async fn connection(&self) -> Result<MultiplexedConnection, BallotError> {
        let mut guard = self.publish_conn.lock().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }

        match self.client.get_multiplexed_async_connection().await {
            Ok(conn) => {
                *guard = Some(conn.clone());
                Ok(conn)
            }
            Err(e) => Err(broker_error(&e)),
        }
    }

    async fn drop_connection(&self) {
        *self.publish_conn.lock().await = None;
    }

    fn remember_target(&self, target: &str) {
        self.known_targets
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(target.to_string());
    }

    /// Record the subscriber count a publish saw and fire connectivity
    /// events on transitions. A channel with no subscriber is unreachable
    /// even when the broker itself is up: the message would vanish.
    /// Returns whether the channel counts as reachable.
    fn note_subscribers(&self, target: &str, subscribers: i64) -> bool {
        let mut down = self.down_targets.lock().unwrap_or_else(|e| e.into_inner());
        if subscribers == 0 {
            if down.insert(target.to_string()) {
                let _ = self
                    .events
                    .send(TransportEvent::TargetDisconnected(target.to_string()));
            }
            false
        } else {
            if down.remove(target) {
                let _ = self
                    .events
                    .send(TransportEvent::TargetConnected(target.to_string()));
            }
            true
        }
    }

    /// Spawn a task that probes a lost broker connection and announces all
    /// known channels as reconnected once it is back.
    pub fn spawn_reconnect_probe(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let broker = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;

                let down = broker.publish_conn.lock().await.is_none();
                if !down {
                    continue;
                }

                match broker.connection().await {
                    Ok(_) => {
                        info!("Redis connection re-established");
                        let targets: Vec<String> = broker
                            .known_targets
                            .lock()
                            .unwrap_or_else(|e| e.into_inner())
                            .iter()
                            .cloned()
                            .collect();
                        for target in targets {
                            let _ = broker.events.send(TransportEvent::TargetConnected(target));
                        }
                    }
                    Err(e) => {
                        debug!(error = %e, "Redis still unreachable");
                    }
                }
            }
        })
    }
}

#[async_trait]
impl ForwardingTransport for RedisBroker {
    async fn publish(&self, target: &str, payload: &[u8]) -> Result<(), BallotError> {
        self.remember_target(target);

        let unreachable = || BallotError::Forwarding {
            kind: ForwardingErrorKind::TargetUnreachable {
                target: target.to_string(),
            },
        };

        let mut conn = self.connection().await.map_err(|_| unreachable())?;

        let result: Result<i64, redis::RedisError> = redis::cmd("PUBLISH")
            .arg(target)
            .arg(payload)
            .query_async(&mut conn)
            .await;

        match result {
            Ok(subscribers) if self.note_subscribers(target, subscribers) => Ok(()),
            Ok(_) => {
                warn!(target = %target, "No subscriber on redis channel, queueing for retry");
                Err(unreachable())
            }
            Err(e) => {
                warn!(target = %target, error = %e, "Redis publish failed, dropping connection");
                self.drop_connection().await;
                self.note_subscribers(target, 0);
                Err(unreachable())
            }
        }
    }

    async fn subscribe(&self, target: &str) -> Result<mpsc::Receiver<Vec<u8>>, BallotError> {
        self.remember_target(target);

        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| broker_error(&e))?;
        pubsub.subscribe(target).await.map_err(|e| broker_error(&e))?;

        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let target_name = target.to_string();

        tokio::spawn(async move {
            let mut stream = pubsub.on_message();
            while let Some(message) = stream.next().await {
                match message.get_payload::<Vec<u8>>() {
                    Ok(bytes) => {
                        if tx.send(bytes).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(channel = %target_name, error = %e, "Unreadable redis message");
                    }
                }
            }
            debug!(channel = %target_name, "Redis subscription ended");
        });

        Ok(rx)
    }

    fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }
}

fn broker_error(e: &redis::RedisError) -> BallotError {
    BallotError::Forwarding {
        kind: ForwardingErrorKind::Broker {
            message: e.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Exchanging messages needs a live Redis; here we only cover what does
    // not require one.

    #[test]
    fn test_invalid_url_rejected() {
        let result = RedisBroker::connect("not a url");
        assert!(matches!(
            result,
            Err(BallotError::Forwarding {
                kind: ForwardingErrorKind::Broker { .. }
            })
        ));
    }

    #[tokio::test]
    async fn test_publish_without_server_is_unreachable() {
        // Port 1 is never a redis server.
        let broker = RedisBroker::connect("redis://127.0.0.1:1").unwrap();
        let result = broker.publish("votes", b"payload").await;
        assert!(result.unwrap_err().is_target_unreachable());
    }

    #[tokio::test]
    async fn test_subscriber_count_drives_connectivity_events() {
        let broker = RedisBroker::connect("redis://127.0.0.1:1").unwrap();
        let mut events = broker.events();

        // No subscriber: unreachable, one disconnect event.
        assert!(!broker.note_subscribers("votes", 0));
        assert!(!broker.note_subscribers("votes", 0));
        assert_eq!(
            events.recv().await.unwrap(),
            TransportEvent::TargetDisconnected("votes".to_string())
        );

        // A subscriber appeared: reachable again, one reconnect event.
        assert!(broker.note_subscribers("votes", 1));
        assert_eq!(
            events.recv().await.unwrap(),
            TransportEvent::TargetConnected("votes".to_string())
        );

        // Staying up does not re-announce.
        assert!(broker.note_subscribers("votes", 2));
        assert!(events.try_recv().is_err());
    }
}
