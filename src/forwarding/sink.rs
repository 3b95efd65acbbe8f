//! Forwarding sink: consumes forwarded votes from a transport.

use std::sync::Arc;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::error::BallotError;
use crate::protocol::{ProtocolVersion, VoteHandler};

use super::{ForwardingMessage, ForwardingTransport};

/// Subscribes to a forwarding channel and re-dispatches inbound votes to
/// the local vote handler, tagged [`ProtocolVersion::Forwarded`].
///
/// Sources may retry after a partial flush, so the same vote can arrive
/// more than once; the handler must tolerate duplicates. Malformed inbound
/// envelopes are logged and dropped, never crash the sink task.
pub struct ForwardingSink {
    task: JoinHandle<()>,
    shutdown: Arc<Notify>,
}

impl ForwardingSink {
    /// Subscribe and start dispatching.
    pub async fn start(
        transport: Arc<dyn ForwardingTransport>,
        channel: &str,
        handler: Arc<dyn VoteHandler>,
    ) -> Result<Self, BallotError> {
        let mut rx = transport.subscribe(channel).await?;
        info!(channel = %channel, "Receiving forwarded votes");

        let shutdown = Arc::new(Notify::new());
        let shutdown_for_task = Arc::clone(&shutdown);
        let channel_name = channel.to_string();

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_for_task.notified() => break,
                    inbound = rx.recv() => match inbound {
                        Some(bytes) => match ForwardingMessage::from_bytes(&bytes) {
                            Ok(message) => {
                                handler.on_vote_received(
                                    message.vote,
                                    ProtocolVersion::Forwarded,
                                    None,
                                );
                            }
                            Err(e) => {
                                warn!(
                                    channel = %channel_name,
                                    error = %e,
                                    "Dropping malformed forwarded message"
                                );
                            }
                        },
                        None => {
                            info!(channel = %channel_name, "Forwarding transport closed");
                            break;
                        }
                    }
                }
            }
        });

        Ok(Self { task, shutdown })
    }

    /// Stop consuming and wait for the dispatch task to finish.
    pub async fn halt(self) {
        self.shutdown.notify_waiters();
        let _ = self.task.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forwarding::InProcessBroker;
    use crate::vote::Vote;
    use std::net::SocketAddr;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingHandler {
        votes: Mutex<Vec<(Vote, ProtocolVersion)>>,
    }

    impl VoteHandler for RecordingHandler {
        fn on_vote_received(&self, vote: Vote, version: ProtocolVersion, _remote: Option<SocketAddr>) {
            self.votes.lock().unwrap().push((vote, version));
        }

        fn on_error(&self, _error: &BallotError, _vote_delivered: bool, _remote: SocketAddr) {}
    }

    #[tokio::test]
    async fn test_sink_dispatches_forwarded_votes() {
        let broker = InProcessBroker::new();
        let handler = Arc::new(RecordingHandler::default());

        let sink = ForwardingSink::start(
            Arc::clone(&broker) as _,
            "votes",
            Arc::clone(&handler) as _,
        )
        .await
        .unwrap();

        let vote = Vote::new("alpha", "Steve", "1.2.3.4", "1700000000");
        let bytes = ForwardingMessage::vote(vote.clone()).to_bytes().unwrap();
        broker.publish("votes", &bytes).await.unwrap();

        // Give the dispatch task a moment.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let votes = handler.votes.lock().unwrap();
        assert_eq!(votes.len(), 1);
        assert_eq!(votes[0].0, vote);
        assert_eq!(votes[0].1, ProtocolVersion::Forwarded);
        drop(votes);

        sink.halt().await;
    }

    #[tokio::test]
    async fn test_sink_survives_malformed_messages() {
        let broker = InProcessBroker::new();
        let handler = Arc::new(RecordingHandler::default());

        let sink = ForwardingSink::start(
            Arc::clone(&broker) as _,
            "votes",
            Arc::clone(&handler) as _,
        )
        .await
        .unwrap();

        broker.publish("votes", b"not a vote").await.unwrap();

        let vote = Vote::new("alpha", "Steve", "1.2.3.4", "1700000000");
        let bytes = ForwardingMessage::vote(vote.clone()).to_bytes().unwrap();
        broker.publish("votes", &bytes).await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;

        let votes = handler.votes.lock().unwrap();
        assert_eq!(votes.len(), 1);
        assert_eq!(votes[0].0, vote);
        drop(votes);

        sink.halt().await;
    }
}
