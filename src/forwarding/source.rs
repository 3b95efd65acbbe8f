//! Caching forwarding source.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{BallotError, ForwardingErrorKind};
use crate::vote::Vote;

use super::{ForwardingMessage, ForwardingTransport, TransportEvent, VoteCache};

/// Pushes validated votes onto a transport, queueing per backend when a
/// target is unreachable and flushing queues at a bounded rate when the
/// target reconnects.
pub struct CachingForwardingSource {
    transport: Arc<dyn ForwardingTransport>,
    cache: Arc<VoteCache>,
    targets: Vec<String>,
    dump_rate: usize,
    /// Targets with a flush currently in progress. A target must never have
    /// two concurrent flushers: they would exceed the dump rate and race
    /// each other's drains.
    flushing: Mutex<HashSet<String>>,
    closed: AtomicBool,
    shutdown: Notify,
}

impl CachingForwardingSource {
    /// Create a source publishing to the given targets.
    pub fn new(
        transport: Arc<dyn ForwardingTransport>,
        targets: Vec<String>,
        dump_rate: usize,
        cache_capacity: usize,
    ) -> Arc<Self> {
        assert!(dump_rate > 0, "dump rate must be at least 1");
        Arc::new(Self {
            transport,
            cache: Arc::new(VoteCache::new(cache_capacity)),
            targets,
            dump_rate,
            flushing: Mutex::new(HashSet::new()),
            closed: AtomicBool::new(false),
            shutdown: Notify::new(),
        })
    }

    /// Forward one vote to every configured target.
    ///
    /// Unreachable targets get the message queued instead; this never
    /// reports a failure back to the vote's origin.
    pub async fn forward(&self, vote: &Vote) -> Result<(), BallotError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BallotError::Forwarding {
                kind: ForwardingErrorKind::Shutdown,
            });
        }

        let message = ForwardingMessage::vote(vote.clone());
        let bytes = message.to_bytes()?;

        for target in &self.targets {
            match self.transport.publish(target, &bytes).await {
                Ok(()) => {
                    debug!(target = %target, vote = %vote, "Vote forwarded");
                }
                Err(e) => {
                    warn!(
                        target = %target,
                        error = %e,
                        queued = self.cache.len(target) + 1,
                        "Forwarding failed, queueing vote for retry"
                    );
                    self.cache.add(target, message.clone());
                }
            }
        }

        Ok(())
    }

    /// Number of votes queued for a target. Mainly for monitoring and tests.
    pub fn queued(&self, target: &str) -> usize {
        self.cache.len(target)
    }

    /// Spawn the task that watches transport connectivity and flushes a
    /// backend's queue when it reconnects.
    pub fn spawn_flush_on_reconnect(self: &Arc<Self>) -> JoinHandle<()> {
        // Subscribe before spawning so no event can slip past between the
        // caller wiring things up and the task starting.
        let mut events = self.transport.events();
        let source = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = source.shutdown.notified() => break,
                    event = events.recv() => match event {
                        Ok(TransportEvent::TargetConnected(target)) => {
                            if !source.cache.is_empty(&target) {
                                let source = Arc::clone(&source);
                                tokio::spawn(async move {
                                    source.flush_target(&target).await;
                                });
                            }
                        }
                        Ok(TransportEvent::TargetDisconnected(_)) => {}
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                            warn!(missed = missed, "Missed transport events, rechecking queued targets");
                            for target in source.cache.targets() {
                                let source = Arc::clone(&source);
                                tokio::spawn(async move {
                                    source.flush_target(&target).await;
                                });
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        })
    }

    /// Flush a backend's queue in FIFO order at `dump_rate` messages per
    /// second. Stops early if the target drops again or the source shuts
    /// down; the remainder stays queued for the next reconnect.
    ///
    /// At most one flush runs per target: a call that arrives while another
    /// flush for the same target is in progress returns immediately, so
    /// repeated reconnect events cannot multiply the effective rate.
    pub(crate) async fn flush_target(&self, target: &str) {
        if !self.begin_flush(target) {
            debug!(target = %target, "Flush already in progress");
            return;
        }
        self.run_flush(target).await;
        self.end_flush(target);
    }

    fn begin_flush(&self, target: &str) -> bool {
        self.flushing
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(target.to_string())
    }

    fn end_flush(&self, target: &str) {
        self.flushing
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(target);
    }

    async fn run_flush(&self, target: &str) {
        let total = self.cache.len(target);
        if total == 0 {
            return;
        }
        info!(
            target = %target,
            queued = total,
            rate = self.dump_rate,
            "Backend reconnected, flushing queued votes"
        );

        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        ticker.tick().await; // first tick completes immediately

        loop {
            let batch = self.cache.drain(target, self.dump_rate);
            if batch.is_empty() {
                return;
            }

            for (sent, message) in batch.iter().enumerate() {
                let bytes = match message.to_bytes() {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        warn!(target = %target, error = %e, "Dropping unserializable cached vote");
                        continue;
                    }
                };

                if let Err(e) = self.transport.publish(target, &bytes).await {
                    warn!(
                        target = %target,
                        error = %e,
                        remaining = batch.len() - sent,
                        "Flush interrupted, requeueing remainder"
                    );
                    self.cache.requeue_front(target, batch[sent..].to_vec());
                    return;
                }
            }

            if self.cache.is_empty(target) {
                return;
            }

            tokio::select! {
                _ = self.shutdown.notified() => return,
                _ = ticker.tick() => {}
            }
        }
    }

    /// Stop accepting votes for forwarding and release flush tasks.
    /// In-flight flush batches are abandoned without corrupting queues.
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        self.shutdown.notify_waiters();
    }
}
