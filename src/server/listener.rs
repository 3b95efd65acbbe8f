//! TCP vote listener.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::{Notify, Semaphore};
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::crypto::{KeyPair, TokenStore};
use crate::error::BallotError;
use crate::protocol::VoteHandler;

use super::session::{handle_session, SessionContext};

/// Session metrics for monitoring.
#[derive(Debug, Default)]
pub struct ConnectionMetrics {
    /// Total sessions handled.
    pub sessions_total: AtomicU64,
    /// Sessions that ended in a terminal error.
    pub sessions_failed: AtomicU64,
    /// Currently active connections.
    pub active_connections: AtomicUsize,
}

impl ConnectionMetrics {
    /// Create new metrics.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a completed session.
    pub fn record_session(&self, success: bool) {
        self.sessions_total.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.sessions_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Total sessions handled so far.
    pub fn total(&self) -> u64 {
        self.sessions_total.load(Ordering::Relaxed)
    }

    /// Sessions that ended in error.
    pub fn failed(&self) -> u64 {
        self.sessions_failed.load(Ordering::Relaxed)
    }

    /// Currently active connection count.
    pub fn active(&self) -> usize {
        self.active_connections.load(Ordering::Relaxed)
    }
}

/// TCP server accepting vote submissions.
///
/// Each accepted connection is handled by its own task; the only state
/// shared between sessions is the read-only key material. A slow or
/// malicious peer stalls its own session up to the read timeout, never the
/// accept loop.
pub struct VoteListener {
    listener: TcpListener,
    ctx: Arc<SessionContext>,
    metrics: Arc<ConnectionMetrics>,
    connection_semaphore: Arc<Semaphore>,
    max_concurrent: usize,
}

impl VoteListener {
    /// Bind the listener on the configured address.
    ///
    /// Returns `Ok(None)` when the configured port is negative: the server
    /// then participates only as a forwarding consumer and no listener is
    /// started.
    pub async fn bind(
        settings: Arc<Settings>,
        keys: Arc<KeyPair>,
        tokens: Arc<TokenStore>,
        handler: Arc<dyn VoteHandler>,
    ) -> Result<Option<Self>, BallotError> {
        if settings.listener.port < 0 {
            info!("Listener port is negative, not accepting vote submissions");
            return Ok(None);
        }

        let address = format!("{}:{}", settings.listener.host, settings.listener.port);
        let listener = TcpListener::bind(&address).await.map_err(|e| BallotError::Config {
            message: format!("Failed to bind vote listener on {}: {}", address, e),
        })?;

        let max_concurrent = settings.listener.max_concurrent_connections;
        let connection_semaphore = Arc::new(Semaphore::new(max_concurrent));
        info!(max_connections = max_concurrent, "Connection limiting enabled");

        let ctx = Arc::new(SessionContext {
            keys,
            tokens,
            handler,
            read_timeout: Duration::from_secs(settings.listener.read_timeout_seconds),
            max_frame_size: settings.listener.max_frame_size,
        });

        info!(address = %address, "Vote listener bound");

        Ok(Some(Self {
            listener,
            ctx,
            metrics: Arc::new(ConnectionMetrics::new()),
            connection_semaphore,
            max_concurrent,
        }))
    }

    /// Get session metrics.
    pub fn metrics(&self) -> Arc<ConnectionMetrics> {
        Arc::clone(&self.metrics)
    }

    /// The local address the listener is bound to.
    pub fn local_addr(&self) -> Result<std::net::SocketAddr, BallotError> {
        self.listener.local_addr().map_err(BallotError::Io)
    }

    /// Run the accept loop.
    ///
    /// Stops accepting new connections when `shutdown` is notified; active
    /// sessions run to completion (see [`VoteListener::wait_for_drain`]).
    pub async fn run(&self, shutdown: Arc<Notify>) -> Result<(), BallotError> {
        info!("Vote listener running, waiting for connections...");

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, remote)) => {
                            let permit = match self.connection_semaphore.clone().try_acquire_owned() {
                                Ok(permit) => permit,
                                Err(_) => {
                                    warn!(
                                        remote = %remote,
                                        max = self.max_concurrent,
                                        "Connection limit reached, rejecting connection"
                                    );
                                    continue;
                                }
                            };

                            let ctx = Arc::clone(&self.ctx);
                            let metrics = Arc::clone(&self.metrics);

                            metrics.active_connections.fetch_add(1, Ordering::Relaxed);
                            debug!(remote = %remote, active = metrics.active(), "Connection accepted");

                            tokio::spawn(async move {
                                let _permit = permit; // released when the task completes
                                let success = handle_session(stream, remote, ctx).await;

                                metrics.record_session(success);
                                metrics.active_connections.fetch_sub(1, Ordering::Relaxed);
                                debug!(
                                    remote = %remote,
                                    active = metrics.active(),
                                    success = success,
                                    "Connection closed"
                                );
                            });
                        }
                        Err(e) => {
                            warn!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown.notified() => {
                    info!("Shutdown signal received, stopping listener");
                    break;
                }
            }
        }

        Ok(())
    }

    /// Wait for all active sessions to finish.
    pub async fn wait_for_drain(&self) {
        let poll_interval = Duration::from_millis(100);

        while self.metrics.active() > 0 {
            debug!(active = self.metrics.active(), "Waiting for sessions to drain");
            tokio::time::sleep(poll_interval).await;
        }

        info!("All sessions drained");
    }
}
