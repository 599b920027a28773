//! Connection lifecycle for one remote node.
//!
//! [`ConnectionManager`] owns the transport and its liveness flag. It
//! connects with a bounded number of attempts, answers liveness queries with
//! a cheap probe, and reconnects lazily before each use. How hard it tries to
//! reconnect depends on history: a connection that worked before is worth
//! ten attempts, a host that never answered gets one.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use crate::config::NodeConfig;
use crate::error::Result;
use crate::limiter::SessionLimiter;
use crate::retry::RetryPolicy;
use crate::transport::{ConnectRequest, RemoteChannel, Transport};

/// Reconnect attempts for a connection that was established before.
pub const RECONNECT_ATTEMPTS: u32 = 10;

/// Upper bound on the per-attempt timeout when reconnecting.
pub const RECONNECT_TIMEOUT_CAP: Duration = Duration::from_secs(60);

/// Upper bound on the per-attempt timeout for a first connection.
pub const FIRST_CONNECT_TIMEOUT_CAP: Duration = Duration::from_secs(10);

/// Connection state and lifecycle for one host.
pub struct ConnectionManager<T: Transport> {
    config: RwLock<NodeConfig>,
    transport: Arc<T>,
    limiter: Arc<SessionLimiter>,
    live: AtomicBool,
    ever_connected: AtomicBool,
    reconnects: AtomicU32,
}

impl<T: Transport> std::fmt::Debug for ConnectionManager<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("host", &self.label())
            .field("live", &self.live.load(Ordering::Acquire))
            .field("ever_connected", &self.ever_connected())
            .field("reconnects", &self.reconnect_count())
            .finish_non_exhaustive()
    }
}

impl<T: Transport> ConnectionManager<T> {
    /// Create a manager. Nothing is connected until first use.
    pub fn new(config: NodeConfig, transport: Arc<T>, limiter: Arc<SessionLimiter>) -> Self {
        Self {
            config: RwLock::new(config),
            transport,
            limiter,
            live: AtomicBool::new(false),
            ever_connected: AtomicBool::new(false),
            reconnects: AtomicU32::new(0),
        }
    }

    /// Snapshot of the node configuration.
    pub fn config(&self) -> NodeConfig {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Name used in log events.
    pub fn label(&self) -> String {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .label()
            .to_string()
    }

    /// The underlying transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Whether a connection has ever been established.
    pub fn ever_connected(&self) -> bool {
        self.ever_connected.load(Ordering::Acquire)
    }

    /// Successful connects after the first one.
    pub fn reconnect_count(&self) -> u32 {
        self.reconnects.load(Ordering::Relaxed)
    }

    /// Connect, trying up to `retries` times with `timeout` per attempt.
    ///
    /// Does nothing if the connection is already live. Authentication and
    /// host key failures end the loop immediately.
    pub async fn connect(&self, retries: u32, timeout: Duration) -> Result<()> {
        let _guard = self.limiter.connect_guard().await;
        if self.live.load(Ordering::Acquire) && self.transport.is_active() {
            return Ok(());
        }

        let config = self.config();
        let label = config.label().to_string();
        let credential = config.credential()?;
        let mut retry = RetryPolicy::fixed(retries, config.timings.connect_retry_interval).start();

        loop {
            retry.record_attempt();
            tracing::debug!(
                host = %label,
                address = %config.address(),
                attempt = retry.attempt(),
                "connecting"
            );

            let request = ConnectRequest {
                config: &config,
                credential: &credential,
                timeout,
            };
            match self.transport.connect(request).await {
                Ok(()) => {
                    self.live.store(true, Ordering::Release);
                    if self.ever_connected.swap(true, Ordering::AcqRel) {
                        self.reconnects.fetch_add(1, Ordering::Relaxed);
                    }
                    tracing::info!(host = %label, attempts = retry.attempt(), "connected");
                    return Ok(());
                }
                Err(e) if !e.is_retryable() => {
                    self.live.store(false, Ordering::Release);
                    tracing::error!(host = %label, error = %e, "connection refused, not retrying");
                    return Err(e);
                }
                Err(e) if !retry.should_retry() => {
                    self.live.store(false, Ordering::Release);
                    tracing::error!(
                        host = %label,
                        attempts = retry.attempt(),
                        waited = ?retry.total_delay(),
                        error = %e,
                        "giving up on connection"
                    );
                    return Err(e);
                }
                Err(e) => {
                    tracing::warn!(
                        host = %label,
                        attempt = retry.attempt(),
                        remaining = retry.remaining(),
                        error = %e,
                        "connection attempt failed, retrying"
                    );
                    retry.backoff().await;
                }
            }
        }
    }

    /// Whether the connection is usable right now.
    ///
    /// Sends a keepalive and runs an empty command within the probe timeout.
    /// Any failure counts as "not connected" and clears the liveness flag.
    pub async fn is_connected(&self) -> bool {
        if !self.live.load(Ordering::Acquire) {
            return false;
        }
        if !self.transport.is_active() {
            self.live.store(false, Ordering::Release);
            return false;
        }

        let probe_timeout = self
            .config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .timings
            .probe_timeout;
        let failure = match tokio::time::timeout(probe_timeout, self.probe()).await {
            Ok(Ok(())) => return true,
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("no answer within {probe_timeout:?}"),
        };

        tracing::debug!(host = %self.label(), reason = %failure, "liveness probe failed");
        self.live.store(false, Ordering::Release);
        false
    }

    /// The empty command needs a channel, and a channel needs a permit. With
    /// every slot taken the keepalive answer alone decides.
    async fn probe(&self) -> Result<()> {
        self.transport.send_keepalive().await?;
        let Some(_permit) = self.limiter.try_acquire() else {
            tracing::trace!(host = %self.label(), "all sessions busy, keepalive only");
            return Ok(());
        };
        let mut channel = self.transport.open_channel().await?;
        let result = channel.exec("").await;
        channel.close().await;
        result
    }

    /// Reconnect if the connection is not usable.
    ///
    /// A connection that was established before gets
    /// [`RECONNECT_ATTEMPTS`] attempts of at most [`RECONNECT_TIMEOUT_CAP`];
    /// a first connection gets one attempt of at most
    /// [`FIRST_CONNECT_TIMEOUT_CAP`].
    pub async fn ensure_connected(&self, timeout: Duration) -> Result<()> {
        if self.is_connected().await {
            return Ok(());
        }
        if self.ever_connected() {
            tracing::info!(host = %self.label(), "connection lost, reconnecting");
            self.connect(RECONNECT_ATTEMPTS, timeout.min(RECONNECT_TIMEOUT_CAP))
                .await
        } else {
            self.connect(1, timeout.min(FIRST_CONNECT_TIMEOUT_CAP)).await
        }
    }

    /// Flag the connection as broken so the next use reconnects.
    pub fn mark_unhealthy(&self) {
        if self.live.swap(false, Ordering::AcqRel) {
            tracing::warn!(host = %self.label(), "connection marked unhealthy");
        }
    }

    /// Close the transport. Safe to call when already disconnected.
    pub async fn disconnect(&self) {
        let was_live = self.live.swap(false, Ordering::AcqRel);
        self.transport.close().await;
        if was_live {
            tracing::info!(host = %self.label(), "disconnected");
        }
    }

    /// Disconnect and point the manager at another port.
    pub async fn change_port(&self, port: u16) {
        self.disconnect().await;
        self.config
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .port = port;
        tracing::info!(host = %self.label(), port, "switched port");
    }
}
