//! Readiness: is the terminal actually connected to the trading server?
//!
//! An open socket pair only proves the terminal process is running. The
//! trading server behind it may still be unreachable, so
//! [`ServerConnectionStatus`] derives a separate signal: it subscribes to the
//! terminal's `OnDisconnected` push event, polls `isConnected` on a fixed
//! period, and publishes the timestamp since which the terminal has reported
//! itself connected. Continuous polling stays on even while subscribed — the
//! push event alone is not trusted to catch every disconnect.
//!
//! All state lives on the listener dispatch task; only the published
//! `connected_since` value crosses threads, through an atomic read by
//! [`StatusHandle`].

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::StatusConfig;
use crate::connect::QuikConnect;
use crate::decoder;
use crate::listener::{QuikEvent, QuikListener};
use crate::pending::PendingReply;
use crate::time_util::now_ms;

/// Push event the terminal raises when it loses the trading server.
const ON_DISCONNECTED: &str = "OnDisconnected";

/// Tracks whether the terminal is connected to the trading server.
///
/// Register it on the listener dispatch task; read the derived signal from
/// any task through the [`StatusHandle`] returned by [`Self::new`].
pub struct ServerConnectionStatus {
    connect: Arc<QuikConnect>,
    config: StatusConfig,
    label: String,
    subscribed: bool,
    next_subscribe: Option<Instant>,
    next_check: Option<Instant>,
    inflight_subscribe: Option<PendingReply>,
    inflight_check: Option<PendingReply>,
    connected_since: Arc<AtomicU64>,
}

impl ServerConnectionStatus {
    pub fn new(connect: Arc<QuikConnect>, config: StatusConfig) -> (Self, StatusHandle) {
        let connected_since = Arc::new(AtomicU64::new(0));
        let handle = StatusHandle {
            connected_since: Arc::clone(&connected_since),
            min_uptime: config.min_uptime(),
        };
        let status = Self {
            label: connect.client_id().to_string(),
            connect,
            config,
            subscribed: false,
            next_subscribe: None,
            next_check: None,
            inflight_subscribe: None,
            inflight_check: None,
            connected_since,
        };
        (status, handle)
    }

    /// Channels are up: start over with an immediate subscribe attempt.
    fn on(&mut self) {
        self.subscribed = false;
        self.inflight_subscribe = None;
        self.inflight_check = None;
        self.next_subscribe = Some(Instant::now());
        self.next_check = None;
    }

    /// Channels are down or errored: the signal is unusable, drop everything.
    fn off(&mut self) {
        self.subscribed = false;
        self.inflight_subscribe = None;
        self.inflight_check = None;
        self.next_subscribe = None;
        self.next_check = None;
        self.connected_since.store(0, Ordering::Release);
    }

    fn record_connected(&self, connected: bool) {
        if connected {
            if self.connected_since.load(Ordering::Acquire) == 0 {
                let since = now_ms();
                info!("[{}] terminal connected to the server since {since}", self.label);
                self.connected_since.store(since, Ordering::Release);
            }
        } else {
            self.connected_since.store(0, Ordering::Release);
        }
    }

    async fn ensure_subscription(&mut self) {
        if let Some(reply) = self.inflight_subscribe.as_mut() {
            let Some(outcome) = reply.try_recv() else { return };
            self.inflight_subscribe = None;
            match outcome {
                Ok(frame) if decoder::status(&frame) => {
                    info!("[{}] subscribed to {ON_DISCONNECTED}", self.label);
                    self.subscribed = true;
                    self.next_check = Some(Instant::now());
                }
                Ok(frame) => {
                    warn!(
                        "[{}] {ON_DISCONNECTED} subscription refused: {:?}",
                        self.label,
                        decoder::err(&frame)
                    );
                    self.next_subscribe =
                        Some(Instant::now() + self.config.failed_subscription_retry());
                }
                Err(e) => {
                    warn!("[{}] {ON_DISCONNECTED} subscription failed: {e}", self.label);
                    self.next_subscribe =
                        Some(Instant::now() + self.config.failed_subscription_retry());
                }
            }
            return;
        }
        if self.subscribed {
            return;
        }
        let due = self.next_subscribe.is_some_and(|at| at <= Instant::now());
        if !due {
            return;
        }
        self.next_subscribe = None;
        debug!("[{}] subscribing to {ON_DISCONNECTED}", self.label);
        match self
            .connect
            .subscribe(ON_DISCONNECTED, "*", self.config.response_timeout())
            .await
        {
            Ok(reply) => self.inflight_subscribe = Some(reply),
            Err(e) => {
                warn!("[{}] cannot subscribe to {ON_DISCONNECTED}: {e}", self.label);
                self.next_subscribe =
                    Some(Instant::now() + self.config.failed_subscription_retry());
            }
        }
    }

    async fn check_connected(&mut self) {
        if !self.subscribed {
            return;
        }
        if let Some(reply) = self.inflight_check.as_mut() {
            let Some(outcome) = reply.try_recv() else { return };
            self.inflight_check = None;
            match outcome {
                Ok(frame) => {
                    let connected = decoder::result(&frame)
                        .ok()
                        .and_then(Value::as_i64)
                        .is_some_and(|n| n == 1);
                    debug!("[{}] isConnected: {connected}", self.label);
                    self.record_connected(connected);
                }
                Err(e) => {
                    warn!("[{}] isConnected check failed: {e}", self.label);
                    self.record_connected(false);
                }
            }
            self.next_check = Some(Instant::now() + self.config.check_connected_period());
            return;
        }
        let due = self.next_check.is_some_and(|at| at <= Instant::now());
        if !due {
            return;
        }
        self.next_check = None;
        match self
            .connect
            .call_mn("isConnected", Value::Null, self.config.response_timeout())
            .await
        {
            Ok(reply) => self.inflight_check = Some(reply),
            Err(e) => {
                warn!("[{}] cannot ask isConnected: {e}", self.label);
                self.record_connected(false);
                self.next_check = Some(Instant::now() + self.config.check_connected_period());
            }
        }
    }
}

#[async_trait]
impl QuikListener for ServerConnectionStatus {
    fn on_event(&mut self, event: &QuikEvent) {
        match event {
            QuikEvent::Opened => {
                info!("[{}] channels open, scheduling subscription", self.label);
                self.on();
            }
            QuikEvent::Closed => {
                info!("[{}] channels closed, readiness dropped", self.label);
                self.off();
            }
            QuikEvent::ChannelError { channel, message } => {
                warn!("[{}] {channel} error, readiness dropped: {message}", self.label);
                self.off();
            }
            QuikEvent::Callback(frame) => {
                if frame.get("callback").and_then(Value::as_str) != Some(ON_DISCONNECTED) {
                    return;
                }
                info!("[{}] {ON_DISCONNECTED} pushed", self.label);
                self.connected_since.store(0, Ordering::Release);
                // Abandon the in-flight poll: a stale `true` arriving after
                // the push must not resurrect readiness.
                self.inflight_check = None;
                self.next_check = Some(Instant::now());
            }
        }
    }

    async fn step(&mut self) {
        self.ensure_subscription().await;
        self.check_connected().await;
    }
}

/// Cross-task view of the readiness signal.
#[derive(Clone)]
pub struct StatusHandle {
    connected_since: Arc<AtomicU64>,
    min_uptime: Duration,
}

impl StatusHandle {
    /// Epoch milliseconds since which the terminal has been connected to the
    /// trading server, or `None` while it is not.
    pub fn connected_since(&self) -> Option<u64> {
        match self.connected_since.load(Ordering::Acquire) {
            0 => None,
            since => Some(since),
        }
    }

    /// Whether the link is ready for trading: connected, and for at least the
    /// configured minimum uptime (warm-up after any connect or reconnect).
    pub fn is_ready(&self) -> bool {
        self.connected_since()
            .is_some_and(|since| now_ms() >= since + self.min_uptime.as_millis() as u64)
    }
}
