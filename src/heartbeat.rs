//! Connection liveness and reconnection policy.
//!
//! [`HeartbeatMonitor`] is the deterministic core: it decides when to
//! probe, when the connection is considered lost, and how long to back
//! off between reconnect attempts. [`HeartbeatDriver`] is the async
//! runner that feeds it from a `tokio::time` interval and publishes
//! status through a watch channel.
//!
//! Reconnection deliberately resynchronizes in full: after the
//! transport comes back, the client re-authenticates and requests a
//! complete recap instead of replaying buffered deltas.

use crate::protocol::ClientMessage;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::debug;

/// Backoff schedule for reconnect attempts.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt `attempt` (zero-based).
    /// Doubles each attempt, capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.initial_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Liveness probe settings.
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// How often to send a probe while connected.
    pub probe_interval: Duration,

    /// Unanswered probes tolerated before the connection is declared
    /// lost.
    pub miss_limit: u32,

    pub reconnect: ReconnectPolicy,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_secs(15),
            miss_limit: 2,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl HeartbeatConfig {
    pub fn with_probe_interval(mut self, interval: Duration) -> Self {
        self.probe_interval = interval;
        self
    }

    pub fn with_miss_limit(mut self, limit: u32) -> Self {
        self.miss_limit = limit;
        self
    }

    pub fn with_reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }
}

/// Client-visible connection status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connected,
    Reconnecting { attempt: u32 },
    Disconnected,
}

/// What to do on a probe tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeAction {
    /// Send a ping.
    Probe,

    /// Too many unanswered probes; schedule a reconnect.
    ConnectionLost { retry_in: Duration },

    /// Not connected; probing is suspended.
    Idle,
}

/// Deterministic liveness state machine.
#[derive(Debug)]
pub struct HeartbeatMonitor {
    config: HeartbeatConfig,
    status: ConnectionStatus,
    outstanding: u32,
}

impl HeartbeatMonitor {
    pub fn new(config: HeartbeatConfig) -> Self {
        Self {
            config,
            status: ConnectionStatus::Connected,
            outstanding: 0,
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    /// Advance one probe interval.
    pub fn on_probe_tick(&mut self) -> ProbeAction {
        match self.status {
            ConnectionStatus::Connected => {
                if self.outstanding >= self.config.miss_limit {
                    self.status = ConnectionStatus::Reconnecting { attempt: 0 };
                    self.outstanding = 0;
                    ProbeAction::ConnectionLost {
                        retry_in: self.config.reconnect.delay_for(0),
                    }
                } else {
                    self.outstanding += 1;
                    ProbeAction::Probe
                }
            }
            _ => ProbeAction::Idle,
        }
    }

    /// A pong arrived; all outstanding probes are answered.
    pub fn on_pong(&mut self) {
        self.outstanding = 0;
    }

    /// The transport dropped out from under us. Returns the delay
    /// before the first reconnect attempt.
    pub fn on_disconnect(&mut self) -> Duration {
        self.status = ConnectionStatus::Reconnecting { attempt: 0 };
        self.outstanding = 0;
        self.config.reconnect.delay_for(0)
    }

    /// A reconnect attempt failed. Returns the backed-off delay before
    /// the next one.
    pub fn on_reconnect_failed(&mut self) -> Duration {
        let attempt = match self.status {
            ConnectionStatus::Reconnecting { attempt } => attempt + 1,
            _ => 0,
        };
        self.status = ConnectionStatus::Reconnecting { attempt };
        self.config.reconnect.delay_for(attempt)
    }

    /// The transport is back. The caller should immediately send the
    /// messages from [`resync_messages`] to restore session state.
    pub fn on_reconnected(&mut self) {
        debug!("connection restored, requesting resync");
        self.status = ConnectionStatus::Connected;
        self.outstanding = 0;
    }

    /// The client is shutting down for good.
    pub fn on_closed(&mut self) {
        self.status = ConnectionStatus::Disconnected;
    }
}

/// The messages that restore session state after a reconnect: full
/// re-authentication followed by a complete history recap.
pub fn resync_messages(token: impl Into<String>, adventure_id: impl Into<String>) -> [ClientMessage; 2] {
    [
        ClientMessage::Authenticate {
            token: token.into(),
            adventure_id: adventure_id.into(),
        },
        ClientMessage::Recap,
    ]
}

/// Feed for pongs and status observation, handed to the owner of the
/// transport.
#[derive(Clone)]
pub struct HeartbeatHandle {
    pongs: mpsc::Sender<()>,
    status: watch::Receiver<ConnectionStatus>,
}

impl HeartbeatHandle {
    /// Record an observed pong.
    pub async fn pong(&self) {
        let _ = self.pongs.send(()).await;
    }

    /// Current status.
    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    /// Watch for status transitions.
    pub fn status_changes(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }
}

/// Interval-driven runner around [`HeartbeatMonitor`].
pub struct HeartbeatDriver {
    monitor: HeartbeatMonitor,
    probe_interval: Duration,
    probes: mpsc::Sender<ClientMessage>,
    pongs: mpsc::Receiver<()>,
    status_tx: watch::Sender<ConnectionStatus>,
}

impl HeartbeatDriver {
    /// Build a driver that pushes pings into `probes`. The returned
    /// handle records pongs and exposes status.
    pub fn new(
        config: HeartbeatConfig,
        probes: mpsc::Sender<ClientMessage>,
    ) -> (Self, HeartbeatHandle) {
        let (pong_tx, pong_rx) = mpsc::channel(8);
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::Connected);
        let probe_interval = config.probe_interval;
        let driver = Self {
            monitor: HeartbeatMonitor::new(config),
            probe_interval,
            probes,
            pongs: pong_rx,
            status_tx,
        };
        let handle = HeartbeatHandle {
            pongs: pong_tx,
            status: status_rx,
        };
        (driver, handle)
    }

    /// Run until the probe channel or the handle is dropped.
    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.probe_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => match self.monitor.on_probe_tick() {
                    ProbeAction::Probe => {
                        if self.probes.send(ClientMessage::Ping).await.is_err() {
                            break;
                        }
                    }
                    ProbeAction::ConnectionLost { retry_in } => {
                        debug!(?retry_in, "heartbeat missed, connection presumed lost");
                        let _ = self.status_tx.send(self.monitor.status());
                    }
                    ProbeAction::Idle => {}
                },
                pong = self.pongs.recv() => match pong {
                    Some(()) => {
                        self.monitor.on_pong();
                        let _ = self.status_tx.send(self.monitor.status());
                    }
                    None => break,
                },
            }
        }
    }
}
