//! Single writable source of truth for connection status.
//!
//! [`UnifiedState`] owns one [`ServiceState`] per logical channel and derives the overall
//! [`ConnectionStatus`] from them. Every other component reads snapshots or subscribes to
//! [`StateEvent`]s; only the narrow setters below mutate anything.
//!
//! Notifications are published while the state lock is held, so subscribers observe them in
//! exactly the order the setters were called.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};

use crate::circuit_breaker::CircuitState;
use crate::quality::{ConnectionQuality, QualityThresholds};
use crate::types::TimestampMillis;

/// Broadcast channel capacity for state notifications.
const STATE_EVENT_CAPACITY: usize = 256;

/// Error recorded on every channel by [`UnifiedState::reset`].
pub const RESET_ERROR: &str = "state reset";

#[non_exhaustive]
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, strum_macros::Display,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    /// Aggregate-only: a recovery cycle is active
    Recovering,
}

/// Logical channels tracked by the state.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum_macros::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ChannelKind {
    /// The gateway duplex channel; drives the overall status
    Gateway,
    /// The market data stream layered on top of the gateway
    MarketData,
}

impl ChannelKind {
    #[must_use]
    pub const fn is_primary(self) -> bool {
        matches!(self, Self::Gateway)
    }
}

/// Lifecycle of the trading simulator attached to the session.
#[non_exhaustive]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, strum_macros::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum SimulatorStatus {
    #[default]
    Idle,
    Starting,
    Running,
    Stopping,
    Stopped,
    Error,
    /// Unknown status from the gateway (captures the raw value for debugging).
    #[serde(untagged)]
    Unknown(String),
}

#[non_exhaustive]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceState {
    pub status: ConnectionStatus,
    pub last_connected_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub recovery_attempts: u32,
}

/// Partial update merged by [`UnifiedState::update_service_state`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceUpdate {
    status: Option<ConnectionStatus>,
    last_error: Option<Option<String>>,
    recovery_attempts: Option<u32>,
}

impl ServiceUpdate {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn status(mut self, status: ConnectionStatus) -> Self {
        self.status = Some(status);
        self
    }

    #[must_use]
    pub fn error<S: Into<String>>(mut self, error: S) -> Self {
        self.last_error = Some(Some(error.into()));
        self
    }

    #[must_use]
    pub fn clear_error(mut self) -> Self {
        self.last_error = Some(None);
        self
    }

    #[must_use]
    pub fn recovery_attempts(mut self, attempts: u32) -> Self {
        self.recovery_attempts = Some(attempts);
        self
    }
}

#[non_exhaustive]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatInfo {
    /// Timestamp carried by the last echoed probe
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub latency: Option<Duration>,
    pub quality: ConnectionQuality,
}

#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryInfo {
    pub is_recovering: bool,
    /// Number of the attempt currently scheduled or running (1-based), 0 when idle
    pub attempt: u32,
    /// Automatic recovery gave up; distinct from an ordinary disconnect
    pub exhausted: bool,
    pub online: bool,
    pub circuit: CircuitState,
    pub next_attempt_in: Option<Duration>,
}

impl Default for RecoveryInfo {
    fn default() -> Self {
        Self {
            is_recovering: false,
            attempt: 0,
            exhausted: false,
            online: true,
            circuit: CircuitState::Closed,
            next_attempt_in: None,
        }
    }
}

/// Partial update merged by [`UnifiedState::update_recovery`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryUpdate {
    is_recovering: Option<bool>,
    attempt: Option<u32>,
    exhausted: Option<bool>,
    online: Option<bool>,
    circuit: Option<CircuitState>,
    next_attempt_in: Option<Option<Duration>>,
}

impl RecoveryUpdate {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn recovering(mut self, is_recovering: bool) -> Self {
        self.is_recovering = Some(is_recovering);
        self
    }

    #[must_use]
    pub fn attempt(mut self, attempt: u32) -> Self {
        self.attempt = Some(attempt);
        self
    }

    #[must_use]
    pub fn exhausted(mut self, exhausted: bool) -> Self {
        self.exhausted = Some(exhausted);
        self
    }

    #[must_use]
    pub fn online(mut self, online: bool) -> Self {
        self.online = Some(online);
        self
    }

    #[must_use]
    pub fn circuit(mut self, circuit: CircuitState) -> Self {
        self.circuit = Some(circuit);
        self
    }

    #[must_use]
    pub fn next_attempt_in(mut self, delay: Option<Duration>) -> Self {
        self.next_attempt_in = Some(delay);
        self
    }
}

/// Immutable view of the whole connection state.
#[non_exhaustive]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionSnapshot {
    pub gateway: ServiceState,
    pub market_data: ServiceState,
    pub overall: ConnectionStatus,
    pub simulator_id: Option<String>,
    pub simulator_status: SimulatorStatus,
    pub heartbeat: HeartbeatInfo,
    pub recovery: RecoveryInfo,
}

impl ConnectionSnapshot {
    #[must_use]
    pub fn service(&self, channel: ChannelKind) -> &ServiceState {
        match channel {
            ChannelKind::Gateway => &self.gateway,
            ChannelKind::MarketData => &self.market_data,
        }
    }

    fn service_mut(&mut self, channel: ChannelKind) -> &mut ServiceState {
        match channel {
            ChannelKind::Gateway => &mut self.gateway,
            ChannelKind::MarketData => &mut self.market_data,
        }
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.overall == ConnectionStatus::Connected
    }

    #[must_use]
    pub fn quality(&self) -> ConnectionQuality {
        self.heartbeat.quality
    }

    fn derive_overall(&mut self) {
        self.overall = if self.recovery.is_recovering {
            ConnectionStatus::Recovering
        } else {
            self.gateway.status
        };
        if self.overall != ConnectionStatus::Connected {
            self.heartbeat.quality = ConnectionQuality::Unknown;
        }
    }
}

/// Scoped notifications. Each scoped event is immediately followed by a [`StateEvent::Snapshot`].
#[non_exhaustive]
#[derive(Debug, Clone)]
pub enum StateEvent {
    ServiceChanged {
        channel: ChannelKind,
        state: ServiceState,
    },
    SimulatorChanged {
        simulator_id: Option<String>,
        status: SimulatorStatus,
    },
    HeartbeatChanged(HeartbeatInfo),
    RecoveryChanged(RecoveryInfo),
    Reset,
    Snapshot(Arc<ConnectionSnapshot>),
}

#[derive(Debug)]
pub struct UnifiedState {
    snapshot: Mutex<ConnectionSnapshot>,
    thresholds: QualityThresholds,
    events_tx: broadcast::Sender<StateEvent>,
    latest_tx: watch::Sender<Arc<ConnectionSnapshot>>,
}

impl Default for UnifiedState {
    fn default() -> Self {
        Self::new(QualityThresholds::default())
    }
}

impl UnifiedState {
    #[must_use]
    pub fn new(thresholds: QualityThresholds) -> Self {
        let (events_tx, _) = broadcast::channel(STATE_EVENT_CAPACITY);
        let (latest_tx, _) = watch::channel(Arc::new(ConnectionSnapshot::default()));

        Self {
            snapshot: Mutex::new(ConnectionSnapshot::default()),
            thresholds,
            events_tx,
            latest_tx,
        }
    }

    /// Returns a copy of the current state, never a live reference.
    #[must_use]
    pub fn snapshot(&self) -> ConnectionSnapshot {
        self.lock().clone()
    }

    #[must_use]
    pub fn overall(&self) -> ConnectionStatus {
        self.lock().overall
    }

    /// Subscribe to scoped and snapshot notifications.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<StateEvent> {
        self.events_tx.subscribe()
    }

    /// Subscribe to the latest snapshot only, skipping intermediate values.
    #[must_use]
    pub fn watch(&self) -> watch::Receiver<Arc<ConnectionSnapshot>> {
        self.latest_tx.subscribe()
    }

    /// Merges `update` into the state of `channel`.
    ///
    /// Returns `false`, and publishes nothing, when no field actually changes. A transition into
    /// [`ConnectionStatus::Connected`] stamps `last_connected_at` and resets `recovery_attempts` to 0.
    pub fn update_service_state(&self, channel: ChannelKind, update: ServiceUpdate) -> bool {
        let mut guard = self.lock();
        let current = guard.service(channel).clone();
        let mut next = current.clone();

        if let Some(status) = update.status {
            next.status = status;
        }
        if let Some(last_error) = update.last_error {
            next.last_error = last_error;
        }
        if let Some(attempts) = update.recovery_attempts {
            next.recovery_attempts = attempts;
        }
        if next.status == ConnectionStatus::Connected
            && current.status != ConnectionStatus::Connected
        {
            next.recovery_attempts = 0;
            next.last_connected_at = Some(Utc::now());
        }

        if next == current {
            return false;
        }

        #[cfg(feature = "tracing")]
        if next.status != current.status {
            tracing::debug!(
                %channel,
                from = %current.status,
                to = %next.status,
                error = next.last_error.as_deref(),
                "service status changed"
            );
        }

        *guard.service_mut(channel) = next.clone();
        if channel.is_primary() {
            guard.derive_overall();
        }

        self.publish(
            &guard,
            StateEvent::ServiceChanged {
                channel,
                state: next,
            },
        );
        true
    }

    /// Records the simulator attached to the session. `None` leaves the id unchanged.
    pub fn update_simulator_status(
        &self,
        status: SimulatorStatus,
        simulator_id: Option<String>,
    ) -> bool {
        let mut guard = self.lock();
        let next_id = simulator_id.or_else(|| guard.simulator_id.clone());

        if guard.simulator_status == status && guard.simulator_id == next_id {
            return false;
        }

        guard.simulator_status = status.clone();
        guard.simulator_id.clone_from(&next_id);

        self.publish(
            &guard,
            StateEvent::SimulatorChanged {
                simulator_id: next_id,
                status,
            },
        );
        true
    }

    /// Records a heartbeat sample.
    ///
    /// The quality is only classified while the overall status is CONNECTED; samples delivered in
    /// any other state yield [`ConnectionQuality::Unknown`].
    pub fn update_heartbeat(&self, timestamp: TimestampMillis, latency: Duration) -> bool {
        let mut guard = self.lock();

        let quality = if guard.overall == ConnectionStatus::Connected {
            let latency_ms = i64::try_from(latency.as_millis()).ok();
            self.thresholds.classify(latency_ms)
        } else {
            ConnectionQuality::Unknown
        };
        let next = HeartbeatInfo {
            last_heartbeat: DateTime::from_timestamp_millis(timestamp),
            latency: Some(latency),
            quality,
        };

        if guard.heartbeat == next {
            return false;
        }

        guard.heartbeat = next.clone();
        self.publish(&guard, StateEvent::HeartbeatChanged(next));
        true
    }

    pub fn update_recovery(&self, update: RecoveryUpdate) -> bool {
        let mut guard = self.lock();
        let current = guard.recovery.clone();
        let mut next = current.clone();

        if let Some(is_recovering) = update.is_recovering {
            next.is_recovering = is_recovering;
        }
        if let Some(attempt) = update.attempt {
            next.attempt = attempt;
        }
        if let Some(exhausted) = update.exhausted {
            next.exhausted = exhausted;
        }
        if let Some(online) = update.online {
            next.online = online;
        }
        if let Some(circuit) = update.circuit {
            next.circuit = circuit;
        }
        if let Some(next_attempt_in) = update.next_attempt_in {
            next.next_attempt_in = next_attempt_in;
        }

        if next == current {
            return false;
        }

        guard.recovery = next.clone();
        guard.derive_overall();

        self.publish(&guard, StateEvent::RecoveryChanged(next));
        true
    }

    /// Forces every channel to DISCONNECTED with a [`RESET_ERROR`] and clears recovery, quality and
    /// heartbeat fields. Used on logout or after a fatal desync.
    pub fn reset(&self) {
        let mut guard = self.lock();

        for channel in [ChannelKind::Gateway, ChannelKind::MarketData] {
            let service = guard.service_mut(channel);
            service.status = ConnectionStatus::Disconnected;
            service.last_error = Some(RESET_ERROR.to_owned());
            service.recovery_attempts = 0;
        }
        guard.heartbeat = HeartbeatInfo::default();
        guard.recovery = RecoveryInfo {
            online: guard.recovery.online,
            circuit: guard.recovery.circuit,
            ..RecoveryInfo::default()
        };
        guard.derive_overall();

        #[cfg(feature = "tracing")]
        tracing::debug!("connection state reset");

        self.publish(&guard, StateEvent::Reset);
    }

    fn publish(&self, snapshot: &ConnectionSnapshot, scoped: StateEvent) {
        let snapshot = Arc::new(snapshot.clone());

        _ = self.events_tx.send(scoped);
        _ = self
            .events_tx
            .send(StateEvent::Snapshot(Arc::clone(&snapshot)));
        self.latest_tx.send_replace(snapshot);
    }

    fn lock(&self) -> MutexGuard<'_, ConnectionSnapshot> {
        // Every mutation computes into a local value before assigning, so a poisoned guard still
        // holds a consistent snapshot.
        self.snapshot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
