use std::sync::Arc;
use std::time::Duration;

use crate::cache::{MarketDataSnapshot, OrderSnapshot};
use crate::recovery::RecoveryEvent;
use crate::state::ConnectionSnapshot;
use crate::types::TimestampMillis;
use crate::ws::types::{Portfolio, SimulatorUpdate};

/// Everything the [`Client`](crate::client::Client) publishes to its subscribers.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub enum Event {
    /// Full state after any change
    StateChange(Arc<ConnectionSnapshot>),
    Connected,
    Disconnected {
        code: u16,
        reason: String,
    },
    /// A recovery attempt has been scheduled
    Reconnecting {
        attempt: u32,
        delay: Duration,
    },
    Heartbeat {
        timestamp: TimestampMillis,
        latency: Duration,
    },
    MarketData(Arc<MarketDataSnapshot>),
    Orders(Arc<OrderSnapshot>),
    Portfolio(Arc<Portfolio>),
    SimulatorUpdate(SimulatorUpdate),
    /// The gateway revoked this device; the host must re-authenticate
    DeviceIdInvalidated {
        reason: String,
    },
    /// The gateway refused the credentials; the host must re-authenticate
    AuthenticationFailed {
        reason: String,
    },
    Recovery(RecoveryEvent),
    /// A protocol or server-reported error that did not close the channel
    Error {
        message: String,
    },
}
