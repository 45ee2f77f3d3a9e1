use std::time::Duration;

use serde::{Deserialize, Serialize};

const DEFAULT_GOOD_LATENCY: Duration = Duration::from_millis(250);
const DEFAULT_DEGRADED_LATENCY: Duration = Duration::from_millis(750);

/// Discrete link quality derived from the latest heartbeat round trip.
#[non_exhaustive]
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, strum_macros::Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ConnectionQuality {
    Good,
    Degraded,
    Poor,
    /// No fresh sample, or the connection is not established
    #[default]
    Unknown,
}

/// Latency bounds (inclusive) separating the quality levels.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QualityThresholds {
    pub good: Duration,
    pub degraded: Duration,
}

impl Default for QualityThresholds {
    fn default() -> Self {
        Self {
            good: DEFAULT_GOOD_LATENCY,
            degraded: DEFAULT_DEGRADED_LATENCY,
        }
    }
}

impl QualityThresholds {
    /// Maps a round-trip latency in milliseconds to a quality level.
    ///
    /// Negative or absent samples are [`ConnectionQuality::Unknown`].
    #[must_use]
    pub fn classify(&self, latency_ms: Option<i64>) -> ConnectionQuality {
        let Some(latency_ms) = latency_ms else {
            return ConnectionQuality::Unknown;
        };
        let Ok(latency_ms) = u64::try_from(latency_ms) else {
            return ConnectionQuality::Unknown;
        };

        let latency = Duration::from_millis(latency_ms);
        if latency <= self.good {
            ConnectionQuality::Good
        } else if latency <= self.degraded {
            ConnectionQuality::Degraded
        } else {
            ConnectionQuality::Poor
        }
    }
}

/// [`QualityThresholds::classify`] with the default 250ms / 750ms bounds.
#[must_use]
pub fn classify(latency_ms: Option<i64>) -> ConnectionQuality {
    QualityThresholds::default().classify(latency_ms)
}
