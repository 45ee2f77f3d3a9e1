#![expect(
    clippy::module_name_repetitions,
    reason = "Configuration types intentionally mirror the module name for clarity"
)]

use std::time::Duration;

use rand::Rng as _;

use crate::quality::QualityThresholds;

const DEFAULT_HANDSHAKE_TIMEOUT_DURATION: Duration = Duration::from_secs(10);
const DEFAULT_REQUEST_TIMEOUT_DURATION: Duration = Duration::from_secs(10);
const DEFAULT_HEARTBEAT_INTERVAL_DURATION: Duration = Duration::from_secs(15);
const DEFAULT_HEARTBEAT_TIMEOUT_DURATION: Duration = Duration::from_secs(5);
const DEFAULT_HEARTBEAT_MAX_MISSED: u32 = 3;
const DEFAULT_BASE_DELAY_DURATION: Duration = Duration::from_secs(1);
const DEFAULT_MAX_DELAY_DURATION: Duration = Duration::from_secs(30);
const DEFAULT_MAX_JITTER_DURATION: Duration = Duration::from_secs(1);
const DEFAULT_MAX_ATTEMPTS: u32 = 10;
const DEFAULT_FAILURE_THRESHOLD: u32 = 5;
const DEFAULT_COOLDOWN_DURATION: Duration = Duration::from_secs(60);

/// Configuration for the gateway channel and everything that keeps it alive.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct Config {
    /// Maximum time from opening the transport to the gateway's `connected` reply
    pub handshake_timeout: Duration,
    /// Default timeout for correlated requests
    pub request_timeout: Duration,
    pub heartbeat: HeartbeatConfig,
    /// Reconnection strategy configuration
    pub reconnect: ReconnectConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    /// Latency bounds used to classify heartbeat samples
    pub quality: QualityThresholds,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT_DURATION,
            request_timeout: DEFAULT_REQUEST_TIMEOUT_DURATION,
            heartbeat: HeartbeatConfig::default(),
            reconnect: ReconnectConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            quality: QualityThresholds::default(),
        }
    }
}

/// Configuration for the application-level heartbeat.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// Interval between liveness probes
    pub interval: Duration,
    /// Maximum time to wait for the echo of a probe
    pub timeout: Duration,
    /// Consecutive missed echoes after which the channel is considered stalled
    pub max_missed: u32,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_HEARTBEAT_INTERVAL_DURATION,
            timeout: DEFAULT_HEARTBEAT_TIMEOUT_DURATION,
            max_missed: DEFAULT_HEARTBEAT_MAX_MISSED,
        }
    }
}

/// Configuration for automatic reconnection behavior.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Maximum number of consecutive failed recovery cycles before giving up.
    /// `None` means infinite retries.
    pub max_attempts: Option<u32>,
    /// Delay before the first recovery attempt
    pub base_delay: Duration,
    /// Upper bound of the exponential part of the delay
    pub max_delay: Duration,
    /// Upper bound of the uniformly random jitter added on top
    pub max_jitter: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: Some(DEFAULT_MAX_ATTEMPTS),
            base_delay: DEFAULT_BASE_DELAY_DURATION,
            max_delay: DEFAULT_MAX_DELAY_DURATION,
            max_jitter: DEFAULT_MAX_JITTER_DURATION,
        }
    }
}

impl ReconnectConfig {
    /// `min(max_delay, base_delay * 2^attempt)`, saturating instead of overflowing.
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2_u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    /// [`Self::backoff`] plus a uniformly random jitter in `[0, max_jitter]`.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let jitter = if self.max_jitter.is_zero() {
            Duration::ZERO
        } else {
            rand::rng().random_range(Duration::ZERO..=self.max_jitter)
        };

        self.backoff(attempt).saturating_add(jitter)
    }

    /// Whether `attempts` failed cycles have used up the budget.
    #[must_use]
    pub fn is_exhausted(&self, attempts: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempts >= max)
    }
}

/// Configuration for the reconnection circuit breaker.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive connection failures that open the circuit
    pub failure_threshold: u32,
    /// Time the circuit stays open before allowing a trial attempt
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            cooldown: DEFAULT_COOLDOWN_DURATION,
        }
    }
}
