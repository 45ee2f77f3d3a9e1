//! Guard that halts futile reconnection attempts.
//!
//! CLOSED opens after `failure_threshold` consecutive connection failures. OPEN moves to
//! HALF_OPEN on its own once the cooldown elapses; the breaker owns that timer. HALF_OPEN admits
//! exactly one trial: success closes the circuit, failure reopens it and restarts the cooldown.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep};

use crate::error::{CircuitOpen, ConnectError, Error};
use crate::state::{RecoveryUpdate, UnifiedState};
use crate::ws::config::CircuitBreakerConfig;

#[non_exhaustive]
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, strum_macros::Display,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    #[default]
    Closed,
    Open,
    HalfOpen,
}

/// Errors that may count against the breaker.
pub trait ConnectionFailure {
    fn is_connection_failure(&self) -> bool;
}

impl ConnectionFailure for Error {
    fn is_connection_failure(&self) -> bool {
        Error::is_connection_failure(self)
    }
}

impl ConnectionFailure for ConnectError {
    fn is_connection_failure(&self) -> bool {
        ConnectError::is_connection_failure(self)
    }
}

#[derive(Debug)]
struct Core {
    state: CircuitState,
    failures: u32,
    open_until: Option<Instant>,
    trial_in_flight: bool,
    cooldown: Option<JoinHandle<()>>,
}

#[derive(Debug)]
struct Inner {
    config: CircuitBreakerConfig,
    core: Mutex<Core>,
    state_tx: watch::Sender<CircuitState>,
    unified: Option<Arc<UnifiedState>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        let core = self.core.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(cooldown) = core.cooldown.take() {
            cooldown.abort();
        }
    }
}

/// Cheaply cloneable handle; every clone drives the same circuit.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    inner: Arc<Inner>,
}

impl CircuitBreaker {
    #[must_use]
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self::build(config, None)
    }

    /// A breaker whose transitions are mirrored into `unified` so that observers can tell
    /// "circuit open" apart from "retrying".
    #[must_use]
    pub fn with_state(config: CircuitBreakerConfig, unified: Arc<UnifiedState>) -> Self {
        Self::build(config, Some(unified))
    }

    fn build(mut config: CircuitBreakerConfig, unified: Option<Arc<UnifiedState>>) -> Self {
        config.failure_threshold = config.failure_threshold.max(1);
        let (state_tx, _) = watch::channel(CircuitState::Closed);

        Self {
            inner: Arc::new(Inner {
                config,
                core: Mutex::new(Core {
                    state: CircuitState::Closed,
                    failures: 0,
                    open_until: None,
                    trial_in_flight: false,
                    cooldown: None,
                }),
                state_tx,
                unified,
            }),
        }
    }

    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    #[must_use]
    pub fn watch(&self) -> watch::Receiver<CircuitState> {
        self.inner.state_tx.subscribe()
    }

    /// Consecutive connection failures counted while CLOSED.
    #[must_use]
    pub fn failures(&self) -> u32 {
        self.lock().failures
    }

    /// Time left until the automatic HALF_OPEN transition, when OPEN.
    #[must_use]
    pub fn retry_in(&self) -> Option<Duration> {
        let core = self.lock();
        core.open_until
            .filter(|_| core.state == CircuitState::Open)
            .map(|until| until.saturating_duration_since(Instant::now()))
    }

    /// Runs `f` through the breaker.
    ///
    /// While OPEN, or while the single HALF_OPEN trial is in flight, this returns a
    /// [`CircuitOpen`] failure without polling `f`. Only errors that report themselves as
    /// connection failures are counted.
    pub async fn call<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: Future<Output = Result<T, E>>,
        E: ConnectionFailure + From<CircuitOpen>,
    {
        let permit = self.acquire()?;

        let result = f.await;
        match &result {
            Ok(_) => permit.succeeded(),
            Err(e) if e.is_connection_failure() => permit.failed(),
            Err(_) => drop(permit),
        }

        result
    }

    /// Admits one attempt or rejects it.
    fn acquire(&self) -> Result<Permit<'_>, CircuitOpen> {
        let mut core = self.lock();
        let state = core.state;

        match state {
            CircuitState::Closed => Ok(Permit {
                breaker: self,
                trial: false,
            }),
            CircuitState::HalfOpen if !core.trial_in_flight => {
                core.trial_in_flight = true;
                Ok(Permit {
                    breaker: self,
                    trial: true,
                })
            }
            CircuitState::Open | CircuitState::HalfOpen => {
                let retry_in = core
                    .open_until
                    .filter(|_| state == CircuitState::Open)
                    .map(|until| until.saturating_duration_since(Instant::now()));
                Err(CircuitOpen { retry_in })
            }
        }
    }

    /// Records a successful connection made outside [`Self::call`].
    pub fn record_success(&self) {
        let mut core = self.lock();
        core.failures = 0;
        if core.state != CircuitState::Closed {
            self.transition(&mut core, CircuitState::Closed);
        }
    }

    /// Records a connection failure made outside [`Self::call`].
    pub fn record_failure(&self) {
        let mut core = self.lock();
        let state = core.state;

        match state {
            CircuitState::Closed => {
                core.failures = core.failures.saturating_add(1);
                if core.failures >= self.inner.config.failure_threshold {
                    self.open(&mut core);
                }
            }
            CircuitState::HalfOpen => self.open(&mut core),
            CircuitState::Open => {}
        }
    }

    /// Forces CLOSED, clears the failure count and cancels a pending cooldown.
    pub fn reset(&self) {
        let mut core = self.lock();

        core.failures = 0;
        core.trial_in_flight = false;
        core.open_until = None;
        if let Some(cooldown) = core.cooldown.take() {
            cooldown.abort();
        }
        if core.state != CircuitState::Closed {
            self.transition(&mut core, CircuitState::Closed);
        }
    }

    fn open(&self, core: &mut Core) {
        let cooldown = self.inner.config.cooldown;

        core.failures = 0;
        core.trial_in_flight = false;
        core.open_until = Some(Instant::now() + cooldown);
        if let Some(previous) = core.cooldown.take() {
            previous.abort();
        }

        let weak = Arc::downgrade(&self.inner);
        core.cooldown = Some(tokio::spawn(async move {
            sleep(cooldown).await;
            Self::cooldown_elapsed(&weak);
        }));

        #[cfg(feature = "tracing")]
        tracing::warn!(?cooldown, "circuit breaker opened");

        self.transition(core, CircuitState::Open);
    }

    fn cooldown_elapsed(weak: &Weak<Inner>) {
        let Some(inner) = weak.upgrade() else {
            return;
        };
        let breaker = Self { inner };
        let mut core = breaker.lock();

        core.cooldown = None;
        if core.state == CircuitState::Open {
            core.open_until = None;
            breaker.transition(&mut core, CircuitState::HalfOpen);
        }
    }

    /// Publishes while the core lock is held so observers see transitions in order.
    fn transition(&self, core: &mut Core, next: CircuitState) {
        #[cfg(feature = "tracing")]
        tracing::debug!(from = %core.state, to = %next, "circuit breaker transition");

        core.state = next;
        self.inner.state_tx.send_replace(next);
        if let Some(unified) = &self.inner.unified {
            unified.update_recovery(RecoveryUpdate::new().circuit(next));
        }
    }

    fn lock(&self) -> MutexGuard<'_, Core> {
        self.inner
            .core
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// One admitted attempt. Dropping it without an outcome releases a HALF_OPEN trial slot.
struct Permit<'breaker> {
    breaker: &'breaker CircuitBreaker,
    trial: bool,
}

impl Permit<'_> {
    fn succeeded(self) {
        self.breaker.record_success();
    }

    fn failed(self) {
        self.breaker.record_failure();
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if self.trial {
            self.breaker.lock().trial_in_flight = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::error::Kind;

    fn config(threshold: u32) -> CircuitBreakerConfig {
        let mut config = CircuitBreakerConfig::default();
        config.failure_threshold = threshold;
        config
    }

    async fn fail(breaker: &CircuitBreaker, calls: &AtomicU32) -> Result<(), ConnectError> {
        breaker
            .call(async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ConnectError::Transport("refused".to_owned()))
            })
            .await
    }

    #[tokio::test(start_paused = true)]
    async fn opens_after_threshold_and_rejects_without_calling() {
        let breaker = CircuitBreaker::new(config(5));
        let calls = AtomicU32::new(0);

        for _ in 0..5 {
            _ = fail(&breaker, &calls).await;
        }
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(calls.load(Ordering::SeqCst), 5);

        let result = fail(&breaker, &calls).await;
        assert_eq!(result, Err(ConnectError::CircuitOpen));
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn success_resets_consecutive_count() {
        let breaker = CircuitBreaker::new(config(3));
        let calls = AtomicU32::new(0);

        _ = fail(&breaker, &calls).await;
        _ = fail(&breaker, &calls).await;
        breaker
            .call(async { Ok::<_, ConnectError>(()) })
            .await
            .expect("closed circuit admits calls");
        _ = fail(&breaker, &calls).await;

        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failures(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn authentication_failures_are_not_counted() {
        let breaker = CircuitBreaker::new(config(1));

        let result = breaker
            .call(async { Err::<(), _>(ConnectError::Authentication("expired".to_owned())) })
            .await;

        assert!(result.is_err(), "the error is passed through");
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn cooldown_moves_to_half_open_by_itself() {
        let breaker = CircuitBreaker::new(config(1));
        let calls = AtomicU32::new(0);
        let started = Instant::now();

        _ = fail(&breaker, &calls).await;
        assert_eq!(breaker.retry_in(), Some(Duration::from_secs(60)));

        let mut rx = breaker.watch();
        rx.wait_for(|state| *state == CircuitState::HalfOpen)
            .await
            .expect("breaker alive");

        assert!(started.elapsed() >= Duration::from_secs(60));
        assert_eq!(breaker.retry_in(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_trial_failure_reopens_and_success_closes() {
        let breaker = CircuitBreaker::new(config(1));
        let calls = AtomicU32::new(0);

        _ = fail(&breaker, &calls).await;
        breaker
            .watch()
            .wait_for(|state| *state == CircuitState::HalfOpen)
            .await
            .expect("breaker alive");

        _ = fail(&breaker, &calls).await;
        assert_eq!(breaker.state(), CircuitState::Open);

        breaker
            .watch()
            .wait_for(|state| *state == CircuitState::HalfOpen)
            .await
            .expect("breaker alive");
        breaker
            .call(async { Ok::<_, Error>(()) })
            .await
            .expect("trial admitted");
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_admits_a_single_trial() {
        let breaker = CircuitBreaker::new(config(1));
        breaker.record_failure();
        breaker
            .watch()
            .wait_for(|state| *state == CircuitState::HalfOpen)
            .await
            .expect("breaker alive");

        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let trial = {
            let breaker = breaker.clone();
            tokio::spawn(async move {
                breaker
                    .call(async {
                        _ = release_rx.await;
                        Ok::<_, Error>(())
                    })
                    .await
            })
        };
        tokio::task::yield_now().await;

        let second = breaker.call(async { Ok::<_, Error>(()) }).await;
        assert_eq!(second.expect_err("rejected").kind(), Kind::CircuitOpen);

        release_tx.send(()).expect("trial waiting");
        trial.await.expect("join").expect("trial succeeded");
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn reset_closes_and_cancels_cooldown() {
        let breaker = CircuitBreaker::new(config(1));
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);

        breaker.reset();
        assert_eq!(breaker.state(), CircuitState::Closed);

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn transitions_are_mirrored_into_unified_state() {
        let unified = Arc::new(UnifiedState::default());
        let breaker = CircuitBreaker::with_state(config(1), Arc::clone(&unified));

        breaker.record_failure();
        assert_eq!(unified.snapshot().recovery.circuit, CircuitState::Open);

        breaker.reset();
        assert_eq!(unified.snapshot().recovery.circuit, CircuitState::Closed);
    }
}
