//! Reconnection policy.
//!
//! The [`Recovery`] driver decides whether and when to run a recovery cycle; the cycle itself
//! (session, handshake, data stream) is supplied by a [`RecoveryCycle`] implementation. All
//! decisions are made on one task that consumes commands in the order they were issued, so
//! observers see them applied in call order.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt as _;
use futures::future::{BoxFuture, pending};
use tokio::sync::{broadcast, mpsc};
use tokio::time::{Instant, sleep_until};

use crate::circuit_breaker::{CircuitBreaker, CircuitState};
use crate::error::ConnectError;
use crate::state::{ChannelKind, RecoveryUpdate, ServiceUpdate, UnifiedState};
use crate::ws::config::ReconnectConfig;

const EVENT_CAPACITY: usize = 256;

/// Proof that a recovery cycle is still wanted.
///
/// A stop, a manual reconnect or a fresh connect invalidates every ticket handed out before it.
#[derive(Debug, Clone)]
pub struct RecoveryTicket {
    epoch: u64,
    current: Arc<AtomicU64>,
}

impl RecoveryTicket {
    #[must_use]
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    #[must_use]
    pub fn is_current(&self) -> bool {
        self.current.load(Ordering::SeqCst) == self.epoch
    }

    /// Fails with [`ConnectError::Superseded`] once the ticket is stale. Check it before every
    /// sub-step that writes state.
    pub fn ensure_current(&self) -> Result<(), ConnectError> {
        if self.is_current() {
            Ok(())
        } else {
            Err(ConnectError::Superseded)
        }
    }
}

/// One end-to-end attempt to get back to CONNECTED.
#[async_trait]
pub trait RecoveryCycle: Send + Sync + 'static {
    /// `attempt` is 1-based and counts the cycles since the last success.
    async fn run(&self, ticket: RecoveryTicket, attempt: u32) -> Result<(), ConnectError>;
}

#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryEvent {
    Scheduled { attempt: u32, delay: Duration },
    AttemptStarted { attempt: u32 },
    AttemptSucceeded { attempt: u32 },
    AttemptFailed { attempt: u32, error: ConnectError },
    /// The attempt budget is used up; only a manual reconnect restarts recovery
    Exhausted { attempts: u32 },
    /// The host is offline; nothing will be attempted until it comes back
    Suspended,
    /// The circuit is open; the next attempt waits for the trial window
    WaitingForCircuit,
    /// A failure that retrying cannot fix ended recovery without being counted
    Abandoned { error: ConnectError },
}

#[derive(Debug)]
enum Command {
    Begin,
    Stop,
    Disconnected,
    Reconnect,
    Manual,
    Online(bool),
}

/// Handle to the recovery driver. Clones drive the same task; it ends with the last handle.
#[derive(Debug, Clone)]
pub struct Recovery {
    commands: mpsc::UnboundedSender<Command>,
    events_tx: broadcast::Sender<RecoveryEvent>,
    epoch: Arc<AtomicU64>,
}

impl Recovery {
    /// Spawns the driver. Must be called within a tokio runtime.
    #[must_use]
    pub fn spawn(
        config: ReconnectConfig,
        breaker: CircuitBreaker,
        state: Arc<UnifiedState>,
        cycle: Arc<dyn RecoveryCycle>,
    ) -> Self {
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);
        let epoch = Arc::new(AtomicU64::new(0));
        let online = state.snapshot().recovery.online;

        let driver = Driver {
            config,
            breaker,
            state,
            cycle,
            events_tx: events_tx.clone(),
            epoch: Arc::clone(&epoch),
            desired: false,
            online,
            recovering: false,
            exhausted: false,
            waiting_for_circuit: false,
            attempts: 0,
            deadline: None,
        };
        tokio::spawn(driver.run(commands_rx));

        Self {
            commands,
            events_tx,
            epoch,
        }
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<RecoveryEvent> {
        self.events_tx.subscribe()
    }

    /// Marks the connection as wanted after a fresh connect. Clears counters and supersedes any
    /// cycle in flight.
    pub fn begin(&self) {
        self.supersede();
        self.command(Command::Begin);
    }

    /// Marks the connection as unwanted. Cancels any scheduled or running cycle.
    pub fn stop(&self) {
        self.supersede();
        self.command(Command::Stop);
    }

    /// Reports an unexpected loss of the primary channel.
    pub fn notify_disconnected(&self) {
        self.command(Command::Disconnected);
    }

    /// Starts recovery with the regular backoff. Ignored once exhausted.
    pub fn reconnect(&self) {
        self.command(Command::Reconnect);
    }

    /// Resets the breaker and the attempt counter and runs a cycle right away, or as soon as the
    /// host is back online.
    pub fn manual_reconnect(&self) {
        self.supersede();
        self.command(Command::Manual);
    }

    pub fn set_online(&self, online: bool) {
        self.command(Command::Online(online));
    }

    fn supersede(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
    }

    fn command(&self, command: Command) {
        // The driver only stops once every handle is gone.
        _ = self.commands.send(command);
    }
}

struct Outcome {
    epoch: u64,
    attempt: u32,
    result: Result<(), ConnectError>,
}

struct Driver {
    config: ReconnectConfig,
    breaker: CircuitBreaker,
    state: Arc<UnifiedState>,
    cycle: Arc<dyn RecoveryCycle>,
    events_tx: broadcast::Sender<RecoveryEvent>,
    epoch: Arc<AtomicU64>,
    desired: bool,
    online: bool,
    recovering: bool,
    exhausted: bool,
    waiting_for_circuit: bool,
    attempts: u32,
    deadline: Option<Instant>,
}

type InFlight = Option<BoxFuture<'static, Outcome>>;

impl Driver {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        let mut circuit = self.breaker.watch();
        let mut circuit_alive = true;
        let mut in_flight: InFlight = None;

        loop {
            let deadline = self.deadline;

            tokio::select! {
                command = commands.recv() => {
                    let Some(command) = command else { break };
                    self.handle(command, &mut in_flight);
                }
                () = sleep_until(deadline.unwrap_or_else(Instant::now)),
                    if deadline.is_some() && in_flight.is_none() =>
                {
                    self.deadline = None;
                    self.start_attempt(&mut in_flight);
                }
                outcome = async {
                    match in_flight.as_mut() {
                        Some(cycle) => cycle.await,
                        None => pending().await,
                    }
                }, if in_flight.is_some() => {
                    in_flight = None;
                    self.finish(outcome);
                }
                changed = circuit.changed(), if circuit_alive => {
                    if changed.is_err() {
                        circuit_alive = false;
                        continue;
                    }
                    let state = *circuit.borrow_and_update();
                    self.on_circuit(state, &mut in_flight);
                }
            }
        }
    }

    fn handle(&mut self, command: Command, in_flight: &mut InFlight) {
        #[cfg(feature = "tracing")]
        tracing::debug!(?command, recovering = self.recovering, "recovery command");

        match command {
            Command::Begin => {
                *in_flight = None;
                self.desired = true;
                self.clear();
                self.publish(None);
            }
            Command::Stop => {
                *in_flight = None;
                self.desired = false;
                self.clear();
                self.publish(None);
            }
            Command::Disconnected => {
                if !self.desired || self.exhausted || self.recovering {
                    return;
                }
                self.recovering = true;
                self.schedule();
            }
            Command::Reconnect => {
                self.desired = true;
                if self.exhausted {
                    #[cfg(feature = "tracing")]
                    tracing::warn!("recovery exhausted; waiting for a manual reconnect");
                    return;
                }
                if self.recovering && (in_flight.is_some() || self.deadline.is_some()) {
                    return;
                }
                self.recovering = true;
                self.schedule();
            }
            Command::Manual => {
                *in_flight = None;
                self.breaker.reset();
                self.desired = true;
                self.clear();
                self.recovering = true;
                self.start_attempt(in_flight);
            }
            Command::Online(online) => {
                if online == self.online {
                    return;
                }
                self.online = online;

                if !online {
                    self.deadline = None;
                    if self.recovering {
                        self.emit(RecoveryEvent::Suspended);
                    }
                    self.publish(None);
                } else if self.recovering && !self.exhausted && in_flight.is_none() {
                    self.start_attempt(in_flight);
                } else {
                    self.publish(None);
                }
            }
        }
    }

    fn clear(&mut self) {
        self.recovering = false;
        self.exhausted = false;
        self.waiting_for_circuit = false;
        self.attempts = 0;
        self.deadline = None;
    }

    /// Arms the backoff timer for the next attempt.
    fn schedule(&mut self) {
        if !self.online {
            self.emit(RecoveryEvent::Suspended);
            self.publish(None);
            return;
        }
        if self.breaker.state() == CircuitState::Open {
            self.wait_for_circuit();
            return;
        }

        let delay = self.config.delay_for(self.attempts);
        self.deadline = Some(Instant::now() + delay);

        #[cfg(feature = "tracing")]
        tracing::info!(attempt = self.attempts + 1, ?delay, "scheduling recovery attempt");

        self.emit(RecoveryEvent::Scheduled {
            attempt: self.attempts + 1,
            delay,
        });
        self.publish(Some(delay));
    }

    fn wait_for_circuit(&mut self) {
        self.waiting_for_circuit = true;
        self.deadline = None;
        self.emit(RecoveryEvent::WaitingForCircuit);
        self.publish(self.breaker.retry_in());
    }

    fn start_attempt(&mut self, in_flight: &mut InFlight) {
        if !self.online {
            self.deadline = None;
            self.emit(RecoveryEvent::Suspended);
            self.publish(None);
            return;
        }
        if self.breaker.state() == CircuitState::Open {
            self.wait_for_circuit();
            return;
        }

        self.waiting_for_circuit = false;
        self.deadline = None;

        let attempt = self.attempts + 1;
        let ticket = RecoveryTicket {
            epoch: self.epoch.load(Ordering::SeqCst),
            current: Arc::clone(&self.epoch),
        };
        let epoch = ticket.epoch;
        let cycle = Arc::clone(&self.cycle);
        let breaker = self.breaker.clone();

        self.emit(RecoveryEvent::AttemptStarted { attempt });
        self.publish(None);

        *in_flight = Some(
            async move {
                let result = breaker.call(cycle.run(ticket, attempt)).await;
                Outcome {
                    epoch,
                    attempt,
                    result,
                }
            }
            .boxed(),
        );
    }

    fn finish(&mut self, outcome: Outcome) {
        let Outcome {
            epoch,
            attempt,
            result,
        } = outcome;

        if epoch != self.epoch.load(Ordering::SeqCst) || !self.recovering {
            #[cfg(feature = "tracing")]
            tracing::debug!(attempt, "discarding outcome of a superseded recovery cycle");
            return;
        }

        match result {
            Ok(()) => {
                #[cfg(feature = "tracing")]
                tracing::info!(attempt, "recovery succeeded");

                self.clear();
                self.publish(None);
                self.emit(RecoveryEvent::AttemptSucceeded { attempt });
            }
            Err(ConnectError::Superseded) => {
                #[cfg(feature = "tracing")]
                tracing::debug!(attempt, "recovery cycle superseded");
            }
            Err(ConnectError::CircuitOpen) => self.wait_for_circuit(),
            Err(error) if error.is_terminal() => {
                #[cfg(feature = "tracing")]
                tracing::error!(attempt, %error, "recovery abandoned");

                self.clear();
                self.desired = false;
                self.publish(None);
                self.emit(RecoveryEvent::Abandoned { error });
            }
            Err(error) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(attempt, %error, "recovery attempt failed");

                self.attempts = attempt;
                self.state.update_service_state(
                    ChannelKind::Gateway,
                    ServiceUpdate::new().recovery_attempts(self.attempts),
                );
                self.emit(RecoveryEvent::AttemptFailed { attempt, error });

                if self.config.is_exhausted(self.attempts) {
                    #[cfg(feature = "tracing")]
                    tracing::error!(attempts = self.attempts, "recovery exhausted");

                    self.recovering = false;
                    self.exhausted = true;
                    self.publish(None);
                    self.emit(RecoveryEvent::Exhausted {
                        attempts: self.attempts,
                    });
                } else {
                    self.schedule();
                }
            }
        }
    }

    fn on_circuit(&mut self, state: CircuitState, in_flight: &mut InFlight) {
        if state != CircuitState::Open
            && self.waiting_for_circuit
            && self.recovering
            && in_flight.is_none()
        {
            self.start_attempt(in_flight);
        }
    }

    fn emit(&self, event: RecoveryEvent) {
        _ = self.events_tx.send(event);
    }

    fn publish(&self, next_attempt_in: Option<Duration>) {
        self.state.update_recovery(
            RecoveryUpdate::new()
                .recovering(self.recovering)
                .attempt(self.attempts)
                .exhausted(self.exhausted)
                .online(self.online)
                .next_attempt_in(next_attempt_in),
        );
        self.state.update_service_state(
            ChannelKind::Gateway,
            ServiceUpdate::new().recovery_attempts(self.attempts),
        );
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use super::*;
    use crate::state::ConnectionStatus;
    use crate::ws::config::CircuitBreakerConfig;

    #[derive(Default)]
    struct ScriptedCycle {
        outcomes: Mutex<VecDeque<Result<(), ConnectError>>>,
        started: Mutex<Vec<(u32, Instant)>>,
    }

    impl ScriptedCycle {
        fn new<I: IntoIterator<Item = Result<(), ConnectError>>>(outcomes: I) -> Arc<Self> {
            Arc::new(Self {
                outcomes: Mutex::new(outcomes.into_iter().collect()),
                started: Mutex::default(),
            })
        }

        fn started(&self) -> Vec<(u32, Instant)> {
            self.started.lock().expect("lock").clone()
        }
    }

    #[async_trait]
    impl RecoveryCycle for ScriptedCycle {
        async fn run(&self, ticket: RecoveryTicket, attempt: u32) -> Result<(), ConnectError> {
            ticket.ensure_current()?;
            self.started
                .lock()
                .expect("lock")
                .push((attempt, Instant::now()));
            self.outcomes
                .lock()
                .expect("lock")
                .pop_front()
                .unwrap_or(Ok(()))
        }
    }

    fn transport() -> Result<(), ConnectError> {
        Err(ConnectError::Transport("refused".to_owned()))
    }

    struct Harness {
        recovery: Recovery,
        events: broadcast::Receiver<RecoveryEvent>,
        state: Arc<UnifiedState>,
        breaker: CircuitBreaker,
    }

    fn start(cycle: Arc<ScriptedCycle>, max_attempts: Option<u32>, threshold: u32) -> Harness {
        let mut reconnect = ReconnectConfig::default();
        reconnect.max_jitter = Duration::ZERO;
        reconnect.max_attempts = max_attempts;
        let mut circuit = CircuitBreakerConfig::default();
        circuit.failure_threshold = threshold;

        let state = Arc::new(UnifiedState::default());
        let breaker = CircuitBreaker::with_state(circuit, Arc::clone(&state));
        let recovery = Recovery::spawn(reconnect, breaker.clone(), Arc::clone(&state), cycle);
        let events = recovery.subscribe();
        recovery.begin();

        Harness {
            recovery,
            events,
            state,
            breaker,
        }
    }

    async fn next(events: &mut broadcast::Receiver<RecoveryEvent>) -> RecoveryEvent {
        events.recv().await.expect("event")
    }

    #[tokio::test(start_paused = true)]
    async fn unexpected_disconnect_backs_off_and_recovers() {
        let cycle = ScriptedCycle::new([transport(), transport(), Ok(())]);
        let mut h = start(Arc::clone(&cycle), Some(10), 10);
        let began = Instant::now();

        h.recovery.notify_disconnected();

        assert_eq!(
            next(&mut h.events).await,
            RecoveryEvent::Scheduled {
                attempt: 1,
                delay: Duration::from_secs(1)
            }
        );
        let snapshot = h.state.snapshot();
        assert!(snapshot.recovery.is_recovering);
        assert_eq!(snapshot.overall, ConnectionStatus::Recovering);

        assert_eq!(next(&mut h.events).await, RecoveryEvent::AttemptStarted { attempt: 1 });
        assert!(matches!(next(&mut h.events).await, RecoveryEvent::AttemptFailed { attempt: 1, .. }));
        assert_eq!(
            next(&mut h.events).await,
            RecoveryEvent::Scheduled {
                attempt: 2,
                delay: Duration::from_secs(2)
            }
        );
        assert_eq!(h.state.snapshot().gateway.recovery_attempts, 1);

        assert_eq!(next(&mut h.events).await, RecoveryEvent::AttemptStarted { attempt: 2 });
        assert!(matches!(next(&mut h.events).await, RecoveryEvent::AttemptFailed { attempt: 2, .. }));
        assert_eq!(
            next(&mut h.events).await,
            RecoveryEvent::Scheduled {
                attempt: 3,
                delay: Duration::from_secs(4)
            }
        );
        assert_eq!(next(&mut h.events).await, RecoveryEvent::AttemptStarted { attempt: 3 });
        assert_eq!(next(&mut h.events).await, RecoveryEvent::AttemptSucceeded { attempt: 3 });

        let offsets: Vec<_> = cycle
            .started()
            .into_iter()
            .map(|(_, at)| at.duration_since(began))
            .collect();
        assert_eq!(
            offsets,
            [Duration::from_secs(1), Duration::from_secs(3), Duration::from_secs(7)]
        );

        let snapshot = h.state.snapshot();
        assert!(!snapshot.recovery.is_recovering);
        assert_eq!(snapshot.recovery.attempt, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stops_at_the_attempt_cap_until_manual_reconnect() {
        let cycle = ScriptedCycle::new([transport(), transport()]);
        let mut h = start(Arc::clone(&cycle), Some(2), 10);

        h.recovery.notify_disconnected();
        loop {
            if let RecoveryEvent::Exhausted { attempts } = next(&mut h.events).await {
                assert_eq!(attempts, 2);
                break;
            }
        }
        let snapshot = h.state.snapshot();
        assert!(snapshot.recovery.exhausted);
        assert!(!snapshot.recovery.is_recovering);

        // Neither a new disconnect nor an automatic reconnect restarts recovery.
        h.recovery.notify_disconnected();
        h.recovery.reconnect();
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(cycle.started().len(), 2);

        h.recovery.manual_reconnect();
        assert_eq!(next(&mut h.events).await, RecoveryEvent::AttemptStarted { attempt: 1 });
        assert_eq!(next(&mut h.events).await, RecoveryEvent::AttemptSucceeded { attempt: 1 });
        assert!(!h.state.snapshot().recovery.exhausted);
    }

    #[tokio::test(start_paused = true)]
    async fn manual_reconnect_resets_open_breaker_and_skips_backoff() {
        let cycle = ScriptedCycle::new([]);
        let h = start(Arc::clone(&cycle), Some(10), 2);
        h.breaker.record_failure();
        h.breaker.record_failure();
        assert_eq!(h.breaker.state(), CircuitState::Open);

        let mut events = h.recovery.subscribe();
        let before = Instant::now();
        h.recovery.manual_reconnect();

        assert_eq!(next(&mut events).await, RecoveryEvent::AttemptStarted { attempt: 1 });
        assert_eq!(next(&mut events).await, RecoveryEvent::AttemptSucceeded { attempt: 1 });
        assert_eq!(h.breaker.state(), CircuitState::Closed);
        assert_eq!(cycle.started()[0].1, before);
    }

    #[tokio::test(start_paused = true)]
    async fn open_circuit_defers_to_the_trial_window() {
        let cycle = ScriptedCycle::new([transport(), transport(), Ok(())]);
        let mut h = start(Arc::clone(&cycle), Some(10), 2);

        h.recovery.notify_disconnected();
        loop {
            if next(&mut h.events).await == RecoveryEvent::WaitingForCircuit {
                break;
            }
        }
        let opened = Instant::now();
        assert_eq!(h.state.snapshot().recovery.circuit, CircuitState::Open);

        assert_eq!(next(&mut h.events).await, RecoveryEvent::AttemptStarted { attempt: 3 });
        assert_eq!(opened.elapsed(), Duration::from_secs(60));
        assert_eq!(next(&mut h.events).await, RecoveryEvent::AttemptSucceeded { attempt: 3 });
        assert_eq!(h.breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn offline_suspends_and_online_resumes_immediately() {
        let cycle = ScriptedCycle::new([]);
        let mut h = start(Arc::clone(&cycle), Some(10), 10);

        h.recovery.set_online(false);
        h.recovery.notify_disconnected();
        assert_eq!(next(&mut h.events).await, RecoveryEvent::Suspended);

        tokio::time::sleep(Duration::from_secs(300)).await;
        assert!(cycle.started().is_empty());
        assert!(!h.state.snapshot().recovery.online);

        let resumed = Instant::now();
        h.recovery.set_online(true);
        assert_eq!(next(&mut h.events).await, RecoveryEvent::AttemptStarted { attempt: 1 });
        assert_eq!(next(&mut h.events).await, RecoveryEvent::AttemptSucceeded { attempt: 1 });
        assert_eq!(cycle.started()[0].1, resumed);
    }

    #[tokio::test(start_paused = true)]
    async fn authentication_failure_abandons_without_counting() {
        let cycle = ScriptedCycle::new([Err(ConnectError::Authentication("expired".to_owned()))]);
        let mut h = start(Arc::clone(&cycle), Some(10), 10);

        h.recovery.notify_disconnected();
        loop {
            if let RecoveryEvent::Abandoned { error } = next(&mut h.events).await {
                assert!(error.is_terminal());
                break;
            }
        }

        let snapshot = h.state.snapshot();
        assert!(!snapshot.recovery.is_recovering);
        assert_eq!(snapshot.recovery.attempt, 0);
        assert_eq!(h.breaker.failures(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_cancels_a_scheduled_attempt() {
        let cycle = ScriptedCycle::new([]);
        let mut h = start(Arc::clone(&cycle), Some(10), 10);

        h.recovery.notify_disconnected();
        assert!(matches!(next(&mut h.events).await, RecoveryEvent::Scheduled { .. }));
        h.recovery.stop();

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(cycle.started().is_empty());
        assert!(!h.state.snapshot().recovery.is_recovering);

        // Disconnects are ignored while the connection is not wanted.
        h.recovery.notify_disconnected();
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(cycle.started().is_empty());
    }

    #[test]
    fn stale_ticket_is_superseded() {
        let current = Arc::new(AtomicU64::new(3));
        let ticket = RecoveryTicket {
            epoch: 3,
            current: Arc::clone(&current),
        };
        assert!(ticket.ensure_current().is_ok());

        current.fetch_add(1, Ordering::SeqCst);
        assert_eq!(ticket.ensure_current(), Err(ConnectError::Superseded));
    }
}
