//! The connection facade.
//!
//! [`Client`] composes the session store, the gateway [`Channel`], the [`CircuitBreaker`], the
//! [`Recovery`] driver and the [`UnifiedState`] into one entry point. It keeps last-known-good
//! caches of streamed data and republishes everything as a single closed [`Event`] stream.
//!
//! One client is built per application session; nothing in this crate is global.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use async_stream::try_stream;
use async_trait::async_trait;
use bon::Builder;
use futures::future::{BoxFuture, Shared};
use futures::{FutureExt as _, Stream};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::Result;
use crate::api::types::{OrderAck, OrderRequest, SessionInfo, SessionStatus};
use crate::api::{OrderApi, SessionApi};
use crate::auth::TokenProvider;
use crate::cache::{Cache, CacheView, MarketDataSnapshot, OrderSnapshot};
use crate::circuit_breaker::CircuitBreaker;
use crate::error::{ConnectError, Error};
use crate::event::Event;
use crate::quality::ConnectionQuality;
use crate::recovery::{Recovery, RecoveryCycle, RecoveryEvent, RecoveryTicket};
use crate::session::{DEFAULT_SESSION_TTL, KeyValueStorage, MemoryStorage, SessionRecord, SessionStore};
use crate::state::{
    ChannelKind, ConnectionSnapshot, ConnectionStatus, ServiceUpdate, SimulatorStatus, StateEvent,
    UnifiedState,
};
use crate::ws::channel::{Channel, ChannelEvent, Identity};
use crate::ws::config::Config as ConnectionConfig;
use crate::ws::error::WsError;
use crate::ws::message::{Envelope, MessageType};
use crate::ws::transport::Connector;
use crate::ws::types::{
    MarketDataSubscription, OneOrMany, OrderUpdate, Portfolio, PortfolioUpdate, Quote,
    SimulatorUpdate,
};

/// Broadcast channel capacity for client events.
const EVENT_CAPACITY: usize = 1024;

const DISCONNECT_REASON: &str = "client disconnect";

type ConnectFuture = Shared<BoxFuture<'static, std::result::Result<(), ConnectError>>>;

/// Configuration for [`Client`]
#[non_exhaustive]
#[derive(Clone, Debug, Builder)]
pub struct Config {
    /// Channel, heartbeat, reconnect and circuit breaker settings
    #[builder(default)]
    pub connection: ConnectionConfig,
    /// Inactivity window after which a persisted session is discarded. The default is eight hours.
    #[builder(default = DEFAULT_SESSION_TTL)]
    pub session_ttl: Duration,
    /// How many times the backing session is checked for readiness before giving up
    #[builder(default = 5)]
    pub readiness_attempts: u32,
    #[builder(default = Duration::from_secs(1))]
    pub readiness_interval: Duration,
    /// Whether connect and recovery resubscribe to the last requested market data symbols
    #[builder(default = true)]
    pub resume_market_data: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Cancels the forwarding task when the last [`Client`] clone goes away.
#[derive(Debug, Default)]
struct DroppingCancellationToken(CancellationToken);

impl Drop for DroppingCancellationToken {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

struct ClientInner {
    config: Config,
    tokens: Arc<dyn TokenProvider>,
    session_api: Arc<dyn SessionApi>,
    order_api: Arc<dyn OrderApi>,
    session: SessionStore,
    state: Arc<UnifiedState>,
    channel: Channel,
    breaker: CircuitBreaker,
    recovery: Recovery,
    market_data: Cache<MarketDataSnapshot>,
    orders: Cache<OrderSnapshot>,
    portfolio: Cache<Portfolio>,
    /// Symbols to resubscribe after a reconnect
    symbols: Mutex<BTreeSet<String>>,
    /// Bumped by every disconnect; a connect that started under an older value gives up
    intent: AtomicU64,
    /// In-flight connect, tagged with the intent it was started under
    connecting: Mutex<Option<(u64, ConnectFuture)>>,
    events_tx: broadcast::Sender<Event>,
    forwarder: DroppingCancellationToken,
}

/// Entry point of the connection layer.
///
/// Cheap to clone; clones share one connection.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("overall", &self.inner.state.overall())
            .field("channel", &self.inner.channel)
            .finish_non_exhaustive()
    }
}

#[bon::bon]
impl Client {
    /// Assembles a client from its collaborators.
    ///
    /// Spawns the recovery driver and the event forwarder, so this must be called within a tokio
    /// runtime. Session state is kept in memory unless `storage` is given.
    #[builder]
    pub fn new(
        #[builder(default)] config: Config,
        connector: Arc<dyn Connector>,
        tokens: Arc<dyn TokenProvider>,
        session_api: Arc<dyn SessionApi>,
        order_api: Arc<dyn OrderApi>,
        storage: Option<Arc<dyn KeyValueStorage>>,
    ) -> Self {
        let storage: Arc<dyn KeyValueStorage> = match storage {
            Some(storage) => storage,
            None => Arc::new(MemoryStorage::default()),
        };
        let state = Arc::new(UnifiedState::new(config.connection.quality));
        let channel = Channel::new(
            connector,
            Arc::clone(&tokens),
            Arc::clone(&state),
            config.connection.clone(),
        );
        let breaker = CircuitBreaker::with_state(
            config.connection.circuit_breaker.clone(),
            Arc::clone(&state),
        );
        let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);

        let inner = Arc::new_cyclic(|weak: &Weak<ClientInner>| {
            let cycle: Arc<dyn RecoveryCycle> = Arc::new(Cycle(Weak::clone(weak)));
            let recovery = Recovery::spawn(
                config.connection.reconnect.clone(),
                breaker.clone(),
                Arc::clone(&state),
                cycle,
            );

            ClientInner {
                session: SessionStore::new(storage, config.session_ttl),
                config,
                tokens,
                session_api,
                order_api,
                state,
                channel,
                breaker,
                recovery,
                market_data: Cache::default(),
                orders: Cache::default(),
                portfolio: Cache::default(),
                symbols: Mutex::default(),
                intent: AtomicU64::new(0),
                connecting: Mutex::new(None),
                events_tx,
                forwarder: DroppingCancellationToken::default(),
            }
        });

        tokio::spawn(forward(
            Arc::downgrade(&inner),
            inner.forwarder.0.clone(),
            inner.channel.subscribe(),
            inner.state.subscribe(),
            inner.recovery.subscribe(),
        ));

        Self { inner }
    }
}

impl Client {
    /// Connects to the gateway.
    ///
    /// Obtains a token, resumes or creates the backing session, waits for it to become ready and
    /// performs the channel handshake through the circuit breaker. A persisted session the backend
    /// reports expired is replaced by a new one. Concurrent calls join the
    /// attempt already in flight. Calling this while connected succeeds immediately.
    pub async fn connect(&self) -> std::result::Result<(), ConnectError> {
        if self.inner.channel.is_open() {
            return Ok(());
        }

        let attempt = {
            let mut connecting = lock(&self.inner.connecting);
            match connecting.as_ref() {
                Some((_, attempt)) => attempt.clone(),
                None => {
                    let inner = Arc::clone(&self.inner);
                    let intent = inner.intent.load(Ordering::SeqCst);
                    let attempt = async move {
                        let result = inner.connect(intent).await;
                        // A disconnect may have handed the slot to a newer attempt.
                        let mut slot = lock(&inner.connecting);
                        if slot.as_ref().is_some_and(|(tag, _)| *tag == intent) {
                            *slot = None;
                        }
                        result
                    }
                    .boxed()
                    .shared();
                    *connecting = Some((intent, attempt.clone()));
                    attempt
                }
            }
        };

        attempt.await
    }

    /// Tears everything down and forgets the session. Idempotent.
    ///
    /// Pending requests fail with a cancellation, recovery stops and the state is reset to
    /// DISCONNECTED. Cached data is kept but reported as stale.
    pub fn disconnect(&self) {
        let inner = &self.inner;

        inner.intent.fetch_add(1, Ordering::SeqCst);
        *lock(&inner.connecting) = None;
        inner.recovery.stop();
        inner.channel.disconnect(DISCONNECT_REASON);
        lock(&inner.symbols).clear();

        if let Err(e) = inner.session.clear() {
            #[cfg(feature = "tracing")]
            tracing::warn!(error = %e, "unable to clear session record");
            #[cfg(not(feature = "tracing"))]
            let _ = &e;
        }

        inner.state.reset();
    }

    /// Asks the recovery driver for a reconnect with the regular backoff.
    pub fn reconnect(&self) {
        self.inner.recovery.reconnect();
    }

    /// Reconnects right away: resets the circuit breaker and every attempt counter.
    ///
    /// While the host is offline the attempt fires as soon as it comes back online.
    pub fn manual_reconnect(&self) {
        if let Err(e) = self.inner.session.reset_reconnect_attempts() {
            #[cfg(feature = "tracing")]
            tracing::warn!(error = %e, "unable to reset persisted reconnect attempts");
            #[cfg(not(feature = "tracing"))]
            let _ = &e;
        }
        self.inner.recovery.manual_reconnect();
    }

    /// Feeds the host's network reachability. Offline suspends recovery entirely.
    pub fn set_online(&self, online: bool) {
        self.inner.recovery.set_online(online);
    }

    /// Submits an order over REST. Never retried; resubmit the same request to stay idempotent.
    ///
    /// Fails with [`Kind::RecoveryExhausted`](crate::error::Kind::RecoveryExhausted) once automatic
    /// recovery has given up, and with `NotConnected` otherwise while disconnected.
    pub async fn submit_order(&self, mut order: OrderRequest) -> Result<OrderAck> {
        self.ensure_connected()?;
        if order.session_id.is_none() {
            order.session_id = Some(self.session_id()?);
        }

        let ack = self.inner.order_api.submit_order(&order).await?;

        let update = OrderUpdate::builder()
            .order_id(ack.order_id.clone())
            .status(ack.status.clone())
            .symbol(order.symbol.clone())
            .build();
        self.inner.apply_orders(vec![update]);

        Ok(ack)
    }

    pub async fn cancel_order(&self, order_id: &str) -> Result<OrderAck> {
        self.ensure_connected()?;
        let session_id = self.session_id()?;

        let ack = self
            .inner
            .order_api
            .cancel_order(&session_id, order_id)
            .await?;

        let update = OrderUpdate::builder()
            .order_id(ack.order_id.clone())
            .status(ack.status.clone())
            .build();
        self.inner.apply_orders(vec![update]);

        Ok(ack)
    }

    /// Starts the trading simulator bound to the session.
    pub async fn start_simulator(&self) -> Result<SimulatorUpdate> {
        self.simulator_request(MessageType::StartSimulator, SimulatorStatus::Starting)
            .await
    }

    pub async fn stop_simulator(&self) -> Result<SimulatorUpdate> {
        self.simulator_request(MessageType::StopSimulator, SimulatorStatus::Stopping)
            .await
    }

    /// Subscribes to quotes for `symbols`. The subscription is resumed after every reconnect.
    pub async fn stream_market_data<I, S>(&self, symbols: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ensure_connected()?;

        let subscription = MarketDataSubscription::new(symbols);
        if subscription.symbols.is_empty() {
            return Err(Error::validation("at least one symbol is required"));
        }

        self.inner.subscribe_market_data(&subscription).await?;
        lock(&self.inner.symbols).extend(subscription.symbols);
        Ok(())
    }

    /// Immutable copy of the current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionSnapshot {
        self.inner.state.snapshot()
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.inner.state.overall() == ConnectionStatus::Connected
    }

    #[must_use]
    pub fn quality(&self) -> ConnectionQuality {
        self.inner.state.snapshot().quality()
    }

    #[must_use]
    pub fn market_data(&self) -> CacheView<MarketDataSnapshot> {
        self.inner.market_data.view(!self.is_connected())
    }

    #[must_use]
    pub fn orders(&self) -> CacheView<OrderSnapshot> {
        self.inner.orders.view(!self.is_connected())
    }

    #[must_use]
    pub fn portfolio(&self) -> CacheView<Portfolio> {
        self.inner.portfolio.view(!self.is_connected())
    }

    /// The persisted session record, if any.
    pub fn session(&self) -> Result<Option<SessionRecord>> {
        self.inner.session.current()
    }

    /// Stable device id of this profile.
    pub fn device_id(&self) -> Result<String> {
        self.inner.session.device_id()
    }

    #[must_use]
    pub fn circuit_breaker(&self) -> &CircuitBreaker {
        &self.inner.breaker
    }

    /// Subscribe to client events.
    ///
    /// Each call returns a new independent receiver.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.inner.events_tx.subscribe()
    }

    /// Client events as a stream.
    ///
    /// The stream yields a [`WsError::Lagged`] error and ends if the consumer falls more than the
    /// channel capacity behind.
    pub fn events(&self) -> impl Stream<Item = Result<Event>> + use<> {
        let mut rx = self.subscribe();

        try_stream! {
            loop {
                match rx.recv().await {
                    Ok(event) => yield event,
                    Err(RecvError::Lagged(n)) => {
                        #[cfg(feature = "tracing")]
                        tracing::warn!("client event subscription lagged, missed {n} messages");
                        Err(WsError::Lagged { count: n })?;
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }
    }

    fn ensure_connected(&self) -> Result<()> {
        let state = self.inner.state.snapshot();
        if state.overall == ConnectionStatus::Connected {
            Ok(())
        } else if state.recovery.exhausted {
            Err(Error::recovery_exhausted(state.recovery.attempt))
        } else {
            Err(Error::not_connected())
        }
    }

    fn session_id(&self) -> Result<String> {
        self.inner
            .session
            .current()?
            .map(|record| record.session_id)
            .ok_or_else(Error::not_connected)
    }

    async fn simulator_request(
        &self,
        kind: MessageType,
        pending: SimulatorStatus,
    ) -> Result<SimulatorUpdate> {
        self.ensure_connected()?;

        let reply = self
            .inner
            .channel
            .request(Envelope::request(kind, None))
            .await?;

        let update = if reply.data.is_some() {
            reply.decode_data::<SimulatorUpdate>()?
        } else {
            SimulatorUpdate {
                simulator_id: None,
                status: reply.simulator_status.unwrap_or(pending),
            }
        };
        self.inner.apply_simulator(&update);

        Ok(update)
    }
}

impl ClientInner {
    async fn connect(self: &Arc<Self>, intent: u64) -> std::result::Result<(), ConnectError> {
        let ensure_current = || {
            if self.intent.load(Ordering::SeqCst) == intent {
                Ok(())
            } else {
                Err(ConnectError::Superseded)
            }
        };

        if self.tokens.access_token().await.is_none() {
            #[cfg(feature = "tracing")]
            tracing::warn!("connect requested without an access token");
            return Err(ConnectError::NoCredential);
        }
        ensure_current()?;

        let result = self
            .breaker
            .call(async {
                let resumed = match self.session.current().map_err(session_error)? {
                    Some(record) => match self.session_api.session_state(&record.session_id).await {
                        Ok(info) => {
                            ensure_current()?;
                            if self.discard_if_expired(&info)? {
                                None
                            } else {
                                Some(record)
                            }
                        }
                        Err(e) => {
                            #[cfg(feature = "tracing")]
                            tracing::warn!(session_id = %record.session_id, error = %e, "unable to query session state");
                            #[cfg(not(feature = "tracing"))]
                            let _ = &e;
                            Some(record)
                        }
                    },
                    None => None,
                };
                let record = match resumed {
                    Some(record) => record,
                    None => {
                        let created = self
                            .session_api
                            .create_session()
                            .await
                            .map_err(session_error)?;
                        ensure_current()?;
                        self.session
                            .begin(&created.session_id)
                            .map_err(session_error)?
                    }
                };

                self.await_ready(&record.session_id).await?;
                ensure_current()?;

                self.channel
                    .try_connect(Identity::new(&record.session_id, &record.device_id))
                    .await
            })
            .await;

        if let Err(error) = result {
            #[cfg(feature = "tracing")]
            tracing::warn!(%error, "connect failed");
            return Err(error);
        }
        ensure_current()?;

        self.recovery.begin();
        self.mark_active();

        if let Err(e) = self.resume_market_data().await {
            #[cfg(feature = "tracing")]
            tracing::warn!(error = %e, "unable to resume market data after connect");
            #[cfg(not(feature = "tracing"))]
            let _ = &e;
        }

        Ok(())
    }

    /// One recovery cycle: session, handshake, data stream. Every step re-checks the ticket.
    ///
    /// A session the backend reports expired is replaced by a new one within the same cycle.
    async fn recover(
        &self,
        ticket: &RecoveryTicket,
        attempt: u32,
    ) -> std::result::Result<(), ConnectError> {
        ticket.ensure_current()?;

        let resumed = match self.session.current().map_err(session_error)? {
            Some(record) => {
                let info = self
                    .session_api
                    .reconnect_session(&record.session_id, attempt)
                    .await
                    .map_err(session_error)?;
                ticket.ensure_current()?;
                if self.discard_if_expired(&info)? {
                    None
                } else {
                    self.session
                        .increment_reconnect_attempts()
                        .map_err(session_error)?;
                    Some(record)
                }
            }
            None => None,
        };

        let record = match resumed {
            Some(record) => record,
            None => {
                let created = self
                    .session_api
                    .create_session()
                    .await
                    .map_err(session_error)?;
                ticket.ensure_current()?;
                self.session
                    .begin(&created.session_id)
                    .map_err(session_error)?
            }
        };

        self.await_ready(&record.session_id).await?;
        ticket.ensure_current()?;

        self.channel
            .try_connect(Identity::new(&record.session_id, &record.device_id))
            .await?;
        ticket.ensure_current()?;

        self.resume_market_data().await?;
        ticket.ensure_current()?;

        self.mark_active();
        Ok(())
    }

    /// Forgets the local record of a session the backend reports expired. Returns whether it did.
    fn discard_if_expired(&self, info: &SessionInfo) -> std::result::Result<bool, ConnectError> {
        if info.status != SessionStatus::Expired {
            return Ok(false);
        }

        #[cfg(feature = "tracing")]
        tracing::warn!(session_id = %info.session_id, "backing session expired, starting a new one");
        self.session.clear().map_err(session_error)?;
        Ok(true)
    }

    /// Polls session readiness a bounded number of times.
    async fn await_ready(&self, session_id: &str) -> std::result::Result<(), ConnectError> {
        let attempts = self.config.readiness_attempts.max(1);

        for check in 1..=attempts {
            match self.session_api.check_session_ready(session_id).await {
                Ok(true) => return Ok(()),
                Ok(false) => {
                    #[cfg(feature = "tracing")]
                    tracing::debug!(session_id, check, "session not ready yet");
                }
                Err(e) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(session_id, check, error = %e, "session readiness check failed");
                    #[cfg(not(feature = "tracing"))]
                    let _ = &e;
                }
            }

            if check < attempts {
                sleep(self.config.readiness_interval).await;
            }
        }

        Err(ConnectError::SessionNotReady { attempts })
    }

    async fn resume_market_data(&self) -> std::result::Result<(), ConnectError> {
        if !self.config.resume_market_data {
            return Ok(());
        }
        let symbols: Vec<String> = lock(&self.symbols).iter().cloned().collect();
        if symbols.is_empty() {
            return Ok(());
        }

        self.subscribe_market_data(&MarketDataSubscription::new(symbols))
            .await
            .map_err(|e| ConnectError::Transport(format!("market data resume failed: {e}")))
    }

    async fn subscribe_market_data(&self, subscription: &MarketDataSubscription) -> Result<()> {
        self.state.update_service_state(
            ChannelKind::MarketData,
            ServiceUpdate::new().status(ConnectionStatus::Connecting),
        );

        let data = serde_json::to_value(subscription)?;
        let result = self
            .channel
            .request(Envelope::request(MessageType::SubscribeMarketData, Some(data)))
            .await;

        let update = match &result {
            Ok(_) => ServiceUpdate::new()
                .status(ConnectionStatus::Connected)
                .clear_error(),
            Err(e) => ServiceUpdate::new()
                .status(ConnectionStatus::Disconnected)
                .error(e.to_string()),
        };
        self.state
            .update_service_state(ChannelKind::MarketData, update);

        result.map(|_| ())
    }

    fn mark_active(&self) {
        let result = self
            .session
            .record_activity()
            .and_then(|_| self.session.reset_reconnect_attempts());

        if let Err(e) = result {
            #[cfg(feature = "tracing")]
            tracing::warn!(error = %e, "unable to record session activity");
            #[cfg(not(feature = "tracing"))]
            let _ = &e;
        }
    }

    fn emit(&self, event: Event) {
        _ = self.events_tx.send(event);
    }

    fn apply_orders(&self, updates: Vec<OrderUpdate>) {
        let snapshot = self.orders.replace_with(|current| {
            let mut next = current.clone();
            for mut update in updates {
                // acks carry no symbol
                if update.symbol.is_none()
                    && let Some(previous) = next.get(&update.order_id)
                {
                    update.symbol.clone_from(&previous.symbol);
                }
                next.insert(update.order_id.clone(), update);
            }
            next
        });
        self.emit(Event::Orders(snapshot));
    }

    fn apply_quotes(&self, quotes: Vec<Quote>) {
        let snapshot = self.market_data.replace_with(|current| {
            let mut next = current.clone();
            for quote in quotes {
                next.insert(quote.symbol.clone(), quote);
            }
            next
        });
        self.emit(Event::MarketData(snapshot));
    }

    fn apply_portfolio(&self, update: PortfolioUpdate) {
        let snapshot = self.portfolio.replace_with(|current| current.apply(update));
        self.emit(Event::Portfolio(snapshot));
    }

    fn apply_simulator(&self, update: &SimulatorUpdate) {
        self.state
            .update_simulator_status(update.status.clone(), update.simulator_id.clone());

        if let Err(e) = self
            .session
            .update_simulator(update.simulator_id.clone(), update.status.clone())
        {
            #[cfg(feature = "tracing")]
            tracing::warn!(error = %e, "unable to persist simulator status");
            #[cfg(not(feature = "tracing"))]
            let _ = &e;
        }

        self.emit(Event::SimulatorUpdate(update.clone()));
    }

    fn on_channel_event(&self, event: ChannelEvent) {
        match event {
            ChannelEvent::Connected { .. } => self.emit(Event::Connected),
            ChannelEvent::Disconnected {
                code,
                reason,
                local,
            } => {
                self.state.update_service_state(
                    ChannelKind::MarketData,
                    ServiceUpdate::new().status(ConnectionStatus::Disconnected),
                );
                self.emit(Event::Disconnected { code, reason });
                if !local {
                    self.recovery.notify_disconnected();
                }
            }
            ChannelEvent::Message(envelope) => self.on_message(envelope),
            ChannelEvent::DataError { error, .. } => self.emit(Event::Error { message: error }),
            ChannelEvent::Heartbeat { timestamp, latency } => {
                self.emit(Event::Heartbeat { timestamp, latency });
            }
            ChannelEvent::AuthenticationFailed { generation, reason } => {
                #[cfg(feature = "tracing")]
                tracing::error!(%reason, "authentication failed; re-authentication required");

                self.stop_generation(generation, "authentication failed");
                self.emit(Event::AuthenticationFailed { reason });
            }
            ChannelEvent::DeviceIdInvalidated { generation, reason } => {
                self.on_device_invalidated(generation, reason);
            }
        }
    }

    fn on_message(&self, envelope: Envelope) {
        let result = match envelope.kind {
            MessageType::MarketData => envelope
                .decode_data::<OneOrMany<Quote>>()
                .map(|quotes| self.apply_quotes(quotes.into_vec())),
            MessageType::OrderUpdate => envelope
                .decode_data::<OneOrMany<OrderUpdate>>()
                .map(|updates| self.apply_orders(updates.into_vec())),
            MessageType::PortfolioUpdate => envelope
                .decode_data::<PortfolioUpdate>()
                .map(|update| self.apply_portfolio(update)),
            MessageType::SimulatorUpdate => envelope
                .decode_data::<SimulatorUpdate>()
                .map(|update| self.apply_simulator(&update)),
            MessageType::Error => {
                self.emit(Event::Error {
                    message: envelope.reason_or("gateway error"),
                });
                Ok(())
            }
            _ => {
                #[cfg(feature = "tracing")]
                tracing::debug!(kind = %envelope.kind, "ignoring gateway message");
                Ok(())
            }
        };

        if let Err(e) = result {
            #[cfg(feature = "tracing")]
            tracing::warn!(error = %e, "unable to apply gateway message");
            self.emit(Event::Error {
                message: e.to_string(),
            });
        }
    }

    fn on_device_invalidated(&self, generation: u64, reason: String) {
        #[cfg(feature = "tracing")]
        tracing::error!(%reason, "device id invalidated; re-authentication required");

        self.stop_generation(generation, "device id invalidated");

        if let Err(e) = self.session.regenerate_device_id() {
            #[cfg(feature = "tracing")]
            tracing::error!(error = %e, "unable to regenerate device id");
            #[cfg(not(feature = "tracing"))]
            let _ = &e;
        }

        self.emit(Event::DeviceIdInvalidated { reason });
    }

    /// Closes the channel and stops recovery after a credential failure on `generation`.
    ///
    /// Does nothing once the host has started a newer attempt, which must not be torn down by a
    /// failure it did not cause.
    fn stop_generation(&self, generation: u64, reason: &str) {
        if self.channel.disconnect_generation(generation, reason) {
            self.recovery.stop();
        } else {
            #[cfg(feature = "tracing")]
            tracing::debug!(generation, "credential failure belongs to a superseded attempt");
        }
    }

    fn on_recovery_event(&self, event: RecoveryEvent) {
        if let RecoveryEvent::Scheduled { attempt, delay } = event {
            self.emit(Event::Reconnecting { attempt, delay });
        }
        self.emit(Event::Recovery(event));
    }
}

fn session_error(e: Error) -> ConnectError {
    ConnectError::Session(e.to_string())
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // Every guarded value here is replaced or extended in one step.
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Routes channel, state and recovery notifications to the client until it is dropped.
async fn forward(
    inner: Weak<ClientInner>,
    token: CancellationToken,
    mut channel: broadcast::Receiver<ChannelEvent>,
    mut state: broadcast::Receiver<StateEvent>,
    mut recovery: broadcast::Receiver<RecoveryEvent>,
) {
    loop {
        tokio::select! {
            () = token.cancelled() => break,
            event = channel.recv() => {
                let Some(inner) = inner.upgrade() else { break };
                match event {
                    Ok(event) => inner.on_channel_event(event),
                    Err(RecvError::Lagged(n)) => {
                        #[cfg(feature = "tracing")]
                        tracing::warn!("channel events lagged, missed {n} messages");
                        #[cfg(not(feature = "tracing"))]
                        let _ = n;
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            event = state.recv() => {
                let Some(inner) = inner.upgrade() else { break };
                match event {
                    Ok(StateEvent::Snapshot(snapshot)) => inner.emit(Event::StateChange(snapshot)),
                    Ok(_) => {}
                    Err(RecvError::Lagged(n)) => {
                        #[cfg(feature = "tracing")]
                        tracing::warn!("state events lagged, missed {n} messages");
                        #[cfg(not(feature = "tracing"))]
                        let _ = n;
                        inner.emit(Event::StateChange(Arc::new(inner.state.snapshot())));
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            event = recovery.recv() => {
                let Some(inner) = inner.upgrade() else { break };
                match event {
                    Ok(event) => inner.on_recovery_event(event),
                    Err(RecvError::Lagged(n)) => {
                        #[cfg(feature = "tracing")]
                        tracing::warn!("recovery events lagged, missed {n} messages");
                        #[cfg(not(feature = "tracing"))]
                        let _ = n;
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }
    }
}

/// Runs recovery cycles against a client that may already be gone.
struct Cycle(Weak<ClientInner>);

#[async_trait]
impl RecoveryCycle for Cycle {
    async fn run(&self, ticket: RecoveryTicket, attempt: u32) -> std::result::Result<(), ConnectError> {
        let inner = self.0.upgrade().ok_or(ConnectError::Superseded)?;
        inner.recover(&ticket, attempt).await
    }
}
