//! The gateway duplex channel.
//!
//! A [`Channel`] owns at most one physical connection at a time. It performs the handshake,
//! dispatches inbound envelopes by type, correlates request/response pairs and feeds the
//! [`HeartbeatMonitor`]. It reports every status change of the primary channel to
//! [`UnifiedState`] and never decides on its own to reconnect.
//!
//! Each connect attempt takes a new generation. [`Channel::disconnect`] bumps the generation too,
//! so an attempt or a connection belonging to an older generation can tell it has been superseded
//! and back out without writing any state.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use futures::future::{BoxFuture, Shared};
use futures::{FutureExt as _, SinkExt as _, StreamExt as _};
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::config::Config;
use super::heartbeat::{GenerationReport, HeartbeatHandle, HeartbeatMonitor, HeartbeatReport};
use super::message::{Envelope, MessageType};
use super::pending::PendingRequests;
use super::transport::{
    CLOSE_ABNORMAL, CLOSE_HEARTBEAT_STALL, CLOSE_NORMAL, Connector, FrameSink, FrameStream,
    Frame, Handshake,
};
use crate::Result;
use crate::auth::TokenProvider;
use crate::error::{ConnectError, Error};
use crate::state::{ChannelKind, ConnectionStatus, ServiceUpdate, UnifiedState};
use crate::types::TimestampMillis;

/// Broadcast channel capacity for channel events.
const BROADCAST_CAPACITY: usize = 1024;

type ConnectFuture = Shared<BoxFuture<'static, std::result::Result<(), ConnectError>>>;

/// Something that happened on the channel.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    Connected {
        generation: u64,
    },
    Disconnected {
        code: u16,
        reason: String,
        /// `true` when [`Channel::disconnect`] closed the connection
        local: bool,
    },
    /// An inbound envelope that was neither a heartbeat echo nor a correlated reply
    Message(Envelope),
    /// An inbound frame that could not be understood; the channel stays open
    DataError {
        raw: String,
        error: String,
    },
    Heartbeat {
        timestamp: TimestampMillis,
        latency: Duration,
    },
    /// The gateway rejected the credentials of connection `generation`
    AuthenticationFailed {
        generation: u64,
        reason: String,
    },
    DeviceIdInvalidated {
        generation: u64,
        reason: String,
    },
}

/// Identity used for the handshake.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub session_id: String,
    pub device_id: String,
}

impl Identity {
    #[must_use]
    pub fn new<S: Into<String>, D: Into<String>>(session_id: S, device_id: D) -> Self {
        Self {
            session_id: session_id.into(),
            device_id: device_id.into(),
        }
    }
}

struct Active {
    generation: u64,
    outbound: mpsc::UnboundedSender<Envelope>,
    token: CancellationToken,
}

#[derive(Default)]
struct Link {
    in_flight: Option<(u64, ConnectFuture)>,
    active: Option<Active>,
}

struct ChannelInner {
    connector: Arc<dyn Connector>,
    tokens: Arc<dyn TokenProvider>,
    state: Arc<UnifiedState>,
    config: Config,
    generation: AtomicU64,
    pending: PendingRequests,
    events_tx: broadcast::Sender<ChannelEvent>,
    link: Mutex<Link>,
}

impl Drop for ChannelInner {
    fn drop(&mut self) {
        let link = self.link.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(active) = link.active.take() {
            active.token.cancel();
        }
    }
}

/// Handle to the gateway channel. Clones share the same connection.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("generation", &self.generation())
            .field("open", &self.is_open())
            .finish_non_exhaustive()
    }
}

impl Channel {
    #[must_use]
    pub fn new(
        connector: Arc<dyn Connector>,
        tokens: Arc<dyn TokenProvider>,
        state: Arc<UnifiedState>,
        config: Config,
    ) -> Self {
        let (events_tx, _) = broadcast::channel(BROADCAST_CAPACITY);

        Self {
            inner: Arc::new(ChannelInner {
                connector,
                tokens,
                state,
                config,
                generation: AtomicU64::new(0),
                pending: PendingRequests::default(),
                events_tx,
                link: Mutex::new(Link::default()),
            }),
        }
    }

    /// Subscribe to channel events.
    ///
    /// Each call returns a new independent receiver.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.inner.events_tx.subscribe()
    }

    /// Generation of the most recent connect attempt or disconnect.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.inner.lock().active.is_some()
    }

    /// Number of correlated requests awaiting a reply.
    #[must_use]
    pub fn pending_requests(&self) -> usize {
        self.inner.pending.len()
    }

    /// Opens the channel and waits for the handshake. Never fails loudly: every problem, including
    /// a missing credential or a handshake timeout, yields `false`.
    pub async fn connect(&self, identity: Identity) -> bool {
        self.try_connect(identity).await.is_ok()
    }

    /// Like [`Self::connect`], with the reason for a failure.
    ///
    /// While an attempt is in flight, further calls join it and resolve to its outcome instead of
    /// opening a second connection. Calling this on an open channel succeeds immediately.
    pub async fn try_connect(&self, identity: Identity) -> std::result::Result<(), ConnectError> {
        let attempt = {
            let mut link = self.inner.lock();

            if link.active.is_some() {
                None
            } else if let Some((_, in_flight)) = &link.in_flight {
                Some(in_flight.clone())
            } else {
                let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
                let attempt = Arc::clone(&self.inner)
                    .establish(generation, identity)
                    .boxed()
                    .shared();
                link.in_flight = Some((generation, attempt.clone()));
                Some(attempt)
            }
        };

        match attempt {
            Some(attempt) => attempt.await,
            None => Ok(()),
        }
    }

    /// Queues an envelope. Returns `false`, and sends nothing, while the channel is not open.
    pub fn send(&self, envelope: Envelope) -> bool {
        self.inner.send(envelope)
    }

    /// Sends `envelope` and waits up to `timeout` for the reply carrying its `requestId`.
    ///
    /// A `requestId` is assigned if the envelope has none. The pending entry is removed on every
    /// outcome, so a reply arriving after the timeout is dropped without effect.
    pub async fn send_with_response(
        &self,
        mut envelope: Envelope,
        timeout_after: Duration,
    ) -> Result<Envelope> {
        let request_id = envelope
            .request_id
            .get_or_insert_with(|| Uuid::now_v7().to_string())
            .clone();

        let reply = self.inner.pending.register(&request_id)?;
        let _guard = PendingGuard {
            pending: &self.inner.pending,
            request_id: &request_id,
        };

        if !self.inner.send(envelope) {
            return Err(Error::not_connected());
        }

        match timeout(timeout_after, reply).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(Error::cancelled("channel dropped")),
            Err(_) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(%request_id, ?timeout_after, "request timed out");
                Err(Error::timeout("correlated request", timeout_after))
            }
        }
    }

    /// [`Self::send_with_response`] with the configured request timeout.
    pub async fn request(&self, envelope: Envelope) -> Result<Envelope> {
        self.send_with_response(envelope, self.inner.config.request_timeout)
            .await
    }

    /// Closes the channel. Idempotent; always ends DISCONNECTED.
    ///
    /// Supersedes an in-flight connect attempt and fails every pending request with a
    /// cancellation tagged `reason`.
    pub fn disconnect(&self, reason: &str) {
        self.inner.close(None, reason);
    }

    /// [`Self::disconnect`], unless a newer connect attempt or disconnect has superseded
    /// `generation`. Returns whether the channel was closed.
    pub fn disconnect_generation(&self, generation: u64, reason: &str) -> bool {
        self.inner.close(Some(generation), reason)
    }
}

/// Removes a pending entry when the waiting caller returns or is dropped.
struct PendingGuard<'guard> {
    pending: &'guard PendingRequests,
    request_id: &'guard str,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(self.request_id);
    }
}

impl ChannelInner {
    fn lock(&self) -> MutexGuard<'_, Link> {
        // Link fields are replaced wholesale, never left half-updated.
        self.link.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    fn ensure_current(&self, generation: u64) -> std::result::Result<(), ConnectError> {
        if self.is_current(generation) {
            Ok(())
        } else {
            Err(ConnectError::Superseded)
        }
    }

    fn close(&self, expected: Option<u64>, reason: &str) -> bool {
        let had_link = {
            let mut link = self.lock();
            if let Some(generation) = expected
                && !self.is_current(generation)
            {
                return false;
            }
            self.generation.fetch_add(1, Ordering::SeqCst);

            let in_flight = link.in_flight.take().is_some();
            let active = link.active.take();
            if let Some(active) = &active {
                active.token.cancel();
            }

            self.state.update_service_state(
                ChannelKind::Gateway,
                ServiceUpdate::new().status(ConnectionStatus::Disconnected),
            );

            in_flight || active.is_some()
        };

        let cancelled = self.pending.cancel_all(reason);
        #[cfg(not(feature = "tracing"))]
        let _ = &cancelled;

        if had_link {
            #[cfg(feature = "tracing")]
            tracing::debug!(reason, cancelled, "channel disconnected");

            _ = self.events_tx.send(ChannelEvent::Disconnected {
                code: CLOSE_NORMAL,
                reason: reason.to_owned(),
                local: true,
            });
        }
        true
    }

    fn send(&self, envelope: Envelope) -> bool {
        let link = self.lock();
        link.active
            .as_ref()
            .is_some_and(|active| active.outbound.send(envelope).is_ok())
    }

    async fn establish(
        self: Arc<Self>,
        generation: u64,
        identity: Identity,
    ) -> std::result::Result<(), ConnectError> {
        let result = self.open(generation, &identity).await;

        match result {
            Ok((sink, stream, connected)) => self.activate(generation, &identity, sink, stream, &connected),
            Err(error) => {
                self.connect_failed(generation, &error);
                Err(error)
            }
        }
    }

    /// Opens the transport and completes the handshake within the configured bound.
    async fn open(
        &self,
        generation: u64,
        identity: &Identity,
    ) -> std::result::Result<(FrameSink, FrameStream, Envelope), ConnectError> {
        {
            let _link = self.lock();
            self.ensure_current(generation)?;
            self.state.update_service_state(
                ChannelKind::Gateway,
                ServiceUpdate::new().status(ConnectionStatus::Connecting),
            );
        }

        let token = self
            .tokens
            .access_token()
            .await
            .ok_or(ConnectError::NoCredential)?;
        self.ensure_current(generation)?;

        let handshake = Handshake::new(&identity.session_id, &identity.device_id, token);
        let bound = self.config.handshake_timeout;

        timeout(bound, self.handshake(&handshake))
            .await
            .map_err(|_e| ConnectError::HandshakeTimeout(bound))?
    }

    async fn handshake(
        &self,
        handshake: &Handshake,
    ) -> std::result::Result<(FrameSink, FrameStream, Envelope), ConnectError> {
        let duplex = self
            .connector
            .connect(handshake)
            .await
            .map_err(|e| ConnectError::Transport(e.to_string()))?;
        let (mut sink, mut stream) = (duplex.sink, duplex.stream);

        let hello = Envelope::authenticate(
            &handshake.token,
            &handshake.session_id,
            &handshake.device_id,
        );
        let text = serde_json::to_string(&hello).map_err(|e| ConnectError::Transport(e.to_string()))?;
        sink.send(Frame::Text(text))
            .await
            .map_err(|e| ConnectError::Transport(e.to_string()))?;

        loop {
            let frame = match stream.next().await {
                Some(Ok(frame)) => frame,
                Some(Err(e)) => return Err(ConnectError::Transport(e.to_string())),
                None => {
                    return Err(ConnectError::Transport(
                        "connection lost during handshake".to_owned(),
                    ));
                }
            };

            let text = match frame {
                Frame::Text(text) => text,
                Frame::Close { code, reason } => {
                    return Err(ConnectError::Transport(format!(
                        "closed during handshake ({code}): {reason}"
                    )));
                }
            };

            let envelope = match Envelope::parse(&text) {
                Ok(envelope) => envelope,
                Err(e) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(%text, error = %e, "unparseable frame during handshake");
                    #[cfg(not(feature = "tracing"))]
                    let _ = &e;
                    continue;
                }
            };

            match envelope.kind {
                MessageType::Connected => return Ok((sink, stream, envelope)),
                MessageType::AuthenticationFailed => {
                    return Err(ConnectError::Authentication(
                        envelope.reason_or("authentication failed"),
                    ));
                }
                MessageType::DeviceIdInvalidated => {
                    return Err(ConnectError::DeviceInvalidated(
                        envelope.reason_or("device id invalidated"),
                    ));
                }
                _ => {
                    #[cfg(feature = "tracing")]
                    tracing::debug!(kind = %envelope.kind, "ignoring message before handshake completed");
                }
            }
        }
    }

    /// Installs a freshly handshaken connection, unless it was superseded meanwhile.
    fn activate(
        self: &Arc<Self>,
        generation: u64,
        identity: &Identity,
        sink: FrameSink,
        stream: FrameStream,
        connected: &Envelope,
    ) -> std::result::Result<(), ConnectError> {
        let mut link = self.lock();
        if !self.is_current(generation) {
            // Dropping the halves closes the transport.
            return Err(ConnectError::Superseded);
        }

        let token = CancellationToken::new();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (report_tx, report_rx) = mpsc::unbounded_channel();

        let heartbeat = HeartbeatMonitor::new(
            self.config.heartbeat.clone(),
            identity.device_id.clone(),
            generation,
            outbound_tx.clone(),
            report_tx,
        )
        .spawn();

        tokio::spawn(pump(
            Arc::downgrade(self),
            generation,
            Pump {
                sink,
                stream,
                outbound: outbound_rx,
                reports: report_rx,
                heartbeat,
                token: token.clone(),
            },
        ));

        if link.in_flight.as_ref().is_some_and(|(g, _)| *g == generation) {
            link.in_flight = None;
        }
        link.active = Some(Active {
            generation,
            outbound: outbound_tx,
            token,
        });

        self.state.update_service_state(
            ChannelKind::Gateway,
            ServiceUpdate::new()
                .status(ConnectionStatus::Connected)
                .clear_error(),
        );
        if let Some(status) = connected.simulator_status.clone() {
            self.state.update_simulator_status(status, None);
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(generation, session_id = %identity.session_id, "channel connected");

        _ = self.events_tx.send(ChannelEvent::Connected { generation });
        Ok(())
    }

    fn connect_failed(&self, generation: u64, error: &ConnectError) {
        {
            let mut link = self.lock();
            if !self.is_current(generation) {
                return;
            }
            if link.in_flight.as_ref().is_some_and(|(g, _)| *g == generation) {
                link.in_flight = None;
            }
            self.state.update_service_state(
                ChannelKind::Gateway,
                ServiceUpdate::new()
                    .status(ConnectionStatus::Disconnected)
                    .error(error.to_string()),
            );
        }

        match error {
            ConnectError::Authentication(reason) => {
                #[cfg(feature = "tracing")]
                tracing::error!(%reason, "gateway rejected credentials");
                _ = self.events_tx.send(ChannelEvent::AuthenticationFailed {
                    generation,
                    reason: reason.clone(),
                });
            }
            ConnectError::DeviceInvalidated(reason) => {
                #[cfg(feature = "tracing")]
                tracing::error!(%reason, "gateway invalidated device id");
                _ = self.events_tx.send(ChannelEvent::DeviceIdInvalidated {
                    generation,
                    reason: reason.clone(),
                });
            }
            _ => {
                #[cfg(feature = "tracing")]
                tracing::warn!(generation, %error, "connect attempt failed");
            }
        }
    }

    /// Routes one inbound text frame.
    fn dispatch(&self, generation: u64, heartbeat: &HeartbeatHandle, text: String) {
        #[cfg(feature = "tracing")]
        tracing::trace!(generation, %text, "received gateway frame");

        let envelope = match Envelope::parse(&text) {
            Ok(envelope) => envelope,
            Err(e) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(%text, error = %e, "failed to parse gateway frame");
                _ = self.events_tx.send(ChannelEvent::DataError {
                    raw: text,
                    error: e.to_string(),
                });
                return;
            }
        };

        if let MessageType::Unknown(kind) = &envelope.kind {
            #[cfg(feature = "tracing")]
            tracing::warn!(%kind, "unknown gateway message type");
            let error = format!("unknown message type {kind}");
            _ = self.events_tx.send(ChannelEvent::DataError { raw: text, error });
            return;
        }

        match envelope.kind {
            MessageType::Heartbeat => {
                if let Some(timestamp) = envelope.timestamp {
                    heartbeat.echo(timestamp);
                }
                if let Some(status) = envelope.simulator_status {
                    self.state.update_simulator_status(status, None);
                }
            }
            MessageType::Response => {
                if let Some(_late) = self.pending.resolve(envelope) {
                    #[cfg(feature = "tracing")]
                    tracing::debug!(request_id = ?_late.request_id, "dropping reply without pending request");
                }
            }
            MessageType::AuthenticationFailed => {
                _ = self.events_tx.send(ChannelEvent::AuthenticationFailed {
                    generation,
                    reason: envelope.reason_or("authentication failed"),
                });
            }
            MessageType::DeviceIdInvalidated => {
                _ = self.events_tx.send(ChannelEvent::DeviceIdInvalidated {
                    generation,
                    reason: envelope.reason_or("device id invalidated"),
                });
            }
            _ => {
                if let Some(envelope) = self.pending.resolve(envelope) {
                    _ = self.events_tx.send(ChannelEvent::Message(envelope));
                }
            }
        }
    }

    fn on_beat(&self, generation: u64, timestamp: TimestampMillis, latency: Duration) {
        {
            let link = self.lock();
            if !link.active.as_ref().is_some_and(|a| a.generation == generation) {
                return;
            }
            self.state.update_heartbeat(timestamp, latency);
        }
        _ = self
            .events_tx
            .send(ChannelEvent::Heartbeat { timestamp, latency });
    }

    /// The connection of `generation` ended without [`Channel::disconnect`].
    fn on_closed(&self, generation: u64, code: u16, reason: String) {
        {
            let mut link = self.lock();
            if !link.active.as_ref().is_some_and(|a| a.generation == generation) {
                return;
            }
            link.active = None;
            self.state.update_service_state(
                ChannelKind::Gateway,
                ServiceUpdate::new()
                    .status(ConnectionStatus::Disconnected)
                    .error(format!("connection closed ({code}): {reason}")),
            );
        }

        #[cfg(feature = "tracing")]
        tracing::warn!(generation, code, %reason, "channel closed unexpectedly");

        self.pending.cancel_all(&reason);
        _ = self.events_tx.send(ChannelEvent::Disconnected {
            code,
            reason,
            local: false,
        });
    }
}

struct Pump {
    sink: FrameSink,
    stream: FrameStream,
    outbound: mpsc::UnboundedReceiver<Envelope>,
    reports: mpsc::UnboundedReceiver<GenerationReport>,
    heartbeat: HeartbeatHandle,
    token: CancellationToken,
}

/// Moves frames for one connection generation until it ends.
async fn pump(inner: Weak<ChannelInner>, generation: u64, mut io: Pump) {
    let (code, reason) = loop {
        tokio::select! {
            biased;

            () = io.token.cancelled() => {
                _ = io.sink.send(Frame::close(CLOSE_NORMAL, "client disconnect")).await;
                _ = io.sink.close().await;
                return;
            }
            frame = io.stream.next() => {
                match frame {
                    Some(Ok(Frame::Text(text))) => {
                        let Some(inner) = inner.upgrade() else { return };
                        inner.dispatch(generation, &io.heartbeat, text);
                    }
                    Some(Ok(Frame::Close { code, reason })) => break (code, reason),
                    Some(Err(e)) => break (CLOSE_ABNORMAL, e.to_string()),
                    None => break (CLOSE_ABNORMAL, "connection lost".to_owned()),
                }
            }
            Some(report) = io.reports.recv() => {
                let Some(inner) = inner.upgrade() else { return };
                match report.report {
                    HeartbeatReport::Beat { timestamp, latency } => {
                        inner.on_beat(report.generation, timestamp, latency);
                    }
                    HeartbeatReport::Stalled { missed } => {
                        let reason = format!("heartbeat stalled after {missed} missed echoes");
                        _ = io.sink.send(Frame::close(CLOSE_HEARTBEAT_STALL, reason.clone())).await;
                        break (CLOSE_HEARTBEAT_STALL, reason);
                    }
                }
            }
            Some(envelope) = io.outbound.recv() => {
                let text = match serde_json::to_string(&envelope) {
                    Ok(text) => text,
                    Err(e) => {
                        #[cfg(feature = "tracing")]
                        tracing::error!(error = %e, "unable to serialize outbound envelope");
                        #[cfg(not(feature = "tracing"))]
                        let _ = &e;
                        continue;
                    }
                };
                if let Err(e) = io.sink.send(Frame::Text(text)).await {
                    break (CLOSE_ABNORMAL, e.to_string());
                }
            }
        }
    };

    drop(io);
    if let Some(inner) = inner.upgrade() {
        inner.on_closed(generation, code, reason);
    }
}
