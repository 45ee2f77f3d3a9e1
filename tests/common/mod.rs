#![allow(
    clippy::unwrap_used,
    clippy::missing_panics_doc,
    reason = "Do not need additional syntax for setting up tests, and https://github.com/rust-lang/rust-clippy/issues/13981"
)]
#![allow(
    unused,
    reason = "Deeply nested uses in sub-modules are falsely flagged as being unused"
)]

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;
use tracing_subscriber::EnvFilter;
use trading_gateway_client::api::types::{OrderAck, OrderRequest, SessionInfo, SessionStatus};
use trading_gateway_client::api::{OrderApi, SessionApi};
use trading_gateway_client::auth::StaticTokenProvider;
use trading_gateway_client::error::Error;
use trading_gateway_client::session::MemoryStorage;
use trading_gateway_client::ws::memory::{self, MemoryConnection, MemoryServer};
use trading_gateway_client::ws::message::{Envelope, MessageType};
use trading_gateway_client::ws::transport::Handshake;
use trading_gateway_client::{Client, Config, Event};

pub const SESSION_ID: &str = "sess-1";
pub const TOKEN: &str = "access-token";

/// Session and order backend kept in memory.
#[derive(Debug, Default)]
pub struct FakeApi {
    /// Number of readiness checks answered with `false` before the session reports ready
    pub not_ready_for: AtomicU32,
    pub ready_checks: AtomicU32,
    pub creates: AtomicU32,
    /// While set, existing sessions are reported expired; creating a new one clears it
    pub expired: AtomicBool,
    pub reconnects: Mutex<Vec<(String, u32)>>,
    pub orders: Mutex<Vec<OrderRequest>>,
    pub cancels: Mutex<Vec<(String, String)>>,
}

impl FakeApi {
    #[must_use]
    pub fn never_ready() -> Self {
        let api = Self::default();
        api.not_ready_for.store(u32::MAX, Ordering::SeqCst);
        api
    }

    fn status(&self) -> SessionStatus {
        if self.expired.load(Ordering::SeqCst) {
            SessionStatus::Expired
        } else {
            SessionStatus::Ready
        }
    }
}

#[async_trait]
impl SessionApi for FakeApi {
    async fn create_session(&self) -> Result<SessionInfo, Error> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        self.expired.store(false, Ordering::SeqCst);
        Ok(SessionInfo::builder().session_id(SESSION_ID).build())
    }

    async fn check_session_ready(&self, _session_id: &str) -> Result<bool, Error> {
        let checks = self.ready_checks.fetch_add(1, Ordering::SeqCst);
        Ok(checks >= self.not_ready_for.load(Ordering::SeqCst))
    }

    async fn reconnect_session(&self, session_id: &str, attempt: u32) -> Result<SessionInfo, Error> {
        self.reconnects
            .lock()
            .unwrap()
            .push((session_id.to_owned(), attempt));
        Ok(SessionInfo::builder()
            .session_id(session_id)
            .status(self.status())
            .build())
    }

    async fn session_state(&self, session_id: &str) -> Result<SessionInfo, Error> {
        Ok(SessionInfo::builder()
            .session_id(session_id)
            .status(self.status())
            .build())
    }
}

#[async_trait]
impl OrderApi for FakeApi {
    async fn submit_order(&self, order: &OrderRequest) -> Result<OrderAck, Error> {
        self.orders.lock().unwrap().push(order.clone());
        Ok(serde_json::from_value(json!({
            "orderId": format!("ord-{}", order.request_id),
            "status": "open",
            "requestId": order.request_id,
        }))?)
    }

    async fn cancel_order(&self, session_id: &str, order_id: &str) -> Result<OrderAck, Error> {
        self.cancels
            .lock()
            .unwrap()
            .push((session_id.to_owned(), order_id.to_owned()));
        Ok(serde_json::from_value(json!({
            "orderId": order_id,
            "status": "cancelled",
        }))?)
    }
}

enum Command {
    Push(Envelope),
    Drop,
    Refuse(bool),
}

/// A scripted gateway on the in-process transport.
///
/// Accepts every handshake unless told to reject the next one, echoes heartbeats unless muted and
/// answers every correlated request. `start_simulator` replies with a running simulator `sim-1`.
pub struct Gateway {
    commands: mpsc::UnboundedSender<Command>,
    muted: Arc<AtomicBool>,
    rejection: Arc<Mutex<Option<String>>>,
    handshakes: Arc<Mutex<Vec<Handshake>>>,
    received: Arc<Mutex<Vec<Envelope>>>,
}

impl Gateway {
    #[must_use]
    pub fn spawn(server: MemoryServer) -> Self {
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let gateway = Self {
            commands,
            muted: Arc::new(AtomicBool::new(false)),
            rejection: Arc::default(),
            handshakes: Arc::default(),
            received: Arc::default(),
        };

        tokio::spawn(serve(
            server,
            commands_rx,
            Arc::clone(&gateway.muted),
            Arc::clone(&gateway.rejection),
            Arc::clone(&gateway.handshakes),
            Arc::clone(&gateway.received),
        ));

        gateway
    }

    /// Stops echoing heartbeats.
    pub fn mute(&self, muted: bool) {
        self.muted.store(muted, Ordering::SeqCst);
    }

    /// Answers the next handshake with `authentication_failed`.
    pub fn reject_next_handshake<S: Into<String>>(&self, reason: S) {
        *self.rejection.lock().unwrap() = Some(reason.into());
    }

    pub fn push(&self, envelope: Envelope) {
        _ = self.commands.send(Command::Push(envelope));
    }

    /// Drops the current connection without a close frame.
    pub fn drop_connection(&self) {
        _ = self.commands.send(Command::Drop);
    }

    pub fn refuse(&self, refusing: bool) {
        _ = self.commands.send(Command::Refuse(refusing));
    }

    #[must_use]
    pub fn handshakes(&self) -> Vec<Handshake> {
        self.handshakes.lock().unwrap().clone()
    }

    #[must_use]
    pub fn received(&self, kind: &MessageType) -> Vec<Envelope> {
        self.received
            .lock()
            .unwrap()
            .iter()
            .filter(|envelope| &envelope.kind == kind)
            .cloned()
            .collect()
    }
}

async fn serve(
    mut server: MemoryServer,
    mut commands: mpsc::UnboundedReceiver<Command>,
    muted: Arc<AtomicBool>,
    rejection: Arc<Mutex<Option<String>>>,
    handshakes: Arc<Mutex<Vec<Handshake>>>,
    received: Arc<Mutex<Vec<Envelope>>>,
) {
    let mut current: Option<MemoryConnection> = None;

    loop {
        tokio::select! {
            accepted = server.accept() => {
                let Some(mut connection) = accepted else { break };
                let rejected = rejection.lock().unwrap().take();
                if let Some(reason) = rejected {
                    if connection.recv_envelope().await.is_some() {
                        connection.send(
                            &Envelope::builder()
                                .kind(MessageType::AuthenticationFailed)
                                .error(reason)
                                .build(),
                        );
                    }
                    continue;
                }
                if connection.accept_handshake().await.is_some() {
                    handshakes.lock().unwrap().push(connection.handshake.clone());
                    current = Some(connection);
                }
            }
            command = commands.recv() => match command {
                Some(Command::Push(envelope)) => {
                    if let Some(connection) = &current {
                        connection.send(&envelope);
                    }
                }
                Some(Command::Drop) => current = None,
                Some(Command::Refuse(refusing)) => server.set_refusing(refusing),
                None => break,
            },
            envelope = next_envelope(&mut current) => match envelope {
                Some(envelope) => {
                    received.lock().unwrap().push(envelope.clone());
                    if let Some(connection) = &current {
                        answer(connection, envelope, muted.load(Ordering::SeqCst));
                    }
                }
                None => current = None,
            },
        }
    }
}

async fn next_envelope(current: &mut Option<MemoryConnection>) -> Option<Envelope> {
    match current.as_mut() {
        Some(connection) => connection.recv_envelope().await,
        None => std::future::pending().await,
    }
}

fn answer(connection: &MemoryConnection, envelope: Envelope, muted: bool) {
    match envelope.kind {
        MessageType::Heartbeat => {
            if !muted {
                connection.send(&envelope);
            }
        }
        MessageType::StartSimulator => {
            connection.send(&response(
                &envelope,
                Some(json!({ "simulatorId": "sim-1", "status": "running" })),
            ));
        }
        _ if envelope.request_id.is_some() => {
            connection.send(&response(&envelope, None));
        }
        _ => {}
    }
}

fn response(request: &Envelope, data: Option<serde_json::Value>) -> Envelope {
    let mut reply = Envelope::request(MessageType::Response, data);
    reply.request_id.clone_from(&request.request_id);
    reply
}

/// Client wired to a [`FakeApi`] and a scripted [`Gateway`].
pub struct Harness {
    pub client: Client,
    pub api: Arc<FakeApi>,
    pub tokens: Arc<StaticTokenProvider>,
    pub gateway: Gateway,
}

#[must_use]
pub fn harness(config: Config, api: FakeApi) -> Harness {
    harness_with_storage(config, Arc::new(api), Arc::new(MemoryStorage::default()))
}

/// Like [`harness`], sharing `api` and `storage` with other harnesses to simulate a restart.
#[must_use]
pub fn harness_with_storage(
    config: Config,
    api: Arc<FakeApi>,
    storage: Arc<MemoryStorage>,
) -> Harness {
    init_tracing();
    let (connector, server) = memory::pair();
    let tokens = Arc::new(StaticTokenProvider::new(TOKEN));

    let client = Client::builder()
        .config(config)
        .connector(Arc::new(connector))
        .tokens(Arc::clone(&tokens) as _)
        .session_api(Arc::clone(&api) as _)
        .order_api(Arc::clone(&api) as _)
        .storage(storage as _)
        .build();

    Harness {
        client,
        api,
        tokens,
        gateway: Gateway::spawn(server),
    }
}

/// Logs to the test writer, filtered by `RUST_LOG`. Only the first call installs the subscriber.
pub fn init_tracing() {
    _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Config without jitter so recovery timing is deterministic.
#[must_use]
pub fn config() -> Config {
    let mut config = Config::default();
    config.connection.reconnect.max_jitter = Duration::ZERO;
    config.readiness_interval = Duration::from_millis(100);
    config
}

/// Waits for the first event matching `predicate`, skipping everything else.
pub async fn next_matching<F>(events: &mut broadcast::Receiver<Event>, predicate: F) -> Event
where
    F: Fn(&Event) -> bool,
{
    timeout(Duration::from_secs(300), async {
        loop {
            match events.recv().await {
                Ok(event) if predicate(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}
