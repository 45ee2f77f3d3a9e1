#![cfg(feature = "ws")]
#![allow(
    clippy::unwrap_used,
    clippy::missing_panics_doc,
    reason = "Do not need additional syntax for setting up tests"
)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt as _, StreamExt as _};
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use trading_gateway_client::auth::StaticTokenProvider;
use trading_gateway_client::state::{ConnectionStatus, UnifiedState};
use trading_gateway_client::ws::config::Config;
use trading_gateway_client::ws::message::{Envelope, MessageType};
use trading_gateway_client::ws::tungstenite::WebSocketConnector;
use trading_gateway_client::ws::{Channel, ChannelEvent, Identity};

type Socket = WebSocketStream<TcpStream>;

/// Accepts WebSocket connections on a random port and hands each one to the test.
struct MockGateway {
    addr: SocketAddr,
    accepted: mpsc::UnboundedReceiver<Socket>,
}

impl MockGateway {
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, accepted) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let Ok(socket) = tokio_tungstenite::accept_async(stream).await else {
                    continue;
                };
                if tx.send(socket).is_err() {
                    break;
                }
            }
        });

        Self { addr, accepted }
    }

    fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    async fn accept(&mut self) -> Socket {
        timeout(Duration::from_secs(5), self.accepted.recv())
            .await
            .unwrap()
            .unwrap()
    }
}

async fn recv_json(socket: &mut Socket) -> Value {
    loop {
        let message = timeout(Duration::from_secs(5), socket.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        if let Message::Text(text) = message {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

async fn send_json(socket: &mut Socket, value: &Value) {
    socket
        .send(Message::Text(value.to_string().into()))
        .await
        .unwrap();
}

fn channel(gateway: &MockGateway) -> (Channel, Arc<UnifiedState>) {
    let connector = WebSocketConnector::new(&gateway.ws_url()).unwrap();
    let state = Arc::new(UnifiedState::default());
    let channel = Channel::new(
        Arc::new(connector),
        Arc::new(StaticTokenProvider::new("token-1")),
        Arc::clone(&state),
        Config::default(),
    );
    (channel, state)
}

/// Connects `channel` while playing the gateway side of the handshake.
async fn handshake(gateway: &mut MockGateway, channel: &Channel) -> (Socket, Value) {
    let connecting = channel.try_connect(Identity::new("sess-1", "dev-1"));
    let serve = async {
        let mut socket = gateway.accept().await;
        let hello = recv_json(&mut socket).await;
        send_json(&mut socket, &json!({ "type": "connected" })).await;
        (socket, hello)
    };

    let (connected, served) = tokio::join!(connecting, serve);
    connected.unwrap();
    served
}

#[tokio::test]
async fn handshake_carries_identity_in_first_frame() {
    let mut gateway = MockGateway::start().await;
    let (channel, state) = channel(&gateway);

    let (_socket, hello) = handshake(&mut gateway, &channel).await;

    assert_eq!(hello["type"], "authenticate");
    assert_eq!(hello["data"]["token"], "token-1");
    assert_eq!(hello["data"]["sessionId"], "sess-1");
    assert_eq!(hello["data"]["deviceId"], "dev-1");
    assert!(channel.is_open());
    assert_eq!(state.snapshot().gateway.status, ConnectionStatus::Connected);
}

#[tokio::test]
async fn correlated_request_round_trip() {
    let mut gateway = MockGateway::start().await;
    let (channel, _state) = channel(&gateway);
    let (mut socket, _) = handshake(&mut gateway, &channel).await;

    let request = channel.request(Envelope::request(MessageType::StartSimulator, None));
    let serve = async {
        let request = recv_json(&mut socket).await;
        assert_eq!(request["type"], "start_simulator");
        send_json(
            &mut socket,
            &json!({
                "type": "response",
                "requestId": request["requestId"],
                "data": { "simulatorId": "sim-1", "status": "running" }
            }),
        )
        .await;
    };

    let (reply, ()) = tokio::join!(request, serve);
    let reply = reply.unwrap();

    assert_eq!(reply.kind, MessageType::Response);
    assert_eq!(reply.data.unwrap()["simulatorId"], "sim-1");
    assert_eq!(channel.pending_requests(), 0);
}

#[tokio::test]
async fn server_close_is_reported_with_code() {
    let mut gateway = MockGateway::start().await;
    let (channel, state) = channel(&gateway);
    let mut events = channel.subscribe();
    let (mut socket, _) = handshake(&mut gateway, &channel).await;

    socket
        .close(Some(CloseFrame {
            code: 4001.into(),
            reason: "maintenance".into(),
        }))
        .await
        .unwrap();

    let disconnected = timeout(Duration::from_secs(5), async {
        loop {
            if let ChannelEvent::Disconnected {
                code,
                reason,
                local,
            } = events.recv().await.unwrap()
            {
                return (code, reason, local);
            }
        }
    })
    .await
    .unwrap();

    assert_eq!(disconnected, (4001, "maintenance".to_owned(), false));
    assert!(!channel.is_open());
    assert_eq!(state.snapshot().gateway.status, ConnectionStatus::Disconnected);
}

#[tokio::test]
async fn rejected_credentials_fail_the_connect() {
    let mut gateway = MockGateway::start().await;
    let (channel, _state) = channel(&gateway);

    let connecting = channel.try_connect(Identity::new("sess-1", "dev-1"));
    let serve = async {
        let mut socket = gateway.accept().await;
        recv_json(&mut socket).await;
        send_json(
            &mut socket,
            &json!({ "type": "authentication_failed", "error": "token expired" }),
        )
        .await;
        socket
    };

    let (result, _socket) = tokio::join!(connecting, serve);

    let err = result.unwrap_err();
    assert!(err.to_string().contains("token expired"));
    assert!(!channel.is_open());
}
