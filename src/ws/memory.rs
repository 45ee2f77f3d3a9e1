//! In-process transport.
//!
//! [`MemoryConnector`] hands every connection it opens to a [`MemoryServer`], whose
//! [`MemoryConnection`]s play the gateway side: they read client frames and push replies,
//! close frames or an abrupt drop. Used by tests and by hosts embedding a simulated gateway.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::{SinkExt as _, StreamExt as _};

use super::error::WsError;
use super::message::{Envelope, MessageType};
use super::transport::{Connector, Duplex, Frame, Handshake};
use crate::Result;
use crate::error::Error;

#[derive(Debug, Default)]
struct Shared {
    connects: AtomicU32,
    refusing: AtomicBool,
}

/// Creates a connected connector/server pair.
#[must_use]
pub fn pair() -> (MemoryConnector, MemoryServer) {
    let (accept_tx, accept_rx) = mpsc::unbounded();
    let shared = Arc::new(Shared::default());

    (
        MemoryConnector {
            accept_tx,
            shared: Arc::clone(&shared),
        },
        MemoryServer { accept_rx, shared },
    )
}

#[derive(Debug, Clone)]
pub struct MemoryConnector {
    accept_tx: mpsc::UnboundedSender<MemoryConnection>,
    shared: Arc<Shared>,
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, handshake: &Handshake) -> Result<Duplex> {
        self.shared.connects.fetch_add(1, Ordering::SeqCst);

        if self.shared.refusing.load(Ordering::SeqCst) {
            return Err(refused("connection refused"));
        }

        let (client_tx, server_rx) = mpsc::unbounded::<Frame>();
        let (server_tx, client_rx) = mpsc::unbounded::<Result<Frame>>();

        let connection = MemoryConnection {
            handshake: handshake.clone(),
            incoming: server_rx,
            outgoing: server_tx,
        };
        self.accept_tx
            .unbounded_send(connection)
            .map_err(|_e| refused("no memory server listening"))?;

        let sink = client_tx.sink_map_err(|e| refused(&e.to_string()));

        Ok(Duplex::new(Box::pin(sink), Box::pin(client_rx)))
    }
}

fn refused(reason: &str) -> Error {
    WsError::Connection(reason.into()).into()
}

/// Gateway side of a [`MemoryConnector`].
#[derive(Debug)]
pub struct MemoryServer {
    accept_rx: mpsc::UnboundedReceiver<MemoryConnection>,
    shared: Arc<Shared>,
}

impl MemoryServer {
    /// Next connection opened by the client, or `None` once every connector is gone.
    pub async fn accept(&mut self) -> Option<MemoryConnection> {
        self.accept_rx.next().await
    }

    /// Number of physical connections attempted so far, refused ones included.
    #[must_use]
    pub fn connect_count(&self) -> u32 {
        self.shared.connects.load(Ordering::SeqCst)
    }

    /// While set, every connect attempt fails with a transport error.
    pub fn set_refusing(&self, refusing: bool) {
        self.shared.refusing.store(refusing, Ordering::SeqCst);
    }
}

/// One accepted connection, seen from the gateway.
///
/// Dropping it without [`Self::close`] simulates a network failure.
#[derive(Debug)]
pub struct MemoryConnection {
    pub handshake: Handshake,
    incoming: mpsc::UnboundedReceiver<Frame>,
    outgoing: mpsc::UnboundedSender<Result<Frame>>,
}

impl MemoryConnection {
    /// Next frame from the client; `None` once the client dropped its sink.
    pub async fn recv(&mut self) -> Option<Frame> {
        self.incoming.next().await
    }

    /// Next text frame decoded as an envelope, skipping close frames and undecodable text.
    pub async fn recv_envelope(&mut self) -> Option<Envelope> {
        while let Some(frame) = self.recv().await {
            if let Frame::Text(text) = frame
                && let Ok(envelope) = Envelope::parse(&text)
            {
                return Some(envelope);
            }
        }
        None
    }

    /// Reads the `authenticate` frame and answers with `connected`.
    pub async fn accept_handshake(&mut self) -> Option<Envelope> {
        let hello = self.recv_envelope().await?;
        if hello.kind != MessageType::Authenticate {
            return None;
        }
        self.send(&Envelope::request(MessageType::Connected, None));
        Some(hello)
    }

    /// Pushes an envelope to the client. Returns `false` if the client side is gone.
    pub fn send(&self, envelope: &Envelope) -> bool {
        match serde_json::to_string(envelope) {
            Ok(text) => self.send_text(text),
            Err(_) => false,
        }
    }

    /// Pushes raw text, e.g. a malformed frame.
    pub fn send_text<S: Into<String>>(&self, text: S) -> bool {
        self.outgoing
            .unbounded_send(Ok(Frame::Text(text.into())))
            .is_ok()
    }

    /// Orderly close with the given code.
    pub fn close<S: Into<String>>(self, code: u16, reason: S) {
        _ = self.outgoing.unbounded_send(Ok(Frame::close(code, reason)));
    }

    /// Fails the client's read side with a transport error.
    pub fn fail<S: Into<String>>(self, reason: S) {
        let reason: String = reason.into();
        _ = self.outgoing.unbounded_send(Err(refused(&reason)));
    }

    /// Whether the client still holds its end of the connection.
    #[must_use]
    pub fn is_open(&self) -> bool {
        !self.outgoing.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::SecretString;
    use crate::error::Kind;

    fn handshake() -> Handshake {
        Handshake::new("sess", "dev", SecretString::from("tok".to_owned()))
    }

    #[tokio::test]
    async fn frames_flow_both_ways() {
        let (connector, mut server) = pair();

        let mut duplex = connector.connect(&handshake()).await.expect("connect");
        let mut connection = server.accept().await.expect("accepted");
        assert_eq!(connection.handshake.session_id, "sess");

        duplex
            .sink
            .send(Frame::Text("ping".to_owned()))
            .await
            .expect("send");
        assert_eq!(
            connection.recv().await,
            Some(Frame::Text("ping".to_owned()))
        );

        assert!(connection.send_text("pong"));
        let frame = duplex.stream.next().await.expect("frame").expect("ok");
        assert_eq!(frame, Frame::Text("pong".to_owned()));

        drop(connection);
        assert!(duplex.stream.next().await.is_none());
    }

    #[tokio::test]
    async fn refusing_server_fails_connects_and_counts_them() {
        let (connector, server) = pair();
        server.set_refusing(true);

        let err = connector.connect(&handshake()).await.unwrap_err();

        assert_eq!(err.kind(), Kind::Transport);
        assert_eq!(server.connect_count(), 1);
    }

    #[tokio::test]
    async fn connect_without_server_fails() {
        let (connector, server) = pair();
        drop(server);

        assert!(connector.connect(&handshake()).await.is_err());
    }
}
