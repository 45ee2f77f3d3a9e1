//! WebSocket transport built on `tokio-tungstenite`.
//!
//! **Feature flag:** `ws`

use async_trait::async_trait;
use futures::future;
use futures::{SinkExt as _, StreamExt as _};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use url::Url;

use super::transport::{Connector, Duplex, Frame, Handshake};
use crate::Result;
use crate::error::Error;

/// Close code reported when the peer closed without a status.
const CLOSE_NO_STATUS: u16 = 1005;

/// Opens one WebSocket per connect attempt.
///
/// The handshake identity travels in the first `authenticate` frame, never in the URL.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    endpoint: Url,
}

impl WebSocketConnector {
    /// # Errors
    ///
    /// Returns an error if `endpoint` is not a valid `ws://` or `wss://` URL.
    pub fn new(endpoint: &str) -> Result<Self> {
        let endpoint = Url::parse(endpoint)?;
        if !matches!(endpoint.scheme(), "ws" | "wss") {
            return Err(Error::validation(format!(
                "expected a ws:// or wss:// endpoint, got {endpoint}"
            )));
        }

        Ok(Self { endpoint })
    }

    #[must_use]
    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, handshake: &Handshake) -> Result<Duplex> {
        #[cfg(feature = "tracing")]
        tracing::debug!(endpoint = %self.endpoint, session_id = %handshake.session_id, "opening websocket");
        #[cfg(not(feature = "tracing"))]
        let _ = handshake;

        let (socket, _response) = connect_async(self.endpoint.as_str()).await?;
        let (write, read) = socket.split();

        let sink = write
            .sink_map_err(Error::from)
            .with(|frame: Frame| future::ready(Ok::<_, Error>(into_message(frame))));
        let stream = read.filter_map(|message| future::ready(from_message(message)));

        Ok(Duplex::new(Box::pin(sink), Box::pin(stream)))
    }
}

fn into_message(frame: Frame) -> Message {
    match frame {
        Frame::Text(text) => Message::Text(text.into()),
        Frame::Close { code, reason } => Message::Close(Some(CloseFrame {
            code: CloseCode::from(code),
            reason: reason.into(),
        })),
    }
}

/// Control frames are answered by tungstenite itself and never surface.
fn from_message(
    message: std::result::Result<Message, tokio_tungstenite::tungstenite::Error>,
) -> Option<Result<Frame>> {
    match message {
        Ok(Message::Text(text)) => Some(Ok(Frame::Text(text.as_str().to_owned()))),
        Ok(Message::Binary(bytes)) => match String::from_utf8(bytes.to_vec()) {
            Ok(text) => Some(Ok(Frame::Text(text))),
            Err(e) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(error = %e, "dropping non-UTF-8 binary frame");
                #[cfg(not(feature = "tracing"))]
                let _ = &e;
                None
            }
        },
        Ok(Message::Close(Some(close))) => Some(Ok(Frame::close(
            u16::from(close.code),
            close.reason.as_str(),
        ))),
        Ok(Message::Close(None)) => Some(Ok(Frame::close(CLOSE_NO_STATUS, ""))),
        Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => None,
        Err(e) => Some(Err(e.into())),
    }
}
