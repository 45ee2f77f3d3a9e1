//! The seam between the channel protocol and the physical duplex connection.
//!
//! A [`Connector`] opens one message-oriented duplex per call. Everything above it (handshake,
//! heartbeat, correlation) is transport-agnostic.

use std::fmt;
use std::pin::Pin;

use async_trait::async_trait;
use futures::{Sink, Stream};

use crate::Result;
use crate::auth::SecretString;
use crate::error::Error;

/// Local, orderly shutdown.
pub const CLOSE_NORMAL: u16 = 1000;
/// The connection dropped without a close frame.
pub const CLOSE_ABNORMAL: u16 = 1006;
/// The client gave up on the peer after consecutive missed heartbeats.
pub const CLOSE_HEARTBEAT_STALL: u16 = 4000;

/// One message on the duplex.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Close { code: u16, reason: String },
}

impl Frame {
    #[must_use]
    pub fn close<S: Into<String>>(code: u16, reason: S) -> Self {
        Self::Close {
            code,
            reason: reason.into(),
        }
    }
}

/// Identity presented when opening a connection.
#[non_exhaustive]
#[derive(Clone)]
pub struct Handshake {
    pub session_id: String,
    pub device_id: String,
    pub token: SecretString,
}

impl Handshake {
    #[must_use]
    pub fn new<S: Into<String>, D: Into<String>>(
        session_id: S,
        device_id: D,
        token: SecretString,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            device_id: device_id.into(),
            token,
        }
    }
}

impl fmt::Debug for Handshake {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handshake")
            .field("session_id", &self.session_id)
            .field("device_id", &self.device_id)
            .field("token", &"[REDACTED]")
            .finish()
    }
}

pub type FrameSink = Pin<Box<dyn Sink<Frame, Error = Error> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Frame>> + Send>>;

/// An open connection split into its two halves.
///
/// The stream ending without a [`Frame::Close`] is an abnormal close.
pub struct Duplex {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

impl Duplex {
    #[must_use]
    pub fn new(sink: FrameSink, stream: FrameStream) -> Self {
        Self { sink, stream }
    }
}

impl fmt::Debug for Duplex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Duplex").finish_non_exhaustive()
    }
}

/// Opens physical connections to the gateway.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, handshake: &Handshake) -> Result<Duplex>;
}
